//! Load-shedding thresholds and the allowlist of peers exempt from shedding.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::config::ConfigError;

/// A CIDR network such as `10.0.0.0/8` or `2001:db8::/32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkAddress {
    addr: IpAddr,
    prefix: u8,
}

impl NetworkAddress {
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, ConfigError> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(ConfigError::InvalidAllowlistEntry(format!(
                "prefix /{prefix} is too long for {addr}"
            )));
        }
        Ok(Self {
            addr: addr.to_canonical(),
            prefix,
        })
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Addresses of the other family never match.
    pub fn contains(&self, candidate: IpAddr) -> bool {
        match (self.addr, candidate.to_canonical()) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.prefix))
                    .unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// One allowlist entry: a single address or a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum AllowlistEntry {
    Address(IpAddr),
    Network(NetworkAddress),
}

impl AllowlistEntry {
    pub fn matches(&self, candidate: IpAddr) -> bool {
        match self {
            AllowlistEntry::Address(addr) => *addr == candidate.to_canonical(),
            AllowlistEntry::Network(network) => network.contains(candidate),
        }
    }
}

impl FromStr for AllowlistEntry {
    type Err = ConfigError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidAllowlistEntry(input.to_owned());
        match input.trim().split_once('/') {
            None => {
                let addr: IpAddr = input.trim().parse().map_err(|_| invalid())?;
                Ok(AllowlistEntry::Address(addr.to_canonical()))
            }
            Some((addr, prefix)) => {
                let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
                let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
                Ok(AllowlistEntry::Network(NetworkAddress::new(addr, prefix)?))
            }
        }
    }
}

impl TryFrom<String> for AllowlistEntry {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for AllowlistEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllowlistEntry::Address(addr) => write!(f, "{addr}"),
            AllowlistEntry::Network(network) => write!(f, "{network}"),
        }
    }
}

/// Facts about the host the limits are checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SysParams {
    pub num_logical_cpu_cores: u64,
    /// Zero when unknown; memory limits are then not checked against it.
    pub total_mem_bytes: u64,
}

impl SysParams {
    pub fn detect() -> Self {
        let num_logical_cpu_cores = std::thread::available_parallelism()
            .map(|cores| cores.get() as u64)
            .unwrap_or(1);
        Self {
            num_logical_cpu_cores,
            total_mem_bytes: total_memory().unwrap_or(0),
        }
    }
}

#[cfg(target_os = "linux")]
fn total_memory() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    meminfo.lines().find_map(|line| {
        let kib = line.strip_prefix("MemTotal:")?.trim().strip_suffix("kB")?;
        kib.trim().parse::<u64>().ok().map(|kib| kib * 1024)
    })
}

#[cfg(not(target_os = "linux"))]
fn total_memory() -> Option<u64> {
    None
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoadShedConfig {
    pub enabled: bool,
    pub allowlist: Vec<AllowlistEntry>,
    pub max_connections: u64,
    pub max_active_connections: u64,
    pub accept_pause_on_acceptor_queue_size: u64,
    pub accept_resume_on_acceptor_queue_size: u64,
    /// Soft limit; some new connections are shed above it.
    pub max_cpu_usage: f64,
    /// Hard limit; every new connection is shed below it.
    pub min_cpu_idle: f64,
    pub cpu_usage_exceed_window_size: u64,
    /// Number of busiest cores compared against the soft-IRQ limits; 0 means all.
    pub soft_irq_logical_cpu_core_quorum: u64,
    pub soft_irq_cpu_soft_limit_ratio: f64,
    pub soft_irq_cpu_hard_limit_ratio: f64,
    pub min_free_mem: u64,
    pub max_mem_usage: f64,
    pub max_tcp_mem_usage: f64,
    pub min_free_tcp_mem_pct: f64,
    pub period_ms: u64,
}

impl Default for LoadShedConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allowlist: Vec::new(),
            max_connections: 0,
            max_active_connections: 0,
            accept_pause_on_acceptor_queue_size: 0,
            accept_resume_on_acceptor_queue_size: 0,
            max_cpu_usage: 1.0,
            min_cpu_idle: 0.0,
            cpu_usage_exceed_window_size: 1,
            soft_irq_logical_cpu_core_quorum: 0,
            soft_irq_cpu_soft_limit_ratio: 1.0,
            soft_irq_cpu_hard_limit_ratio: 1.0,
            min_free_mem: 0,
            max_mem_usage: 1.0,
            max_tcp_mem_usage: 1.0,
            min_free_tcp_mem_pct: 0.0,
            period_ms: 0,
        }
    }
}

impl LoadShedConfig {
    /// Parse and add `"192.0.2.7"` or `"10.0.0.0/8"` style entries.
    pub fn add_allowlist_entry(&mut self, entry: &str) -> Result<(), ConfigError> {
        self.allowlist.push(entry.parse()?);
        Ok(())
    }

    /// Ports are ignored; only the IP is compared.
    pub fn is_allowlisted(&self, addr: IpAddr) -> bool {
        self.allowlist.iter().any(|entry| entry.matches(addr))
    }

    pub fn load_update_period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    /// Reject limits that contradict each other or the host. Disabled
    /// configurations are never checked.
    pub fn check_is_sane(&self, sys: &SysParams) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }

        ensure(
            self.max_active_connections <= self.max_connections,
            "max_active_connections must not exceed max_connections",
        )?;

        ratio("min_cpu_idle", self.min_cpu_idle)?;
        ratio("max_cpu_usage", self.max_cpu_usage)?;
        ensure(
            1.0 - self.min_cpu_idle >= self.max_cpu_usage,
            "max_cpu_usage must not exceed 1 - min_cpu_idle",
        )?;
        ensure(
            self.cpu_usage_exceed_window_size >= 1,
            "cpu_usage_exceed_window_size must be at least 1",
        )?;

        ensure(
            self.soft_irq_logical_cpu_core_quorum <= sys.num_logical_cpu_cores,
            "soft_irq_logical_cpu_core_quorum exceeds the number of logical cores",
        )?;
        ratio(
            "soft_irq_cpu_soft_limit_ratio",
            self.soft_irq_cpu_soft_limit_ratio,
        )?;
        ratio(
            "soft_irq_cpu_hard_limit_ratio",
            self.soft_irq_cpu_hard_limit_ratio,
        )?;
        ensure(
            self.soft_irq_cpu_hard_limit_ratio >= self.soft_irq_cpu_soft_limit_ratio,
            "soft_irq_cpu_hard_limit_ratio must not be below the soft limit ratio",
        )?;

        ratio("max_mem_usage", self.max_mem_usage)?;
        if sys.total_mem_bytes > 0 {
            ensure(
                self.min_free_mem <= sys.total_mem_bytes,
                "min_free_mem exceeds total memory",
            )?;
            let min_free = self.min_free_mem as f64 / sys.total_mem_bytes as f64;
            ensure(
                1.0 - min_free >= self.max_mem_usage,
                "max_mem_usage must not exceed 1 - min_free_mem / total memory",
            )?;
        }

        ratio("max_tcp_mem_usage", self.max_tcp_mem_usage)?;
        ratio("min_free_tcp_mem_pct", self.min_free_tcp_mem_pct)?;
        ensure(
            1.0 - self.min_free_tcp_mem_pct >= self.max_tcp_mem_usage,
            "max_tcp_mem_usage must not exceed 1 - min_free_tcp_mem_pct",
        )
    }
}

fn ensure(holds: bool, message: &str) -> Result<(), ConfigError> {
    if holds {
        Ok(())
    } else {
        Err(ConfigError::LoadShed(message.to_owned()))
    }
}

fn ratio(name: &str, value: f64) -> Result<(), ConfigError> {
    ensure(
        (0.0..=1.0).contains(&value),
        &format!("{name} must be within [0, 1], got {value}"),
    )
}
