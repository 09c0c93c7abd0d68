//! Acceptor TLS configuration: certificate contexts, client verification and
//! the knobs that shape the two engines.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::danger::ClientCertVerifier;
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{RootCertStore, ServerConfig, SupportedProtocolVersion};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};
use x509_parser::prelude::*;

use crate::load_shed::{LoadShedConfig, SysParams};
use crate::tls::{ClassicTlsEngine, ModernTlsEngine};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid PEM in {}: {reason}", .path.display())]
    Pem { path: PathBuf, reason: String },
    #[error("invalid certificate: {0}")]
    Certificate(String),
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("client verification: {0}")]
    ClientVerifier(String),
    #[error("invalid allowlist entry: {0}")]
    InvalidAllowlistEntry(String),
    #[error("invalid load shedding configuration: {0}")]
    LoadShed(String),
    #[error("configuration error: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientVerification {
    #[default]
    None,
    Optional,
    Required,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CertificateConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TlsContextConfig {
    #[serde(default)]
    pub certificates: Vec<CertificateConfig>,
    #[serde(default)]
    pub is_default: bool,
    /// Offered in order of preference.
    #[serde(default)]
    pub next_protocols: Vec<String>,
    #[serde(default)]
    pub client_verification: ClientVerification,
    #[serde(default)]
    pub client_ca_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AcceptorConfig {
    #[serde(default)]
    pub tls_contexts: Vec<TlsContextConfig>,
    /// Certificate and CA loading failures abort instead of being skipped.
    #[serde(default = "default_true")]
    pub strict_tls: bool,
    /// Hand clients without TLS 1.3 to the classic engine.
    #[serde(default = "default_true")]
    pub version_fallback: bool,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default)]
    pub load_shed: LoadShedConfig,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        Self {
            tls_contexts: Vec::new(),
            strict_tls: true,
            version_fallback: true,
            handshake_timeout_ms: default_handshake_timeout_ms(),
            load_shed: LoadShedConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

/// The engine pair described by an [`AcceptorConfig`].
#[derive(Debug, Clone)]
pub struct AcceptorEngines {
    pub modern: ModernTlsEngine,
    pub classic: ClassicTlsEngine,
}

impl AcceptorConfig {
    /// Parse and validate against the current host.
    pub fn from_yaml_str(source: &str) -> Result<Self, ConfigError> {
        let config: AcceptorConfig = serde_yaml::from_str(source)?;
        config.validate(&SysParams::detect())?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(target: "velocity::config", path = %path.display(), "loading acceptor config");
        Self::from_yaml_str(&source)
    }

    pub fn validate(&self, sys: &SysParams) -> Result<(), ConfigError> {
        if self.handshake_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "handshake_timeout_ms must be greater than zero".into(),
            ));
        }
        self.load_shed.check_is_sane(sys)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Build both engines, sharing one certificate resolver.
    ///
    /// `Ok(None)` means there is no usable TLS context: none configured, every
    /// certificate failed to load, or client verification could not be set up
    /// while `strict_tls` is off.
    pub fn build_engines(&self) -> Result<Option<AcceptorEngines>, ConfigError> {
        let Some(first) = self.tls_contexts.first() else {
            return Ok(None);
        };
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

        let Some(certs) = self.cert_manager(&provider)? else {
            warn!(target: "velocity::config", "no certificate could be loaded; TLS disabled");
            return Ok(None);
        };
        let certs: Arc<dyn ResolvesServerCert> = Arc::new(certs);

        let verifier = match client_verifier(first, &provider) {
            Ok(verifier) => verifier,
            Err(err) if !self.strict_tls => {
                warn!(target: "velocity::config", error = %err, "client verification unavailable; TLS disabled");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        let alpn: Vec<Vec<u8>> = first
            .next_protocols
            .iter()
            .map(|proto| proto.as_bytes().to_vec())
            .collect();

        let modern = server_config(
            &provider,
            &[&rustls::version::TLS13],
            certs.clone(),
            verifier.clone(),
            alpn.clone(),
        )?;
        let classic = server_config(
            &provider,
            &[&rustls::version::TLS12, &rustls::version::TLS13],
            certs,
            verifier,
            alpn,
        )?;

        let timeout = self.handshake_timeout();
        Ok(Some(AcceptorEngines {
            modern: ModernTlsEngine::new(modern)
                .with_handshake_timeout(timeout)
                .with_fallback(self.version_fallback),
            classic: ClassicTlsEngine::new(classic).with_handshake_timeout(timeout),
        }))
    }

    /// Load every configured certificate; `None` when nothing loaded.
    pub fn cert_manager(
        &self,
        provider: &CryptoProvider,
    ) -> Result<Option<CertManager>, ConfigError> {
        let mut manager = CertManager::default();
        for context in &self.tls_contexts {
            for cert in &context.certificates {
                match load_certified_key(cert, provider) {
                    Ok((key, names)) => {
                        debug!(target: "velocity::config", cert = %cert.cert_path.display(), ?names, "loaded certificate");
                        manager.add(key, &names, context.is_default);
                    }
                    Err(err) if !self.strict_tls => {
                        warn!(
                            target: "velocity::config",
                            cert = %cert.cert_path.display(),
                            key = %cert.key_path.display(),
                            error = %err,
                            "failed to load certificate; skipping"
                        );
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok((!manager.is_empty()).then_some(manager))
    }
}

fn server_config(
    provider: &Arc<CryptoProvider>,
    versions: &[&'static SupportedProtocolVersion],
    certs: Arc<dyn ResolvesServerCert>,
    verifier: Option<Arc<dyn ClientCertVerifier>>,
    alpn: Vec<Vec<u8>>,
) -> Result<Arc<ServerConfig>, ConfigError> {
    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(versions)?;
    let builder = match verifier {
        Some(verifier) => builder.with_client_cert_verifier(verifier),
        None => builder.with_no_client_auth(),
    };
    let mut config = builder.with_cert_resolver(certs);
    config.alpn_protocols = alpn;
    Ok(Arc::new(config))
}

fn client_verifier(
    context: &TlsContextConfig,
    provider: &Arc<CryptoProvider>,
) -> Result<Option<Arc<dyn ClientCertVerifier>>, ConfigError> {
    let roots = match &context.client_ca_file {
        Some(path) => {
            let mut roots = RootCertStore::empty();
            for cert in load_chain(path)? {
                roots.add(cert)?;
            }
            Some(Arc::new(roots))
        }
        None => None,
    };

    let builder = match (context.client_verification, roots) {
        (ClientVerification::None, _) => return Ok(None),
        (_, None) => {
            return Err(ConfigError::ClientVerifier(
                "client verification requires client_ca_file".into(),
            ));
        }
        (ClientVerification::Optional, Some(roots)) => {
            WebPkiClientVerifier::builder_with_provider(roots, provider.clone())
                .allow_unauthenticated()
        }
        (ClientVerification::Required, Some(roots)) => {
            WebPkiClientVerifier::builder_with_provider(roots, provider.clone())
        }
    };
    builder
        .build()
        .map(Some)
        .map_err(|err| ConfigError::ClientVerifier(err.to_string()))
}

/// Load a certificate chain and its key, returning the names it serves.
pub fn load_certified_key(
    cert: &CertificateConfig,
    provider: &CryptoProvider,
) -> Result<(Arc<CertifiedKey>, Vec<String>), ConfigError> {
    let chain = load_chain(&cert.cert_path)?;
    let key = load_key(&cert.key_path)?;
    let names = certificate_names(&chain[0])?;
    let signing_key = provider.key_provider.load_private_key(key)?;
    Ok((Arc::new(CertifiedKey::new(chain, signing_key)), names))
}

fn read_file(path: &Path) -> Result<Vec<u8>, ConfigError> {
    fs::read(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn load_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let pem = read_file(path)?;
    let chain = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| ConfigError::Pem {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
    if chain.is_empty() {
        return Err(ConfigError::Pem {
            path: path.to_path_buf(),
            reason: "no certificates found".into(),
        });
    }
    Ok(chain)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let pem = read_file(path)?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|err| ConfigError::Pem {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?
        .ok_or_else(|| ConfigError::Pem {
            path: path.to_path_buf(),
            reason: "no private key found".into(),
        })
}

/// DNS names from the SAN extension, or the subject CN when there are none.
fn certificate_names(der: &CertificateDer<'_>) -> Result<Vec<String>, ConfigError> {
    let (_, cert) = X509Certificate::from_der(der.as_ref())
        .map_err(|err| ConfigError::Certificate(err.to_string()))?;

    let mut names = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                names.push(dns.to_ascii_lowercase());
            }
        }
    }
    if names.is_empty() {
        names.extend(
            cert.subject()
                .iter_common_name()
                .filter_map(|cn| cn.as_str().ok())
                .map(str::to_ascii_lowercase),
        );
    }
    Ok(names)
}

/// Picks a certificate by SNI.
///
/// Exact names win over `*.` wildcards, which cover exactly one label. A
/// hello without SNI, or with a name nothing covers, gets the default
/// certificate: the first one added from a default context, else the first
/// one added.
#[derive(Debug, Default)]
pub struct CertManager {
    exact: HashMap<String, Arc<CertifiedKey>>,
    wildcard: HashMap<String, Arc<CertifiedKey>>,
    default: Option<Arc<CertifiedKey>>,
    explicit_default: bool,
    count: usize,
}

impl CertManager {
    pub fn add(&mut self, key: Arc<CertifiedKey>, names: &[String], is_default: bool) {
        for name in names {
            let name = name.to_ascii_lowercase();
            match name.strip_prefix("*.") {
                Some(parent) => {
                    self.wildcard
                        .entry(parent.to_owned())
                        .or_insert_with(|| key.clone());
                }
                None => {
                    self.exact.entry(name).or_insert_with(|| key.clone());
                }
            }
        }
        if self.default.is_none() || (is_default && !self.explicit_default) {
            self.default = Some(key);
            self.explicit_default = is_default;
        }
        self.count += 1;
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn resolve_name(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        if let Some(name) = server_name {
            let name = name.trim_end_matches('.').to_ascii_lowercase();
            if let Some(key) = self.exact.get(&name) {
                return Some(key.clone());
            }
            if let Some((_, parent)) = name.split_once('.') {
                if let Some(key) = self.wildcard.get(parent) {
                    return Some(key.clone());
                }
            }
        }
        self.default.clone()
    }
}

impl ResolvesServerCert for CertManager {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.resolve_name(client_hello.server_name())
    }
}
