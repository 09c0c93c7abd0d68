use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::engine::NegotiatedTransport;

/// Which handshake path secured the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityType {
    #[default]
    None,
    /// Compatibility TLS path taken after a fallback.
    ClassicTls,
    /// The preferred handshake completed without fallback.
    ModernTls,
}

impl fmt::Display for SecurityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SecurityType::None => "none",
            SecurityType::ClassicTls => "classic-tls",
            SecurityType::ModernTls => "modern-tls",
        };
        f.write_str(label)
    }
}

/// Timing and security metadata gathered while a connection is secured.
///
/// The orchestrator fills this in as the handshake progresses and moves the
/// finished value into the completion callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportInfo {
    accept_time: Instant,
    secure: bool,
    security_type: SecurityType,
    ssl_setup_time: Duration,
    server_name: Option<String>,
    negotiated_extension_param: Option<u8>,
    application_protocol: Option<String>,
    protocol_version: Option<String>,
    cipher_suite: Option<String>,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
}

impl TransportInfo {
    pub(crate) fn new(accept_time: Instant) -> Self {
        Self {
            accept_time,
            secure: false,
            security_type: SecurityType::None,
            ssl_setup_time: Duration::ZERO,
            server_name: None,
            negotiated_extension_param: None,
            application_protocol: None,
            protocol_version: None,
            cipher_suite: None,
            peer_addr: None,
            local_addr: None,
        }
    }

    pub fn accept_time(&self) -> Instant {
        self.accept_time
    }

    pub fn secure(&self) -> bool {
        self.secure
    }

    pub fn security_type(&self) -> SecurityType {
        self.security_type
    }

    /// Time from the original accept to the terminal handshake outcome.
    ///
    /// After a fallback this still counts from the original accept, so the
    /// abandoned modern attempt is part of the figure.
    pub fn ssl_setup_time(&self) -> Duration {
        self.ssl_setup_time
    }

    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    pub fn negotiated_extension_param(&self) -> Option<u8> {
        self.negotiated_extension_param
    }

    pub fn application_protocol(&self) -> Option<&str> {
        self.application_protocol.as_deref()
    }

    pub fn protocol_version(&self) -> Option<&str> {
        self.protocol_version.as_deref()
    }

    pub fn cipher_suite(&self) -> Option<&str> {
        self.cipher_suite.as_deref()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub(crate) fn set_accept_time(&mut self, accept_time: Instant) {
        self.accept_time = accept_time;
    }

    pub(crate) fn set_addresses(&mut self, local: Option<SocketAddr>, peer: Option<SocketAddr>) {
        self.local_addr = local;
        self.peer_addr = peer;
    }

    /// Fill in the fields describing a successful handshake.
    ///
    /// The extension parameter is only meaningful for the modern path; the
    /// classic path never carries one.
    pub(crate) fn record_success(
        &mut self,
        security_type: SecurityType,
        transport: &dyn NegotiatedTransport,
    ) {
        self.secure = true;
        self.security_type = security_type;
        self.ssl_setup_time = self.accept_time.elapsed();
        self.server_name = transport.server_name();
        self.application_protocol = transport.application_protocol();
        self.protocol_version = transport.protocol_version();
        self.cipher_suite = transport.cipher_suite();
        self.negotiated_extension_param = match security_type {
            SecurityType::ModernTls => transport.negotiated_extension_param(),
            _ => None,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct Negotiated;

    impl NegotiatedTransport for Negotiated {
        fn application_protocol(&self) -> Option<String> {
            Some("h2".into())
        }

        fn server_name(&self) -> Option<String> {
            Some("edge.velo".into())
        }

        fn negotiated_extension_param(&self) -> Option<u8> {
            Some(2)
        }
    }

    #[test]
    fn starts_insecure() {
        let info = TransportInfo::new(Instant::now());
        assert!(!info.secure());
        assert_eq!(info.security_type(), SecurityType::None);
        assert_eq!(info.ssl_setup_time(), Duration::ZERO);
        assert!(info.server_name().is_none());
    }

    #[test]
    fn modern_success_keeps_extension_param() {
        let mut info = TransportInfo::new(Instant::now());
        info.record_success(SecurityType::ModernTls, &Negotiated);
        assert!(info.secure());
        assert_eq!(info.security_type(), SecurityType::ModernTls);
        assert_eq!(info.server_name(), Some("edge.velo"));
        assert_eq!(info.application_protocol(), Some("h2"));
        assert_eq!(info.negotiated_extension_param(), Some(2));
    }

    #[test]
    fn classic_success_drops_extension_param() {
        let mut info = TransportInfo::new(Instant::now());
        info.record_success(SecurityType::ClassicTls, &Negotiated);
        assert_eq!(info.security_type(), SecurityType::ClassicTls);
        assert_eq!(info.negotiated_extension_param(), None);
    }

    #[test]
    fn setup_time_counts_from_accept() {
        let accepted = Instant::now() - Duration::from_millis(40);
        let mut info = TransportInfo::new(accepted);
        info.record_success(SecurityType::ClassicTls, &Negotiated);
        assert!(info.ssl_setup_time() >= Duration::from_millis(40));
    }
}
