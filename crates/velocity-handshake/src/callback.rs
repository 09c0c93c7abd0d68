use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::connection::{ByteCounts, Descriptor, RawConnection};
use crate::engine::{EngineError, NegotiatedTransport};
use crate::error::{HandshakeError, HandshakePhase};
use crate::info::TransportInfo;

/// Kind of secure transport handed to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SecureTransportType {
    Tls,
}

/// Error code reported alongside a ready connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum TlsErrorCode {
    NoError,
}

/// Everything the caller receives when a handshake succeeds.
pub struct ConnectionReady<T> {
    pub transport: T,
    pub application_protocol: Option<String>,
    pub transport_type: SecureTransportType,
    pub error_code: TlsErrorCode,
    pub info: TransportInfo,
}

impl<T> fmt::Debug for ConnectionReady<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionReady")
            .field("application_protocol", &self.application_protocol)
            .field("transport_type", &self.transport_type)
            .field("error_code", &self.error_code)
            .field("info", &self.info)
            .finish()
    }
}

/// Consumer of the final handshake outcome.
///
/// Both methods take `self` by value: exactly one of them runs, exactly once,
/// and the callback owns every session resource from that point on.
pub trait CompletionCallback<T, S>: Send {
    fn connection_ready(self, ready: ConnectionReady<T>);

    /// `connection` is the raw connection when the failing engine still held it.
    fn connection_error(self, connection: Option<RawConnection<S>>, error: HandshakeError);
}

/// Outcome delivered through a oneshot channel.
pub enum HandshakeCompletion<T, S> {
    Ready(ConnectionReady<T>),
    Error {
        connection: Option<RawConnection<S>>,
        error: HandshakeError,
    },
}

impl<T, S> fmt::Debug for HandshakeCompletion<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeCompletion::Ready(ready) => f.debug_tuple("Ready").field(ready).finish(),
            HandshakeCompletion::Error { connection, error } => f
                .debug_struct("Error")
                .field("connection", connection)
                .field("error", error)
                .finish(),
        }
    }
}

impl<T: Send, S: Send> CompletionCallback<T, S> for oneshot::Sender<HandshakeCompletion<T, S>> {
    fn connection_ready(self, ready: ConnectionReady<T>) {
        // The receiver going away is the caller abandoning the connection.
        let _ = self.send(HandshakeCompletion::Ready(ready));
    }

    fn connection_error(self, connection: Option<RawConnection<S>>, error: HandshakeError) {
        let _ = self.send(HandshakeCompletion::Error { connection, error });
    }
}

/// State of a handshake attempt at the moment it is reported to a logger.
#[derive(Debug, Clone, Copy)]
pub struct AttemptSnapshot {
    pub phase: HandshakePhase,
    pub descriptor: Option<Descriptor>,
    pub peer_addr: Option<SocketAddr>,
    pub elapsed: Duration,
    pub bytes: ByteCounts,
}

/// Optional telemetry observer.
///
/// Errors returned here are logged and otherwise ignored; they never change
/// the handshake outcome.
pub trait HandshakeLogger: Send + Sync {
    fn log_handshake_success(&self, transport: &dyn NegotiatedTransport) -> anyhow::Result<()>;

    fn log_handshake_error(
        &self,
        attempt: &AttemptSnapshot,
        cause: &EngineError,
    ) -> anyhow::Result<()>;

    /// Fallback is an expected transition, reported apart from failures.
    fn log_handshake_fallback(
        &self,
        _attempt: &AttemptSnapshot,
        _buffered: usize,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Logger that emits `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHandshakeLogger;

impl HandshakeLogger for TracingHandshakeLogger {
    fn log_handshake_success(&self, transport: &dyn NegotiatedTransport) -> anyhow::Result<()> {
        info!(
            target: "velocity::handshake",
            alpn = ?transport.application_protocol(),
            sni = ?transport.server_name(),
            version = ?transport.protocol_version(),
            "modern handshake succeeded"
        );
        Ok(())
    }

    fn log_handshake_error(
        &self,
        attempt: &AttemptSnapshot,
        cause: &EngineError,
    ) -> anyhow::Result<()> {
        warn!(
            target: "velocity::handshake",
            phase = %attempt.phase,
            peer = ?attempt.peer_addr,
            elapsed_ms = attempt.elapsed.as_millis() as u64,
            received = attempt.bytes.received,
            sent = attempt.bytes.sent,
            error = %cause,
            "handshake failed"
        );
        Ok(())
    }

    fn log_handshake_fallback(
        &self,
        attempt: &AttemptSnapshot,
        buffered: usize,
    ) -> anyhow::Result<()> {
        info!(
            target: "velocity::handshake",
            peer = ?attempt.peer_addr,
            elapsed_ms = attempt.elapsed.as_millis() as u64,
            buffered,
            "client not compatible with modern handshake; falling back"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineError;
    use crate::error::HandshakeErrorKind;
    use tokio::io::{duplex, DuplexStream};

    struct Plain;

    impl NegotiatedTransport for Plain {
        fn application_protocol(&self) -> Option<String> {
            Some("h2".into())
        }
    }

    fn attempt() -> AttemptSnapshot {
        AttemptSnapshot {
            phase: HandshakePhase::Modern,
            descriptor: Some(Descriptor::new(4)),
            peer_addr: None,
            elapsed: Duration::from_millis(8),
            bytes: ByteCounts::default(),
        }
    }

    #[test]
    fn tracing_logger_never_fails() {
        let logger = TracingHandshakeLogger;
        assert!(logger.log_handshake_success(&Plain).is_ok());
        assert!(logger
            .log_handshake_error(&attempt(), &EngineError::protocol("bad key share"))
            .is_ok());
        assert!(logger.log_handshake_fallback(&attempt(), 517).is_ok());
    }

    #[tokio::test]
    async fn oneshot_delivers_errors_with_the_connection() {
        let (tx, rx) = oneshot::channel::<HandshakeCompletion<Plain, DuplexStream>>();
        let (io, _peer) = duplex(8);
        let error = HandshakeError::classify(
            HandshakePhase::Classic,
            Duration::from_millis(3),
            ByteCounts::default(),
            EngineError::protocol("bad finished"),
        );
        tx.connection_error(Some(RawConnection::new(io, Descriptor::new(4))), error);

        match rx.await.expect("completion") {
            HandshakeCompletion::Error { connection, error } => {
                assert_eq!(
                    connection.map(|conn| conn.descriptor()),
                    Some(Descriptor::new(4))
                );
                assert_eq!(error.kind(), HandshakeErrorKind::ClassicHandshakeFailure);
            }
            HandshakeCompletion::Ready(_) => panic!("expected an error"),
        }
    }

    #[test]
    fn dropped_receiver_is_ignored() {
        let (tx, rx) = oneshot::channel::<HandshakeCompletion<Plain, DuplexStream>>();
        drop(rx);
        tx.connection_ready(ConnectionReady {
            transport: Plain,
            application_protocol: Some("h2".into()),
            transport_type: SecureTransportType::Tls,
            error_code: TlsErrorCode::NoError,
            info: TransportInfo::new(std::time::Instant::now()),
        });
    }
}
