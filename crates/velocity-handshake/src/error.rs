use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::connection::ByteCounts;
use crate::engine::EngineError;

/// Handshake path that was running when a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    Modern,
    Classic,
}

impl fmt::Display for HandshakePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakePhase::Modern => f.write_str("modern"),
            HandshakePhase::Classic => f.write_str("classic"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeErrorKind {
    /// Crypto or protocol failure inside the modern engine; not fallback-eligible.
    ModernHandshakeFailure,
    /// Crypto or protocol failure inside the classic engine, including after fallback.
    ClassicHandshakeFailure,
    /// I/O failure surfaced by either engine.
    TransportError,
}

impl fmt::Display for HandshakeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HandshakeErrorKind::ModernHandshakeFailure => "modern handshake failure",
            HandshakeErrorKind::ClassicHandshakeFailure => "classic handshake failure",
            HandshakeErrorKind::TransportError => "transport error",
        };
        f.write_str(label)
    }
}

/// Classified terminal failure delivered to the completion callback.
#[derive(Debug, Error)]
#[error(
    "{kind} during {phase} handshake after {}ms; {bytes_received} bytes received & {bytes_sent} bytes sent: {cause}",
    .elapsed.as_millis()
)]
pub struct HandshakeError {
    phase: HandshakePhase,
    kind: HandshakeErrorKind,
    elapsed: Duration,
    bytes_received: u64,
    bytes_sent: u64,
    #[source]
    cause: EngineError,
}

impl HandshakeError {
    pub(crate) fn classify(
        phase: HandshakePhase,
        elapsed: Duration,
        counts: ByteCounts,
        cause: EngineError,
    ) -> Self {
        let kind = if cause.is_transport() {
            HandshakeErrorKind::TransportError
        } else {
            match phase {
                HandshakePhase::Modern => HandshakeErrorKind::ModernHandshakeFailure,
                HandshakePhase::Classic => HandshakeErrorKind::ClassicHandshakeFailure,
            }
        };
        Self {
            phase,
            kind,
            elapsed,
            bytes_received: counts.received,
            bytes_sent: counts.sent,
            cause,
        }
    }

    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    pub fn kind(&self) -> HandshakeErrorKind {
        self.kind
    }

    /// Time since the original accept, fallback attempt included.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn cause(&self) -> &EngineError {
        &self.cause
    }
}

/// Misuse of the orchestrator lifecycle.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("handshake already started")]
    AlreadyStarted,
    #[error("handshake not started")]
    NotStarted,
}
