//! Dual-path TLS handshake orchestration for accepted connections.
//!
//! An accepted socket is offered to a modern (TLS 1.3) engine first. When that
//! engine decides the client cannot complete a modern handshake, the socket
//! and every byte already read from it are handed to a classic engine, which
//! replays those bytes before reading more. Whichever way it ends, the caller
//! is notified exactly once through a [`CompletionCallback`].

pub mod callback;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod hello;
pub mod info;
pub mod load_shed;
pub mod orchestrator;
pub mod tls;

pub use callback::{
    AttemptSnapshot, CompletionCallback, ConnectionReady, HandshakeCompletion, HandshakeLogger,
    SecureTransportType, TlsErrorCode, TracingHandshakeLogger,
};
pub use config::{
    AcceptorConfig, AcceptorEngines, CertManager, CertificateConfig, ClientVerification,
    ConfigError, TlsContextConfig,
};
pub use connection::{ByteCounters, ByteCounts, Descriptor, RawConnection};
pub use engine::{
    ClassicEngine, ClassicOutcome, EngineError, EngineFailure, FallbackRequest, ModernEngine,
    ModernOutcome, NegotiatedTransport, SecureTransport,
};
pub use error::{HandshakeError, HandshakeErrorKind, HandshakePhase, OrchestratorError};
pub use hello::{
    parse_client_hello, read_client_hello, ClientHelloSummary, HelloError, SniffError,
    SniffedHello,
};
pub use info::{SecurityType, TransportInfo};
pub use load_shed::{AllowlistEntry, LoadShedConfig, NetworkAddress, SysParams};
pub use orchestrator::{HandshakeOrchestrator, HandshakeState, OrchestratedTransport};
pub use tls::{
    ClassicTlsEngine, ModernTlsEngine, TlsSecureTransport, TlsTransport,
    DEFAULT_HANDSHAKE_TIMEOUT,
};
