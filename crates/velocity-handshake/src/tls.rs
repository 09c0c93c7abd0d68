//! rustls-backed engines.
//!
//! The modern engine only speaks TLS 1.3. It reads the ClientHello itself
//! before handing the stream to rustls, so a client that never offers 1.3 can
//! be passed to the classic engine with every byte it sent still intact.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{self, Instant};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::connection::RawConnection;
use crate::engine::{
    ClassicEngine, ClassicOutcome, EngineError, EngineFailure, FallbackRequest, ModernEngine,
    ModernOutcome, NegotiatedTransport, SecureTransport,
};
use crate::hello::read_client_hello;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// TLS session over an accepted raw connection.
pub type TlsTransport<S> = TlsStream<RawConnection<S>>;

/// Transport handed to the callback when both engines are rustls-backed.
pub type TlsSecureTransport<S> = SecureTransport<TlsTransport<S>, TlsTransport<S>>;

impl<IO> NegotiatedTransport for TlsStream<IO> {
    fn application_protocol(&self) -> Option<String> {
        let (_, session) = self.get_ref();
        session
            .alpn_protocol()
            .map(|proto| String::from_utf8_lossy(proto).into_owned())
    }

    fn server_name(&self) -> Option<String> {
        self.get_ref().1.server_name().map(str::to_owned)
    }

    fn protocol_version(&self) -> Option<String> {
        self.get_ref()
            .1
            .protocol_version()
            .map(|version| format!("{version:?}"))
    }

    fn cipher_suite(&self) -> Option<String> {
        self.get_ref()
            .1
            .negotiated_cipher_suite()
            .map(|suite| format!("{:?}", suite.suite()))
    }
}

/// Deadline for the whole negotiation, counted from the original accept.
/// A connection that fell back keeps the deadline it was accepted with.
fn handshake_deadline<S>(connection: &RawConnection<S>, timeout: Duration) -> Instant {
    Instant::from_std(connection.accepted_at()) + timeout
}

/// TLS 1.3 engine that hands older clients back for fallback.
#[derive(Clone)]
pub struct ModernTlsEngine {
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
    fallback_enabled: bool,
}

impl ModernTlsEngine {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            acceptor: TlsAcceptor::from(config),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            fallback_enabled: true,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// When disabled, clients without TLS 1.3 fail instead of falling back.
    pub fn with_fallback(mut self, enabled: bool) -> Self {
        self.fallback_enabled = enabled;
        self
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    pub fn fallback_enabled(&self) -> bool {
        self.fallback_enabled
    }
}

impl std::fmt::Debug for ModernTlsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModernTlsEngine")
            .field("handshake_timeout", &self.handshake_timeout)
            .field("fallback_enabled", &self.fallback_enabled)
            .finish()
    }
}

impl<S> ModernEngine<S> for ModernTlsEngine
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Transport = TlsTransport<S>;

    fn accept(
        &self,
        mut connection: RawConnection<S>,
    ) -> BoxFuture<'static, ModernOutcome<Self::Transport, S>> {
        let acceptor = self.acceptor.clone();
        let timeout = self.handshake_timeout;
        let fallback_enabled = self.fallback_enabled;

        async move {
            let deadline = handshake_deadline(&connection, timeout);
            let sniffed = match time::timeout_at(deadline, read_client_hello(&mut connection)).await
            {
                Ok(Ok(sniffed)) => sniffed,
                Ok(Err(err)) => {
                    return ModernOutcome::Failure(EngineFailure::new(err, connection));
                }
                Err(_) => {
                    return ModernOutcome::Failure(EngineFailure::new(
                        EngineError::Timeout(timeout),
                        connection,
                    ));
                }
            };

            let hello = &sniffed.summary;
            if !hello.offers_tls13() {
                debug!(
                    target: "velocity::tls",
                    descriptor = %connection.descriptor(),
                    legacy_version = hello.legacy_version,
                    sni = ?hello.server_name,
                    fallback_enabled,
                    "client does not offer TLS 1.3"
                );
                if !fallback_enabled {
                    return ModernOutcome::Failure(EngineFailure::new(
                        EngineError::protocol("client does not offer TLS 1.3"),
                        connection,
                    ));
                }
                return ModernOutcome::Fallback(FallbackRequest {
                    connection,
                    buffered: sniffed.buffered,
                });
            }

            connection.prepend_prereceived(sniffed.buffered);
            match time::timeout_at(deadline, acceptor.accept(connection).into_fallible()).await {
                Ok(Ok(stream)) => ModernOutcome::Success(stream),
                Ok(Err((err, connection))) => {
                    ModernOutcome::Failure(EngineFailure::new(err, connection))
                }
                Err(_) => ModernOutcome::Failure(EngineFailure::detached(EngineError::Timeout(
                    timeout,
                ))),
            }
        }
        .boxed()
    }
}

/// TLS 1.2/1.3 engine; replays any bytes a previous engine already consumed.
#[derive(Clone)]
pub struct ClassicTlsEngine {
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
}

impl ClassicTlsEngine {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            acceptor: TlsAcceptor::from(config),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }
}

impl std::fmt::Debug for ClassicTlsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassicTlsEngine")
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

impl<S> ClassicEngine<S> for ClassicTlsEngine
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Transport = TlsTransport<S>;

    fn accept(
        &self,
        connection: RawConnection<S>,
    ) -> BoxFuture<'static, ClassicOutcome<Self::Transport, S>> {
        let acceptor = self.acceptor.clone();
        let timeout = self.handshake_timeout;

        async move {
            let deadline = handshake_deadline(&connection, timeout);
            let remaining = deadline.saturating_duration_since(Instant::now());
            debug!(
                target: "velocity::tls",
                descriptor = %connection.descriptor(),
                replay = connection.prereceived_len(),
                remaining_ms = remaining.as_millis() as u64,
                "starting classic handshake"
            );
            match time::timeout_at(deadline, acceptor.accept(connection).into_fallible()).await {
                Ok(Ok(stream)) => Ok(stream),
                Ok(Err((err, connection))) => Err(EngineFailure::new(err, connection)),
                Err(_) => Err(EngineFailure::detached(EngineError::Timeout(timeout))),
            }
        }
        .boxed()
    }
}
