//! Modern-first handshake with a single transparent fallback to classic TLS.
//!
//! ```text
//! Init ──start──▶ AttemptingModern ──success──▶ connection_ready (modern)
//!                        │          ──error────▶ connection_error (modern)
//!                     fallback
//!                        ▼
//!               AttemptingClassic ──success──▶ connection_ready (classic)
//!                                   ──error────▶ connection_error (classic)
//! ```
//!
//! Terminal handlers consume the orchestrator. Its engines are dropped and
//! its remaining state is moved out before the callback runs, so the callback
//! owns everything that is left. Dropping the orchestrator (or the future
//! returned by [`HandshakeOrchestrator::drive`]) before a terminal outcome
//! abandons the handshake: the active engine and its socket are dropped and
//! the callback is never invoked.

use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tracing::debug;

use crate::callback::{
    AttemptSnapshot, CompletionCallback, ConnectionReady, HandshakeLogger, SecureTransportType,
    TlsErrorCode,
};
use crate::connection::{ByteCounters, Descriptor, RawConnection};
use crate::engine::{
    ClassicEngine, ClassicOutcome, EngineError, EngineFailure, FallbackRequest, ModernEngine,
    ModernOutcome, NegotiatedTransport, SecureTransport,
};
use crate::error::{HandshakeError, HandshakePhase, OrchestratorError};
use crate::info::{SecurityType, TransportInfo};

/// Observable lifecycle position of an orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    AttemptingModern,
    AttemptingClassic,
}

/// Secure transport type handed to the callback for a given engine pair.
pub type OrchestratedTransport<S, M, C> =
    SecureTransport<<M as ModernEngine<S>>::Transport, <C as ClassicEngine<S>>::Transport>;

/// The one live engine, if any.
enum Phase<S, MT, CT> {
    Init,
    Modern(BoxFuture<'static, ModernOutcome<MT, S>>),
    Classic(BoxFuture<'static, ClassicOutcome<CT, S>>),
}

/// Drives one accepted connection through the modern handshake, falling back
/// to the classic engine at most once.
pub struct HandshakeOrchestrator<S, M, C, CB>
where
    M: ModernEngine<S>,
    C: ClassicEngine<S>,
{
    modern: M,
    classic: C,
    callback: CB,
    logger: Option<Arc<dyn HandshakeLogger>>,
    phase: Phase<S, M::Transport, C::Transport>,
    info: TransportInfo,
    descriptor: Option<Descriptor>,
    counters: Option<Arc<ByteCounters>>,
    started: bool,
    fell_back: bool,
}

impl<S, M, C, CB> HandshakeOrchestrator<S, M, C, CB>
where
    M: ModernEngine<S>,
    C: ClassicEngine<S>,
{
    pub fn state(&self) -> HandshakeState {
        match self.phase {
            Phase::Init => HandshakeState::Init,
            Phase::Modern(_) => HandshakeState::AttemptingModern,
            Phase::Classic(_) => HandshakeState::AttemptingClassic,
        }
    }
}

impl<S, M, C, CB> HandshakeOrchestrator<S, M, C, CB>
where
    S: Send + 'static,
    M: ModernEngine<S>,
    C: ClassicEngine<S>,
    CB: CompletionCallback<OrchestratedTransport<S, M, C>, S>,
{
    pub fn new(modern: M, classic: C, callback: CB) -> Self {
        Self {
            modern,
            classic,
            callback,
            logger: None,
            phase: Phase::Init,
            info: TransportInfo::new(std::time::Instant::now()),
            descriptor: None,
            counters: None,
            started: false,
            fell_back: false,
        }
    }

    /// Attach a telemetry observer notified before the callback.
    pub fn with_logger(mut self, logger: Arc<dyn HandshakeLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Take ownership of an accepted connection and hand it to the modern engine.
    ///
    /// The accept instant carried by the connection becomes the reference
    /// point for every timing reported later.
    pub fn start(&mut self, connection: RawConnection<S>) -> Result<(), OrchestratorError> {
        if self.started {
            return Err(OrchestratorError::AlreadyStarted);
        }
        self.started = true;
        self.info.set_accept_time(connection.accepted_at());
        self.info
            .set_addresses(connection.local_addr(), connection.peer_addr());
        self.descriptor = Some(connection.descriptor());
        self.counters = Some(connection.counters());

        debug!(
            target: "velocity::handshake",
            descriptor = %connection.descriptor(),
            peer = ?connection.peer_addr(),
            "starting modern handshake"
        );
        self.phase = Phase::Modern(self.modern.accept(connection));
        Ok(())
    }

    /// Wait on the active engine and react to its notifications until the
    /// callback has been invoked.
    pub async fn drive(mut self) -> Result<(), OrchestratorError> {
        loop {
            match mem::replace(&mut self.phase, Phase::Init) {
                Phase::Init => return Err(OrchestratorError::NotStarted),
                Phase::Modern(engine) => match engine.await {
                    ModernOutcome::Success(transport) => {
                        self.on_modern_success(transport);
                        return Ok(());
                    }
                    ModernOutcome::Failure(failure) => {
                        self.on_modern_error(failure);
                        return Ok(());
                    }
                    ModernOutcome::Fallback(request) => {
                        if let Err(failure) = self.on_modern_fallback(request) {
                            self.on_modern_error(failure);
                            return Ok(());
                        }
                    }
                },
                Phase::Classic(engine) => {
                    match engine.await {
                        Ok(transport) => self.on_classic_success(transport),
                        Err(failure) => self.on_classic_error(failure),
                    }
                    return Ok(());
                }
            }
        }
    }

    /// `start` followed by `drive`.
    pub async fn run(mut self, connection: RawConnection<S>) -> Result<(), OrchestratorError> {
        self.start(connection)?;
        self.drive().await
    }

    pub(crate) fn on_modern_success(self, transport: M::Transport) {
        let settled = self.settle();
        if let Some(logger) = settled.logger.as_deref() {
            if let Err(err) = logger.log_handshake_success(&transport) {
                debug!(target: "velocity::handshake", error = %err, "handshake logger failed");
            }
        }
        settled.ready(SecurityType::ModernTls, SecureTransport::Modern(transport));
    }

    pub(crate) fn on_modern_error(self, failure: EngineFailure<S>) {
        self.settle()
            .fail::<OrchestratedTransport<S, M, C>>(HandshakePhase::Modern, failure);
    }

    /// Move the connection from the modern engine to a new classic engine.
    ///
    /// The buffered bytes are queued ahead of any further socket read. On
    /// rejection the connection comes back inside the returned failure and the
    /// orchestrator is left without an active engine.
    pub(crate) fn on_modern_fallback(
        &mut self,
        request: FallbackRequest<S>,
    ) -> Result<(), EngineFailure<S>> {
        let FallbackRequest {
            mut connection,
            buffered,
        } = request;

        if self.fell_back {
            return Err(EngineFailure::new(
                EngineError::protocol("fallback requested more than once"),
                connection,
            ));
        }
        if let Some(expected) = self.descriptor {
            let actual = connection.descriptor();
            if actual != expected {
                return Err(EngineFailure::new(
                    EngineError::DescriptorMismatch { expected, actual },
                    connection,
                ));
            }
        }
        self.fell_back = true;

        // Release whatever is left of the modern engine before the classic one exists.
        drop(mem::replace(&mut self.phase, Phase::Init));

        let attempt = snapshot(
            HandshakePhase::Modern,
            &self.info,
            self.descriptor,
            self.counters.as_deref(),
        );
        if let Some(logger) = self.logger.as_deref() {
            if let Err(err) = logger.log_handshake_fallback(&attempt, buffered.len()) {
                debug!(target: "velocity::handshake", error = %err, "handshake logger failed");
            }
        }
        debug!(
            target: "velocity::handshake",
            descriptor = %connection.descriptor(),
            buffered = buffered.len(),
            elapsed_ms = attempt.elapsed.as_millis() as u64,
            "falling back to classic handshake"
        );

        connection.prepend_prereceived(buffered);
        self.phase = Phase::Classic(self.classic.accept(connection));
        Ok(())
    }

    pub(crate) fn on_classic_success(self, transport: C::Transport) {
        self.settle()
            .ready(SecurityType::ClassicTls, SecureTransport::Classic(transport));
    }

    pub(crate) fn on_classic_error(self, failure: EngineFailure<S>) {
        self.settle()
            .fail::<OrchestratedTransport<S, M, C>>(HandshakePhase::Classic, failure);
    }

    /// Drop the engines and move out what the terminal step still needs.
    fn settle(self) -> Settled<CB, S> {
        let Self {
            modern,
            classic,
            callback,
            logger,
            phase,
            info,
            descriptor,
            counters,
            ..
        } = self;
        drop(phase);
        drop(modern);
        drop(classic);
        Settled {
            callback,
            logger,
            info,
            descriptor,
            counters,
            _connection: PhantomData,
        }
    }
}

impl<S, M, C, CB> fmt::Debug for HandshakeOrchestrator<S, M, C, CB>
where
    M: ModernEngine<S>,
    C: ClassicEngine<S>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeOrchestrator")
            .field("state", &self.state())
            .field("descriptor", &self.descriptor)
            .field("fell_back", &self.fell_back)
            .field("has_logger", &self.logger.is_some())
            .finish()
    }
}

/// Orchestrator remains after the engines are gone; consumed by the callback.
struct Settled<CB, S> {
    callback: CB,
    logger: Option<Arc<dyn HandshakeLogger>>,
    info: TransportInfo,
    descriptor: Option<Descriptor>,
    counters: Option<Arc<ByteCounters>>,
    _connection: PhantomData<fn() -> S>,
}

impl<CB, S> Settled<CB, S> {
    fn ready<M, C>(self, security_type: SecurityType, transport: SecureTransport<M, C>)
    where
        M: NegotiatedTransport,
        C: NegotiatedTransport,
        CB: CompletionCallback<SecureTransport<M, C>, S>,
    {
        let Settled {
            callback, mut info, ..
        } = self;
        info.record_success(security_type, &transport);
        debug!(
            target: "velocity::handshake",
            security = %security_type,
            setup_ms = info.ssl_setup_time().as_millis() as u64,
            alpn = ?info.application_protocol(),
            "handshake complete"
        );
        let application_protocol = transport.application_protocol();
        callback.connection_ready(ConnectionReady {
            transport,
            application_protocol,
            transport_type: SecureTransportType::Tls,
            error_code: TlsErrorCode::NoError,
            info,
        });
    }

    fn fail<T>(self, phase: HandshakePhase, failure: EngineFailure<S>)
    where
        CB: CompletionCallback<T, S>,
    {
        let EngineFailure { cause, connection } = failure;
        let attempt = snapshot(
            phase,
            &self.info,
            self.descriptor,
            self.counters.as_deref(),
        );
        if phase == HandshakePhase::Modern {
            if let Some(logger) = self.logger.as_deref() {
                if let Err(err) = logger.log_handshake_error(&attempt, &cause) {
                    debug!(target: "velocity::handshake", error = %err, "handshake logger failed");
                }
            }
        }

        let error = HandshakeError::classify(phase, attempt.elapsed, attempt.bytes, cause);
        debug!(target: "velocity::handshake", kind = %error.kind(), "{error}");
        self.callback.connection_error(connection, error);
    }
}

fn snapshot(
    phase: HandshakePhase,
    info: &TransportInfo,
    descriptor: Option<Descriptor>,
    counters: Option<&ByteCounters>,
) -> AttemptSnapshot {
    AttemptSnapshot {
        phase,
        descriptor,
        peer_addr: info.peer_addr(),
        elapsed: info.accept_time().elapsed(),
        bytes: counters.map(ByteCounters::snapshot).unwrap_or_default(),
    }
}
