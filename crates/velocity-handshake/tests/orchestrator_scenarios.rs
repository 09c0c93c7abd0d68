use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;
use velocity_handshake::{
    AttemptSnapshot, ClassicEngine, ClassicOutcome, ConnectionReady, Descriptor, EngineError,
    EngineFailure, FallbackRequest, HandshakeCompletion, HandshakeError, HandshakeErrorKind,
    HandshakeLogger, HandshakeOrchestrator, HandshakePhase, ModernEngine, ModernOutcome,
    NegotiatedTransport, OrchestratorError, RawConnection, SecureTransport, SecurityType,
};

const DESCRIPTOR: Descriptor = Descriptor::new(42);

/// A classic-style greeting followed by the start of the next record.
const LEGACY_GREETING: &[u8] = b"\x16\x03\x01\x00\x0aHELLO-1.2!EXTRA";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Session {
    alpn: Option<String>,
    extension: Option<u8>,
    received: Vec<u8>,
    connection: RawConnection<DuplexStream>,
}

impl NegotiatedTransport for Session {
    fn application_protocol(&self) -> Option<String> {
        self.alpn.clone()
    }

    fn negotiated_extension_param(&self) -> Option<u8> {
        self.extension
    }
}

type Completion = HandshakeCompletion<SecureTransport<Session, Session>, DuplexStream>;

#[derive(Clone)]
enum ModernScript {
    Succeed,
    Fail,
    ResetByPeer,
    Fallback { read: usize, delay: Duration },
    FallbackOnOtherSocket,
    Stall,
}

struct ScriptedModern {
    script: ModernScript,
}

impl ModernEngine<DuplexStream> for ScriptedModern {
    type Transport = Session;

    fn accept(
        &self,
        mut connection: RawConnection<DuplexStream>,
    ) -> BoxFuture<'static, ModernOutcome<Session, DuplexStream>> {
        let script = self.script.clone();
        async move {
            match script {
                ModernScript::Succeed => ModernOutcome::Success(Session {
                    alpn: Some("h2".into()),
                    extension: Some(7),
                    received: Vec::new(),
                    connection,
                }),
                ModernScript::Fail => ModernOutcome::Failure(EngineFailure::new(
                    EngineError::protocol("bad key share"),
                    connection,
                )),
                ModernScript::ResetByPeer => ModernOutcome::Failure(EngineFailure::new(
                    io::Error::from(io::ErrorKind::ConnectionReset),
                    connection,
                )),
                ModernScript::Fallback { read, delay } => {
                    let mut buffered = vec![0u8; read];
                    if let Err(err) = connection.read_exact(&mut buffered).await {
                        return ModernOutcome::Failure(EngineFailure::new(err, connection));
                    }
                    tokio::time::sleep(delay).await;
                    ModernOutcome::Fallback(FallbackRequest {
                        connection,
                        buffered: Bytes::from(buffered),
                    })
                }
                ModernScript::FallbackOnOtherSocket => {
                    drop(connection);
                    let (other, _) = duplex(16);
                    ModernOutcome::Fallback(FallbackRequest {
                        connection: RawConnection::new(other, Descriptor::new(99)),
                        buffered: Bytes::new(),
                    })
                }
                ModernScript::Stall => {
                    let _held = connection;
                    std::future::pending().await
                }
            }
        }
        .boxed()
    }
}

struct ScriptedClassic {
    read: usize,
    succeed: bool,
    accepted: Arc<Mutex<Vec<Descriptor>>>,
}

impl ClassicEngine<DuplexStream> for ScriptedClassic {
    type Transport = Session;

    fn accept(
        &self,
        mut connection: RawConnection<DuplexStream>,
    ) -> BoxFuture<'static, ClassicOutcome<Session, DuplexStream>> {
        self.accepted.lock().push(connection.descriptor());
        let read = self.read;
        let succeed = self.succeed;
        async move {
            let mut received = vec![0u8; read];
            if let Err(err) = connection.read_exact(&mut received).await {
                return Err(EngineFailure::new(err, connection));
            }
            if !succeed {
                return Err(EngineFailure::new(
                    EngineError::protocol("bad finished"),
                    connection,
                ));
            }
            Ok(Session {
                alpn: Some("http/1.1".into()),
                // Must never reach TransportInfo on the classic path.
                extension: Some(3),
                received,
                connection,
            })
        }
        .boxed()
    }
}

#[derive(Default)]
struct RecordingLogger {
    events: Mutex<Vec<String>>,
    broken: bool,
}

impl RecordingLogger {
    fn broken() -> Self {
        Self {
            broken: true,
            ..Self::default()
        }
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    fn record(&self, event: String) -> anyhow::Result<()> {
        self.events.lock().push(event);
        if self.broken {
            anyhow::bail!("telemetry sink unavailable");
        }
        Ok(())
    }
}

impl HandshakeLogger for RecordingLogger {
    fn log_handshake_success(&self, transport: &dyn NegotiatedTransport) -> anyhow::Result<()> {
        self.record(format!(
            "success:{}",
            transport.application_protocol().unwrap_or_default()
        ))
    }

    fn log_handshake_error(
        &self,
        attempt: &AttemptSnapshot,
        _cause: &EngineError,
    ) -> anyhow::Result<()> {
        self.record(format!("error:{}", attempt.phase))
    }

    fn log_handshake_fallback(
        &self,
        attempt: &AttemptSnapshot,
        buffered: usize,
    ) -> anyhow::Result<()> {
        self.record(format!("fallback:{}:{buffered}", attempt.bytes.received))
    }
}

struct Harness {
    client: DuplexStream,
    completion: oneshot::Receiver<Completion>,
    accepted: Arc<Mutex<Vec<Descriptor>>>,
    logger: Arc<RecordingLogger>,
    task: JoinHandle<Result<(), OrchestratorError>>,
}

fn launch(
    script: ModernScript,
    classic_read: usize,
    classic_succeeds: bool,
    logger: RecordingLogger,
) -> Harness {
    init_tracing();
    let (client, server) = duplex(256);
    let (tx, completion) = oneshot::channel();
    let accepted = Arc::new(Mutex::new(Vec::new()));
    let logger = Arc::new(logger);

    let orchestrator = HandshakeOrchestrator::new(
        ScriptedModern { script },
        ScriptedClassic {
            read: classic_read,
            succeed: classic_succeeds,
            accepted: accepted.clone(),
        },
        tx,
    )
    .with_logger(logger.clone());
    let task = tokio::spawn(orchestrator.run(RawConnection::new(server, DESCRIPTOR)));

    Harness {
        client,
        completion,
        accepted,
        logger,
        task,
    }
}

impl Harness {
    async fn finish(self) -> (Completion, Vec<Descriptor>, Vec<String>, DuplexStream) {
        let completion = self.completion.await.expect("callback invoked");
        self.task
            .await
            .expect("orchestrator task")
            .expect("orchestrator lifecycle");
        let accepted = self.accepted.lock().clone();
        (completion, accepted, self.logger.events(), self.client)
    }
}

fn expect_ready(completion: Completion) -> ConnectionReady<SecureTransport<Session, Session>> {
    match completion {
        HandshakeCompletion::Ready(ready) => ready,
        other => panic!("expected a ready connection, got {other:?}"),
    }
}

fn expect_error(completion: Completion) -> (Option<RawConnection<DuplexStream>>, HandshakeError) {
    match completion {
        HandshakeCompletion::Error { connection, error } => (connection, error),
        other => panic!("expected a handshake error, got {other:?}"),
    }
}

#[tokio::test]
async fn modern_client_completes_without_touching_classic() {
    let harness = launch(ModernScript::Succeed, 0, true, RecordingLogger::default());
    let (completion, accepted, events, _client) = harness.finish().await;

    let ready = expect_ready(completion);
    assert!(matches!(ready.transport, SecureTransport::Modern(_)));
    assert_eq!(ready.application_protocol.as_deref(), Some("h2"));
    assert!(ready.info.secure());
    assert_eq!(ready.info.security_type(), SecurityType::ModernTls);
    assert_eq!(ready.info.negotiated_extension_param(), Some(7));
    assert_eq!(ready.info.application_protocol(), Some("h2"));
    assert!(accepted.is_empty());
    assert_eq!(events, vec!["success:h2".to_string()]);
}

#[tokio::test]
async fn legacy_client_falls_back_and_replays_every_byte() {
    let mut harness = launch(
        ModernScript::Fallback {
            read: 15,
            delay: Duration::from_millis(20),
        },
        20,
        true,
        RecordingLogger::default(),
    );
    harness
        .client
        .write_all(LEGACY_GREETING)
        .await
        .expect("client write");

    let (completion, accepted, events, _client) = harness.finish().await;
    let ready = expect_ready(completion);

    assert_eq!(accepted, vec![DESCRIPTOR]);
    assert_eq!(ready.info.security_type(), SecurityType::ClassicTls);
    assert_eq!(ready.info.negotiated_extension_param(), None);
    assert_eq!(ready.application_protocol.as_deref(), Some("http/1.1"));
    assert!(ready.info.ssl_setup_time() >= Duration::from_millis(20));
    assert_eq!(events, vec!["fallback:15:15".to_string()]);

    let session = match ready.transport {
        SecureTransport::Classic(session) => session,
        SecureTransport::Modern(_) => panic!("expected the classic transport"),
    };
    assert_eq!(session.received, LEGACY_GREETING.to_vec());
    assert_eq!(session.connection.descriptor(), DESCRIPTOR);
    assert_eq!(session.connection.byte_counts().received, 20);
}

#[tokio::test]
async fn modern_failure_is_final() {
    let harness = launch(ModernScript::Fail, 0, true, RecordingLogger::default());
    let (completion, accepted, events, _client) = harness.finish().await;

    let (connection, error) = expect_error(completion);
    assert_eq!(error.kind(), HandshakeErrorKind::ModernHandshakeFailure);
    assert_eq!(error.phase(), HandshakePhase::Modern);
    assert!(matches!(error.cause(), EngineError::Protocol(_)));
    assert_eq!(connection.map(|conn| conn.descriptor()), Some(DESCRIPTOR));
    assert!(accepted.is_empty(), "classic engine must not be constructed");
    assert_eq!(events, vec!["error:modern".to_string()]);
}

#[tokio::test]
async fn classic_failure_after_fallback_counts_both_attempts() {
    let mut harness = launch(
        ModernScript::Fallback {
            read: 6,
            delay: Duration::from_millis(30),
        },
        10,
        false,
        RecordingLogger::default(),
    );
    harness
        .client
        .write_all(b"0123456789")
        .await
        .expect("client write");

    let (completion, accepted, events, _client) = harness.finish().await;
    let (connection, error) = expect_error(completion);

    assert_eq!(accepted, vec![DESCRIPTOR]);
    assert_eq!(error.kind(), HandshakeErrorKind::ClassicHandshakeFailure);
    assert_eq!(error.phase(), HandshakePhase::Classic);
    assert_eq!(error.bytes_received(), 10);
    assert_eq!(error.bytes_sent(), 0);
    // Timed from the original accept, not from the start of the classic attempt.
    assert!(error.elapsed() >= Duration::from_millis(30));
    assert!(connection.is_some());
    assert!(error
        .to_string()
        .contains("10 bytes received & 0 bytes sent"));
    // Classic failures are not reported to the logger.
    assert_eq!(events, vec!["fallback:6:6".to_string()]);
}

#[tokio::test]
async fn transport_failures_are_classified_apart() {
    let harness = launch(ModernScript::ResetByPeer, 0, true, RecordingLogger::default());
    let (completion, accepted, _events, _client) = harness.finish().await;

    let (_, error) = expect_error(completion);
    assert_eq!(error.kind(), HandshakeErrorKind::TransportError);
    assert_eq!(error.phase(), HandshakePhase::Modern);
    assert!(accepted.is_empty());
}

#[tokio::test]
async fn fallback_on_a_different_socket_is_rejected() {
    let harness = launch(
        ModernScript::FallbackOnOtherSocket,
        0,
        true,
        RecordingLogger::default(),
    );
    let (completion, accepted, _events, _client) = harness.finish().await;

    let (connection, error) = expect_error(completion);
    assert_eq!(error.kind(), HandshakeErrorKind::TransportError);
    assert!(matches!(
        error.cause(),
        EngineError::DescriptorMismatch { expected, actual }
            if *expected == DESCRIPTOR && *actual == Descriptor::new(99)
    ));
    assert!(connection.is_some());
    assert!(accepted.is_empty());
}

#[tokio::test]
async fn failing_logger_does_not_change_the_outcome() {
    let harness = launch(ModernScript::Succeed, 0, true, RecordingLogger::broken());
    let (completion, _accepted, events, _client) = harness.finish().await;

    let ready = expect_ready(completion);
    assert_eq!(ready.info.security_type(), SecurityType::ModernTls);
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn abandoning_the_handshake_closes_the_socket_silently() {
    let mut harness = launch(ModernScript::Stall, 0, true, RecordingLogger::default());
    tokio::time::sleep(Duration::from_millis(10)).await;

    harness.task.abort();
    let joined = harness.task.await;
    assert!(joined.expect_err("task aborted").is_cancelled());

    assert!(
        harness.completion.await.is_err(),
        "callback must not run after abandonment"
    );
    let mut buf = [0u8; 1];
    let read = harness
        .client
        .read(&mut buf)
        .await
        .expect("read after abandonment");
    assert_eq!(read, 0, "server side of the socket must be closed");
    assert!(harness.accepted.lock().is_empty());
    assert!(harness.logger.events().is_empty());
}

#[tokio::test]
async fn abandoning_after_fallback_closes_the_socket_silently() {
    // The classic engine waits for more bytes than the client ever sends.
    let mut harness = launch(
        ModernScript::Fallback {
            read: 6,
            delay: Duration::ZERO,
        },
        64,
        true,
        RecordingLogger::default(),
    );
    harness
        .client
        .write_all(b"0123456789")
        .await
        .expect("client write");

    tokio::time::timeout(Duration::from_secs(5), async {
        while harness.accepted.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("classic engine constructed");

    harness.task.abort();
    let joined = harness.task.await;
    assert!(joined.expect_err("task aborted").is_cancelled());

    assert!(
        harness.completion.await.is_err(),
        "callback must not run after abandonment"
    );
    let mut buf = [0u8; 1];
    let read = harness
        .client
        .read(&mut buf)
        .await
        .expect("read after abandonment");
    assert_eq!(read, 0, "server side of the socket must be closed");
    assert_eq!(*harness.accepted.lock(), vec![DESCRIPTOR]);
    assert_eq!(harness.logger.events(), vec!["fallback:6:6".to_string()]);
}

#[tokio::test]
async fn second_start_is_refused() {
    let (tx, _completion) = oneshot::channel::<Completion>();
    let mut orchestrator = HandshakeOrchestrator::new(
        ScriptedModern {
            script: ModernScript::Stall,
        },
        ScriptedClassic {
            read: 0,
            succeed: true,
            accepted: Arc::default(),
        },
        tx,
    );
    let (first, _a) = duplex(16);
    let (second, _b) = duplex(16);

    orchestrator
        .start(RawConnection::new(first, DESCRIPTOR))
        .expect("first start");
    assert_eq!(
        orchestrator.start(RawConnection::new(second, Descriptor::new(7))),
        Err(OrchestratorError::AlreadyStarted)
    );
}
