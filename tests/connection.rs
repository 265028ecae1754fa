//! Integration tests for the reconnecting connection manager
//!
//! A scripted in-process transport stands in for the network, so every
//! dial failure and channel loss happens exactly when a test says so.

use async_trait::async_trait;
use mdserver_link::{
    Connection, ConnectionHandler, ConnectionStatus, ConnectionTransport, DisconnectStatus, GenericClient,
    LocalServer, MdServerError, RawChannel, ReconnectPolicy,
};
use rmpv::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Answers every call with the number of the connection it was made on.
struct GenerationClient {
    generation: u64,
}

#[async_trait]
impl GenericClient for GenerationClient {
    async fn call(&self, _method: &str, _arg: Value) -> Result<Value, MdServerError> {
        Ok(Value::from(self.generation))
    }
}

/// Transport whose first `failures` dials are refused.
#[derive(Default)]
struct ScriptedTransport {
    failures: AtomicUsize,
    dials: AtomicUsize,
    successes: AtomicUsize,
    closes: AtomicUsize,
    finalized: AtomicBool,
    connected: AtomicBool,
    closed_tx: Mutex<Option<oneshot::Sender<String>>>,
}

impl ScriptedTransport {
    fn failing(failures: usize) -> Arc<Self> {
        let transport = Self::default();
        transport.failures.store(failures, Ordering::SeqCst);
        Arc::new(transport)
    }

    /// Simulate the network dropping the current channel.
    fn sever(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(tx) = self.closed_tx.lock().unwrap().take() {
            let _ = tx.send("severed".to_string());
        }
    }
}

#[async_trait]
impl ConnectionTransport for ScriptedTransport {
    async fn dial(&self, _server: Arc<LocalServer>) -> Result<RawChannel, MdServerError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(MdServerError::Connection("connection refused".into()));
        }

        let generation = self.successes.fetch_add(1, Ordering::SeqCst) as u64 + 1;
        let (tx, rx) = oneshot::channel();
        *self.closed_tx.lock().unwrap() = Some(tx);
        self.connected.store(true, Ordering::SeqCst);
        Ok(RawChannel {
            client: Arc::new(GenerationClient { generation }),
            closed: rx,
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    fn finalize(&self) {
        self.finalized.store(true, Ordering::SeqCst);
    }
}

/// Records every hook invocation in order.
#[derive(Default)]
struct RecordingHandler {
    events: Mutex<Vec<String>>,
    connect_waits: Mutex<Vec<Duration>>,
    disconnects: Mutex<Vec<DisconnectStatus>>,
    command_errors: AtomicUsize,
    reject_connects: AtomicUsize,
}

impl RecordingHandler {
    fn event(&self, name: &str) {
        self.events.lock().unwrap().push(name.to_string());
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|e| *e == name).count()
    }
}

#[async_trait]
impl ConnectionHandler for RecordingHandler {
    async fn on_connect(&self, _client: Arc<dyn GenericClient>, _server: &LocalServer) -> Result<(), MdServerError> {
        let rejected = self
            .reject_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if rejected {
            self.event("auth_rejected");
            return Err(MdServerError::Auth("bad signature".into()));
        }
        self.event("connect");
        Ok(())
    }

    async fn on_connect_error(&self, _err: &MdServerError, wait: Duration) {
        self.event("connect_error");
        self.connect_waits.lock().unwrap().push(wait);
    }

    async fn on_disconnected(&self, status: DisconnectStatus) {
        self.event("disconnected");
        self.disconnects.lock().unwrap().push(status);
    }

    fn on_do_command_error(&self, _err: &MdServerError, _wait: Duration) {
        self.command_errors.fetch_add(1, Ordering::SeqCst);
    }

    fn should_throttle(&self, err: &MdServerError) -> bool {
        err.is_throttle()
    }
}

fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        initial_backoff_ms: 10,
        max_backoff_ms: 1_000,
        multiplier: 2.0,
    }
}

/// Poll `condition` until it holds, failing the test after two seconds.
async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn generation_of(client: Arc<dyn GenericClient>) -> Result<u64, MdServerError> {
    let value = client.call("test.generation", Value::Nil).await?;
    value
        .as_u64()
        .ok_or_else(|| MdServerError::Protocol("not a number".into()))
}

/// Two refused dials, then success: hooks fire in order before the command runs
#[tokio::test]
async fn test_dial_failures_then_success() {
    let transport = ScriptedTransport::failing(2);
    let handler = Arc::new(RecordingHandler::default());
    let connection = Connection::connect(transport.clone(), handler.clone(), fast_policy());

    let cancel = CancellationToken::new();
    let events = handler.clone();
    let generation = connection
        .do_command(&cancel, |client| {
            events.event("command");
            generation_of(client)
        })
        .await
        .unwrap();

    assert_eq!(generation, 1);
    assert_eq!(handler.events(), vec!["connect_error", "connect_error", "connect", "command"]);
    assert_eq!(
        *handler.connect_waits.lock().unwrap(),
        vec![Duration::from_millis(10), Duration::from_millis(20)]
    );
    assert_eq!(transport.dials.load(Ordering::SeqCst), 3);

    connection.shutdown().await;
}

/// Throttling goes straight back to the caller and leaves the channel up
#[tokio::test]
async fn test_throttle_is_not_retried() {
    let transport = ScriptedTransport::failing(0);
    let handler = Arc::new(RecordingHandler::default());
    let connection = Connection::connect(transport.clone(), handler.clone(), fast_policy());

    let cancel = CancellationToken::new();
    let attempts = AtomicUsize::new(0);
    let result: Result<(), _> = connection
        .do_command(&cancel, |_client| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(MdServerError::Throttle("slow down".into())) }
        })
        .await;

    assert!(matches!(result, Err(MdServerError::Throttle(_))));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(handler.command_errors.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(handler.count("disconnected"), 0);
    assert_eq!(transport.dials.load(Ordering::SeqCst), 1);
    assert_eq!(connection.status(), ConnectionStatus::Connected);

    connection.shutdown().await;
}

/// A command that loses its channel is re-run on the next one
#[tokio::test]
async fn test_transport_loss_is_retried_transparently() {
    let transport = ScriptedTransport::failing(0);
    let handler = Arc::new(RecordingHandler::default());
    let connection = Connection::connect(transport.clone(), handler.clone(), fast_policy());

    let cancel = CancellationToken::new();
    let attempts = AtomicUsize::new(0);
    let severing = transport.clone();
    let generation = connection
        .do_command(&cancel, |client| {
            let first = attempts.fetch_add(1, Ordering::SeqCst) == 0;
            let severing = severing.clone();
            async move {
                if first {
                    severing.sever();
                    return Err(MdServerError::Connection("broken pipe".into()));
                }
                generation_of(client).await
            }
        })
        .await
        .unwrap();

    assert_eq!(generation, 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(handler.count("connect"), 2);
    assert_eq!(handler.count("disconnected"), 1);
    assert_eq!(handler.command_errors.load(Ordering::SeqCst), 0);

    connection.shutdown().await;
}

/// Remote rejections come back as is, without touching the channel
#[tokio::test]
async fn test_application_error_is_returned() {
    let transport = ScriptedTransport::failing(0);
    let handler = Arc::new(RecordingHandler::default());
    let connection = Connection::connect(transport.clone(), handler.clone(), fast_policy());

    let cancel = CancellationToken::new();
    let attempts = AtomicUsize::new(0);
    let result: Result<(), _> = connection
        .do_command(&cancel, |_client| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err(MdServerError::Remote {
                    code: 2802,
                    name: "CONFLICT".into(),
                    desc: "revision conflict".into(),
                })
            }
        })
        .await;

    assert!(matches!(result, Err(MdServerError::Remote { code: 2802, .. })));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(handler.count("disconnected"), 0);
    // The command error hook is reserved for throttling
    assert_eq!(handler.command_errors.load(Ordering::SeqCst), 0);
    assert!(connection.is_connected());

    connection.shutdown().await;
}

/// Cancelling a waiting caller ends only that call
#[tokio::test]
async fn test_cancel_while_waiting_for_connection() {
    let transport = ScriptedTransport::failing(1);
    let handler = Arc::new(RecordingHandler::default());
    let policy = ReconnectPolicy::constant(Duration::from_millis(150));
    let connection = Connection::connect(transport.clone(), handler.clone(), policy);

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let started = tokio::time::Instant::now();
    let result = connection.do_command(&cancel, generation_of).await;
    assert!(matches!(result, Err(MdServerError::Canceled)));
    assert!(started.elapsed() < Duration::from_millis(140));

    // A later caller still gets through once the retry connects
    let fresh = CancellationToken::new();
    let generation = connection.do_command(&fresh, generation_of).await.unwrap();
    assert_eq!(generation, 1);
    assert_eq!(handler.count("connect_error"), 1);

    connection.shutdown().await;
}

/// A rejected on-connect hook is a failed attempt, not a connection
#[tokio::test]
async fn test_on_connect_failure_counts_as_connect_error() {
    let transport = ScriptedTransport::failing(0);
    let handler = Arc::new(RecordingHandler::default());
    handler.reject_connects.store(1, Ordering::SeqCst);
    let connection = Connection::connect(transport.clone(), handler.clone(), fast_policy());

    let cancel = CancellationToken::new();
    let generation = connection.do_command(&cancel, generation_of).await.unwrap();

    assert_eq!(generation, 2);
    assert_eq!(handler.events(), vec!["auth_rejected", "connect_error", "connect"]);
    assert!(transport.closes.load(Ordering::SeqCst) >= 1);
    assert_eq!(handler.count("disconnected"), 0);

    connection.shutdown().await;
}

/// The transport noticing a dead channel triggers a disconnect and a redial
#[tokio::test]
async fn test_closed_channel_reconnects() {
    let transport = ScriptedTransport::failing(0);
    let handler = Arc::new(RecordingHandler::default());
    let connection = Connection::connect(transport.clone(), handler.clone(), fast_policy());

    eventually("first connect", || connection.is_connected()).await;
    transport.sever();

    eventually("redial", || transport.successes.load(Ordering::SeqCst) == 2).await;
    eventually("reconnected", || connection.is_connected()).await;

    assert_eq!(handler.count("disconnected"), 1);
    assert!(matches!(
        handler.disconnects.lock().unwrap()[0],
        DisconnectStatus::TransportLost(_)
    ));

    let cancel = CancellationToken::new();
    assert_eq!(connection.do_command(&cancel, generation_of).await.unwrap(), 2);

    connection.shutdown().await;
}

/// Shutdown fails waiting and later callers and never redials
#[tokio::test]
async fn test_shutdown_fails_fast() {
    let transport = ScriptedTransport::failing(usize::MAX);
    let handler = Arc::new(RecordingHandler::default());
    let connection = Arc::new(Connection::connect(transport.clone(), handler.clone(), fast_policy()));

    let waiting = {
        let connection = connection.clone();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            connection.do_command(&cancel, generation_of).await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    connection.shutdown().await;
    let result = tokio::time::timeout(Duration::from_secs(1), waiting)
        .await
        .expect("waiting command should finish")
        .unwrap();
    assert!(matches!(result, Err(MdServerError::ShutDown)));

    let cancel = CancellationToken::new();
    let later = connection.do_command(&cancel, generation_of).await;
    assert!(matches!(later, Err(MdServerError::ShutDown)));
    assert_eq!(connection.status(), ConnectionStatus::ShutDown);
    assert!(transport.finalized.load(Ordering::SeqCst));

    let dials = transport.dials.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.dials.load(Ordering::SeqCst), dials);
}

/// Shutting down a live connection reports it to the handler
#[tokio::test]
async fn test_shutdown_of_live_connection() {
    let transport = ScriptedTransport::failing(0);
    let handler = Arc::new(RecordingHandler::default());
    let connection = Connection::connect(transport.clone(), handler.clone(), fast_policy());

    eventually("connect", || connection.is_connected()).await;
    connection.shutdown().await;

    assert_eq!(
        *handler.disconnects.lock().unwrap(),
        vec![DisconnectStatus::ShutDown]
    );
    assert!(!transport.is_connected());
}
