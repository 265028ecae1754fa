//! Reconnecting Connection Manager
//!
//! Single responsibility: keep a live, authenticated channel to the metadata
//! server and run commands against whichever channel is current.
//!
//! # State Machine
//!
//! ```text
//!              ┌──────────────── backoff ◄──────────────┐
//!              ▼                                        │ dial or on_connect failed
//!   Disconnected ──► Connecting ──► dial ──► on_connect ┤
//!         ▲                                             │ ok
//!         │                                             ▼
//!         └──── transport closed / command saw loss ── Connected
//!
//!   any state ── shutdown() ──► ShutDown (terminal)
//! ```
//!
//! Only the reconnect loop moves the state forward. `do_command` may only
//! knock a specific connection (by generation) back to `Disconnected`, which
//! wakes the loop. A connection is published as `Connected` only after
//! `on_connect` succeeded, so no ordinary command ever runs on a channel that
//! has not authenticated.
//!
//! # Command Contract
//!
//! | Outcome of `command`          | `do_command` does                              |
//! |-------------------------------|------------------------------------------------|
//! | `Ok(v)`                       | returns `Ok(v)`                                |
//! | throttle-classified error     | reports it, returns it; connection untouched   |
//! | transport loss                | drops that connection, waits, retries          |
//! | any other error               | returns it; connection untouched               |
//!
//! Cancelling the caller's token only ends that call.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::ReconnectPolicy;
use super::handler::{ConnectionHandler, DisconnectStatus};
use super::transport::{ConnectionTransport, RawChannel};
use crate::error::MdServerError;
use crate::rpc::{GenericClient, LocalServer};

/// Externally visible connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    ShutDown,
}

#[derive(Clone)]
struct Live {
    generation: u64,
    client: Arc<dyn GenericClient>,
}

#[derive(Clone)]
enum State {
    /// Carries the failure that knocked the last connection down, if a
    /// command saw it first.
    Disconnected(Option<String>),
    Connecting,
    Connected(Live),
    ShutDown,
}

impl State {
    fn status(&self) -> ConnectionStatus {
        match self {
            State::Disconnected(_) => ConnectionStatus::Disconnected,
            State::Connecting => ConnectionStatus::Connecting,
            State::Connected(_) => ConnectionStatus::Connected,
            State::ShutDown => ConnectionStatus::ShutDown,
        }
    }

    fn is_live(&self, generation: u64) -> bool {
        matches!(self, State::Connected(live) if live.generation == generation)
    }
}

struct Shared {
    transport: Arc<dyn ConnectionTransport>,
    handler: Arc<dyn ConnectionHandler>,
    policy: ReconnectPolicy,
    server: Arc<LocalServer>,
    state: watch::Sender<State>,
    shutdown: CancellationToken,
}

/// A connection to the metadata server that reconnects by itself.
///
/// # Guarantees
///
/// - At most one live channel at a time; the loop owns it
/// - `on_connect_error` fires once per failed attempt, with the wait it is
///   about to sleep
/// - After `shutdown()`, every pending and future command fails with
///   `MdServerError::ShutDown` and no new channel is dialed
pub struct Connection {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Build a connection manager without dialing yet. Call [`start`](Self::start).
    pub fn new(
        transport: Arc<dyn ConnectionTransport>,
        handler: Arc<dyn ConnectionHandler>,
        policy: ReconnectPolicy,
    ) -> Self {
        let (state, _) = watch::channel(State::Disconnected(None));
        Self {
            shared: Arc::new(Shared {
                transport,
                handler,
                policy,
                server: Arc::new(LocalServer::new()),
                state,
                shutdown: CancellationToken::new(),
            }),
            task: Mutex::new(None),
        }
    }

    /// Build a connection manager and start dialing right away.
    pub fn connect(
        transport: Arc<dyn ConnectionTransport>,
        handler: Arc<dyn ConnectionHandler>,
        policy: ReconnectPolicy,
    ) -> Self {
        let connection = Self::new(transport, handler, policy);
        connection.start();
        connection
    }

    /// Spawn the reconnect loop. Calling it again is a no-op.
    pub fn start(&self) {
        let Ok(mut task) = self.task.lock() else {
            return;
        };
        if task.is_some() || self.shared.shutdown.is_cancelled() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        *task = Some(tokio::spawn(reconnect_loop(shared)));
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.state.borrow().status()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// The table of protocols served to the remote side on every channel.
    pub fn server(&self) -> &Arc<LocalServer> {
        &self.shared.server
    }

    /// Run `command` against the current live channel.
    ///
    /// Waits for a channel if there is none. A command that fails because the
    /// channel died is re-run on the next one, so `command` may be called more
    /// than once; each call gets the client of the channel it runs on.
    ///
    /// # Errors
    /// - `Canceled` when `cancel` fires first
    /// - `ShutDown` once the manager is shut down
    /// - throttle and application errors from `command`, unchanged
    pub async fn do_command<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut command: F,
    ) -> Result<T, MdServerError>
    where
        F: FnMut(Arc<dyn GenericClient>) -> Fut,
        Fut: Future<Output = Result<T, MdServerError>>,
    {
        loop {
            let live = self.shared.wait_for_live(cancel).await?;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(MdServerError::Canceled),
                _ = self.shared.shutdown.cancelled() => return Err(MdServerError::ShutDown),
                result = command(Arc::clone(&live.client)) => result,
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if self.shared.handler.should_throttle(&err) {
                self.shared.handler.on_do_command_error(&err, Duration::ZERO);
                return Err(err);
            }

            if matches!(err, MdServerError::Canceled | MdServerError::ShutDown) {
                return Err(err);
            }

            if err.is_transport_loss() || !self.shared.transport.is_connected() {
                debug!(
                    generation = live.generation,
                    error = %err,
                    "Command lost its connection, retrying after reconnect"
                );
                self.shared.drop_connection(live.generation, err.to_string());
                continue;
            }

            return Err(err);
        }
    }

    /// Stop for good and wait for the reconnect loop to exit.
    pub async fn shutdown(&self) {
        self.shared.begin_shutdown();
        let task = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Reconnect loop ended abnormally");
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.begin_shutdown();
    }
}

impl Shared {
    fn begin_shutdown(&self) {
        self.shutdown.cancel();
        self.state.send_replace(State::ShutDown);
    }

    /// Move to `next` unless already shut down.
    fn transition(&self, next: State) -> bool {
        self.state.send_if_modified(|state| {
            if matches!(state, State::ShutDown) {
                return false;
            }
            *state = next;
            true
        })
    }

    /// Knock down connection `generation` if it is still the live one.
    fn drop_connection(&self, generation: u64, reason: String) {
        self.state.send_if_modified(|state| {
            if !state.is_live(generation) {
                return false;
            }
            *state = State::Disconnected(Some(reason));
            true
        });
    }

    async fn wait_for_live(&self, cancel: &CancellationToken) -> Result<Live, MdServerError> {
        let mut state = self.state.subscribe();
        let ready = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(MdServerError::Canceled),
            ready = state.wait_for(|s| matches!(s, State::Connected(_) | State::ShutDown)) => {
                ready.map(|s| (*s).clone())
            }
        };

        match ready {
            Ok(State::Connected(live)) => Ok(live),
            _ => Err(MdServerError::ShutDown),
        }
    }

    /// Dial, then run the on-connect hook. Either failing is a connect error.
    async fn establish(&self) -> Result<RawChannel, MdServerError> {
        let channel = self.transport.dial(Arc::clone(&self.server)).await?;
        debug!("Transport dialed, running on-connect hook");

        if let Err(e) = self
            .handler
            .on_connect(Arc::clone(&channel.client), &self.server)
            .await
        {
            self.transport.close();
            return Err(e);
        }
        Ok(channel)
    }

    /// Wait until connection `generation` ends, and say why.
    async fn watch_connection(
        &self,
        generation: u64,
        closed: oneshot::Receiver<String>,
    ) -> DisconnectStatus {
        let mut state = self.state.subscribe();
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => DisconnectStatus::ShutDown,
            reason = closed => DisconnectStatus::TransportLost(
                reason.unwrap_or_else(|_| "channel closed".to_string()),
            ),
            reason = wait_until_not_live(&mut state, generation) => {
                DisconnectStatus::CommandFailed(reason)
            }
        }
    }
}

async fn wait_until_not_live(state: &mut watch::Receiver<State>, generation: u64) -> String {
    match state.wait_for(|s| !s.is_live(generation)).await {
        Ok(current) => match &*current {
            State::Disconnected(Some(reason)) => reason.clone(),
            _ => "connection dropped".to_string(),
        },
        Err(_) => "connection manager dropped".to_string(),
    }
}

/// Dial, serve, and re-dial until shut down.
async fn reconnect_loop(shared: Arc<Shared>) {
    let mut generation = 0u64;
    let mut failures = 0u32;

    while !shared.shutdown.is_cancelled() {
        shared.transition(State::Connecting);
        info!(attempt = failures + 1, "Connecting to metadata server");

        let attempt = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            attempt = shared.establish() => attempt,
        };

        match attempt {
            Ok(RawChannel { client, closed }) => {
                failures = 0;
                generation += 1;

                if !shared.transition(State::Connected(Live { generation, client })) {
                    break;
                }
                info!(generation = generation, "Connected to metadata server");

                let status = shared.watch_connection(generation, closed).await;

                shared.transition(State::Disconnected(None));
                shared.transport.close();
                match &status {
                    DisconnectStatus::ShutDown => {
                        info!(generation = generation, "Metadata server connection shut down")
                    }
                    other => {
                        warn!(generation = generation, reason = %other, "Disconnected from metadata server")
                    }
                }
                shared.handler.on_disconnected(status).await;
            }
            Err(err) => {
                if shared.shutdown.is_cancelled() {
                    break;
                }
                failures = failures.saturating_add(1);
                let wait = shared.policy.backoff_for_attempt(failures);
                shared.transition(State::Disconnected(None));

                warn!(
                    error = %err,
                    attempt = failures,
                    wait_ms = wait.as_millis() as u64,
                    "Metadata server connect failed"
                );
                shared.handler.on_connect_error(&err, wait).await;

                tokio::select! {
                    biased;
                    _ = shared.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }
    }

    shared.transport.close();
    shared.state.send_replace(State::ShutDown);
    shared.transport.finalize();
    debug!("Reconnect loop ended");
}
