//! Keep-alive ticker.
//!
//! One background task per live connection sends a no-op probe at the
//! interval the server asked for. Probe failures are logged and nothing
//! else: noticing a dead channel is the transport's job.
//!
//! `reset` cancels the previous task and waits for it to finish before
//! starting the next, so two tickers never overlap.

use rmpv::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::rpc::GenericClient;

/// Longest interval a ticker accepts. Larger server values are capped.
pub const MAX_PING_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Decrements the live-task count when the task ends, however it ends.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn enter(count: &Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(count))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct PingTicker {
    method: &'static str,
    running: Mutex<Option<Running>>,
    active: Arc<AtomicUsize>,
}

impl PingTicker {
    /// `method` is the remote procedure used as the probe.
    pub fn new(method: &'static str) -> Self {
        Self {
            method,
            running: Mutex::new(None),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Replace the current ticker with one probing `client` every `interval`.
    /// A zero interval only stops the current ticker. Intervals above
    /// [`MAX_PING_INTERVAL`] are capped to it.
    pub async fn reset(&self, interval: Duration, client: Arc<dyn GenericClient>) {
        let mut running = self.running.lock().await;
        if let Some(previous) = running.take() {
            stop_and_join(previous).await;
        }
        if interval.is_zero() {
            return;
        }
        let interval = if interval > MAX_PING_INTERVAL {
            warn!(
                requested_secs = interval.as_secs(),
                max_secs = MAX_PING_INTERVAL.as_secs(),
                "Ping interval out of range, capping"
            );
            MAX_PING_INTERVAL
        } else {
            interval
        };

        debug!(interval_secs = interval.as_secs(), "Starting new ping ticker");

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let method = self.method;
        let guard = ActiveGuard::enter(&self.active);

        let task = tokio::spawn(async move {
            let _guard = guard;
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let probe = tokio::select! {
                            biased;
                            _ = task_cancel.cancelled() => break,
                            probe = client.call(method, Value::Nil) => probe,
                        };
                        if let Err(e) = probe {
                            debug!(error = %e, "Ping error");
                        }
                    }
                }
            }
            debug!("Stopping ping ticker");
        });

        *running = Some(Running { cancel, task });
    }

    /// Stop the current ticker, if any, and wait for it to finish.
    pub async fn stop(&self) {
        let previous = self.running.lock().await.take();
        if let Some(previous) = previous {
            stop_and_join(previous).await;
        }
    }

    /// Number of ticker tasks currently alive. Never more than one.
    pub fn active_tasks(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.active_tasks() > 0
    }
}

impl Drop for PingTicker {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
            running.task.abort();
        }
    }
}

async fn stop_and_join(running: Running) {
    running.cancel.cancel();
    if let Err(e) = running.task.await {
        if !e.is_cancelled() {
            debug!(error = %e, "Ping ticker ended abnormally");
        }
    }
}
