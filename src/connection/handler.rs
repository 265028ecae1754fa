//! Lifecycle callbacks implemented by the layer that owns a connection.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::MdServerError;
use crate::rpc::{GenericClient, LocalServer};

/// Why a live connection went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectStatus {
    /// The transport reported the channel closed.
    TransportLost(String),
    /// A command failed with a transport-level error.
    CommandFailed(String),
    /// `shutdown()` was called.
    ShutDown,
}

impl fmt::Display for DisconnectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectStatus::TransportLost(reason) => write!(f, "transport lost: {}", reason),
            DisconnectStatus::CommandFailed(reason) => write!(f, "command failed: {}", reason),
            DisconnectStatus::ShutDown => f.write_str("shut down"),
        }
    }
}

/// Hooks invoked by [`Connection`](super::Connection).
///
/// Everything except `on_connect` is observation only. The reconnect loop
/// awaits these, so they must return promptly.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Runs once per successful dial, before the connection serves ordinary
    /// commands. Use `client` directly here: going through `do_command` would
    /// wait for the very connection being set up.
    ///
    /// An error discards the connection and schedules a reconnect.
    async fn on_connect(
        &self,
        client: Arc<dyn GenericClient>,
        server: &LocalServer,
    ) -> Result<(), MdServerError>;

    /// A dial or `on_connect` failed; the loop sleeps `wait` next.
    async fn on_connect_error(&self, err: &MdServerError, wait: Duration);

    /// A live connection went away.
    async fn on_disconnected(&self, status: DisconnectStatus);

    /// A command hit server back-pressure. Fires only for errors
    /// `should_throttle` accepts; the throttle error then goes back to the
    /// caller without a retry.
    fn on_do_command_error(&self, err: &MdServerError, wait: Duration);

    /// Whether `err` is server back-pressure rather than a failure.
    fn should_throttle(&self, err: &MdServerError) -> bool;
}
