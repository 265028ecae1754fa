//! Transport capability
//!
//! Single responsibility: produce a raw RPC channel on demand.
//! No knowledge of authentication, retries, or observers.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::error::MdServerError;
use crate::rpc::{GenericClient, LocalServer};

/// A freshly dialed channel.
pub struct RawChannel {
    /// Client for calls on this channel
    pub client: Arc<dyn GenericClient>,
    /// Resolves (with a reason, or by the sender being dropped) when the
    /// transport notices the channel is gone.
    pub closed: oneshot::Receiver<String>,
}

/// Something that can be dialed to produce a raw channel.
///
/// Supplied by the embedder; the connection manager only calls it.
#[async_trait]
pub trait ConnectionTransport: Send + Sync + 'static {
    /// Dial a new channel. Server-initiated calls arriving on it must be
    /// routed to `server`.
    async fn dial(&self, server: Arc<LocalServer>) -> Result<RawChannel, MdServerError>;

    /// Whether the most recently dialed channel is still usable.
    fn is_connected(&self) -> bool;

    /// Tear down the current channel, if any.
    fn close(&self);

    /// Release everything; called once when the manager stops for good.
    fn finalize(&self);
}
