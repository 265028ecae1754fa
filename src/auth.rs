//! Metadata Server Authentication
//!
//! Single responsibility: Produce signed authentication tokens and keep them
//! fresh for as long as a connection may need them.
//!
//! # Authentication Flow
//!
//! 1. **Sign a Token**
//!    - Build a payload naming the server, the client and a fresh challenge
//!    - Hand it to the embedder's [`Signer`]
//!
//! 2. **Present It**
//!    - The connection's on-connect hook sends the signature with
//!      `authenticate` and gets back the ping interval
//!
//! 3. **Refresh Before Expiry**
//!    - After a successful sign, a background task wakes every TTL/2 and
//!      asks the [`AuthTokenRefreshHandler`] to re-authenticate the open
//!      connection
//!
//! The crate never inspects signatures; key handling lives with the signer.

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::MdServerError;

/// Produces a signature over an authentication payload.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, payload: &[u8]) -> Result<String, MdServerError>;
}

/// Re-authenticates an already-open connection when the token is refreshed.
#[async_trait]
pub trait AuthTokenRefreshHandler: Send + Sync {
    /// `cancel` fires when the token is shut down.
    async fn refresh_auth_token(&self, cancel: &CancellationToken);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// The signed body of an authentication token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub server: String,
    pub challenge: String,
    pub client: ClientInfo,
    pub ctime: i64,
    pub expire_in: u64,
}

/// Longest wait between refreshes, whatever the TTL.
pub const MAX_REFRESH_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

struct RefreshTask {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// An authentication token bound to one server type and TTL.
pub struct AuthToken {
    server: String,
    expire_in: Duration,
    client: ClientInfo,
    signer: Arc<dyn Signer>,
    refresh_handler: Arc<dyn AuthTokenRefreshHandler>,
    refresh: Mutex<Option<RefreshTask>>,
}

impl AuthToken {
    pub fn new(
        server: impl Into<String>,
        expire_in: Duration,
        client_name: impl Into<String>,
        client_version: impl Into<String>,
        signer: Arc<dyn Signer>,
        refresh_handler: Arc<dyn AuthTokenRefreshHandler>,
    ) -> Self {
        Self {
            server: server.into(),
            expire_in,
            client: ClientInfo {
                name: client_name.into(),
                version: client_version.into(),
            },
            signer,
            refresh_handler,
            refresh: Mutex::new(None),
        }
    }

    /// Build the payload for a new token.
    pub fn payload(&self) -> TokenPayload {
        TokenPayload {
            kind: "auth".to_string(),
            server: self.server.clone(),
            challenge: uuid::Uuid::new_v4().simple().to_string(),
            client: self.client.clone(),
            ctime: chrono::Utc::now().timestamp(),
            expire_in: self.expire_in.as_secs(),
        }
    }

    /// Sign a fresh token and make sure the refresh task is running.
    ///
    /// # Errors
    /// Whatever the signer returns, or a JSON error building the payload.
    pub async fn sign(&self) -> Result<String, MdServerError> {
        let payload = serde_json::to_vec(&self.payload())?;
        let signature = self.signer.sign(&payload).await?;
        self.start_refresh();
        Ok(signature)
    }

    /// Interval between refreshes: half the TTL, capped at
    /// [`MAX_REFRESH_INTERVAL`].
    pub fn refresh_interval(&self) -> Duration {
        (self.expire_in / 2).clamp(Duration::from_millis(1), MAX_REFRESH_INTERVAL)
    }

    pub fn is_refreshing(&self) -> bool {
        self.refresh
            .lock()
            .map(|refresh| refresh.as_ref().is_some_and(|r| !r.task.is_finished()))
            .unwrap_or(false)
    }

    fn start_refresh(&self) {
        let Ok(mut refresh) = self.refresh.lock() else {
            return;
        };
        if refresh.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return;
        }

        let cancel = CancellationToken::new();
        let interval = self.refresh_interval();
        if self.expire_in / 2 > MAX_REFRESH_INTERVAL {
            warn!(
                expire_in_secs = self.expire_in.as_secs(),
                interval_secs = interval.as_secs(),
                "Token TTL out of range, capping refresh interval"
            );
        }
        let handler = Arc::clone(&self.refresh_handler);
        let task_cancel = cancel.clone();

        debug!(interval_ms = interval.as_millis() as u64, "Starting auth token refresh");
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        debug!("Refreshing auth token");
                        handler.refresh_auth_token(&task_cancel).await;
                    }
                }
            }
            debug!("Auth token refresh stopped");
        });

        *refresh = Some(RefreshTask { cancel, task });
    }

    /// Stop the refresh task. Safe to call any number of times, including on
    /// a token that was never signed.
    pub fn shutdown(&self) {
        let task = match self.refresh.lock() {
            Ok(mut refresh) => refresh.take(),
            Err(_) => {
                warn!("Auth token refresh lock poisoned");
                None
            }
        };
        if let Some(RefreshTask { cancel, task }) = task {
            cancel.cancel();
            task.abort();
        }
    }
}

impl Drop for AuthToken {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// [`Signer`] backed by an ed25519 key; signatures are standard base64.
pub struct Ed25519Signer {
    key: ed25519_dalek::SigningKey,
}

impl Ed25519Signer {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            key: ed25519_dalek::SigningKey::from_bytes(&seed),
        }
    }

    /// Parse a hex-encoded 32-byte seed.
    pub fn from_hex(seed: &str) -> Result<Self, MdServerError> {
        let bytes = hex::decode(seed.trim())
            .map_err(|e| MdServerError::Config(format!("Invalid signing seed: {}", e)))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| MdServerError::Config("Signing seed must be 32 bytes".into()))?;
        Ok(Self::from_seed(seed))
    }

    pub fn verifying_key_hex(&self) -> String {
        hex::encode(self.key.verifying_key().to_bytes())
    }
}

#[async_trait]
impl Signer for Ed25519Signer {
    async fn sign(&self, payload: &[u8]) -> Result<String, MdServerError> {
        use ed25519_dalek::Signer as _;
        let signature = self.key.sign(payload);
        Ok(base64::engine::general_purpose::STANDARD.encode(signature.to_bytes()))
    }
}
