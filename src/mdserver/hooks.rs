//! Lifecycle hooks the metadata client hands to its collaborators.
//!
//! One small type plays three parts: connection handler for the reconnect
//! loop, refresh handler for the auth token, and the served protocol for
//! server pushes. It holds only a weak reference so the client can be
//! dropped while a connection or refresh task still has the hooks.

use async_trait::async_trait;
use rmpv::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::wire::{self, AuthenticateArg, FolderPushArg, GetFoldersForRekeyArg};
use super::Inner;
use crate::auth::AuthTokenRefreshHandler;
use crate::connection::{ConnectionHandler, DisconnectStatus};
use crate::error::MdServerError;
use crate::rpc::{call_typed, from_record, GenericClient, LocalServer, Protocol};
use crate::types::{MetadataRevision, TlfId};

pub(super) struct Hooks {
    pub(super) inner: Weak<Inner>,
}

impl Hooks {
    fn upgrade(&self) -> Result<Arc<Inner>, MdServerError> {
        self.inner.upgrade().ok_or(MdServerError::ShutDown)
    }

    /// Ask the server to push rekey requests for folders this device can
    /// help with. Replies arrive later as `folderNeedsRekey` pushes.
    async fn request_folders_for_rekey(inner: &Inner, client: &dyn GenericClient) -> Result<(), MdServerError> {
        let device_kid = inner.keys.current_crypt_public_key().await?;
        call_typed::<_, ()>(client, wire::GET_FOLDERS_FOR_REKEY, &GetFoldersForRekeyArg { device_kid }).await
    }

    /// Drop everything that only makes sense on a live connection.
    async fn tear_down(inner: &Inner) {
        let cancelled = inner.observers.cancel_all();
        if cancelled > 0 {
            debug!(observers = cancelled, "Cancelled folder observers");
        }
        inner.ping.stop().await;
        inner.auth.shutdown();
    }
}

/// A push names its folder by hex ID; anything else is the server's mistake.
fn parse_push(arg: Value) -> Result<(TlfId, MetadataRevision), MdServerError> {
    let push: FolderPushArg = from_record(arg).map_err(|e| MdServerError::BadRequest(e.to_string()))?;
    let id = push
        .folder_id
        .parse::<TlfId>()
        .map_err(|_| MdServerError::BadRequest("Invalid folder ID".into()))?;
    Ok((id, MetadataRevision(push.revision)))
}

#[async_trait]
impl ConnectionHandler for Hooks {
    async fn on_connect(&self, client: Arc<dyn GenericClient>, server: &LocalServer) -> Result<(), MdServerError> {
        let inner = self.upgrade()?;

        let signature = inner.auth.sign().await?;
        let ping_secs: i64 = call_typed(&*client, wire::AUTHENTICATE, &AuthenticateArg { signature }).await?;

        let pushes = Arc::new(Hooks {
            inner: Weak::clone(&self.inner),
        });
        match server.register(pushes) {
            Ok(()) | Err(MdServerError::AlreadyRegistered(_)) => {}
            Err(e) => return Err(e),
        }

        // Best effort: a missed rekey catch-up is repaired on the next connect
        if let Err(e) = Self::request_folders_for_rekey(&inner, &*client).await {
            warn!(error = %e, "getFoldersForRekey failed");
        }

        let interval = Duration::from_secs(u64::try_from(ping_secs).unwrap_or(0));
        inner.ping.reset(interval, client).await;

        info!(ping_interval_secs = ping_secs, "Authenticated to metadata server");
        Ok(())
    }

    async fn on_connect_error(&self, err: &MdServerError, wait: Duration) {
        debug!(error = %err, wait_ms = wait.as_millis() as u64, "Connect error hook");
        if let Ok(inner) = self.upgrade() {
            Self::tear_down(&inner).await;
        }
    }

    async fn on_disconnected(&self, status: DisconnectStatus) {
        debug!(status = %status, "Disconnected hook");
        if let Ok(inner) = self.upgrade() {
            Self::tear_down(&inner).await;
        }
    }

    fn on_do_command_error(&self, err: &MdServerError, wait: Duration) {
        warn!(error = %err, wait_ms = wait.as_millis() as u64, "Metadata server command error");
    }

    fn should_throttle(&self, err: &MdServerError) -> bool {
        err.is_throttle()
    }
}

#[async_trait]
impl AuthTokenRefreshHandler for Hooks {
    async fn refresh_auth_token(&self, cancel: &CancellationToken) {
        let Ok(inner) = self.upgrade() else {
            return;
        };

        let signature = match inner.auth.sign().await {
            Ok(signature) => signature,
            Err(e) => {
                debug!(error = %e, "Failed to sign refreshed token");
                return;
            }
        };

        let arg = &AuthenticateArg { signature };
        let result = inner
            .conn
            .do_command(cancel, move |client| async move {
                call_typed::<_, i64>(&*client, wire::AUTHENTICATE, arg).await
            })
            .await;

        match result {
            Ok(_) => debug!("Re-authenticated with refreshed token"),
            Err(e) => debug!(error = %e, "Failed to re-authenticate with refreshed token"),
        }
    }
}

#[async_trait]
impl Protocol for Hooks {
    fn name(&self) -> &'static str {
        wire::UPDATE_PROTOCOL
    }

    async fn serve(&self, method: &str, arg: Value) -> Result<Value, MdServerError> {
        let inner = self.upgrade()?;
        match method {
            wire::METADATA_UPDATE => {
                let (id, revision) = parse_push(arg)?;
                if !inner.observers.signal(&id) {
                    debug!(folder = %id, revision = revision.number(), "Update for unobserved folder");
                }
                Ok(Value::Nil)
            }
            wire::FOLDER_NEEDS_REKEY => {
                let (id, revision) = parse_push(arg)?;
                match &inner.rekey {
                    Some(observer) => observer.folder_needs_rekey(id, revision),
                    None => debug!(folder = %id, "Folder needs rekey"),
                }
                Ok(Value::Nil)
            }
            other => Err(MdServerError::UnknownMethod(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::to_record;

    fn push(folder_id: &str) -> Value {
        to_record(&FolderPushArg {
            folder_id: folder_id.into(),
            revision: 12,
        })
        .unwrap()
    }

    #[test]
    fn test_parse_push_accepts_hex_folder() {
        let (id, revision) = parse_push(push("000102030405060708090a0b0c0d0e16")).unwrap();
        assert_eq!(id.to_string(), "000102030405060708090a0b0c0d0e16");
        assert_eq!(revision, MetadataRevision(12));
    }

    #[test]
    fn test_parse_push_rejects_bad_folder() {
        for bad in ["", "zz", "00000000000000000000000000000000"] {
            let err = parse_push(push(bad)).unwrap_err();
            assert!(matches!(err, MdServerError::BadRequest(_)), "{bad}: {err:?}");
        }
    }

    #[test]
    fn test_parse_push_rejects_wrong_shape() {
        let err = parse_push(Value::from("not a record")).unwrap_err();
        assert!(matches!(err, MdServerError::BadRequest(_)));
    }
}
