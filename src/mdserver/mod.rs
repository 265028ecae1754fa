//! Metadata Server Client
//!
//! Single responsibility: expose the metadata server's operations as plain
//! async methods, with every call running through the reconnecting
//! [`Connection`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     MetadataClient                        │
//! │  - get / put / prune metadata, key halves                 │
//! │  - register_for_update -> one-shot UpdateReceiver         │
//! └──────────────────────────────────────────────────────────┘
//!              │                              ▲
//!              ▼                              │ pushes
//! ┌──────────────────────────┐   ┌───────────────────────────┐
//! │        Connection        │   │           Hooks           │
//! │  - reconnect loop        │──►│  - sign + authenticate    │
//! │  - do_command            │   │  - ping ticker            │
//! └──────────────────────────┘   │  - observers, rekey       │
//!                                └───────────────────────────┘
//! ```
//!
//! The client keeps no retry logic of its own. A call either returns the
//! server's answer, a throttle or application error, or `Canceled` /
//! `ShutDown`.
//!
//! # Usage
//!
//! ```ignore
//! let client = MetadataClient::new(&config, Collaborators {
//!     transport: Arc::new(WsTransport::from_config(&config)),
//!     signer: Arc::new(Ed25519Signer::from_hex(&seed)?),
//!     keys: Arc::new(StaticKey(device_kid)),
//!     rekey: None,
//! });
//!
//! let updated = client.register_for_update(&cancel, folder, head).await?;
//! match updated.await {
//!     Ok(Ok(())) => { /* fetch the new head */ }
//!     _ => { /* disconnected: register again */ }
//! }
//! ```

mod hooks;
pub mod wire;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::auth::{AuthToken, Signer};
use crate::config::Config;
use crate::connection::{Connection, ConnectionStatus, ConnectionTransport};
use crate::error::MdServerError;
use crate::observers::{ObserverRegistry, UpdateReceiver};
use crate::ping::PingTicker;
use crate::rpc::call_typed;
use crate::types::{
    BranchId, Kid, MergeStatus, MetadataRevision, RootMetadataSigned, TlfCryptKeyServerHalf,
    TlfCryptKeyServerHalfId, TlfHandle, TlfId, Uid,
};
use hooks::Hooks;
use wire::{
    GetKeyArg, GetMetadataArg, KeyHalf, MetadataResponse, PruneBranchArg, PutKeysArg, PutMetadataArg,
    RegisterForUpdatesArg,
};

/// Supplies this device's current crypt public key.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    async fn current_crypt_public_key(&self) -> Result<Kid, MdServerError>;
}

/// Told about folders the server wants rekeyed. Called on the connection's
/// reader task, so it must return quickly.
pub trait RekeyObserver: Send + Sync {
    fn folder_needs_rekey(&self, id: TlfId, revision: MetadataRevision);
}

/// Capabilities the embedder plugs into a [`MetadataClient`].
pub struct Collaborators {
    pub transport: Arc<dyn ConnectionTransport>,
    pub signer: Arc<dyn Signer>,
    pub keys: Arc<dyn KeyProvider>,
    pub rekey: Option<Arc<dyn RekeyObserver>>,
}

pub(crate) struct Inner {
    conn: Connection,
    auth: AuthToken,
    observers: ObserverRegistry,
    ping: PingTicker,
    keys: Arc<dyn KeyProvider>,
    rekey: Option<Arc<dyn RekeyObserver>>,
}

/// Withdraws an observer slot unless the registration went through.
struct PendingRegistration<'a> {
    observers: &'a ObserverRegistry,
    id: TlfId,
    ticket: u64,
    armed: bool,
}

impl Drop for PendingRegistration<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.observers.withdraw(&self.id, self.ticket);
        }
    }
}

/// Client for the folder metadata server.
///
/// # Guarantees
///
/// - Construction starts dialing in the background; calls made before the
///   first connection wait for it
/// - Every outstanding update receiver resolves exactly once: `Ok(())` on a
///   push, `Err(Disconnected)` when the connection goes away
/// - After `shutdown()`, every call fails with `ShutDown`
pub struct MetadataClient {
    inner: Arc<Inner>,
}

impl MetadataClient {
    /// Build the client and start connecting. Must be called inside a tokio
    /// runtime.
    pub fn new(config: &Config, collaborators: Collaborators) -> Self {
        let Collaborators {
            transport,
            signer,
            keys,
            rekey,
        } = collaborators;

        let inner = Arc::new_cyclic(|weak| {
            let hooks = Arc::new(Hooks {
                inner: weak.clone(),
            });
            Inner {
                conn: Connection::new(transport, hooks.clone(), config.reconnect.clone()),
                auth: AuthToken::new(
                    config.token_server.clone(),
                    config.token_expire_in(),
                    config.client_name.clone(),
                    config.client_version.clone(),
                    signer,
                    hooks,
                ),
                observers: ObserverRegistry::new(),
                ping: PingTicker::new(wire::PING),
                keys,
                rekey,
            }
        });

        info!(server = %config.server_url, "Starting metadata server client");
        inner.conn.start();
        Self { inner }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.conn.status()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.conn.is_connected()
    }

    /// Number of live keep-alive tasks. One while connected, else zero.
    pub fn ping_tasks(&self) -> usize {
        self.inner.ping.active_tasks()
    }

    /// Number of folders with an outstanding update receiver.
    pub fn pending_observers(&self) -> usize {
        self.inner.observers.len()
    }

    async fn call<A, R>(&self, cancel: &CancellationToken, method: &'static str, arg: &A) -> Result<R, MdServerError>
    where
        A: Serialize + Sync,
        R: DeserializeOwned,
    {
        self.inner
            .conn
            .do_command(cancel, move |client| async move { call_typed(&*client, method, arg).await })
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn get(
        &self,
        cancel: &CancellationToken,
        id: TlfId,
        handle: Option<&TlfHandle>,
        branch: BranchId,
        merge_status: MergeStatus,
        start: MetadataRevision,
        stop: MetadataRevision,
    ) -> Result<(TlfId, Vec<RootMetadataSigned>), MdServerError> {
        let mut arg = GetMetadataArg {
            branch_id: branch.to_string(),
            unmerged: merge_status == MergeStatus::Unmerged,
            start_revision: start.number(),
            stop_revision: stop.number(),
            ..Default::default()
        };
        match (id.is_null(), handle) {
            (false, _) => arg.folder_id = id.to_string(),
            (true, Some(handle)) => arg.folder_handle = handle.0.clone(),
            (true, None) => return Err(MdServerError::InvalidGetArguments),
        }

        let response: MetadataResponse = self.call(cancel, wire::GET_METADATA, &arg).await?;

        let id = response
            .folder_id
            .parse::<TlfId>()
            .map_err(|_| MdServerError::InvalidTlfId(response.folder_id.clone()))?;
        let blocks = response
            .md_blocks
            .iter()
            .map(|block| wire::decode::<RootMetadataSigned>(block))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(folder = %id, blocks = blocks.len(), "Fetched metadata");
        Ok((id, blocks))
    }

    /// Look up a folder by handle, returning its ID and current head.
    pub async fn get_for_handle(
        &self,
        cancel: &CancellationToken,
        handle: &TlfHandle,
        merge_status: MergeStatus,
    ) -> Result<(TlfId, Option<RootMetadataSigned>), MdServerError> {
        let (id, blocks) = self
            .get(
                cancel,
                TlfId::NULL,
                Some(handle),
                BranchId::NULL,
                merge_status,
                MetadataRevision::UNINITIALIZED,
                MetadataRevision::UNINITIALIZED,
            )
            .await?;
        Ok((id, blocks.into_iter().next()))
    }

    /// Current head of a folder's branch, if it has one.
    pub async fn get_for_tlf(
        &self,
        cancel: &CancellationToken,
        id: TlfId,
        branch: BranchId,
        merge_status: MergeStatus,
    ) -> Result<Option<RootMetadataSigned>, MdServerError> {
        let (_, blocks) = self
            .get(
                cancel,
                id,
                None,
                branch,
                merge_status,
                MetadataRevision::UNINITIALIZED,
                MetadataRevision::UNINITIALIZED,
            )
            .await?;
        Ok(blocks.into_iter().next())
    }

    /// Metadata revisions `start..=stop` of a folder's branch.
    pub async fn get_range(
        &self,
        cancel: &CancellationToken,
        id: TlfId,
        branch: BranchId,
        merge_status: MergeStatus,
        start: MetadataRevision,
        stop: MetadataRevision,
    ) -> Result<Vec<RootMetadataSigned>, MdServerError> {
        let (_, blocks) = self.get(cancel, id, None, branch, merge_status, start, stop).await?;
        Ok(blocks)
    }

    pub async fn put(&self, cancel: &CancellationToken, rmds: &RootMetadataSigned) -> Result<(), MdServerError> {
        let arg = PutMetadataArg {
            md_block: wire::encode(rmds)?,
        };
        self.call(cancel, wire::PUT_METADATA, &arg).await
    }

    pub async fn prune_branch(
        &self,
        cancel: &CancellationToken,
        id: TlfId,
        branch: BranchId,
    ) -> Result<(), MdServerError> {
        let arg = PruneBranchArg {
            folder_id: id.to_string(),
            branch_id: branch.to_string(),
        };
        self.call(cancel, wire::PRUNE_BRANCH, &arg).await
    }

    /// Ask to be told once when `id` moves past `current_head`.
    ///
    /// The returned receiver yields `Ok(())` for an update or
    /// `Err(Disconnected)` if the connection drops first. Either way the
    /// registration is spent.
    ///
    /// # Panics
    /// If `id` already has an outstanding receiver.
    pub async fn register_for_update(
        &self,
        cancel: &CancellationToken,
        id: TlfId,
        current_head: MetadataRevision,
    ) -> Result<UpdateReceiver, MdServerError> {
        let arg = &RegisterForUpdatesArg {
            folder_id: id.to_string(),
            curr_revision: current_head.number(),
        };
        let observers = &self.inner.observers;

        self.inner
            .conn
            .do_command(cancel, move |client| async move {
                // The slot goes in first so a push racing the reply is not lost.
                // A retry after a disconnect finds the table emptied and installs again.
                let (ticket, receiver) = observers.install(id);
                let mut pending = PendingRegistration {
                    observers,
                    id,
                    ticket,
                    armed: true,
                };
                call_typed::<_, ()>(&*client, wire::REGISTER_FOR_UPDATES, arg).await?;
                pending.armed = false;
                debug!(folder = %id, head = current_head.number(), "Registered for folder updates");
                Ok::<_, MdServerError>(receiver)
            })
            .await
    }

    pub async fn get_tlf_crypt_key_server_half(
        &self,
        cancel: &CancellationToken,
        server_half_id: &TlfCryptKeyServerHalfId,
    ) -> Result<TlfCryptKeyServerHalf, MdServerError> {
        let arg = GetKeyArg {
            key_half_id: wire::encode(server_half_id)?,
            device_kid: self.inner.keys.current_crypt_public_key().await?,
        };
        let key: Vec<u8> = self.call(cancel, wire::GET_KEY, &arg).await?;
        wire::decode(&key)
    }

    pub async fn put_tlf_crypt_key_server_halves(
        &self,
        cancel: &CancellationToken,
        halves: &HashMap<Uid, HashMap<Kid, TlfCryptKeyServerHalf>>,
    ) -> Result<(), MdServerError> {
        let mut key_halves = Vec::new();
        for (user, devices) in halves {
            for (device_kid, half) in devices {
                key_halves.push(KeyHalf {
                    user: user.clone(),
                    device_kid: device_kid.clone(),
                    key: wire::encode(half)?,
                });
            }
        }
        self.call(cancel, wire::PUT_KEYS, &PutKeysArg { key_halves }).await
    }

    /// Close the connection for good, failing outstanding update receivers
    /// and stopping every background task.
    pub async fn shutdown(&self) {
        self.inner.conn.shutdown().await;
        self.inner.observers.cancel_all();
        self.inner.ping.stop().await;
        self.inner.auth.shutdown();
        info!("Metadata server client shut down");
    }
}
