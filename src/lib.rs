//! mdserver-link - Client transport for the folder metadata server
//!
//! Keeps one authenticated, self-healing RPC connection to the metadata
//! server and lets callers run commands and wait for folder updates without
//! caring whether a connection exists right now.
//!
//! ## Architecture
//!
//! | Layer         | Role                                                   |
//! |---------------|--------------------------------------------------------|
//! | `rpc`         | msgpack-rpc codec, WebSocket transport, served calls   |
//! | `connection`  | Reconnect loop, backoff, `do_command` contract         |
//! | `auth`        | Signed tokens and their refresh schedule               |
//! | `ping`        | Keep-alive ticker for the live connection              |
//! | `observers`   | One-shot per-folder update waiters                     |
//! | `mdserver`    | The metadata operations, wired onto all of the above   |
//!
//! ## Failure Handling
//!
//! | Failure                    | What callers see                         |
//! |----------------------------|------------------------------------------|
//! | Dial or auth failure       | Added latency, reconnect with backoff    |
//! | Connection drop mid-call   | The call is re-run on the next channel   |
//! | Server throttle            | `MdServerError::Throttle`, no retry      |
//! | Remote rejection           | The remote error, connection kept        |
//! | Shutdown                   | `MdServerError::ShutDown`                |

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod mdserver;
pub mod observers;
pub mod ping;
pub mod rpc;
pub mod types;

// Re-exports
pub use auth::{AuthToken, AuthTokenRefreshHandler, Ed25519Signer, Signer};
pub use config::Config;
pub use connection::{
    Connection, ConnectionHandler, ConnectionStatus, ConnectionTransport, DisconnectStatus, RawChannel,
    ReconnectPolicy,
};
pub use error::MdServerError;
pub use mdserver::{Collaborators, KeyProvider, MetadataClient, RekeyObserver};
pub use observers::{ObserverRegistry, UpdateReceiver};
pub use rpc::transport::WsTransport;
pub use rpc::{GenericClient, LocalServer, Protocol};
pub use types::{
    BranchId, Kid, MergeStatus, MetadataRevision, RootMetadataSigned, SignatureInfo, TlfCryptKeyServerHalf,
    TlfCryptKeyServerHalfId, TlfHandle, TlfId, Uid,
};
