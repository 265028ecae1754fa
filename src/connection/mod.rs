//! Metadata Server Connection Module
//!
//! A long-lived connection to the metadata server that authenticates itself,
//! survives network failure, and runs commands without callers having to
//! care whether a channel currently exists.
//!
//! # Architecture
//!
//! | Module      | Responsibility                                        |
//! |-------------|-------------------------------------------------------|
//! | `transport` | The dialable capability supplied by the embedder      |
//! | `handler`   | Lifecycle callbacks implemented by the owning layer   |
//! | `backoff`   | Delay between reconnect attempts                      |
//! | `executor`  | The reconnect loop and `do_command`                   |
//!
//! # Key Design Principles
//!
//! ## 1. One Owner for Connection State
//!
//! - The reconnect loop is the only thing that dials, publishes, or tears
//!   down a channel
//! - Commands read a copy of the current client; they never hold a lock
//!   across a network call
//! - A failed command can only report the generation it ran on, so a stale
//!   failure never kills a newer channel
//!
//! ## 2. Connected Means Authenticated
//!
//! - The on-connect hook runs before the channel is published
//! - A failing hook is a failed dial: back off, try again
//!
//! ## 3. Throttling Is Not Failure
//!
//! - Back-pressure errors go straight to the caller
//! - The channel stays up and the command is not re-run
//!
//! # Usage
//!
//! ```ignore
//! use mdserver_link::connection::{Connection, ReconnectPolicy};
//!
//! let connection = Connection::connect(transport, handler, ReconnectPolicy::default());
//!
//! let pong: rmpv::Value = connection
//!     .do_command(&cancel, |client| async move {
//!         client.call("keybase.1.metadata.ping", rmpv::Value::Nil).await
//!     })
//!     .await?;
//!
//! connection.shutdown().await;
//! ```

mod backoff;
mod executor;
mod handler;
mod transport;

pub use backoff::ReconnectPolicy;
pub use executor::{Connection, ConnectionStatus};
pub use handler::{ConnectionHandler, DisconnectStatus};
pub use transport::{ConnectionTransport, RawChannel};
