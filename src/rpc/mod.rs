//! RPC seams between the connection core and the wire.
//!
//! | Item            | Responsibility                                        |
//! |-----------------|-------------------------------------------------------|
//! | `GenericClient` | Call a named remote procedure on a live connection    |
//! | `Protocol`      | A set of locally served, server-initiated methods     |
//! | `LocalServer`   | Routes incoming calls to registered protocols         |
//! | `protocol`      | msgpack-rpc message encoding                          |
//! | `transport`     | WebSocket implementation of `ConnectionTransport`     |
//!
//! The connection core only ever sees `GenericClient` and `LocalServer`, so a
//! different wire can be plugged in by implementing `ConnectionTransport`.

pub mod protocol;
pub mod transport;

use async_trait::async_trait;
use rmpv::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::error::MdServerError;

/// A handle for calling remote procedures over one live connection.
#[async_trait]
pub trait GenericClient: Send + Sync {
    /// Call `method` with a single argument record and wait for its result.
    async fn call(&self, method: &str, arg: Value) -> Result<Value, MdServerError>;
}

/// Call a remote procedure with serde-typed argument and result.
pub async fn call_typed<A, R>(client: &dyn GenericClient, method: &str, arg: &A) -> Result<R, MdServerError>
where
    A: Serialize + ?Sized,
    R: DeserializeOwned,
{
    let arg = to_record(arg)
        .map_err(|e| MdServerError::Codec(format!("Failed to encode {} argument: {}", method, e)))?;
    let result = client.call(method, arg).await?;
    from_record(result)
        .map_err(|e| MdServerError::Codec(format!("Failed to decode {} result: {}", method, e)))
}

/// Encode a serde value as a msgpack record, structs becoming maps keyed by
/// field name.
pub fn to_record<T: Serialize + ?Sized>(value: &T) -> Result<Value, MdServerError> {
    let bytes = rmp_serde::to_vec_named(value).map_err(|e| MdServerError::Codec(e.to_string()))?;
    rmpv::decode::read_value(&mut bytes.as_slice()).map_err(|e| MdServerError::Codec(e.to_string()))
}

/// Decode a msgpack record into a serde value.
pub fn from_record<T: DeserializeOwned>(value: Value) -> Result<T, MdServerError> {
    let mut bytes = Vec::new();
    rmpv::encode::write_value(&mut bytes, &value).map_err(|e| MdServerError::Codec(e.to_string()))?;
    rmp_serde::from_slice(&bytes).map_err(|e| MdServerError::Codec(e.to_string()))
}

/// A group of methods the server may invoke on us.
///
/// Methods are addressed on the wire as `"<protocol name>.<method>"`.
#[async_trait]
pub trait Protocol: Send + Sync {
    fn name(&self) -> &'static str;

    async fn serve(&self, method: &str, arg: Value) -> Result<Value, MdServerError>;
}

/// Table of served protocols for one connection manager.
///
/// Survives reconnects: a protocol registered once keeps receiving calls on
/// every later connection.
#[derive(Default)]
pub struct LocalServer {
    protocols: RwLock<HashMap<&'static str, Arc<dyn Protocol>>>,
}

impl LocalServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a protocol.
    ///
    /// # Errors
    /// `AlreadyRegistered` when a protocol with the same name exists. Callers
    /// that register on every connect treat that as success.
    pub fn register(&self, protocol: Arc<dyn Protocol>) -> Result<(), MdServerError> {
        let mut protocols = self
            .protocols
            .write()
            .map_err(|_| MdServerError::Protocol("Local server lock poisoned".into()))?;
        let name = protocol.name();
        if protocols.contains_key(name) {
            return Err(MdServerError::AlreadyRegistered(name.to_string()));
        }
        debug!(protocol = %name, "Registered served protocol");
        protocols.insert(name, protocol);
        Ok(())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.protocols
            .read()
            .map(|protocols| protocols.contains_key(name))
            .unwrap_or(false)
    }

    /// Route a fully-qualified method name to its protocol.
    pub async fn dispatch(&self, method: &str, arg: Value) -> Result<Value, MdServerError> {
        let (protocol_name, short_method) = method
            .rsplit_once('.')
            .ok_or_else(|| MdServerError::UnknownMethod(method.to_string()))?;

        let protocol = {
            let protocols = self
                .protocols
                .read()
                .map_err(|_| MdServerError::Protocol("Local server lock poisoned".into()))?;
            protocols.get(protocol_name).cloned()
        };

        match protocol {
            Some(protocol) => protocol.serve(short_method, arg).await,
            None => Err(MdServerError::UnknownMethod(method.to_string())),
        }
    }
}
