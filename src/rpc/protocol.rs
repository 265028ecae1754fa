//! msgpack-rpc Wire Protocol
//!
//! Single responsibility: Encode and decode msgpack-rpc messages.
//!
//! # Wire Format
//!
//! Each WebSocket binary message carries exactly one msgpack array:
//!
//! ```text
//! [0, <msgid u32>, <method str>, [<arg>]]      request
//! [1, <msgid u32>, <error|nil>, <result>]      response
//! [2, <method str>, [<arg>]]                   notification (no reply)
//! ```
//!
//! Arguments are always a single record wrapped in a one-element array.
//! Errors are status records `{code, name, desc}`, see
//! [`MdServerError::from_status`].

use rmpv::Value;
use std::io::Cursor;

use crate::error::MdServerError;

const TYPE_REQUEST: u64 = 0;
const TYPE_RESPONSE: u64 = 1;
const TYPE_NOTIFY: u64 = 2;

/// A decoded msgpack-rpc message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        msgid: u32,
        method: String,
        arg: Value,
    },
    Response {
        msgid: u32,
        /// `Value::Nil` on success
        error: Value,
        result: Value,
    },
    Notify {
        method: String,
        arg: Value,
    },
}

impl Message {
    /// Encode into wire format.
    pub fn encode(&self) -> Result<Vec<u8>, MdServerError> {
        use rmpv::encode::write_value;

        let value = match self {
            Message::Request { msgid, method, arg } => Value::Array(vec![
                Value::from(TYPE_REQUEST),
                Value::from(*msgid),
                Value::String(method.as_str().into()),
                Value::Array(vec![arg.clone()]),
            ]),
            Message::Response { msgid, error, result } => Value::Array(vec![
                Value::from(TYPE_RESPONSE),
                Value::from(*msgid),
                error.clone(),
                result.clone(),
            ]),
            Message::Notify { method, arg } => Value::Array(vec![
                Value::from(TYPE_NOTIFY),
                Value::String(method.as_str().into()),
                Value::Array(vec![arg.clone()]),
            ]),
        };

        let mut bytes = Vec::new();
        write_value(&mut bytes, &value)
            .map_err(|e| MdServerError::Protocol(format!("Failed to encode message: {}", e)))?;
        Ok(bytes)
    }

    /// Decode a message from wire format.
    pub fn decode(data: &[u8]) -> Result<Self, MdServerError> {
        use rmpv::decode::read_value;

        let mut cursor = Cursor::new(data);
        let value = read_value(&mut cursor)
            .map_err(|e| MdServerError::Protocol(format!("Failed to decode message: {}", e)))?;

        let mut items = match value {
            Value::Array(items) => items.into_iter(),
            other => {
                return Err(MdServerError::Protocol(format!(
                    "Message is not an array: {}",
                    other
                )))
            }
        };

        let kind = items
            .next()
            .and_then(|v| v.as_u64())
            .ok_or_else(|| MdServerError::Protocol("Message missing type".into()))?;

        match kind {
            TYPE_REQUEST => {
                let msgid = next_msgid(&mut items)?;
                let method = next_method(&mut items)?;
                let arg = unwrap_params(items.next())?;
                Ok(Message::Request { msgid, method, arg })
            }
            TYPE_RESPONSE => {
                let msgid = next_msgid(&mut items)?;
                let error = items.next().unwrap_or(Value::Nil);
                let result = items.next().unwrap_or(Value::Nil);
                Ok(Message::Response { msgid, error, result })
            }
            TYPE_NOTIFY => {
                let method = next_method(&mut items)?;
                let arg = unwrap_params(items.next())?;
                Ok(Message::Notify { method, arg })
            }
            other => Err(MdServerError::Protocol(format!("Unknown message type: {}", other))),
        }
    }
}

fn next_msgid(items: &mut impl Iterator<Item = Value>) -> Result<u32, MdServerError> {
    items
        .next()
        .and_then(|v| v.as_u64())
        .and_then(|id| u32::try_from(id).ok())
        .ok_or_else(|| MdServerError::Protocol("Message missing msgid".into()))
}

fn next_method(items: &mut impl Iterator<Item = Value>) -> Result<String, MdServerError> {
    match items.next() {
        Some(Value::String(s)) => s
            .into_str()
            .ok_or_else(|| MdServerError::Protocol("Method name is not UTF-8".into())),
        _ => Err(MdServerError::Protocol("Message missing method".into())),
    }
}

/// Params arrive as a one-element array; anything else is passed through.
fn unwrap_params(params: Option<Value>) -> Result<Value, MdServerError> {
    match params {
        Some(Value::Array(mut args)) if args.len() == 1 => Ok(args.remove(0)),
        Some(Value::Array(args)) if args.is_empty() => Ok(Value::Nil),
        Some(other) => Ok(other),
        None => Err(MdServerError::Protocol("Message missing params".into())),
    }
}
