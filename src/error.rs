//! Error types for mdserver-link

use rmpv::Value;
use thiserror::Error;

/// Status code the metadata server uses for a malformed request.
pub const STATUS_BAD_REQUEST: i64 = 2801;
/// Status code for an unauthenticated or unauthorized connection.
pub const STATUS_UNAUTHORIZED: i64 = 2806;
/// Status code the server sends when the client should back off.
pub const STATUS_THROTTLE: i64 = 2807;
/// Catch-all code for errors raised while serving a server-initiated call.
pub const STATUS_GENERIC: i64 = 2800;

#[derive(Error, Debug)]
pub enum MdServerError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Disconnected from metadata server")]
    Disconnected,

    #[error("Metadata server connection is shut down")]
    ShutDown,

    #[error("Operation canceled")]
    Canceled,

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Throttled by metadata server: {0}")]
    Throttle(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Invalid get arguments: neither a folder ID nor a handle was given")]
    InvalidGetArguments,

    #[error("Invalid folder ID: {0}")]
    InvalidTlfId(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Protocol already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Metadata server error {code} ({name}): {desc}")]
    Remote { code: i64, name: String, desc: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MdServerError {
    /// True when the error means the underlying connection is gone and the
    /// command may be retried on a fresh one.
    pub fn is_transport_loss(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Disconnected)
    }

    pub fn is_throttle(&self) -> bool {
        matches!(self, Self::Throttle(_))
    }

    /// Convert a status record received from the server into an error.
    ///
    /// Records look like `{"code": <int>, "name": <str>, "desc": <str>}`.
    /// Anything that does not match that shape is reported as a protocol
    /// error so a garbled response never masquerades as a throttle.
    pub fn from_status(status: &Value) -> Self {
        let Some(map) = status.as_map() else {
            if let Some(desc) = status.as_str() {
                return Self::Remote {
                    code: STATUS_GENERIC,
                    name: "GENERIC".to_string(),
                    desc: desc.to_string(),
                };
            }
            return Self::Protocol(format!("Unrecognized error value: {}", status));
        };

        let field = |key: &str| map.iter().find(|(k, _)| k.as_str() == Some(key)).map(|(_, v)| v);

        let code = field("code").and_then(|v| v.as_i64()).unwrap_or(STATUS_GENERIC);
        let name = field("name").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let desc = field("desc").and_then(|v| v.as_str()).unwrap_or("").to_string();

        match code {
            STATUS_BAD_REQUEST => Self::BadRequest(desc),
            STATUS_UNAUTHORIZED => Self::Auth(desc),
            STATUS_THROTTLE => Self::Throttle(desc),
            _ => Self::Remote { code, name, desc },
        }
    }

    /// Encode this error as a status record, for replies to server-initiated calls.
    pub fn to_status(&self) -> Value {
        let (code, name) = match self {
            Self::BadRequest(_) | Self::InvalidTlfId(_) => (STATUS_BAD_REQUEST, "BAD_REQUEST"),
            Self::Auth(_) => (STATUS_UNAUTHORIZED, "UNAUTHORIZED"),
            Self::Throttle(_) => (STATUS_THROTTLE, "THROTTLE"),
            Self::Remote { code, .. } => (*code, "REMOTE"),
            _ => (STATUS_GENERIC, "GENERIC"),
        };
        let desc = match self {
            Self::BadRequest(desc) | Self::Auth(desc) | Self::Throttle(desc) => desc.clone(),
            Self::Remote { desc, .. } => desc.clone(),
            other => other.to_string(),
        };

        Value::Map(vec![
            (Value::String("code".into()), Value::Integer(code.into())),
            (Value::String("name".into()), Value::String(name.into())),
            (Value::String("desc".into()), Value::String(desc.into())),
        ])
    }
}

pub type Result<T> = std::result::Result<T, MdServerError>;
