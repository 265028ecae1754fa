//! Configuration for mdserver-link

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connection::ReconnectPolicy;

/// Default config file location
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mdserver-link")
        .join("config.toml")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Metadata server websocket URL
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Server type the auth token is bound to
    #[serde(default = "default_token_server")]
    pub token_server: String,

    /// Auth token TTL in seconds
    #[serde(default = "default_token_expire_secs")]
    pub token_expire_secs: u64,

    /// Client name embedded in auth tokens
    #[serde(default = "default_client_name")]
    pub client_name: String,

    /// Client version embedded in auth tokens
    #[serde(default = "default_client_version")]
    pub client_version: String,

    /// Timeout for a single request/response exchange
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Timeout for a single dial attempt
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,

    /// Reconnect backoff
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

fn default_server_url() -> String {
    "ws://localhost:9911".to_string()
}

fn default_token_server() -> String {
    "kbfs_md".to_string()
}

fn default_token_expire_secs() -> u64 {
    2 * 60 * 60
}

fn default_client_name() -> String {
    "mdserver_link".to_string()
}

fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_dial_timeout_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            token_server: default_token_server(),
            token_expire_secs: default_token_expire_secs(),
            client_name: default_client_name(),
            client_version: default_client_version(),
            request_timeout_secs: default_request_timeout_secs(),
            dial_timeout_secs: default_dial_timeout_secs(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    pub fn token_expire_in(&self) -> Duration {
        Duration::from_secs(self.token_expire_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}
