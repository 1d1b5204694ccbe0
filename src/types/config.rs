//! Configuration structures.
//!
//! Every section has a `Default`, so a config file only needs the fields it
//! wants to change.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::Result;

/// Default cap on a single encoded message.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 5 * 1024 * 1024;

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Client configuration.
    #[serde(default)]
    pub client: ClientConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Parse a JSON config document. Missing sections and fields take their
    /// defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Read and parse a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}

/// Logging configuration, applied by [`crate::observability::init_tracing`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset (`info`,
    /// `muxrpc=debug`, ...).
    pub log_level: String,

    /// Emit JSON lines instead of compact text.
    pub json_logs: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address.
    pub listen_addr: String,

    /// Maximum concurrent connections. Connections accepted beyond this
    /// limit are dropped immediately.
    pub max_connections: usize,

    /// Maximum size of one inbound request in bytes.
    pub max_message_bytes: usize,

    /// Per-response write timeout. A peer that does not drain a response
    /// within this window loses its connection.
    #[serde(with = "humantime_serde")]
    pub write_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7070".to_string(),
            max_connections: 1000,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            write_timeout: None,
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Connect timeout used by `Client::dial_with_config`.
    #[serde(with = "humantime_serde")]
    pub dial_timeout: Option<Duration>,

    /// Maximum size of one inbound response in bytes.
    pub max_message_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            dial_timeout: None,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}
