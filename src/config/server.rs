//! Server configuration
//!
//! Loads listener and connection settings from an optional TOML file. Values
//! not present in the file fall back to their defaults; CLI flags are applied
//! on top by the binary.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default port to listen on
pub const DEFAULT_PORT: u16 = 9000;

/// Default maximum size of a single text frame (and of a reassembled message)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Default maximum size of the HTTP upgrade request head
pub const DEFAULT_MAX_HEADER_SIZE: usize = 64 * 1024;

/// Default number of broadcast messages queued per connection
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Placeholder replaced by the connection id in the welcome text
pub const WELCOME_ID_PLACEHOLDER: &str = "{id}";

/// Errors that can occur while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Configuration for the WebSocket server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Only upgrade requests for this path are accepted (any path when unset)
    pub path: Option<String>,
    /// Pathway tag prefixed to every broadcast message
    pub tag: String,
    /// Text sent to a client right after its handshake completes
    pub welcome: Option<String>,
    /// Maximum payload of a text frame, in bytes
    pub max_frame_size: usize,
    /// Maximum size of the HTTP upgrade request head, in bytes
    pub max_header_size: usize,
    /// Broadcast messages buffered per connection before it is dropped as too slow
    pub outbound_capacity: usize,
    /// How long to wait for the peer's Close frame once closing
    pub close_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            path: None,
            tag: "tungstenite".to_string(),
            welcome: Some(format!("connected: {WELCOME_ID_PLACEHOLDER}")),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            close_timeout_ms: 5_000,
        }
    }
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(bind: impl Into<String>, port: u16) -> Self {
        Self {
            bind: bind.into(),
            port,
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Restrict upgrades to a single endpoint path
    pub fn with_path(mut self, path: Option<String>) -> Self {
        self.path = path;
        self
    }

    /// Set the pathway tag
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// Set the welcome text; an empty string disables it
    pub fn with_welcome(mut self, welcome: Option<String>) -> Self {
        self.welcome = welcome.filter(|w| !w.is_empty());
        self
    }

    /// Set the maximum text frame size
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Closing handshake timeout
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Welcome text for a given connection, if enabled
    pub fn welcome_for(&self, id: impl std::fmt::Display) -> Option<String> {
        self.welcome
            .as_deref()
            .filter(|w| !w.is_empty())
            .map(|w| w.replace(WELCOME_ID_PLACEHOLDER, &id.to_string()))
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tag.trim().is_empty() {
            return Err(ConfigError::Invalid("tag cannot be empty".to_string()));
        }
        if let Some(path) = &self.path {
            if !path.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "path must start with '/', got {path:?}"
                )));
            }
        }
        if self.max_frame_size == 0 {
            return Err(ConfigError::Invalid(
                "max_frame_size must be greater than zero".to_string(),
            ));
        }
        if let Some(welcome) = &self.welcome {
            if welcome.len() > self.max_frame_size {
                return Err(ConfigError::Invalid(format!(
                    "welcome text of {} bytes exceeds max_frame_size",
                    welcome.len()
                )));
            }
        }
        if self.max_header_size == 0 {
            return Err(ConfigError::Invalid(
                "max_header_size must be greater than zero".to_string(),
            ));
        }
        if self.outbound_capacity == 0 {
            return Err(ConfigError::Invalid(
                "outbound_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
