//! Store configuration.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid port '{0}' in connection string")]
    InvalidPort(String),
}

/// Connection and protocol settings for one named store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store name; prefixes every session key and the lock table.
    #[serde(default = "d_name")]
    pub name: String,
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
    /// Sliding expiration applied when a record carries no timeout.
    #[serde(default = "d_timeout_minutes")]
    pub default_timeout_minutes: u32,
    /// How long an exclusive lease is honoured before it may be taken over.
    #[serde(default = "d_lease_seconds")]
    pub lock_lease_seconds: u64,
    /// First delay between reconnect attempts.
    #[serde(default = "d_backoff_ms")]
    pub reconnect_backoff_ms: u64,
    /// Upper bound for the doubling reconnect delay.
    #[serde(default = "d_max_backoff_ms")]
    pub max_reconnect_backoff_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: d_name(),
            host: d_host(),
            port: d_port(),
            default_timeout_minutes: d_timeout_minutes(),
            lock_lease_seconds: d_lease_seconds(),
            reconnect_backoff_ms: d_backoff_ms(),
            max_reconnect_backoff_ms: d_max_backoff_ms(),
        }
    }
}

impl StoreConfig {
    /// Load from a TOML file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Parse from TOML text. Missing keys take their defaults.
    ///
    /// # Errors
    /// Returns error if the text is not valid TOML for this shape.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Parse a state connection string such as `tcpip=10.0.0.5:6380`.
    ///
    /// Missing host or port fall back to `localhost` and `6379`; an empty
    /// string yields the defaults.
    ///
    /// # Errors
    /// Returns error if the port is not a number.
    pub fn from_connection_string(connection: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if connection.trim().is_empty() {
            return Ok(config);
        }
        let mut parts = connection.split(['=', ':']).skip(1);
        config.host = parts
            .next()
            .filter(|h| !h.is_empty())
            .unwrap_or("localhost")
            .to_string();
        if let Some(port) = parts.next().filter(|p| !p.is_empty()) {
            config.port = port
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidPort(port.to_string()))?;
        }
        Ok(config)
    }

    /// Builder-style store name override.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// `host:port` of the backend.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub const fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_seconds)
    }

    #[must_use]
    pub const fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    #[must_use]
    pub const fn max_reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_backoff_ms)
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_name() -> String {
    "SessionStateStore".into()
}
fn d_host() -> String {
    "127.0.0.1".into()
}
const fn d_port() -> u16 {
    6379
}
const fn d_timeout_minutes() -> u32 {
    20
}
const fn d_lease_seconds() -> u64 {
    120
}
const fn d_backoff_ms() -> u64 {
    100
}
const fn d_max_backoff_ms() -> u64 {
    5_000
}
