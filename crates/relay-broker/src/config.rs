//! Broker configuration.
//!
//! Configuration is loaded from environment variables with sensible
//! defaults; `from_vars` takes a plain map for tests.

use std::collections::HashMap;
use std::env;
use thiserror::Error;

/// Default TCP bind address (the conventional MQTT port).
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:1883";

/// Default per-connection read buffer capacity in bytes.
pub const DEFAULT_READ_BUFFER_BYTES: usize = 1024;

/// Default broker instance ID prefix.
pub const DEFAULT_BROKER_ID_PREFIX: &str = "relay";

/// Broker configuration.
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP bind address (default: "0.0.0.0:1883").
    pub bind_address: String,

    /// Unique identifier for this broker instance, used in logs.
    pub broker_id: String,

    /// Initial capacity of each session's read buffer.
    pub read_buffer_bytes: usize,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {name}: {value}")]
    InvalidValue {
        /// Environment variable name.
        name: String,
        /// The rejected value.
        value: String,
    },
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if a variable is present but does not
    /// parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if a variable is present but does not
    /// parse.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = vars
            .get("RELAY_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let read_buffer_bytes = match vars.get("RELAY_READ_BUFFER_BYTES") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                name: "RELAY_READ_BUFFER_BYTES".to_string(),
                value: raw.clone(),
            })?,
            None => DEFAULT_READ_BUFFER_BYTES,
        };

        // Generate a broker instance ID unless one is pinned
        let broker_id = vars.get("RELAY_BROKER_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_BROKER_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            bind_address,
            broker_id,
            read_buffer_bytes,
        })
    }
}
