//! Lobby Controller configuration.
//!
//! Configuration is loaded from environment variables. Every field has a
//! sensible default; no variable is required.

use std::collections::HashMap;
use std::env;

use thiserror::Error;

/// Default bind address for the WebSocket and health endpoints.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default CORS policy: permissive.
pub const DEFAULT_CORS_ALLOWED_ORIGIN: &str = "*";

/// Default instance ID prefix.
pub const DEFAULT_INSTANCE_ID_PREFIX: &str = "lobby";

/// Lobby Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address for the combined WebSocket/health listener
    /// (default: "0.0.0.0:8080").
    pub bind_address: String,

    /// Allowed CORS origin for the health endpoints ("*" for any).
    pub cors_allowed_origin: String,

    /// Unique identifier for this instance.
    pub instance_id: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        // LOBBY_BIND_ADDRESS wins; the bare PORT variable is honored for
        // platform-assigned ports.
        let bind_address = match (vars.get("LOBBY_BIND_ADDRESS"), vars.get("PORT")) {
            (Some(addr), _) => addr.clone(),
            (None, Some(port)) => {
                let port: u16 = port.parse().map_err(|_| {
                    ConfigError::InvalidValue(format!("PORT is not a valid port: {port}"))
                })?;
                format!("0.0.0.0:{port}")
            }
            (None, None) => DEFAULT_BIND_ADDRESS.to_string(),
        };

        let cors_allowed_origin = vars
            .get("LOBBY_CORS_ALLOWED_ORIGIN")
            .cloned()
            .unwrap_or_else(|| DEFAULT_CORS_ALLOWED_ORIGIN.to_string());

        let instance_id = vars.get("LOBBY_INSTANCE_ID").cloned().unwrap_or_else(|| {
            let hostname = env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_INSTANCE_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            bind_address,
            cors_allowed_origin,
            instance_id,
        })
    }
}
