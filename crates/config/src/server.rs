//! gRPC server settings.

use serde::{Deserialize, Serialize};

/// Settings for the discovery gRPC listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket address the ADS server binds to
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Time allowed for open streams to finish on shutdown
    #[serde(default = "default_graceful_shutdown_timeout")]
    pub graceful_shutdown_timeout_secs: u64,
}

pub fn default_listen() -> String {
    "0.0.0.0:15010".to_string()
}

pub fn default_graceful_shutdown_timeout() -> u64 {
    5
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            graceful_shutdown_timeout_secs: default_graceful_shutdown_timeout(),
        }
    }
}
