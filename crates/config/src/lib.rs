//! Configuration for the Beacon control plane.
//!
//! Configuration is written in KDL and split into three blocks:
//!
//! - `server`: where the ADS gRPC endpoint listens
//! - `discovery`: debounce thresholds, stream buffering, wildcard policy
//! - `mesh`: static services, endpoints, routes and listeners
//!
//! # Example
//!
//! ```ignore
//! use beacon_config::Config;
//!
//! let config = Config::from_kdl(r#"
//!     server { listen "127.0.0.1:15010" }
//!     discovery { debounce-after-ms 50 }
//! "#)?;
//! config.validate()?;
//! ```

pub mod discovery;
pub mod kdl;
pub mod mesh;
pub mod server;
pub mod validate;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

pub use discovery::{DiscoveryConfig, ResourceKind, WildcardPolicies, WildcardPolicy};
pub use mesh::{
    outbound_cluster_name, parse_outbound_cluster_name, EndpointInstance, ListenerSpec, MeshSeed,
    PortProtocol, ProxyKind, RouteSpec, Service, ServicePort, VirtualHostSpec,
};
pub use server::ServerConfig;
pub use validate::{ValidationError, ValidationResult, ValidationWarning};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0:#}")]
    Parse(anyhow::Error),

    #[error("invalid configuration: {}", format_errors(.0))]
    Invalid(Vec<ValidationError>),
}

fn format_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub mesh: MeshSeed,
}

impl Config {
    /// Load configuration from a KDL file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading configuration file");
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        kdl::parse_document(&source)
            .with_context(|| format!("in {}", path.display()))
            .map_err(ConfigError::Parse)
    }

    /// Parse configuration from KDL text.
    pub fn from_kdl(source: &str) -> Result<Self, ConfigError> {
        kdl::parse_document(source).map_err(ConfigError::Parse)
    }

    /// Validate the configuration.
    ///
    /// Warnings are logged and returned; errors fail validation.
    pub fn validate(&self) -> Result<ValidationResult, ConfigError> {
        let result = validate::validate_config(self);
        for warning in &result.warnings {
            warn!("{}", warning.message);
        }
        if result.is_ok() {
            Ok(result)
        } else {
            Err(ConfigError::Invalid(result.errors))
        }
    }
}
