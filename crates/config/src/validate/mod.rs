//! Configuration validation.
//!
//! Errors make a configuration unusable; warnings are reported but do not
//! stop the server from starting.

mod lint;

use std::fmt;
use std::net::SocketAddr;

pub use lint::lint_config;

use crate::Config;

/// Category of a validation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Server,
    Discovery,
    Mesh,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Server => write!(f, "server"),
            ErrorCategory::Discovery => write!(f, "discovery"),
            ErrorCategory::Mesh => write!(f, "mesh"),
        }
    }
}

/// A configuration error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub category: ErrorCategory,
    pub message: String,
}

impl ValidationError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

/// A non-fatal configuration finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    pub message: String,
}

impl ValidationWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Collected validation findings.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Check the hard constraints on a configuration.
pub fn validate_config(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    if config.server.listen.parse::<SocketAddr>().is_err() {
        result.add_error(ValidationError::new(
            ErrorCategory::Server,
            format!("listen address '{}' is not a valid socket address", config.server.listen),
        ));
    }

    let discovery = &config.discovery;
    if discovery.debounce_after_ms == 0 {
        result.add_error(ValidationError::new(
            ErrorCategory::Discovery,
            "debounce-after-ms must be greater than zero",
        ));
    }
    if discovery.debounce_after_ms > discovery.debounce_max_ms {
        result.add_error(ValidationError::new(
            ErrorCategory::Discovery,
            format!(
                "debounce-after-ms ({}) must not exceed debounce-max-ms ({})",
                discovery.debounce_after_ms, discovery.debounce_max_ms
            ),
        ));
    }
    if discovery.send_buffer == 0 {
        result.add_error(ValidationError::new(
            ErrorCategory::Discovery,
            "send-buffer must be greater than zero",
        ));
    }

    for endpoint in &config.mesh.endpoints {
        match config
            .mesh
            .services
            .iter()
            .find(|s| s.hostname == endpoint.hostname)
        {
            None => result.add_error(ValidationError::new(
                ErrorCategory::Mesh,
                format!(
                    "endpoint {}:{} references undeclared service '{}'",
                    endpoint.address, endpoint.port, endpoint.hostname
                ),
            )),
            Some(service) if service.port_named(&endpoint.port_name).is_none() => {
                result.add_error(ValidationError::new(
                    ErrorCategory::Mesh,
                    format!(
                        "endpoint {}:{} references port '{}' not declared on service '{}'",
                        endpoint.address, endpoint.port, endpoint.port_name, endpoint.hostname
                    ),
                ))
            }
            Some(_) => {}
        }
    }

    result.merge(lint_config(config));
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{EndpointInstance, PortProtocol, Service};

    #[test]
    fn test_default_config_is_valid() {
        let result = validate_config(&Config::default());
        assert!(result.is_ok(), "{:?}", result.errors);
    }

    #[test]
    fn test_debounce_bounds() {
        let mut config = Config::default();
        config.discovery.debounce_after_ms = 500;
        config.discovery.debounce_max_ms = 100;
        let result = validate_config(&config);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].category, ErrorCategory::Discovery);

        config.discovery.debounce_after_ms = 0;
        assert!(!validate_config(&config).is_ok());
    }

    #[test]
    fn test_bad_listen_address() {
        let mut config = Config::default();
        config.server.listen = "localhost".to_string();
        let result = validate_config(&config);
        assert_eq!(result.errors[0].category, ErrorCategory::Server);
    }

    #[test]
    fn test_endpoint_references() {
        let mut config = Config::default();
        config.mesh.services.push(
            Service::new("reviews.default.svc.cluster.local").with_port("http", 9080, PortProtocol::Http),
        );
        config.mesh.endpoints.push(EndpointInstance::new(
            "reviews.default.svc.cluster.local",
            "http",
            "10.2.0.1",
            9080,
        ));
        assert!(validate_config(&config).is_ok());

        config.mesh.endpoints.push(EndpointInstance::new("ghost", "http", "10.2.0.2", 80));
        config.mesh.endpoints.push(EndpointInstance::new(
            "reviews.default.svc.cluster.local",
            "grpc",
            "10.2.0.3",
            9090,
        ));
        let result = validate_config(&config);
        assert_eq!(result.errors.len(), 2);
        assert!(result.errors.iter().all(|e| e.category == ErrorCategory::Mesh));
    }
}
