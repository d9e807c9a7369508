//! Configuration linting for likely mistakes in the mesh seed.
//!
//! Lints never fail validation; they surface references that will
//! produce empty or failing resources at runtime.

use std::collections::HashSet;

use super::{ValidationResult, ValidationWarning};
use crate::mesh::outbound_cluster_name;
use crate::Config;

/// Lint configuration for dangling references
pub fn lint_config(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    let mesh = &config.mesh;

    let clusters: HashSet<String> = mesh
        .services
        .iter()
        .flat_map(|s| s.ports.iter().map(move |p| outbound_cluster_name(&s.hostname, p.port)))
        .collect();

    // Route virtual hosts pointing at clusters no service provides
    for route in &mesh.routes {
        for vhost in &route.virtual_hosts {
            if !clusters.contains(&vhost.cluster) {
                result.add_warning(ValidationWarning::new(format!(
                    "Route '{}' virtual host '{}' targets unknown cluster '{}' (the route will fail to generate)",
                    route.name, vhost.name, vhost.cluster
                )));
            }
        }
        if route.virtual_hosts.is_empty() {
            result.add_warning(ValidationWarning::new(format!(
                "Route '{}' has no virtual hosts",
                route.name
            )));
        }
    }

    // Listeners referencing undeclared routes
    let routes: HashSet<&str> = mesh.routes.iter().map(|r| r.name.as_str()).collect();
    for listener in &mesh.listeners {
        if let Some(route) = &listener.route_config {
            if !routes.contains(route.as_str()) {
                result.add_warning(ValidationWarning::new(format!(
                    "Listener '{}' references undeclared route '{}'",
                    listener.name, route
                )));
            }
        }
    }

    // Services without any endpoint
    for service in &mesh.services {
        if !mesh.endpoints.iter().any(|e| e.hostname == service.hostname) {
            result.add_warning(ValidationWarning::new(format!(
                "Service '{}' has no endpoints (its load assignments will be empty)",
                service.hostname
            )));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{ListenerSpec, PortProtocol, RouteSpec, Service};

    #[test]
    fn test_lint_dangling_references() {
        let mut config = Config::default();
        config.mesh.services.push(
            Service::new("reviews.default.svc.cluster.local").with_port("http", 9080, PortProtocol::Http),
        );
        config.mesh.routes.push(RouteSpec::new("http.80").with_virtual_host(
            "reviews",
            vec!["reviews".to_string()],
            "outbound|80||missing.default.svc.cluster.local",
        ));
        config
            .mesh
            .listeners
            .push(ListenerSpec::new("http-80", "0.0.0.0", 80).with_route_config("https.443"));

        let result = lint_config(&config);
        assert!(result.errors.is_empty());
        // unknown cluster, undeclared route, service without endpoints
        assert_eq!(result.warnings.len(), 3);
    }

    #[test]
    fn test_lint_clean_config() {
        let result = lint_config(&Config::default());
        assert!(result.warnings.is_empty());
    }
}
