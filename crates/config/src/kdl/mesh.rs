//! Mesh KDL parsing: services, endpoints, routes and listeners.

use anyhow::Result;
use tracing::trace;

use crate::mesh::*;

use super::{
    args, children, get_first_arg_string, get_prop_int, get_prop_string, to_port,
};

/// Parse the mesh block
pub fn parse_mesh(node: &kdl::KdlNode) -> Result<MeshSeed> {
    trace!("Parsing mesh block");
    let mut seed = MeshSeed::default();

    for child in children(node) {
        match child.name().value() {
            "service" => seed.services.push(parse_service(child)?),
            "endpoint" => seed.endpoints.push(parse_endpoint(child)?),
            "route" => seed.routes.push(parse_route(child)?),
            "listener" => seed.listeners.push(parse_listener(child)?),
            other => {
                return Err(anyhow::anyhow!(
                    "Unknown mesh entry '{}'. Valid entries: service, endpoint, route, listener",
                    other
                ));
            }
        }
    }

    trace!(
        services = seed.services.len(),
        endpoints = seed.endpoints.len(),
        routes = seed.routes.len(),
        listeners = seed.listeners.len(),
        "Parsed mesh block"
    );
    Ok(seed)
}

fn parse_service(node: &kdl::KdlNode) -> Result<Service> {
    let hostname = get_first_arg_string(node).ok_or_else(|| {
        anyhow::anyhow!(
            "Service requires a hostname argument, e.g., service \"reviews.default.svc.cluster.local\" {{ ... }}"
        )
    })?;

    let mut service = Service::new(&hostname);
    service.address = get_prop_string(node, "address");

    for port in children(node) {
        if port.name().value() != "port" {
            continue;
        }
        let mut values = args(port);
        let name = values
            .next()
            .and_then(|v| v.as_string())
            .map(str::to_string)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Port on service '{}' requires a name and number, e.g., port \"http\" 80",
                    hostname
                )
            })?;
        let number = values.next().and_then(|v| v.as_integer()).ok_or_else(|| {
            anyhow::anyhow!("Port '{}' on service '{}' requires a port number", name, hostname)
        })?;
        let protocol = match get_prop_string(port, "protocol") {
            Some(p) => p.parse().map_err(anyhow::Error::msg)?,
            None => PortProtocol::default(),
        };
        service.ports.push(ServicePort {
            name,
            port: to_port(number, "service")?,
            protocol,
        });
    }

    trace!(hostname = %hostname, ports = service.ports.len(), "Parsed service");
    Ok(service)
}

fn parse_endpoint(node: &kdl::KdlNode) -> Result<EndpointInstance> {
    let hostname = get_first_arg_string(node).ok_or_else(|| {
        anyhow::anyhow!(
            "Endpoint requires a service hostname argument, e.g., endpoint \"reviews\" port-name=\"http\" address=\"10.0.0.1\" port=9080"
        )
    })?;
    let port_name = get_prop_string(node, "port-name")
        .ok_or_else(|| anyhow::anyhow!("Endpoint for '{}' requires 'port-name'", hostname))?;
    let address = get_prop_string(node, "address")
        .ok_or_else(|| anyhow::anyhow!("Endpoint for '{}' requires 'address'", hostname))?;
    let port = get_prop_int(node, "port")
        .ok_or_else(|| anyhow::anyhow!("Endpoint for '{}' requires 'port'", hostname))?;

    Ok(EndpointInstance {
        hostname,
        port_name,
        address,
        port: to_port(port, "endpoint")?,
    })
}

fn parse_route(node: &kdl::KdlNode) -> Result<RouteSpec> {
    let name = get_first_arg_string(node).ok_or_else(|| {
        anyhow::anyhow!("Route requires a name argument, e.g., route \"http.80\" {{ ... }}")
    })?;
    let mut route = RouteSpec::new(&name);

    for vhost in children(node) {
        if vhost.name().value() != "virtual-host" {
            continue;
        }
        let vhost_name = get_first_arg_string(vhost).ok_or_else(|| {
            anyhow::anyhow!("Virtual host in route '{}' requires a name argument", name)
        })?;
        let cluster = get_prop_string(vhost, "cluster").ok_or_else(|| {
            anyhow::anyhow!(
                "Virtual host '{}' in route '{}' requires a 'cluster' property",
                vhost_name,
                name
            )
        })?;

        let mut domains: Vec<String> = get_prop_string(vhost, "domain").into_iter().collect();
        for entry in children(vhost) {
            if entry.name().value() == "domains" {
                domains.extend(args(entry).filter_map(|v| v.as_string()).map(str::to_string));
            }
        }
        if domains.is_empty() {
            domains.push("*".to_string());
        }

        route.virtual_hosts.push(VirtualHostSpec {
            name: vhost_name,
            domains,
            cluster,
        });
    }

    trace!(route = %name, virtual_hosts = route.virtual_hosts.len(), "Parsed route");
    Ok(route)
}

fn parse_listener(node: &kdl::KdlNode) -> Result<ListenerSpec> {
    let name = get_first_arg_string(node).ok_or_else(|| {
        anyhow::anyhow!("Listener requires a name argument, e.g., listener \"http-80\" port=80")
    })?;
    let port = get_prop_int(node, "port")
        .ok_or_else(|| anyhow::anyhow!("Listener '{}' requires a 'port' property", name))?;
    let applies_to = match get_prop_string(node, "applies-to") {
        Some(kind) => Some(kind.parse::<ProxyKind>().map_err(anyhow::Error::msg)?),
        None => None,
    };

    Ok(ListenerSpec {
        address: get_prop_string(node, "address").unwrap_or_else(|| "0.0.0.0".to_string()),
        port: to_port(port, "listener")?,
        route_config: get_prop_string(node, "route"),
        applies_to,
        name,
    })
}
