//! Declarative mesh objects: services, endpoint instances, route
//! configurations and listeners.
//!
//! These are the raw inputs the discovery engine turns into Envoy
//! resources. They are deliberately flat; everything derived (cluster
//! names, load assignments) is computed by the generators.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Application protocol spoken on a service port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortProtocol {
    #[default]
    Http,
    Http2,
    Grpc,
    Tcp,
}

impl FromStr for PortProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" => Ok(PortProtocol::Http),
            "http2" | "h2" => Ok(PortProtocol::Http2),
            "grpc" => Ok(PortProtocol::Grpc),
            "tcp" => Ok(PortProtocol::Tcp),
            other => Err(format!(
                "invalid protocol '{}'. Valid protocols: http, http2, grpc, tcp",
                other
            )),
        }
    }
}

/// Kind of data-plane proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyKind {
    Sidecar,
    Router,
    #[default]
    Unknown,
}

impl ProxyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyKind::Sidecar => "sidecar",
            ProxyKind::Router => "router",
            ProxyKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sidecar" => Ok(ProxyKind::Sidecar),
            "router" | "gateway" | "ingress" => Ok(ProxyKind::Router),
            other => Err(format!(
                "invalid proxy kind '{}'. Valid kinds: sidecar, router",
                other
            )),
        }
    }
}

/// A named port on a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServicePort {
    pub name: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: PortProtocol,
}

/// A mesh service addressed by hostname.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Service {
    pub hostname: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
}

impl Service {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            address: None,
            ports: Vec::new(),
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_port(mut self, name: impl Into<String>, port: u16, protocol: PortProtocol) -> Self {
        self.ports.push(ServicePort {
            name: name.into(),
            port,
            protocol,
        });
        self
    }

    pub fn port_named(&self, name: &str) -> Option<&ServicePort> {
        self.ports.iter().find(|p| p.name == name)
    }
}

/// One workload instance backing a service port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointInstance {
    /// Hostname of the owning service
    pub hostname: String,
    /// Name of the service port this instance serves
    pub port_name: String,
    pub address: String,
    pub port: u16,
}

impl EndpointInstance {
    pub fn new(
        hostname: impl Into<String>,
        port_name: impl Into<String>,
        address: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            port_name: port_name.into(),
            address: address.into(),
            port,
        }
    }
}

/// A virtual host inside a route configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VirtualHostSpec {
    pub name: String,
    #[serde(default)]
    pub domains: Vec<String>,
    /// Cluster all traffic for this host is sent to
    pub cluster: String,
}

/// A named route configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteSpec {
    pub name: String,
    #[serde(default)]
    pub virtual_hosts: Vec<VirtualHostSpec>,
}

impl RouteSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            virtual_hosts: Vec::new(),
        }
    }

    pub fn with_virtual_host(
        mut self,
        name: impl Into<String>,
        domains: Vec<String>,
        cluster: impl Into<String>,
    ) -> Self {
        self.virtual_hosts.push(VirtualHostSpec {
            name: name.into(),
            domains,
            cluster: cluster.into(),
        });
        self
    }
}

/// A listener handed to proxies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenerSpec {
    pub name: String,
    pub address: String,
    pub port: u16,
    /// Route configuration served by this listener, fetched over RDS
    #[serde(default)]
    pub route_config: Option<String>,
    /// Restrict the listener to one kind of proxy
    #[serde(default)]
    pub applies_to: Option<ProxyKind>,
}

impl ListenerSpec {
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
            route_config: None,
            applies_to: None,
        }
    }

    pub fn with_route_config(mut self, route: impl Into<String>) -> Self {
        self.route_config = Some(route.into());
        self
    }

    pub fn applies_to(mut self, kind: ProxyKind) -> Self {
        self.applies_to = Some(kind);
        self
    }
}

/// Static mesh content declared in the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshSeed {
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub endpoints: Vec<EndpointInstance>,
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
    #[serde(default)]
    pub listeners: Vec<ListenerSpec>,
}

impl MeshSeed {
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
            && self.endpoints.is_empty()
            && self.routes.is_empty()
            && self.listeners.is_empty()
    }
}

/// Name of the outbound cluster for a service port.
pub fn outbound_cluster_name(hostname: &str, port: u16) -> String {
    format!("outbound|{}||{}", port, hostname)
}

/// Split an outbound cluster name into `(hostname, port)`.
pub fn parse_outbound_cluster_name(name: &str) -> Option<(&str, u16)> {
    let mut parts = name.splitn(4, '|');
    if parts.next()? != "outbound" {
        return None;
    }
    let port = parts.next()?.parse().ok()?;
    let _subset = parts.next()?;
    let hostname = parts.next()?;
    if hostname.is_empty() {
        return None;
    }
    Some((hostname, port))
}
