//! The mesh model resources are generated from.
//!
//! A [`MeshSnapshot`] is an immutable, versioned view of the mesh. Registries
//! publish a new snapshot on every commit and announce it with a
//! [`ChangeEvent`]; generators only ever read snapshots.

mod memory;

pub use memory::MemRegistry;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use beacon_common::Version;
use beacon_config::{
    outbound_cluster_name, EndpointInstance, ListenerSpec, MeshSeed, ResourceKind, RouteSpec,
    Service, ServicePort,
};

/// Source of mesh snapshots.
pub trait MeshRegistry: Send + Sync {
    /// The latest committed snapshot.
    fn snapshot(&self) -> Arc<MeshSnapshot>;
}

/// Notification that a registry committed a new snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub version: Version,
    /// Resource kinds affected, `None` when everything may have changed.
    pub kinds: Option<BTreeSet<ResourceKind>>,
}

impl ChangeEvent {
    pub fn full(version: Version) -> Self {
        Self {
            version,
            kinds: None,
        }
    }

    pub fn affecting(version: Version, kinds: impl IntoIterator<Item = ResourceKind>) -> Self {
        Self {
            version,
            kinds: Some(kinds.into_iter().collect()),
        }
    }
}

/// An immutable view of the mesh at one version.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshSnapshot {
    pub version: Version,
    pub services: BTreeMap<String, Service>,
    pub endpoints: Vec<EndpointInstance>,
    pub routes: BTreeMap<String, RouteSpec>,
    pub listeners: BTreeMap<String, ListenerSpec>,
}

impl MeshSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a snapshot from declared mesh objects.
    ///
    /// Later declarations of the same service, route or listener replace
    /// earlier ones.
    pub fn from_seed(seed: &MeshSeed, version: Version) -> Self {
        Self {
            version,
            services: seed
                .services
                .iter()
                .map(|s| (s.hostname.clone(), s.clone()))
                .collect(),
            endpoints: seed.endpoints.clone(),
            routes: seed
                .routes
                .iter()
                .map(|r| (r.name.clone(), r.clone()))
                .collect(),
            listeners: seed
                .listeners
                .iter()
                .map(|l| (l.name.clone(), l.clone()))
                .collect(),
        }
    }

    /// Every outbound cluster, ordered by service hostname then port.
    pub fn clusters(&self) -> impl Iterator<Item = (String, &Service, &ServicePort)> {
        self.services.values().flat_map(|service| {
            service
                .ports
                .iter()
                .map(move |port| (outbound_cluster_name(&service.hostname, port.port), service, port))
        })
    }

    /// Look up the service port behind a cluster.
    pub fn cluster(&self, hostname: &str, port: u16) -> Option<(&Service, &ServicePort)> {
        let service = self.services.get(hostname)?;
        let service_port = service.ports.iter().find(|p| p.port == port)?;
        Some((service, service_port))
    }

    pub fn has_cluster(&self, name: &str) -> bool {
        beacon_config::parse_outbound_cluster_name(name)
            .and_then(|(hostname, port)| self.cluster(hostname, port))
            .is_some()
    }

    /// Endpoint instances serving a named port of a service, ordered by
    /// address and port.
    pub fn endpoints_for(&self, hostname: &str, port_name: &str) -> Vec<&EndpointInstance> {
        let mut instances: Vec<&EndpointInstance> = self
            .endpoints
            .iter()
            .filter(|e| e.hostname == hostname && e.port_name == port_name)
            .collect();
        instances.sort_by(|a, b| (&a.address, a.port).cmp(&(&b.address, b.port)));
        instances
    }
}
