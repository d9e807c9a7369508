//! Resource generation.
//!
//! A [`ResourceGenerator`] turns a mesh snapshot into the resources of one
//! type for one proxy. The [`GeneratorTable`] maps type URLs to generators
//! and fingerprints what they produce so pushes of unchanged content can
//! be skipped.

mod cluster;
mod endpoint;
mod listener;
mod route;

pub use cluster::ClusterGenerator;
pub use endpoint::EndpointGenerator;
pub use listener::ListenerGenerator;
pub use route::RouteGenerator;

use std::collections::HashMap;
use std::sync::Arc;

use beacon_common::Version;
use beacon_config::{ResourceKind, WildcardPolicies, WildcardPolicy};
use envoy_types::pb::envoy::config::core::v3::{
    address, config_source, socket_address, Address, AggregatedConfigSource, ApiVersion,
    ConfigSource, SocketAddress,
};
use tracing::trace;
use xxhash_rust::xxh3::Xxh3;

use crate::error::GenerateError;
use crate::identity::ProxyIdentity;
use crate::mesh::MeshSnapshot;
use crate::resource::{type_url_for, Resource, Subscription};

/// What to generate.
#[derive(Debug, Clone, Copy)]
pub struct GenerateRequest<'a> {
    pub type_url: &'a str,
    pub proxy: &'a ProxyIdentity,
    pub subscription: &'a Subscription,
}

/// Produces the resources of one type.
///
/// Generators are pure functions of their inputs: the same snapshot,
/// proxy and subscription must yield the same resources.
pub trait ResourceGenerator: Send + Sync {
    fn generate(
        &self,
        request: &GenerateRequest<'_>,
        mesh: &MeshSnapshot,
    ) -> Result<Vec<Resource>, GenerateError>;
}

/// Output of a generation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Generated {
    /// Resources ordered by name.
    pub resources: Vec<Resource>,
    /// Version of the snapshot they were built from.
    pub version: Version,
    /// Fingerprint of the encoded resources.
    pub digest: u64,
}

struct Registration {
    generator: Arc<dyn ResourceGenerator>,
    wildcard: WildcardPolicy,
}

/// Type URL to generator mapping.
#[derive(Default)]
pub struct GeneratorTable {
    generators: HashMap<String, Registration>,
}

impl GeneratorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with the built-in listener, route, cluster and endpoint
    /// generators.
    pub fn with_defaults(wildcard: &WildcardPolicies) -> Self {
        let mut table = Self::new();
        let builtins: [(ResourceKind, Arc<dyn ResourceGenerator>); 4] = [
            (ResourceKind::Listeners, Arc::new(ListenerGenerator)),
            (ResourceKind::Routes, Arc::new(RouteGenerator)),
            (ResourceKind::Clusters, Arc::new(ClusterGenerator)),
            (ResourceKind::Endpoints, Arc::new(EndpointGenerator)),
        ];
        for (kind, generator) in builtins {
            table.register(type_url_for(kind), generator, wildcard.get(kind));
        }
        table
    }

    /// Register a generator, replacing any previous one for the type.
    pub fn register(
        &mut self,
        type_url: impl Into<String>,
        generator: Arc<dyn ResourceGenerator>,
        wildcard: WildcardPolicy,
    ) {
        let type_url = type_url.into();
        trace!(type_url = %type_url, wildcard = ?wildcard, "Registering generator");
        self.generators.insert(type_url, Registration { generator, wildcard });
    }

    pub fn contains(&self, type_url: &str) -> bool {
        self.generators.contains_key(type_url)
    }

    /// Wildcard policy of a registered type.
    pub fn wildcard_policy(&self, type_url: &str) -> Option<WildcardPolicy> {
        self.generators.get(type_url).map(|r| r.wildcard)
    }

    pub fn type_urls(&self) -> impl Iterator<Item = &str> {
        self.generators.keys().map(String::as_str)
    }

    /// Generate the resources for a request from one snapshot.
    pub fn generate(
        &self,
        request: &GenerateRequest<'_>,
        mesh: &MeshSnapshot,
    ) -> Result<Generated, GenerateError> {
        let registration = self
            .generators
            .get(request.type_url)
            .ok_or_else(|| GenerateError::UnknownType(request.type_url.to_string()))?;

        let mut resources = registration.generator.generate(request, mesh)?;
        resources.sort_by(|a, b| a.name.cmp(&b.name));
        resources.dedup_by(|a, b| a.name == b.name);

        Ok(Generated {
            digest: digest(request.type_url, &resources),
            version: mesh.version,
            resources,
        })
    }
}

fn digest(type_url: &str, resources: &[Resource]) -> u64 {
    let mut hasher = Xxh3::new();
    hasher.update(type_url.as_bytes());
    for resource in resources {
        hasher.update(&(resource.name.len() as u64).to_le_bytes());
        hasher.update(resource.name.as_bytes());
        hasher.update(resource.payload.type_url.as_bytes());
        hasher.update(&(resource.payload.value.len() as u64).to_le_bytes());
        hasher.update(&resource.payload.value);
    }
    hasher.digest()
}

/// Config source pointing back at this ADS stream.
pub(crate) fn ads_config_source() -> ConfigSource {
    ConfigSource {
        config_source_specifier: Some(config_source::ConfigSourceSpecifier::Ads(
            AggregatedConfigSource {},
        )),
        resource_api_version: ApiVersion::V3 as i32,
        ..Default::default()
    }
}

pub(crate) fn socket_address(ip: &str, port: u16) -> Address {
    Address {
        address: Some(address::Address::SocketAddress(SocketAddress {
            address: ip.to_string(),
            port_specifier: Some(socket_address::PortSpecifier::PortValue(u32::from(port))),
            ..Default::default()
        })),
    }
}
