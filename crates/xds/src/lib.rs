//! Aggregated discovery service engine.
//!
//! Serves Envoy v3 listeners, routes, clusters and endpoints over a single
//! State-of-the-World ADS stream per proxy:
//!
//! - each stream gets a [`Connection`] with per-type protocol state
//! - requests are classified as subscriptions, ACKs, NACKs or stale
//! - registry changes are debounced into push jobs
//! - pushes fan out to connections independently and skip proxies that
//!   already have identical content
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use beacon_common::VersionClock;
//! use beacon_xds::{AdsServer, DiscoveryServer, MemRegistry};
//!
//! let (changes_tx, changes_rx) = tokio::sync::mpsc::unbounded_channel();
//! let registry = Arc::new(MemRegistry::new(Arc::new(VersionClock::new()), changes_tx));
//! let discovery = DiscoveryServer::new(config.discovery, registry.clone())?;
//! let _tasks = discovery.start(changes_rx)?;
//! AdsServer::new(discovery).run(addr, shutdown).await?;
//! ```

pub mod connection;
pub mod debounce;
pub mod discovery;
pub mod error;
pub mod generate;
pub mod identity;
pub mod mesh;
pub mod metrics;
pub mod resource;
pub mod scheduler;
pub mod server;
pub mod stream;

#[cfg(test)]
mod testing;

pub use connection::{Connection, ConnectionRegistry, ConnectionSummary, TypeState, TypeSummary};
pub use debounce::{DebounceState, Debouncer};
pub use discovery::{DiscoveryServer, DiscoveryTasks};
pub use error::{GenerateError, XdsError};
pub use generate::{Generated, GenerateRequest, GeneratorTable, ResourceGenerator};
pub use identity::ProxyIdentity;
pub use mesh::{ChangeEvent, MemRegistry, MeshRegistry, MeshSnapshot};
pub use metrics::XdsMetrics;
pub use resource::{
    Resource, Subscription, CLUSTER_TYPE_URL, ENDPOINT_TYPE_URL, LISTENER_TYPE_URL, ROUTE_TYPE_URL,
};
pub use scheduler::{PushJob, PushReason, PushScheduler, PushTargets};
pub use server::{AdsServer, AdsService};
pub use stream::{PushOutcome, StreamHandler, SyncResult};

/// Envoy protobuf types used on the wire.
pub use envoy_types::pb;
