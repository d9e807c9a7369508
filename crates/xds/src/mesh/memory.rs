//! In-memory mesh registry.

use std::collections::BTreeSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use beacon_common::{Version, VersionClock};
use beacon_config::{EndpointInstance, ListenerSpec, MeshSeed, ResourceKind, RouteSpec, Service, ServicePort};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{ChangeEvent, MeshRegistry, MeshSnapshot};

/// A mutable registry holding the whole mesh in memory.
///
/// Each mutation is a commit: the snapshot is copied, changed, stamped
/// with a fresh version from the clock and published, then a
/// [`ChangeEvent`] is sent. Commits are serialized so published versions
/// increase in commit order. Readers never block.
pub struct MemRegistry {
    clock: Arc<VersionClock>,
    current: ArcSwap<MeshSnapshot>,
    commit: Mutex<()>,
    changes: mpsc::UnboundedSender<ChangeEvent>,
}

impl MemRegistry {
    pub fn new(clock: Arc<VersionClock>, changes: mpsc::UnboundedSender<ChangeEvent>) -> Self {
        let snapshot = MeshSnapshot {
            version: clock.current(),
            ..MeshSnapshot::empty()
        };
        Self {
            clock,
            current: ArcSwap::from_pointee(snapshot),
            commit: Mutex::new(()),
            changes,
        }
    }

    /// Create a registry seeded with declared mesh objects.
    pub fn seeded(
        clock: Arc<VersionClock>,
        changes: mpsc::UnboundedSender<ChangeEvent>,
        seed: &MeshSeed,
    ) -> Self {
        let registry = Self::new(clock, changes);
        registry.replace(seed);
        registry
    }

    /// Current version of the registry contents.
    pub fn version(&self) -> Version {
        self.current.load().version
    }

    /// Add or replace a service.
    pub fn add_service(&self, service: Service) -> Version {
        trace!(hostname = %service.hostname, "Adding service");
        self.commit(
            Some(&[ResourceKind::Clusters, ResourceKind::Endpoints]),
            |mesh| {
                mesh.services.insert(service.hostname.clone(), service);
            },
        )
    }

    /// Remove a service and its endpoint instances.
    pub fn remove_service(&self, hostname: &str) -> Version {
        trace!(hostname = %hostname, "Removing service");
        self.commit(
            Some(&[ResourceKind::Clusters, ResourceKind::Endpoints]),
            |mesh| {
                mesh.services.remove(hostname);
                mesh.endpoints.retain(|e| e.hostname != hostname);
            },
        )
    }

    /// Add an endpoint instance, declaring the service port if the
    /// service doesn't have it yet.
    pub fn add_endpoint(
        &self,
        hostname: &str,
        port_name: &str,
        service_port: u16,
        address: &str,
        port: u16,
    ) -> Version {
        trace!(
            hostname = %hostname,
            port_name = %port_name,
            address = %address,
            port = port,
            "Adding endpoint"
        );
        self.commit(
            Some(&[ResourceKind::Clusters, ResourceKind::Endpoints]),
            |mesh| {
                let service = mesh
                    .services
                    .entry(hostname.to_string())
                    .or_insert_with(|| Service::new(hostname));
                if service.port_named(port_name).is_none() {
                    service.ports.push(ServicePort {
                        name: port_name.to_string(),
                        port: service_port,
                        protocol: Default::default(),
                    });
                }
                let instance = EndpointInstance::new(hostname, port_name, address, port);
                if !mesh.endpoints.contains(&instance) {
                    mesh.endpoints.push(instance);
                }
            },
        )
    }

    /// Remove every instance of a service at `address:port`.
    pub fn remove_endpoint(&self, hostname: &str, address: &str, port: u16) -> Version {
        trace!(hostname = %hostname, address = %address, port = port, "Removing endpoint");
        self.commit(Some(&[ResourceKind::Endpoints]), |mesh| {
            mesh.endpoints
                .retain(|e| !(e.hostname == hostname && e.address == address && e.port == port));
        })
    }

    pub fn upsert_route(&self, route: RouteSpec) -> Version {
        trace!(route = %route.name, "Upserting route configuration");
        self.commit(Some(&[ResourceKind::Routes]), |mesh| {
            mesh.routes.insert(route.name.clone(), route);
        })
    }

    pub fn remove_route(&self, name: &str) -> Version {
        self.commit(Some(&[ResourceKind::Routes]), |mesh| {
            mesh.routes.remove(name);
        })
    }

    pub fn upsert_listener(&self, listener: ListenerSpec) -> Version {
        trace!(listener = %listener.name, "Upserting listener");
        self.commit(Some(&[ResourceKind::Listeners]), |mesh| {
            mesh.listeners.insert(listener.name.clone(), listener);
        })
    }

    pub fn remove_listener(&self, name: &str) -> Version {
        self.commit(Some(&[ResourceKind::Listeners]), |mesh| {
            mesh.listeners.remove(name);
        })
    }

    /// Replace the whole mesh with declared objects.
    pub fn replace(&self, seed: &MeshSeed) -> Version {
        let version = self.commit(None, |mesh| {
            let version = mesh.version;
            *mesh = MeshSnapshot::from_seed(seed, version);
        });
        debug!(
            version = %version,
            services = seed.services.len(),
            endpoints = seed.endpoints.len(),
            routes = seed.routes.len(),
            listeners = seed.listeners.len(),
            "Replaced mesh contents"
        );
        version
    }

    fn commit<F>(&self, kinds: Option<&[ResourceKind]>, mutate: F) -> Version
    where
        F: FnOnce(&mut MeshSnapshot),
    {
        let _guard = self.commit.lock();

        let mut next = MeshSnapshot::clone(&self.current.load());
        mutate(&mut next);
        let version = self.clock.bump();
        next.version = version;
        self.current.store(Arc::new(next));

        let event = ChangeEvent {
            version,
            kinds: kinds.map(|k| k.iter().copied().collect::<BTreeSet<_>>()),
        };
        if self.changes.send(event).is_err() {
            trace!(version = %version, "No change listener, event dropped");
        }
        version
    }
}

impl MeshRegistry for MemRegistry {
    fn snapshot(&self) -> Arc<MeshSnapshot> {
        self.current.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_seed, HELLO};
    use beacon_config::PortProtocol;

    fn registry() -> (MemRegistry, mpsc::UnboundedReceiver<ChangeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (MemRegistry::new(Arc::new(VersionClock::new()), tx), rx)
    }

    #[test]
    fn test_commits_bump_version_and_notify() {
        let (registry, mut rx) = registry();
        assert_eq!(registry.version(), Version::ZERO);

        let v1 = registry.add_service(Service::new(HELLO).with_port("http", 80, PortProtocol::Http));
        let v2 = registry.add_endpoint(HELLO, "http", 80, "10.1.0.1", 8080);
        assert!(v2 > v1);
        assert_eq!(registry.snapshot().version, v2);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.version, v1);
        assert!(first.kinds.unwrap().contains(&ResourceKind::Clusters));
        assert_eq!(rx.try_recv().unwrap().version, v2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_add_endpoint_declares_service() {
        let (registry, _rx) = registry();
        registry.add_endpoint("new.default", "http", 80, "10.0.0.1", 8080);
        registry.add_endpoint("new.default", "http", 80, "10.0.0.1", 8080);

        let snapshot = registry.snapshot();
        let service = snapshot.services.get("new.default").unwrap();
        assert_eq!(service.port_named("http").map(|p| p.port), Some(80));
        assert_eq!(snapshot.endpoints.len(), 1);
    }

    #[test]
    fn test_snapshots_are_immutable() {
        let (registry, _rx) = registry();
        registry.replace(&sample_seed());
        let before = registry.snapshot();

        registry.remove_service(HELLO);
        let after = registry.snapshot();

        assert!(before.services.contains_key(HELLO));
        assert!(!after.services.contains_key(HELLO));
        assert!(after.endpoints.iter().all(|e| e.hostname != HELLO));
        assert!(after.version > before.version);
    }

    #[test]
    fn test_replace_is_a_full_change() {
        let (registry, mut rx) = registry();
        let version = registry.replace(&sample_seed());
        let event = rx.try_recv().unwrap();
        assert_eq!(event, ChangeEvent::full(version));
        assert_eq!(registry.snapshot().routes.len(), 2);
    }

    #[test]
    fn test_dropped_listener_does_not_fail_commits() {
        let (registry, rx) = registry();
        drop(rx);
        let version = registry.upsert_route(RouteSpec::new("http.80"));
        assert_eq!(registry.snapshot().version, version);
    }

    #[test]
    fn test_concurrent_commits_publish_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = Arc::new(MemRegistry::new(Arc::new(VersionClock::new()), tx));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..50u16 {
                        registry.add_endpoint(HELLO, "http", 80, &format!("10.{}.0.1", t), i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut last = Version::ZERO;
        while let Ok(event) = rx.try_recv() {
            assert!(event.version > last);
            last = event.version;
        }
        assert_eq!(last, registry.version());
        assert_eq!(registry.snapshot().endpoints.len(), 200);
    }
}
