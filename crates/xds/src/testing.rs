//! Shared fixtures for unit tests.

use beacon_config::{EndpointInstance, ListenerSpec, MeshSeed, PortProtocol, RouteSpec, Service};

pub(crate) const HELLO: &str = "hello.default.svc.cluster.local";
pub(crate) const WORLD: &str = "world.default.svc.cluster.local";

pub(crate) fn sample_seed() -> MeshSeed {
    MeshSeed {
        services: vec![
            Service::new(HELLO)
                .with_port("http", 80, PortProtocol::Http)
                .with_port("grpc", 9090, PortProtocol::Grpc),
            Service::new(WORLD).with_port("http", 8080, PortProtocol::Http),
        ],
        endpoints: vec![
            EndpointInstance::new(HELLO, "http", "10.1.0.2", 8080),
            EndpointInstance::new(HELLO, "http", "10.1.0.1", 8080),
            EndpointInstance::new(HELLO, "grpc", "10.1.0.1", 9090),
        ],
        routes: vec![
            RouteSpec::new("http.80").with_virtual_host(
                "hello",
                vec!["hello".to_string()],
                "outbound|80||hello.default.svc.cluster.local",
            ),
            RouteSpec::new("https.443").with_virtual_host(
                "world",
                vec!["world".to_string()],
                "outbound|8080||world.default.svc.cluster.local",
            ),
        ],
        listeners: vec![ListenerSpec::new("http-80", "0.0.0.0", 80).with_route_config("http.80")],
    }
}
