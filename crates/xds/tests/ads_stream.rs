//! End-to-end ADS stream behavior over in-memory channels.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use beacon_common::VersionClock;
use beacon_config::{DiscoveryConfig, EndpointInstance, MeshSeed, PortProtocol, RouteSpec, Service};
use beacon_xds::pb::envoy::config::core::v3::Node;
use beacon_xds::pb::envoy::config::endpoint::v3::ClusterLoadAssignment;
use beacon_xds::pb::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use beacon_xds::pb::google::rpc::Status as RpcStatus;
use beacon_xds::{
    DiscoveryServer, DiscoveryTasks, MemRegistry, CLUSTER_TYPE_URL, ENDPOINT_TYPE_URL,
    ROUTE_TYPE_URL,
};
use prost::Message;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;

const NODE_A: &str = "sidecar~10.1.1.1~app-a.default~default.svc.cluster.local";
const NODE_B: &str = "sidecar~10.1.1.2~app-b.default~default.svc.cluster.local";
const HELLO: &str = "hello.default.svc.cluster.local";
const HELLO_CLUSTER: &str = "outbound|80||hello.default.svc.cluster.local";

struct Harness {
    server: DiscoveryServer,
    registry: Arc<MemRegistry>,
    _tasks: DiscoveryTasks,
}

struct Client {
    requests: mpsc::Sender<Result<DiscoveryRequest, Status>>,
    responses: mpsc::Receiver<Result<DiscoveryResponse, Status>>,
    task: JoinHandle<()>,
}

fn seed() -> MeshSeed {
    MeshSeed {
        services: vec![
            Service::new(HELLO).with_port("http", 80, PortProtocol::Http),
            Service::new("world.default.svc.cluster.local").with_port("http", 443, PortProtocol::Http),
        ],
        endpoints: vec![EndpointInstance::new(HELLO, "http", "10.2.0.1", 8080)],
        routes: vec![
            RouteSpec::new("http.80").with_virtual_host("hello", vec!["hello".into()], HELLO_CLUSTER),
            RouteSpec::new("https.443").with_virtual_host(
                "world",
                vec!["world".into()],
                "outbound|443||world.default.svc.cluster.local",
            ),
        ],
        listeners: Vec::new(),
    }
}

fn harness() -> Harness {
    let (changes_tx, changes_rx) = mpsc::unbounded_channel();
    let registry = Arc::new(MemRegistry::seeded(
        Arc::new(VersionClock::new()),
        changes_tx,
        &seed(),
    ));
    let config = DiscoveryConfig {
        debounce_after_ms: 50,
        debounce_max_ms: 500,
        ..DiscoveryConfig::default()
    };
    let server = DiscoveryServer::new(config, registry.clone()).unwrap();
    let tasks = server.start(changes_rx).unwrap();
    Harness {
        server,
        registry,
        _tasks: tasks,
    }
}

impl Harness {
    fn connect(&self) -> Client {
        self.connect_with_buffer(16)
    }

    fn connect_with_buffer(&self, buffer: usize) -> Client {
        let (req_tx, req_rx) = mpsc::channel(16);
        let (resp_tx, resp_rx) = mpsc::channel(buffer);
        let server = self.server.clone();
        let task = tokio::spawn(async move {
            server.serve_stream(ReceiverStream::new(req_rx), resp_tx, None).await;
        });
        Client {
            requests: req_tx,
            responses: resp_rx,
            task,
        }
    }
}

impl Client {
    async fn send(&self, request: DiscoveryRequest) {
        self.requests.send(Ok(request)).await.unwrap();
    }

    async fn recv(&mut self) -> DiscoveryResponse {
        timeout(Duration::from_secs(2), self.responses.recv())
            .await
            .expect("timed out waiting for a response")
            .expect("response stream closed")
            .expect("stream error")
    }

    async fn assert_silent(&mut self) {
        let next = timeout(Duration::from_millis(300), self.responses.recv()).await;
        assert!(next.is_err(), "expected no response, got {:?}", next);
    }

    async fn disconnect(self) {
        drop(self.requests);
        self.task.await.unwrap();
    }
}

fn request(node: &str, type_url: &str, names: &[&str]) -> DiscoveryRequest {
    DiscoveryRequest {
        node: Some(Node {
            id: node.to_string(),
            ..Default::default()
        }),
        type_url: type_url.to_string(),
        resource_names: names.iter().map(|n| n.to_string()).collect(),
        ..Default::default()
    }
}

fn ack(node: &str, type_url: &str, names: &[&str], response: &DiscoveryResponse) -> DiscoveryRequest {
    DiscoveryRequest {
        version_info: response.version_info.clone(),
        response_nonce: response.nonce.clone(),
        ..request(node, type_url, names)
    }
}

fn nack(node: &str, type_url: &str, names: &[&str], response: &DiscoveryResponse) -> DiscoveryRequest {
    DiscoveryRequest {
        error_detail: Some(RpcStatus {
            code: 13,
            message: "rejected".to_string(),
            details: Vec::new(),
        }),
        ..ack(node, type_url, names, response)
    }
}

fn version(response: &DiscoveryResponse) -> u64 {
    response.version_info.parse().unwrap()
}

fn endpoint_count(response: &DiscoveryResponse) -> usize {
    response
        .resources
        .iter()
        .map(|any| ClusterLoadAssignment::decode(any.value.as_slice()).unwrap())
        .map(|cla| cla.endpoints.iter().map(|l| l.lb_endpoints.len()).sum::<usize>())
        .sum()
}

#[tokio::test]
async fn test_endpoint_change_reaches_subscriber() {
    let h = harness();
    let mut a = h.connect();

    a.send(request(NODE_A, ENDPOINT_TYPE_URL, &[HELLO_CLUSTER])).await;
    let first = a.recv().await;
    assert_eq!(endpoint_count(&first), 1);
    a.send(ack(NODE_A, ENDPOINT_TYPE_URL, &[HELLO_CLUSTER], &first)).await;

    h.registry.add_endpoint(HELLO, "http", 80, "10.2.0.2", 8080);
    let update = a.recv().await;
    assert!(version(&update) > version(&first));
    assert_eq!(endpoint_count(&update), 2);
    assert_ne!(update.nonce, first.nonce);

    a.assert_silent().await;
}

#[tokio::test]
async fn test_route_subscription_narrows() {
    let h = harness();
    let mut a = h.connect();

    a.send(request(NODE_A, ROUTE_TYPE_URL, &["http.80", "https.443"])).await;
    let both = a.recv().await;
    assert_eq!(both.resources.len(), 2);

    a.send(ack(NODE_A, ROUTE_TYPE_URL, &["http.80"], &both)).await;
    let one = a.recv().await;
    assert_eq!(one.resources.len(), 1);
    assert_ne!(one.nonce, both.nonce);
}

#[tokio::test]
async fn test_burst_of_changes_is_one_push() {
    let h = harness();
    let mut a = h.connect();

    a.send(request(NODE_A, CLUSTER_TYPE_URL, &[])).await;
    let first = a.recv().await;
    assert_eq!(first.resources.len(), 2);
    a.send(ack(NODE_A, CLUSTER_TYPE_URL, &[], &first)).await;

    for i in 0..20 {
        h.registry.add_service(
            Service::new(format!("svc-{}.default.svc.cluster.local", i))
                .with_port("http", 80, PortProtocol::Http),
        );
    }

    let update = a.recv().await;
    assert_eq!(update.resources.len(), 22);
    assert_eq!(update.version_info, h.registry.version().to_string());
    a.assert_silent().await;
}

#[tokio::test]
async fn test_push_all_suppressed_but_resync_resends() {
    let h = harness();
    let mut a = h.connect();

    a.send(request(NODE_A, CLUSTER_TYPE_URL, &[])).await;
    let first = a.recv().await;
    a.send(ack(NODE_A, CLUSTER_TYPE_URL, &[], &first)).await;

    h.server.push_all().unwrap();
    a.assert_silent().await;

    h.server.resync().unwrap();
    let resent = a.recv().await;
    assert_eq!(resent.version_info, first.version_info);
    assert_eq!(resent.resources, first.resources);
    assert_ne!(resent.nonce, first.nonce);

    let suppressed = h.server.metrics().push_suppressed.with_label_values(&["cds"]).get();
    assert!(suppressed >= 1);
}

#[tokio::test]
async fn test_nonces_are_unique() {
    let h = harness();
    let mut a = h.connect();
    let mut nonces = HashSet::new();

    a.send(request(NODE_A, CLUSTER_TYPE_URL, &[])).await;
    let mut last = a.recv().await;
    nonces.insert(last.nonce.clone());
    for _ in 0..5 {
        a.send(ack(NODE_A, CLUSTER_TYPE_URL, &[], &last)).await;
        h.server.resync().unwrap();
        last = a.recv().await;
        assert!(nonces.insert(last.nonce.clone()), "nonce {} reused", last.nonce);
    }
}

#[tokio::test]
async fn test_nack_does_not_regress_versions() {
    let h = harness();
    let mut a = h.connect();

    a.send(request(NODE_A, CLUSTER_TYPE_URL, &[])).await;
    let good = a.recv().await;
    a.send(ack(NODE_A, CLUSTER_TYPE_URL, &[], &good)).await;

    h.registry.add_service(Service::new("bad.default").with_port("http", 80, PortProtocol::Http));
    let rejected = a.recv().await;
    a.send(nack(NODE_A, CLUSTER_TYPE_URL, &["*"], &rejected)).await;
    a.assert_silent().await;

    let summaries = h.server.connections().summaries().await;
    let cds = &summaries[0].types[0];
    assert_eq!(cds.acked_version, good.version_info);
    assert_eq!(cds.last_sent_version, rejected.version_info);
    assert!(!cds.last_sent_acked);
    assert_eq!(cds.last_error.as_deref(), Some("rejected"));

    // Later changes still reach the proxy.
    h.registry.remove_service("bad.default");
    let next = a.recv().await;
    assert!(version(&next) > version(&rejected));
}

#[tokio::test]
async fn test_stale_nonce_is_ignored() {
    let h = harness();
    let mut a = h.connect();

    a.send(request(NODE_A, CLUSTER_TYPE_URL, &[])).await;
    let first = a.recv().await;
    h.registry.add_service(Service::new("new.default").with_port("http", 80, PortProtocol::Http));
    let second = a.recv().await;

    // The ACK for the first response arrives after the second was sent.
    a.send(ack(NODE_A, CLUSTER_TYPE_URL, &[], &first)).await;
    a.assert_silent().await;
    assert_eq!(h.server.metrics().stale_requests.get(), 1);

    a.send(ack(NODE_A, CLUSTER_TYPE_URL, &[], &second)).await;
    a.assert_silent().await;
    let summaries = h.server.connections().summaries().await;
    assert!(summaries[0].types[0].last_sent_acked);
    assert_eq!(summaries[0].types[0].acked_version, second.version_info);
}

#[tokio::test]
async fn test_reconnect_gets_full_state() {
    let h = harness();
    let mut a = h.connect();
    a.send(request(NODE_A, ENDPOINT_TYPE_URL, &[HELLO_CLUSTER])).await;
    let before = a.recv().await;
    a.disconnect().await;
    assert!(h.server.connections().is_empty());

    // Same proxy, new stream, remembering what it had.
    let mut b = h.connect();
    b.send(ack(NODE_A, ENDPOINT_TYPE_URL, &[HELLO_CLUSTER], &before)).await;
    let after = b.recv().await;
    assert_eq!(after.resources.len(), 1);
    assert_ne!(after.nonce, before.nonce);

    // And a fresh start with no memory at all.
    let mut c = h.connect();
    c.send(request(NODE_A, ENDPOINT_TYPE_URL, &[HELLO_CLUSTER])).await;
    assert_eq!(c.recv().await.resources.len(), 1);
    assert_eq!(h.server.connections().len(), 2);
}

#[tokio::test]
async fn test_requests_before_node_are_dropped() {
    let h = harness();
    let mut a = h.connect();

    let mut anonymous = request(NODE_A, CLUSTER_TYPE_URL, &[]);
    anonymous.node = None;
    a.send(anonymous).await;
    a.assert_silent().await;
    assert!(h.server.connections().is_empty());

    a.send(request(NODE_A, CLUSTER_TYPE_URL, &[])).await;
    a.recv().await;
    assert_eq!(h.server.connections().len(), 1);
    assert_eq!(h.server.metrics().connected_proxies.get(), 1);

    a.disconnect().await;
    assert_eq!(h.server.metrics().connected_proxies.get(), 0);
}

#[tokio::test]
async fn test_unknown_type_does_not_end_stream() {
    let h = harness();
    let mut a = h.connect();

    a.send(request(NODE_A, "type.googleapis.com/envoy.config.core.v3.Unknown", &[])).await;
    a.assert_silent().await;

    a.send(request(NODE_A, CLUSTER_TYPE_URL, &[])).await;
    assert_eq!(a.recv().await.type_url, CLUSTER_TYPE_URL);
}

#[tokio::test]
async fn test_slow_connection_does_not_block_others() {
    let h = harness();

    // B's buffer fills with its first response and it never reads again.
    let b = h.connect_with_buffer(1);
    b.send(request(NODE_B, CLUSTER_TYPE_URL, &[])).await;

    let mut a = h.connect();
    a.send(request(NODE_A, CLUSTER_TYPE_URL, &[])).await;
    let first = a.recv().await;
    a.send(ack(NODE_A, CLUSTER_TYPE_URL, &[], &first)).await;

    h.registry.add_service(Service::new("one.default").with_port("http", 80, PortProtocol::Http));
    let second = a.recv().await;
    a.send(ack(NODE_A, CLUSTER_TYPE_URL, &[], &second)).await;

    h.registry.add_service(Service::new("two.default").with_port("http", 80, PortProtocol::Http));
    let third = a.recv().await;
    assert_eq!(third.resources.len(), first.resources.len() + 2);

    drop(b);
}

#[tokio::test]
async fn test_close_all_ends_stalled_stream() {
    let h = harness();

    // Nothing is ever read, so the second response waits for buffer space.
    let b = h.connect_with_buffer(1);
    b.send(request(NODE_B, CLUSTER_TYPE_URL, &[])).await;
    b.send(request(NODE_B, ENDPOINT_TYPE_URL, &[HELLO_CLUSTER])).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.server.connections().len(), 1);

    assert_eq!(h.server.close_all(), 1);
    let Client {
        requests: _requests,
        responses: _responses,
        task,
    } = b;
    timeout(Duration::from_secs(2), task)
        .await
        .expect("stream still open after close_all")
        .unwrap();
    assert!(h.server.connections().is_empty());
}
