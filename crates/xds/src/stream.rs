//! ADS protocol handling for one connection.
//!
//! Every request is classified against the connection's state for its
//! type:
//!
//! - first request for a type nothing was sent for yet, with or without
//!   a nonce from a previous stream: subscribe and respond
//! - no nonce on a known type: resubscribe and respond
//! - nonce of the last response, no error: ACK, respond only if the
//!   subscription changed
//! - nonce of the last response with an error: NACK, record it and keep
//!   the proxy where it is; an empty name list also unsubscribes
//! - any other nonce: stale, ignored apart from refreshing the
//!   subscription

use std::sync::Arc;

use beacon_common::mint_nonce;
use envoy_types::pb::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use tracing::{debug, trace, warn};

use crate::connection::{Connection, ConnectionState, TypeState};
use crate::discovery::DiscoveryServer;
use crate::error::XdsError;
use crate::generate::GenerateRequest;
use crate::mesh::MeshSnapshot;
use crate::resource::{type_label, Subscription};
use crate::scheduler::PushJob;

/// What happened to one type during a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncResult {
    Sent,
    /// The proxy already has identical content.
    Suppressed,
    Unsubscribed,
    /// Generation failed; nothing was sent.
    Failed,
}

/// Tally of a push across a connection's types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushOutcome {
    pub sent: usize,
    pub suppressed: usize,
    pub failed: usize,
}

/// Drives the protocol for a single connection.
#[derive(Clone)]
pub struct StreamHandler {
    connection: Arc<Connection>,
    server: DiscoveryServer,
}

impl StreamHandler {
    pub fn new(connection: Arc<Connection>, server: DiscoveryServer) -> Self {
        Self { connection, server }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Process one request from the proxy.
    ///
    /// Only [`XdsError::ConnectionClosed`] means the stream is done; other
    /// errors reject this request alone.
    pub async fn handle_request(&self, request: DiscoveryRequest) -> Result<(), XdsError> {
        let type_url = request.type_url.as_str();
        let policy = self
            .server
            .generators()
            .wildcard_policy(type_url)
            .ok_or_else(|| XdsError::UnknownType(type_url.to_string()))?;
        let requested = Subscription::from_request(&request.resource_names, policy);
        let nonce = request.response_nonce.as_str();

        let mut state = self.connection.state().lock().await;
        if state.types.get(type_url).map_or(true, |ts| !ts.has_sent()) {
            return self.subscribe(&mut state, &request, requested).await;
        }
        let Some(ts) = state.types.get_mut(type_url) else {
            return Ok(());
        };

        if nonce.is_empty() {
            trace!(
                connection_id = %self.connection.id(),
                resource_type = type_label(type_url),
                subscription = %requested,
                "Request without nonce, resubscribing"
            );
            ts.subscription = requested;
            return self.respond(ts, type_url).await;
        }

        if nonce != ts.last_sent_nonce {
            self.server.metrics().stale_requests.inc();
            debug!(
                connection_id = %self.connection.id(),
                resource_type = type_label(type_url),
                expected = %ts.last_sent_nonce,
                received = %nonce,
                "Ignoring request with stale nonce"
            );
            let same_node = request.node.as_ref().map_or(true, |node| {
                node.id.is_empty() || node.id == self.connection.node_id().as_str()
            });
            if same_node && ts.subscription != requested {
                trace!(subscription = %requested, "Refreshing subscription from stale request");
                ts.subscription = requested;
            }
            return Ok(());
        }

        if let Some(status) = &request.error_detail {
            self.server.metrics().record_nack(type_url);
            warn!(
                connection_id = %self.connection.id(),
                node_id = %self.connection.node_id(),
                resource_type = type_label(type_url),
                rejected_version = %ts.last_sent_version,
                current_version = %ts.acked_version,
                code = status.code,
                error = %status.message,
                "Proxy rejected configuration"
            );
            ts.last_sent_acked = false;
            ts.last_error = Some(status.message.clone());
            // A rejection naming nothing drops the type until the proxy
            // asks for it again, whatever the wildcard policy.
            let requested = if request.resource_names.is_empty() {
                Subscription::default()
            } else {
                requested
            };
            if ts.subscription != requested {
                debug!(subscription = %requested, "Subscription changed on NACK");
                ts.subscription = requested;
            }
            return Ok(());
        }

        ts.last_sent_acked = true;
        ts.acked_version = ts.last_sent_version.clone();
        ts.last_error = None;
        trace!(
            connection_id = %self.connection.id(),
            resource_type = type_label(type_url),
            version = %ts.acked_version,
            "Proxy acknowledged configuration"
        );

        if ts.subscription == requested {
            return Ok(());
        }
        debug!(
            connection_id = %self.connection.id(),
            resource_type = type_label(type_url),
            from = %ts.subscription,
            to = %requested,
            "Subscription changed"
        );
        ts.subscription = requested;
        self.respond(ts, type_url).await
    }

    /// Push the latest content for every subscribed type the job covers.
    pub async fn push(&self, job: &PushJob) -> Result<PushOutcome, XdsError> {
        let mut state = self.connection.state().lock().await;
        let mesh = self.server.registry().snapshot();
        let mut outcome = PushOutcome::default();

        for type_url in state.subscribed_types() {
            let Some(ts) = state.types.get_mut(&type_url) else {
                continue;
            };
            match self.sync_type(ts, &type_url, &mesh, job.force).await? {
                SyncResult::Sent => outcome.sent += 1,
                SyncResult::Suppressed => outcome.suppressed += 1,
                SyncResult::Failed => outcome.failed += 1,
                SyncResult::Unsubscribed => {}
            }
        }

        trace!(
            connection_id = %self.connection.id(),
            sent = outcome.sent,
            suppressed = outcome.suppressed,
            failed = outcome.failed,
            reason = %job.reason,
            "Push complete"
        );
        Ok(outcome)
    }

    async fn subscribe(
        &self,
        state: &mut ConnectionState,
        request: &DiscoveryRequest,
        subscription: Subscription,
    ) -> Result<(), XdsError> {
        let type_url = request.type_url.as_str();
        if request.response_nonce.is_empty() {
            debug!(
                connection_id = %self.connection.id(),
                resource_type = type_label(type_url),
                subscription = %subscription,
                "New subscription"
            );
        } else {
            debug!(
                connection_id = %self.connection.id(),
                resource_type = type_label(type_url),
                subscription = %subscription,
                version = %request.version_info,
                "Resuming subscription from a previous stream"
            );
        }

        let ts = state.types.entry(type_url.to_string()).or_default();
        ts.subscription = subscription;
        ts.acked_version = request.version_info.clone();
        self.respond(ts, type_url).await
    }

    /// Answer a request directly: always sends unless nothing is
    /// subscribed or generation fails.
    async fn respond(&self, ts: &mut TypeState, type_url: &str) -> Result<(), XdsError> {
        if !ts.is_subscribed() {
            debug!(
                connection_id = %self.connection.id(),
                resource_type = type_label(type_url),
                "Nothing subscribed, no response"
            );
            return Ok(());
        }
        let mesh = self.server.registry().snapshot();
        self.sync_type(ts, type_url, &mesh, true).await.map(|_| ())
    }

    async fn sync_type(
        &self,
        ts: &mut TypeState,
        type_url: &str,
        mesh: &MeshSnapshot,
        force: bool,
    ) -> Result<SyncResult, XdsError> {
        if !ts.is_subscribed() {
            return Ok(SyncResult::Unsubscribed);
        }

        let request = GenerateRequest {
            type_url,
            proxy: self.connection.proxy(),
            subscription: &ts.subscription,
        };
        let generated = match self.server.generators().generate(&request, mesh) {
            Ok(generated) => generated,
            Err(e) => {
                self.server.metrics().record_generate_error(type_url);
                warn!(
                    connection_id = %self.connection.id(),
                    node_id = %self.connection.node_id(),
                    resource_type = type_label(type_url),
                    version = %mesh.version,
                    error = %e,
                    "Failed to generate resources, proxy keeps its current configuration"
                );
                return Ok(SyncResult::Failed);
            }
        };

        if !force && ts.last_sent_digest == Some(generated.digest) {
            self.server.metrics().record_suppressed(type_url);
            trace!(
                connection_id = %self.connection.id(),
                resource_type = type_label(type_url),
                version = %generated.version,
                "Content unchanged, push suppressed"
            );
            return Ok(SyncResult::Suppressed);
        }

        let nonce = mint_nonce();
        let version = generated.version.to_string();
        let resources: Vec<_> = generated.resources.into_iter().map(|r| r.payload).collect();
        let count = resources.len();
        let response = DiscoveryResponse {
            version_info: version.clone(),
            resources,
            type_url: type_url.to_string(),
            nonce: nonce.clone(),
            ..Default::default()
        };
        self.connection.send(response).await?;

        debug!(
            connection_id = %self.connection.id(),
            node_id = %self.connection.node_id(),
            resource_type = type_label(type_url),
            version = %version,
            nonce = %nonce,
            resources = count,
            "Sent discovery response"
        );
        ts.last_sent_version = version;
        ts.last_sent_nonce = nonce;
        ts.last_sent_digest = Some(generated.digest);
        ts.last_sent_acked = false;
        ts.responses_sent += 1;
        self.server.metrics().record_push(type_url);
        Ok(SyncResult::Sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::MemRegistry;
    use crate::resource::{CLUSTER_TYPE_URL, ENDPOINT_TYPE_URL, ROUTE_TYPE_URL};
    use crate::testing::{sample_seed, HELLO};
    use beacon_common::{ConnectionId, VersionClock};
    use beacon_config::DiscoveryConfig;
    use envoy_types::pb::envoy::config::core::v3::Node;
    use envoy_types::pb::google::rpc::Status as RpcStatus;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tonic::Status;

    const NODE: &str = "sidecar~10.1.1.1~app.default~default.svc.cluster.local";

    struct Fixture {
        registry: Arc<MemRegistry>,
        handler: StreamHandler,
        responses: mpsc::Receiver<Result<DiscoveryResponse, Status>>,
    }

    impl Fixture {
        fn new() -> Self {
            let (changes, _) = mpsc::unbounded_channel();
            let registry = Arc::new(MemRegistry::seeded(
                Arc::new(VersionClock::new()),
                changes,
                &sample_seed(),
            ));
            let server = DiscoveryServer::new(DiscoveryConfig::fast(), registry.clone()).unwrap();
            let (tx, responses) = mpsc::channel(16);
            let connection = Arc::new(Connection::new(
                ConnectionId::new(),
                crate::identity::ProxyIdentity::new(NODE),
                tx,
                CancellationToken::new(),
            ));
            Self {
                registry,
                handler: StreamHandler::new(connection, server),
                responses,
            }
        }

        async fn send(&self, request: DiscoveryRequest) {
            self.handler.handle_request(request).await.unwrap();
        }

        fn response(&mut self) -> DiscoveryResponse {
            self.responses.try_recv().expect("expected a response").unwrap()
        }

        fn assert_silent(&mut self) {
            assert!(self.responses.try_recv().is_err(), "expected no response");
        }

        async fn type_state(&self, type_url: &str) -> TypeState {
            self.handler.connection().state().lock().await.types[type_url].clone()
        }
    }

    fn request(type_url: &str, names: &[&str]) -> DiscoveryRequest {
        DiscoveryRequest {
            node: Some(Node {
                id: NODE.to_string(),
                ..Default::default()
            }),
            type_url: type_url.to_string(),
            resource_names: names.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        }
    }

    fn ack(type_url: &str, names: &[&str], response: &DiscoveryResponse) -> DiscoveryRequest {
        DiscoveryRequest {
            version_info: response.version_info.clone(),
            response_nonce: response.nonce.clone(),
            ..request(type_url, names)
        }
    }

    fn nack(type_url: &str, names: &[&str], response: &DiscoveryResponse) -> DiscoveryRequest {
        DiscoveryRequest {
            error_detail: Some(RpcStatus {
                code: 3,
                message: "bad config".to_string(),
                details: Vec::new(),
            }),
            ..ack(type_url, names, response)
        }
    }

    #[tokio::test]
    async fn test_initial_request_gets_response() {
        let mut fx = Fixture::new();
        fx.send(request(CLUSTER_TYPE_URL, &[])).await;

        let response = fx.response();
        assert_eq!(response.type_url, CLUSTER_TYPE_URL);
        assert_eq!(response.resources.len(), 3);
        assert_eq!(response.version_info, fx.registry.version().to_string());
        assert!(!response.nonce.is_empty());

        let ts = fx.type_state(CLUSTER_TYPE_URL).await;
        assert_eq!(ts.last_sent_nonce, response.nonce);
        assert!(!ts.last_sent_acked);
    }

    #[tokio::test]
    async fn test_ack_without_change_is_silent() {
        let mut fx = Fixture::new();
        fx.send(request(CLUSTER_TYPE_URL, &[])).await;
        let response = fx.response();

        fx.send(ack(CLUSTER_TYPE_URL, &[], &response)).await;
        fx.assert_silent();

        let ts = fx.type_state(CLUSTER_TYPE_URL).await;
        assert!(ts.last_sent_acked);
        assert_eq!(ts.acked_version, response.version_info);
    }

    #[tokio::test]
    async fn test_nack_keeps_versions() {
        let mut fx = Fixture::new();
        fx.send(request(CLUSTER_TYPE_URL, &[])).await;
        let first = fx.response();
        fx.send(ack(CLUSTER_TYPE_URL, &[], &first)).await;

        fx.registry.add_endpoint("extra.default", "http", 80, "10.9.0.1", 80);
        fx.handler.push(&PushJob::push_all()).await.unwrap();
        let second = fx.response();
        assert!(second.version_info.parse::<u64>().unwrap() > first.version_info.parse::<u64>().unwrap());

        fx.send(nack(CLUSTER_TYPE_URL, &[], &second)).await;
        fx.assert_silent();

        let ts = fx.type_state(CLUSTER_TYPE_URL).await;
        assert!(!ts.last_sent_acked);
        assert_eq!(ts.acked_version, first.version_info);
        assert_eq!(ts.last_sent_version, second.version_info);
        assert_eq!(ts.last_error.as_deref(), Some("bad config"));
        assert_eq!(fx.handler.server.metrics().nacks.with_label_values(&["cds"]).get(), 1);
    }

    #[tokio::test]
    async fn test_nack_with_empty_names_unsubscribes() {
        let mut fx = Fixture::new();
        fx.send(request(CLUSTER_TYPE_URL, &[])).await;
        let first = fx.response();

        fx.send(nack(CLUSTER_TYPE_URL, &[], &first)).await;
        fx.assert_silent();
        assert!(!fx.type_state(CLUSTER_TYPE_URL).await.is_subscribed());

        let outcome = fx.handler.push(&PushJob::resync()).await.unwrap();
        assert_eq!(outcome, PushOutcome::default());
        fx.assert_silent();

        // Asking again resubscribes.
        fx.send(request(CLUSTER_TYPE_URL, &[])).await;
        assert_eq!(fx.response().resources.len(), 3);
    }

    #[tokio::test]
    async fn test_nack_with_wildcard_keeps_subscription() {
        let mut fx = Fixture::new();
        fx.send(request(CLUSTER_TYPE_URL, &[])).await;
        let first = fx.response();

        fx.send(nack(CLUSTER_TYPE_URL, &["*"], &first)).await;
        fx.assert_silent();
        assert!(fx.type_state(CLUSTER_TYPE_URL).await.subscription.is_wildcard());
    }

    #[tokio::test]
    async fn test_subscription_change_on_ack_resends() {
        let mut fx = Fixture::new();
        fx.send(request(ROUTE_TYPE_URL, &["http.80", "https.443"])).await;
        let both = fx.response();
        assert_eq!(both.resources.len(), 2);

        fx.send(ack(ROUTE_TYPE_URL, &["http.80"], &both)).await;
        let one = fx.response();
        assert_eq!(one.resources.len(), 1);
        assert_ne!(one.nonce, both.nonce);
    }

    #[tokio::test]
    async fn test_stale_nonce_ignored() {
        let mut fx = Fixture::new();
        fx.send(request(CLUSTER_TYPE_URL, &[])).await;
        let response = fx.response();

        let mut stale = ack(CLUSTER_TYPE_URL, &[], &response);
        stale.response_nonce = "not-the-latest".to_string();
        fx.send(stale).await;
        fx.assert_silent();

        let ts = fx.type_state(CLUSTER_TYPE_URL).await;
        assert!(!ts.last_sent_acked);
        assert_eq!(fx.handler.server.metrics().stale_requests.get(), 1);
    }

    #[tokio::test]
    async fn test_push_suppresses_identical_content() {
        let mut fx = Fixture::new();
        fx.send(request(CLUSTER_TYPE_URL, &[])).await;
        fx.response();

        let outcome = fx.handler.push(&PushJob::push_all()).await.unwrap();
        assert_eq!(outcome, PushOutcome { sent: 0, suppressed: 1, failed: 0 });
        fx.assert_silent();

        let outcome = fx.handler.push(&PushJob::resync()).await.unwrap();
        assert_eq!(outcome.sent, 1);
        fx.response();
    }

    #[tokio::test]
    async fn test_explicit_type_with_empty_names_is_unsubscribed() {
        let mut fx = Fixture::new();
        fx.send(request(ENDPOINT_TYPE_URL, &[])).await;
        fx.assert_silent();

        let outcome = fx.handler.push(&PushJob::resync()).await.unwrap();
        assert_eq!(outcome, PushOutcome::default());
    }

    #[tokio::test]
    async fn test_reconnect_nonce_treated_as_subscription() {
        let mut fx = Fixture::new();
        let mut resumed = request(ENDPOINT_TYPE_URL, &["outbound|80||hello.default.svc.cluster.local"]);
        resumed.response_nonce = "from-old-stream".to_string();
        resumed.version_info = "1".to_string();
        fx.send(resumed).await;

        let response = fx.response();
        assert_eq!(response.resources.len(), 1);
        assert_eq!(fx.type_state(ENDPOINT_TYPE_URL).await.acked_version, "1");
    }

    #[tokio::test]
    async fn test_unknown_type_rejected() {
        let mut fx = Fixture::new();
        let err = fx
            .handler
            .handle_request(request("type.googleapis.com/envoy.Unknown", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, XdsError::UnknownType(_)));
        assert!(!err.is_fatal());
        fx.assert_silent();
    }

    #[tokio::test]
    async fn test_generation_failure_sends_nothing() {
        let mut fx = Fixture::new();
        fx.registry.remove_service(HELLO);
        fx.send(request(ROUTE_TYPE_URL, &["http.80"])).await;
        fx.assert_silent();

        let ts = fx.type_state(ROUTE_TYPE_URL).await;
        assert!(ts.is_subscribed());
        assert!(!ts.has_sent());
        assert_eq!(
            fx.handler.server.metrics().generate_errors.with_label_values(&["rds"]).get(),
            1
        );
    }

    #[tokio::test]
    async fn test_generation_failure_does_not_stop_push() {
        let mut fx = Fixture::new();
        fx.send(request(CLUSTER_TYPE_URL, &[])).await;
        let clusters = fx.response();
        fx.send(request(ROUTE_TYPE_URL, &["http.80"])).await;
        let routes = fx.response();

        // http.80 now points at a cluster that is gone.
        fx.registry.remove_service(HELLO);
        let outcome = fx.handler.push(&PushJob::push_all()).await.unwrap();
        assert_eq!(outcome, PushOutcome { sent: 1, suppressed: 0, failed: 1 });

        let pushed = fx.response();
        assert_eq!(pushed.type_url, CLUSTER_TYPE_URL);
        assert!(pushed.resources.len() < clusters.resources.len());
        fx.assert_silent();

        let ts = fx.type_state(ROUTE_TYPE_URL).await;
        assert_eq!(ts.last_sent_nonce, routes.nonce);
        assert_eq!(ts.last_sent_version, routes.version_info);
    }
}
