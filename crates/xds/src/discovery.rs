//! The discovery server context: everything a stream needs, plus the
//! background debounce and push tasks.

use std::net::SocketAddr;
use std::sync::Arc;

use beacon_common::ConnectionId;
use beacon_config::DiscoveryConfig;
use envoy_types::pb::envoy::service::discovery::v3::DiscoveryRequest;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionRegistry, ResponseSender};
use crate::debounce::Debouncer;
use crate::error::XdsError;
use crate::generate::GeneratorTable;
use crate::identity::ProxyIdentity;
use crate::mesh::{ChangeEvent, MeshRegistry};
use crate::metrics::XdsMetrics;
use crate::scheduler::{PushJob, PushScheduler};
use crate::stream::StreamHandler;

struct Inner {
    config: DiscoveryConfig,
    registry: Arc<dyn MeshRegistry>,
    generators: GeneratorTable,
    connections: ConnectionRegistry,
    metrics: XdsMetrics,
    jobs: mpsc::UnboundedSender<PushJob>,
    pending_jobs: Mutex<Option<mpsc::UnboundedReceiver<PushJob>>>,
}

/// Shared discovery state. Cheap to clone.
#[derive(Clone)]
pub struct DiscoveryServer {
    inner: Arc<Inner>,
}

/// Handles to the background tasks started by [`DiscoveryServer::start`].
pub struct DiscoveryTasks {
    pub debouncer: JoinHandle<()>,
    pub scheduler: JoinHandle<()>,
}

impl DiscoveryTasks {
    pub fn abort(&self) {
        self.debouncer.abort();
        self.scheduler.abort();
    }
}

impl DiscoveryServer {
    /// Server with the built-in generators.
    pub fn new(config: DiscoveryConfig, registry: Arc<dyn MeshRegistry>) -> Result<Self, XdsError> {
        let generators = GeneratorTable::with_defaults(&config.wildcard);
        Self::with_generators(config, registry, generators)
    }

    pub fn with_generators(
        config: DiscoveryConfig,
        registry: Arc<dyn MeshRegistry>,
        generators: GeneratorTable,
    ) -> Result<Self, XdsError> {
        let (jobs, pending) = mpsc::unbounded_channel();
        debug!(
            types = generators.type_urls().count(),
            send_buffer = config.send_buffer,
            "Creating discovery server"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                registry,
                generators,
                connections: ConnectionRegistry::new(),
                metrics: XdsMetrics::new()?,
                jobs,
                pending_jobs: Mutex::new(Some(pending)),
            }),
        })
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<dyn MeshRegistry> {
        &self.inner.registry
    }

    pub fn generators(&self) -> &GeneratorTable {
        &self.inner.generators
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.inner.connections
    }

    pub fn metrics(&self) -> &XdsMetrics {
        &self.inner.metrics
    }

    /// Spawn the debouncer fed by `changes` and the push scheduler.
    ///
    /// Can only be called once.
    pub fn start(
        &self,
        changes: mpsc::UnboundedReceiver<ChangeEvent>,
    ) -> Result<DiscoveryTasks, XdsError> {
        let jobs = self
            .inner
            .pending_jobs
            .lock()
            .take()
            .ok_or(XdsError::SchedulerStopped)?;

        let debouncer = Debouncer::new(
            self.inner.config.debounce_after(),
            self.inner.config.debounce_max(),
            changes,
            self.inner.jobs.clone(),
            self.inner.metrics.clone(),
        );
        let scheduler = PushScheduler::new(self.clone(), jobs);
        info!(
            debounce_after_ms = self.inner.config.debounce_after_ms,
            debounce_max_ms = self.inner.config.debounce_max_ms,
            "Starting discovery tasks"
        );
        Ok(DiscoveryTasks {
            debouncer: tokio::spawn(debouncer.run()),
            scheduler: tokio::spawn(scheduler.run()),
        })
    }

    /// Queue a push job.
    pub fn submit(&self, job: PushJob) -> Result<(), XdsError> {
        self.inner
            .jobs
            .send(job)
            .map_err(|_| XdsError::SchedulerStopped)
    }

    /// Push changed content to every connection.
    pub fn push_all(&self) -> Result<(), XdsError> {
        self.submit(PushJob::push_all())
    }

    /// Resend everything to every connection, changed or not.
    pub fn resync(&self) -> Result<(), XdsError> {
        self.submit(PushJob::resync())
    }

    /// Close every connection. Their streams end and the proxies
    /// reconnect elsewhere.
    pub fn close_all(&self) -> usize {
        let connections = self.inner.connections.snapshot();
        for connection in &connections {
            connection.close();
        }
        info!(connections = connections.len(), "Closed all connections");
        connections.len()
    }

    /// Serve one ADS stream until the proxy goes away.
    ///
    /// The connection is registered on the first request carrying a node
    /// id; requests before that are dropped.
    pub async fn serve_stream<S>(&self, mut inbound: S, outbound: ResponseSender, peer: Option<SocketAddr>)
    where
        S: Stream<Item = Result<DiscoveryRequest, Status>> + Unpin + Send,
    {
        let connection_id = ConnectionId::new();
        let closed = CancellationToken::new();
        let mut handler: Option<StreamHandler> = None;
        debug!(connection_id = %connection_id, peer = ?peer, "Stream opened");

        loop {
            tokio::select! {
                _ = closed.cancelled() => {
                    debug!(connection_id = %connection_id, "Connection closed");
                    break;
                }
                _ = outbound.closed() => {
                    debug!(connection_id = %connection_id, "Response stream dropped");
                    break;
                }
                message = inbound.next() => match message {
                    Some(Ok(request)) => {
                        if handler.is_none() {
                            match self.open(&connection_id, &request, &outbound, &closed, peer) {
                                Ok(opened) => handler = Some(opened),
                                Err(e) => {
                                    warn!(connection_id = %connection_id, error = %e, "Dropping request");
                                    continue;
                                }
                            }
                        }
                        let Some(handler) = handler.as_ref() else {
                            continue;
                        };
                        match handler.handle_request(request).await {
                            Ok(()) => {}
                            Err(e) if e.is_fatal() => {
                                debug!(connection_id = %connection_id, error = %e, "Stream ended");
                                break;
                            }
                            Err(e) => {
                                warn!(connection_id = %connection_id, error = %e, "Dropping request");
                            }
                        }
                    }
                    Some(Err(status)) => {
                        warn!(
                            connection_id = %connection_id,
                            code = ?status.code(),
                            error = %status.message(),
                            "Stream receive error"
                        );
                        break;
                    }
                    None => {
                        debug!(connection_id = %connection_id, "Proxy closed the stream");
                        break;
                    }
                }
            }
        }

        closed.cancel();
        if let Some(handler) = handler {
            let connection = handler.connection();
            if self.inner.connections.remove(connection.id()).is_some() {
                self.inner.metrics.connected_proxies.dec();
            }
            info!(
                connection_id = %connection.id(),
                node_id = %connection.node_id(),
                "Proxy disconnected"
            );
        }
    }

    fn open(
        &self,
        connection_id: &ConnectionId,
        request: &DiscoveryRequest,
        outbound: &ResponseSender,
        closed: &CancellationToken,
        peer: Option<SocketAddr>,
    ) -> Result<StreamHandler, XdsError> {
        let node = request.node.as_ref().ok_or_else(|| {
            XdsError::MalformedRequest("first request on a stream must carry a node".to_string())
        })?;
        let proxy = ProxyIdentity::from_node(node)?;
        info!(
            connection_id = %connection_id,
            node_id = %proxy.node_id,
            kind = %proxy.kind,
            peer = ?peer,
            "Proxy connected"
        );

        let connection = Arc::new(Connection::new(
            connection_id.clone(),
            proxy,
            outbound.clone(),
            closed.clone(),
        ));
        self.inner.connections.add(Arc::clone(&connection));
        self.inner.metrics.connected_proxies.inc();
        Ok(StreamHandler::new(connection, self.clone()))
    }
}
