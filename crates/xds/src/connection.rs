//! Per-stream connection state and the registry of live connections.

use std::collections::BTreeMap;
use std::sync::Arc;

use beacon_common::{ConnectionId, NodeId};
use beacon_config::ProxyKind;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use envoy_types::pb::envoy::service::discovery::v3::DiscoveryResponse;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tonic::Status;
use tracing::{debug, trace};

use crate::error::XdsError;
use crate::identity::ProxyIdentity;
use crate::resource::{type_label, Subscription};
use crate::scheduler::PushJob;

/// Sending half of a stream's outbound channel.
pub type ResponseSender = mpsc::Sender<Result<DiscoveryResponse, Status>>;

/// Protocol state for one resource type on one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeState {
    /// What the proxy asked for.
    pub subscription: Subscription,
    /// Version label of the last response sent. Empty until the first send.
    pub last_sent_version: String,
    /// Nonce of the last response sent.
    pub last_sent_nonce: String,
    /// Content fingerprint of the last response sent.
    pub last_sent_digest: Option<u64>,
    /// Whether the last response sent has been acknowledged.
    pub last_sent_acked: bool,
    /// Version label the proxy last accepted.
    pub acked_version: String,
    /// Error detail of the most recent NACK, cleared on ACK.
    pub last_error: Option<String>,
    /// Responses sent for this type.
    pub responses_sent: u64,
}

impl TypeState {
    pub fn new(subscription: Subscription) -> Self {
        Self {
            subscription,
            ..Default::default()
        }
    }

    /// Whether pushes for this type should reach the proxy.
    pub fn is_subscribed(&self) -> bool {
        !self.subscription.is_empty()
    }

    /// Whether anything has been sent for this type on this connection.
    pub fn has_sent(&self) -> bool {
        !self.last_sent_nonce.is_empty()
    }
}

/// Protocol state of a connection, keyed by type URL.
#[derive(Debug, Default)]
pub struct ConnectionState {
    pub types: BTreeMap<String, TypeState>,
}

impl ConnectionState {
    /// Type URLs with a non-empty subscription.
    pub fn subscribed_types(&self) -> Vec<String> {
        self.types
            .iter()
            .filter(|(_, state)| state.is_subscribed())
            .map(|(type_url, _)| type_url.clone())
            .collect()
    }
}

/// One open ADS stream.
///
/// The protocol state sits behind an async mutex: the request path and
/// pushes both take it, so at most one of them touches a connection at a
/// time and sends stay ordered.
pub struct Connection {
    id: ConnectionId,
    proxy: ProxyIdentity,
    connected_at: DateTime<Utc>,
    state: Mutex<ConnectionState>,
    sender: ResponseSender,
    closed: CancellationToken,
    pushes: parking_lot::Mutex<PushSlot>,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        proxy: ProxyIdentity,
        sender: ResponseSender,
        closed: CancellationToken,
    ) -> Self {
        Self {
            id,
            proxy,
            connected_at: Utc::now(),
            state: Mutex::new(ConnectionState::default()),
            sender,
            closed,
            pushes: parking_lot::Mutex::new(PushSlot::default()),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn proxy(&self) -> &ProxyIdentity {
        &self.proxy
    }

    pub fn node_id(&self) -> &NodeId {
        &self.proxy.node_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn state(&self) -> &Mutex<ConnectionState> {
        &self.state
    }

    /// Mark the connection closed. Pending and future pushes are dropped.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            trace!(connection_id = %self.id, "Closing connection");
            self.closed.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.sender.is_closed()
    }

    /// Resolves once the connection is closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    /// Queue a response on the stream, waiting for buffer space.
    ///
    /// Closing the connection abandons a send that is still waiting. A
    /// failed send closes the connection.
    pub(crate) async fn send(&self, response: DiscoveryResponse) -> Result<(), XdsError> {
        if self.closed.is_cancelled() {
            return Err(XdsError::ConnectionClosed);
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => {
                trace!(connection_id = %self.id, "Connection closed while waiting for buffer space");
                Err(XdsError::ConnectionClosed)
            }
            sent = self.sender.send(Ok(response)) => match sent {
                Ok(()) => Ok(()),
                Err(_) => {
                    debug!(connection_id = %self.id, "Outbound stream gone, closing connection");
                    self.close();
                    Err(XdsError::ConnectionClosed)
                }
            },
        }
    }

    /// Queue a push for this connection, folding it into one that is
    /// already waiting.
    ///
    /// Returns `true` when no worker is draining pushes for the connection
    /// and the caller must start one.
    pub(crate) fn queue_push(&self, job: PushJob) -> bool {
        let mut slot = self.pushes.lock();
        slot.pending = Some(match slot.pending.take() {
            Some(waiting) => waiting.merge(job),
            None => job,
        });
        if slot.draining {
            return false;
        }
        slot.draining = true;
        true
    }

    /// Take the next queued push. `None` releases the worker.
    pub(crate) fn next_push(&self) -> Option<PushJob> {
        let mut slot = self.pushes.lock();
        let next = slot.pending.take();
        if next.is_none() {
            slot.draining = false;
        }
        next
    }
}

/// Pushes waiting for a connection. At most one job waits; later jobs
/// merge into it.
#[derive(Debug, Default)]
struct PushSlot {
    pending: Option<PushJob>,
    draining: bool,
}

/// Per-type view in a [`ConnectionSummary`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeSummary {
    pub type_url: String,
    /// `lds`, `rds`, `cds`, `eds` or the message name
    pub label: String,
    /// `*` or the subscribed names
    pub subscription: String,
    pub last_sent_version: String,
    pub last_sent_nonce: String,
    pub last_sent_acked: bool,
    pub acked_version: String,
    pub last_error: Option<String>,
    pub responses_sent: u64,
}

/// Point-in-time view of a connection for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSummary {
    pub connection_id: ConnectionId,
    pub node_id: NodeId,
    pub proxy_kind: ProxyKind,
    pub connected_at: DateTime<Utc>,
    pub types: Vec<TypeSummary>,
}

/// Live connections, keyed by connection id.
///
/// Iteration goes through [`ConnectionRegistry::snapshot`], so walking the
/// connections never holds the map while connections come and go.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, connection: Arc<Connection>) {
        debug!(
            connection_id = %connection.id(),
            node_id = %connection.node_id(),
            "Registering connection"
        );
        self.connections.insert(connection.id().clone(), connection);
    }

    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let removed = self.connections.remove(id).map(|(_, c)| c);
        if removed.is_some() {
            debug!(connection_id = %id, "Removed connection");
        }
        removed
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|c| Arc::clone(c.value()))
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Every live connection at this moment.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|c| Arc::clone(c.value())).collect()
    }

    /// Connections held by a node. A reconnecting proxy may briefly have
    /// more than one.
    pub fn by_node(&self, node_id: &NodeId) -> Vec<Arc<Connection>> {
        self.snapshot()
            .into_iter()
            .filter(|c| c.node_id() == node_id)
            .collect()
    }

    /// The protocol state of every connection, ordered by node id.
    pub async fn summaries(&self) -> Vec<ConnectionSummary> {
        let mut summaries = Vec::with_capacity(self.len());
        for connection in self.snapshot() {
            let state = connection.state().lock().await;
            let types = state
                .types
                .iter()
                .map(|(type_url, ts)| TypeSummary {
                    type_url: type_url.clone(),
                    label: type_label(type_url).to_string(),
                    subscription: ts.subscription.to_string(),
                    last_sent_version: ts.last_sent_version.clone(),
                    last_sent_nonce: ts.last_sent_nonce.clone(),
                    last_sent_acked: ts.last_sent_acked,
                    acked_version: ts.acked_version.clone(),
                    last_error: ts.last_error.clone(),
                    responses_sent: ts.responses_sent,
                })
                .collect();
            summaries.push(ConnectionSummary {
                connection_id: connection.id().clone(),
                node_id: connection.node_id().clone(),
                proxy_kind: connection.proxy().kind,
                connected_at: connection.connected_at(),
                types,
            });
        }
        summaries.sort_by(|a, b| {
            (&a.node_id, a.connected_at).cmp(&(&b.node_id, b.connected_at))
        });
        summaries
    }
}
