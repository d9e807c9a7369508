//! Fanning pushes out to connections.

use std::fmt;

use beacon_common::{ConnectionId, Version};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::discovery::DiscoveryServer;
use crate::error::XdsError;
use crate::stream::StreamHandler;

/// Why a push was scheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushReason {
    /// Registry changes coalesced by the debouncer.
    Debounced { events: usize, version: Version },
    /// Operator asked for a push of changed content.
    PushAll,
    /// Operator asked to resend everything.
    Resync,
}

impl fmt::Display for PushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushReason::Debounced { events, version } => {
                write!(f, "debounced({} events, version {})", events, version)
            }
            PushReason::PushAll => write!(f, "push-all"),
            PushReason::Resync => write!(f, "resync"),
        }
    }
}

/// Which connections a push reaches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushTargets {
    All,
    Connections(Vec<ConnectionId>),
}

/// A unit of push work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushJob {
    pub reason: PushReason,
    pub targets: PushTargets,
    /// Send even when the proxy already has identical content.
    pub force: bool,
}

impl PushJob {
    pub fn debounced(events: usize, version: Version) -> Self {
        Self {
            reason: PushReason::Debounced { events, version },
            targets: PushTargets::All,
            force: false,
        }
    }

    pub fn push_all() -> Self {
        Self {
            reason: PushReason::PushAll,
            targets: PushTargets::All,
            force: false,
        }
    }

    pub fn resync() -> Self {
        Self {
            reason: PushReason::Resync,
            targets: PushTargets::All,
            force: true,
        }
    }

    pub fn for_connections(mut self, ids: Vec<ConnectionId>) -> Self {
        self.targets = PushTargets::Connections(ids);
        self
    }

    /// Fold a later job into this one for a connection that has not
    /// caught up yet. The later reason wins; forcing is sticky.
    pub fn merge(self, later: PushJob) -> PushJob {
        PushJob {
            force: self.force || later.force,
            ..later
        }
    }
}

/// Consumes push jobs and runs each connection's push as its own task.
pub struct PushScheduler {
    server: DiscoveryServer,
    jobs: mpsc::UnboundedReceiver<PushJob>,
}

impl PushScheduler {
    pub fn new(server: DiscoveryServer, jobs: mpsc::UnboundedReceiver<PushJob>) -> Self {
        Self { server, jobs }
    }

    /// Run until every job sender is gone.
    pub async fn run(mut self) {
        debug!("Push scheduler started");
        while let Some(job) = self.jobs.recv().await {
            dispatch(&self.server, &job);
        }
        debug!("Push scheduler stopped");
    }
}

/// Queue the job on every targeted connection and return the push
/// workers this started, without waiting for them.
///
/// A connection runs at most one worker. Jobs arriving while it is busy
/// merge into a single pending push, so a stalled proxy holds one task no
/// matter how many jobs are dispatched. A worker ends when its connection
/// closes; a slow connection only delays its own worker.
pub fn dispatch(server: &DiscoveryServer, job: &PushJob) -> Vec<JoinHandle<()>> {
    let connections = match &job.targets {
        PushTargets::All => server.connections().snapshot(),
        PushTargets::Connections(ids) => ids
            .iter()
            .filter_map(|id| server.connections().get(id))
            .collect(),
    };
    info!(
        reason = %job.reason,
        force = job.force,
        connections = connections.len(),
        "Pushing to connections"
    );

    connections
        .into_iter()
        .filter(|connection| !connection.is_closed())
        .filter_map(|connection| {
            if !connection.queue_push(job.clone()) {
                trace!(connection_id = %connection.id(), "Push merged into pending push");
                return None;
            }
            let handler = StreamHandler::new(connection, server.clone());
            Some(tokio::spawn(drain_pushes(handler)))
        })
        .collect()
}

async fn drain_pushes(handler: StreamHandler) {
    let connection = handler.connection();
    while let Some(job) = connection.next_push() {
        tokio::select! {
            _ = connection.closed() => {
                trace!(connection_id = %connection.id(), "Connection closed, push abandoned");
                return;
            }
            result = handler.push(&job) => match result {
                Ok(_) => {}
                Err(XdsError::ConnectionClosed) => {
                    trace!(connection_id = %connection.id(), "Connection closed during push");
                    return;
                }
                Err(e) => {
                    debug!(connection_id = %connection.id(), error = %e, "Push failed");
                }
            },
        }
    }
}
