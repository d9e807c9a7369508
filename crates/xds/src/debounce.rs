//! Coalescing bursts of registry changes into single pushes.

use std::time::Duration;

use beacon_common::Version;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn};

use crate::mesh::ChangeEvent;
use crate::metrics::XdsMetrics;
use crate::scheduler::PushJob;

/// Debounce bookkeeping, independent of any clock.
///
/// A flush is due `after` past the latest event, and never later than
/// `max` past the first event since the previous flush.
#[derive(Debug, Clone)]
pub struct DebounceState {
    after: Duration,
    max: Duration,
    first_event: Option<Instant>,
    last_event: Option<Instant>,
    pending: usize,
}

impl DebounceState {
    pub fn new(after: Duration, max: Duration) -> Self {
        Self {
            after,
            max,
            first_event: None,
            last_event: None,
            pending: 0,
        }
    }

    /// Record an event. Returns true when the burst has run for `max`
    /// and must be flushed now.
    pub fn record(&mut self, now: Instant) -> bool {
        let first = *self.first_event.get_or_insert(now);
        self.last_event = Some(now);
        self.pending += 1;
        now.duration_since(first) >= self.max
    }

    /// When the pending events should be flushed, if any are pending.
    ///
    /// A threshold past what the clock can represent never fires; such
    /// events wait for the other threshold or for the channel to close.
    pub fn deadline(&self) -> Option<Instant> {
        let first = self.first_event?;
        let last = self.last_event.unwrap_or(first);
        match (last.checked_add(self.after), first.checked_add(self.max)) {
            (Some(quiet), Some(ceiling)) => Some(quiet.min(ceiling)),
            (quiet, ceiling) => quiet.or(ceiling),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Reset and return how many events were coalesced.
    pub fn take(&mut self) -> usize {
        self.first_event = None;
        self.last_event = None;
        std::mem::take(&mut self.pending)
    }
}

/// Turns a stream of change events into push jobs.
pub struct Debouncer {
    state: DebounceState,
    changes: mpsc::UnboundedReceiver<ChangeEvent>,
    jobs: mpsc::UnboundedSender<PushJob>,
    metrics: XdsMetrics,
    latest: Version,
}

impl Debouncer {
    pub fn new(
        after: Duration,
        max: Duration,
        changes: mpsc::UnboundedReceiver<ChangeEvent>,
        jobs: mpsc::UnboundedSender<PushJob>,
        metrics: XdsMetrics,
    ) -> Self {
        Self {
            state: DebounceState::new(after, max),
            changes,
            jobs,
            metrics,
            latest: Version::ZERO,
        }
    }

    /// Run until the change channel closes, flushing anything pending on
    /// the way out.
    pub async fn run(mut self) {
        debug!(
            after_ms = u64::try_from(self.state.after.as_millis()).unwrap_or(u64::MAX),
            max_ms = u64::try_from(self.state.max.as_millis()).unwrap_or(u64::MAX),
            "Debouncer started"
        );
        loop {
            let deadline = self.state.deadline();
            tokio::select! {
                event = self.changes.recv() => match event {
                    Some(event) => {
                        trace!(version = %event.version, kinds = ?event.kinds, "Change event");
                        self.latest = self.latest.max(event.version);
                        if self.state.record(Instant::now()) && !self.flush() {
                            return;
                        }
                    }
                    None => {
                        if self.state.pending() > 0 {
                            self.flush();
                        }
                        debug!("Change channel closed, debouncer stopped");
                        return;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if !self.flush() {
                        return;
                    }
                }
            }
        }
    }

    /// Emit a push for the pending events. False once nobody is
    /// listening for jobs.
    fn flush(&mut self) -> bool {
        let events = self.state.take();
        self.metrics.debounce_flushes.inc();
        self.metrics.debounced_events.inc_by(u64::try_from(events).unwrap_or(u64::MAX));
        debug!(events = events, version = %self.latest, "Flushing debounced changes");

        if self.jobs.send(PushJob::debounced(events, self.latest)).is_err() {
            warn!("Push scheduler gone, debouncer stopping");
            return false;
        }
        true
    }
}
