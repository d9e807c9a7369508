//! Prometheus metrics for the discovery engine.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::resource::type_label;

/// Discovery metrics, registered into a registry owned by the server.
#[derive(Clone)]
pub struct XdsMetrics {
    registry: Registry,
    /// Connections currently registered.
    pub connected_proxies: IntGauge,
    /// Responses sent, by type.
    pub pushes: IntCounterVec,
    /// Pushes skipped because the content was unchanged, by type.
    pub push_suppressed: IntCounterVec,
    /// NACKs received, by type.
    pub nacks: IntCounterVec,
    /// Failed generation passes, by type.
    pub generate_errors: IntCounterVec,
    /// Requests carrying a nonce other than the last one sent.
    pub stale_requests: IntCounter,
    pub debounce_flushes: IntCounter,
    /// Change events folded into flushes.
    pub debounced_events: IntCounter,
}

impl XdsMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::register_into(Registry::new())
    }

    pub fn register_into(registry: Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self {
            connected_proxies: IntGauge::new(
                "beacon_xds_connected_proxies",
                "Number of proxies with an open ADS stream",
            )?,
            pushes: IntCounterVec::new(
                Opts::new("beacon_xds_pushes_total", "Discovery responses sent"),
                &["type"],
            )?,
            push_suppressed: IntCounterVec::new(
                Opts::new(
                    "beacon_xds_push_suppressed_total",
                    "Pushes skipped because the proxy already has identical content",
                ),
                &["type"],
            )?,
            nacks: IntCounterVec::new(
                Opts::new("beacon_xds_nacks_total", "Discovery responses rejected by proxies"),
                &["type"],
            )?,
            generate_errors: IntCounterVec::new(
                Opts::new("beacon_xds_generate_errors_total", "Failed resource generation passes"),
                &["type"],
            )?,
            stale_requests: IntCounter::new(
                "beacon_xds_stale_requests_total",
                "Requests acknowledging a nonce other than the latest one sent",
            )?,
            debounce_flushes: IntCounter::new(
                "beacon_xds_debounce_flushes_total",
                "Push jobs emitted by the debouncer",
            )?,
            debounced_events: IntCounter::new(
                "beacon_xds_debounced_events_total",
                "Registry change events coalesced by the debouncer",
            )?,
            registry,
        };

        metrics.registry.register(Box::new(metrics.connected_proxies.clone()))?;
        metrics.registry.register(Box::new(metrics.pushes.clone()))?;
        metrics.registry.register(Box::new(metrics.push_suppressed.clone()))?;
        metrics.registry.register(Box::new(metrics.nacks.clone()))?;
        metrics.registry.register(Box::new(metrics.generate_errors.clone()))?;
        metrics.registry.register(Box::new(metrics.stale_requests.clone()))?;
        metrics.registry.register(Box::new(metrics.debounce_flushes.clone()))?;
        metrics.registry.register(Box::new(metrics.debounced_events.clone()))?;

        Ok(metrics)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_push(&self, type_url: &str) {
        self.pushes.with_label_values(&[type_label(type_url)]).inc();
    }

    pub fn record_suppressed(&self, type_url: &str) {
        self.push_suppressed.with_label_values(&[type_label(type_url)]).inc();
    }

    pub fn record_nack(&self, type_url: &str) {
        self.nacks.with_label_values(&[type_label(type_url)]).inc();
    }

    pub fn record_generate_error(&self, type_url: &str) {
        self.generate_errors.with_label_values(&[type_label(type_url)]).inc();
    }

    /// Render every metric in the Prometheus text format.
    pub fn gather_text(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
