use std::sync::Arc;
use std::time::Duration;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::registry::store::Generation;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum RefreshOutcome {
    Success,
    Failure,
    Skipped,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RefreshLabels {
    pub outcome: RefreshOutcome,
}

/// Terminal state of a gateway request.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum RequestOutcome {
    Completed,
    Rejected,
    UpstreamFailed,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub outcome: RequestOutcome,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the gateway.
pub struct Metrics {
    // -- registry --
    pub registry_refresh_total: Family<RefreshLabels, Counter>,
    pub registry_records: Gauge,
    pub registry_index_tokens: Gauge,
    pub registry_version: Gauge,

    // -- gateway --
    pub requests_total: Family<RequestLabels, Counter>,
    pub upstream_duration_seconds: Histogram,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let registry_refresh_total = Family::<RefreshLabels, Counter>::default();
        registry.register(
            "identity_gateway_registry_refresh",
            "Registry refresh attempts by outcome",
            registry_refresh_total.clone(),
        );

        let registry_records: Gauge = Gauge::default();
        registry.register(
            "identity_gateway_registry_records",
            "Keys in the installed registry snapshot",
            registry_records.clone(),
        );

        let registry_index_tokens: Gauge = Gauge::default();
        registry.register(
            "identity_gateway_registry_index_tokens",
            "Lookup tokens in the installed index",
            registry_index_tokens.clone(),
        );

        let registry_version: Gauge = Gauge::default();
        registry.register(
            "identity_gateway_registry_version",
            "Version of the installed registry generation",
            registry_version.clone(),
        );

        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "identity_gateway_requests",
            "Gateway requests by terminal outcome",
            requests_total.clone(),
        );

        let upstream_duration_seconds = Histogram::new(exponential_buckets(0.005, 2.0, 12));
        registry.register(
            "identity_gateway_upstream_duration_seconds",
            "Backend call latency in seconds",
            upstream_duration_seconds.clone(),
        );

        Self {
            registry_refresh_total,
            registry_records,
            registry_index_tokens,
            registry_version,
            requests_total,
            upstream_duration_seconds,
        }
    }

    pub fn record_refresh(&self, outcome: RefreshOutcome) {
        self.registry_refresh_total
            .get_or_create(&RefreshLabels { outcome })
            .inc();
    }

    pub fn set_registry_size(&self, generation: &Generation) {
        self.registry_records.set(generation.snapshot.len() as i64);
        self.registry_index_tokens.set(generation.index.len() as i64);
        self.registry_version.set(generation.version as i64);
    }

    pub fn record_request(&self, outcome: RequestOutcome) {
        self.requests_total
            .get_or_create(&RequestLabels { outcome })
            .inc();
    }

    pub fn observe_upstream(&self, elapsed: Duration) {
        self.upstream_duration_seconds.observe(elapsed.as_secs_f64());
    }

    pub fn request_count(&self, outcome: RequestOutcome) -> u64 {
        self.requests_total
            .get_or_create(&RequestLabels { outcome })
            .get()
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`](crate::AppState).
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all gateway metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}
