//! Prometheus metrics for query traffic and the connector cache.

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct OutcomeLabel(pub String);

impl prometheus_client::encoding::EncodeLabelSet for OutcomeLabel {
    fn encode(&self, mut encoder: prometheus_client::encoding::LabelSetEncoder) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("outcome", self.0.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct DaemonMetrics {
    pub queries: Family<OutcomeLabel, Counter>,
    pub rows_returned: Counter,
    pub cached_connectors: Gauge,
    pub connectors_evicted: Counter,
    pub registry: Arc<Registry>,
}

impl DaemonMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let queries = Family::<OutcomeLabel, Counter>::default();
        registry.register(
            "rowtap_queries",
            "Select requests by outcome",
            queries.clone(),
        );

        let rows_returned = Counter::default();
        registry.register(
            "rowtap_rows_returned",
            "Rows returned across all selects",
            rows_returned.clone(),
        );

        let cached_connectors = Gauge::default();
        registry.register(
            "rowtap_cached_connectors",
            "Connector instances currently cached",
            cached_connectors.clone(),
        );

        let connectors_evicted = Counter::default();
        registry.register(
            "rowtap_connectors_evicted",
            "Connector instances closed for being idle",
            connectors_evicted.clone(),
        );

        Self {
            queries,
            rows_returned,
            cached_connectors,
            connectors_evicted,
            registry: Arc::new(registry),
        }
    }

    /// Count one select. `outcome` is `ok` or a [`rowtap_core::QueryError::kind`].
    pub fn record_query(&self, outcome: &str) {
        self.queries.get_or_create(&OutcomeLabel(outcome.to_string())).inc();
    }

    pub fn set_cached_connectors(&self, count: usize) {
        self.cached_connectors.set(count as i64);
    }

    /// Encode all metrics as Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buf = String::new();
        if let Err(e) = encode(&mut buf, &self.registry) {
            warn!("Failed to encode metrics: {}", e);
        }
        buf
    }
}

impl Default for DaemonMetrics {
    fn default() -> Self {
        Self::new()
    }
}
