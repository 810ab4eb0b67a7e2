use ports::secondary::metrics_port::{RestoreMetrics, ServiceMetrics};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::constants::METRICS_PREFIX;

// ── Label types ─────────────────────────────────────────────────────

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ActionLabels {
    pub action: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RestoreLabels {
    pub kind: String,
    pub result: String,
}

// ── Registry metrics ────────────────────────────────────────────────

/// Prometheus metrics for the service registry.
///
/// Recording only needs `&self`. Wrap in `Arc` to share with the registry.
pub struct AgentMetrics {
    registry: Registry,
    pub services_total: Family<ActionLabels, Counter>,
    pub services_active: Gauge,
    pub restored_entries_total: Family<RestoreLabels, Counter>,
    pub leaked_ids: Gauge,
}

impl AgentMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix(METRICS_PREFIX);

        let services_total = Family::<ActionLabels, Counter>::default();
        registry.register(
            "services",
            "Service add, update and delete operations",
            services_total.clone(),
        );

        let services_active = Gauge::default();
        registry.register(
            "services_active",
            "Services currently held by the registry",
            services_active.clone(),
        );

        let restored_entries_total = Family::<RestoreLabels, Counter>::default();
        registry.register(
            "restored_entries",
            "Datapath entries processed during restore",
            restored_entries_total.clone(),
        );

        let leaked_ids = Gauge::default();
        registry.register(
            "leaked_ids",
            "Identifiers whose release failed and awaits retry",
            leaked_ids.clone(),
        );

        Self {
            registry,
            services_total,
            services_active,
            restored_entries_total,
            leaked_ids,
        }
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = prometheus_client::encoding::text::encode(&mut buffer, &self.registry) {
            tracing::warn!(error = %e, "metrics encoding failed");
        }
        buffer
    }
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn gauge_value(count: u64) -> i64 {
    count.try_into().unwrap_or(i64::MAX)
}

impl ServiceMetrics for AgentMetrics {
    fn record_service_op(&self, action: &str) {
        self.services_total
            .get_or_create(&ActionLabels {
                action: action.to_string(),
            })
            .inc();
    }

    fn set_services_active(&self, count: u64) {
        self.services_active.set(gauge_value(count));
    }

    fn set_leaked_ids(&self, count: u64) {
        self.leaked_ids.set(gauge_value(count));
    }
}

impl RestoreMetrics for AgentMetrics {
    fn record_restored_entries(&self, kind: &str, result: &str, count: u64) {
        self.restored_entries_total
            .get_or_create(&RestoreLabels {
                kind: kind.to_string(),
                result: result.to_string(),
            })
            .inc_by(count);
    }
}
