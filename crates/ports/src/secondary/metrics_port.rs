// Sub-traits for recording registry metrics.
//
// All methods take `&self`; implementations use atomics from
// `prometheus-client`. Defaults are no-ops so test doubles only implement
// what they observe.

// ── Service registry metrics ───────────────────────────────────────

pub trait ServiceMetrics: Send + Sync {
    /// Count a registry transition (`add`, `update`, `delete`).
    fn record_service_op(&self, _action: &str) {}

    /// Set the number of services held by the registry.
    fn set_services_active(&self, _count: u64) {}

    /// Set the number of backend identifiers waiting for release.
    fn set_leaked_ids(&self, _count: u64) {}
}

// ── Restore metrics ────────────────────────────────────────────────

pub trait RestoreMetrics: Send + Sync {
    /// Count entries recovered from the datapath. `kind` is `backend`,
    /// `service` or `maglev`; `result` is `restored` or `failed`.
    fn record_restored_entries(&self, _kind: &str, _result: &str, _count: u64) {}
}

// ── Composite super-trait ──────────────────────────────────────────

/// Services accept `Arc<dyn MetricsPort>`.
pub trait MetricsPort: ServiceMetrics + RestoreMetrics {}

impl<T> MetricsPort for T where T: ServiceMetrics + RestoreMetrics {}
