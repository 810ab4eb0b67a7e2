use domain::service::entity::{ServiceId, ServiceName};

/// Secondary port for the node-local health check listener.
///
/// Calls are synchronous and infallible from the registry's point of view.
pub trait HealthServerPort: Send + Sync {
    /// Serve `local_backends` on `port` for the given service. A zero port
    /// removes the listener.
    fn upsert_service(&self, id: ServiceId, name: &ServiceName, local_backends: usize, port: u16);

    fn delete_service(&self, id: ServiceId);
}
