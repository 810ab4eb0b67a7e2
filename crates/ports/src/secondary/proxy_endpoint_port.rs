use domain::common::error::DomainError;
use domain::service::entity::{Backend, ServiceName};

/// Secondary port pushing a service's backends to a local L7 proxy.
pub trait ProxyEndpointPort: Send + Sync {
    fn upsert_endpoints(&self, service: &ServiceName, backends: &[Backend]) -> Result<(), DomainError>;
}
