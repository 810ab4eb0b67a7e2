use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use domain::common::error::DomainError;
use domain::service::entity::{Backend, BackendKey, ServiceName};
use ports::secondary::proxy_endpoint_port::ProxyEndpointPort;

/// Latest endpoint set pushed for each L7-synced service.
#[derive(Debug, Default)]
pub struct ProxyEndpointTable {
    endpoints: Mutex<HashMap<ServiceName, Vec<BackendKey>>>,
}

impl ProxyEndpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoints(&self, service: &ServiceName) -> Option<Vec<BackendKey>> {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .cloned()
    }
}

impl ProxyEndpointPort for ProxyEndpointTable {
    fn upsert_endpoints(&self, service: &ServiceName, backends: &[Backend]) -> Result<(), DomainError> {
        let keys: Vec<BackendKey> = backends
            .iter()
            .filter(|b| !b.terminating)
            .map(Backend::key)
            .collect();
        tracing::debug!(service = %service, endpoints = keys.len(), "proxy endpoints updated");
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(service.clone(), keys);
        Ok(())
    }
}
