use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use domain::service::entity::{ServiceId, ServiceName};
use ports::secondary::health_server_port::HealthServerPort;

/// What the health listener reports for one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthEntry {
    pub name: ServiceName,
    pub local_backends: usize,
    pub port: u16,
}

/// Health check registrations kept in memory for an external listener to serve.
#[derive(Debug, Default)]
pub struct HealthCheckTable {
    entries: Mutex<HashMap<ServiceId, HealthEntry>>,
}

impl HealthCheckTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ServiceId) -> Option<HealthEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Entries listening on `port`.
    pub fn by_port(&self, port: u16) -> Vec<(ServiceId, HealthEntry)> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<_> = entries
            .iter()
            .filter(|(_, e)| e.port == port)
            .map(|(id, e)| (*id, e.clone()))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HealthServerPort for HealthCheckTable {
    fn upsert_service(&self, id: ServiceId, name: &ServiceName, local_backends: usize, port: u16) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if port == 0 {
            entries.remove(&id);
            return;
        }
        tracing::debug!(service_id = %id, service = %name, local_backends, port, "health check updated");
        entries.insert(
            id,
            HealthEntry {
                name: name.clone(),
                local_backends,
                port,
            },
        );
    }

    fn delete_service(&self, id: ServiceId) {
        if self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
        {
            tracing::debug!(service_id = %id, "health check removed");
        }
    }
}
