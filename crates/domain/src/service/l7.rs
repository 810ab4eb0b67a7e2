use std::collections::{BTreeSet, HashMap};

use super::entity::{ResourceName, ServiceName};
use super::error::ServiceError;

/// L7 proxy claims on one service name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct L7LbInfo {
    /// Resources that want the service's backends pushed to the proxy.
    pub backend_sync_refs: BTreeSet<ResourceName>,
    /// Resource holding the exclusive redirect slot.
    pub listener_ref: Option<ResourceName>,
    pub proxy_port: u16,
}

impl L7LbInfo {
    fn is_empty(&self) -> bool {
        self.backend_sync_refs.is_empty() && self.listener_ref.is_none()
    }
}

/// Redirect and backend-sync registrations keyed by service name.
#[derive(Debug, Clone, Default)]
pub struct L7LbTable {
    entries: HashMap<ServiceName, L7LbInfo>,
}

impl L7LbTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `resource` for `service`. A zero `proxy_port` only requests
    /// backend sync. Returns whether anything changed.
    pub fn register(
        &mut self,
        service: &ServiceName,
        resource: &ResourceName,
        proxy_port: u16,
    ) -> Result<bool, ServiceError> {
        if proxy_port != 0
            && let Some(holder) = self
                .entries
                .get(service)
                .and_then(|info| info.listener_ref.as_ref())
            && holder != resource
        {
            return Err(ServiceError::L7RedirectConflict {
                service: service.to_string(),
                holder: holder.to_string(),
            });
        }

        let info = self.entries.entry(service.clone()).or_default();
        let mut changed = info.backend_sync_refs.insert(resource.clone());
        if proxy_port != 0
            && (info.listener_ref.as_ref() != Some(resource) || info.proxy_port != proxy_port)
        {
            info.listener_ref = Some(resource.clone());
            info.proxy_port = proxy_port;
            changed = true;
        }
        Ok(changed)
    }

    /// Drop every claim `resource` holds on `service`. Returns whether anything changed.
    pub fn remove(&mut self, service: &ServiceName, resource: &ResourceName) -> bool {
        let Some(info) = self.entries.get_mut(service) else {
            return false;
        };
        let mut changed = info.backend_sync_refs.remove(resource);
        if info.listener_ref.as_ref() == Some(resource) {
            info.listener_ref = None;
            info.proxy_port = 0;
            changed = true;
        }
        if info.is_empty() {
            self.entries.remove(service);
        }
        changed
    }

    /// Proxy port traffic for `service` is redirected to, 0 when not redirected.
    pub fn redirect_port(&self, service: &ServiceName) -> u16 {
        self.entries
            .get(service)
            .filter(|info| info.listener_ref.is_some())
            .map_or(0, |info| info.proxy_port)
    }

    pub fn wants_backend_sync(&self, service: &ServiceName) -> bool {
        self.entries
            .get(service)
            .is_some_and(|info| !info.backend_sync_refs.is_empty())
    }

    pub fn get(&self, service: &ServiceName) -> Option<&L7LbInfo> {
        self.entries.get(service)
    }
}
