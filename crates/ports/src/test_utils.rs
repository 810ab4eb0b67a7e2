use std::collections::{BTreeMap, BTreeSet, HashMap};

use domain::common::error::DomainError;
use domain::service::entity::{
    Backend, BackendId, BackendKey, Cidr, L3n4Addr, L3n4AddrId, NatPolicy, ServiceId,
};
use domain::service::options::InitMapsFlags;

use crate::secondary::id_allocator_port::IdAllocatorPort;
use crate::secondary::lb_map_port::{LbMapPort, ServiceDump, UpsertServiceParams};
use crate::secondary::metrics_port::{RestoreMetrics, ServiceMetrics};
use crate::secondary::monitor_port::{MonitorEvent, MonitorPort};

/// No-op metrics for tests. Every method keeps its default implementation.
pub struct NoopMetrics;

impl ServiceMetrics for NoopMetrics {}
impl RestoreMetrics for NoopMetrics {}

/// Monitor sink that drops every event.
pub struct NoopMonitor;

impl MonitorPort for NoopMonitor {
    fn send_notification(&self, _event: &MonitorEvent) -> Result<(), DomainError> {
        Ok(())
    }
}

/// Map store that accepts every write and dumps nothing.
#[derive(Default)]
pub struct NoopLbMap;

impl LbMapPort for NoopLbMap {
    fn init_maps(&mut self, _flags: &InitMapsFlags) -> Result<(), DomainError> {
        Ok(())
    }

    fn legacy_backend_map_exists(&self) -> bool {
        false
    }

    fn migrate_legacy_backends(&mut self) -> Result<usize, DomainError> {
        Ok(0)
    }

    fn upsert_service(&mut self, _params: &UpsertServiceParams<'_>) -> Result<(), DomainError> {
        Ok(())
    }

    fn upsert_maglev_table(
        &mut self,
        _id: ServiceId,
        _backends: &BTreeMap<BackendKey, BackendId>,
        _ipv6: bool,
    ) -> Result<(), DomainError> {
        Ok(())
    }

    fn is_maglev_table_recreated(&self, _ipv6: bool) -> bool {
        false
    }

    fn delete_service(
        &mut self,
        _frontend: &L3n4AddrId,
        _backend_count: usize,
        _use_maglev: bool,
        _nat_policy: NatPolicy,
    ) -> Result<(), DomainError> {
        Ok(())
    }

    fn add_backend(&mut self, _backend: &Backend, _ipv6: bool) -> Result<(), DomainError> {
        Ok(())
    }

    fn delete_backend_by_id(&mut self, _id: BackendId) {}

    fn add_affinity_match(&mut self, _svc: ServiceId, _backend: BackendId) -> Result<(), DomainError> {
        Ok(())
    }

    fn delete_affinity_match(
        &mut self,
        _svc: ServiceId,
        _backend: BackendId,
    ) -> Result<(), DomainError> {
        Ok(())
    }

    fn update_source_ranges(
        &mut self,
        _svc: ServiceId,
        _prev: &[Cidr],
        _ranges: &[Cidr],
        _ipv6: bool,
    ) -> Result<(), DomainError> {
        Ok(())
    }

    fn dump_service_maps(&self) -> ServiceDump {
        ServiceDump::default()
    }

    fn dump_backend_maps(&self) -> Result<Vec<Backend>, DomainError> {
        Ok(Vec::new())
    }

    fn dump_affinity_matches(
        &self,
    ) -> Result<BTreeMap<ServiceId, BTreeSet<BackendId>>, DomainError> {
        Ok(BTreeMap::new())
    }

    fn dump_source_ranges(&self, _ipv6: bool) -> Result<HashMap<ServiceId, Vec<Cidr>>, DomainError> {
        Ok(HashMap::new())
    }
}

/// Allocator handing out increasing identifiers, never reusing them.
#[derive(Default)]
pub struct SequentialIds {
    frontends: HashMap<L3n4Addr, ServiceId>,
    backends: HashMap<BackendKey, BackendId>,
    next_frontend: u16,
    next_backend: u32,
}

impl IdAllocatorPort for SequentialIds {
    fn acquire_frontend_id(
        &mut self,
        addr: &L3n4Addr,
        _hint: ServiceId,
    ) -> Result<ServiceId, DomainError> {
        if let Some(id) = self.frontends.get(addr) {
            return Ok(*id);
        }
        self.next_frontend = self
            .next_frontend
            .checked_add(1)
            .ok_or_else(|| DomainError::EngineError("frontend ids exhausted".to_string()))?;
        let id = ServiceId(self.next_frontend);
        self.frontends.insert(*addr, id);
        Ok(id)
    }

    fn restore_frontend_id(&mut self, addr: &L3n4Addr, id: ServiceId) -> Result<(), DomainError> {
        self.frontends.insert(*addr, id);
        self.next_frontend = self.next_frontend.max(id.0);
        Ok(())
    }

    fn delete_frontend_id(&mut self, id: ServiceId) -> Result<(), DomainError> {
        self.frontends.retain(|_, v| *v != id);
        Ok(())
    }

    fn acquire_backend_id(&mut self, key: &BackendKey) -> Result<BackendId, DomainError> {
        if let Some(id) = self.backends.get(key) {
            return Ok(*id);
        }
        self.next_backend += 1;
        let id = BackendId(self.next_backend);
        self.backends.insert(*key, id);
        Ok(id)
    }

    fn restore_backend_id(&mut self, key: &BackendKey, id: BackendId) -> Result<(), DomainError> {
        self.backends.insert(*key, id);
        self.next_backend = self.next_backend.max(id.0);
        Ok(())
    }

    fn delete_backend_id(&mut self, id: BackendId) {
        self.backends.retain(|_, v| *v != id);
    }
}
