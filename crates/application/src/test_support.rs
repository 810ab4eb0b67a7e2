// Recording test doubles shared by the registry tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use domain::common::error::DomainError;
use domain::service::entity::{
    Backend, BackendId, BackendKey, Cidr, L3n4Addr, L3n4AddrId, LbSvc, NatPolicy, ServiceId,
    ServiceName, SvcType, TrafficPolicy,
};
use domain::service::options::{InitMapsFlags, RegistryOptions};
use ports::secondary::health_server_port::HealthServerPort;
use ports::secondary::id_allocator_port::IdAllocatorPort;
use ports::secondary::lb_map_port::{LbMapPort, ServiceDump, UpsertServiceParams};
use ports::secondary::metrics_port::{MetricsPort, RestoreMetrics, ServiceMetrics};
use ports::secondary::monitor_port::{MonitorEvent, MonitorPort};
use ports::secondary::proxy_endpoint_port::ProxyEndpointPort;

use crate::service_registry_impl::ServiceRegistry;

// ── Builders ───────────────────────────────────────────────────────

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

pub fn fe(addr: &str, port: u16) -> L3n4Addr {
    L3n4Addr::new(ip(addr), port)
}

pub fn key(addr: &str, port: u16) -> BackendKey {
    BackendKey::new(ip(addr), port)
}

pub fn backend(addr: &str, port: u16) -> Backend {
    Backend::new(ip(addr), port)
}

/// ClusterIP service with the given backends.
pub fn lb_svc(addr: &str, port: u16, backends: &[(&str, u16)]) -> LbSvc {
    LbSvc::new(fe(addr, port), SvcType::ClusterIp)
        .with_backends(backends.iter().map(|(a, p)| backend(a, *p)).collect())
}

/// Service entry as found in the maps after a restart.
pub fn restored_svc(id: u16, addr: &str, port: u16, backends: &[(u32, &str, u16)]) -> LbSvc {
    let mut svc = LbSvc::new(fe(addr, port), SvcType::ClusterIp).with_backends(
        backends
            .iter()
            .map(|(bid, a, p)| backend(a, *p).with_id(BackendId(*bid)))
            .collect(),
    );
    svc.frontend.id = ServiceId(id);
    svc
}

fn failure(op: &str) -> DomainError {
    DomainError::EngineError(format!("injected {op} failure"))
}

// ── Map store ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapCall {
    InitMaps,
    MigrateLegacy,
    UpsertService(ServiceId),
    UpsertMaglev { id: ServiceId, ipv6: bool },
    DeleteService(ServiceId),
    AddBackend { id: BackendId, ipv6: bool },
    DeleteBackend(BackendId),
    AddAffinity(ServiceId, BackendId),
    DeleteAffinity(ServiceId, BackendId),
    UpdateSourceRanges(ServiceId),
}

#[derive(Debug, Clone)]
pub struct UpsertRecord {
    pub id: ServiceId,
    pub active: Vec<BackendId>,
    pub prev_active: usize,
    pub local: bool,
    pub nat_policy: NatPolicy,
    pub session_affinity: bool,
    pub check_source_range: bool,
    pub use_maglev: bool,
    pub l7_lb_proxy_port: u16,
}

#[derive(Default)]
struct MapState {
    calls: Vec<MapCall>,
    upserts: Vec<UpsertRecord>,
    added: Vec<Backend>,
    services: BTreeMap<ServiceId, LbSvc>,
    backends: BTreeMap<BackendId, Backend>,
    affinity: BTreeMap<ServiceId, BTreeSet<BackendId>>,
    ranges: BTreeMap<(ServiceId, bool), Vec<Cidr>>,
    dump_errors: Vec<String>,
    maglev_recreated: bool,
    legacy: bool,
    fail_on: Option<&'static str>,
}

impl MapState {
    fn check(&self, op: &'static str) -> Result<(), DomainError> {
        if self.fail_on == Some(op) {
            return Err(failure(op));
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct RecordingMap {
    state: Arc<Mutex<MapState>>,
}

impl RecordingMap {
    fn with<R>(&self, f: impl FnOnce(&mut MapState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn calls(&self) -> Vec<MapCall> {
        self.with(|s| s.calls.clone())
    }

    pub fn clear_calls(&self) {
        self.with(|s| {
            s.calls.clear();
            s.upserts.clear();
            s.added.clear();
        });
    }

    /// Backends written to the map of their own family.
    pub fn added_backends(&self) -> Vec<Backend> {
        self.with(|s| s.added.clone())
    }

    pub fn service(&self, id: ServiceId) -> Option<LbSvc> {
        self.with(|s| s.services.get(&id).cloned())
    }

    pub fn prev_active_counts(&self) -> Vec<usize> {
        self.with(|s| s.upserts.iter().map(|u| u.prev_active).collect())
    }

    pub fn last_upsert(&self) -> Option<UpsertRecord> {
        self.with(|s| s.upserts.last().cloned())
    }

    pub fn affinity(&self, id: ServiceId) -> BTreeSet<BackendId> {
        self.with(|s| s.affinity.get(&id).cloned().unwrap_or_default())
    }

    pub fn source_ranges(&self, id: ServiceId) -> Vec<Cidr> {
        self.with(|s| {
            s.ranges
                .iter()
                .filter(|((sid, _), _)| *sid == id)
                .flat_map(|(_, c)| c.clone())
                .collect()
        })
    }

    pub fn fail_on(&self, op: &'static str) {
        self.with(|s| s.fail_on = Some(op));
    }

    pub fn clear_failure(&self) {
        self.with(|s| s.fail_on = None);
    }

    pub fn seed_service(&self, svc: LbSvc) {
        self.with(|s| s.services.insert(svc.frontend.id, svc));
    }

    pub fn seed_backend(&self, b: Backend) {
        self.with(|s| s.backends.insert(b.id, b));
    }

    pub fn seed_affinity(&self, svc: ServiceId, b: BackendId) {
        self.with(|s| s.affinity.entry(svc).or_default().insert(b));
    }

    pub fn seed_source_ranges(&self, svc: ServiceId, cidrs: Vec<Cidr>) {
        self.with(|s| s.ranges.insert((svc, false), cidrs));
    }

    pub fn set_maglev_recreated(&self, recreated: bool) {
        self.with(|s| s.maglev_recreated = recreated);
    }

    pub fn set_legacy(&self, legacy: bool) {
        self.with(|s| s.legacy = legacy);
    }

    pub fn push_dump_error(&self, msg: &str) {
        self.with(|s| s.dump_errors.push(msg.to_string()));
    }
}

impl LbMapPort for RecordingMap {
    fn init_maps(&mut self, flags: &InitMapsFlags) -> Result<(), DomainError> {
        self.with(|s| {
            s.check("init_maps")?;
            s.calls.push(MapCall::InitMaps);
            if !flags.restore {
                s.services.clear();
                s.backends.clear();
                s.affinity.clear();
                s.ranges.clear();
            }
            Ok(())
        })
    }

    fn legacy_backend_map_exists(&self) -> bool {
        self.with(|s| s.legacy)
    }

    fn migrate_legacy_backends(&mut self) -> Result<usize, DomainError> {
        self.with(|s| {
            s.check("migrate_legacy_backends")?;
            s.calls.push(MapCall::MigrateLegacy);
            s.legacy = false;
            Ok(0)
        })
    }

    fn upsert_service(&mut self, p: &UpsertServiceParams<'_>) -> Result<(), DomainError> {
        self.with(|s| {
            s.check("upsert_service")?;
            s.calls.push(MapCall::UpsertService(p.id));
            s.upserts.push(UpsertRecord {
                id: p.id,
                active: p.active_backends.values().copied().collect(),
                prev_active: p.prev_active_backend_count,
                local: p.local,
                nat_policy: p.nat_policy,
                session_affinity: p.session_affinity,
                check_source_range: p.check_source_range,
                use_maglev: p.use_maglev,
                l7_lb_proxy_port: p.l7_lb_proxy_port,
            });
            let mut svc = LbSvc::new(p.frontend, p.svc_type).with_backends(
                p.active_backends
                    .iter()
                    .map(|(k, id)| Backend::new(k.ip, k.port).with_id(*id))
                    .collect(),
            );
            svc.frontend = L3n4AddrId::new(p.frontend, p.id);
            svc.nat_policy = p.nat_policy;
            svc.session_affinity = p.session_affinity;
            svc.session_affinity_timeout_sec = p.session_affinity_timeout_sec;
            svc.l7_lb_proxy_port = p.l7_lb_proxy_port;
            if p.local {
                svc.traffic_policy = TrafficPolicy::Local;
            }
            s.services.insert(p.id, svc);
            Ok(())
        })
    }

    fn upsert_maglev_table(
        &mut self,
        id: ServiceId,
        _backends: &BTreeMap<BackendKey, BackendId>,
        ipv6: bool,
    ) -> Result<(), DomainError> {
        self.with(|s| {
            s.check("upsert_maglev_table")?;
            s.calls.push(MapCall::UpsertMaglev { id, ipv6 });
            Ok(())
        })
    }

    fn is_maglev_table_recreated(&self, _ipv6: bool) -> bool {
        self.with(|s| s.maglev_recreated)
    }

    fn delete_service(
        &mut self,
        frontend: &L3n4AddrId,
        _backend_count: usize,
        _use_maglev: bool,
        _nat_policy: NatPolicy,
    ) -> Result<(), DomainError> {
        self.with(|s| {
            s.check("delete_service")?;
            s.calls.push(MapCall::DeleteService(frontend.id));
            s.services.remove(&frontend.id);
            Ok(())
        })
    }

    fn add_backend(&mut self, backend: &Backend, ipv6: bool) -> Result<(), DomainError> {
        self.with(|s| {
            s.check("add_backend")?;
            s.calls.push(MapCall::AddBackend {
                id: backend.id,
                ipv6,
            });
            if ipv6 == backend.is_ipv6() {
                s.added.push(backend.clone());
            }
            s.backends.insert(backend.id, backend.clone());
            Ok(())
        })
    }

    fn delete_backend_by_id(&mut self, id: BackendId) {
        self.with(|s| {
            s.calls.push(MapCall::DeleteBackend(id));
            s.backends.remove(&id);
        });
    }

    fn add_affinity_match(&mut self, svc: ServiceId, backend: BackendId) -> Result<(), DomainError> {
        self.with(|s| {
            s.check("add_affinity_match")?;
            s.calls.push(MapCall::AddAffinity(svc, backend));
            s.affinity.entry(svc).or_default().insert(backend);
            Ok(())
        })
    }

    fn delete_affinity_match(
        &mut self,
        svc: ServiceId,
        backend: BackendId,
    ) -> Result<(), DomainError> {
        self.with(|s| {
            s.check("delete_affinity_match")?;
            s.calls.push(MapCall::DeleteAffinity(svc, backend));
            if let Some(set) = s.affinity.get_mut(&svc) {
                set.remove(&backend);
                if set.is_empty() {
                    s.affinity.remove(&svc);
                }
            }
            Ok(())
        })
    }

    fn update_source_ranges(
        &mut self,
        svc: ServiceId,
        _prev: &[Cidr],
        ranges: &[Cidr],
        ipv6: bool,
    ) -> Result<(), DomainError> {
        self.with(|s| {
            s.check("update_source_ranges")?;
            s.calls.push(MapCall::UpdateSourceRanges(svc));
            if ranges.is_empty() {
                s.ranges.remove(&(svc, ipv6));
            } else {
                s.ranges.insert((svc, ipv6), ranges.to_vec());
            }
            Ok(())
        })
    }

    fn dump_service_maps(&self) -> ServiceDump {
        self.with(|s| ServiceDump {
            services: s.services.values().cloned().collect(),
            errors: s
                .dump_errors
                .iter()
                .map(|m| DomainError::EngineError(m.clone()))
                .collect(),
        })
    }

    fn dump_backend_maps(&self) -> Result<Vec<Backend>, DomainError> {
        self.with(|s| {
            s.check("dump_backend_maps")?;
            Ok(s.backends.values().cloned().collect())
        })
    }

    fn dump_affinity_matches(
        &self,
    ) -> Result<BTreeMap<ServiceId, BTreeSet<BackendId>>, DomainError> {
        self.with(|s| {
            s.check("dump_affinity_matches")?;
            Ok(s.affinity.clone())
        })
    }

    fn dump_source_ranges(&self, ipv6: bool) -> Result<HashMap<ServiceId, Vec<Cidr>>, DomainError> {
        self.with(|s| {
            s.check("dump_source_ranges")?;
            Ok(s.ranges
                .iter()
                .filter(|((_, v6), _)| *v6 == ipv6)
                .map(|((id, _), c)| (*id, c.clone()))
                .collect())
        })
    }
}

// ── Identifier allocator ───────────────────────────────────────────

#[derive(Default)]
struct IdState {
    frontends: HashMap<L3n4Addr, ServiceId>,
    backends: HashMap<BackendKey, BackendId>,
    frontend_limit: Option<usize>,
    backend_limit: Option<usize>,
    acquired_frontends: Vec<ServiceId>,
    acquired_backends: Vec<BackendId>,
    released_frontends: Vec<ServiceId>,
    released_backends: Vec<BackendId>,
    restored_frontends: Vec<ServiceId>,
    fail_restores: bool,
    fail_frontend_release: bool,
}

#[derive(Clone, Default)]
pub struct RecordingIds {
    state: Arc<Mutex<IdState>>,
}

impl RecordingIds {
    fn with<R>(&self, f: impl FnOnce(&mut IdState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn limit_frontends(&self, n: usize) {
        self.with(|s| s.frontend_limit = Some(n));
    }

    pub fn limit_backends(&self, n: usize) {
        self.with(|s| s.backend_limit = Some(n));
    }

    pub fn fail_restores(&self) {
        self.with(|s| s.fail_restores = true);
    }

    pub fn fail_frontend_release(&self) {
        self.with(|s| s.fail_frontend_release = true);
    }

    pub fn acquired_frontends(&self) -> Vec<ServiceId> {
        self.with(|s| s.acquired_frontends.clone())
    }

    pub fn acquired_backends(&self) -> Vec<BackendId> {
        self.with(|s| s.acquired_backends.clone())
    }

    pub fn released_frontends(&self) -> Vec<ServiceId> {
        self.with(|s| s.released_frontends.clone())
    }

    pub fn released_backends(&self) -> Vec<BackendId> {
        self.with(|s| s.released_backends.clone())
    }

    pub fn restored_frontends(&self) -> Vec<ServiceId> {
        self.with(|s| s.restored_frontends.clone())
    }
}

impl IdAllocatorPort for RecordingIds {
    fn acquire_frontend_id(
        &mut self,
        addr: &L3n4Addr,
        hint: ServiceId,
    ) -> Result<ServiceId, DomainError> {
        self.with(|s| {
            if let Some(id) = s.frontends.get(addr) {
                return Ok(*id);
            }
            if s.frontend_limit.is_some_and(|l| s.frontends.len() >= l) {
                return Err(failure("frontend id"));
            }
            let used: BTreeSet<ServiceId> = s.frontends.values().copied().collect();
            let id = if hint.0 != 0 && !used.contains(&hint) {
                hint
            } else {
                (1..=u16::MAX)
                    .map(ServiceId)
                    .find(|id| !used.contains(id))
                    .ok_or_else(|| failure("frontend id"))?
            };
            s.frontends.insert(*addr, id);
            s.acquired_frontends.push(id);
            Ok(id)
        })
    }

    fn restore_frontend_id(&mut self, addr: &L3n4Addr, id: ServiceId) -> Result<(), DomainError> {
        self.with(|s| {
            if s.fail_restores {
                return Err(failure("restore frontend id"));
            }
            s.frontends.insert(*addr, id);
            s.restored_frontends.push(id);
            Ok(())
        })
    }

    fn delete_frontend_id(&mut self, id: ServiceId) -> Result<(), DomainError> {
        self.with(|s| {
            if s.fail_frontend_release {
                return Err(failure("delete frontend id"));
            }
            s.frontends.retain(|_, v| *v != id);
            s.released_frontends.push(id);
            Ok(())
        })
    }

    fn acquire_backend_id(&mut self, key: &BackendKey) -> Result<BackendId, DomainError> {
        self.with(|s| {
            if let Some(id) = s.backends.get(key) {
                return Ok(*id);
            }
            if s.backend_limit.is_some_and(|l| s.backends.len() >= l) {
                return Err(failure("backend id"));
            }
            let used: BTreeSet<BackendId> = s.backends.values().copied().collect();
            let id = (1..)
                .map(BackendId)
                .find(|id| !used.contains(id))
                .ok_or_else(|| failure("backend id"))?;
            s.backends.insert(*key, id);
            s.acquired_backends.push(id);
            Ok(id)
        })
    }

    fn restore_backend_id(&mut self, key: &BackendKey, id: BackendId) -> Result<(), DomainError> {
        self.with(|s| {
            if s.fail_restores {
                return Err(failure("restore backend id"));
            }
            s.backends.insert(*key, id);
            Ok(())
        })
    }

    fn delete_backend_id(&mut self, id: BackendId) {
        self.with(|s| {
            s.backends.retain(|_, v| *v != id);
            s.released_backends.push(id);
        });
    }
}

// ── Sinks ──────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct RecordingHealth {
    upserts: Arc<Mutex<Vec<(ServiceId, usize, u16)>>>,
    deletes: Arc<Mutex<Vec<ServiceId>>>,
}

impl RecordingHealth {
    pub fn upserts(&self) -> Vec<(ServiceId, usize, u16)> {
        self.upserts.lock().unwrap().clone()
    }

    pub fn deletes(&self) -> Vec<ServiceId> {
        self.deletes.lock().unwrap().clone()
    }
}

impl HealthServerPort for RecordingHealth {
    fn upsert_service(&self, id: ServiceId, _name: &ServiceName, local_backends: usize, port: u16) {
        self.upserts.lock().unwrap().push((id, local_backends, port));
    }

    fn delete_service(&self, id: ServiceId) {
        self.deletes.lock().unwrap().push(id);
    }
}

#[derive(Clone, Default)]
pub struct RecordingProxy {
    pushes: Arc<Mutex<Vec<(ServiceName, Vec<BackendKey>)>>>,
    fail: Arc<Mutex<bool>>,
}

impl RecordingProxy {
    pub fn pushes(&self) -> Vec<(ServiceName, Vec<BackendKey>)> {
        self.pushes.lock().unwrap().clone()
    }

    pub fn fail(&self) {
        *self.fail.lock().unwrap() = true;
    }
}

impl ProxyEndpointPort for RecordingProxy {
    fn upsert_endpoints(&self, service: &ServiceName, backends: &[Backend]) -> Result<(), DomainError> {
        if *self.fail.lock().unwrap() {
            return Err(failure("proxy sync"));
        }
        self.pushes
            .lock()
            .unwrap()
            .push((service.clone(), backends.iter().map(Backend::key).collect()));
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct RecordingMonitor {
    events: Arc<Mutex<Vec<MonitorEvent>>>,
    fail: Arc<Mutex<bool>>,
}

impl RecordingMonitor {
    pub fn events(&self) -> Vec<MonitorEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn fail(&self) {
        *self.fail.lock().unwrap() = true;
    }
}

impl MonitorPort for RecordingMonitor {
    fn send_notification(&self, event: &MonitorEvent) -> Result<(), DomainError> {
        if *self.fail.lock().unwrap() {
            return Err(failure("monitor"));
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingMetrics {
    ops: Mutex<Vec<String>>,
    restored: Mutex<Vec<(String, String, u64)>>,
}

impl RecordingMetrics {
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    pub fn restored(&self) -> Vec<(String, String, u64)> {
        self.restored.lock().unwrap().clone()
    }
}

impl ServiceMetrics for RecordingMetrics {
    fn record_service_op(&self, action: &str) {
        self.ops.lock().unwrap().push(action.to_string());
    }
}

impl RestoreMetrics for RecordingMetrics {
    fn record_restored_entries(&self, kind: &str, result: &str, count: u64) {
        self.restored
            .lock()
            .unwrap()
            .push((kind.to_string(), result.to_string(), count));
    }
}

// ── Harness ────────────────────────────────────────────────────────

/// Shared handles to every double wired into a registry.
pub struct Harness {
    pub opts: RegistryOptions,
    pub map: RecordingMap,
    pub ids: RecordingIds,
    pub health: RecordingHealth,
    pub proxy: RecordingProxy,
    pub monitor: RecordingMonitor,
    pub metrics: Arc<RecordingMetrics>,
}

impl Harness {
    pub fn new(opts: RegistryOptions) -> Self {
        Self {
            opts,
            map: RecordingMap::default(),
            ids: RecordingIds::default(),
            health: RecordingHealth::default(),
            proxy: RecordingProxy::default(),
            monitor: RecordingMonitor::default(),
            metrics: Arc::new(RecordingMetrics::default()),
        }
    }

    pub fn registry(&self) -> ServiceRegistry {
        let metrics: Arc<dyn MetricsPort> = self.metrics.clone();
        let mut reg = ServiceRegistry::new(
            self.opts.clone(),
            Box::new(self.map.clone()),
            Box::new(self.ids.clone()),
            metrics,
        );
        reg.set_health_server(Arc::new(self.health.clone()));
        reg.set_proxy_sink(Arc::new(self.proxy.clone()));
        reg.set_monitor(Arc::new(self.monitor.clone()));
        reg
    }
}
