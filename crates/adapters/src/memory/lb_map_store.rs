use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use domain::common::entity::IpFamily;
use domain::common::error::DomainError;
use domain::service::entity::{
    Backend, BackendId, BackendKey, Cidr, L3n4Addr, L3n4AddrId, LbSvc, NatPolicy, Scope,
    ServiceId, SvcType, TrafficPolicy,
};
use domain::service::maglev::build_lookup_table;
use domain::service::options::InitMapsFlags;
use ports::secondary::lb_map_port::{LbMapPort, ServiceDump, UpsertServiceParams};
use tracing::{debug, info, warn};

// ── Map entries ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct ServiceEntry {
    id: ServiceId,
    frontend: L3n4Addr,
    /// Backend IDs in slot order.
    slots: Vec<BackendId>,
    svc_type: SvcType,
    nat_policy: NatPolicy,
    local: bool,
    scope: Scope,
    session_affinity: bool,
    session_affinity_timeout_sec: u32,
    check_source_range: bool,
    l7_lb_proxy_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BackendEntry {
    ip: IpAddr,
    port: u16,
    terminating: bool,
}

impl BackendEntry {
    fn from_backend(b: &Backend) -> Self {
        Self {
            ip: b.ip,
            port: b.port,
            terminating: b.terminating,
        }
    }

    fn to_backend(self, id: BackendId) -> Backend {
        let b = Backend::new(self.ip, self.port).with_id(id);
        if self.terminating { b.terminating() } else { b }
    }
}

/// Maps of one address family.
#[derive(Debug, Default)]
struct FamilyMaps {
    services: HashMap<L3n4Addr, ServiceEntry>,
    rev_nat: HashMap<ServiceId, L3n4Addr>,
    backends: BTreeMap<BackendId, BackendEntry>,
    maglev: HashMap<ServiceId, Vec<BackendId>>,
    source_ranges: HashMap<ServiceId, Vec<Cidr>>,
    sock_rev_nat: bool,
}

impl FamilyMaps {
    fn clear(&mut self) {
        self.services.clear();
        self.rev_nat.clear();
        self.backends.clear();
        self.maglev.clear();
        self.source_ranges.clear();
    }
}

#[derive(Debug, Default)]
struct MapTables {
    v4: Option<FamilyMaps>,
    v6: Option<FamilyMaps>,
    affinity: BTreeMap<ServiceId, BTreeSet<BackendId>>,
    /// Backend map of the previous map version, keyed the same way.
    legacy_backends: Option<BTreeMap<BackendId, BackendEntry>>,
    maglev_table_size: Option<u32>,
}

impl MapTables {
    fn family(&self, ipv6: bool) -> Result<&FamilyMaps, DomainError> {
        let maps = if ipv6 { self.v6.as_ref() } else { self.v4.as_ref() };
        maps.ok_or_else(|| not_open(ipv6))
    }

    fn family_mut(&mut self, ipv6: bool) -> Result<&mut FamilyMaps, DomainError> {
        let maps = if ipv6 { self.v6.as_mut() } else { self.v4.as_mut() };
        maps.ok_or_else(|| not_open(ipv6))
    }
}

fn not_open(ipv6: bool) -> DomainError {
    DomainError::EngineError(format!(
        "{} load balancer maps are not open",
        IpFamily::from_is_ipv6(ipv6)
    ))
}

// ── Pinned state ───────────────────────────────────────────────────

/// Map contents that outlive any single [`MemoryLbMap`] handle, the way
/// pinned kernel maps outlive the agent process.
#[derive(Debug, Clone, Default)]
pub struct PinnedMaps {
    tables: Arc<Mutex<MapTables>>,
}

impl PinnedMaps {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MapTables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pin a backend entry in the previous-version backend map.
    pub fn insert_legacy_backend(&self, id: BackendId, ip: IpAddr, port: u16) {
        self.lock()
            .legacy_backends
            .get_or_insert_with(BTreeMap::new)
            .insert(
                id,
                BackendEntry {
                    ip,
                    port,
                    terminating: false,
                },
            );
    }

    pub fn service_ids(&self, ipv6: bool) -> Vec<ServiceId> {
        let tables = self.lock();
        let mut ids: Vec<ServiceId> = tables
            .family(ipv6)
            .map(|f| f.services.values().map(|s| s.id).collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Backend slots of the service entry for `frontend`.
    pub fn service_slots(&self, frontend: &L3n4Addr) -> Option<Vec<BackendId>> {
        let tables = self.lock();
        let fam = tables.family(frontend.is_ipv6()).ok()?;
        fam.services.get(frontend).map(|s| s.slots.clone())
    }

    pub fn backend_ids(&self, ipv6: bool) -> Vec<BackendId> {
        self.lock()
            .family(ipv6)
            .map(|f| f.backends.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn maglev_table(&self, id: ServiceId, ipv6: bool) -> Option<Vec<BackendId>> {
        self.lock()
            .family(ipv6)
            .ok()
            .and_then(|f| f.maglev.get(&id).cloned())
    }

    pub fn rev_nat(&self, id: ServiceId, ipv6: bool) -> Option<L3n4Addr> {
        self.lock()
            .family(ipv6)
            .ok()
            .and_then(|f| f.rev_nat.get(&id).copied())
    }

    pub fn affinity_matches(&self, id: ServiceId) -> BTreeSet<BackendId> {
        self.lock().affinity.get(&id).cloned().unwrap_or_default()
    }

    pub fn source_ranges(&self, id: ServiceId, ipv6: bool) -> Vec<Cidr> {
        self.lock()
            .family(ipv6)
            .ok()
            .and_then(|f| f.source_ranges.get(&id).cloned())
            .unwrap_or_default()
    }

    pub fn has_sock_rev_nat(&self, ipv6: bool) -> bool {
        self.lock().family(ipv6).is_ok_and(|f| f.sock_rev_nat)
    }

    pub fn has_legacy_backends(&self) -> bool {
        self.lock().legacy_backends.is_some()
    }
}

// ── Map store ──────────────────────────────────────────────────────

/// In-process map store with the lifecycle of the datapath LB maps.
///
/// Each family's service map is keyed by frontend address and holds the
/// backend IDs in slot order; backend entries are keyed by ID. A backend
/// written to the IPv6 map with an IPv4 address is the NAT64 shadow entry
/// and is skipped by [`LbMapPort::dump_backend_maps`].
pub struct MemoryLbMap {
    pinned: PinnedMaps,
    maglev_table_size: u32,
    maglev_recreated: [bool; 2],
}

impl MemoryLbMap {
    pub fn open(pinned: &PinnedMaps, maglev_table_size: u32) -> Self {
        Self {
            pinned: pinned.clone(),
            maglev_table_size,
            maglev_recreated: [false; 2],
        }
    }
}

impl LbMapPort for MemoryLbMap {
    fn init_maps(&mut self, flags: &InitMapsFlags) -> Result<(), DomainError> {
        let mut guard = self.pinned.lock();
        let t = &mut *guard;

        if !flags.restore {
            for fam in [t.v4.as_mut(), t.v6.as_mut()].into_iter().flatten() {
                fam.clear();
            }
            t.affinity.clear();
        }

        for (ipv6, enabled) in [(false, flags.ipv4), (true, flags.ipv6)] {
            if !enabled {
                continue;
            }
            let slot = if ipv6 { &mut t.v6 } else { &mut t.v4 };
            let fam = slot.get_or_insert_with(FamilyMaps::default);
            fam.sock_rev_nat = flags.sock_maps;
        }

        if t.maglev_table_size != Some(self.maglev_table_size) {
            for (i, fam) in [t.v4.as_mut(), t.v6.as_mut()].into_iter().enumerate() {
                if let Some(fam) = fam {
                    fam.maglev.clear();
                    self.maglev_recreated[i] = true;
                }
            }
            t.maglev_table_size = Some(self.maglev_table_size);
        }

        info!(
            ipv4 = flags.ipv4,
            ipv6 = flags.ipv6,
            sock_maps = flags.sock_maps,
            restore = flags.restore,
            maglev_table_size = self.maglev_table_size,
            "load balancer maps opened"
        );
        Ok(())
    }

    fn legacy_backend_map_exists(&self) -> bool {
        self.pinned.has_legacy_backends()
    }

    fn migrate_legacy_backends(&mut self) -> Result<usize, DomainError> {
        let mut t = self.pinned.lock();
        let Some(legacy) = t.legacy_backends.take() else {
            return Ok(0);
        };

        let mut migrated = 0;
        let mut failed = 0;
        for (id, entry) in legacy {
            let fam = match t.family_mut(entry.ip.is_ipv6()) {
                Ok(fam) => fam,
                Err(e) => {
                    failed += 1;
                    warn!(backend_id = %id, "unable to migrate legacy backend: {e}");
                    continue;
                }
            };
            match fam.backends.get(&id) {
                Some(current) if current.ip != entry.ip || current.port != entry.port => {
                    failed += 1;
                    warn!(backend_id = %id, "legacy backend id already used by another address");
                }
                Some(_) => {}
                None => {
                    fam.backends.insert(id, entry);
                    migrated += 1;
                }
            }
        }
        if failed > 0 {
            warn!(migrated, failed, "legacy backend map partially migrated");
        }
        Ok(migrated)
    }

    fn upsert_service(&mut self, p: &UpsertServiceParams<'_>) -> Result<(), DomainError> {
        let size = self.maglev_table_size;
        let mut t = self.pinned.lock();

        if p.use_maglev {
            let table = build_lookup_table(p.active_backends, size);
            if p.nat_policy == NatPolicy::Nat46 {
                t.family_mut(true)?.maglev.insert(p.id, table.clone());
            }
            t.family_mut(p.ipv6)?.maglev.insert(p.id, table);
        }

        let fam = t.family_mut(p.ipv6)?;
        let slots: Vec<BackendId> = p.active_backends.values().copied().collect();
        if p.prev_active_backend_count > slots.len() {
            debug!(
                service_id = %p.id,
                removed = p.prev_active_backend_count - slots.len(),
                "removing stale backend slots"
            );
        }
        fam.rev_nat.insert(p.id, p.frontend);
        fam.services.insert(
            p.frontend,
            ServiceEntry {
                id: p.id,
                frontend: p.frontend,
                slots,
                svc_type: p.svc_type,
                nat_policy: p.nat_policy,
                local: p.local,
                scope: p.scope,
                session_affinity: p.session_affinity,
                session_affinity_timeout_sec: p.session_affinity_timeout_sec,
                check_source_range: p.check_source_range,
                l7_lb_proxy_port: p.l7_lb_proxy_port,
            },
        );
        Ok(())
    }

    fn upsert_maglev_table(
        &mut self,
        id: ServiceId,
        backends: &BTreeMap<BackendKey, BackendId>,
        ipv6: bool,
    ) -> Result<(), DomainError> {
        let table = build_lookup_table(backends, self.maglev_table_size);
        self.pinned.lock().family_mut(ipv6)?.maglev.insert(id, table);
        Ok(())
    }

    fn is_maglev_table_recreated(&self, ipv6: bool) -> bool {
        self.maglev_recreated[usize::from(ipv6)]
    }

    fn delete_service(
        &mut self,
        frontend: &L3n4AddrId,
        backend_count: usize,
        use_maglev: bool,
        nat_policy: NatPolicy,
    ) -> Result<(), DomainError> {
        let mut t = self.pinned.lock();
        let fam = t.family_mut(frontend.addr.is_ipv6())?;
        fam.services.remove(&frontend.addr);
        fam.rev_nat.remove(&frontend.id);
        if use_maglev {
            fam.maglev.remove(&frontend.id);
            if nat_policy == NatPolicy::Nat46
                && let Ok(v6) = t.family_mut(true)
            {
                v6.maglev.remove(&frontend.id);
            }
        }
        debug!(service_id = %frontend.id, backend_count, "service entry removed");
        Ok(())
    }

    fn add_backend(&mut self, backend: &Backend, ipv6: bool) -> Result<(), DomainError> {
        self.pinned
            .lock()
            .family_mut(ipv6)?
            .backends
            .insert(backend.id, BackendEntry::from_backend(backend));
        Ok(())
    }

    fn delete_backend_by_id(&mut self, id: BackendId) {
        let mut guard = self.pinned.lock();
        let t = &mut *guard;
        for fam in [t.v4.as_mut(), t.v6.as_mut()].into_iter().flatten() {
            fam.backends.remove(&id);
        }
    }

    fn add_affinity_match(&mut self, svc: ServiceId, backend: BackendId) -> Result<(), DomainError> {
        self.pinned
            .lock()
            .affinity
            .entry(svc)
            .or_default()
            .insert(backend);
        Ok(())
    }

    fn delete_affinity_match(
        &mut self,
        svc: ServiceId,
        backend: BackendId,
    ) -> Result<(), DomainError> {
        let mut t = self.pinned.lock();
        let Some(set) = t.affinity.get_mut(&svc) else {
            return Err(DomainError::RuleNotFound(format!(
                "affinity match {svc}/{backend}"
            )));
        };
        set.remove(&backend);
        if set.is_empty() {
            t.affinity.remove(&svc);
        }
        Ok(())
    }

    fn update_source_ranges(
        &mut self,
        svc: ServiceId,
        prev: &[Cidr],
        ranges: &[Cidr],
        ipv6: bool,
    ) -> Result<(), DomainError> {
        let mut t = self.pinned.lock();
        let fam = t.family_mut(ipv6)?;
        let current = fam.source_ranges.entry(svc).or_default();
        current.retain(|c| !prev.contains(c) || ranges.contains(c));
        for cidr in ranges {
            if !current.contains(cidr) {
                current.push(*cidr);
            }
        }
        if current.is_empty() {
            fam.source_ranges.remove(&svc);
        }
        Ok(())
    }

    fn dump_service_maps(&self) -> ServiceDump {
        let t = self.pinned.lock();
        let mut dump = ServiceDump::default();

        for ipv6 in [false, true] {
            let Ok(fam) = t.family(ipv6) else {
                continue;
            };
            for entry in fam.services.values() {
                let backends_v6 = match entry.nat_policy {
                    NatPolicy::Nat46 => true,
                    NatPolicy::Nat64 => false,
                    NatPolicy::None => ipv6,
                };
                let backend_map = match t.family(backends_v6) {
                    Ok(f) => &f.backends,
                    Err(e) => {
                        dump.errors.push(e);
                        continue;
                    }
                };

                let mut backends = Vec::with_capacity(entry.slots.len());
                for id in &entry.slots {
                    match backend_map.get(id) {
                        Some(b) => backends.push(b.to_backend(*id)),
                        None => dump.errors.push(DomainError::RuleNotFound(format!(
                            "backend {id} of service {}",
                            entry.id
                        ))),
                    }
                }

                let frontend = entry.frontend.with_scope(entry.scope);
                let mut svc = LbSvc::new(frontend, entry.svc_type).with_backends(backends);
                svc.frontend = L3n4AddrId::new(frontend, entry.id);
                svc.nat_policy = entry.nat_policy;
                svc.traffic_policy = if entry.local {
                    TrafficPolicy::Local
                } else {
                    TrafficPolicy::Cluster
                };
                svc.session_affinity = entry.session_affinity;
                svc.session_affinity_timeout_sec = entry.session_affinity_timeout_sec;
                svc.l7_lb_proxy_port = entry.l7_lb_proxy_port;
                if entry.check_source_range {
                    svc.load_balancer_source_ranges =
                        fam.source_ranges.get(&entry.id).cloned().unwrap_or_default();
                }
                dump.services.push(svc);
            }
        }

        dump.services.sort_by_key(|s| s.frontend.id);
        dump
    }

    fn dump_backend_maps(&self) -> Result<Vec<Backend>, DomainError> {
        let t = self.pinned.lock();
        let mut out = Vec::new();
        for ipv6 in [false, true] {
            let Ok(fam) = t.family(ipv6) else {
                continue;
            };
            out.extend(
                fam.backends
                    .iter()
                    .filter(|(_, b)| b.ip.is_ipv6() == ipv6)
                    .map(|(id, b)| b.to_backend(*id)),
            );
        }
        Ok(out)
    }

    fn dump_affinity_matches(
        &self,
    ) -> Result<BTreeMap<ServiceId, BTreeSet<BackendId>>, DomainError> {
        Ok(self.pinned.lock().affinity.clone())
    }

    fn dump_source_ranges(&self, ipv6: bool) -> Result<HashMap<ServiceId, Vec<Cidr>>, DomainError> {
        Ok(self.pinned.lock().family(ipv6)?.source_ranges.clone())
    }
}
