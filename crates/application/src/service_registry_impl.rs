use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::SystemTime;

use domain::common::entity::IpFamily;
use domain::common::error::DomainError;
use domain::service::entity::{
    Backend, BackendId, BackendKey, Cidr, L3n4Addr, L3n4AddrId, LbSvc, NatPolicy, Provenance,
    ServiceId, ServiceName, SvcType,
};
use domain::service::error::ServiceError;
use domain::service::l7::L7LbTable;
use domain::service::options::RegistryOptions;
use domain::service::record::{Locality, ServiceRecord};
use domain::service::tracker::BackendTracker;
use ports::secondary::health_server_port::HealthServerPort;
use ports::secondary::id_allocator_port::IdAllocatorPort;
use ports::secondary::lb_map_port::{LbMapPort, UpsertServiceParams};
use ports::secondary::metrics_port::MetricsPort;
use ports::secondary::monitor_port::{MonitorEvent, MonitorPort};
use ports::secondary::proxy_endpoint_port::ProxyEndpointPort;

/// Restore protocol phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryPhase {
    /// Nothing restored yet.
    Fresh,
    /// Datapath state restored, waiting for the configuration source to sync.
    Restored,
    /// Unconfirmed restored state has been swept.
    Synced,
}

/// Backend set changes produced by committing an upsert to the cache.
#[derive(Debug, Default)]
struct BackendChanges {
    /// Backends whose global count went from zero to one.
    added: Vec<Backend>,
    /// Backends that left this service.
    dropped: Vec<Backend>,
    /// Dropped backends no longer referenced by any service.
    orphaned: Vec<Backend>,
}

/// Service state preceding an upsert, needed to program the maps.
struct PreviousState {
    session_affinity: bool,
    source_ranges: Vec<Cidr>,
    active_backends: usize,
}

/// Control-plane registry of load balancer services.
///
/// Owns the service cache, the global backend table and the L7 redirect
/// table, and keeps the datapath maps consistent with them. All mutators take
/// `&mut self`; wrap in [`SharedServiceRegistry`](crate::shared_registry::SharedServiceRegistry)
/// for shared access.
pub struct ServiceRegistry {
    pub(crate) opts: RegistryOptions,
    pub(crate) services: HashMap<ServiceId, ServiceRecord>,
    pub(crate) by_frontend: HashMap<L3n4Addr, ServiceId>,
    pub(crate) backends: BackendTracker,
    pub(crate) l7: L7LbTable,
    /// Backends dropped from the tracker whose map entry and ID are not yet released.
    pub(crate) leaked: Vec<Backend>,
    pub(crate) phase: RegistryPhase,
    last_updated: Option<SystemTime>,
    pub(crate) map_port: Box<dyn LbMapPort + Send>,
    pub(crate) id_allocator: Box<dyn IdAllocatorPort + Send>,
    health: Option<Arc<dyn HealthServerPort>>,
    proxy: Option<Arc<dyn ProxyEndpointPort>>,
    monitor: Option<Arc<dyn MonitorPort>>,
    pub(crate) metrics: Arc<dyn MetricsPort>,
}

impl ServiceRegistry {
    pub fn new(
        opts: RegistryOptions,
        map_port: Box<dyn LbMapPort + Send>,
        id_allocator: Box<dyn IdAllocatorPort + Send>,
        metrics: Arc<dyn MetricsPort>,
    ) -> Self {
        Self {
            opts,
            services: HashMap::new(),
            by_frontend: HashMap::new(),
            backends: BackendTracker::new(),
            l7: L7LbTable::new(),
            leaked: Vec::new(),
            phase: RegistryPhase::Fresh,
            last_updated: None,
            map_port,
            id_allocator,
            health: None,
            proxy: None,
            monitor: None,
            metrics,
        }
    }

    pub fn set_health_server(&mut self, health: Arc<dyn HealthServerPort>) {
        self.health = Some(health);
    }

    pub fn set_proxy_sink(&mut self, proxy: Arc<dyn ProxyEndpointPort>) {
        self.proxy = Some(proxy);
    }

    pub fn set_monitor(&mut self, monitor: Arc<dyn MonitorPort>) {
        self.monitor = Some(monitor);
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.opts
    }

    // ── Upsert ─────────────────────────────────────────────────────

    /// Insert or update a service.
    ///
    /// Returns whether the frontend was new and its identifier.
    pub fn upsert(&mut self, desired: LbSvc) -> Result<(bool, ServiceId), ServiceError> {
        self.upsert_inner(desired, false)
    }

    /// `internal` re-upserts (L7 registration changes) keep the record's provenance.
    pub(crate) fn upsert_inner(
        &mut self,
        mut desired: LbSvc,
        internal: bool,
    ) -> Result<(bool, ServiceId), ServiceError> {
        let frontend = desired.frontend.addr;
        let existing_id = self.by_frontend.get(&frontend).copied();

        if desired.name.is_empty()
            && let Some(rec) = existing_id.and_then(|id| self.services.get(&id))
        {
            desired.name = rec.name.clone();
        }

        desired.l7_lb_proxy_port = self.l7.redirect_port(&desired.name);
        if desired.l7_lb_proxy_port != 0 {
            desired.session_affinity = false;
        }

        if !desired.load_balancer_source_ranges.is_empty() {
            for cidr in &desired.load_balancer_source_ranges {
                cidr.validate()?;
            }
            if !self.opts.enable_source_range_check {
                tracing::warn!(
                    frontend = %frontend,
                    service = %desired.name,
                    "source range check is disabled, ignoring load balancer source ranges"
                );
                desired.load_balancer_source_ranges.clear();
            }
        }

        let nat_policy = self.validate_families(&desired)?;

        if let Some(rec) = existing_id.and_then(|id| self.services.get(&id)) {
            check_type_precedence(rec, desired.svc_type, &frontend)?;
        }

        let (is_new, id) = match existing_id {
            Some(id) => (false, id),
            None => {
                let id = self
                    .id_allocator
                    .acquire_frontend_id(&frontend, desired.frontend.id)
                    .map_err(|source| ServiceError::FrontendIdAllocation {
                        frontend: frontend.to_string(),
                        source,
                    })?;
                if let Some(holder) = self.services.get(&id) {
                    let holder = holder.frontend.addr;
                    if let Err(e) = self.id_allocator.delete_frontend_id(id) {
                        tracing::warn!(service_id = %id, "unable to release frontend id: {e}");
                    }
                    return Err(ServiceError::FrontendIdAllocation {
                        frontend: frontend.to_string(),
                        source: DomainError::DuplicateRule(format!(
                            "frontend id {id} already held by {holder}"
                        )),
                    });
                }
                (true, id)
            }
        };

        let locality = Locality::derive(desired.svc_type, desired.traffic_policy, frontend.scope);
        let candidates = self.eligible_backends(desired.backends, locality);

        let current = existing_id
            .and_then(|id| self.services.get(&id))
            .map(|rec| &rec.backend_by_key);
        let staged = match stage_backends(
            &self.backends,
            self.id_allocator.as_mut(),
            current,
            candidates,
        ) {
            Ok(staged) => staged,
            Err(err) => {
                if is_new && let Err(e) = self.id_allocator.delete_frontend_id(id) {
                    tracing::warn!(service_id = %id, "unable to release frontend id: {e}");
                }
                return Err(err);
            }
        };

        // ── Commit to cache ────────────────────────────────────────
        let mut rec = self
            .services
            .remove(&id)
            .unwrap_or_else(|| ServiceRecord::created(L3n4AddrId::new(frontend, id)));
        let prev = PreviousState {
            session_affinity: rec.session_affinity,
            source_ranges: rec.source_ranges.clone(),
            active_backends: rec.active_backends,
        };
        rec.svc_type = desired.svc_type;
        rec.traffic_policy = desired.traffic_policy;
        rec.nat_policy = nat_policy;
        rec.session_affinity = desired.session_affinity;
        rec.session_affinity_timeout_sec = desired.session_affinity_timeout_sec;
        rec.health_check_node_port = desired.health_check_node_port;
        rec.name = desired.name;
        rec.source_ranges = desired.load_balancer_source_ranges;
        rec.l7_lb_proxy_port = desired.l7_lb_proxy_port;
        if !internal {
            rec.confirm();
        }
        let changes = self.commit_backends(&mut rec, staged);
        self.by_frontend.insert(frontend, id);
        self.services.insert(id, rec);

        tracing::debug!(
            service_id = %id,
            frontend = %frontend,
            new = is_new,
            added = changes.added.len(),
            dropped = changes.dropped.len(),
            "upserting service"
        );

        // ── Program the datapath ───────────────────────────────────
        if let Err(err) = self.sync_proxy_and_maps(id, locality, &prev, &changes) {
            self.park_leaked(changes.orphaned);
            return Err(err);
        }
        self.release_orphans(changes.orphaned);

        self.sync_health(id, locality);

        self.metrics
            .record_service_op(if is_new { "add" } else { "update" });
        if let Some(rec) = self.services.get(&id) {
            self.notify(&MonitorEvent::ServiceUpsert {
                id,
                frontend,
                backends: rec.backends.iter().map(Backend::key).collect(),
                svc_type: rec.svc_type,
                traffic_policy: rec.traffic_policy,
                name: rec.name.clone(),
            });
        }
        self.finish_mutation();
        Ok((is_new, id))
    }

    /// Reject disabled families and mixed backend sets, and derive the NAT policy.
    fn validate_families(&self, desired: &LbSvc) -> Result<NatPolicy, ServiceError> {
        let frontend = &desired.frontend.addr;
        if !self.opts.family_enabled(frontend.is_ipv6()) {
            return Err(ServiceError::FamilyDisabled {
                family: frontend.family(),
                addr: frontend.to_string(),
            });
        }

        let v6 = desired.backends.iter().filter(|b| b.is_ipv6()).count();
        if v6 != 0 && v6 != desired.backends.len() {
            return Err(ServiceError::MixedBackendFamilies {
                frontend: frontend.to_string(),
            });
        }
        let backends_v6 = desired.backends.first().map(Backend::is_ipv6);

        let nat_policy = NatPolicy::derive(frontend.is_ipv6(), backends_v6);
        if nat_policy.is_some() {
            if !self.opts.enable_nat46x64 {
                return Err(ServiceError::NatDisabled {
                    frontend: frontend.to_string(),
                    policy: nat_policy,
                });
            }
            if let Some(b) = desired.backends.first()
                && !self.opts.family_enabled(b.is_ipv6())
            {
                return Err(ServiceError::FamilyDisabled {
                    family: IpFamily::of(&b.ip),
                    addr: b.key().to_string(),
                });
            }
        }
        Ok(nat_policy)
    }

    /// Apply the node-local filter and drop duplicate addresses.
    fn eligible_backends(&self, backends: Vec<Backend>, locality: Locality) -> Vec<Backend> {
        let mut seen = HashSet::new();
        backends
            .into_iter()
            .filter(|b| {
                !locality.filter
                    || b
                        .node_name
                        .as_deref()
                        .is_none_or(|node| node == self.opts.node_name)
            })
            .filter(|b| seen.insert(b.key()))
            .collect()
    }

    /// Swap the record's backend set for `staged`, moving global references.
    fn commit_backends(&mut self, rec: &mut ServiceRecord, staged: Vec<Backend>) -> BackendChanges {
        let mut changes = BackendChanges::default();
        let staged_keys: HashSet<BackendKey> = staged.iter().map(Backend::key).collect();

        for b in &staged {
            if !rec.backend_by_key.contains_key(&b.key()) && self.backends.retain(b) {
                changes.added.push(b.clone());
            }
        }
        for old in &rec.backends {
            let key = old.key();
            if staged_keys.contains(&key) {
                continue;
            }
            changes.dropped.push(old.clone());
            if let Some(gone) = self.backends.release(&key) {
                changes.orphaned.push(gone);
            }
        }

        rec.backend_by_key = staged.iter().map(|b| (b.key(), b.clone())).collect();
        rec.backends = staged;
        changes
    }

    fn sync_proxy_and_maps(
        &mut self,
        id: ServiceId,
        locality: Locality,
        prev: &PreviousState,
        changes: &BackendChanges,
    ) -> Result<(), ServiceError> {
        let Some(rec) = self.services.get(&id) else {
            return Ok(());
        };

        if let Some(proxy) = &self.proxy
            && self.l7.wants_backend_sync(&rec.name)
        {
            proxy
                .upsert_endpoints(&rec.name, &rec.backends)
                .map_err(|source| ServiceError::ProxySync {
                    service: rec.name.to_string(),
                    source,
                })?;
        }

        let frontend_v6 = rec.frontend.addr.is_ipv6();
        let dropped_ids: Vec<BackendId> = changes.dropped.iter().map(|b| b.id).collect();
        let mut affinity_del: Vec<BackendId> = Vec::new();
        let mut affinity_add: Vec<BackendId> = Vec::new();
        // An L7 redirect clears affinity on the record, so the first branch
        // also removes the matches left from before the redirect.
        if self.opts.enable_session_affinity {
            if prev.session_affinity && !rec.session_affinity {
                affinity_del.extend(&dropped_ids);
                affinity_del.extend(rec.backends.iter().map(|b| b.id));
            } else if rec.session_affinity && !rec.is_l7_lb() {
                affinity_add.extend(rec.backends.iter().map(|b| b.id));
                if prev.session_affinity {
                    affinity_del.extend(&dropped_ids);
                }
            }
        }

        let check_source_range =
            self.opts.enable_source_range_check && !rec.source_ranges.is_empty();
        let ranges_changed = self.opts.enable_source_range_check
            && (check_source_range || !prev.source_ranges.is_empty())
            && prev.source_ranges != rec.source_ranges;

        let active = rec.active_backend_ids();
        let params = UpsertServiceParams {
            id,
            frontend: rec.frontend.addr,
            active_backends: &active,
            prev_active_backend_count: prev.active_backends,
            ipv6: frontend_v6,
            nat_policy: rec.nat_policy,
            svc_type: rec.svc_type,
            local: locality.only_local,
            scope: rec.frontend.addr.scope,
            session_affinity: rec.session_affinity,
            session_affinity_timeout_sec: rec.session_affinity_timeout_sec,
            check_source_range,
            use_maglev: rec.use_maglev(&self.opts),
            l7_lb_proxy_port: rec.l7_lb_proxy_port,
        };
        let nat64_shadow: Vec<Backend> = if rec.nat_policy == NatPolicy::Nat64 {
            rec.backends.clone()
        } else {
            Vec::new()
        };
        let ranges = rec.source_ranges.clone();

        for bid in affinity_del {
            if let Err(e) = self.map_port.delete_affinity_match(id, bid) {
                tracing::warn!(service_id = %id, backend_id = %bid, "unable to delete affinity match: {e}");
            }
        }

        if ranges_changed {
            self.map_port
                .update_source_ranges(id, &prev.source_ranges, &ranges, frontend_v6)
                .map_err(ServiceError::map_store("update_source_ranges"))?;
        }

        for b in &changes.added {
            tracing::debug!(backend_id = %b.id, backend = %b.key(), "adding new backend");
            self.map_port
                .add_backend(b, b.is_ipv6())
                .map_err(ServiceError::map_store("add_backend"))?;
        }
        for b in &nat64_shadow {
            self.map_port
                .add_backend(b, true)
                .map_err(ServiceError::map_store("add_backend"))?;
        }

        self.map_port
            .upsert_service(&params)
            .map_err(ServiceError::map_store("upsert_service"))?;
        if let Some(rec) = self.services.get_mut(&id) {
            rec.active_backends = active.len();
        }

        for bid in affinity_add {
            if let Err(e) = self.map_port.add_affinity_match(id, bid) {
                tracing::warn!(service_id = %id, backend_id = %bid, "unable to add affinity match: {e}");
            }
        }
        Ok(())
    }

    fn sync_health(&self, id: ServiceId, locality: Locality) {
        if !self.opts.enable_health_check_node_port {
            return;
        }
        let (Some(health), Some(rec)) = (&self.health, self.services.get(&id)) else {
            return;
        };
        if locality.only_local && locality.filter {
            health.upsert_service(
                id,
                &rec.name,
                rec.local_backend_count(),
                rec.health_check_node_port,
            );
        } else if rec.health_check_node_port == 0 {
            health.delete_service(id);
        }
    }

    // ── Delete ─────────────────────────────────────────────────────

    /// Delete a service by frontend identifier. Returns whether it existed.
    pub fn delete_by_id(&mut self, id: ServiceId) -> Result<bool, ServiceError> {
        if !self.services.contains_key(&id) {
            return Ok(false);
        }
        self.delete_locked(id)?;
        Ok(true)
    }

    /// Delete a service by frontend address. Returns whether it existed.
    pub fn delete_by_address(&mut self, frontend: &L3n4Addr) -> Result<bool, ServiceError> {
        match self.by_frontend.get(frontend).copied() {
            Some(id) => self.delete_by_id(id),
            None => Ok(false),
        }
    }

    pub(crate) fn delete_locked(&mut self, id: ServiceId) -> Result<(), ServiceError> {
        let Some(rec) = self.services.get(&id) else {
            return Ok(());
        };
        let use_maglev = rec.use_maglev(&self.opts);
        self.map_port
            .delete_service(&rec.frontend, rec.backends.len(), use_maglev, rec.nat_policy)
            .map_err(ServiceError::map_store("delete_service"))?;

        let Some(rec) = self.services.remove(&id) else {
            return Ok(());
        };
        self.by_frontend.remove(&rec.frontend.addr);
        tracing::debug!(service_id = %id, frontend = %rec.frontend.addr, "deleting service");

        if self.opts.enable_session_affinity && rec.session_affinity {
            for b in &rec.backends {
                if let Err(e) = self.map_port.delete_affinity_match(id, b.id) {
                    tracing::warn!(service_id = %id, backend_id = %b.id, "unable to delete affinity match: {e}");
                }
            }
        }

        if self.opts.enable_source_range_check
            && rec.svc_type == SvcType::LoadBalancer
            && !rec.source_ranges.is_empty()
        {
            let ipv6 = rec.frontend.addr.is_ipv6() || rec.nat_policy == NatPolicy::Nat46;
            if let Err(e) = self
                .map_port
                .update_source_ranges(id, &rec.source_ranges, &[], ipv6)
            {
                tracing::warn!(service_id = %id, "unable to remove source ranges: {e}");
            }
        }

        let orphaned: Vec<Backend> = rec
            .backends
            .iter()
            .filter_map(|b| self.backends.release(&b.key()))
            .collect();
        self.release_orphans(orphaned);

        if self.opts.enable_health_check_node_port
            && let Some(health) = &self.health
        {
            health.delete_service(id);
        }

        let released = self.id_allocator.delete_frontend_id(id);

        self.metrics.record_service_op("delete");
        self.notify(&MonitorEvent::ServiceDelete { id });
        self.finish_mutation();

        released.map_err(|source| ServiceError::FrontendIdRelease { id: id.0, source })
    }

    // ── Leaked identifiers ─────────────────────────────────────────

    /// Delete map entries and release IDs of backends no service uses.
    pub(crate) fn release_orphans(&mut self, orphaned: Vec<Backend>) {
        for b in orphaned {
            tracing::debug!(backend_id = %b.id, backend = %b.key(), "removing obsolete backend");
            self.map_port.delete_backend_by_id(b.id);
            self.id_allocator.delete_backend_id(b.id);
        }
    }

    fn park_leaked(&mut self, orphaned: Vec<Backend>) {
        if orphaned.is_empty() {
            return;
        }
        tracing::warn!(count = orphaned.len(), "parking backend ids after failed upsert");
        self.leaked.extend(orphaned);
        self.metrics.set_leaked_ids(self.leaked.len() as u64);
    }

    /// Release parked backends that have not been referenced again since.
    pub(crate) fn drain_leaked(&mut self) {
        if self.leaked.is_empty() {
            return;
        }
        let leaked = std::mem::take(&mut self.leaked);
        for b in leaked {
            if self.backends.id_of(&b.key()) == Some(b.id) {
                continue;
            }
            self.map_port.delete_backend_by_id(b.id);
            self.id_allocator.delete_backend_id(b.id);
        }
        self.metrics.set_leaked_ids(0);
    }

    pub(crate) fn finish_mutation(&mut self) {
        self.drain_leaked();
        self.last_updated = Some(SystemTime::now());
        self.metrics.set_services_active(self.services.len() as u64);
    }

    fn notify(&self, event: &MonitorEvent) {
        if let Some(monitor) = &self.monitor
            && let Err(e) = monitor.send_notification(event)
        {
            tracing::warn!(event = event.kind(), "unable to send monitor notification: {e}");
        }
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn get_by_id(&self, id: ServiceId) -> Option<LbSvc> {
        self.services.get(&id).map(ServiceRecord::to_svc)
    }

    pub fn get_by_address(&self, frontend: &L3n4Addr) -> Option<LbSvc> {
        self.by_frontend
            .get(frontend)
            .and_then(|id| self.get_by_id(*id))
    }

    /// All services ordered by frontend identifier.
    pub fn get_all(&self) -> Vec<LbSvc> {
        let mut out: Vec<LbSvc> = self.services.values().map(ServiceRecord::to_svc).collect();
        out.sort_by_key(|s| s.frontend.id);
        out
    }

    pub fn get_all_by_name(&self, name: &ServiceName) -> Vec<LbSvc> {
        let mut out: Vec<LbSvc> = self
            .services
            .values()
            .filter(|r| &r.name == name)
            .map(ServiceRecord::to_svc)
            .collect();
        out.sort_by_key(|s| s.frontend.id);
        out
    }

    pub fn get_service_name_by_address(&self, frontend: &L3n4Addr) -> Option<ServiceName> {
        self.by_frontend
            .get(frontend)
            .and_then(|id| self.services.get(id))
            .map(|r| r.name.clone())
    }

    pub fn provenance(&self, id: ServiceId) -> Option<Provenance> {
        self.services.get(&id).map(|r| r.provenance)
    }

    pub fn backend_ref_count(&self, key: &BackendKey) -> usize {
        self.backends.refcount(key)
    }

    pub fn backend_id(&self, key: &BackendKey) -> Option<BackendId> {
        self.backends.id_of(key)
    }

    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn leaked_count(&self) -> usize {
        self.leaked.len()
    }

    pub fn phase(&self) -> RegistryPhase {
        self.phase
    }

    /// Time of the last successful mutation.
    pub fn last_updated(&self) -> Option<SystemTime> {
        self.last_updated
    }

    /// Check that each service is indexed once under its frontend and that
    /// every tracked backend's count matches the services referencing it.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.services.len() != self.by_frontend.len() {
            return Err(format!(
                "index size mismatch: {} by id, {} by frontend",
                self.services.len(),
                self.by_frontend.len()
            ));
        }
        for (id, rec) in &self.services {
            if rec.frontend.id != *id || self.by_frontend.get(&rec.frontend.addr) != Some(id) {
                return Err(format!("service {id} indexed inconsistently"));
            }
        }
        let mut expected: HashMap<BackendKey, usize> = HashMap::new();
        for rec in self.services.values() {
            for key in rec.backend_by_key.keys() {
                *expected.entry(*key).or_default() += 1;
            }
        }
        for (backend, refs) in self.backends.iter() {
            let want = expected.get(&backend.key()).copied().unwrap_or(0);
            if refs != want {
                return Err(format!(
                    "backend {} has {refs} references, {want} services use it",
                    backend.key()
                ));
            }
            if refs == 0 && self.phase == RegistryPhase::Synced {
                return Err(format!("unreferenced backend {} after sync", backend.key()));
            }
        }
        for key in expected.keys() {
            if self.backends.get(key).is_none() {
                return Err(format!("backend {key} used but not tracked"));
            }
        }
        Ok(())
    }
}

/// Type precedence between an existing record and an incoming upsert.
fn check_type_precedence(
    existing: &ServiceRecord,
    desired: SvcType,
    frontend: &L3n4Addr,
) -> Result<(), ServiceError> {
    match (desired, existing.svc_type) {
        (SvcType::LocalRedirect, SvcType::ClusterIp | SvcType::LocalRedirect) => Ok(()),
        (SvcType::LocalRedirect, other) => Err(ServiceError::LocalRedirectOverlap {
            frontend: frontend.to_string(),
            existing: other.to_string(),
        }),
        (SvcType::ClusterIp, SvcType::LocalRedirect) => Err(ServiceError::LocalRedirectExists {
            frontend: frontend.to_string(),
        }),
        _ => Ok(()),
    }
}

/// Resolve an ID for every backend without touching the cache.
///
/// IDs come from the service's own view, then the global table, then the
/// allocator. On failure, IDs acquired here are released again.
fn stage_backends(
    tracker: &BackendTracker,
    allocator: &mut (dyn IdAllocatorPort + Send),
    current: Option<&HashMap<BackendKey, Backend>>,
    candidates: Vec<Backend>,
) -> Result<Vec<Backend>, ServiceError> {
    let mut fresh: Vec<BackendId> = Vec::new();
    let mut staged = Vec::with_capacity(candidates.len());
    for mut b in candidates {
        let key = b.key();
        let known = current
            .and_then(|m| m.get(&key))
            .map(|cur| cur.id)
            .or_else(|| tracker.id_of(&key));
        b.id = match known {
            Some(id) => id,
            None => match allocator.acquire_backend_id(&key) {
                Ok(id) => {
                    fresh.push(id);
                    if tracker.contains_id(id) {
                        for id in fresh {
                            allocator.delete_backend_id(id);
                        }
                        return Err(ServiceError::BackendIdAllocation {
                            backend: key.to_string(),
                            source: DomainError::DuplicateRule(format!(
                                "backend id {id} already held by another backend"
                            )),
                        });
                    }
                    id
                }
                Err(source) => {
                    for id in fresh {
                        allocator.delete_backend_id(id);
                    }
                    return Err(ServiceError::BackendIdAllocation {
                        backend: key.to_string(),
                        source,
                    });
                }
            },
        };
        staged.push(b);
    }
    Ok(staged)
}
