use domain::service::entity::{BackendId, NatPolicy, ServiceId};
use domain::service::error::ServiceError;
use domain::service::options::InitMapsFlags;
use domain::service::record::ServiceRecord;

use crate::service_registry_impl::{RegistryPhase, ServiceRegistry};

/// Counters reported by [`ServiceRegistry::restore_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub backends_restored: usize,
    pub backends_failed: usize,
    pub services_restored: usize,
    pub services_failed: usize,
    pub maglev_failed: usize,
}

/// Startup restore and the mark-and-sweep pass that follows it.
impl ServiceRegistry {
    /// Open the datapath maps and migrate legacy backend entries.
    pub fn init_maps(&mut self, flags: &InitMapsFlags) -> Result<(), ServiceError> {
        self.map_port
            .init_maps(flags)
            .map_err(ServiceError::map_store("init_maps"))?;

        if self.map_port.legacy_backend_map_exists() {
            match self.map_port.migrate_legacy_backends() {
                Ok(count) => tracing::info!(count, "migrated legacy backend entries"),
                Err(e) => tracing::warn!("unable to migrate legacy backend map: {e}"),
            }
        }
        Ok(())
    }

    /// Rebuild the cache from the datapath maps.
    ///
    /// Per-entry failures are logged and counted. Restored services stay
    /// unconfirmed until an upsert for the same frontend arrives; the ones
    /// left unconfirmed are removed by [`sync_finished`](Self::sync_finished).
    pub fn restore_all(&mut self) -> RestoreSummary {
        let mut summary = RestoreSummary::default();
        if self.phase != RegistryPhase::Fresh {
            tracing::warn!(phase = ?self.phase, "restore already ran, skipping");
            return summary;
        }

        self.restore_backends(&mut summary);
        self.restore_services(&mut summary);
        self.restore_source_ranges();

        self.phase = RegistryPhase::Restored;
        self.metrics.set_services_active(self.services.len() as u64);
        self.metrics
            .record_restored_entries("backend", "restored", summary.backends_restored as u64);
        self.metrics
            .record_restored_entries("backend", "failed", summary.backends_failed as u64);
        self.metrics
            .record_restored_entries("service", "restored", summary.services_restored as u64);
        self.metrics
            .record_restored_entries("service", "failed", summary.services_failed as u64);
        self.metrics
            .record_restored_entries("maglev", "failed", summary.maglev_failed as u64);
        summary
    }

    fn restore_backends(&mut self, summary: &mut RestoreSummary) {
        let backends = match self.map_port.dump_backend_maps() {
            Ok(backends) => backends,
            Err(e) => {
                tracing::warn!("unable to dump backend maps: {e}");
                return;
            }
        };
        for b in backends {
            if let Err(e) = self.id_allocator.restore_backend_id(&b.key(), b.id) {
                summary.backends_failed += 1;
                tracing::warn!(backend_id = %b.id, backend = %b.key(), "unable to restore backend id: {e}");
            }
            if self.backends.restore(b) {
                summary.backends_restored += 1;
            }
        }
        tracing::info!(
            restored = summary.backends_restored,
            failed = summary.backends_failed,
            "restored backends from maps"
        );
    }

    fn restore_services(&mut self, summary: &mut RestoreSummary) {
        let dump = self.map_port.dump_service_maps();
        for e in &dump.errors {
            tracing::warn!("error while dumping service maps: {e}");
        }

        for svc in dump.services {
            let id = svc.frontend.id;
            let frontend = svc.frontend.addr;
            if self.services.contains_key(&id) || self.by_frontend.contains_key(&frontend) {
                summary.services_failed += 1;
                tracing::warn!(service_id = %id, frontend = %frontend, "duplicate service entry, skipping");
                continue;
            }
            tracing::debug!(service_id = %id, frontend = %frontend, "restoring service");

            let rec = ServiceRecord::restored(svc);
            if let Err(e) = self.id_allocator.restore_frontend_id(&frontend, id) {
                summary.services_failed += 1;
                tracing::warn!(service_id = %id, frontend = %frontend, "unable to restore service id, dropping entry: {e}");
                // The allocator may hand this ID to another frontend, so the
                // entry cannot stay in the cache or the maps.
                if let Err(e) = self.map_port.delete_service(
                    &rec.frontend,
                    rec.backends.len(),
                    rec.use_maglev(&self.opts),
                    rec.nat_policy,
                ) {
                    tracing::warn!(service_id = %id, frontend = %frontend, "unable to delete unrestorable service entry: {e}");
                }
                continue;
            }

            for b in &rec.backends {
                self.backends.retain(b);
            }
            if rec.use_maglev(&self.opts) && !self.restore_maglev(&rec) {
                summary.maglev_failed += 1;
            }

            self.by_frontend.insert(frontend, id);
            self.services.insert(id, rec);
            summary.services_restored += 1;
        }

        tracing::info!(
            restored = summary.services_restored,
            failed = summary.services_failed,
            "restored services from maps"
        );
    }

    /// Regenerate the Maglev tables of `rec` if the table size changed since
    /// they were written. Returns false on failure.
    fn restore_maglev(&mut self, rec: &ServiceRecord) -> bool {
        let ipv6 = rec.frontend.addr.is_ipv6() || rec.nat_policy == NatPolicy::Nat46;
        let mut tables = vec![ipv6];
        if rec.nat_policy == NatPolicy::Nat46 {
            tables.push(false);
        }
        if !tables
            .iter()
            .any(|v6| self.map_port.is_maglev_table_recreated(*v6))
        {
            return true;
        }

        let backends = rec.active_backend_ids();
        for v6 in tables {
            if let Err(e) = self
                .map_port
                .upsert_maglev_table(rec.frontend.id, &backends, v6)
            {
                tracing::warn!(service_id = %rec.frontend.id, ipv6 = v6, "unable to regenerate maglev table: {e}");
                return false;
            }
        }
        true
    }

    fn restore_source_ranges(&mut self) {
        if !self.opts.enable_source_range_check {
            return;
        }
        for ipv6 in [false, true] {
            if !self.opts.family_enabled(ipv6) {
                continue;
            }
            let ranges = match self.map_port.dump_source_ranges(ipv6) {
                Ok(ranges) => ranges,
                Err(e) => {
                    tracing::warn!(ipv6, "unable to dump source ranges: {e}");
                    continue;
                }
            };
            for (id, cidrs) in ranges {
                if let Some(rec) = self.services.get_mut(&id) {
                    rec.source_ranges = cidrs;
                } else if let Err(e) = self.map_port.update_source_ranges(id, &cidrs, &[], ipv6) {
                    tracing::warn!(service_id = %id, "unable to remove orphan source ranges: {e}");
                }
            }
        }
    }

    /// Remove everything restored from the datapath that the configuration
    /// source did not confirm. Returns the number of services removed.
    ///
    /// Every stale service is attempted; the first failure is returned.
    pub fn sync_finished(&mut self) -> Result<usize, ServiceError> {
        let mut stale: Vec<ServiceId> = self
            .services
            .iter()
            .filter(|(_, r)| r.restored_from_datapath())
            .map(|(id, _)| *id)
            .collect();
        stale.sort_unstable();

        let mut first_err = None;
        let mut removed = 0;
        for id in stale {
            tracing::info!(service_id = %id, "removing service not present in configuration");
            match self.delete_locked(id) {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(service_id = %id, "unable to remove stale service: {e}");
                    if !self.services.contains_key(&id) {
                        removed += 1;
                    }
                    first_err.get_or_insert(e);
                }
            }
        }

        if self.opts.enable_session_affinity {
            self.delete_orphan_affinity_matches();
        }
        self.delete_orphan_backends();
        self.drain_leaked();
        self.phase = RegistryPhase::Synced;
        self.finish_mutation();

        match first_err {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }

    fn delete_orphan_affinity_matches(&mut self) {
        let matches = match self.map_port.dump_affinity_matches() {
            Ok(matches) => matches,
            Err(e) => {
                tracing::warn!("unable to dump affinity matches: {e}");
                return;
            }
        };
        for (svc_id, backend_ids) in matches {
            let live: Vec<BackendId> = self
                .services
                .get(&svc_id)
                .map(|r| r.backends.iter().map(|b| b.id).collect())
                .unwrap_or_default();
            for bid in backend_ids {
                if live.contains(&bid) {
                    continue;
                }
                tracing::debug!(service_id = %svc_id, backend_id = %bid, "removing orphan affinity match");
                if let Err(e) = self.map_port.delete_affinity_match(svc_id, bid) {
                    tracing::warn!(service_id = %svc_id, backend_id = %bid, "unable to delete affinity match: {e}");
                }
            }
        }
    }

    fn delete_orphan_backends(&mut self) {
        let orphans: Vec<_> = self
            .backends
            .orphans()
            .into_iter()
            .filter_map(|b| self.backends.remove_orphan(&b.key()))
            .collect();
        if !orphans.is_empty() {
            tracing::info!(count = orphans.len(), "removing orphan backends");
        }
        self.release_orphans(orphans);
    }
}
