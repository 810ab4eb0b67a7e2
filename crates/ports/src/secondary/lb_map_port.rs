use std::collections::{BTreeMap, BTreeSet, HashMap};

use domain::common::error::DomainError;
use domain::service::entity::{
    Backend, BackendId, BackendKey, Cidr, L3n4Addr, L3n4AddrId, LbSvc, NatPolicy, Scope,
    ServiceId, SvcType,
};
use domain::service::options::InitMapsFlags;

/// Everything the datapath service entry is built from.
#[derive(Debug, Clone)]
pub struct UpsertServiceParams<'a> {
    pub id: ServiceId,
    pub frontend: L3n4Addr,
    /// Non-terminating backends, in slot order.
    pub active_backends: &'a BTreeMap<BackendKey, BackendId>,
    /// Active backend count of the previous write, so stale slots can be removed.
    pub prev_active_backend_count: usize,
    pub ipv6: bool,
    pub nat_policy: NatPolicy,
    pub svc_type: SvcType,
    pub local: bool,
    pub scope: Scope,
    pub session_affinity: bool,
    pub session_affinity_timeout_sec: u32,
    pub check_source_range: bool,
    pub use_maglev: bool,
    pub l7_lb_proxy_port: u16,
}

/// Result of a service map dump. Entries that could not be decoded are
/// reported in `errors` without aborting the dump.
#[derive(Debug, Default)]
pub struct ServiceDump {
    pub services: Vec<LbSvc>,
    pub errors: Vec<DomainError>,
}

/// Secondary port for the datapath load balancer maps.
///
/// Covers the service, backend, reverse NAT, session affinity, source range
/// and Maglev maps. Entries survive process restarts and are read back with
/// the `dump_*` methods.
pub trait LbMapPort: Send + Sync {
    /// Open or create the maps selected by `flags`. Existing entries are
    /// cleared unless `flags.restore` is set.
    fn init_maps(&mut self, flags: &InitMapsFlags) -> Result<(), DomainError>;

    /// Whether a backend map from a previous map version is still pinned.
    fn legacy_backend_map_exists(&self) -> bool;

    /// Copy legacy backend entries into the current backend map and unpin
    /// the legacy map. Returns the number of entries copied.
    fn migrate_legacy_backends(&mut self) -> Result<usize, DomainError>;

    /// Write the service entry, its backend slots, reverse NAT entry and, when
    /// `use_maglev` is set, its Maglev lookup table.
    fn upsert_service(&mut self, params: &UpsertServiceParams<'_>) -> Result<(), DomainError>;

    /// Regenerate the Maglev lookup table of a service.
    fn upsert_maglev_table(
        &mut self,
        id: ServiceId,
        backends: &BTreeMap<BackendKey, BackendId>,
        ipv6: bool,
    ) -> Result<(), DomainError>;

    /// Whether the Maglev outer map was recreated because the table size changed.
    fn is_maglev_table_recreated(&self, ipv6: bool) -> bool;

    fn delete_service(
        &mut self,
        frontend: &L3n4AddrId,
        backend_count: usize,
        use_maglev: bool,
        nat_policy: NatPolicy,
    ) -> Result<(), DomainError>;

    /// Insert a backend. With `ipv6` set and an IPv4 address, the backend is
    /// written to the IPv6 map as an IPv4-mapped address.
    fn add_backend(&mut self, backend: &Backend, ipv6: bool) -> Result<(), DomainError>;

    /// Remove a backend and any IPv4-mapped IPv6 copy of it.
    fn delete_backend_by_id(&mut self, id: BackendId);

    fn add_affinity_match(&mut self, svc: ServiceId, backend: BackendId) -> Result<(), DomainError>;

    fn delete_affinity_match(
        &mut self,
        svc: ServiceId,
        backend: BackendId,
    ) -> Result<(), DomainError>;

    /// Replace the source range entries of a service.
    fn update_source_ranges(
        &mut self,
        svc: ServiceId,
        prev: &[Cidr],
        ranges: &[Cidr],
        ipv6: bool,
    ) -> Result<(), DomainError>;

    fn dump_service_maps(&self) -> ServiceDump;

    fn dump_backend_maps(&self) -> Result<Vec<Backend>, DomainError>;

    fn dump_affinity_matches(&self) -> Result<BTreeMap<ServiceId, BTreeSet<BackendId>>, DomainError>;

    fn dump_source_ranges(&self, ipv6: bool) -> Result<HashMap<ServiceId, Vec<Cidr>>, DomainError>;
}
