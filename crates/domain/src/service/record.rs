use std::collections::{BTreeMap, HashMap};

use super::entity::{
    Backend, BackendId, BackendKey, Cidr, L3n4AddrId, LbSvc, NatPolicy, Provenance, Scope,
    ServiceName, SvcType, TrafficPolicy,
};
use super::options::{LbAlgorithm, RegistryOptions};

/// Node-locality requirements derived from a service's type and policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Locality {
    /// Datapath `local` flag: traffic policy is Local on an externally visible type.
    pub only_local: bool,
    /// Backends on other nodes are dropped from the service.
    pub filter: bool,
}

impl Locality {
    pub fn derive(svc_type: SvcType, traffic_policy: TrafficPolicy, scope: Scope) -> Self {
        match svc_type {
            SvcType::LocalRedirect => Self {
                only_local: false,
                filter: true,
            },
            SvcType::NodePort | SvcType::LoadBalancer | SvcType::ExternalIps
                if traffic_policy == TrafficPolicy::Local =>
            {
                Self {
                    only_local: true,
                    filter: scope == Scope::External,
                }
            }
            _ => Self::default(),
        }
    }
}

/// In-memory record of one frontend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub frontend: L3n4AddrId,
    /// Current backends in the order they were last upserted.
    pub backends: Vec<Backend>,
    pub backend_by_key: HashMap<BackendKey, Backend>,
    /// Number of non-terminating backends last written to the service map.
    pub active_backends: usize,
    pub svc_type: SvcType,
    pub traffic_policy: TrafficPolicy,
    pub nat_policy: NatPolicy,
    pub session_affinity: bool,
    pub session_affinity_timeout_sec: u32,
    pub health_check_node_port: u16,
    pub name: ServiceName,
    pub source_ranges: Vec<Cidr>,
    pub l7_lb_proxy_port: u16,
    pub provenance: Provenance,
}

impl ServiceRecord {
    /// A record for a frontend seen for the first time through an upsert.
    pub fn created(frontend: L3n4AddrId) -> Self {
        Self {
            frontend,
            backends: Vec::new(),
            backend_by_key: HashMap::new(),
            active_backends: 0,
            svc_type: SvcType::default(),
            traffic_policy: TrafficPolicy::default(),
            nat_policy: NatPolicy::default(),
            session_affinity: false,
            session_affinity_timeout_sec: 0,
            health_check_node_port: 0,
            name: ServiceName::default(),
            source_ranges: Vec::new(),
            l7_lb_proxy_port: 0,
            provenance: Provenance::LocallyCreated,
        }
    }

    /// A record rebuilt from a service map entry.
    pub fn restored(svc: LbSvc) -> Self {
        let mut backend_by_key = HashMap::with_capacity(svc.backends.len());
        let mut backends = Vec::with_capacity(svc.backends.len());
        for b in svc.backends {
            if backend_by_key.contains_key(&b.key()) {
                continue;
            }
            backend_by_key.insert(b.key(), b.clone());
            backends.push(b);
        }
        let active_backends = backends.iter().filter(|b| !b.terminating).count();
        Self {
            frontend: svc.frontend,
            backends,
            backend_by_key,
            active_backends,
            svc_type: svc.svc_type,
            traffic_policy: svc.traffic_policy,
            nat_policy: svc.nat_policy,
            session_affinity: svc.session_affinity,
            session_affinity_timeout_sec: svc.session_affinity_timeout_sec,
            health_check_node_port: svc.health_check_node_port,
            name: svc.name,
            source_ranges: svc.load_balancer_source_ranges,
            l7_lb_proxy_port: svc.l7_lb_proxy_port,
            provenance: Provenance::RestoredUnconfirmed,
        }
    }

    pub fn restored_from_datapath(&self) -> bool {
        self.provenance == Provenance::RestoredUnconfirmed
    }

    /// Mark the record as seen in the configuration source.
    pub fn confirm(&mut self) {
        if self.provenance == Provenance::RestoredUnconfirmed {
            self.provenance = Provenance::Confirmed;
        }
    }

    pub fn is_l7_lb(&self) -> bool {
        self.l7_lb_proxy_port != 0
    }

    pub fn locality(&self) -> Locality {
        Locality::derive(self.svc_type, self.traffic_policy, self.frontend.addr.scope)
    }

    pub fn use_maglev(&self, opts: &RegistryOptions) -> bool {
        if opts.algorithm != LbAlgorithm::Maglev {
            return false;
        }
        match self.svc_type {
            SvcType::NodePort => !self.frontend.addr.is_wildcard(),
            SvcType::ExternalIps | SvcType::LoadBalancer => true,
            SvcType::ClusterIp => opts.external_cluster_ip,
            _ => false,
        }
    }

    /// Whether the backends live in the other address family.
    pub fn backends_ipv6(&self) -> bool {
        match self.nat_policy {
            NatPolicy::Nat46 => true,
            NatPolicy::Nat64 => false,
            NatPolicy::None => self.frontend.addr.is_ipv6(),
        }
    }

    /// Non-terminating backends keyed by address, as written to the service map.
    pub fn active_backend_ids(&self) -> BTreeMap<BackendKey, BackendId> {
        self.backends
            .iter()
            .filter(|b| !b.terminating)
            .map(|b| (b.key(), b.id))
            .collect()
    }

    /// Backends that passed the node-local filter, terminating ones included.
    pub fn local_backend_count(&self) -> usize {
        self.backends.len()
    }

    /// Owned snapshot for callers.
    pub fn to_svc(&self) -> LbSvc {
        LbSvc {
            frontend: self.frontend,
            backends: self.backends.clone(),
            svc_type: self.svc_type,
            traffic_policy: self.traffic_policy,
            nat_policy: self.nat_policy,
            session_affinity: self.session_affinity,
            session_affinity_timeout_sec: self.session_affinity_timeout_sec,
            health_check_node_port: self.health_check_node_port,
            name: self.name.clone(),
            load_balancer_source_ranges: self.source_ranges.clone(),
            l7_lb_proxy_port: self.l7_lb_proxy_port,
        }
    }
}
