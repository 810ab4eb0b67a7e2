use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::common::entity::IpFamily;

use super::error::ServiceError;

/// Address scope of a frontend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Reachable from outside the node.
    #[default]
    External,
    /// Only reachable from within the node.
    Internal,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::External => "external",
            Self::Internal => "internal",
        }
    }
}

/// An L3 address, L4 port and scope tuple identifying a frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct L3n4Addr {
    pub ip: IpAddr,
    pub port: u16,
    #[serde(default)]
    pub scope: Scope,
}

impl L3n4Addr {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            ip,
            port,
            scope: Scope::External,
        }
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn is_ipv6(&self) -> bool {
        self.ip.is_ipv6()
    }

    pub fn family(&self) -> IpFamily {
        IpFamily::of(&self.ip)
    }

    /// `0.0.0.0` or `::`, used by NodePort services bound to every node address.
    pub fn is_wildcard(&self) -> bool {
        self.ip.is_unspecified()
    }
}

impl std::fmt::Display for L3n4Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", SocketAddr::new(self.ip, self.port))?;
        if self.scope == Scope::Internal {
            f.write_str("/i")?;
        }
        Ok(())
    }
}

/// Frontend identifier, the primary key of the service map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId(pub u16);

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Backend identifier, shared by every service referencing the same backend address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackendId(pub u32);

impl std::fmt::Display for BackendId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A frontend address together with its allocated identifier.
///
/// On input to an upsert a non-zero `id` is used as an allocation hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct L3n4AddrId {
    #[serde(flatten)]
    pub addr: L3n4Addr,
    #[serde(default)]
    pub id: ServiceId,
}

impl L3n4AddrId {
    pub fn new(addr: L3n4Addr, id: ServiceId) -> Self {
        Self { addr, id }
    }
}

/// Identity key of a backend: its IP and port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackendKey {
    pub ip: IpAddr,
    pub port: u16,
}

impl BackendKey {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl std::fmt::Display for BackendKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", SocketAddr::new(self.ip, self.port))
    }
}

/// One concrete endpoint serving a frontend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    #[serde(default)]
    pub id: BackendId,
    pub ip: IpAddr,
    pub port: u16,
    /// Node hosting the endpoint, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    /// Terminating backends keep existing flows but receive no new ones.
    #[serde(default)]
    pub terminating: bool,
}

impl Backend {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            id: BackendId::default(),
            ip,
            port,
            node_name: None,
            terminating: false,
        }
    }

    pub fn with_id(mut self, id: BackendId) -> Self {
        self.id = id;
        self
    }

    pub fn on_node(mut self, node: impl Into<String>) -> Self {
        self.node_name = Some(node.into());
        self
    }

    pub fn terminating(mut self) -> Self {
        self.terminating = true;
        self
    }

    pub fn key(&self) -> BackendKey {
        BackendKey::new(self.ip, self.port)
    }

    pub fn is_ipv6(&self) -> bool {
        self.ip.is_ipv6()
    }
}

/// Kubernetes-style service type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SvcType {
    #[default]
    ClusterIp,
    NodePort,
    ExternalIps,
    HostPort,
    LoadBalancer,
    LocalRedirect,
}

impl SvcType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClusterIp => "ClusterIP",
            Self::NodePort => "NodePort",
            Self::ExternalIps => "ExternalIPs",
            Self::HostPort => "HostPort",
            Self::LoadBalancer => "LoadBalancer",
            Self::LocalRedirect => "LocalRedirect",
        }
    }
}

impl std::fmt::Display for SvcType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External traffic policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficPolicy {
    #[default]
    Cluster,
    Local,
}

/// Address family translation between frontend and backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NatPolicy {
    #[default]
    None,
    /// IPv4 frontend, IPv6 backends.
    Nat46,
    /// IPv6 frontend, IPv4 backends.
    Nat64,
}

impl NatPolicy {
    /// Derive the policy from the frontend family and the (homogeneous) backend family.
    pub fn derive(frontend_v6: bool, backends_v6: Option<bool>) -> Self {
        match backends_v6 {
            Some(true) if !frontend_v6 => Self::Nat46,
            Some(false) if frontend_v6 => Self::Nat64,
            _ => Self::None,
        }
    }

    pub fn is_some(self) -> bool {
        self != Self::None
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Nat46 => "nat46",
            Self::Nat64 => "nat64",
        }
    }
}

impl std::fmt::Display for NatPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Namespaced name of a service or of an external resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceName {
    pub namespace: String,
    pub name: String,
}

/// Name of a resource claiming an L7 redirect.
pub type ResourceName = ServiceName;

impl ServiceName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }
}

impl std::fmt::Display for ServiceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// CIDR prefix used in load balancer source-range filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cidr {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl Cidr {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self, ServiceError> {
        let cidr = Self { addr, prefix_len };
        cidr.validate()?;
        Ok(cidr)
    }

    pub fn validate(&self) -> Result<(), ServiceError> {
        let max = if self.addr.is_ipv6() { 128 } else { 32 };
        if self.prefix_len > max {
            return Err(ServiceError::InvalidSourceRange {
                cidr: format!("{}/{}", self.addr, self.prefix_len),
            });
        }
        Ok(())
    }

    pub fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }
}

impl FromStr for Cidr {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ServiceError::InvalidSourceRange {
            cidr: s.to_string(),
        };
        let (addr, prefix) = s.split_once('/').ok_or_else(invalid)?;
        let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
        let prefix_len: u8 = prefix.parse().map_err(|_| invalid())?;
        Self::new(addr, prefix_len).map_err(|_| invalid())
    }
}

impl std::fmt::Display for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

/// Where the current contents of a service record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Rebuilt from the datapath and not yet seen in the configuration source.
    RestoredUnconfirmed,
    /// Rebuilt from the datapath and since confirmed by an upsert.
    Confirmed,
    /// Created by an upsert in this process.
    LocallyCreated,
}

/// A load-balanced service as exchanged with callers and the map store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbSvc {
    pub frontend: L3n4AddrId,
    #[serde(default)]
    pub backends: Vec<Backend>,
    #[serde(default)]
    pub svc_type: SvcType,
    #[serde(default)]
    pub traffic_policy: TrafficPolicy,
    #[serde(default)]
    pub nat_policy: NatPolicy,
    #[serde(default)]
    pub session_affinity: bool,
    #[serde(default)]
    pub session_affinity_timeout_sec: u32,
    #[serde(default)]
    pub health_check_node_port: u16,
    #[serde(default)]
    pub name: ServiceName,
    #[serde(default)]
    pub load_balancer_source_ranges: Vec<Cidr>,
    /// Non-zero when traffic is redirected to a local L7 proxy.
    #[serde(default)]
    pub l7_lb_proxy_port: u16,
}

impl LbSvc {
    pub fn new(frontend: L3n4Addr, svc_type: SvcType) -> Self {
        Self {
            frontend: L3n4AddrId::new(frontend, ServiceId::default()),
            backends: Vec::new(),
            svc_type,
            traffic_policy: TrafficPolicy::default(),
            nat_policy: NatPolicy::default(),
            session_affinity: false,
            session_affinity_timeout_sec: 0,
            health_check_node_port: 0,
            name: ServiceName::default(),
            load_balancer_source_ranges: Vec::new(),
            l7_lb_proxy_port: 0,
        }
    }

    pub fn with_backends(mut self, backends: Vec<Backend>) -> Self {
        self.backends = backends;
        self
    }

    pub fn with_name(mut self, name: ServiceName) -> Self {
        self.name = name;
        self
    }
}
