use serde::{Deserialize, Serialize};

use crate::common::error::DomainError;

/// Supported Maglev lookup table sizes. Each entry is prime.
pub const MAGLEV_TABLE_SIZES: [u32; 10] = [
    251, 509, 1021, 2039, 4093, 8191, 16381, 32749, 65521, 131_071,
];

pub const DEFAULT_MAGLEV_TABLE_SIZE: u32 = 16381;

/// Backend selection algorithm programmed into the datapath.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LbAlgorithm {
    #[default]
    Random,
    Maglev,
}

impl LbAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::Maglev => "maglev",
        }
    }
}

impl std::fmt::Display for LbAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Feature switches consulted by the service registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryOptions {
    pub enable_ipv4: bool,
    pub enable_ipv6: bool,
    pub enable_nat46x64: bool,
    pub enable_session_affinity: bool,
    pub enable_source_range_check: bool,
    pub enable_health_check_node_port: bool,
    pub algorithm: LbAlgorithm,
    pub maglev_table_size: u32,
    /// ClusterIP services are reachable from outside the cluster.
    pub external_cluster_ip: bool,
    /// Name of the node this registry runs on.
    pub node_name: String,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            enable_ipv4: true,
            enable_ipv6: false,
            enable_nat46x64: false,
            enable_session_affinity: false,
            enable_source_range_check: false,
            enable_health_check_node_port: true,
            algorithm: LbAlgorithm::Random,
            maglev_table_size: DEFAULT_MAGLEV_TABLE_SIZE,
            external_cluster_ip: false,
            node_name: String::new(),
        }
    }
}

impl RegistryOptions {
    pub fn validate(&self) -> Result<(), DomainError> {
        if !self.enable_ipv4 && !self.enable_ipv6 {
            return Err(DomainError::InvalidConfig(
                "at least one of IPv4 or IPv6 must be enabled".to_string(),
            ));
        }
        if !MAGLEV_TABLE_SIZES.contains(&self.maglev_table_size) {
            return Err(DomainError::InvalidConfig(format!(
                "maglev table size {} is not one of {MAGLEV_TABLE_SIZES:?}",
                self.maglev_table_size
            )));
        }
        Ok(())
    }

    pub fn family_enabled(&self, ipv6: bool) -> bool {
        if ipv6 {
            self.enable_ipv6
        } else {
            self.enable_ipv4
        }
    }
}

/// Which maps `init_maps` opens and whether existing contents are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitMapsFlags {
    pub ipv4: bool,
    pub ipv6: bool,
    /// Also create the socket-level reverse NAT maps.
    pub sock_maps: bool,
    /// Keep existing entries so they can be restored. When false, maps are cleared.
    pub restore: bool,
}

impl Default for InitMapsFlags {
    fn default() -> Self {
        Self {
            ipv4: true,
            ipv6: false,
            sock_maps: false,
            restore: true,
        }
    }
}
