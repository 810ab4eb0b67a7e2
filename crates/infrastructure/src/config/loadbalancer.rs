//! Load balancer section: feature switches for the service registry.

use domain::service::options::{
    DEFAULT_MAGLEV_TABLE_SIZE, InitMapsFlags, LbAlgorithm, MAGLEV_TABLE_SIZES, RegistryOptions,
};
use serde::{Deserialize, Serialize};

use super::common::{ConfigError, default_true, parse_choice};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadBalancerConfig {
    #[serde(default = "default_true")]
    pub enable_ipv4: bool,

    #[serde(default)]
    pub enable_ipv6: bool,

    /// Allow IPv4 frontends with IPv6 backends and the reverse.
    #[serde(default)]
    pub nat46x64: bool,

    #[serde(default)]
    pub session_affinity: bool,

    /// Enforce `loadBalancerSourceRanges` in the datapath.
    #[serde(default)]
    pub source_range_check: bool,

    #[serde(default = "default_true")]
    pub health_check_node_port: bool,

    /// Algorithm: `random` or `maglev`.
    #[serde(default = "default_algorithm")]
    pub algorithm: String,

    #[serde(default = "default_maglev_table_size")]
    pub maglev_table_size: u32,

    #[serde(default)]
    pub external_cluster_ip: bool,

    /// Create the socket-level reverse NAT maps.
    #[serde(default)]
    pub sock_maps: bool,

    /// Keep existing map entries at startup and restore from them.
    #[serde(default = "default_true")]
    pub restore: bool,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            enable_ipv4: true,
            enable_ipv6: false,
            nat46x64: false,
            session_affinity: false,
            source_range_check: false,
            health_check_node_port: true,
            algorithm: default_algorithm(),
            maglev_table_size: default_maglev_table_size(),
            external_cluster_ip: false,
            sock_maps: false,
            restore: true,
        }
    }
}

fn default_algorithm() -> String {
    "random".to_string()
}

fn default_maglev_table_size() -> u32 {
    DEFAULT_MAGLEV_TABLE_SIZE
}

impl LoadBalancerConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if !self.enable_ipv4 && !self.enable_ipv6 {
            return Err(ConfigError::Validation {
                field: "loadbalancer.enable_ipv4".to_string(),
                message: "at least one of IPv4 or IPv6 must be enabled".to_string(),
            });
        }
        if self.nat46x64 && !(self.enable_ipv4 && self.enable_ipv6) {
            return Err(ConfigError::Validation {
                field: "loadbalancer.nat46x64".to_string(),
                message: "NAT46/64 requires both IPv4 and IPv6".to_string(),
            });
        }
        self.algorithm()?;
        if !MAGLEV_TABLE_SIZES.contains(&self.maglev_table_size) {
            return Err(ConfigError::InvalidValue {
                field: "loadbalancer.maglev_table_size".to_string(),
                value: self.maglev_table_size.to_string(),
                expected: MAGLEV_TABLE_SIZES
                    .iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join("|"),
            });
        }
        Ok(())
    }

    pub fn algorithm(&self) -> Result<LbAlgorithm, ConfigError> {
        parse_choice(
            "loadbalancer.algorithm",
            &self.algorithm,
            &[("random", LbAlgorithm::Random), ("maglev", LbAlgorithm::Maglev)],
        )
    }

    /// Registry options for a registry running on `node_name`.
    pub fn to_registry_options(&self, node_name: &str) -> Result<RegistryOptions, ConfigError> {
        Ok(RegistryOptions {
            enable_ipv4: self.enable_ipv4,
            enable_ipv6: self.enable_ipv6,
            enable_nat46x64: self.nat46x64,
            enable_session_affinity: self.session_affinity,
            enable_source_range_check: self.source_range_check,
            enable_health_check_node_port: self.health_check_node_port,
            algorithm: self.algorithm()?,
            maglev_table_size: self.maglev_table_size,
            external_cluster_ip: self.external_cluster_ip,
            node_name: node_name.to_string(),
        })
    }

    pub fn to_init_maps_flags(&self) -> InitMapsFlags {
        InitMapsFlags {
            ipv4: self.enable_ipv4,
            ipv6: self.enable_ipv6,
            sock_maps: self.sock_maps,
            restore: self.restore,
        }
    }
}
