//! Agent configuration: structs, parsing, and validation.
//!
//! - `common`: shared helpers and `ConfigError`
//! - `loadbalancer`: feature switches handed to the service registry

mod common;
mod loadbalancer;

pub use common::ConfigError;
pub use loadbalancer::LoadBalancerConfig;

use std::path::Path;

use domain::service::options::{InitMapsFlags, RegistryOptions};
use serde::{Deserialize, Serialize};

// ── Top-level config ───────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    #[serde(default)]
    pub agent: AgentInfo,

    #[serde(default)]
    pub loadbalancer: LoadBalancerConfig,
}

impl AgentConfig {
    /// Load config from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_yaml(&content)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Parse config from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.node_name.trim().is_empty() {
            return Err(ConfigError::Validation {
                field: "agent.node_name".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        self.loadbalancer.validate()
    }

    pub fn registry_options(&self) -> Result<RegistryOptions, ConfigError> {
        self.loadbalancer.to_registry_options(&self.agent.node_name)
    }

    pub fn init_maps_flags(&self) -> InitMapsFlags {
        self.loadbalancer.to_init_maps_flags()
    }
}

// ── Agent section ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentInfo {
    /// Node this agent runs on. Backends on other nodes are filtered
    /// from node-local services.
    #[serde(default = "default_node_name")]
    pub node_name: String,

    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,
}

impl Default for AgentInfo {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_node_name() -> String {
    crate::constants::DEFAULT_NODE_NAME.to_string()
}
fn default_log_level() -> LogLevel {
    LogLevel::Info
}
fn default_log_format() -> LogFormat {
    LogFormat::Json
}

// ── Log level ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            _ => Err(format!(
                "invalid log level '{s}': expected error|warn|info|debug|trace"
            )),
        }
    }
}

// ── Log format ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Text => "text",
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" | "pretty" => Ok(Self::Text),
            _ => Err(format!("invalid log format '{s}': expected json|text")),
        }
    }
}

#[cfg(test)]
mod tests {
    use domain::service::options::LbAlgorithm;

    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = AgentConfig::from_yaml("{}").unwrap();
        assert_eq!(config.agent.log_level, LogLevel::Info);
        assert_eq!(config.agent.log_format, LogFormat::Json);
        let opts = config.registry_options().unwrap();
        assert_eq!(opts, RegistryOptions {
            node_name: config.agent.node_name.clone(),
            ..RegistryOptions::default()
        });
        assert_eq!(config.init_maps_flags(), InitMapsFlags::default());
    }

    #[test]
    fn full_document_maps_to_registry_options() {
        let yaml = r"
agent:
  node_name: worker-1
  log_level: debug
  log_format: text
loadbalancer:
  enable_ipv6: true
  nat46x64: true
  session_affinity: true
  source_range_check: true
  algorithm: maglev
  maglev_table_size: 251
  external_cluster_ip: true
  sock_maps: true
  restore: false
";
        let config = AgentConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.agent.log_format, LogFormat::Text);
        let opts = config.registry_options().unwrap();
        assert_eq!(opts.node_name, "worker-1");
        assert_eq!(opts.algorithm, LbAlgorithm::Maglev);
        assert_eq!(opts.maglev_table_size, 251);
        assert!(opts.enable_nat46x64);
        assert!(opts.enable_session_affinity);
        assert!(opts.enable_source_range_check);
        assert!(opts.external_cluster_ip);

        let flags = config.init_maps_flags();
        assert!(flags.ipv4 && flags.ipv6 && flags.sock_maps);
        assert!(!flags.restore);
    }

    #[test]
    fn unknown_fields_rejected() {
        let err = AgentConfig::from_yaml("loadbalancer:\n  bogus: 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
    }

    #[test]
    fn empty_node_name_rejected() {
        let err = AgentConfig::from_yaml("agent:\n  node_name: ' '\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation { ref field, .. } if field == "agent.node_name"));
    }

    #[test]
    fn no_family_rejected() {
        let yaml = "loadbalancer:\n  enable_ipv4: false\n";
        assert!(matches!(
            AgentConfig::from_yaml(yaml),
            Err(ConfigError::Validation { .. })
        ));
    }

    #[test]
    fn nat46x64_requires_both_families() {
        let yaml = "loadbalancer:\n  nat46x64: true\n";
        let err = AgentConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("loadbalancer.nat46x64"));
    }

    #[test]
    fn unknown_algorithm_rejected() {
        let yaml = "loadbalancer:\n  algorithm: round_robin\n";
        assert!(matches!(
            AgentConfig::from_yaml(yaml),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn non_prime_table_size_rejected() {
        let yaml = "loadbalancer:\n  maglev_table_size: 1000\n";
        let err = AgentConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("maglev_table_size"));
    }

    #[test]
    fn load_reads_file() {
        let path = std::env::temp_dir().join(format!("lb-config-{}.yaml", std::process::id()));
        std::fs::write(&path, "agent:\n  node_name: node-a\n").unwrap();
        let config = AgentConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.agent.node_name, "node-a");
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let err = AgentConfig::load(Path::new("/nonexistent/lb.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    // ── LogLevel / LogFormat ──────────────────────────────────────

    #[test]
    fn log_level_parse() {
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!(LogLevel::Trace.to_string(), "trace");
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn log_format_parse() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
