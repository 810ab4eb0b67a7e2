// ── Paths ──────────────────────────────────────────────────────────

pub const DEFAULT_CONFIG_PATH: &str = "/etc/lb-registry/config.yaml";

// ── Identity ───────────────────────────────────────────────────────

/// Node name used when the config leaves `agent.node_name` unset.
pub const DEFAULT_NODE_NAME: &str = "localhost";

// ── Metrics ────────────────────────────────────────────────────────

pub const METRICS_PREFIX: &str = "lb";
