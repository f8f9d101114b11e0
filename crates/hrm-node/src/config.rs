//! Configuration loading from TOML and environment variables.
//!
//! The simulator reads its configuration from:
//! 1. A TOML config file (default: config/hrm-sim.toml)
//! 2. Environment variables (override TOML values)
//!
//! Environment variable prefix: HRM_

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use hrm_hierarchy::{ElectorConfig, HierarchyConfig, LivenessConfig};
use hrm_protocol::ENV_PREFIX;

use crate::NodeError;

/// Top-level simulation configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Election and escalation parameters.
    #[serde(default)]
    pub hierarchy: HierarchySection,
    /// Event processor tuning.
    #[serde(default)]
    pub processor: ProcessorSection,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingSection,
    /// Nodes, administrative domains and physical links.
    #[serde(default)]
    pub topology: TopologySection,
}

/// Election and escalation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HierarchySection {
    /// Number of hierarchy levels (H).
    #[serde(default = "default_height")]
    pub height: u8,
    /// Hops in the cluster graph of a level that one superior cluster spans.
    #[serde(default = "default_expansion_radius")]
    pub expansion_radius: u32,
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout_ms: u64,
    #[serde(default = "default_announce_timeout")]
    pub announce_timeout_ms: u64,
    #[serde(default = "default_poll_timeout")]
    pub coordinator_poll_timeout_ms: u64,
    #[serde(default = "default_max_polls")]
    pub max_coordinator_polls: u32,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Delay between the top-level win and address distribution.
    #[serde(default = "default_address_settle")]
    pub address_settle_ms: u64,
    /// Periodic ALIVE beacons and stale-coordinator detection.
    #[serde(default)]
    pub liveness_enabled: bool,
    #[serde(default = "default_alive_interval")]
    pub alive_interval_ms: u64,
    #[serde(default = "default_alive_timeout")]
    pub alive_timeout_ms: u64,
}

/// Event processor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorSection {
    /// Dispatches slower than this are logged.
    #[serde(default = "default_slow_dispatch")]
    pub slow_dispatch_warn_ms: u64,
    /// Saturation point of the per-level cluster-update counters.
    #[serde(default = "default_max_pending_updates")]
    pub max_pending_cluster_updates: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Log level filter (e.g., "info", "hrm_hierarchy=debug").
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// One simulated node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    /// Administrator-assigned priority. Without one the node elects with its
    /// connectivity priority at level 0.
    #[serde(default)]
    pub priority: Option<u64>,
    /// Administrative domains; each becomes a level-0 cluster.
    #[serde(default = "default_domains")]
    pub domains: Vec<u64>,
}

/// Nodes, administrative domains and physical links.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologySection {
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    /// Undirected physical links between node names.
    #[serde(default)]
    pub links: Vec<(String, String)>,
    /// Probability that the simulated network drops a message.
    #[serde(default)]
    pub loss_rate: f64,
    /// Seed for the simulated network's loss decisions.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

// -- Defaults --

fn default_height() -> u8 {
    hrm_protocol::DEFAULT_HIERARCHY_HEIGHT
}
fn default_expansion_radius() -> u32 {
    hrm_protocol::DEFAULT_EXPANSION_RADIUS
}
fn default_reply_timeout() -> u64 {
    hrm_protocol::REPLY_TIMEOUT_MS
}
fn default_announce_timeout() -> u64 {
    hrm_protocol::ANNOUNCE_TIMEOUT_MS
}
fn default_poll_timeout() -> u64 {
    hrm_protocol::COORDINATOR_POLL_TIMEOUT_MS
}
fn default_max_polls() -> u32 {
    hrm_protocol::MAX_COORDINATOR_POLLS
}
fn default_max_restarts() -> u32 {
    hrm_protocol::MAX_ELECTION_RESTARTS
}
fn default_address_settle() -> u64 {
    hrm_protocol::ADDRESS_DISTRIBUTION_SETTLE_MS
}
fn default_alive_interval() -> u64 {
    hrm_protocol::ALIVE_INTERVAL_MS
}
fn default_alive_timeout() -> u64 {
    hrm_protocol::ALIVE_TIMEOUT_MS
}
fn default_slow_dispatch() -> u64 {
    hrm_protocol::SLOW_DISPATCH_WARN_MS
}
fn default_max_pending_updates() -> u32 {
    hrm_protocol::MAX_PENDING_CLUSTER_UPDATES
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_domains() -> Vec<u64> {
    vec![1]
}
fn default_seed() -> u64 {
    7
}

// -- Trait impls --

impl Default for HierarchySection {
    fn default() -> Self {
        Self {
            height: default_height(),
            expansion_radius: default_expansion_radius(),
            reply_timeout_ms: default_reply_timeout(),
            announce_timeout_ms: default_announce_timeout(),
            coordinator_poll_timeout_ms: default_poll_timeout(),
            max_coordinator_polls: default_max_polls(),
            max_restarts: default_max_restarts(),
            address_settle_ms: default_address_settle(),
            liveness_enabled: false,
            alive_interval_ms: default_alive_interval(),
            alive_timeout_ms: default_alive_timeout(),
        }
    }
}

impl Default for ProcessorSection {
    fn default() -> Self {
        Self {
            slow_dispatch_warn_ms: default_slow_dispatch(),
            max_pending_cluster_updates: default_max_pending_updates(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for TopologySection {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            links: Vec::new(),
            loss_rate: 0.0,
            seed: default_seed(),
        }
    }
}

impl SimulationConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)?;
        let config: SimulationConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from a TOML file, with environment variable overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, anyhow::Error> {
        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(path)?,
            Some(path) => {
                tracing::warn!(path = %path.display(), "Config file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `HRM_*` overrides. Values that do not parse are ignored.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(val) = var("LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Some(h) = var("HIERARCHY_HEIGHT").and_then(|v| v.parse().ok()) {
            self.hierarchy.height = h;
        }
        if let Some(r) = var("EXPANSION_RADIUS").and_then(|v| v.parse().ok()) {
            self.hierarchy.expansion_radius = r;
        }
        if let Some(ms) = var("REPLY_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.hierarchy.reply_timeout_ms = ms;
        }
        if let Some(ms) = var("ANNOUNCE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.hierarchy.announce_timeout_ms = ms;
        }
        if let Some(val) = var("LIVENESS_ENABLED") {
            self.hierarchy.liveness_enabled = val == "true" || val == "1";
        }
    }

    /// Reject configurations the simulation cannot build.
    pub fn validate(&self) -> Result<(), NodeError> {
        let height = self.hierarchy.height;
        if height == 0 || height > hrm_protocol::MAX_HIERARCHY_HEIGHT {
            return Err(NodeError::InvalidConfig(format!(
                "hierarchy height {height} outside 1..={}",
                hrm_protocol::MAX_HIERARCHY_HEIGHT
            )));
        }
        if self.hierarchy.expansion_radius == 0 {
            return Err(NodeError::InvalidConfig("expansion radius must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&self.topology.loss_rate) {
            return Err(NodeError::InvalidConfig(format!(
                "loss rate {} outside [0, 1)",
                self.topology.loss_rate
            )));
        }

        let mut names = BTreeSet::new();
        for node in &self.topology.nodes {
            if !names.insert(node.name.as_str()) {
                return Err(NodeError::InvalidConfig(format!("duplicate node {}", node.name)));
            }
            if node.domains.is_empty() {
                return Err(NodeError::InvalidConfig(format!("node {} has no domain", node.name)));
            }
        }
        for (a, b) in &self.topology.links {
            if a == b {
                return Err(NodeError::InvalidConfig(format!("self link on {a}")));
            }
            for end in [a, b] {
                if !names.contains(end.as_str()) {
                    return Err(NodeError::InvalidConfig(format!("link to unknown node {end}")));
                }
            }
        }
        Ok(())
    }

    /// Hierarchy parameters handed to every node.
    pub fn to_hierarchy_config(&self) -> HierarchyConfig {
        let h = &self.hierarchy;
        let liveness = h.liveness_enabled.then(|| LivenessConfig {
            interval: Duration::from_millis(h.alive_interval_ms),
            timeout: Duration::from_millis(h.alive_timeout_ms),
        });
        HierarchyConfig {
            height: h.height,
            elector: ElectorConfig {
                reply_timeout: Duration::from_millis(h.reply_timeout_ms),
                announce_timeout: Duration::from_millis(h.announce_timeout_ms),
                coordinator_poll_timeout: Duration::from_millis(h.coordinator_poll_timeout_ms),
                max_coordinator_polls: h.max_coordinator_polls,
                max_restarts: h.max_restarts,
                liveness,
            },
            address_settle: Duration::from_millis(h.address_settle_ms),
        }
    }
}
