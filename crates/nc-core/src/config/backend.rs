//! Backend selection and per-family settings

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::serde_utils::duration_millis;
use crate::error::ConfigError;

/// Which backend family the connector wraps
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// In-process pool of simulated nodes
    Simulated(SimulatedBackendConfig),
    /// Commands run on the local host
    Shell(ShellBackendConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Simulated(SimulatedBackendConfig::default())
    }
}

impl BackendConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            BackendConfig::Simulated(_) => "simulated",
            BackendConfig::Shell(_) => "shell",
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            BackendConfig::Simulated(sim) => {
                let mut seen = std::collections::HashSet::new();
                for node in &sim.nodes {
                    if node.id.trim().is_empty() {
                        return Err(ConfigError::MissingField("backend.nodes[].id".to_string()));
                    }
                    if !seen.insert(node.id.as_str()) {
                        return Err(ConfigError::Invalid(format!(
                            "duplicate node id: {}",
                            node.id
                        )));
                    }
                }
                Ok(())
            }
            BackendConfig::Shell(shell) => {
                if shell.node_id.trim().is_empty() {
                    return Err(ConfigError::MissingField("backend.node_id".to_string()));
                }
                if shell.shell.trim().is_empty() {
                    return Err(ConfigError::MissingField("backend.shell".to_string()));
                }
                Ok(())
            }
        }
    }
}

/// A node served by the simulated backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeProfile {
    pub id: String,

    /// Capability tags for this node
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl NodeProfile {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tags: BTreeMap::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Settings for the simulated backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedBackendConfig {
    pub nodes: Vec<NodeProfile>,

    /// Time a deployment takes to complete
    #[serde(with = "duration_millis")]
    pub deploy_delay: Duration,

    /// Time an execution runs before finishing
    #[serde(with = "duration_millis")]
    pub run_time: Duration,
}

impl Default for SimulatedBackendConfig {
    fn default() -> Self {
        let nodes = (0..3)
            .map(|i| {
                NodeProfile::new(format!("node-{}", i))
                    .with_tag("arch", "linux/amd64")
                    .with_tag("cpu", "4")
                    .with_tag("memory", "16")
                    .with_tag("gpu", "0")
            })
            .collect();

        Self {
            nodes,
            deploy_delay: Duration::from_millis(100),
            run_time: Duration::from_secs(1),
        }
    }
}

/// Settings for the local shell backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellBackendConfig {
    /// Id under which the local host is exposed
    pub node_id: String,

    /// Shell used to run commands (`<shell> -c <command>`)
    pub shell: String,

    /// Extra tags added to the detected host tags
    pub tags: BTreeMap<String, String>,
}

impl Default for ShellBackendConfig {
    fn default() -> Self {
        Self {
            node_id: "local".to_string(),
            shell: "sh".to_string(),
            tags: BTreeMap::new(),
        }
    }
}
