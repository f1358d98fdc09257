//! Request and response bodies of the connector protocol

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::id::{DeploymentId, ExecutionId, NodeId};
use crate::record::Node;

/// Current protocol version string, reported by `/health`.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Free-form key/value context a caller attaches to an operation
/// (deployment flags, cancellation reason, ...). Passed through to the
/// backend untouched.
pub type OperationContext = BTreeMap<String, String>;

/// Body of `POST /deployments`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    pub node_id: NodeId,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: OperationContext,
}

/// Body of `POST /executions`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub deployment_id: DeploymentId,
    /// Caller-chosen id; the connector generates one when absent
    #[serde(default)]
    pub execution_id: Option<ExecutionId>,
    #[serde(default)]
    pub experiment_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: OperationContext,
}

/// Optional body of `POST /executions/{id}/cancel`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CancelRequest {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: OperationContext,
}

/// Connector liveness plus backend reachability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Connector instance name
    pub connector: String,
    /// Backend family name
    pub backend: String,
    pub healthy: bool,
    /// Backend-provided status text
    pub status: String,
    pub protocol_version: String,
}

/// Capability filter for node listings.
///
/// A node matches when every pair in the filter equals the node's tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeFilter {
    pub tags: BTreeMap<String, String>,
}

impl NodeFilter {
    /// Filter that matches every node
    pub fn any() -> Self {
        Self::default()
    }

    /// Add a required tag
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn matches(&self, node: &Node) -> bool {
        self.tags.iter().all(|(k, v)| node.has_tag(k, v))
    }
}

impl From<BTreeMap<String, String>> for NodeFilter {
    fn from(tags: BTreeMap<String, String>) -> Self {
        Self { tags }
    }
}

/// Result of a node inventory query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeListing {
    pub nodes: Vec<Node>,
    /// True when the backend could not be queried and the cached inventory
    /// was served instead
    pub stale: bool,
    /// Time of the last successful inventory refresh, Unix milliseconds
    pub refreshed_at: Option<u64>,
}
