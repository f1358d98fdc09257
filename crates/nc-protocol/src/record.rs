//! Records for nodes, deployments and executions
//!
//! These are the authoritative shapes the connector keeps in its tracker and
//! returns to callers. State enums carry the lifecycle rules: which states are
//! terminal and which transitions are legal.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::id::{DeploymentId, ExecutionId, NodeId};

/// Availability of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Node can accept a deployment
    Available,
    /// Node is held by a deployment
    Busy,
    /// Backend no longer reports the node
    Unreachable,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Available => write!(f, "available"),
            NodeState::Busy => write!(f, "busy"),
            NodeState::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// A compute resource the connector can target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Backend-assigned identifier
    pub id: NodeId,
    /// Capability tags (architecture, location, ...)
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Current availability
    pub state: NodeState,
    /// Deployment currently holding this node
    #[serde(default)]
    pub deployment: Option<DeploymentId>,
    /// Last state change, Unix milliseconds
    pub updated_at: u64,
}

impl Node {
    /// Create an available node with the given tags
    pub fn new(id: impl Into<NodeId>, tags: BTreeMap<String, String>, now: u64) -> Self {
        Self {
            id: id.into(),
            tags,
            state: NodeState::Available,
            deployment: None,
            updated_at: now,
        }
    }

    /// Check whether the node carries `key=value`
    pub fn has_tag(&self, key: &str, value: &str) -> bool {
        self.tags.get(key).map(|v| v == value).unwrap_or(false)
    }
}

/// Lifecycle of a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    /// Recorded, backend not yet contacted
    Pending,
    /// Backend is preparing the node
    InProgress,
    /// Node is prepared; executions may run
    Succeeded,
    /// Preparation failed
    Failed,
}

impl DeploymentState {
    /// Whether no further transition is possible
    pub fn is_terminal(self) -> bool {
        matches!(self, DeploymentState::Succeeded | DeploymentState::Failed)
    }

    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(self, next: DeploymentState) -> bool {
        use DeploymentState::*;
        matches!(
            (self, next),
            (Pending, InProgress) | (Pending, Failed) | (InProgress, Succeeded) | (InProgress, Failed)
        )
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentState::Pending => write!(f, "pending"),
            DeploymentState::InProgress => write!(f, "in_progress"),
            DeploymentState::Succeeded => write!(f, "succeeded"),
            DeploymentState::Failed => write!(f, "failed"),
        }
    }
}

/// Why a deployment or execution ended in a failed state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The backend reported an error
    BackendError,
    /// A backend call exceeded the configured timeout
    BackendTimeout,
    /// Reconciliation found the record stuck and unknown to the backend
    ReconciliationTimeout,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::BackendError => write!(f, "backend_error"),
            FailureReason::BackendTimeout => write!(f, "backend_timeout"),
            FailureReason::ReconciliationTimeout => write!(f, "reconciliation_timeout"),
        }
    }
}

/// A failure reason with its diagnostic message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub reason: FailureReason,
    pub message: String,
}

impl Failure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reason, self.message)
    }
}

/// A request to prepare a node for work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub node_id: NodeId,
    /// Backend-specific preparation payload, opaque to the connector
    #[serde(default)]
    pub payload: Value,
    pub state: DeploymentState,
    #[serde(default)]
    pub failure: Option<Failure>,
    /// Set once the node was released; no new executions may bind
    #[serde(default)]
    pub released: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Lifecycle of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Recorded, backend not yet acknowledged the start
    Scheduled,
    /// Backend accepted and is running the work
    Running,
    /// Completed successfully
    Finished,
    /// Completed with an error
    Failed,
    /// Stopped on request
    Cancelled,
}

impl ExecutionState {
    /// Whether no further transition is possible
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Finished | ExecutionState::Failed | ExecutionState::Cancelled
        )
    }

    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(self, next: ExecutionState) -> bool {
        match self {
            ExecutionState::Scheduled => next != ExecutionState::Scheduled,
            ExecutionState::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionState::Scheduled => write!(f, "scheduled"),
            ExecutionState::Running => write!(f, "running"),
            ExecutionState::Finished => write!(f, "finished"),
            ExecutionState::Failed => write!(f, "failed"),
            ExecutionState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome of a terminal execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ExecutionResult {
    /// Completion payload reported by the backend
    Success(Value),
    /// Error description
    Failure(String),
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success(_))
    }
}

/// One run of a unit of work on a deployed node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub deployment_id: DeploymentId,
    pub node_id: NodeId,
    #[serde(default)]
    pub experiment_id: Option<String>,
    pub state: ExecutionState,
    #[serde(default)]
    pub result: Option<ExecutionResult>,
    #[serde(default)]
    pub failure: Option<Failure>,
    pub created_at: u64,
    #[serde(default)]
    pub started_at: Option<u64>,
    #[serde(default)]
    pub finished_at: Option<u64>,
    pub updated_at: u64,
}
