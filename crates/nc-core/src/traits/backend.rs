//! Backend capability interface
//!
//! A backend is the concrete infrastructure a connector wraps (a testbed, a
//! cloud API, a container host). The connector core depends only on this
//! trait, so each backend family is one implementation.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::BackendError;
use nc_protocol::{DeploymentId, ExecutionId, NodeId, OperationContext};

/// Environment variable carrying the gateway endpoint to executors
pub const GATEWAY_ENDPOINT_ENV: &str = "NETUNICORN_GATEWAY_ENDPOINT";
/// Environment variable carrying the executor (execution) id
pub const EXECUTOR_ID_ENV: &str = "NETUNICORN_EXECUTOR_ID";
/// Environment variable carrying the experiment id
pub const EXPERIMENT_ID_ENV: &str = "NETUNICORN_EXPERIMENT_ID";

/// A node as reported by the backend inventory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub id: NodeId,
    pub tags: BTreeMap<String, String>,
}

impl NodeDescriptor {
    pub fn new(id: impl Into<NodeId>) -> Self {
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

/// What the backend must prepare
#[derive(Debug, Clone)]
pub struct DeploymentSpec {
    pub id: DeploymentId,
    pub node_id: NodeId,
    pub payload: Value,
    /// Caller-supplied deployment context
    pub context: OperationContext,
}

/// Context handed to every execution
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    /// Gateway the executor reports back to
    pub gateway_endpoint: String,
    pub experiment_id: Option<String>,
    /// Caller-supplied execution context
    pub caller: OperationContext,
}

impl ExecutionContext {
    /// Environment variables an executor expects
    pub fn environment(&self, executor_id: &ExecutionId) -> Vec<(String, String)> {
        vec![
            (
                GATEWAY_ENDPOINT_ENV.to_string(),
                self.gateway_endpoint.clone(),
            ),
            (EXECUTOR_ID_ENV.to_string(), executor_id.to_string()),
            (
                EXPERIMENT_ID_ENV.to_string(),
                self.experiment_id.clone().unwrap_or_default(),
            ),
        ]
    }
}

/// What the backend must start
#[derive(Debug, Clone)]
pub struct ExecutionSpec {
    pub id: ExecutionId,
    pub deployment_id: DeploymentId,
    pub node_id: NodeId,
    /// Payload of the deployment this execution runs on
    pub payload: Value,
    pub context: ExecutionContext,
}

/// Backend-observable truth about a deployment or an execution.
///
/// For deployments `Finished` means the node is prepared.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendStatus {
    /// Backend has no record of the id
    Unknown,
    /// Work is in progress
    Running,
    /// Completed successfully with a payload
    Finished(Value),
    /// Completed with an error description
    Failed(String),
    /// Stopped on request
    Cancelled,
}

impl BackendStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BackendStatus::Finished(_) | BackendStatus::Failed(_) | BackendStatus::Cancelled
        )
    }
}

/// Capability interface every backend family implements
#[async_trait]
pub trait Backend: Send + Sync {
    /// Backend family name, for health reports and logs
    fn name(&self) -> &str;

    /// Prepare the backend session (clients, credentials, ...)
    async fn initialize(&self) -> Result<(), BackendError> {
        Ok(())
    }

    /// Probe reachability; returns a human-readable status
    async fn health(&self) -> Result<String, BackendError>;

    /// Current inventory of nodes
    async fn list_nodes(&self) -> Result<Vec<NodeDescriptor>, BackendError>;

    /// Prepare a node; returns once the node is ready
    async fn deploy(&self, spec: &DeploymentSpec) -> Result<(), BackendError>;

    /// Observe a deployment (used by reconciliation)
    async fn deployment_status(&self, id: &DeploymentId) -> Result<BackendStatus, BackendError>;

    /// Start an execution; returns once the backend accepted it
    async fn execute(&self, spec: &ExecutionSpec) -> Result<(), BackendError>;

    /// Ask the backend to stop an execution; `Ok` is the acknowledgment.
    ///
    /// An execution that already ended must be refused, not acknowledged.
    async fn cancel(
        &self,
        id: &ExecutionId,
        node_id: &NodeId,
        context: &OperationContext,
    ) -> Result<(), BackendError>;

    /// Observe an execution
    async fn query_execution(&self, id: &ExecutionId) -> Result<BackendStatus, BackendError>;

    /// Tear down what a deployment left on its node
    async fn cleanup(&self, _id: &DeploymentId, _node_id: &NodeId) -> Result<(), BackendError> {
        Ok(())
    }

    /// Release backend resources
    async fn shutdown(&self) -> Result<(), BackendError> {
        Ok(())
    }
}
