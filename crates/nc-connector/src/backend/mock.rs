//! Scriptable backend for unit tests

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use nc_core::types::{DeploymentId, ExecutionId, NodeId, OperationContext};
use nc_core::{Backend, BackendError, BackendStatus, DeploymentSpec, ExecutionSpec, NodeDescriptor};

#[derive(Default)]
struct MockState {
    nodes: Vec<NodeDescriptor>,
    failures: HashMap<&'static str, BackendError>,
    delays: HashMap<&'static str, Duration>,
    deployments: HashMap<DeploymentId, BackendStatus>,
    executions: HashMap<ExecutionId, BackendStatus>,
    last_deployment: Option<DeploymentSpec>,
    last_execution: Option<ExecutionSpec>,
    last_cancel_context: Option<OperationContext>,
    calls: HashMap<&'static str, usize>,
}

/// In-memory backend whose behavior tests script per operation
#[derive(Default)]
pub(crate) struct MockBackend {
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn with_nodes(ids: &[&str]) -> Self {
        let backend = Self::default();
        backend.set_nodes(ids);
        backend
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_nodes(&self, ids: &[&str]) {
        self.lock().nodes = ids
            .iter()
            .map(|id| NodeDescriptor::new(*id).with_tag("arch", "amd64"))
            .collect();
    }

    /// Make every call of `op` fail with `err`
    pub fn fail(&self, op: &'static str, err: BackendError) {
        self.lock().failures.insert(op, err);
    }

    pub fn recover(&self, op: &'static str) {
        self.lock().failures.remove(op);
    }

    /// Delay every call of `op`
    pub fn delay(&self, op: &'static str, delay: Duration) {
        self.lock().delays.insert(op, delay);
    }

    pub fn complete(&self, id: &ExecutionId, output: Value) {
        self.lock()
            .executions
            .insert(id.clone(), BackendStatus::Finished(output));
    }

    pub fn fail_execution(&self, id: &ExecutionId, message: &str) {
        self.lock()
            .executions
            .insert(id.clone(), BackendStatus::Failed(message.to_string()));
    }

    /// Drop the backend's record, as after a backend restart
    pub fn forget_execution(&self, id: &ExecutionId) {
        self.lock().executions.remove(id);
    }

    pub fn calls(&self, op: &str) -> usize {
        self.lock().calls.get(op).copied().unwrap_or(0)
    }

    pub fn last_deployment(&self) -> Option<DeploymentSpec> {
        self.lock().last_deployment.clone()
    }

    pub fn last_execution(&self) -> Option<ExecutionSpec> {
        self.lock().last_execution.clone()
    }

    pub fn last_cancel_context(&self) -> Option<OperationContext> {
        self.lock().last_cancel_context.clone()
    }

    async fn enter(&self, op: &'static str) -> Result<(), BackendError> {
        let (delay, failure) = {
            let mut state = self.lock();
            *state.calls.entry(op).or_insert(0) += 1;
            (state.delays.get(op).copied(), state.failures.get(op).cloned())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn initialize(&self) -> Result<(), BackendError> {
        self.enter("initialize").await
    }

    async fn health(&self) -> Result<String, BackendError> {
        self.enter("health").await?;
        Ok("mock ok".to_string())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeDescriptor>, BackendError> {
        self.enter("list_nodes").await?;
        Ok(self.lock().nodes.clone())
    }

    async fn deploy(&self, spec: &DeploymentSpec) -> Result<(), BackendError> {
        self.enter("deploy").await?;
        let mut state = self.lock();
        state
            .deployments
            .insert(spec.id.clone(), BackendStatus::Finished(Value::Null));
        state.last_deployment = Some(spec.clone());
        Ok(())
    }

    async fn deployment_status(&self, id: &DeploymentId) -> Result<BackendStatus, BackendError> {
        self.enter("deployment_status").await?;
        Ok(self
            .lock()
            .deployments
            .get(id)
            .cloned()
            .unwrap_or(BackendStatus::Unknown))
    }

    async fn execute(&self, spec: &ExecutionSpec) -> Result<(), BackendError> {
        self.enter("execute").await?;
        let mut state = self.lock();
        state.executions.insert(spec.id.clone(), BackendStatus::Running);
        state.last_execution = Some(spec.clone());
        Ok(())
    }

    async fn cancel(
        &self,
        id: &ExecutionId,
        _node_id: &NodeId,
        context: &OperationContext,
    ) -> Result<(), BackendError> {
        self.enter("cancel").await?;
        let mut state = self.lock();
        state.last_cancel_context = Some(context.clone());
        match state.executions.get_mut(id) {
            Some(status) if status.is_terminal() => Err(BackendError::Rejected(format!(
                "execution {} already ended",
                id
            ))),
            Some(status) => {
                *status = BackendStatus::Cancelled;
                Ok(())
            }
            None => Err(BackendError::Rejected(format!("unknown execution {}", id))),
        }
    }

    async fn query_execution(&self, id: &ExecutionId) -> Result<BackendStatus, BackendError> {
        self.enter("query_execution").await?;
        Ok(self
            .lock()
            .executions
            .get(id)
            .cloned()
            .unwrap_or(BackendStatus::Unknown))
    }

    async fn cleanup(&self, id: &DeploymentId, _node_id: &NodeId) -> Result<(), BackendError> {
        self.enter("cleanup").await?;
        self.lock().deployments.remove(id);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BackendError> {
        self.enter("shutdown").await
    }
}
