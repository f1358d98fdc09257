//! Simulated node pool
//!
//! Serves a static node list from configuration. Deployments take
//! `deploy_delay`; executions finish `run_time` after they start. Nothing
//! leaves the process, which makes this backend the default for local runs
//! and for integration tests.

use std::collections::HashSet;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};

use nc_core::config::SimulatedBackendConfig;
use nc_core::types::{DeploymentId, ExecutionId, NodeId, OperationContext};
use nc_core::{Backend, BackendError, BackendStatus, DeploymentSpec, ExecutionSpec, NodeDescriptor};

struct SimulatedRun {
    node_id: NodeId,
    deployment_id: DeploymentId,
    payload: Value,
    context: OperationContext,
    started: Instant,
    cancelled: bool,
}

pub struct SimulatedBackend {
    config: SimulatedBackendConfig,
    node_ids: HashSet<NodeId>,
    deployments: DashMap<DeploymentId, NodeId>,
    runs: DashMap<ExecutionId, SimulatedRun>,
}

impl SimulatedBackend {
    pub fn new(config: SimulatedBackendConfig) -> Self {
        let node_ids = config
            .nodes
            .iter()
            .map(|n| NodeId::new(n.id.clone()))
            .collect();
        Self {
            config,
            node_ids,
            deployments: DashMap::new(),
            runs: DashMap::new(),
        }
    }

    fn status_of(&self, id: &ExecutionId, run: &SimulatedRun) -> BackendStatus {
        if run.cancelled {
            BackendStatus::Cancelled
        } else if run.started.elapsed() >= self.config.run_time {
            BackendStatus::Finished(json!({
                "node": run.node_id,
                "execution": id,
                "payload": run.payload,
                "context": run.context,
            }))
        } else {
            BackendStatus::Running
        }
    }
}

#[async_trait]
impl Backend for SimulatedBackend {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn health(&self) -> Result<String, BackendError> {
        Ok(format!(
            "simulated pool of {} nodes, {} deployments, {} executions",
            self.node_ids.len(),
            self.deployments.len(),
            self.runs.len()
        ))
    }

    async fn list_nodes(&self) -> Result<Vec<NodeDescriptor>, BackendError> {
        Ok(self
            .config
            .nodes
            .iter()
            .map(|profile| NodeDescriptor {
                id: NodeId::new(profile.id.clone()),
                tags: profile.tags.clone(),
            })
            .collect())
    }

    async fn deploy(&self, spec: &DeploymentSpec) -> Result<(), BackendError> {
        if !self.node_ids.contains(&spec.node_id) {
            return Err(BackendError::Rejected(format!("unknown node {}", spec.node_id)));
        }

        tokio::time::sleep(self.config.deploy_delay).await;
        self.deployments.insert(spec.id.clone(), spec.node_id.clone());
        tracing::debug!("Simulated deployment {} on {}", spec.id, spec.node_id);
        Ok(())
    }

    async fn deployment_status(&self, id: &DeploymentId) -> Result<BackendStatus, BackendError> {
        Ok(if self.deployments.contains_key(id) {
            BackendStatus::Finished(Value::Null)
        } else {
            BackendStatus::Unknown
        })
    }

    async fn execute(&self, spec: &ExecutionSpec) -> Result<(), BackendError> {
        if !self.deployments.contains_key(&spec.deployment_id) {
            return Err(BackendError::Rejected(format!(
                "deployment {} is not prepared",
                spec.deployment_id
            )));
        }

        self.runs.insert(
            spec.id.clone(),
            SimulatedRun {
                node_id: spec.node_id.clone(),
                deployment_id: spec.deployment_id.clone(),
                payload: spec.payload.clone(),
                context: spec.context.caller.clone(),
                started: Instant::now(),
                cancelled: false,
            },
        );
        tracing::debug!("Simulated execution {} started on {}", spec.id, spec.node_id);
        Ok(())
    }

    async fn cancel(
        &self,
        id: &ExecutionId,
        _node_id: &NodeId,
        context: &OperationContext,
    ) -> Result<(), BackendError> {
        let mut run = self
            .runs
            .get_mut(id)
            .ok_or_else(|| BackendError::Rejected(format!("unknown execution {}", id)))?;
        if !run.cancelled && run.started.elapsed() >= self.config.run_time {
            return Err(BackendError::Rejected(format!(
                "execution {} already finished",
                id
            )));
        }
        run.cancelled = true;
        tracing::debug!("Simulated execution {} cancelled ({:?})", id, context);
        Ok(())
    }

    async fn query_execution(&self, id: &ExecutionId) -> Result<BackendStatus, BackendError> {
        Ok(match self.runs.get(id) {
            Some(run) => self.status_of(id, &run),
            None => BackendStatus::Unknown,
        })
    }

    async fn cleanup(&self, id: &DeploymentId, _node_id: &NodeId) -> Result<(), BackendError> {
        self.deployments.remove(id);
        self.runs.retain(|_, run| &run.deployment_id != id);
        Ok(())
    }
}
