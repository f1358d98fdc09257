//! Connector protocol adapter
//!
//! The fixed operation set an orchestrator relies on. The adapter is
//! backend-agnostic: it drives an `Arc<dyn Backend>` and keeps every record
//! in the [`Tracker`].
//!
//! Every mutating operation writes its target state to the tracker before
//! the backend call and settles the record afterwards, so a failed or lost
//! call is always observable through `status()`. Every backend call is
//! bounded by the configured backend timeout.

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashSet;
use serde_json::Value;

use nc_core::config::ConnectorConfig;
use nc_core::time::{current_time_millis, is_older_than};
use nc_core::types::{
    generate_deployment_id, generate_execution_id, Deployment, DeploymentId, DeploymentState,
    Execution, ExecutionId, ExecutionResult, ExecutionState, Failure, FailureReason, Node,
    NodeFilter, NodeId, NodeListing, OperationContext,
};
use nc_core::{
    Backend, BackendError, BackendStatus, ConnectorError, DeploymentSpec, ExecutionContext,
    ExecutionSpec,
};
use nc_protocol::{HealthReport, PROTOCOL_VERSION};

use crate::backend;
use crate::tracker::{Bound, InventoryChange, Tracker, Transition};

/// Failure reason for a backend error
fn failure_for(err: &BackendError) -> Failure {
    let reason = if err.is_timeout() {
        FailureReason::BackendTimeout
    } else {
        FailureReason::BackendError
    };
    Failure::new(reason, err.to_string())
}

/// Marks an id as having a backend call in flight until dropped
struct InFlight<'a, K: Eq + Hash> {
    set: &'a DashSet<K>,
    key: K,
}

impl<'a, K: Eq + Hash + Clone> InFlight<'a, K> {
    fn enter(set: &'a DashSet<K>, key: &K) -> Self {
        set.insert(key.clone());
        Self {
            set,
            key: key.clone(),
        }
    }
}

impl<K: Eq + Hash> Drop for InFlight<'_, K> {
    fn drop(&mut self) {
        self.set.remove(&self.key);
    }
}

/// Adapter between an orchestrator and one backend
pub struct Connector {
    config: ConnectorConfig,
    backend: Arc<dyn Backend>,
    tracker: Arc<Tracker>,
    deploying: DashSet<DeploymentId>,
    starting: DashSet<ExecutionId>,
}

impl Connector {
    pub fn new(config: ConnectorConfig, backend: Arc<dyn Backend>, tracker: Arc<Tracker>) -> Self {
        Self {
            config,
            backend,
            tracker,
            deploying: DashSet::new(),
            starting: DashSet::new(),
        }
    }

    /// Build the backend and tracker described by `config`
    pub fn from_config(config: ConnectorConfig) -> Result<Self, ConnectorError> {
        let backend = backend::from_config(&config.backend);
        let tracker = Tracker::open(config.journal_path.as_deref())?;
        Ok(Self::new(config, backend, Arc::new(tracker)))
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    pub(crate) fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// True while the backend `deploy` call for `id` has not returned
    pub fn is_deploying(&self, id: &DeploymentId) -> bool {
        self.deploying.contains(id)
    }

    /// True while the backend `execute` call for `id` has not returned
    pub fn is_starting(&self, id: &ExecutionId) -> bool {
        self.starting.contains(id)
    }

    /// Run a backend call under the backend timeout
    pub(crate) async fn call<T>(
        &self,
        call: impl Future<Output = Result<T, BackendError>>,
    ) -> Result<T, BackendError> {
        match tokio::time::timeout(self.config.backend_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(self.config.backend_timeout)),
        }
    }

    // ---- lifecycle ----

    /// Open the backend session and load the first inventory
    pub async fn initialize(&self) -> Result<InventoryChange, ConnectorError> {
        self.call(self.backend.initialize())
            .await
            .map_err(ConnectorError::BackendUnreachable)?;

        let change = self.refresh_inventory().await?;
        tracing::info!(
            "Connector {} initialized on {} backend ({} nodes discovered)",
            self.config.name,
            self.backend.name(),
            change.added
        );
        Ok(change)
    }

    pub async fn shutdown(&self) -> Result<(), ConnectorError> {
        self.call(self.backend.shutdown())
            .await
            .map_err(ConnectorError::from_backend)?;
        tracing::info!("Connector {} shut down", self.config.name);
        Ok(())
    }

    /// Merge the backend's current inventory into the tracker
    pub async fn refresh_inventory(&self) -> Result<InventoryChange, ConnectorError> {
        let descriptors = self
            .call(self.backend.list_nodes())
            .await
            .map_err(ConnectorError::BackendUnreachable)?;
        self.tracker
            .merge_inventory(descriptors, current_time_millis())
    }

    // ---- queries ----

    pub async fn health(&self) -> Result<HealthReport, ConnectorError> {
        let status = self.call(self.backend.health()).await.map_err(|e| {
            tracing::warn!("Backend {} health probe failed: {}", self.backend.name(), e);
            ConnectorError::BackendUnreachable(e)
        })?;

        Ok(HealthReport {
            connector: self.config.name.clone(),
            backend: self.backend.name().to_string(),
            healthy: true,
            status,
            protocol_version: PROTOCOL_VERSION.to_string(),
        })
    }

    /// Nodes matching `filter`.
    ///
    /// When the backend cannot be queried, a cached inventory younger than
    /// `inventory_staleness` is served with `stale = true`.
    pub async fn list_nodes(&self, filter: &NodeFilter) -> Result<NodeListing, ConnectorError> {
        let stale = match self.refresh_inventory().await {
            Ok(_) => false,
            Err(ConnectorError::BackendUnreachable(err)) => {
                let now = current_time_millis();
                match self.tracker.inventory_refreshed_at() {
                    Some(at) if !is_older_than(at, self.config.inventory_staleness, now) => {
                        tracing::warn!(
                            "Serving cached inventory from {}ms ago: {}",
                            now.saturating_sub(at),
                            err
                        );
                        true
                    }
                    _ => return Err(ConnectorError::BackendUnreachable(err)),
                }
            }
            Err(other) => return Err(other),
        };

        Ok(NodeListing {
            nodes: self.tracker.nodes_snapshot(filter),
            stale,
            refreshed_at: self.tracker.inventory_refreshed_at(),
        })
    }

    pub fn deployment(&self, id: &DeploymentId) -> Result<Deployment, ConnectorError> {
        self.tracker
            .deployment(id)
            .ok_or_else(|| ConnectorError::DeploymentNotFound(id.clone()))
    }

    // ---- deployments ----

    /// Prepare `node_id` with `payload`.
    ///
    /// The node is reserved before the backend is called; a failed or timed
    /// out deployment returns it to the pool.
    pub async fn deploy(&self, node_id: &NodeId, payload: Value) -> Result<Deployment, ConnectorError> {
        self.deploy_with_context(node_id, payload, OperationContext::new())
            .await
    }

    /// [`deploy`](Self::deploy) with a caller context handed to the backend
    pub async fn deploy_with_context(
        &self,
        node_id: &NodeId,
        payload: Value,
        context: OperationContext,
    ) -> Result<Deployment, ConnectorError> {
        let id = generate_deployment_id();
        let _in_flight = InFlight::enter(&self.deploying, &id);

        let now = current_time_millis();
        let pending = Deployment {
            id: id.clone(),
            node_id: node_id.clone(),
            payload: payload.clone(),
            state: DeploymentState::Pending,
            failure: None,
            released: false,
            created_at: now,
            updated_at: now,
        };
        self.tracker.reserve_node(pending, now)?;

        self.tracker.transition_deployment(
            &id,
            DeploymentState::InProgress,
            None,
            current_time_millis(),
        )?;

        let spec = DeploymentSpec {
            id: id.clone(),
            node_id: node_id.clone(),
            payload,
            context,
        };

        match self.call(self.backend.deploy(&spec)).await {
            Ok(()) => {
                let outcome = self.tracker.transition_deployment(
                    &id,
                    DeploymentState::Succeeded,
                    None,
                    current_time_millis(),
                )?;
                match outcome {
                    Transition::Applied(deployment) => Ok(deployment),
                    Transition::Unchanged(deployment) => {
                        // Settled elsewhere while the backend was still
                        // working; undo the backend side.
                        tracing::warn!(
                            "Deployment {} finished after it was marked {}",
                            id,
                            deployment.state
                        );
                        if let Err(e) = self.call(self.backend.cleanup(&id, node_id)).await {
                            tracing::warn!("Cleanup of late deployment {} failed: {}", id, e);
                        }
                        Err(ConnectorError::DeploymentFailed {
                            deployment: id,
                            source: BackendError::Internal(format!(
                                "deployment was marked {} before the backend finished",
                                deployment.state
                            )),
                        })
                    }
                }
            }
            Err(err) => {
                tracing::warn!("Deployment {} on node {} failed: {}", id, node_id, err);
                let now = current_time_millis();
                self.tracker.transition_deployment(
                    &id,
                    DeploymentState::Failed,
                    Some(failure_for(&err)),
                    now,
                )?;
                self.tracker.free_node(node_id, &id, now)?;
                Err(ConnectorError::DeploymentFailed {
                    deployment: id,
                    source: err,
                })
            }
        }
    }

    // ---- executions ----

    /// Start an execution on a prepared deployment.
    ///
    /// Repeating the call with the same (deployment, execution) pair returns
    /// the existing record without reaching the backend again.
    pub async fn execute(
        &self,
        deployment_id: &DeploymentId,
        execution_id: Option<ExecutionId>,
        experiment_id: Option<String>,
    ) -> Result<Execution, ConnectorError> {
        self.execute_with_context(deployment_id, execution_id, experiment_id, OperationContext::new())
            .await
    }

    /// [`execute`](Self::execute) with a caller context handed to the backend
    pub async fn execute_with_context(
        &self,
        deployment_id: &DeploymentId,
        execution_id: Option<ExecutionId>,
        experiment_id: Option<String>,
        context: OperationContext,
    ) -> Result<Execution, ConnectorError> {
        let execution_id = execution_id.unwrap_or_else(generate_execution_id);

        let bound = self.tracker.bind_execution(
            deployment_id,
            &execution_id,
            experiment_id,
            current_time_millis(),
        )?;
        let (execution, payload) = match bound {
            Bound::Existing(execution) => {
                tracing::debug!("Execution {} already bound, returning it", execution_id);
                return Ok(execution);
            }
            Bound::Created { execution, payload } => (execution, payload),
        };
        let _in_flight = InFlight::enter(&self.starting, &execution_id);

        let spec = ExecutionSpec {
            id: execution_id.clone(),
            deployment_id: deployment_id.clone(),
            node_id: execution.node_id.clone(),
            payload,
            context: ExecutionContext {
                gateway_endpoint: self.config.gateway_endpoint.clone(),
                experiment_id: execution.experiment_id.clone(),
                caller: context,
            },
        };

        match self.call(self.backend.execute(&spec)).await {
            Ok(()) => Ok(self
                .tracker
                .transition_execution(
                    &execution_id,
                    ExecutionState::Running,
                    None,
                    None,
                    current_time_millis(),
                )?
                .into_inner()),
            Err(err) => {
                tracing::warn!("Execution {} could not start: {}", execution_id, err);
                self.tracker.transition_execution(
                    &execution_id,
                    ExecutionState::Failed,
                    None,
                    Some(failure_for(&err)),
                    current_time_millis(),
                )?;
                Err(ConnectorError::from_backend(err))
            }
        }
    }

    /// Current record of an execution, refreshed from the backend while it
    /// is not terminal
    pub async fn status(&self, id: &ExecutionId) -> Result<Execution, ConnectorError> {
        let execution = self
            .tracker
            .execution(id)
            .ok_or_else(|| ConnectorError::ExecutionNotFound(id.clone()))?;
        if execution.state.is_terminal() {
            return Ok(execution);
        }

        match self.call(self.backend.query_execution(id)).await {
            Ok(status) => self.apply_execution_status(id, status),
            Err(err) => {
                tracing::warn!("Could not refresh execution {}: {}", id, err);
                Ok(self.tracker.execution(id).unwrap_or(execution))
            }
        }
    }

    /// Fold a backend observation into the execution record
    pub(crate) fn apply_execution_status(
        &self,
        id: &ExecutionId,
        status: BackendStatus,
    ) -> Result<Execution, ConnectorError> {
        let (next, result, failure) = match status {
            BackendStatus::Unknown => {
                return self
                    .tracker
                    .execution(id)
                    .ok_or_else(|| ConnectorError::ExecutionNotFound(id.clone()));
            }
            BackendStatus::Running => (ExecutionState::Running, None, None),
            BackendStatus::Finished(output) => (
                ExecutionState::Finished,
                Some(ExecutionResult::Success(output)),
                None,
            ),
            BackendStatus::Failed(message) => (
                ExecutionState::Failed,
                Some(ExecutionResult::Failure(message.clone())),
                Some(Failure::new(FailureReason::BackendError, message)),
            ),
            BackendStatus::Cancelled => (ExecutionState::Cancelled, None, None),
        };

        Ok(self
            .tracker
            .transition_execution(id, next, result, failure, current_time_millis())?
            .into_inner())
    }

    /// Ask the backend to stop an execution.
    ///
    /// The record becomes CANCELLED only once the backend acknowledges. An
    /// execution that already reached a terminal state is returned as is.
    pub async fn cancel(&self, id: &ExecutionId) -> Result<Execution, ConnectorError> {
        self.cancel_with_context(id, OperationContext::new()).await
    }

    /// [`cancel`](Self::cancel) with a caller context handed to the backend
    pub async fn cancel_with_context(
        &self,
        id: &ExecutionId,
        context: OperationContext,
    ) -> Result<Execution, ConnectorError> {
        let execution = self.status(id).await?;
        if execution.state.is_terminal() {
            return Ok(execution);
        }

        if let Err(err) = self
            .call(self.backend.cancel(id, &execution.node_id, &context))
            .await
        {
            // The run may have ended between the status read and the cancel
            let current = self.status(id).await?;
            if current.state.is_terminal() {
                tracing::debug!("Execution {} ended before cancellation: {}", id, err);
                return Ok(current);
            }
            tracing::warn!("Cancellation of {} was not acknowledged: {}", id, err);
            return Err(ConnectorError::from_backend(err));
        }

        let outcome = self.tracker.transition_execution(
            id,
            ExecutionState::Cancelled,
            None,
            None,
            current_time_millis(),
        )?;
        if !outcome.is_applied() {
            tracing::debug!("Execution {} ended before cancellation landed", id);
        }
        Ok(outcome.into_inner())
    }

    /// Result envelope of a terminal execution
    pub async fn result(&self, id: &ExecutionId) -> Result<ExecutionResult, ConnectorError> {
        let _pin = self
            .tracker
            .pin(id)
            .ok_or_else(|| ConnectorError::ExecutionNotFound(id.clone()))?;

        let execution = self.status(id).await?;
        match execution.state {
            ExecutionState::Finished => Ok(execution
                .result
                .unwrap_or(ExecutionResult::Success(Value::Null))),
            ExecutionState::Failed => Ok(match execution.result {
                Some(result) => result,
                None => ExecutionResult::Failure(
                    execution
                        .failure
                        .map(|f| f.to_string())
                        .unwrap_or_else(|| "execution failed".to_string()),
                ),
            }),
            ExecutionState::Cancelled => Ok(ExecutionResult::Failure("cancelled".to_string())),
            state => Err(ConnectorError::ResultNotReady {
                execution: id.clone(),
                state,
            }),
        }
    }

    // ---- nodes ----

    /// Return a node to the pool once its deployment has no live execution
    pub async fn release_node(&self, node_id: &NodeId) -> Result<Node, ConnectorError> {
        let outcome = self.tracker.release_node(node_id, current_time_millis())?;

        if let Some(deployment_id) = &outcome.released_deployment {
            if let Err(e) = self.call(self.backend.cleanup(deployment_id, node_id)).await {
                tracing::warn!(
                    "Cleanup of deployment {} on node {} failed: {}",
                    deployment_id,
                    node_id,
                    e
                );
            }
        }

        Ok(outcome.node)
    }
}
