//! Local shell backend
//!
//! Exposes the host as a single node. A deployment payload is a JSON object:
//!
//! ```json
//! {
//!   "commands": ["pip install -r requirements.txt"],
//!   "run": "python experiment.py",
//!   "env": {"MODE": "fast"},
//!   "cleanup": ["rm -rf /tmp/experiment"]
//! }
//! ```
//!
//! `commands` run in order at deploy time, `run` is spawned per execution
//! with the execution context exported, `cleanup` runs when the node is
//! released. Every field is optional except `run`, which `execute` needs.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use nc_core::config::ShellBackendConfig;
use nc_core::types::{DeploymentId, ExecutionId, NodeId, OperationContext};
use nc_core::{Backend, BackendError, BackendStatus, DeploymentSpec, ExecutionSpec, NodeDescriptor};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ShellPayload {
    commands: Vec<String>,
    run: Option<String>,
    env: BTreeMap<String, String>,
    cleanup: Vec<String>,
}

impl ShellPayload {
    fn parse(payload: &Value) -> Result<Self, BackendError> {
        if payload.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(payload.clone())
            .map_err(|e| BackendError::Rejected(format!("invalid shell payload: {}", e)))
    }
}

struct ShellRun {
    deployment_id: DeploymentId,
    status: BackendStatus,
    cancel: CancellationToken,
}

pub struct ShellBackend {
    config: ShellBackendConfig,
    node_id: NodeId,
    deployments: DashMap<DeploymentId, ShellPayload>,
    runs: Arc<DashMap<ExecutionId, ShellRun>>,
}

impl ShellBackend {
    pub fn new(config: ShellBackendConfig) -> Self {
        let node_id = NodeId::new(config.node_id.clone());
        Self {
            config,
            node_id,
            deployments: DashMap::new(),
            runs: Arc::new(DashMap::new()),
        }
    }

    fn command(&self, line: &str) -> Command {
        let mut command = Command::new(&self.config.shell);
        command.arg("-c").arg(line).stdin(Stdio::null());
        command
    }

    /// Run one command to completion, failing on a non-zero exit
    async fn run_checked(&self, line: &str) -> Result<String, BackendError> {
        let output = self
            .command(line)
            .output()
            .await
            .map_err(|e| BackendError::Internal(format!("failed to spawn `{}`: {}", line, e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(BackendError::Rejected(format!(
                "`{}` exited with {}: {}",
                line,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    fn check_node(&self, node_id: &NodeId) -> Result<(), BackendError> {
        if node_id != &self.node_id {
            return Err(BackendError::Rejected(format!(
                "shell backend only serves node {}",
                self.node_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for ShellBackend {
    fn name(&self) -> &str {
        "shell"
    }

    async fn health(&self) -> Result<String, BackendError> {
        self.run_checked("true")
            .await
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;
        Ok(format!("{} available on {}", self.config.shell, self.node_id))
    }

    async fn list_nodes(&self) -> Result<Vec<NodeDescriptor>, BackendError> {
        let mut node = NodeDescriptor::new(self.node_id.clone())
            .with_tag("arch", std::env::consts::ARCH)
            .with_tag("os", std::env::consts::OS);
        node.tags
            .extend(self.config.tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(vec![node])
    }

    async fn deploy(&self, spec: &DeploymentSpec) -> Result<(), BackendError> {
        self.check_node(&spec.node_id)?;
        let payload = ShellPayload::parse(&spec.payload)?;

        for line in &payload.commands {
            tracing::debug!("Deployment {}: running `{}`", spec.id, line);
            self.run_checked(line).await?;
        }

        self.deployments.insert(spec.id.clone(), payload);
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
        self.check_node(&spec.node_id)?;
        let payload = self
            .deployments
            .get(&spec.deployment_id)
            .map(|p| p.clone())
            .ok_or_else(|| {
                BackendError::Rejected(format!("deployment {} is not prepared", spec.deployment_id))
            })?;
        let run = payload.run.clone().ok_or_else(|| {
            BackendError::Rejected("deployment payload has no `run` command".to_string())
        })?;

        let mut command = self.command(&run);
        command
            .envs(spec.context.environment(&spec.id))
            .envs(payload.env.iter())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| BackendError::Internal(format!("failed to spawn `{}`: {}", run, e)))?;

        let cancel = CancellationToken::new();
        self.runs.insert(
            spec.id.clone(),
            ShellRun {
                deployment_id: spec.deployment_id.clone(),
                status: BackendStatus::Running,
                cancel: cancel.clone(),
            },
        );

        let runs = Arc::clone(&self.runs);
        let id = spec.id.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                output = child.wait_with_output() => match output {
                    Ok(output) if output.status.success() => BackendStatus::Finished(json!({
                        "stdout": String::from_utf8_lossy(&output.stdout),
                        "exit_code": output.status.code(),
                    })),
                    Ok(output) => BackendStatus::Failed(format!(
                        "exited with {}: {}",
                        output.status,
                        String::from_utf8_lossy(&output.stderr).trim()
                    )),
                    Err(e) => BackendStatus::Failed(format!("failed to wait for process: {}", e)),
                },
                // Dropping the child kills it
                _ = cancel.cancelled() => BackendStatus::Cancelled,
            };

            if let Some(mut run) = runs.get_mut(&id) {
                if !run.status.is_terminal() {
                    tracing::debug!("Shell execution {} ended: {:?}", id, status);
                    run.status = status;
                }
            }
        });

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
        if run.status == BackendStatus::Cancelled {
            return Ok(());
        }
        if run.status.is_terminal() {
            return Err(BackendError::Rejected(format!(
                "execution {} already ended",
                id
            )));
        }

        tracing::debug!("Cancelling shell execution {} ({:?})", id, context);
        run.cancel.cancel();
        run.status = BackendStatus::Cancelled;
        Ok(())
    }

    async fn query_execution(&self, id: &ExecutionId) -> Result<BackendStatus, BackendError> {
        Ok(self
            .runs
            .get(id)
            .map(|run| run.status.clone())
            .unwrap_or(BackendStatus::Unknown))
    }

    async fn cleanup(&self, id: &DeploymentId, _node_id: &NodeId) -> Result<(), BackendError> {
        self.runs.retain(|_, run| {
            if &run.deployment_id != id {
                return true;
            }
            run.cancel.cancel();
            false
        });

        let Some((_, payload)) = self.deployments.remove(id) else {
            return Ok(());
        };
        for line in &payload.cleanup {
            if let Err(e) = self.run_checked(line).await {
                tracing::warn!("Cleanup of deployment {} failed: {}", id, e);
            }
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BackendError> {
        for run in self.runs.iter() {
            run.cancel.cancel();
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use nc_core::traits::EXECUTOR_ID_ENV;
    use nc_core::ExecutionContext;
    use std::time::Duration;

    fn backend() -> ShellBackend {
        ShellBackend::new(ShellBackendConfig::default())
    }

    fn deployment(payload: Value) -> DeploymentSpec {
        DeploymentSpec {
            id: DeploymentId::new("d1"),
            node_id: NodeId::new("local"),
            payload,
            context: OperationContext::new(),
        }
    }

    fn execution(id: &str) -> ExecutionSpec {
        ExecutionSpec {
            id: ExecutionId::new(id),
            deployment_id: DeploymentId::new("d1"),
            node_id: NodeId::new("local"),
            payload: Value::Null,
            context: ExecutionContext {
                gateway_endpoint: "http://gateway".to_string(),
                experiment_id: Some("exp-1".to_string()),
                ..Default::default()
            },
        }
    }

    async fn wait_terminal(backend: &ShellBackend, id: &ExecutionId) -> BackendStatus {
        for _ in 0..200 {
            let status = backend.query_execution(id).await.unwrap();
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("execution {} did not finish", id);
    }

    #[tokio::test]
    async fn test_single_local_node_with_host_tags() {
        let nodes = backend().list_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, NodeId::new("local"));
        assert_eq!(
            nodes[0].tags.get("os").map(String::as_str),
            Some(std::env::consts::OS)
        );
    }

    #[tokio::test]
    async fn test_failing_deploy_command_is_rejected() {
        let backend = backend();
        let err = backend
            .deploy(&deployment(json!({"commands": ["exit 3"]})))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Rejected(_)));
        assert_eq!(
            backend.deployment_status(&DeploymentId::new("d1")).await.unwrap(),
            BackendStatus::Unknown
        );
    }

    #[tokio::test]
    async fn test_execution_sees_context_and_env() {
        let backend = backend();
        backend
            .deploy(&deployment(json!({
                "commands": ["true"],
                "run": format!("echo ${}-$MODE", EXECUTOR_ID_ENV),
                "env": {"MODE": "fast"},
            })))
            .await
            .unwrap();
        backend.execute(&execution("e1")).await.unwrap();

        let status = wait_terminal(&backend, &ExecutionId::new("e1")).await;
        let BackendStatus::Finished(output) = status else {
            panic!("expected success, got {:?}", status);
        };
        assert_eq!(output["stdout"], "e1-fast\n");
        assert_eq!(output["exit_code"], 0);
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails_execution() {
        let backend = backend();
        backend
            .deploy(&deployment(json!({"run": "echo broken >&2; exit 1"})))
            .await
            .unwrap();
        backend.execute(&execution("e1")).await.unwrap();

        let status = wait_terminal(&backend, &ExecutionId::new("e1")).await;
        let BackendStatus::Failed(message) = status else {
            panic!("expected failure, got {:?}", status);
        };
        assert!(message.contains("broken"));
    }

    #[tokio::test]
    async fn test_cancel_stops_execution() {
        let backend = backend();
        backend
            .deploy(&deployment(json!({"run": "sleep 30"})))
            .await
            .unwrap();
        backend.execute(&execution("e1")).await.unwrap();

        let id = ExecutionId::new("e1");
        backend
            .cancel(&id, &NodeId::new("local"), &OperationContext::new())
            .await
            .unwrap();
        assert_eq!(backend.query_execution(&id).await.unwrap(), BackendStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_after_exit_is_refused() {
        let backend = backend();
        backend
            .deploy(&deployment(json!({"run": "true"})))
            .await
            .unwrap();
        backend.execute(&execution("e1")).await.unwrap();

        let id = ExecutionId::new("e1");
        wait_terminal(&backend, &id).await;
        assert!(matches!(
            backend
                .cancel(&id, &NodeId::new("local"), &OperationContext::new())
                .await,
            Err(BackendError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_forgets_runs_of_deployment() {
        let backend = backend();
        backend
            .deploy(&deployment(json!({"run": "sleep 30"})))
            .await
            .unwrap();
        backend.execute(&execution("e1")).await.unwrap();

        backend
            .cleanup(&DeploymentId::new("d1"), &NodeId::new("local"))
            .await
            .unwrap();
        assert!(backend.runs.is_empty());
        assert_eq!(
            backend.query_execution(&ExecutionId::new("e1")).await.unwrap(),
            BackendStatus::Unknown
        );
    }

    #[tokio::test]
    async fn test_execute_without_run_command() {
        let backend = backend();
        backend.deploy(&deployment(Value::Null)).await.unwrap();
        assert!(matches!(
            backend.execute(&execution("e1")).await,
            Err(BackendError::Rejected(_))
        ));
    }
}
