//! Periodic reconciliation
//!
//! Corrects tracker drift against what the backend can observe:
//! - the node inventory is refreshed,
//! - deployments and executions stuck in a non-terminal state for longer
//!   than `stuck_age` are re-polled, and failed with
//!   `ReconciliationTimeout` when the backend has no record of them;
//!   records whose backend call is still in flight are left alone,
//! - terminal records older than `retention` are evicted,
//! - the journal, if any, is compacted once it has grown.
//!
//! A backend that cannot be reached leaves records untouched until the
//! next pass.

use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use nc_core::time::current_time_millis;
use nc_core::types::{Deployment, DeploymentState, ExecutionState, Failure, FailureReason};
use nc_core::{BackendStatus, ConnectorError};

use crate::adapter::Connector;
use crate::tracker::{EvictionStats, InventoryChange};

/// How a stuck deployment was settled
enum Settled {
    Untouched,
    Succeeded,
    Failed(FailureReason),
}

/// What one reconciliation pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// None when the inventory could not be refreshed
    pub inventory: Option<InventoryChange>,
    pub deployments_checked: usize,
    pub deployments_resolved: usize,
    pub deployments_timed_out: usize,
    pub executions_checked: usize,
    pub executions_resolved: usize,
    pub executions_timed_out: usize,
    pub evicted: EvictionStats,
    pub journal_compacted: bool,
}

impl ReconcileReport {
    fn changed_anything(&self) -> bool {
        self.deployments_resolved + self.deployments_timed_out > 0
            || self.executions_resolved + self.executions_timed_out > 0
            || self.evicted != EvictionStats::default()
            || self.journal_compacted
            || self
                .inventory
                .as_ref()
                .map(|c| c != &InventoryChange::default())
                .unwrap_or(false)
    }
}

/// Run reconciliation every `reconcile_interval` until cancelled
pub async fn run_reconciliation(connector: Arc<Connector>, cancel: CancellationToken) {
    let period = connector.config().reconcile_interval;
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(
        "Starting reconciliation task (interval: {:?}, stuck age: {:?}, retention: {:?})",
        period,
        connector.config().stuck_age,
        connector.config().retention
    );

    // The first tick completes immediately; initialize() already synced
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = reconcile_once(&connector).await {
                    tracing::error!("Reconciliation pass failed: {}", e);
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Reconciliation task shutting down");
                break;
            }
        }
    }
}

/// One reconciliation pass
pub async fn reconcile_once(connector: &Connector) -> Result<ReconcileReport, ConnectorError> {
    let mut report = ReconcileReport::default();

    match connector.refresh_inventory().await {
        Ok(change) => report.inventory = Some(change),
        Err(ConnectorError::Journal(e)) => return Err(ConnectorError::Journal(e)),
        Err(e) => tracing::warn!("Inventory refresh skipped: {}", e),
    }

    let stuck_age = connector.config().stuck_age;
    let now = current_time_millis();

    for deployment in connector.tracker().stuck_deployments(stuck_age, now) {
        if connector.is_deploying(&deployment.id) {
            continue;
        }
        report.deployments_checked += 1;
        match reconcile_deployment(connector, &deployment).await? {
            Settled::Untouched => {}
            Settled::Failed(FailureReason::ReconciliationTimeout) => {
                report.deployments_timed_out += 1
            }
            Settled::Succeeded | Settled::Failed(_) => report.deployments_resolved += 1,
        }
    }

    for execution in connector.tracker().stuck_executions(stuck_age, now) {
        if connector.is_starting(&execution.id) {
            continue;
        }
        report.executions_checked += 1;
        let status = match connector
            .call(connector.backend().query_execution(&execution.id))
            .await
        {
            Ok(status) => status,
            Err(e) => {
                tracing::debug!("Execution {} left for the next pass: {}", execution.id, e);
                continue;
            }
        };

        if status == BackendStatus::Unknown {
            let outcome = connector.tracker().transition_execution(
                &execution.id,
                ExecutionState::Failed,
                None,
                Some(Failure::new(
                    FailureReason::ReconciliationTimeout,
                    format!("backend has no record after {:?} in {}", stuck_age, execution.state),
                )),
                current_time_millis(),
            )?;
            if outcome.is_applied() {
                tracing::warn!(
                    reason = %FailureReason::ReconciliationTimeout,
                    "Execution {} stuck in {} with no backend record, marked failed",
                    execution.id,
                    execution.state
                );
                report.executions_timed_out += 1;
            }
            continue;
        }

        if connector
            .apply_execution_status(&execution.id, status)?
            .state
            .is_terminal()
        {
            report.executions_resolved += 1;
        }
    }

    report.evicted = connector
        .tracker()
        .evict_expired(connector.config().retention, current_time_millis())?;
    report.journal_compacted = connector.tracker().compact_journal_if_grown()?;

    if report.changed_anything() {
        tracing::info!(
            "Reconciliation: {} deployments resolved, {} timed out; {} executions resolved, {} timed out; evicted {} executions, {} deployments",
            report.deployments_resolved,
            report.deployments_timed_out,
            report.executions_resolved,
            report.executions_timed_out,
            report.evicted.executions,
            report.evicted.deployments
        );
    } else {
        tracing::trace!(
            "Reconciliation: checked {} deployments, {} executions, nothing to do",
            report.deployments_checked,
            report.executions_checked
        );
    }

    Ok(report)
}

async fn reconcile_deployment(
    connector: &Connector,
    deployment: &Deployment,
) -> Result<Settled, ConnectorError> {
    let tracker = connector.tracker();
    let status = match connector
        .call(connector.backend().deployment_status(&deployment.id))
        .await
    {
        Ok(status) => status,
        Err(e) => {
            tracing::debug!("Deployment {} left for the next pass: {}", deployment.id, e);
            return Ok(Settled::Untouched);
        }
    };

    let failure = match status {
        BackendStatus::Running => return Ok(Settled::Untouched),
        BackendStatus::Finished(_) => {
            let now = current_time_millis();
            if deployment.state == DeploymentState::Pending {
                tracker.transition_deployment(&deployment.id, DeploymentState::InProgress, None, now)?;
            }
            let outcome =
                tracker.transition_deployment(&deployment.id, DeploymentState::Succeeded, None, now)?;
            return Ok(if outcome.is_applied() {
                Settled::Succeeded
            } else {
                Settled::Untouched
            });
        }
        BackendStatus::Unknown => Failure::new(
            FailureReason::ReconciliationTimeout,
            format!(
                "backend has no record after {:?} in {}",
                connector.config().stuck_age,
                deployment.state
            ),
        ),
        BackendStatus::Failed(message) => Failure::new(FailureReason::BackendError, message),
        BackendStatus::Cancelled => {
            Failure::new(FailureReason::BackendError, "deployment cancelled by backend")
        }
    };

    let reason = failure.reason;
    let now = current_time_millis();
    let outcome =
        tracker.transition_deployment(&deployment.id, DeploymentState::Failed, Some(failure), now)?;
    if !outcome.is_applied() {
        return Ok(Settled::Untouched);
    }
    tracker.free_node(&deployment.node_id, &deployment.id, now)?;

    if reason == FailureReason::ReconciliationTimeout {
        tracing::warn!(
            reason = %reason,
            "Deployment {} stuck in {} with no backend record, marked failed",
            deployment.id,
            deployment.state
        );
    }
    Ok(Settled::Failed(reason))
}
