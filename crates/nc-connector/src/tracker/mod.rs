//! Execution state tracker
//!
//! Keyed registry of nodes, deployments and executions. Each namespace is a
//! `DashMap`, so writers are serialized per entity by the map's entry locks
//! and readers never wait behind work on an unrelated entity.
//!
//! Lock order is Node -> Deployment -> Execution. No entry guard is ever held
//! across an `.await`; every method here is synchronous and callers pass the
//! current time in.

mod journal;

pub use journal::{Journal, Replayed};

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;

use nc_core::time::is_older_than;
use nc_core::types::{
    Deployment, DeploymentId, DeploymentState, Execution, ExecutionId, ExecutionResult,
    ExecutionState, Failure, Node, NodeFilter, NodeId, NodeState,
};
use nc_core::{ConnectorError, NodeDescriptor};

use journal::EntryRef;

/// Appended journal lines below which a running tracker never compacts
const JOURNAL_COMPACT_MIN_LINES: usize = 1024;

/// Outcome of a guarded state change
#[derive(Debug, Clone, PartialEq)]
pub enum Transition<T> {
    /// The record moved to the requested state
    Applied(T),
    /// The transition was not allowed; the current record is returned as is
    Unchanged(T),
}

impl<T> Transition<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Transition::Applied(t) | Transition::Unchanged(t) => t,
        }
    }
}

/// Result of binding an execution id to a deployment
#[derive(Debug, Clone)]
pub enum Bound {
    /// The id was already bound to this deployment
    Existing(Execution),
    /// A new SCHEDULED record was created
    Created {
        execution: Execution,
        /// Payload of the deployment, handed to the backend
        payload: Value,
    },
}

/// Counts from merging a backend inventory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InventoryChange {
    pub added: usize,
    pub lost: usize,
    pub restored: usize,
}

/// Result of releasing a node
#[derive(Debug, Clone)]
pub struct ReleaseOutcome {
    pub node: Node,
    /// Deployment that held the node, if any
    pub released_deployment: Option<DeploymentId>,
}

/// Counts from one eviction sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionStats {
    pub executions: usize,
    pub deployments: usize,
}

/// Registry of connector records
pub struct Tracker {
    nodes: DashMap<NodeId, Node>,
    deployments: DashMap<DeploymentId, Deployment>,
    executions: DashMap<ExecutionId, Execution>,
    /// Executions referenced by an in-flight result read
    pins: DashMap<ExecutionId, usize>,
    /// Last successful inventory refresh (0 = never)
    inventory_refreshed_at: AtomicU64,
    journal: Option<Journal>,
}

impl Tracker {
    /// Create an in-memory tracker
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            deployments: DashMap::new(),
            executions: DashMap::new(),
            pins: DashMap::new(),
            inventory_refreshed_at: AtomicU64::new(0),
            journal: None,
        }
    }

    /// Create a tracker, replaying the journal at `journal_path` if given
    pub fn open(journal_path: Option<&Path>) -> Result<Self, ConnectorError> {
        let mut tracker = Self::new();

        if let Some(path) = journal_path {
            let (journal, replayed) = Journal::open(path)?;
            for node in replayed.nodes {
                tracker.nodes.insert(node.id.clone(), node);
            }
            for deployment in replayed.deployments {
                tracker.deployments.insert(deployment.id.clone(), deployment);
            }
            for execution in replayed.executions {
                tracker.executions.insert(execution.id.clone(), execution);
            }
            tracker.journal = Some(journal);
        }

        Ok(tracker)
    }

    fn persist(&self, entry: EntryRef<'_>) -> Result<(), ConnectorError> {
        if let Some(journal) = &self.journal {
            journal.append(&entry)?;
        }
        Ok(())
    }

    // ---- nodes ----

    /// Merge a backend inventory into the node registry.
    ///
    /// Nodes the backend no longer reports become UNREACHABLE but keep their
    /// deployment; returning nodes go back to AVAILABLE or BUSY.
    pub fn merge_inventory(
        &self,
        descriptors: Vec<NodeDescriptor>,
        now: u64,
    ) -> Result<InventoryChange, ConnectorError> {
        let mut change = InventoryChange::default();
        let mut seen = HashSet::with_capacity(descriptors.len());

        for descriptor in descriptors {
            seen.insert(descriptor.id.clone());

            match self.nodes.entry(descriptor.id.clone()) {
                Entry::Vacant(slot) => {
                    let node = Node::new(descriptor.id, descriptor.tags, now);
                    self.persist(EntryRef::Node(&node))?;
                    tracing::info!("Discovered node {}", node.id);
                    slot.insert(node);
                    change.added += 1;
                }
                Entry::Occupied(mut slot) => {
                    let current = slot.get();
                    let restoring = current.state == NodeState::Unreachable;
                    if !restoring && current.tags == descriptor.tags {
                        continue;
                    }

                    let mut updated = current.clone();
                    updated.tags = descriptor.tags;
                    if restoring {
                        updated.state = if updated.deployment.is_some() {
                            NodeState::Busy
                        } else {
                            NodeState::Available
                        };
                        tracing::info!("Node {} is reachable again ({})", updated.id, updated.state);
                        change.restored += 1;
                    }
                    updated.updated_at = now;
                    self.persist(EntryRef::Node(&updated))?;
                    *slot.get_mut() = updated;
                }
            }
        }

        let missing: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|n| !seen.contains(n.key()) && n.state != NodeState::Unreachable)
            .map(|n| n.key().clone())
            .collect();

        for id in missing {
            if let Some(mut node) = self.nodes.get_mut(&id) {
                if node.state == NodeState::Unreachable {
                    continue;
                }
                let mut updated = node.clone();
                updated.state = NodeState::Unreachable;
                updated.updated_at = now;
                self.persist(EntryRef::Node(&updated))?;
                tracing::warn!("Node {} no longer reported by backend", id);
                *node = updated;
                change.lost += 1;
            }
        }

        self.inventory_refreshed_at.store(now, Ordering::SeqCst);
        Ok(change)
    }

    pub fn node(&self, id: &NodeId) -> Option<Node> {
        self.nodes.get(id).map(|n| n.clone())
    }

    /// Snapshot of the nodes matching `filter`, ordered by id
    pub fn nodes_snapshot(&self, filter: &NodeFilter) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .nodes
            .iter()
            .filter(|n| filter.matches(n.value()))
            .map(|n| n.value().clone())
            .collect();
        nodes.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        nodes
    }

    /// Time of the last successful inventory merge
    pub fn inventory_refreshed_at(&self) -> Option<u64> {
        match self.inventory_refreshed_at.load(Ordering::SeqCst) {
            0 => None,
            at => Some(at),
        }
    }

    /// Reserve an AVAILABLE node for a new deployment.
    ///
    /// The node check and the BUSY mark happen under the node's entry lock,
    /// so of two concurrent reservations exactly one succeeds.
    pub fn reserve_node(&self, deployment: Deployment, now: u64) -> Result<Deployment, ConnectorError> {
        let node_id = deployment.node_id.clone();
        let mut node = self
            .nodes
            .get_mut(&node_id)
            .ok_or_else(|| ConnectorError::NodeNotFound(node_id.clone()))?;

        if node.state != NodeState::Available {
            return Err(ConnectorError::NodeBusy {
                node: node_id,
                state: node.state,
            });
        }

        let mut updated = node.clone();
        updated.state = NodeState::Busy;
        updated.deployment = Some(deployment.id.clone());
        updated.updated_at = now;

        self.persist(EntryRef::Deployment(&deployment))?;
        self.persist(EntryRef::Node(&updated))?;

        self.deployments.insert(deployment.id.clone(), deployment.clone());
        *node = updated;

        tracing::debug!("Node {} reserved for deployment {}", node_id, deployment.id);
        Ok(deployment)
    }

    /// Return a node held by `deployment_id` to the pool.
    ///
    /// Does nothing if the node is held by another deployment.
    pub fn free_node(
        &self,
        node_id: &NodeId,
        deployment_id: &DeploymentId,
        now: u64,
    ) -> Result<(), ConnectorError> {
        let Some(mut node) = self.nodes.get_mut(node_id) else {
            return Ok(());
        };
        if node.deployment.as_ref() != Some(deployment_id) {
            return Ok(());
        }

        let mut updated = node.clone();
        updated.deployment = None;
        if updated.state == NodeState::Busy {
            updated.state = NodeState::Available;
        }
        updated.updated_at = now;
        self.persist(EntryRef::Node(&updated))?;
        *node = updated;

        tracing::debug!("Node {} freed by deployment {}", node_id, deployment_id);
        Ok(())
    }

    /// Release a node once its deployment has no work in flight
    pub fn release_node(&self, node_id: &NodeId, now: u64) -> Result<ReleaseOutcome, ConnectorError> {
        let mut node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| ConnectorError::NodeNotFound(node_id.clone()))?;

        let Some(deployment_id) = node.deployment.clone() else {
            return Ok(ReleaseOutcome {
                node: node.clone(),
                released_deployment: None,
            });
        };

        if let Some(mut deployment) = self.deployments.get_mut(&deployment_id) {
            if !deployment.state.is_terminal() {
                return Err(ConnectorError::NodeStillBusy {
                    node: node_id.clone(),
                    reason: format!("deployment {} is {}", deployment_id, deployment.state),
                });
            }

            if let Some(active) = self.active_execution(&deployment_id) {
                return Err(ConnectorError::NodeStillBusy {
                    node: node_id.clone(),
                    reason: format!("execution {} is {}", active.id, active.state),
                });
            }

            if !deployment.released {
                let mut updated = deployment.clone();
                updated.released = true;
                updated.updated_at = now;
                self.persist(EntryRef::Deployment(&updated))?;
                *deployment = updated;
            }
        }

        let mut updated = node.clone();
        updated.deployment = None;
        if updated.state == NodeState::Busy {
            updated.state = NodeState::Available;
        }
        updated.updated_at = now;
        self.persist(EntryRef::Node(&updated))?;
        *node = updated.clone();

        tracing::info!("Node {} released from deployment {}", node_id, deployment_id);
        Ok(ReleaseOutcome {
            node: updated,
            released_deployment: Some(deployment_id),
        })
    }

    // ---- deployments ----

    pub fn deployment(&self, id: &DeploymentId) -> Option<Deployment> {
        self.deployments.get(id).map(|d| d.clone())
    }

    /// Move a deployment along its state machine
    pub fn transition_deployment(
        &self,
        id: &DeploymentId,
        next: DeploymentState,
        failure: Option<Failure>,
        now: u64,
    ) -> Result<Transition<Deployment>, ConnectorError> {
        let mut deployment = self
            .deployments
            .get_mut(id)
            .ok_or_else(|| ConnectorError::DeploymentNotFound(id.clone()))?;

        if !deployment.state.can_transition_to(next) {
            tracing::debug!(
                "Deployment {} stays {} (requested {})",
                id,
                deployment.state,
                next
            );
            return Ok(Transition::Unchanged(deployment.clone()));
        }

        let mut updated = deployment.clone();
        updated.state = next;
        if failure.is_some() {
            updated.failure = failure;
        }
        updated.updated_at = now;
        self.persist(EntryRef::Deployment(&updated))?;
        *deployment = updated.clone();

        tracing::info!("Deployment {} -> {}", id, next);
        Ok(Transition::Applied(updated))
    }

    /// Deployments still PENDING or IN_PROGRESS after `stuck_age`
    pub fn stuck_deployments(&self, stuck_age: Duration, now: u64) -> Vec<Deployment> {
        self.deployments
            .iter()
            .filter(|d| !d.state.is_terminal() && is_older_than(d.updated_at, stuck_age, now))
            .map(|d| d.value().clone())
            .collect()
    }

    // ---- executions ----

    pub fn execution(&self, id: &ExecutionId) -> Option<Execution> {
        self.executions.get(id).map(|e| e.clone())
    }

    fn active_execution(&self, deployment_id: &DeploymentId) -> Option<Execution> {
        self.executions
            .iter()
            .find(|e| &e.deployment_id == deployment_id && !e.state.is_terminal())
            .map(|e| e.value().clone())
    }

    fn existing_binding(
        existing: &Execution,
        deployment_id: &DeploymentId,
    ) -> Result<Bound, ConnectorError> {
        if &existing.deployment_id == deployment_id {
            Ok(Bound::Existing(existing.clone()))
        } else {
            Err(ConnectorError::ExecutionConflict {
                execution: existing.id.clone(),
                reason: format!("already bound to deployment {}", existing.deployment_id),
            })
        }
    }

    /// Bind an execution id to a deployment.
    ///
    /// Repeating a bind with the same pair returns the existing record. The
    /// deployment's entry lock serializes binds on one deployment.
    pub fn bind_execution(
        &self,
        deployment_id: &DeploymentId,
        execution_id: &ExecutionId,
        experiment_id: Option<String>,
        now: u64,
    ) -> Result<Bound, ConnectorError> {
        if let Some(existing) = self.executions.get(execution_id) {
            return Self::existing_binding(&existing, deployment_id);
        }

        let not_ready = |reason: String| ConnectorError::DeploymentNotReady {
            deployment: deployment_id.clone(),
            reason,
        };

        let deployment = self
            .deployments
            .get_mut(deployment_id)
            .ok_or_else(|| not_ready("unknown deployment".to_string()))?;

        if deployment.state != DeploymentState::Succeeded {
            return Err(not_ready(format!("deployment is {}", deployment.state)));
        }
        if deployment.released {
            return Err(not_ready("deployment was released".to_string()));
        }

        if let Some(active) = self.active_execution(deployment_id) {
            if &active.id != execution_id {
                return Err(ConnectorError::ExecutionConflict {
                    execution: execution_id.clone(),
                    reason: format!("deployment is bound to execution {}", active.id),
                });
            }
        }

        match self.executions.entry(execution_id.clone()) {
            Entry::Occupied(slot) => Self::existing_binding(slot.get(), deployment_id),
            Entry::Vacant(slot) => {
                let execution = Execution {
                    id: execution_id.clone(),
                    deployment_id: deployment_id.clone(),
                    node_id: deployment.node_id.clone(),
                    experiment_id,
                    state: ExecutionState::Scheduled,
                    result: None,
                    failure: None,
                    created_at: now,
                    started_at: None,
                    finished_at: None,
                    updated_at: now,
                };
                self.persist(EntryRef::Execution(&execution))?;
                slot.insert(execution.clone());

                tracing::info!(
                    "Execution {} scheduled on deployment {}",
                    execution_id,
                    deployment_id
                );
                Ok(Bound::Created {
                    execution,
                    payload: deployment.payload.clone(),
                })
            }
        }
    }

    /// Move an execution along its state machine.
    ///
    /// RUNNING is only reachable while the deployment is SUCCEEDED.
    pub fn transition_execution(
        &self,
        id: &ExecutionId,
        next: ExecutionState,
        result: Option<ExecutionResult>,
        failure: Option<Failure>,
        now: u64,
    ) -> Result<Transition<Execution>, ConnectorError> {
        if next == ExecutionState::Running {
            let deployment_id = self
                .executions
                .get(id)
                .map(|e| e.deployment_id.clone())
                .ok_or_else(|| ConnectorError::ExecutionNotFound(id.clone()))?;
            let ready = self
                .deployments
                .get(&deployment_id)
                .map(|d| d.state == DeploymentState::Succeeded)
                .unwrap_or(false);
            if !ready {
                let current = self
                    .execution(id)
                    .ok_or_else(|| ConnectorError::ExecutionNotFound(id.clone()))?;
                return Ok(Transition::Unchanged(current));
            }
        }

        let mut execution = self
            .executions
            .get_mut(id)
            .ok_or_else(|| ConnectorError::ExecutionNotFound(id.clone()))?;

        if !execution.state.can_transition_to(next) {
            tracing::debug!(
                "Execution {} stays {} (requested {})",
                id,
                execution.state,
                next
            );
            return Ok(Transition::Unchanged(execution.clone()));
        }

        let mut updated = execution.clone();
        updated.state = next;
        if result.is_some() {
            updated.result = result;
        }
        if failure.is_some() {
            updated.failure = failure;
        }
        if next == ExecutionState::Running && updated.started_at.is_none() {
            updated.started_at = Some(now);
        }
        if next.is_terminal() {
            updated.finished_at = Some(now);
        }
        updated.updated_at = now;
        self.persist(EntryRef::Execution(&updated))?;
        *execution = updated.clone();

        tracing::info!("Execution {} -> {}", id, next);
        Ok(Transition::Applied(updated))
    }

    /// Executions still SCHEDULED or RUNNING after `stuck_age`
    pub fn stuck_executions(&self, stuck_age: Duration, now: u64) -> Vec<Execution> {
        self.executions
            .iter()
            .filter(|e| !e.state.is_terminal() && is_older_than(e.updated_at, stuck_age, now))
            .map(|e| e.value().clone())
            .collect()
    }

    /// Protect an execution from eviction until the guard is dropped
    pub fn pin(&self, id: &ExecutionId) -> Option<PinGuard<'_>> {
        // The execution read guard keeps eviction of this id out until the
        // pin count is visible.
        let _execution = self.executions.get(id)?;
        *self.pins.entry(id.clone()).or_insert(0) += 1;
        Some(PinGuard {
            tracker: self,
            id: id.clone(),
        })
    }

    fn is_pinned(&self, id: &ExecutionId) -> bool {
        self.pins.get(id).map(|count| *count > 0).unwrap_or(false)
    }

    // ---- retention ----

    /// Evict terminal records older than `retention`.
    ///
    /// Pinned executions are skipped. A deployment is only evicted once it
    /// failed or was released and no execution refers to it any more.
    pub fn evict_expired(&self, retention: Duration, now: u64) -> Result<EvictionStats, ConnectorError> {
        let mut stats = EvictionStats::default();

        let expired_executions: Vec<ExecutionId> = self
            .executions
            .iter()
            .filter(|e| e.state.is_terminal() && is_older_than(e.updated_at, retention, now))
            .map(|e| e.key().clone())
            .collect();

        for id in expired_executions {
            let removed = self.executions.remove_if(&id, |_, e| {
                e.state.is_terminal()
                    && is_older_than(e.updated_at, retention, now)
                    && !self.is_pinned(&e.id)
            });
            if removed.is_some() {
                self.persist(EntryRef::EvictExecution(&id))?;
                stats.executions += 1;
            }
        }

        let expired_deployments: Vec<DeploymentId> = self
            .deployments
            .iter()
            .filter(|d| {
                (d.state == DeploymentState::Failed || d.released)
                    && is_older_than(d.updated_at, retention, now)
            })
            .map(|d| d.key().clone())
            .collect();

        for id in expired_deployments {
            if self.executions.iter().any(|e| e.deployment_id == id) {
                continue;
            }
            if self.deployments.remove(&id).is_some() {
                self.persist(EntryRef::EvictDeployment(&id))?;
                stats.deployments += 1;
            }
        }

        if stats != EvictionStats::default() {
            tracing::debug!(
                "Evicted {} executions and {} deployments",
                stats.executions,
                stats.deployments
            );
        }
        Ok(stats)
    }

    /// Record counts (nodes, deployments, executions)
    pub fn counts(&self) -> (usize, usize, usize) {
        (self.nodes.len(), self.deployments.len(), self.executions.len())
    }

    // ---- journal ----

    /// Rewrite the journal from the current records.
    ///
    /// Lines appended while the snapshot is taken are carried over, so no
    /// write is lost. Returns false when the tracker has no journal.
    pub fn compact_journal(&self) -> Result<bool, ConnectorError> {
        let Some(journal) = &self.journal else {
            return Ok(false);
        };

        let since = journal.end_offset()?;
        let snapshot = Replayed {
            nodes: self.nodes.iter().map(|n| n.value().clone()).collect(),
            deployments: self.deployments.iter().map(|d| d.value().clone()).collect(),
            executions: self.executions.iter().map(|e| e.value().clone()).collect(),
        };
        journal.compact(&snapshot, since)?;

        tracing::debug!(
            "Compacted journal {:?} to {} nodes, {} deployments, {} executions",
            journal.path(),
            snapshot.nodes.len(),
            snapshot.deployments.len(),
            snapshot.executions.len()
        );
        Ok(true)
    }

    /// Compact once the lines appended since the last compaction outnumber
    /// twice the live records (and at least `JOURNAL_COMPACT_MIN_LINES`)
    pub fn compact_journal_if_grown(&self) -> Result<bool, ConnectorError> {
        let Some(journal) = &self.journal else {
            return Ok(false);
        };

        let (nodes, deployments, executions) = self.counts();
        let threshold = JOURNAL_COMPACT_MIN_LINES.max(2 * (nodes + deployments + executions));
        if journal.appended_since_compaction()? < threshold {
            return Ok(false);
        }
        self.compact_journal()
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps an execution from being evicted while a result read is in flight
pub struct PinGuard<'a> {
    tracker: &'a Tracker,
    id: ExecutionId,
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut count) = self.tracker.pins.get_mut(&self.id) {
            *count = count.saturating_sub(1);
        }
        self.tracker.pins.remove_if(&self.id, |_, count| *count == 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nc_core::types::FailureReason;
    use std::sync::Arc;

    fn tracker_with_nodes(ids: &[&str]) -> Tracker {
        let tracker = Tracker::new();
        let descriptors = ids.iter().map(|id| NodeDescriptor::new(*id)).collect();
        tracker.merge_inventory(descriptors, 1).unwrap();
        tracker
    }

    fn pending(id: &str, node: &str, now: u64) -> Deployment {
        Deployment {
            id: DeploymentId::new(id),
            node_id: NodeId::new(node),
            payload: serde_json::json!({"image": "alpine"}),
            state: DeploymentState::Pending,
            failure: None,
            released: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Reserve `node` and drive the deployment to SUCCEEDED
    fn deployed(tracker: &Tracker, id: &str, node: &str) -> DeploymentId {
        let deployment = tracker.reserve_node(pending(id, node, 2), 2).unwrap();
        tracker
            .transition_deployment(&deployment.id, DeploymentState::InProgress, None, 3)
            .unwrap();
        tracker
            .transition_deployment(&deployment.id, DeploymentState::Succeeded, None, 4)
            .unwrap();
        deployment.id
    }

    fn running(tracker: &Tracker, deployment: &DeploymentId, id: &str) -> ExecutionId {
        let id = ExecutionId::new(id);
        tracker.bind_execution(deployment, &id, None, 5).unwrap();
        tracker
            .transition_execution(&id, ExecutionState::Running, None, None, 6)
            .unwrap();
        id
    }

    #[test]
    fn test_reserve_marks_node_busy() {
        let tracker = tracker_with_nodes(&["n1"]);
        tracker.reserve_node(pending("d1", "n1", 2), 2).unwrap();

        let node = tracker.node(&NodeId::new("n1")).unwrap();
        assert_eq!(node.state, NodeState::Busy);
        assert_eq!(node.deployment, Some(DeploymentId::new("d1")));
        assert_eq!(
            tracker.deployment(&DeploymentId::new("d1")).unwrap().state,
            DeploymentState::Pending
        );
    }

    #[test]
    fn test_reserve_busy_node_leaves_it_unchanged() {
        let tracker = tracker_with_nodes(&["n1"]);
        tracker.reserve_node(pending("d1", "n1", 2), 2).unwrap();
        let before = tracker.node(&NodeId::new("n1")).unwrap();

        let err = tracker.reserve_node(pending("d2", "n1", 3), 3).unwrap_err();
        assert!(matches!(
            err,
            ConnectorError::NodeBusy {
                state: NodeState::Busy,
                ..
            }
        ));
        assert_eq!(tracker.node(&NodeId::new("n1")).unwrap(), before);
        assert!(tracker.deployment(&DeploymentId::new("d2")).is_none());
    }

    #[test]
    fn test_reserve_unknown_node() {
        let tracker = tracker_with_nodes(&["n1"]);
        let err = tracker.reserve_node(pending("d1", "nope", 2), 2).unwrap_err();
        assert!(matches!(err, ConnectorError::NodeNotFound(_)));
    }

    #[test]
    fn test_concurrent_reservations_yield_one_winner() {
        let tracker = Arc::new(tracker_with_nodes(&["n1"]));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    tracker.reserve_node(pending(&format!("d{}", i), "n1", 2), 2)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let wins = results.iter().filter(|r| r.is_ok()).count();
        let busy = results
            .iter()
            .filter(|r| matches!(r, Err(ConnectorError::NodeBusy { .. })))
            .count();
        assert_eq!(wins, 1);
        assert_eq!(busy, 7);
    }

    #[test]
    fn test_free_node_only_for_holder() {
        let tracker = tracker_with_nodes(&["n1"]);
        tracker.reserve_node(pending("d1", "n1", 2), 2).unwrap();

        tracker
            .free_node(&NodeId::new("n1"), &DeploymentId::new("other"), 3)
            .unwrap();
        assert_eq!(tracker.node(&NodeId::new("n1")).unwrap().state, NodeState::Busy);

        tracker
            .free_node(&NodeId::new("n1"), &DeploymentId::new("d1"), 3)
            .unwrap();
        let node = tracker.node(&NodeId::new("n1")).unwrap();
        assert_eq!(node.state, NodeState::Available);
        assert!(node.deployment.is_none());
    }

    #[test]
    fn test_inventory_marks_missing_and_restores() {
        let tracker = tracker_with_nodes(&["n1", "n2"]);
        tracker.reserve_node(pending("d1", "n1", 2), 2).unwrap();

        let change = tracker.merge_inventory(vec![NodeDescriptor::new("n2")], 3).unwrap();
        assert_eq!(change.lost, 1);
        let lost = tracker.node(&NodeId::new("n1")).unwrap();
        assert_eq!(lost.state, NodeState::Unreachable);
        assert_eq!(lost.deployment, Some(DeploymentId::new("d1")));

        let change = tracker
            .merge_inventory(
                vec![NodeDescriptor::new("n1"), NodeDescriptor::new("n2"), NodeDescriptor::new("n3")],
                4,
            )
            .unwrap();
        assert_eq!(change.restored, 1);
        assert_eq!(change.added, 1);
        assert_eq!(tracker.node(&NodeId::new("n1")).unwrap().state, NodeState::Busy);
        assert_eq!(tracker.inventory_refreshed_at(), Some(4));
    }

    #[test]
    fn test_nodes_snapshot_filters_and_sorts() {
        let tracker = Tracker::new();
        tracker
            .merge_inventory(
                vec![
                    NodeDescriptor::new("b").with_tag("arch", "arm64"),
                    NodeDescriptor::new("a").with_tag("arch", "arm64"),
                    NodeDescriptor::new("c").with_tag("arch", "amd64"),
                ],
                1,
            )
            .unwrap();

        let arm = tracker.nodes_snapshot(&NodeFilter::any().with_tag("arch", "arm64"));
        let ids: Vec<_> = arm.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(tracker
            .nodes_snapshot(&NodeFilter::any().with_tag("arch", "riscv"))
            .is_empty());
        assert_eq!(tracker.nodes_snapshot(&NodeFilter::any()).len(), 3);
    }

    #[test]
    fn test_deployment_terminal_state_is_sticky() {
        let tracker = tracker_with_nodes(&["n1"]);
        let id = deployed(&tracker, "d1", "n1");

        let outcome = tracker
            .transition_deployment(
                &id,
                DeploymentState::Failed,
                Some(Failure::new(FailureReason::ReconciliationTimeout, "late")),
                9,
            )
            .unwrap();
        assert!(!outcome.is_applied());
        let deployment = outcome.into_inner();
        assert_eq!(deployment.state, DeploymentState::Succeeded);
        assert!(deployment.failure.is_none());
    }

    #[test]
    fn test_bind_is_idempotent() {
        let tracker = tracker_with_nodes(&["n1"]);
        let deployment = deployed(&tracker, "d1", "n1");
        let id = ExecutionId::new("e1");

        let first = tracker.bind_execution(&deployment, &id, None, 5).unwrap();
        assert!(matches!(first, Bound::Created { .. }));

        let second = tracker.bind_execution(&deployment, &id, None, 6).unwrap();
        let Bound::Existing(existing) = second else {
            panic!("second bind should return the existing record");
        };
        assert_eq!(existing.created_at, 5);
        assert_eq!(tracker.counts().2, 1);
    }

    #[test]
    fn test_bind_conflicts() {
        let tracker = tracker_with_nodes(&["n1", "n2"]);
        let d1 = deployed(&tracker, "d1", "n1");
        let d2 = deployed(&tracker, "d2", "n2");

        tracker
            .bind_execution(&d1, &ExecutionId::new("e1"), None, 5)
            .unwrap();

        // Same execution id on another deployment
        let err = tracker
            .bind_execution(&d2, &ExecutionId::new("e1"), None, 5)
            .unwrap_err();
        assert!(matches!(err, ConnectorError::ExecutionConflict { .. }));

        // Deployment already bound to a live execution
        let err = tracker
            .bind_execution(&d1, &ExecutionId::new("e2"), None, 5)
            .unwrap_err();
        assert!(matches!(err, ConnectorError::ExecutionConflict { .. }));
        assert!(tracker.execution(&ExecutionId::new("e2")).is_none());
    }

    #[test]
    fn test_bind_after_terminal_execution() {
        let tracker = tracker_with_nodes(&["n1"]);
        let deployment = deployed(&tracker, "d1", "n1");
        let e1 = running(&tracker, &deployment, "e1");
        tracker
            .transition_execution(&e1, ExecutionState::Finished, None, None, 7)
            .unwrap();

        let bound = tracker
            .bind_execution(&deployment, &ExecutionId::new("e2"), None, 8)
            .unwrap();
        assert!(matches!(bound, Bound::Created { .. }));
    }

    #[test]
    fn test_bind_requires_ready_deployment() {
        let tracker = tracker_with_nodes(&["n1"]);

        let err = tracker
            .bind_execution(&DeploymentId::new("nope"), &ExecutionId::new("e1"), None, 5)
            .unwrap_err();
        assert!(matches!(err, ConnectorError::DeploymentNotReady { .. }));

        tracker.reserve_node(pending("d1", "n1", 2), 2).unwrap();
        let err = tracker
            .bind_execution(&DeploymentId::new("d1"), &ExecutionId::new("e1"), None, 5)
            .unwrap_err();
        assert!(matches!(err, ConnectorError::DeploymentNotReady { .. }));
        assert_eq!(tracker.counts().2, 0);
    }

    #[test]
    fn test_execution_timestamps_and_sticky_terminal() {
        let tracker = tracker_with_nodes(&["n1"]);
        let deployment = deployed(&tracker, "d1", "n1");
        let id = running(&tracker, &deployment, "e1");

        let finished = tracker
            .transition_execution(
                &id,
                ExecutionState::Finished,
                Some(ExecutionResult::Success(serde_json::json!(42))),
                None,
                10,
            )
            .unwrap()
            .into_inner();
        assert_eq!(finished.started_at, Some(6));
        assert_eq!(finished.finished_at, Some(10));

        let outcome = tracker
            .transition_execution(&id, ExecutionState::Cancelled, None, None, 11)
            .unwrap();
        assert!(!outcome.is_applied());
        assert_eq!(outcome.into_inner().state, ExecutionState::Finished);
    }

    #[test]
    fn test_release_waits_for_executions() {
        let tracker = tracker_with_nodes(&["n1"]);
        let deployment = deployed(&tracker, "d1", "n1");
        let id = running(&tracker, &deployment, "e1");

        let err = tracker.release_node(&NodeId::new("n1"), 7).unwrap_err();
        assert!(matches!(err, ConnectorError::NodeStillBusy { .. }));

        tracker
            .transition_execution(&id, ExecutionState::Finished, None, None, 8)
            .unwrap();
        let outcome = tracker.release_node(&NodeId::new("n1"), 9).unwrap();
        assert_eq!(outcome.node.state, NodeState::Available);
        assert_eq!(outcome.released_deployment, Some(deployment.clone()));
        assert!(tracker.deployment(&deployment).unwrap().released);

        // A released deployment takes no further executions
        let err = tracker
            .bind_execution(&deployment, &ExecutionId::new("e2"), None, 10)
            .unwrap_err();
        assert!(matches!(err, ConnectorError::DeploymentNotReady { .. }));
    }

    #[test]
    fn test_release_during_deploy_is_refused() {
        let tracker = tracker_with_nodes(&["n1"]);
        tracker.reserve_node(pending("d1", "n1", 2), 2).unwrap();

        let err = tracker.release_node(&NodeId::new("n1"), 3).unwrap_err();
        assert!(matches!(err, ConnectorError::NodeStillBusy { .. }));
    }

    #[test]
    fn test_release_available_node_is_noop() {
        let tracker = tracker_with_nodes(&["n1"]);
        let outcome = tracker.release_node(&NodeId::new("n1"), 3).unwrap();
        assert_eq!(outcome.node.state, NodeState::Available);
        assert!(outcome.released_deployment.is_none());
        assert!(matches!(
            tracker.release_node(&NodeId::new("nope"), 3),
            Err(ConnectorError::NodeNotFound(_))
        ));
    }

    #[test]
    fn test_stuck_records_by_age() {
        let tracker = tracker_with_nodes(&["n1", "n2"]);
        let deployment = deployed(&tracker, "d1", "n1");
        running(&tracker, &deployment, "e1");
        tracker.reserve_node(pending("d2", "n2", 2), 2).unwrap();

        assert!(tracker.stuck_executions(Duration::from_millis(100), 50).is_empty());
        assert_eq!(tracker.stuck_executions(Duration::from_millis(100), 106).len(), 1);
        let stuck = tracker.stuck_deployments(Duration::from_millis(100), 102);
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, DeploymentId::new("d2"));
    }

    #[test]
    fn test_eviction_skips_pinned_executions() {
        let tracker = tracker_with_nodes(&["n1"]);
        let deployment = deployed(&tracker, "d1", "n1");
        let id = running(&tracker, &deployment, "e1");
        tracker
            .transition_execution(&id, ExecutionState::Finished, None, None, 10)
            .unwrap();

        let retention = Duration::from_millis(100);
        let guard = tracker.pin(&id).unwrap();
        let stats = tracker.evict_expired(retention, 1_000).unwrap();
        assert_eq!(stats.executions, 0);
        assert!(tracker.execution(&id).is_some());

        drop(guard);
        let stats = tracker.evict_expired(retention, 1_000).unwrap();
        assert_eq!(stats.executions, 1);
        assert!(tracker.execution(&id).is_none());
        assert!(tracker.pin(&id).is_none());
    }

    #[test]
    fn test_eviction_keeps_live_records() {
        let tracker = tracker_with_nodes(&["n1"]);
        let deployment = deployed(&tracker, "d1", "n1");
        running(&tracker, &deployment, "e1");

        let stats = tracker.evict_expired(Duration::ZERO, 1_000).unwrap();
        assert_eq!(stats, EvictionStats::default());
        assert!(tracker.deployment(&deployment).is_some());
    }

    #[test]
    fn test_eviction_of_released_deployment() {
        let tracker = tracker_with_nodes(&["n1"]);
        let deployment = deployed(&tracker, "d1", "n1");
        let id = running(&tracker, &deployment, "e1");
        tracker
            .transition_execution(&id, ExecutionState::Failed, None, None, 7)
            .unwrap();
        tracker.release_node(&NodeId::new("n1"), 8).unwrap();

        let stats = tracker.evict_expired(Duration::from_millis(10), 100).unwrap();
        assert_eq!(stats.executions, 1);
        assert_eq!(stats.deployments, 1);
        assert_eq!(tracker.counts(), (1, 0, 0));
    }

    #[test]
    fn test_journal_restores_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.jsonl");

        {
            let tracker = Tracker::open(Some(&path)).unwrap();
            tracker
                .merge_inventory(vec![NodeDescriptor::new("n1")], 1)
                .unwrap();
            let deployment = deployed(&tracker, "d1", "n1");
            running(&tracker, &deployment, "e1");
        }

        let tracker = Tracker::open(Some(&path)).unwrap();
        assert_eq!(tracker.counts(), (1, 1, 1));
        assert_eq!(tracker.node(&NodeId::new("n1")).unwrap().state, NodeState::Busy);
        assert_eq!(
            tracker.execution(&ExecutionId::new("e1")).unwrap().state,
            ExecutionState::Running
        );
        // Inventory freshness is not persisted
        assert_eq!(tracker.inventory_refreshed_at(), None);
    }

    #[test]
    fn test_running_tracker_compacts_journal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.jsonl");

        let tracker = Tracker::open(Some(&path)).unwrap();
        tracker
            .merge_inventory(vec![NodeDescriptor::new("n1")], 1)
            .unwrap();
        let deployment = deployed(&tracker, "d1", "n1");
        let id = running(&tracker, &deployment, "e1");
        tracker
            .transition_execution(&id, ExecutionState::Finished, None, None, 5)
            .unwrap();
        let before = std::fs::read_to_string(&path).unwrap().lines().count();

        // Few appends are not worth a rewrite
        assert!(!tracker.compact_journal_if_grown().unwrap());

        assert!(tracker.compact_journal().unwrap());
        let after = std::fs::read_to_string(&path).unwrap().lines().count();
        assert!(after < before);
        assert_eq!(after, 3);

        // Writes after compaction still land in the journal
        tracker.release_node(&NodeId::new("n1"), 6).unwrap();
        drop(tracker);

        let tracker = Tracker::open(Some(&path)).unwrap();
        assert_eq!(
            tracker.execution(&id).unwrap().state,
            ExecutionState::Finished
        );
        assert_eq!(
            tracker.node(&NodeId::new("n1")).unwrap().state,
            NodeState::Available
        );
    }

    #[test]
    fn test_in_memory_tracker_has_no_journal_to_compact() {
        let tracker = tracker_with_nodes(&["n1"]);
        assert!(!tracker.compact_journal().unwrap());
        assert!(!tracker.compact_journal_if_grown().unwrap());
    }
}
