//! Core domain types
//!
//! The records themselves are defined in `nc-protocol` because they travel
//! over the wire unchanged; this module re-exports them and adds id
//! generation.

pub use nc_protocol::{
    Deployment, DeploymentId, DeploymentState, Execution, ExecutionId, ExecutionResult,
    ExecutionState, Failure, FailureReason, Node, NodeFilter, NodeId, NodeListing, NodeState,
    OperationContext,
};

/// Generate a fresh deployment id
pub fn generate_deployment_id() -> DeploymentId {
    DeploymentId::new(uuid::Uuid::new_v4().to_string())
}

/// Generate an execution id for callers that did not supply one
pub fn generate_execution_id() -> ExecutionId {
    ExecutionId::new(uuid::Uuid::new_v4().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let a = generate_deployment_id();
        let b = generate_deployment_id();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
        assert_ne!(generate_execution_id(), generate_execution_id());
    }
}
