//! Core error types for the node connector

use std::path::PathBuf;
use std::time::Duration;

use nc_protocol::{DeploymentId, ErrorCode, ExecutionId, ExecutionState, NodeId, NodeState};
use thiserror::Error;

/// Caller-facing category of a connector error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unknown node, deployment or execution id
    NotFound,
    /// A precondition was violated; retrying unchanged will not help
    Conflict,
    /// Backend unreachable or timed out; safe to retry
    Unavailable,
    /// Missing or wrong credential (facade only)
    AuthenticationFailed,
    /// Unexpected failure
    InternalFailure,
}

impl ErrorKind {
    /// Wire-level category for this kind
    pub fn code(self) -> ErrorCode {
        match self {
            ErrorKind::NotFound => ErrorCode::NotFound,
            ErrorKind::Conflict => ErrorCode::Conflict,
            ErrorKind::Unavailable => ErrorCode::Unavailable,
            ErrorKind::AuthenticationFailed => ErrorCode::Unauthorized,
            ErrorKind::InternalFailure => ErrorCode::Internal,
        }
    }
}

/// Errors reported by a backend implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Backend cannot be contacted
    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    /// Backend call did not complete in time
    #[error("Backend call timed out after {0:?}")]
    Timeout(Duration),

    /// Backend refused the request
    #[error("Backend rejected request: {0}")]
    Rejected(String),

    /// Unexpected backend failure
    #[error("Backend failure: {0}")]
    Internal(String),
}

impl BackendError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackendError::Unreachable(_) | BackendError::Timeout(_) => ErrorKind::Unavailable,
            BackendError::Rejected(_) | BackendError::Internal(_) => ErrorKind::InternalFailure,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BackendError::Timeout(_))
    }
}

/// Errors returned by connector operations
#[derive(Error, Debug)]
pub enum ConnectorError {
    /// Node id unknown to the connector
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    /// Deployment id unknown or evicted
    #[error("Deployment not found: {0}")]
    DeploymentNotFound(DeploymentId),

    /// Execution id unknown or evicted
    #[error("Execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    /// Node cannot take a deployment
    #[error("Node {node} is {state}")]
    NodeBusy { node: NodeId, state: NodeState },

    /// Node still has work in flight
    #[error("Node {node} is still busy: {reason}")]
    NodeStillBusy { node: NodeId, reason: String },

    /// Deployment unknown, not prepared, or already released
    #[error("Deployment {deployment} not ready: {reason}")]
    DeploymentNotReady {
        deployment: DeploymentId,
        reason: String,
    },

    /// Execution id reuse with a different deployment, or deployment in use
    #[error("Execution conflict for {execution}: {reason}")]
    ExecutionConflict {
        execution: ExecutionId,
        reason: String,
    },

    /// Result requested for a non-terminal execution
    #[error("Result not ready for {execution} (state: {state})")]
    ResultNotReady {
        execution: ExecutionId,
        state: ExecutionState,
    },

    /// Backend failed to prepare the node
    #[error("Deployment {deployment} failed: {source}")]
    DeploymentFailed {
        deployment: DeploymentId,
        #[source]
        source: BackendError,
    },

    /// Backend unreachable or timed out
    #[error("{0}")]
    BackendUnreachable(#[source] BackendError),

    /// Backend reported an unexpected error
    #[error("{0}")]
    Backend(#[source] BackendError),

    /// Durable journal could not be written
    #[error("Journal error: {0}")]
    Journal(#[from] std::io::Error),
}

impl ConnectorError {
    /// Wrap a backend error, keeping its retryability
    pub fn from_backend(err: BackendError) -> Self {
        match err.kind() {
            ErrorKind::Unavailable => ConnectorError::BackendUnreachable(err),
            _ => ConnectorError::Backend(err),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectorError::NodeNotFound(_)
            | ConnectorError::DeploymentNotFound(_)
            | ConnectorError::ExecutionNotFound(_) => ErrorKind::NotFound,
            ConnectorError::NodeBusy { .. }
            | ConnectorError::NodeStillBusy { .. }
            | ConnectorError::DeploymentNotReady { .. }
            | ConnectorError::ExecutionConflict { .. }
            | ConnectorError::ResultNotReady { .. } => ErrorKind::Conflict,
            ConnectorError::DeploymentFailed { source, .. } => source.kind(),
            ConnectorError::BackendUnreachable(_) => ErrorKind::Unavailable,
            ConnectorError::Backend(_) | ConnectorError::Journal(_) => ErrorKind::InternalFailure,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Unavailable
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            ConnectorError::NodeNotFound(NodeId::new("n1")).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            ConnectorError::NodeBusy {
                node: NodeId::new("n1"),
                state: NodeState::Busy
            }
            .kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            ConnectorError::from_backend(BackendError::Timeout(Duration::from_secs(1))).kind(),
            ErrorKind::Unavailable
        );
        assert_eq!(
            ConnectorError::from_backend(BackendError::Internal("boom".into())).kind(),
            ErrorKind::InternalFailure
        );
    }

    #[test]
    fn test_deployment_failed_inherits_backend_kind() {
        let unreachable = ConnectorError::DeploymentFailed {
            deployment: DeploymentId::new("d1"),
            source: BackendError::Unreachable("connection refused".into()),
        };
        assert!(unreachable.is_retryable());

        let rejected = ConnectorError::DeploymentFailed {
            deployment: DeploymentId::new("d1"),
            source: BackendError::Rejected("image missing".into()),
        };
        assert_eq!(rejected.kind(), ErrorKind::InternalFailure);
        assert_eq!(
            rejected.to_string(),
            "Deployment d1 failed: Backend rejected request: image missing"
        );
    }

    #[test]
    fn test_kind_to_wire_code() {
        assert_eq!(ErrorKind::Conflict.code(), ErrorCode::Conflict);
        assert_eq!(ErrorKind::AuthenticationFailed.code(), ErrorCode::Unauthorized);
    }
}
