//! nc-protocol: Wire types for the node connector
//!
//! This crate defines the records and request/response bodies exchanged
//! between an orchestrator and a connector, either in process or over the
//! HTTP facade. Every type here is JSON-serializable.

pub mod auth;
pub mod error;
pub mod id;
pub mod message;
pub mod record;

pub use auth::{bearer_token, bearer_value, AUTHORIZATION};
pub use error::{ErrorBody, ErrorCode, ProtocolError};
pub use id::{DeploymentId, ExecutionId, NodeId};
pub use message::{
    CancelRequest, DeployRequest, ExecuteRequest, HealthReport, NodeFilter, NodeListing,
    OperationContext, PROTOCOL_VERSION,
};
pub use record::{
    Deployment, DeploymentState, Execution, ExecutionResult, ExecutionState, Failure,
    FailureReason, Node, NodeState,
};
