//! Core trait definitions

mod backend;

pub use backend::{
    Backend, BackendStatus, DeploymentSpec, ExecutionContext, ExecutionSpec, NodeDescriptor,
    EXECUTOR_ID_ENV, EXPERIMENT_ID_ENV, GATEWAY_ENDPOINT_ENV,
};
