//! nc-core: Core abstractions and configuration for the node connector
//!
//! This crate provides the error taxonomy, configuration structures and the
//! `Backend` capability trait shared by the connector daemon and its clients.

pub mod api_key;
pub mod config;
pub mod error;
pub mod time;
pub mod traits;
pub mod types;

pub use error::{BackendError, ConfigError, ConnectorError, ErrorKind};
pub use traits::{Backend, BackendStatus, DeploymentSpec, ExecutionContext, ExecutionSpec, NodeDescriptor};
pub use types::*;
