//! nc-connector: Connector daemon for remote compute nodes
//!
//! The connector sits between an orchestrator and one infrastructure
//! backend. It tracks nodes, deployments and executions, drives the backend
//! through the `Backend` capability trait, reconciles stuck records in the
//! background, and exposes the whole operation set over an API-key protected
//! HTTP facade so it can run out of process.

pub mod adapter;
pub mod backend;
pub mod reconcile;
pub mod server;
pub mod tracker;

pub use adapter::Connector;
pub use tracker::Tracker;
