//! nc-cli: Remote client for the node connector
//!
//! Provides `RemoteConnector`, an HTTP client speaking the connector facade
//! protocol, and the `ncctl` command-line tool built on it.

pub mod client;
pub mod commands;
pub mod output;

pub use client::{ClientError, ClientResult, RemoteConnector, DEFAULT_URL};
