//! CLI command implementations

mod deployments;
mod executions;
mod nodes;

pub use deployments::{deploy_command, deployment_command, parse_payload};
pub use executions::{cancel_command, execute_command, result_command, status_command};
pub use nodes::{health_command, nodes_command, parse_tag_filter, release_command};

use anyhow::{bail, Result};
use serde::Serialize;

use nc_protocol::OperationContext;

/// Parse repeated `key=value` arguments; `what` names the flag in errors
pub fn parse_key_values(pairs: &[String], what: &str) -> Result<OperationContext> {
    let mut map = OperationContext::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("Invalid {} '{}', expected key=value", what, pair);
        };
        if key.is_empty() {
            bail!("Invalid {} '{}', empty key", what, pair);
        }
        map.insert(key.to_string(), value.to_string());
    }
    Ok(map)
}

/// Print a record as pretty JSON
pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
