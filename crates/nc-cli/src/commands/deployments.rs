//! Deployment commands

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::Value;

use nc_protocol::{DeploymentId, NodeId, OperationContext};

use super::print_json;
use crate::client::RemoteConnector;
use crate::output::{format_deployment, print_error, print_success};

/// Build a deployment payload from an inline JSON string or a file
pub fn parse_payload(inline: Option<&str>, file: Option<&Path>) -> Result<Value> {
    match (inline, file) {
        (Some(_), Some(_)) => bail!("--payload and --payload-file are mutually exclusive"),
        (Some(text), None) => serde_json::from_str(text).context("Payload is not valid JSON"),
        (None, Some(path)) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read payload from {:?}", path))?;
            serde_json::from_str(&text)
                .with_context(|| format!("Payload in {:?} is not valid JSON", path))
        }
        (None, None) => Ok(Value::Null),
    }
}

/// Execute the deploy command
pub async fn deploy_command(
    client: &RemoteConnector,
    node: &str,
    payload: Value,
    context: OperationContext,
    json: bool,
) -> Result<()> {
    let deployment = match client
        .deploy_with_context(&NodeId::new(node), payload, context)
        .await
    {
        Ok(d) => d,
        Err(e) => {
            print_error(&format!("Deployment on {} failed: {}", node, e));
            return Err(e.into());
        }
    };

    if json {
        return print_json(&deployment);
    }
    print_success(&format!("Deployed {} on {}", deployment.id, deployment.node_id));
    Ok(())
}

/// Execute the deployment command
pub async fn deployment_command(client: &RemoteConnector, id: &str, json: bool) -> Result<()> {
    let deployment = match client.deployment(&DeploymentId::new(id)).await {
        Ok(d) => d,
        Err(e) => {
            print_error(&format!("Failed to get deployment {}: {}", id, e));
            return Err(e.into());
        }
    };

    if json {
        return print_json(&deployment);
    }
    print!("{}", format_deployment(&deployment));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_inline_payload() {
        let payload = parse_payload(Some(r#"{"commands":["true"]}"#), None).unwrap();
        assert_eq!(payload, json!({"commands": ["true"]}));
    }

    #[test]
    fn test_missing_payload_is_null() {
        assert_eq!(parse_payload(None, None).unwrap(), Value::Null);
    }

    #[test]
    fn test_invalid_payload_is_rejected() {
        assert!(parse_payload(Some("{not json"), None).is_err());
        assert!(parse_payload(Some("{}"), Some(Path::new("p.json"))).is_err());
    }
}
