//! Health, node listing and node release commands

use anyhow::Result;

use nc_protocol::{NodeFilter, NodeId};

use super::{parse_key_values, print_json};
use crate::client::RemoteConnector;
use crate::output::{format_health, format_nodes, print_error, print_success, print_warning};

/// Parse `key=value` arguments into a node filter
pub fn parse_tag_filter(tags: &[String]) -> Result<NodeFilter> {
    Ok(NodeFilter::from(parse_key_values(tags, "tag filter")?))
}

/// Execute the health command
pub async fn health_command(client: &RemoteConnector, json: bool) -> Result<()> {
    let report = match client.health().await {
        Ok(report) => report,
        Err(e) => {
            print_error(&format!("Connector at {} is unhealthy: {}", client.base_url(), e));
            return Err(e.into());
        }
    };

    if json {
        return print_json(&report);
    }
    print!("{}", format_health(&report));
    Ok(())
}

/// Execute the nodes command
pub async fn nodes_command(client: &RemoteConnector, tags: &[String], json: bool) -> Result<()> {
    let filter = parse_tag_filter(tags)?;
    let listing = match client.list_nodes(&filter).await {
        Ok(listing) => listing,
        Err(e) => {
            print_error(&format!("Failed to list nodes: {}", e));
            return Err(e.into());
        }
    };

    if json {
        return print_json(&listing);
    }
    if listing.stale {
        print_warning("Backend unreachable, showing cached inventory");
    }
    println!("{}", format_nodes(&listing));
    Ok(())
}

/// Execute the release command
pub async fn release_command(client: &RemoteConnector, node: &str, json: bool) -> Result<()> {
    let node = match client.release_node(&NodeId::new(node)).await {
        Ok(node) => node,
        Err(e) => {
            print_error(&format!("Failed to release node {}: {}", node, e));
            return Err(e.into());
        }
    };

    if json {
        return print_json(&node);
    }
    print_success(&format!("Node {} is {}", node.id, node.state));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tag_filter() {
        let filter = parse_tag_filter(&["arch=amd64".to_string(), "gpu=1".to_string()]).unwrap();
        assert_eq!(filter, NodeFilter::any().with_tag("arch", "amd64").with_tag("gpu", "1"));

        assert!(parse_tag_filter(&[]).unwrap().is_empty());
        assert!(parse_tag_filter(&["arch".to_string()]).is_err());
        assert!(parse_tag_filter(&["=amd64".to_string()]).is_err());
    }

    #[test]
    fn test_tag_value_may_contain_equals() {
        let filter = parse_tag_filter(&["label=a=b".to_string()]).unwrap();
        assert_eq!(filter.tags.get("label").map(String::as_str), Some("a=b"));
    }
}
