//! Output formatting utilities for the CLI
//!
//! Tables for node listings, key/value blocks for single records and
//! colored status messages.

use tabled::{
    settings::{Style, Width},
    Table, Tabled,
};

use nc_protocol::{Deployment, Execution, ExecutionResult, HealthReport, NodeListing};

/// Format a node listing as an ASCII table
///
/// A stale listing is annotated with the time of the last successful
/// inventory refresh.
pub fn format_nodes(listing: &NodeListing) -> String {
    if listing.nodes.is_empty() {
        return "No nodes match".to_string();
    }

    #[derive(Tabled)]
    struct NodeRow {
        #[tabled(rename = "NODE")]
        id: String,
        #[tabled(rename = "STATE")]
        state: String,
        #[tabled(rename = "DEPLOYMENT")]
        deployment: String,
        #[tabled(rename = "TAGS")]
        tags: String,
    }

    let rows: Vec<NodeRow> = listing
        .nodes
        .iter()
        .map(|n| NodeRow {
            id: n.id.to_string(),
            state: n.state.to_string(),
            deployment: n
                .deployment
                .as_ref()
                .map(|d| truncate(d.as_str(), 12))
                .unwrap_or_else(|| "-".to_string()),
            tags: n
                .tags
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(","),
        })
        .collect();

    let mut output = Table::new(rows)
        .with(Style::rounded())
        .with(Width::wrap(100))
        .to_string();

    if listing.stale {
        output.push_str(&format!(
            "\n(stale: backend unreachable, last refresh {})",
            listing
                .refreshed_at
                .map(|t| format!("{}ms", t))
                .unwrap_or_else(|| "never".to_string())
        ));
    }
    output
}

pub fn format_deployment(deployment: &Deployment) -> String {
    let mut output = String::new();
    output.push_str(&format!("Deployment: {}\n", deployment.id));
    output.push_str(&format!("Node: {}\n", deployment.node_id));
    output.push_str(&format!("State: {}\n", deployment.state));
    if deployment.released {
        output.push_str("Released: yes\n");
    }
    if let Some(failure) = &deployment.failure {
        output.push_str(&format!("Failure: {}\n", failure));
    }
    output
}

pub fn format_execution(execution: &Execution) -> String {
    let mut output = String::new();
    output.push_str(&format!("Execution: {}\n", execution.id));
    output.push_str(&format!("Deployment: {}\n", execution.deployment_id));
    output.push_str(&format!("Node: {}\n", execution.node_id));
    if let Some(experiment) = &execution.experiment_id {
        output.push_str(&format!("Experiment: {}\n", experiment));
    }
    output.push_str(&format!("State: {}\n", execution.state));
    if let Some(failure) = &execution.failure {
        output.push_str(&format!("Failure: {}\n", failure));
    }
    output
}

pub fn format_result(result: &ExecutionResult) -> String {
    match result {
        ExecutionResult::Success(value) => {
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
        }
        ExecutionResult::Failure(message) => format!("Failed: {}", message),
    }
}

/// Format connector health as a human-readable string
pub fn format_health(report: &HealthReport) -> String {
    let mut output = String::new();
    output.push_str(&format!(
        "Connector: {} ({})\n",
        report.connector,
        if report.healthy { "healthy" } else { "unhealthy" }
    ));
    output.push_str(&format!("Backend: {}\n", report.backend));
    output.push_str(&format!("Status: {}\n", report.status));
    output.push_str(&format!("Protocol: {}\n", report.protocol_version));
    output
}

/// Truncate a string with ellipsis if too long
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Print a success message in green with a checkmark prefix
pub fn print_success(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Green),
        Print("✓ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an error message in red with an X prefix
///
/// Outputs to stderr.
pub fn print_error(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Red),
        Print("✗ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print a warning message in yellow to stderr
pub fn print_warning(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Yellow),
        Print("⚠ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}
