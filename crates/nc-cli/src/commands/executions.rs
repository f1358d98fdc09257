//! Execution commands

use std::time::Duration;

use anyhow::Result;

use nc_protocol::{DeploymentId, ExecutionId, ExecutionState, OperationContext};

use super::print_json;
use crate::client::RemoteConnector;
use crate::output::{format_execution, format_result, print_error, print_success, print_warning};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Execute the execute command
///
/// With `wait`, polls the execution until it reaches a terminal state.
pub async fn execute_command(
    client: &RemoteConnector,
    deployment: &str,
    execution: Option<String>,
    experiment: Option<String>,
    context: OperationContext,
    wait: bool,
    json: bool,
) -> Result<()> {
    let mut record = match client
        .execute_with_context(
            &DeploymentId::new(deployment),
            execution.map(ExecutionId::new),
            experiment,
            context,
        )
        .await
    {
        Ok(e) => e,
        Err(e) => {
            print_error(&format!("Failed to start execution on {}: {}", deployment, e));
            return Err(e.into());
        }
    };

    if wait {
        while !record.state.is_terminal() {
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
            record = client.status(&record.id).await?;
        }
    }

    if json {
        return print_json(&record);
    }
    match record.state {
        ExecutionState::Finished => print_success(&format!("Execution {} finished", record.id)),
        ExecutionState::Failed | ExecutionState::Cancelled => {
            print_warning(&format!("Execution {} {}", record.id, record.state))
        }
        _ => print_success(&format!("Started execution {}", record.id)),
    }
    print!("{}", format_execution(&record));
    Ok(())
}

/// Execute the status command
pub async fn status_command(client: &RemoteConnector, id: &str, json: bool) -> Result<()> {
    let record = match client.status(&ExecutionId::new(id)).await {
        Ok(e) => e,
        Err(e) => {
            print_error(&format!("Failed to get execution {}: {}", id, e));
            return Err(e.into());
        }
    };

    if json {
        return print_json(&record);
    }
    print!("{}", format_execution(&record));
    Ok(())
}

/// Execute the cancel command
pub async fn cancel_command(
    client: &RemoteConnector,
    id: &str,
    context: OperationContext,
    json: bool,
) -> Result<()> {
    let record = match client
        .cancel_with_context(&ExecutionId::new(id), context)
        .await
    {
        Ok(e) => e,
        Err(e) => {
            print_error(&format!("Failed to cancel execution {}: {}", id, e));
            return Err(e.into());
        }
    };

    if json {
        return print_json(&record);
    }
    if record.state == ExecutionState::Cancelled {
        print_success(&format!("Cancelled execution {}", record.id));
    } else {
        print_warning(&format!(
            "Execution {} was already {}",
            record.id, record.state
        ));
    }
    Ok(())
}

/// Execute the result command
pub async fn result_command(client: &RemoteConnector, id: &str, json: bool) -> Result<()> {
    let result = match client.result(&ExecutionId::new(id)).await {
        Ok(r) => r,
        Err(e) => {
            print_error(&format!("No result for execution {}: {}", id, e));
            return Err(e.into());
        }
    };

    if json {
        return print_json(&result);
    }
    println!("{}", format_result(&result));
    Ok(())
}
