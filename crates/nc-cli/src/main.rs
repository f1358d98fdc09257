//! ncctl: command-line client for a node connector
//!
//! Talks to a running `nc-connector` over its HTTP facade.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nc_cli::commands;
use nc_cli::output::print_error;
use nc_cli::{RemoteConnector, DEFAULT_URL};
use nc_core::api_key::generate_api_key;
use nc_core::config::API_KEY_ENV;

#[derive(Parser)]
#[command(name = "ncctl")]
#[command(author, version, about = "Control a node connector over its HTTP facade")]
#[command(propagate_version = true)]
struct Cli {
    /// Connector facade URL
    #[arg(long, global = true, env = "NC_URL", default_value = DEFAULT_URL)]
    url: String,

    /// API key presented to the connector
    #[arg(long, global = true, env = API_KEY_ENV, hide_env_values = true)]
    api_key: Option<String>,

    /// Print raw JSON records
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show connector and backend health
    Health,

    /// List nodes, optionally filtered by capability tags
    Nodes {
        /// Required tag as key=value (repeatable)
        #[arg(short, long = "tag")]
        tags: Vec<String>,
    },

    /// Deploy a payload onto a node
    Deploy {
        /// Target node id
        node: String,
        /// Deployment payload as inline JSON
        #[arg(short, long)]
        payload: Option<String>,
        /// Read the deployment payload from a JSON file
        #[arg(long)]
        payload_file: Option<PathBuf>,
        /// Deployment context as key=value (repeatable)
        #[arg(short = 'C', long = "context")]
        context: Vec<String>,
    },

    /// Show a deployment
    Deployment {
        /// Deployment id
        id: String,
    },

    /// Start an execution on a deployment
    Execute {
        /// Deployment id
        deployment: String,
        /// Execution id (generated by the connector when omitted)
        #[arg(short, long)]
        id: Option<String>,
        /// Experiment the execution belongs to
        #[arg(short, long)]
        experiment: Option<String>,
        /// Wait until the execution finishes
        #[arg(short, long)]
        wait: bool,
        /// Execution context as key=value (repeatable)
        #[arg(short = 'C', long = "context")]
        context: Vec<String>,
    },

    /// Show an execution's state
    Status {
        /// Execution id
        id: String,
    },

    /// Cancel a running execution
    Cancel {
        /// Execution id
        id: String,
        /// Cancellation context as key=value (repeatable)
        #[arg(short = 'C', long = "context")]
        context: Vec<String>,
    },

    /// Fetch the result of a finished execution
    Result {
        /// Execution id
        id: String,
    },

    /// Release a node after its deployment is done
    Release {
        /// Node id
        node: String,
    },

    /// Generate a new API key
    Keygen,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if let Commands::Keygen = cli.command {
        println!("{}", generate_api_key());
        return Ok(());
    }

    let Some(api_key) = cli.api_key else {
        print_error(&format!("No API key given; use --api-key or set {}", API_KEY_ENV));
        anyhow::bail!("missing API key");
    };
    let client = RemoteConnector::new(&cli.url, api_key).context("Failed to create client")?;
    let json = cli.json;

    match cli.command {
        Commands::Health => commands::health_command(&client, json).await?,
        Commands::Nodes { tags } => commands::nodes_command(&client, &tags, json).await?,
        Commands::Deploy {
            node,
            payload,
            payload_file,
            context,
        } => {
            let payload = commands::parse_payload(payload.as_deref(), payload_file.as_deref())?;
            let context = commands::parse_key_values(&context, "context")?;
            commands::deploy_command(&client, &node, payload, context, json).await?
        }
        Commands::Deployment { id } => commands::deployment_command(&client, &id, json).await?,
        Commands::Execute {
            deployment,
            id,
            experiment,
            wait,
            context,
        } => {
            let context = commands::parse_key_values(&context, "context")?;
            commands::execute_command(&client, &deployment, id, experiment, context, wait, json)
                .await?
        }
        Commands::Status { id } => commands::status_command(&client, &id, json).await?,
        Commands::Cancel { id, context } => {
            let context = commands::parse_key_values(&context, "context")?;
            commands::cancel_command(&client, &id, context, json).await?
        }
        Commands::Result { id } => commands::result_command(&client, &id, json).await?,
        Commands::Release { node } => commands::release_command(&client, &node, json).await?,
        Commands::Keygen => {}
    }

    Ok(())
}
