use anyhow::{Context, Result};
use clap::Parser;
use nodeflow_core::events::EventLog;
use nodeflow_core::storage::JsonlEventLog;
use nodeflow_core::{NodeSet, Workflow};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

mod config;
mod report;

use config::DeploymentConfig;

#[derive(Parser, Debug)]
#[command(name = "nodeflow")]
#[command(about = "Run a phased deployment workflow over a set of nodes", long_about = None)]
struct Args {
    /// Path to the deployment description
    #[arg(short, long, default_value = "nodeflow.toml", env = "NODEFLOW_CONFIG")]
    config: PathBuf,

    /// Node list replacing the one in the deployment description
    #[arg(short, long)]
    nodes: Option<PathBuf>,

    /// Directory receiving the run's event log as <run_id>.jsonl
    #[arg(short, long, env = "NODEFLOW_EVENTS")]
    events: Option<PathBuf>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Validate the deployment description and exit
    #[arg(long)]
    check: bool,

    /// Emit logs as JSON
    #[arg(long, env = "NODEFLOW_LOG_JSON")]
    log_json: bool,
}

/// Validate the deployment into a workflow. The event log is only opened
/// for a real run, so `--check` leaves the filesystem alone.
fn build_workflow(args: &Args, deployment: &DeploymentConfig, nodes: NodeSet) -> Result<Workflow> {
    let event_log = match &args.events {
        Some(dir) if !args.check => {
            let log = JsonlEventLog::new(dir.clone()).context("Failed to create event log")?;
            Some(Arc::new(log) as Arc<dyn EventLog>)
        }
        _ => None,
    };

    deployment.build(nodes, event_log)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Initialize tracing; stdout is reserved for the report
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "nodeflow=info,nodeflow_core=info".into());
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    let deployment = DeploymentConfig::load(&args.config)?;
    let nodes = match &args.nodes {
        Some(path) => config::read_nodes_file(path)?,
        None => deployment.node_set(),
    };

    let workflow = build_workflow(&args, &deployment, nodes)?;

    if args.check {
        println!(
            "{}: configuration ok ({} nodes, {} macrosteps, {} microsteps)",
            args.config.display(),
            workflow.nodes().len(),
            deployment.macrosteps.len(),
            deployment.microsteps.len()
        );
        return Ok(ExitCode::SUCCESS);
    }

    if let Some(dir) = &args.events {
        tracing::info!("Event log: {}", dir.join(format!("{}.jsonl", workflow.run_id())).display());
    }

    // Ctrl-C cancels the run; the report is still printed
    let token = workflow.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling the run");
            token.cancel();
        }
    });

    let report = workflow.start().await;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize report")?
        );
    } else {
        print!("{}", report::render_summary(&report));
    }

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
