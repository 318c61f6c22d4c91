//! Triage mesh binary: wires the registry, engine and the five pipeline
//! workers together and drives alerts through the triage workflow.

use anyhow::Context;
use clap::{Parser, Subcommand};
use orchestrator::{spawn_worker, Engine, EngineHandle, Registry, RegistryConfig, TaskWorker};
use protocol::{Payload, WorkerId, WorkflowId};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;
use triage::agents::{
    AlertReceiver, ContextGatherer, FalsePositiveChecker, ResponseCoordinator, SeverityAnalyzer,
};
use triage::{alert_triage_definition, TriageConfig};

#[derive(Parser)]
#[command(name = "triage", about = "Capability-routed security alert triage mesh")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the mesh and run one alert through the triage workflow
    Run {
        /// JSON file with the alert payload; a sample alert is used if absent
        #[arg(long)]
        alert: Option<PathBuf>,

        /// Seconds to wait for the workflow to finish
        #[arg(long, default_value_t = 120)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = TriageConfig::load(cli.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    match cli.command {
        Command::Run { alert, timeout } => run(config, alert, Duration::from_secs(timeout)).await,
    }
}

async fn run(
    config: TriageConfig,
    alert_path: Option<PathBuf>,
    timeout: Duration,
) -> anyhow::Result<()> {
    let registry = Registry::spawn(RegistryConfig::default());
    let engine = Engine::spawn(
        registry.clone(),
        config.engine_config(),
        vec![alert_triage_definition()],
    )
    .await?;

    let worker_config = config.worker_config();
    let mut workers = Vec::new();
    macro_rules! pipeline_worker {
        ($id:expr, $name:expr, $executor:expr) => {
            workers.push(
                spawn_worker(
                    TaskWorker::new(WorkerId::from($id), $name, $executor, registry.clone()),
                    registry.clone(),
                    worker_config.clone(),
                )
                .await?,
            );
        };
    }
    pipeline_worker!("alert_receiver", "Alert Receiver", AlertReceiver);
    pipeline_worker!(
        "false_positive_checker",
        "False Positive Checker",
        FalsePositiveChecker
    );
    pipeline_worker!("severity_analyzer", "Severity Analyzer", SeverityAnalyzer);
    pipeline_worker!("context_gatherer", "Context Gatherer", ContextGatherer);
    pipeline_worker!(
        "response_coordinator",
        "Response Coordinator",
        ResponseCoordinator
    );
    info!(workers = workers.len(), "triage mesh online");

    let alert = load_alert(alert_path)?;
    let mut context = Payload::new();
    context.insert("alert".to_string(), alert);

    let workflow_id = engine.start_workflow("alert_triage", context).await?;
    info!(workflow_id = %workflow_id, "alert submitted");

    let snapshot = wait_for_terminal(&engine, workflow_id, timeout).await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    println!(
        "workflow {} finished: {} ({} of {} steps completed)",
        snapshot.workflow_id, snapshot.status, snapshot.completed_steps, snapshot.total_steps
    );

    for worker in workers {
        worker.shutdown().await;
    }
    engine.shutdown();
    Ok(())
}

async fn wait_for_terminal(
    engine: &EngineHandle,
    workflow_id: WorkflowId,
    timeout: Duration,
) -> anyhow::Result<orchestrator::WorkflowSnapshot> {
    let started = Instant::now();
    loop {
        let snapshot = engine.workflow_status(workflow_id).await?;
        if snapshot.status.is_terminal() {
            return Ok(snapshot);
        }
        anyhow::ensure!(
            started.elapsed() < timeout,
            "workflow {workflow_id} still {} after {timeout:?}",
            snapshot.status
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn load_alert(path: Option<PathBuf>) -> anyhow::Result<serde_json::Value> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading alert file {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parsing alert file {}", path.display()))
        }
        None => Ok(sample_alert()),
    }
}

fn sample_alert() -> serde_json::Value {
    serde_json::json!({
        "alert_id": format!("demo-{}", uuid::Uuid::new_v4()),
        "timestamp": chrono::Utc::now(),
        "source_system": "demo-edr",
        "alert_type": "data_exfiltration",
        "description": "Large outbound transfer to an unknown host",
        "source_ip": "203.0.113.77",
        "destination_ip": "10.4.1.20",
        "user_id": "j.doe",
        "hostname": "ws-1042",
        "file_hash": "4f3c2a9d8b7e6f5a",
        "tags": ["egress", "dlp"]
    })
}
