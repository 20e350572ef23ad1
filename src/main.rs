//! Analysis orchestrator - main entry point

use analysis_orchestrator::observability::logging::{init_logging, parse_level, LogFormat};
use analysis_orchestrator::observability::{init_default_logging, metrics, HealthServer};
use analysis_orchestrator::{Orchestrator, OrchestratorConfig, RunInputs};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Multi-stage analysis pipeline orchestrator
#[derive(Parser)]
#[command(name = "orchestrator")]
#[command(about = "Runs documents through a multi-stage analysis pipeline")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Serve /health, /ready and /metrics on this port
    #[arg(long, env = "HEALTH_PORT")]
    health_port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit one run and wait for it to finish
    Run {
        /// JSON file with `documents` and `parameters`
        #[arg(long, value_name = "FILE")]
        inputs: PathBuf,

        /// Give up waiting after this many seconds (defaults to the run timeout)
        #[arg(long)]
        wait_secs: Option<u64>,
    },
    /// Recover unfinished runs from the data directory and drive them to the end
    Resume,
    /// Print the status of a stored run
    Status {
        #[arg(long)]
        run_id: Uuid,
    },
    /// Validate configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        n => {
            let level = if n == 1 { "DEBUG" } else { "TRACE" };
            let format =
                LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_else(|_| "compact".into()));
            init_logging(parse_level(level), format, n > 2);
        }
    }

    info!("Starting analysis orchestrator v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { inputs, wait_secs } => {
            run_pipeline(config, cli.health_port, &inputs, wait_secs).await
        }
        Commands::Resume => resume(config, cli.health_port).await,
        Commands::Status { run_id } => show_status(config, run_id).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<OrchestratorConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(OrchestratorConfig::load_from_file(path)?)
        }
        None => {
            for path_str in ["orchestrator.toml", "config/orchestrator.toml"] {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(OrchestratorConfig::load_from_file(&path)?);
                }
            }
            warn!("No configuration file found, using defaults");
            Ok(OrchestratorConfig::default())
        }
    }
}

type Started = (Arc<Orchestrator>, Option<Arc<HealthServer>>, watch::Sender<bool>);

/// Build and start the orchestrator, plus the health server when a port is given
async fn start(
    config: OrchestratorConfig,
    health_port: Option<u16>,
) -> Result<Started, Box<dyn std::error::Error>> {
    let (stop_tx, stop_rx) = watch::channel(false);
    let health = health_port.map(|port| {
        let server = Arc::new(HealthServer::new(config.orchestrator.id.clone(), port));
        tokio::spawn(Arc::clone(&server).start(stop_rx));
        server
    });

    let orchestrator = Arc::new(Orchestrator::builder(config).build().await?);
    let recovered = orchestrator.recover().await?;
    if recovered.runs_resumed + recovered.runs_aborted > 0 {
        info!(
            resumed = recovered.runs_resumed,
            aborted = recovered.runs_aborted,
            requeued = recovered.tasks_requeued,
            "Recovered unfinished runs"
        );
    }
    orchestrator.start().await?;
    if let Some(server) = &health {
        server.set_ready(true);
    }
    Ok((orchestrator, health, stop_tx))
}

async fn stop(
    orchestrator: &Orchestrator,
    health: Option<Arc<HealthServer>>,
    stop_tx: watch::Sender<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(server) = health {
        server.set_ready(false);
    }
    orchestrator.shutdown().await?;
    let _ = stop_tx.send(true);
    let snapshot = metrics().get_metrics();
    info!(
        runs_completed = snapshot.runs.completed,
        runs_aborted = snapshot.runs.aborted,
        tasks_succeeded = snapshot.tasks.succeeded,
        "Final counters"
    );
    Ok(())
}

async fn run_pipeline(
    config: OrchestratorConfig,
    health_port: Option<u16>,
    inputs_path: &Path,
    wait_secs: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let raw = tokio::fs::read_to_string(inputs_path).await?;
    let inputs: RunInputs = serde_json::from_str(&raw)?;
    let spec = config.run_spec()?;
    let wait = Duration::from_secs(wait_secs.unwrap_or(spec.policy.run_timeout_secs));

    let (orchestrator, health, stop_tx) = start(config, health_port).await?;
    let run_id = orchestrator.submit_run(spec, inputs).await?;
    info!(%run_id, "Run submitted");

    tokio::select! {
        summary = orchestrator.wait_for_run(run_id, wait) => {
            match summary {
                Ok(summary) => println!("{}", serde_json::to_string_pretty(&summary)?),
                Err(e) => error!(%run_id, error = %e, "Run did not finish"),
            }
        }
        reason = shutdown_signal() => {
            info!("Received {}, shutting down gracefully...", reason);
        }
    }

    stop(&orchestrator, health, stop_tx).await
}

async fn resume(
    config: OrchestratorConfig,
    health_port: Option<u16>,
) -> Result<(), Box<dyn std::error::Error>> {
    if config.orchestrator.data_dir.is_none() {
        warn!("No data_dir configured; there is nothing to resume");
        return Ok(());
    }
    let (orchestrator, health, stop_tx) = start(config, health_port).await?;

    let drain = async {
        loop {
            match orchestrator.active_runs().await {
                Ok(active) if active.is_empty() => break,
                Ok(active) => info!(active = active.len(), "Waiting for runs to finish"),
                Err(e) => warn!(error = %e, "Could not list runs"),
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    };

    tokio::select! {
        _ = drain => info!("All runs finished"),
        reason = shutdown_signal() => info!("Received {}, shutting down gracefully...", reason),
    }

    stop(&orchestrator, health, stop_tx).await
}

async fn show_status(
    config: OrchestratorConfig,
    run_id: Uuid,
) -> Result<(), Box<dyn std::error::Error>> {
    if config.orchestrator.data_dir.is_none() {
        warn!("No data_dir configured; only runs of this process are visible");
    }
    let orchestrator = Orchestrator::builder(config).build().await?;
    let status = orchestrator.get_run_status(run_id).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn handle_config_command(
    config: OrchestratorConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    config.run_spec()?;
    if show {
        println!("{}", toml::to_string_pretty(&config)?);
    }
    info!("Configuration validation complete");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}
