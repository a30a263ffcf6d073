//! `convoy` command line: serve the coordinator, run workflows, inspect status
//! and configuration.

mod agents;
mod config_watcher;

use clap::{Parser, Subcommand};
use config_watcher::{load_or_default, ConfigWatcher};
use convoy_core::Payload;
use convoy_orchestrator::{ConvoyConfig, Coordinator, WorkflowDefinition, WorkflowStatus};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "convoy", version, about = "Convoy: agent task scheduling and workflow orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "convoy.toml", global = true)]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator with the configured agents until Ctrl+C
    Serve {
        /// Seconds between status reports in the log
        #[arg(long, default_value_t = 30)]
        report_secs: u64,
        /// Stop after this many seconds instead of waiting for Ctrl+C
        #[arg(long)]
        duration_secs: Option<u64>,
        /// Disable config hot reload
        #[arg(long)]
        no_watch: bool,
    },
    /// Run one round of health checks and print the coordinator status
    Status,
    /// Execute a workflow definition (.toml or .json) and print the result
    Run {
        /// Workflow definition file
        workflow: PathBuf,
        /// JSON object merged into every task's config
        #[arg(long)]
        params: Option<String>,
    },
    /// Print the effective configuration
    Config {
        /// Only validate, print nothing on success
        #[arg(long)]
        check: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let config = load_or_default(&cli.config)?;

    match cli.command {
        Commands::Serve {
            report_secs,
            duration_secs,
            no_watch,
        } => serve(&cli.config, config, report_secs, duration_secs, no_watch).await,
        Commands::Status => {
            let coordinator = build_coordinator(config)?;
            coordinator.monitor().run_checks().await;
            let out = json!({
                "status": coordinator.get_status(),
                "agents": coordinator.get_agents_status(),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(())
        }
        Commands::Run { workflow, params } => run_workflow(config, &workflow, params.as_deref()).await,
        Commands::Config { check } => {
            if !check {
                print!("{}", config.to_toml_string()?);
            }
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Build a coordinator and register one demo agent per `[[agents]]` entry.
fn build_coordinator(config: ConvoyConfig) -> anyhow::Result<Arc<Coordinator>> {
    let specs = config.agents.clone();
    let coordinator = Arc::new(Coordinator::new(config)?);
    for spec in &specs {
        coordinator.register_agent(agents::build_agent(spec)?)?;
    }
    if specs.is_empty() {
        warn!("No [[agents]] configured; every task will be rejected");
    } else {
        info!(count = specs.len(), "Agents registered");
    }
    Ok(coordinator)
}

async fn serve(
    config_path: &std::path::Path,
    config: ConvoyConfig,
    report_secs: u64,
    duration_secs: Option<u64>,
    no_watch: bool,
) -> anyhow::Result<()> {
    let coordinator = build_coordinator(config)?;
    coordinator.start();

    let _watcher = if no_watch || !config_path.exists() {
        None
    } else {
        let target = Arc::clone(&coordinator);
        Some(ConfigWatcher::start(
            config_path.to_path_buf(),
            Duration::from_millis(500),
            move |config| {
                if let Err(e) = target.apply_config(&config) {
                    warn!(error = %e, "Reloaded config rejected");
                }
            },
        )?)
    };

    let report = {
        let coordinator = Arc::clone(&coordinator);
        let period = Duration::from_secs(report_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let m = coordinator.get_system_metrics();
                info!(
                    agents = m.total_agents,
                    busy = m.busy_agents,
                    failed = m.failed_agents,
                    executions = m.total_executions,
                    success_rate = m.success_rate,
                    health = m.system_health,
                    queued = coordinator.scheduler().get_scheduler_stats().total_queued,
                    "Status"
                );
            }
        })
    };

    match duration_secs {
        Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
        None => {
            tokio::signal::ctrl_c().await?;
            info!("Shutdown requested");
        }
    }

    report.abort();
    coordinator.stop().await;
    Ok(())
}

async fn run_workflow(
    config: ConvoyConfig,
    path: &std::path::Path,
    params: Option<&str>,
) -> anyhow::Result<()> {
    let definition = WorkflowDefinition::load(path)?;
    let params: Option<Payload> = params.map(serde_json::from_str::<Payload>).transpose()?;

    let coordinator = build_coordinator(config)?;
    coordinator.start();
    let result = coordinator.execute_workflow(&definition, params).await;
    coordinator.stop().await;

    let execution = result?;
    println!("{}", serde_json::to_string_pretty(&execution)?);
    if execution.status != WorkflowStatus::Completed {
        anyhow::bail!(
            "workflow '{}' ended {:?}: {}",
            definition.id,
            execution.status,
            execution.error.as_deref().unwrap_or("see task errors")
        );
    }
    Ok(())
}
