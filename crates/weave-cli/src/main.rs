mod config;
mod echo;
mod taskfile;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::{LogFormat, LoggingConfig, WeaveConfig};
use std::path::PathBuf;
use std::sync::Arc;
use taskfile::TaskFile;
use tracing::info;
use tracing_subscriber::EnvFilter;
use weave_memory::SharedStateStore;
use weave_orchestrator::Orchestrator;

#[derive(Parser)]
#[command(name = "weave", about = "Weave: dependency-aware task orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "weave.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the execution layers of a task file
    Plan {
        /// TOML task file
        file: PathBuf,
    },
    /// Run a task file with echo workers and print the summary
    Run {
        /// TOML task file
        file: PathBuf,
        /// Scheduling passes before giving up
        #[arg(long, default_value_t = 1000)]
        max_iterations: usize,
    },
    /// Load a task file and print the system status
    Status {
        /// TOML task file
        file: PathBuf,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

async fn build_orchestrator(config: &WeaveConfig) -> anyhow::Result<Orchestrator> {
    let orchestrator = match &config.state.persistence_path {
        Some(path) => {
            let store = SharedStateStore::open(path.clone())
                .await
                .with_context(|| format!("Failed to open state file '{}'", path.display()))?;
            info!(path = %path.display(), keys = store.len(), "Shared state loaded");
            Orchestrator::with_shared_state(config.orchestrator.clone(), Arc::new(store))
        }
        None => Orchestrator::new(config.orchestrator.clone()),
    };
    Ok(orchestrator)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = config::load_or_default(&cli.config)?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Plan { file } => {
            let tasks = TaskFile::load(&file)?;
            let orchestrator = build_orchestrator(&config).await?;
            let names = tasks.submit(&orchestrator)?;
            let plan = taskfile::plan_report(&orchestrator, &names)?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        Commands::Run {
            file,
            max_iterations,
        } => {
            let tasks = TaskFile::load(&file)?;
            let orchestrator = build_orchestrator(&config).await?;
            tasks.register_agents(&orchestrator)?;
            let names = tasks.submit(&orchestrator)?;
            if names.is_empty() {
                info!(file = %file.display(), "Task file declares no tasks");
            }

            info!(file = %file.display(), "Running task file");
            let summary = orchestrator.execute_all(max_iterations).await;
            let report = taskfile::run_report(&summary, &names, &orchestrator);
            println!("{}", serde_json::to_string_pretty(&report)?);

            if !summary.is_success() {
                anyhow::bail!(
                    "{} of {} task(s) did not complete",
                    summary.failed.len() + summary.cancelled.len() + summary.pending.len(),
                    names.len()
                );
            }
        }
        Commands::Status { file } => {
            let tasks = TaskFile::load(&file)?;
            let orchestrator = build_orchestrator(&config).await?;
            tasks.register_agents(&orchestrator)?;
            tasks.submit(&orchestrator)?;
            let status = orchestrator.system_status();
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}
