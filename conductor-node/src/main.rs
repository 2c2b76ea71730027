//! # Conductor Node
//!
//! Daemon hosting one coordination kernel. Runs the liveness sweep until
//! interrupted; a few one-shot subcommands inspect configuration and state.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use conductor_core::config::KernelConfig;
use conductor_core::Kernel;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(about = "Conductor - coordination kernel for agent sessions")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ./conductor.toml or the user config dir)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the kernel until Ctrl-C
    Serve,

    /// Check that the configured store is reachable
    Health,

    /// Configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Tasks of a project that are ready to be picked up
    Ready {
        project: String,

        /// Include tasks that already have a live session
        #[arg(long)]
        include_assigned: bool,

        /// Output JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = cli.log_level.clone().unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    if let Err(e) = run(cli).await {
        error!("Command failed: {:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => KernelConfig::load_from(path.clone())
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => KernelConfig::load().context("loading config")?,
    };

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Health => {
            let kernel = Kernel::from_config(config)?;
            if kernel.health_check().await {
                println!("ok ({})", kernel.context().store.name());
                Ok(())
            } else {
                anyhow::bail!("store {} is unhealthy", kernel.context().store.name())
            }
        }
        Commands::Config { action: ConfigAction::Show } => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Ready {
            project,
            include_assigned,
            json,
        } => {
            let kernel = Kernel::from_config(config)?;
            let tasks = kernel
                .tasks()
                .list_ready_with(&project, include_assigned)
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tasks)?);
            } else if tasks.is_empty() {
                println!("no ready tasks in {}", project);
            } else {
                for task in tasks {
                    println!("{}  [{:?}]  {}", task.id, task.priority, task.title);
                }
            }
            Ok(())
        }
    }
}

async fn serve(config: KernelConfig) -> anyhow::Result<()> {
    let kernel = Kernel::from_config(config)?;
    anyhow::ensure!(kernel.health_check().await, "store is unhealthy");

    let token = CancellationToken::new();
    let monitor = kernel.start_liveness_monitor(token.clone());
    info!(
        store = kernel.context().store.name(),
        sweep_secs = kernel.config().session.sweep_interval_secs,
        "Conductor node running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;

    info!("Shutting down");
    token.cancel();
    monitor.stop().await;
    Ok(())
}
