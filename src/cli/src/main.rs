//! kvq CLI - operator tooling for kvq job queues.
//!
//! Provides job, lock, and configuration commands against the configured store.

mod commands;
mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use commands::{config, job, lock};
use kvq_core::config::Config;
use kvq_core::jobs::KvJobBackend;
use output::OutputFormat;

/// kvq - lease-based job queue on a key-value store
#[derive(Parser)]
#[command(
    name = "kvq",
    version,
    about = "kvq - lease-based job queue on a key-value store",
    long_about = "Inspect and administer kvq job queues: enqueue jobs, list due work, and recover leases.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// Configuration file (TOML, YAML or JSON); KVQ__* variables override it
    #[arg(short, long, global = true, env = "KVQ_CONFIG")]
    config: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Emit logs to stderr using the configured logging settings
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Job operations
    #[command(subcommand)]
    Job(job::JobCommands),

    /// Lease operations
    #[command(subcommand)]
    Lock(lock::LockCommands),

    /// Configuration inspection
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => Config::load().context("Failed to load configuration from the environment")?,
    };
    Ok(config)
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_ref())?;
    if cli.verbose {
        kvq_core::telemetry::init_telemetry(&config.telemetry)?;
    }
    let format = cli.output;

    match cli.command {
        Commands::Config(cmd) => config::execute(cmd, &config, format),
        Commands::Job(cmd) => {
            let backend = KvJobBackend::connect(&config.store, config.queue.clone()).await?;
            job::execute(cmd, &backend, format).await
        }
        Commands::Lock(cmd) => {
            let backend = KvJobBackend::connect(&config.store, config.queue.clone()).await?;
            lock::execute(cmd, &backend, format).await
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli).await {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
