//! Lease commands.
//!
//! Lists and recovers the jobs workers currently hold.

use anyhow::Result;
use clap::Subcommand;
use kvq_core::jobs::{JobBackend, KvJobBackend};
use serde::Serialize;
use std::time::Duration;

use super::job::JobRow;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum LockCommands {
    /// List the jobs a worker holds
    List {
        /// Worker identity, e.g. host:pid
        worker: String,
    },

    /// Return every job a worker holds to the queue (after a crash)
    Clear {
        /// Worker identity, e.g. host:pid
        worker: String,
    },

    /// Return leases older than the maximum run time to the queue
    Recover {
        /// Maximum run time in seconds (default: the configured value)
        #[arg(long)]
        max_run_time: Option<u64>,
    },
}

#[derive(Debug, Serialize)]
struct RecoveryResponse {
    recovered: usize,
}

pub async fn execute(cmd: LockCommands, backend: &KvJobBackend, format: OutputFormat) -> Result<()> {
    match cmd {
        LockCommands::List { worker } => {
            let jobs = backend.worker_locks(&worker).await?;
            let rows: Vec<JobRow> = jobs.iter().map(JobRow::from).collect();
            output::print_list(&rows, format)?;
        }

        LockCommands::Clear { worker } => {
            let recovered = backend.clear_locks(&worker).await?;
            match format {
                OutputFormat::Table => output::print_success(&format!(
                    "Returned {} job(s) held by {} to the queue",
                    recovered, worker
                )),
                _ => output::print_item(&RecoveryResponse { recovered }, format)?,
            }
        }

        LockCommands::Recover { max_run_time } => {
            let max_run_time = max_run_time
                .map(Duration::from_secs)
                .unwrap_or(backend.settings().max_run_time);
            let recovered = backend.recover_expired_locks(max_run_time).await?;
            match format {
                OutputFormat::Table => {
                    output::print_header("Lease recovery");
                    output::print_detail("Max run time", &format!("{}s", max_run_time.as_secs()));
                    output::print_detail("Recovered", &recovered.to_string());
                }
                _ => output::print_item(&RecoveryResponse { recovered }, format)?,
            }
        }
    }

    Ok(())
}
