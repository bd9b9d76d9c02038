//! Job commands.
//!
//! Provides enqueue, available, count, and purge operations.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use kvq_core::jobs::{Job, JobBackend, KvJobBackend, NewJob};
use serde::Serialize;
use tabled::Tabled;

use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum JobCommands {
    /// Enqueue a new job
    Enqueue {
        /// Opaque payload handed to the worker
        #[arg(required_unless_present = "attributes", conflicts_with = "attributes")]
        payload: Option<String>,

        /// Target queue (default: the configured default queue)
        #[arg(short, long)]
        queue: Option<String>,

        /// Priority; lower runs first
        #[arg(short, long, default_value = "0", allow_negative_numbers = true)]
        priority: i32,

        /// Earliest execution time (RFC 3339)
        #[arg(long, conflicts_with = "delay")]
        run_at: Option<DateTime<Utc>>,

        /// Delay before the job becomes due, in seconds
        #[arg(long)]
        delay: Option<i64>,

        /// Full attribute map as JSON, e.g. '{"handler":"x","queue":"mail"}'
        #[arg(long)]
        attributes: Option<String>,
    },

    /// List due, unclaimed jobs in scan order
    Available {
        /// Maximum number of results
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Worker identity reported in logs
        #[arg(short, long, default_value = "kvq-cli")]
        worker: String,
    },

    /// Count records in the namespace, claimed ones included
    Count,

    /// Delete every record in the namespace
    Purge {
        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Debug, Serialize, Tabled)]
pub(crate) struct JobRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Queue")]
    queue: String,
    #[tabled(rename = "Priority")]
    priority: i32,
    #[tabled(rename = "Run At")]
    run_at: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Locked By")]
    locked_by: String,
}

impl From<&Job> for JobRow {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.to_string(),
            queue: job.queue.clone(),
            priority: job.priority,
            run_at: job.run_at.to_rfc3339(),
            attempts: job.attempts,
            state: job.state().to_string(),
            locked_by: job.locked_by.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Serialize)]
struct CountResponse {
    namespace: String,
    count: u64,
}

/// `--run-at` wins; otherwise `--delay` seconds from `now`.
fn resolve_run_at(
    run_at: Option<DateTime<Utc>>,
    delay: Option<i64>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    match (run_at, delay) {
        (Some(at), _) => Ok(Some(at)),
        (None, Some(secs)) => {
            let at = chrono::Duration::try_seconds(secs).and_then(|d| now.checked_add_signed(d));
            let Some(at) = at else {
                bail!("--delay {} is out of range", secs);
            };
            Ok(Some(at))
        }
        (None, None) => Ok(None),
    }
}

pub async fn execute(cmd: JobCommands, backend: &KvJobBackend, format: OutputFormat) -> Result<()> {
    match cmd {
        JobCommands::Enqueue {
            payload,
            queue,
            priority,
            run_at,
            delay,
            attributes,
        } => {
            let new_job = match (payload, attributes) {
                (_, Some(raw)) => {
                    let value: serde_json::Value =
                        serde_json::from_str(&raw).context("Failed to parse --attributes as JSON")?;
                    let map = value
                        .as_object()
                        .context("--attributes must be a JSON object")?;
                    NewJob::from_attributes(map)?
                }
                (Some(payload), None) => {
                    let mut job = NewJob::new(payload).priority(priority);
                    if let Some(queue) = queue {
                        job = job.queue(queue);
                    }
                    if let Some(at) = resolve_run_at(run_at, delay, Utc::now())? {
                        job = job.run_at(at);
                    }
                    job
                }
                (None, None) => bail!("a payload or --attributes is required"),
            };

            let job = backend.create(new_job).await?;

            match format {
                OutputFormat::Table => {
                    output::print_success("Job enqueued");
                    output::print_detail("ID", job.id.as_str());
                    output::print_detail("Queue", &job.queue);
                    output::print_detail("Priority", &job.priority.to_string());
                    output::print_detail("Run At", &job.run_at.to_rfc3339());
                }
                _ => output::print_item(&JobRow::from(&job), format)?,
            }
        }

        JobCommands::Available { limit, worker } => {
            let max_run_time = backend.settings().max_run_time;
            let jobs = backend.find_available(&worker, limit, max_run_time).await?;
            let rows: Vec<JobRow> = jobs.iter().map(JobRow::from).collect();
            output::print_list(&rows, format)?;
        }

        JobCommands::Count => {
            let count = backend.count().await?;
            let namespace = backend.settings().namespace.clone();
            match format {
                OutputFormat::Table => {
                    output::print_detail("Namespace", &namespace);
                    output::print_detail("Records", &count.to_string());
                }
                _ => output::print_item(&CountResponse { namespace, count }, format)?,
            }
        }

        JobCommands::Purge { force } => {
            if !force {
                output::print_warning(&format!(
                    "This deletes every job and lock in namespace '{}'. Re-run with --force.",
                    backend.settings().namespace
                ));
                return Ok(());
            }
            let removed = backend.delete_all().await?;
            match format {
                OutputFormat::Table => output::print_success(&format!("Removed {} records", removed)),
                _ => output::print_item(&serde_json::json!({ "removed": removed }), format)?,
            }
        }
    }

    Ok(())
}
