//! Discovery of claimable jobs.
//!
//! Primary keys sort by queue, then `run_at`, then priority, then id, so the
//! due jobs of a queue are exactly the keys in
//! `[{ns}_{queue}_, due_upper_bound(now))`, already in execution order.

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use super::codec::KeyCodec;
use super::job::Job;
use crate::config::QueueSettings;
use crate::error::Result;
use crate::store::{KvStore, RangeRequest};
use crate::telemetry::JobMetrics;

/// Range-scans the configured queues for due, unclaimed jobs.
#[derive(Clone)]
pub struct AvailabilityScanner {
    store: Arc<dyn KvStore>,
    settings: QueueSettings,
    codec: KeyCodec,
}

impl AvailabilityScanner {
    pub fn new(store: Arc<dyn KvStore>, settings: QueueSettings) -> Self {
        let codec = settings.codec();
        Self {
            store,
            settings,
            codec,
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Up to `limit` claimable jobs, oldest `run_at` first within each queue,
    /// queues in configured order.
    ///
    /// Candidates are fresh reads, each carrying the revision a claim must
    /// match. Another worker may win any of them first.
    pub async fn find_available(&self, worker: &str, limit: usize, max_run_time: Duration) -> Result<Vec<Job>> {
        self.find_available_at(worker, limit, max_run_time, Utc::now()).await
    }

    /// [`find_available`](Self::find_available) with an explicit clock.
    #[instrument(skip(self, now), fields(max_run_time_secs = max_run_time.as_secs()))]
    pub async fn find_available_at(
        &self,
        worker: &str,
        limit: usize,
        max_run_time: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let fetch = limit.saturating_mul(self.settings.read_ahead);
        let now_secs = now.timestamp();

        let scans = self.settings.effective_queues().into_iter().map(|queue| {
            let request = RangeRequest::between(
                self.codec.queue_prefix(&queue),
                self.codec.due_upper_bound(&queue, now_secs),
            )
            .with_limit(fetch);
            self.store.range(request)
        });
        let per_queue = try_join_all(scans).await?;

        let candidates: Vec<_> = per_queue.into_iter().flatten().take(fetch).collect();
        JobMetrics::scan_candidates(candidates.len());

        let mut available = Vec::with_capacity(limit.min(candidates.len()));
        for entry in &candidates {
            let job = Job::from_key_value(entry).map_err(|e| {
                e.log();
                e
            })?;
            if job.is_failed() || job.is_locked() {
                continue;
            }
            if !self.settings.priority_allowed(job.priority) {
                continue;
            }
            available.push(job);
            if available.len() == limit {
                break;
            }
        }

        debug!(
            candidates = candidates.len(),
            available = available.len(),
            "Availability scan finished"
        );
        Ok(available)
    }
}
