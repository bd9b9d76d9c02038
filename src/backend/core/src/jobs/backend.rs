//! The producer/worker/admin surface consumed by a job-execution harness.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::job::{Job, NewJob};
use super::lease::LeaseManager;
use super::scanner::AvailabilityScanner;
use crate::config::{QueueSettings, StoreConfig};
use crate::error::{KvqError, Result};
use crate::store::{self, KvStore};
use crate::telemetry::JobMetrics;

/// Job queue operations.
///
/// A harness typically loops on [`reserve`](Self::reserve), runs the payload,
/// then calls [`destroy`](Self::destroy) on success or updates `attempts`,
/// `last_error` and `run_at` and calls [`release`](Self::release) /
/// [`fail`](Self::fail) on error. After a crash, [`clear_locks`](Self::clear_locks)
/// with the same worker identity returns its jobs to the queue.
#[async_trait]
pub trait JobBackend: Send + Sync {
    // Producer

    /// Persist a new, unclaimed job.
    async fn create(&self, job: NewJob) -> Result<Job>;

    // Worker

    /// Up to `limit` due, unclaimed, non-failed jobs inside the priority bounds.
    async fn find_available(&self, worker: &str, limit: usize, max_run_time: Duration) -> Result<Vec<Job>>;

    /// Atomically claim `job`; `false` if another worker got there first.
    async fn lock_exclusively(&self, job: &mut Job, worker: &str) -> Result<bool>;

    /// Scan and claim the first job this worker wins.
    async fn reserve(&self, worker: &str, max_run_time: Duration) -> Result<Option<Job>>;

    /// Persist changes to `job`.
    async fn save(&self, job: &mut Job) -> Result<()>;

    /// Delete `job`. Missing is not an error.
    async fn destroy(&self, job: &Job) -> Result<()>;

    /// Record a failure and release the lock.
    async fn fail(&self, job: &mut Job) -> Result<()>;

    /// Release the lock without recording a failure.
    async fn release(&self, job: &mut Job) -> Result<()>;

    /// Re-read the job from the store. Missing is `NotFound`.
    async fn reload(&self, job: &Job) -> Result<Job>;

    /// Return all of `worker`'s claimed jobs to the queue.
    async fn clear_locks(&self, worker: &str) -> Result<usize>;

    /// Jobs currently claimed by `worker`.
    async fn worker_locks(&self, worker: &str) -> Result<Vec<Job>>;

    /// Return every lease older than `max_run_time` to the queue.
    async fn recover_expired_locks(&self, max_run_time: Duration) -> Result<usize>;

    // Admin

    /// Records in the namespace, claimed ones included.
    async fn count(&self) -> Result<u64>;

    /// Delete every record in the namespace.
    async fn delete_all(&self) -> Result<u64>;
}

/// [`JobBackend`] over any [`KvStore`].
#[derive(Clone)]
pub struct KvJobBackend {
    store: Arc<dyn KvStore>,
    settings: QueueSettings,
    lease: LeaseManager,
    scanner: AvailabilityScanner,
}

impl KvJobBackend {
    /// Build a backend; `settings` are validated first.
    pub fn new(store: Arc<dyn KvStore>, settings: QueueSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            lease: LeaseManager::new(store.clone(), &settings),
            scanner: AvailabilityScanner::new(store.clone(), settings.clone()),
            store,
            settings,
        })
    }

    /// Connect to the configured store and build a backend on it.
    pub async fn connect(store_config: &StoreConfig, settings: QueueSettings) -> Result<Self> {
        let store = store::connect(store_config).await?;
        Self::new(store, settings)
    }

    /// Backend on a fresh in-memory store (for testing).
    pub fn in_memory(settings: QueueSettings) -> Result<Self> {
        Self::new(Arc::new(store::InMemoryStore::new()), settings)
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn lease(&self) -> &LeaseManager {
        &self.lease
    }

    pub fn scanner(&self) -> &AvailabilityScanner {
        &self.scanner
    }
}

#[async_trait]
impl JobBackend for KvJobBackend {
    #[instrument(skip(self, job))]
    async fn create(&self, job: NewJob) -> Result<Job> {
        let mut job = job.into_job(&self.settings.default_queue, Utc::now())?;
        self.lease.save(&mut job).await?;
        JobMetrics::created(&job.queue);
        debug!(job_id = %job.id, queue = %job.queue, run_at = %job.run_at, "Job created");
        Ok(job)
    }

    async fn find_available(&self, worker: &str, limit: usize, max_run_time: Duration) -> Result<Vec<Job>> {
        self.scanner.find_available(worker, limit, max_run_time).await
    }

    async fn lock_exclusively(&self, job: &mut Job, worker: &str) -> Result<bool> {
        self.lease.lock_exclusively(job, worker).await
    }

    #[instrument(skip(self))]
    async fn reserve(&self, worker: &str, max_run_time: Duration) -> Result<Option<Job>> {
        let candidates = self
            .scanner
            .find_available(worker, self.settings.scan_limit, max_run_time)
            .await?;

        for mut job in candidates {
            match self.lease.claim(&mut job, worker).await {
                Ok(()) => return Ok(Some(job)),
                Err(e) if e.is_claim_conflict() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    async fn save(&self, job: &mut Job) -> Result<()> {
        self.lease.save(job).await
    }

    async fn destroy(&self, job: &Job) -> Result<()> {
        self.lease.destroy(job).await
    }

    async fn fail(&self, job: &mut Job) -> Result<()> {
        self.lease.fail(job).await
    }

    async fn release(&self, job: &mut Job) -> Result<()> {
        self.lease.release(job).await
    }

    async fn reload(&self, job: &Job) -> Result<Job> {
        let key = job
            .stored_key()
            .map(str::to_string)
            .unwrap_or_else(|| job.storage_key(self.lease.codec()));
        match self.store.get(&key).await? {
            Some(entry) => Job::from_key_value(&entry),
            None => Err(KvqError::not_found("job", job.id.as_str())),
        }
    }

    async fn clear_locks(&self, worker: &str) -> Result<usize> {
        self.lease.clear_locks(worker).await
    }

    async fn worker_locks(&self, worker: &str) -> Result<Vec<Job>> {
        self.lease.worker_locks(worker).await
    }

    async fn recover_expired_locks(&self, max_run_time: Duration) -> Result<usize> {
        self.lease.recover_expired_locks(max_run_time).await
    }

    async fn count(&self) -> Result<u64> {
        self.store
            .count_prefix(&self.lease.codec().namespace_prefix())
            .await
    }

    #[instrument(skip(self))]
    async fn delete_all(&self) -> Result<u64> {
        let removed = self
            .store
            .delete_prefix(&self.lease.codec().namespace_prefix())
            .await?;
        info!(removed, namespace = %self.settings.namespace, "Deleted all jobs");
        Ok(removed)
    }
}
