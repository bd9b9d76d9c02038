//! Leases: claiming, releasing and recovering jobs.
//!
//! A claimed job lives under `{ns}_lock_{worker}_{id}` instead of its primary
//! key. Every move between the two forms is one guarded transaction, so a job
//! is always stored under exactly one key and at most one worker can win it.
//!
//! ```text
//!  Unclaimed ──claim──▶ Claimed ──release / fail──▶ Unclaimed
//!      ▲                   │ ╲
//!      └──clear_locks──────┘  ╲──destroy──▶ (gone)
//!         recover_expired_locks
//! ```

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::codec::KeyCodec;
use super::job::{truncate_to_secs, Job};
use crate::config::QueueSettings;
use crate::error::{KvqError, Result};
use crate::store::{KeyValue, KvStore, RangeRequest, Txn};
use crate::telemetry::{ClaimMetrics, JobMetrics};

/// Owns every state transition of a job record.
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn KvStore>,
    codec: KeyCodec,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn KvStore>, settings: &QueueSettings) -> Self {
        Self {
            store,
            codec: settings.codec(),
        }
    }

    pub fn codec(&self) -> &KeyCodec {
        &self.codec
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Claim
    // ─────────────────────────────────────────────────────────────────────────

    /// Claim `job` for `worker`.
    ///
    /// Succeeds only if the primary key is still at the revision the job was
    /// read at. On success the job is updated in place (lock fields, revision,
    /// stored key). A lost race is `ClaimConflict`; nothing is retried.
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    pub async fn claim(&self, job: &mut Job, worker: &str) -> Result<()> {
        let revision = job
            .mod_revision()
            .filter(|rev| *rev > 0)
            .ok_or_else(|| KvqError::invalid_input("job has no observed store revision; read it from the store first"))?;

        let primary = match job.stored_key() {
            Some(key) if self.codec.is_lock_key(key) => {
                return Err(KvqError::invalid_input(format!(
                    "job {} is already claimed",
                    job.id
                )));
            }
            Some(key) => key.to_string(),
            None => job.primary_key(&self.codec),
        };

        let mut claimed = job.clone();
        claimed.lock(worker, Utc::now());
        let lock_key = claimed.storage_key(&self.codec);

        let txn = Txn::new()
            .when_mod_revision(&primary, revision)
            .delete(&primary)
            .put(&lock_key, claimed.to_wire_form()?);
        let response = self.store.transact(txn).await?;

        if response.succeeded {
            claimed.set_stored(lock_key, response.revision);
            *job = claimed;
            ClaimMetrics::won();
            debug!(revision = response.revision, "Job claimed");
            Ok(())
        } else {
            ClaimMetrics::conflict();
            debug!(observed = revision, "Claim lost; job changed since it was read");
            Err(KvqError::claim_conflict(job.id.as_str(), worker))
        }
    }

    /// [`claim`](Self::claim) with a lost race reported as `false`.
    pub async fn lock_exclusively(&self, job: &mut Job, worker: &str) -> Result<bool> {
        match self.claim(job, worker).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_claim_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Release / finalize
    // ─────────────────────────────────────────────────────────────────────────

    /// Persist `job` under the key its current fields call for.
    ///
    /// - never stored: plain put (creation)
    /// - stored: one transaction guarded on the revision the job was read at,
    ///   rewriting the same key or deleting the old key and writing the new one
    ///
    /// A failed guard means the record changed underneath this handle. When
    /// the job was leaving a lock key (release or fail) a sweep has already
    /// returned it to the queue, so the write is dropped and logged. Any other
    /// stale write is rejected with `ClaimConflict`; reload and retry.
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    pub async fn save(&self, job: &mut Job) -> Result<()> {
        let target = job.storage_key(&self.codec);
        let value = job.to_wire_form()?;

        let (current, revision) = match (job.stored_key(), job.mod_revision()) {
            (Some(key), Some(revision)) => (key.to_string(), revision),
            _ => {
                let revision = self.store.put(&target, value).await?;
                debug!(key = %target, revision, "Job saved");
                job.set_stored(target, revision);
                return Ok(());
            }
        };

        let mut txn = Txn::new().when_mod_revision(&current, revision);
        if current != target {
            txn = txn.delete(&current);
        }
        let response = self.store.transact(txn.put(&target, value)).await?;

        if response.succeeded {
            debug!(from = %current, to = %target, revision = response.revision, "Job saved");
            job.set_stored(target, response.revision);
            return Ok(());
        }

        if current != target && self.codec.is_lock_key(&current) {
            KvqError::not_found("lock", &current).log();
            warn!(
                lock_key = %current,
                "Lock was recovered before release; leaving the recovered record in place"
            );
            return Ok(());
        }

        debug!(key = %current, observed = revision, "Save rejected; record changed since it was read");
        Err(KvqError::stale_write(job.id.as_str(), &current))
    }

    /// Delete the job's current record. A missing record is not an error.
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    pub async fn destroy(&self, job: &Job) -> Result<()> {
        let key = job
            .stored_key()
            .map(str::to_string)
            .unwrap_or_else(|| job.storage_key(&self.codec));

        let removed = match job.mod_revision() {
            Some(revision) => {
                let txn = Txn::new().when_mod_revision(&key, revision).delete(&key);
                self.store.transact(txn).await?.succeeded
            }
            None => self.store.delete(&key).await? > 0,
        };

        if removed {
            JobMetrics::destroyed();
            debug!(key = %key, "Job destroyed");
        } else {
            KvqError::not_found("job", job.id.as_str()).log();
        }
        Ok(())
    }

    /// Clear the lock and put the job back under its primary key.
    pub async fn release(&self, job: &mut Job) -> Result<()> {
        job.unlock();
        self.save(job).await
    }

    /// Record a failure: set `failed_at`, clear the lock and save.
    pub async fn fail(&self, job: &mut Job) -> Result<()> {
        job.failed_at = Some(truncate_to_secs(Utc::now()));
        job.unlock();
        self.save(job).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Recovery
    // ─────────────────────────────────────────────────────────────────────────

    /// Jobs currently claimed by `worker`.
    pub async fn worker_locks(&self, worker: &str) -> Result<Vec<Job>> {
        let prefix = self.codec.worker_lock_prefix(worker);
        let entries = self.store.range(RangeRequest::prefix(prefix)).await?;
        entries.iter().map(Job::from_key_value).collect()
    }

    /// Return every job `worker` holds to the primary keyspace.
    ///
    /// Meant for a worker restarting under the same identity. Idempotent: with
    /// no locks it returns 0 and changes nothing.
    #[instrument(skip(self))]
    pub async fn clear_locks(&self, worker: &str) -> Result<usize> {
        let prefix = self.codec.worker_lock_prefix(worker);
        let entries = self.store.range(RangeRequest::prefix(prefix)).await?;

        let mut recovered = 0;
        for entry in &entries {
            if self.return_to_queue(entry).await? {
                recovered += 1;
            }
        }

        if recovered > 0 {
            JobMetrics::locks_recovered("worker", recovered);
            info!(recovered, "Cleared worker locks");
        }
        Ok(recovered)
    }

    /// Return every lock older than `max_run_time` to the primary keyspace,
    /// whichever worker holds it. Never runs on its own.
    #[instrument(skip(self), fields(max_run_time_secs = max_run_time.as_secs()))]
    pub async fn recover_expired_locks(&self, max_run_time: Duration) -> Result<usize> {
        let max_run_time = chrono::Duration::from_std(max_run_time)
            .map_err(|e| KvqError::invalid_input(format!("max_run_time out of range: {}", e)))?;
        let cutoff = Utc::now() - max_run_time;

        let entries = self
            .store
            .range(RangeRequest::prefix(self.codec.lock_prefix()))
            .await?;

        let mut recovered = 0;
        for entry in &entries {
            let expired = match Job::from_key_value(entry) {
                Ok(job) => job.locked_at.map_or(true, |at| at < cutoff),
                Err(e) => {
                    e.log();
                    continue;
                }
            };
            if expired && self.return_to_queue(entry).await? {
                recovered += 1;
            }
        }

        if recovered > 0 {
            JobMetrics::locks_recovered("expired", recovered);
            info!(recovered, "Recovered expired locks");
        }
        Ok(recovered)
    }

    /// Move one lock entry back under its primary key, guarded on the lock's
    /// revision. Returns whether this call moved it. Malformed records are
    /// logged and skipped.
    async fn return_to_queue(&self, entry: &KeyValue) -> Result<bool> {
        let mut job = match Job::from_key_value(entry) {
            Ok(job) => job,
            Err(e) => {
                e.log();
                return Ok(false);
            }
        };
        job.unlock();
        let primary = job.primary_key(&self.codec);

        let txn = Txn::new()
            .when_mod_revision(&entry.key, entry.mod_revision)
            .delete(&entry.key)
            .put(&primary, job.to_wire_form()?);
        let response = self.store.transact(txn).await?;

        if response.succeeded {
            debug!(job_id = %job.id, from = %entry.key, "Lock returned to queue");
        } else {
            debug!(job_id = %job.id, from = %entry.key, "Lock changed during recovery; skipped");
        }
        Ok(response.succeeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::jobs::job::NewJob;
    use crate::store::InMemoryStore;

    async fn stored_job(lease: &LeaseManager) -> Job {
        let mut job = NewJob::new("payload").into_job("default", Utc::now()).unwrap();
        lease.save(&mut job).await.unwrap();
        job
    }

    fn manager() -> (Arc<InMemoryStore>, LeaseManager) {
        let store = Arc::new(InMemoryStore::new());
        let lease = LeaseManager::new(store.clone(), &QueueSettings::default());
        (store, lease)
    }

    #[tokio::test]
    async fn test_claim_moves_record_to_lock_key() {
        let (store, lease) = manager();
        let mut job = stored_job(&lease).await;
        let primary = job.primary_key(lease.codec());

        lease.claim(&mut job, "w1").await.unwrap();

        assert_eq!(job.locked_by.as_deref(), Some("w1"));
        assert!(job.locked_at.is_some());
        assert!(store.get(&primary).await.unwrap().is_none());
        let lock_key = lease.codec().lock_key("w1", job.id.as_str());
        let kv = store.get(&lock_key).await.unwrap().unwrap();
        assert_eq!(Some(kv.mod_revision), job.mod_revision());
        assert_eq!(job.stored_key(), Some(lock_key.as_str()));
    }

    #[tokio::test]
    async fn test_stale_claim_conflicts() {
        let (_store, lease) = manager();
        let job = stored_job(&lease).await;
        let mut first = job.clone();
        let mut second = job.clone();

        assert!(lease.lock_exclusively(&mut first, "w1").await.unwrap());
        assert!(!lease.lock_exclusively(&mut second, "w2").await.unwrap());
        assert!(second.locked_by.is_none());

        let mut third = job;
        let err = lease.claim(&mut third, "w3").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ClaimConflict);
    }

    #[tokio::test]
    async fn test_claim_requires_revision() {
        let (_store, lease) = manager();
        let mut job = NewJob::new("p").into_job("default", Utc::now()).unwrap();
        let err = lease.claim(&mut job, "w1").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInput);
    }

    #[tokio::test]
    async fn test_release_returns_to_primary_key() {
        let (store, lease) = manager();
        let mut job = stored_job(&lease).await;
        lease.claim(&mut job, "w1").await.unwrap();
        let lock_key = job.stored_key().unwrap().to_string();

        lease.release(&mut job).await.unwrap();

        assert!(store.get(&lock_key).await.unwrap().is_none());
        let primary = job.primary_key(lease.codec());
        assert!(store.get(&primary).await.unwrap().is_some());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_save_while_claimed_stays_locked() {
        let (store, lease) = manager();
        let mut job = stored_job(&lease).await;
        lease.claim(&mut job, "w1").await.unwrap();

        job.attempts += 1;
        lease.save(&mut job).await.unwrap();

        let locks = lease.worker_locks("w1").await.unwrap();
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].attempts, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_save_from_stale_handle_conflicts() {
        let (store, lease) = manager();
        let mut job = stored_job(&lease).await;
        let mut stale = job.clone();

        job.attempts = 1;
        lease.save(&mut job).await.unwrap();

        stale.priority = 9;
        let err = lease.save(&mut stale).await.unwrap_err();
        assert!(err.is_claim_conflict());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_fail_records_failure_and_unlocks() {
        let (_store, lease) = manager();
        let mut job = stored_job(&lease).await;
        lease.claim(&mut job, "w1").await.unwrap();

        job.last_error = Some("boom".into());
        lease.fail(&mut job).await.unwrap();

        assert!(job.is_failed());
        assert!(!job.is_locked());
        assert!(lease.worker_locks("w1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_missing_is_ok() {
        let (store, lease) = manager();
        let mut job = stored_job(&lease).await;
        lease.claim(&mut job, "w1").await.unwrap();

        lease.destroy(&job).await.unwrap();
        assert!(store.is_empty());
        lease.destroy(&job).await.unwrap();
    }

    #[tokio::test]
    async fn test_clear_locks_is_idempotent() {
        let (store, lease) = manager();
        let mut job = stored_job(&lease).await;
        lease.claim(&mut job, "w1").await.unwrap();

        assert_eq!(lease.clear_locks("w1").await.unwrap(), 1);
        let revision = store.revision();
        assert_eq!(lease.clear_locks("w1").await.unwrap(), 0);
        assert_eq!(store.revision(), revision);
    }

    #[tokio::test]
    async fn test_unavailable_store_propagates() {
        let (store, lease) = manager();
        let mut job = stored_job(&lease).await;
        store.set_available(false);

        let err = lease.claim(&mut job, "w1").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::StoreUnavailable);
        let err = lease.lock_exclusively(&mut job, "w1").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::StoreUnavailable);
        assert!(lease.clear_locks("w1").await.is_err());
    }
}
