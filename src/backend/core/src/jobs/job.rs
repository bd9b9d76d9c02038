//! Job records.
//!
//! A [`Job`] is what lives in the store: scheduling metadata, an opaque
//! payload, execution bookkeeping and (while claimed) lock metadata. Records
//! are created through [`NewJob`]; everything else comes back from the store
//! via [`Job::from_key_value`].

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

use super::codec::{KeyCodec, LOCK_SEGMENT};
use crate::error::{ErrorCode, ErrorContext, KvqError, Result};
use crate::store::{KeyValue, Revision};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job.
///
/// Generated ids are `"0"` followed by a UUIDv7, so they sort by creation time
/// and never start with a character that could escape a range scan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Create a new time-ordered job ID.
    pub fn generate() -> Self {
        Self(format!("0{}", Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job State
// ═══════════════════════════════════════════════════════════════════════════════

/// Where a record sits in its lifecycle, as derived from its fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting under its primary key
    Pending,
    /// Claimed by a worker, stored under a lock key
    Locked,
    /// Failure recorded; ignored by the scanner
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Locked => write!(f, "locked"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Drop sub-second precision; keys and the wire form carry whole seconds.
pub fn truncate_to_secs(at: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_opt(at.timestamp(), 0).single().unwrap_or(at)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Record
// ═══════════════════════════════════════════════════════════════════════════════

/// A job as stored in the key-value store.
///
/// Equality and hashing use only `id`.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    /// Lower runs first among jobs with the same `run_at`.
    pub priority: i32,
    pub run_at: DateTime<Utc>,
    /// Opaque payload, stored as `handler`.
    pub payload: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    mod_revision: Option<Revision>,
    stored_key: Option<String>,
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Job {}

impl Hash for Job {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Job {
    /// Store revision observed at the last read or write.
    pub fn mod_revision(&self) -> Option<Revision> {
        self.mod_revision
    }

    /// Key the record was last read from or written to.
    pub fn stored_key(&self) -> Option<&str> {
        self.stored_key.as_deref()
    }

    pub(crate) fn set_stored(&mut self, key: String, revision: Revision) {
        self.stored_key = Some(key);
        self.mod_revision = Some(revision);
    }

    pub fn is_locked(&self) -> bool {
        self.locked_by.is_some()
    }

    pub fn is_failed(&self) -> bool {
        self.failed_at.is_some()
    }

    pub fn state(&self) -> JobState {
        if self.is_locked() {
            JobState::Locked
        } else if self.is_failed() {
            JobState::Failed
        } else {
            JobState::Pending
        }
    }

    /// Mark as claimed by `worker`.
    pub fn lock(&mut self, worker: impl Into<String>, at: DateTime<Utc>) {
        self.locked_by = Some(worker.into());
        self.locked_at = Some(truncate_to_secs(at));
    }

    pub fn unlock(&mut self) {
        self.locked_by = None;
        self.locked_at = None;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Keys
    // ─────────────────────────────────────────────────────────────────────────

    pub fn primary_key(&self, codec: &KeyCodec) -> String {
        codec.primary_key(&self.queue, self.run_at.timestamp(), self.priority, self.id.as_str())
    }

    /// Lock key for the current holder, if any.
    pub fn lock_key(&self, codec: &KeyCodec) -> Option<String> {
        self.locked_by
            .as_deref()
            .map(|worker| codec.lock_key(worker, self.id.as_str()))
    }

    /// The key this record belongs under in its current form.
    pub fn storage_key(&self, codec: &KeyCodec) -> String {
        self.lock_key(codec).unwrap_or_else(|| self.primary_key(codec))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Wire Form
    // ─────────────────────────────────────────────────────────────────────────

    /// Serialize all non-null attributes as JSON, timestamps as epoch seconds.
    pub fn to_wire_form(&self) -> Result<Vec<u8>> {
        let wire = WireJob {
            id: self.id.as_str().to_string(),
            queue: self.queue.clone(),
            priority: self.priority,
            run_at: self.run_at.timestamp(),
            handler: self.payload.clone(),
            attempts: self.attempts,
            last_error: self.last_error.clone(),
            failed_at: self.failed_at.map(|t| t.timestamp()),
            locked_at: self.locked_at.map(|t| t.timestamp()),
            locked_by: self.locked_by.clone(),
        };
        serde_json::to_vec(&wire).with_error_code(ErrorCode::SerializationError)
    }

    /// Parse a stored value; `revision` is the entry's mod revision.
    pub fn from_wire_form(bytes: &[u8], revision: Revision) -> Result<Self> {
        let wire: WireJob = serde_json::from_slice(bytes)?;
        let timestamp = |field: &str, secs: i64| {
            Utc.timestamp_opt(secs, 0).single().ok_or_else(|| {
                KvqError::new(ErrorCode::MalformedRecord, format!("{} out of range: {}", field, secs))
            })
        };

        if wire.id.is_empty() {
            return Err(KvqError::new(ErrorCode::MalformedRecord, "empty job id"));
        }

        Ok(Self {
            id: JobId(wire.id),
            queue: wire.queue,
            priority: wire.priority,
            run_at: timestamp("run_at", wire.run_at)?,
            payload: wire.handler,
            attempts: wire.attempts,
            last_error: wire.last_error,
            failed_at: wire.failed_at.map(|s| timestamp("failed_at", s)).transpose()?,
            locked_at: wire.locked_at.map(|s| timestamp("locked_at", s)).transpose()?,
            locked_by: wire.locked_by,
            mod_revision: Some(revision),
            stored_key: None,
        })
    }

    /// Materialize a store entry, remembering where it came from.
    pub fn from_key_value(kv: &KeyValue) -> Result<Self> {
        let mut job = Self::from_wire_form(&kv.value, kv.mod_revision)
            .map_err(|e| KvqError::malformed_record(&kv.key, e.to_string()))?;
        job.stored_key = Some(kv.key.clone());
        Ok(job)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireJob {
    id: String,
    queue: String,
    #[serde(default)]
    priority: i32,
    run_at: i64,
    handler: String,
    #[serde(default)]
    attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    locked_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    locked_by: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// New Job Builder
// ═══════════════════════════════════════════════════════════════════════════════

/// A job that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    payload: String,
    queue: Option<String>,
    priority: i32,
    run_at: Option<DateTime<Utc>>,
    attempts: u32,
}

const KNOWN_ATTRIBUTES: &[&str] = &["payload", "handler", "queue", "priority", "run_at", "attempts"];

impl NewJob {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            queue: None,
            priority: 0,
            run_at: None,
            attempts: 0,
        }
    }

    /// Target queue; blank means the configured default.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Earliest execution time; unset means now.
    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Build from a loosely-typed attribute map.
    ///
    /// Accepts `payload` (or `handler`), `queue`, `priority`, `run_at` (epoch
    /// seconds or RFC 3339) and `attempts`. Unknown keys and ill-typed values
    /// are rejected.
    pub fn from_attributes(attributes: &Map<String, Value>) -> Result<Self> {
        if let Some(unknown) = attributes
            .keys()
            .find(|k| !KNOWN_ATTRIBUTES.contains(&k.as_str()))
        {
            return Err(KvqError::invalid_input(format!("unknown job attribute: {}", unknown)));
        }

        let payload = match (attributes.get("payload"), attributes.get("handler")) {
            (Some(_), Some(_)) => {
                return Err(KvqError::invalid_input("payload and handler are aliases; pass only one"))
            }
            (Some(Value::String(p)), None) | (None, Some(Value::String(p))) => p.clone(),
            (None, None) => return Err(KvqError::invalid_input("payload is required")),
            _ => return Err(KvqError::invalid_input("payload must be a string")),
        };

        let mut job = Self::new(payload);

        match attributes.get("queue") {
            None | Some(Value::Null) => {}
            Some(Value::String(q)) => job.queue = Some(q.clone()),
            Some(_) => return Err(KvqError::invalid_input("queue must be a string")),
        }

        if let Some(value) = attributes.get("priority") {
            job.priority = value
                .as_i64()
                .and_then(|p| i32::try_from(p).ok())
                .ok_or_else(|| KvqError::invalid_input("priority must be a 32-bit integer"))?;
        }

        match attributes.get("run_at") {
            None | Some(Value::Null) => {}
            Some(Value::Number(n)) => {
                let secs = n
                    .as_i64()
                    .ok_or_else(|| KvqError::invalid_input("run_at must be whole epoch seconds"))?;
                let at = Utc
                    .timestamp_opt(secs, 0)
                    .single()
                    .ok_or_else(|| KvqError::invalid_input("run_at out of range"))?;
                job.run_at = Some(at);
            }
            Some(Value::String(s)) => {
                let at = DateTime::parse_from_rfc3339(s)
                    .map_err(|e| KvqError::invalid_input(format!("run_at is not RFC 3339: {}", e)))?;
                job.run_at = Some(at.with_timezone(&Utc));
            }
            Some(_) => return Err(KvqError::invalid_input("run_at must be a number or string")),
        }

        if let Some(value) = attributes.get("attempts") {
            job.attempts = value
                .as_u64()
                .and_then(|a| u32::try_from(a).ok())
                .ok_or_else(|| KvqError::invalid_input("attempts must be a non-negative integer"))?;
        }

        Ok(job)
    }

    /// Resolve defaults and assign an id.
    pub(crate) fn into_job(self, default_queue: &str, now: DateTime<Utc>) -> Result<Job> {
        let queue = match self.queue {
            Some(q) if !q.trim().is_empty() => q,
            _ => default_queue.to_string(),
        };
        if queue == LOCK_SEGMENT {
            return Err(KvqError::invalid_input(format!(
                "queue name '{}' is reserved",
                LOCK_SEGMENT
            )));
        }

        Ok(Job {
            id: JobId::generate(),
            queue,
            priority: self.priority,
            run_at: truncate_to_secs(self.run_at.unwrap_or(now)),
            payload: self.payload,
            attempts: self.attempts,
            last_error: None,
            failed_at: None,
            locked_at: None,
            locked_by: None,
            mod_revision: None,
            stored_key: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(now: DateTime<Utc>) -> Job {
        NewJob::new("Mailer.deliver(42)")
            .queue("mail")
            .priority(-5)
            .into_job("default", now)
            .unwrap()
    }

    #[test]
    fn test_job_id_generation() {
        let a = JobId::generate();
        let b = JobId::generate();
        assert!(a.as_str().starts_with('0'));
        assert_ne!(a, b);
        assert!(!a.as_str().contains('_'));
    }

    #[test]
    fn test_new_job_defaults() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let job = NewJob::new("x").queue("  ").into_job("default", now).unwrap();
        assert_eq!(job.queue, "default");
        assert_eq!(job.run_at, now);
        assert_eq!(job.priority, 0);
        assert_eq!(job.state(), JobState::Pending);
        assert!(job.mod_revision().is_none());
    }

    #[test]
    fn test_reserved_queue_rejected() {
        let err = NewJob::new("x")
            .queue("lock")
            .into_job("default", Utc::now())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInput);
    }

    #[test]
    fn test_wire_form_round_trip() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut job = sample(now);
        job.attempts = 2;
        job.last_error = Some("boom".into());
        job.failed_at = Some(now);
        job.lock("w1", now);

        let bytes = job.to_wire_form().unwrap();
        let back = Job::from_wire_form(&bytes, 9).unwrap();
        assert_eq!(back, job);
        assert_eq!(back.queue, "mail");
        assert_eq!(back.priority, -5);
        assert_eq!(back.run_at, now);
        assert_eq!(back.payload, "Mailer.deliver(42)");
        assert_eq!(back.attempts, 2);
        assert_eq!(back.last_error.as_deref(), Some("boom"));
        assert_eq!(back.failed_at, Some(now));
        assert_eq!(back.locked_by.as_deref(), Some("w1"));
        assert_eq!(back.mod_revision(), Some(9));
    }

    #[test]
    fn test_wire_form_omits_nulls() {
        let job = sample(Utc::now());
        let value: Value = serde_json::from_slice(&job.to_wire_form().unwrap()).unwrap();
        let obj = value.as_object().unwrap();
        assert!(obj.contains_key("handler"));
        assert!(!obj.contains_key("payload"));
        assert!(!obj.contains_key("locked_by"));
        assert!(!obj.contains_key("failed_at"));
        assert!(obj["run_at"].is_i64());
    }

    #[test]
    fn test_wire_form_missing_fields() {
        let ok = json!({"id": "0a", "queue": "q", "run_at": 10, "handler": "h"});
        let job = Job::from_wire_form(ok.to_string().as_bytes(), 1).unwrap();
        assert_eq!(job.priority, 0);
        assert_eq!(job.attempts, 0);

        for bad in [
            json!({"queue": "q", "run_at": 10, "handler": "h"}),
            json!({"id": "0a", "run_at": 10, "handler": "h"}),
            json!({"id": "0a", "queue": "q", "handler": "h"}),
            json!({"id": "0a", "queue": "q", "run_at": "soon", "handler": "h"}),
            json!({"id": "0a", "queue": "q", "run_at": 10}),
        ] {
            let kv = KeyValue {
                key: "kvq_q_x".into(),
                value: bad.to_string().into_bytes(),
                create_revision: 1,
                mod_revision: 1,
                version: 1,
            };
            let err = Job::from_key_value(&kv).unwrap_err();
            assert_eq!(err.code(), ErrorCode::MalformedRecord, "{}", bad);
        }
    }

    #[test]
    fn test_storage_key_follows_lock() {
        let codec = KeyCodec::new("kvq");
        let mut job = sample(Utc::now());
        assert_eq!(job.storage_key(&codec), job.primary_key(&codec));
        job.lock("w1", Utc::now());
        assert_eq!(job.storage_key(&codec), codec.lock_key("w1", job.id.as_str()));
        job.unlock();
        assert!(job.lock_key(&codec).is_none());
    }

    #[test]
    fn test_equality_by_id() {
        let now = Utc::now();
        let a = sample(now);
        let mut b = a.clone();
        b.priority = 99;
        assert_eq!(a, b);
        assert_ne!(a, sample(now));
    }

    #[test]
    fn test_from_attributes() {
        let attrs = json!({"handler": "h", "queue": "q", "priority": -2, "run_at": 100, "attempts": 1});
        let job = NewJob::from_attributes(attrs.as_object().unwrap()).unwrap();
        assert_eq!(job, NewJob::new("h").queue("q").priority(-2).run_at(Utc.timestamp_opt(100, 0).unwrap()).attempts(1));

        let rfc = json!({"payload": "h", "run_at": "2024-01-01T00:00:00Z"});
        assert!(NewJob::from_attributes(rfc.as_object().unwrap()).is_ok());
    }

    #[test]
    fn test_from_attributes_rejects_bad_input() {
        for bad in [
            json!({"payload": "h", "colour": "red"}),
            json!({"priority": 1}),
            json!({"payload": 5}),
            json!({"payload": "h", "priority": 1u64 << 40}),
            json!({"payload": "h", "attempts": -1}),
            json!({"payload": "h", "handler": "h"}),
        ] {
            let err = NewJob::from_attributes(bad.as_object().unwrap()).unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidInput, "{}", bad);
        }
    }
}
