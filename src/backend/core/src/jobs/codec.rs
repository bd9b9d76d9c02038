//! Order-preserving key encoding.
//!
//! Layout (segments separated by `_`):
//!
//! ```text
//! {ns}_{queue}_{run_at}_{priority}_{id}    unclaimed job (primary key)
//! {ns}_lock_{worker}_{id}                  claimed job (lock key)
//! ```
//!
//! `run_at` and `priority` are fixed-width decimals of the sign-flipped value,
//! so byte order equals numeric order including negatives. Queue and worker
//! names are escaped so they never contain the separator.

use crate::error::{KvqError, Result};

pub const SEPARATOR: char = '_';

/// Segment reserved for lock keys; no queue may use it.
pub const LOCK_SEGMENT: &str = "lock";

const EPOCH_FLIP: u64 = 1 << 63;
const PRIORITY_FLIP: u32 = 1 << 31;
const EPOCH_WIDTH: usize = 20;
const PRIORITY_WIDTH: usize = 10;

/// Encode epoch seconds as 20 sortable digits.
pub fn encode_epoch(secs: i64) -> String {
    format!("{:020}", (secs as u64) ^ EPOCH_FLIP)
}

pub fn decode_epoch(encoded: &str) -> Option<i64> {
    if encoded.len() != EPOCH_WIDTH || !encoded.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    encoded.parse::<u64>().ok().map(|v| (v ^ EPOCH_FLIP) as i64)
}

/// Encode a priority as 10 sortable digits.
pub fn encode_priority(priority: i32) -> String {
    format!("{:010}", (priority as u32) ^ PRIORITY_FLIP)
}

pub fn decode_priority(encoded: &str) -> Option<i32> {
    if encoded.len() != PRIORITY_WIDTH || !encoded.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    encoded.parse::<u32>().ok().map(|v| (v ^ PRIORITY_FLIP) as i32)
}

/// Escape a queue or worker name so it contains no separator.
pub fn escape_segment(segment: &str) -> String {
    segment.replace('%', "%25").replace('_', "%5F")
}

/// Reverse [`escape_segment`]. `%5F` first, then `%25`.
pub fn unescape_segment(encoded: &str) -> String {
    encoded.replace("%5F", "_").replace("%25", "%")
}

/// Fields recovered from a primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKeyParts {
    pub queue: String,
    pub run_at: i64,
    pub priority: i32,
    pub id: String,
}

/// Fields recovered from a lock key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockKeyParts {
    pub worker: String,
    pub id: String,
}

/// Key builder for one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCodec {
    namespace: String,
}

impl KeyCodec {
    pub fn new(namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        // Enforced by QueueSettings::validate.
        debug_assert!(
            !namespace.is_empty() && !namespace.contains(SEPARATOR),
            "namespace must be non-empty and free of '_'"
        );
        Self { namespace }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// `{ns}_`: every key this codec produces.
    pub fn namespace_prefix(&self) -> String {
        format!("{}_", self.namespace)
    }

    pub fn primary_key(&self, queue: &str, run_at: i64, priority: i32, id: &str) -> String {
        format!(
            "{}_{}_{}_{}_{}",
            self.namespace,
            escape_segment(queue),
            encode_epoch(run_at),
            encode_priority(priority),
            id
        )
    }

    pub fn lock_key(&self, worker: &str, id: &str) -> String {
        format!("{}_{}_{}_{}", self.namespace, LOCK_SEGMENT, escape_segment(worker), id)
    }

    /// `{ns}_{queue}_`
    pub fn queue_prefix(&self, queue: &str) -> String {
        format!("{}_{}_", self.namespace, escape_segment(queue))
    }

    /// Exclusive upper bound of the due window: every primary key of `queue`
    /// with `run_at <= now` sorts below it, every later one above.
    pub fn due_upper_bound(&self, queue: &str, now: i64) -> String {
        // '`' is the byte after '_'.
        format!("{}{}`", self.queue_prefix(queue), encode_epoch(now))
    }

    /// `{ns}_lock_`
    pub fn lock_prefix(&self) -> String {
        format!("{}_{}_", self.namespace, LOCK_SEGMENT)
    }

    /// `{ns}_lock_{worker}_`
    pub fn worker_lock_prefix(&self, worker: &str) -> String {
        format!("{}{}_", self.lock_prefix(), escape_segment(worker))
    }

    pub fn is_lock_key(&self, key: &str) -> bool {
        key.starts_with(&self.lock_prefix())
    }

    pub fn decode_primary_key(&self, key: &str) -> Result<PrimaryKeyParts> {
        let malformed = |reason: &str| KvqError::malformed_record(key, reason.to_string());

        let rest = key
            .strip_prefix(&self.namespace_prefix())
            .ok_or_else(|| malformed("key is outside the namespace"))?;
        let mut parts = rest.splitn(4, SEPARATOR);
        let (queue, run_at, priority, id) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(q), Some(r), Some(p), Some(id)) => (q, r, p, id),
            _ => return Err(malformed("expected queue, run_at, priority and id segments")),
        };
        if queue == LOCK_SEGMENT {
            return Err(malformed("lock key where a primary key was expected"));
        }
        if id.is_empty() {
            return Err(malformed("empty job id"));
        }

        Ok(PrimaryKeyParts {
            queue: unescape_segment(queue),
            run_at: decode_epoch(run_at).ok_or_else(|| malformed("invalid run_at segment"))?,
            priority: decode_priority(priority).ok_or_else(|| malformed("invalid priority segment"))?,
            id: id.to_string(),
        })
    }

    pub fn decode_lock_key(&self, key: &str) -> Result<LockKeyParts> {
        let rest = key
            .strip_prefix(&self.lock_prefix())
            .ok_or_else(|| KvqError::malformed_record(key, "key is not a lock key"))?;
        match rest.split_once(SEPARATOR) {
            Some((worker, id)) if !worker.is_empty() && !id.is_empty() => Ok(LockKeyParts {
                worker: unescape_segment(worker),
                id: id.to_string(),
            }),
            _ => Err(KvqError::malformed_record(key, "expected worker and id segments")),
        }
    }
}
