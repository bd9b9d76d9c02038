//! Key-value store client.
//!
//! The queue only needs a small slice of what a linearizable store offers:
//! point reads, ordered range scans, single-key writes and a compare-and-swap
//! transaction over per-key modification revisions. [`KvStore`] captures that
//! slice; it knows nothing about jobs.
//!
//! Two implementations ship with the crate:
//!
//! - [`InMemoryStore`]: MVCC over a `BTreeMap`, for tests, development and
//!   single-process deployments.
//! - [`RedisStore`]: the same revision model emulated with Lua scripts on a
//!   single Redis primary.
//!
//! Every operation may fail with [`ErrorCode::StoreUnavailable`](crate::error::ErrorCode);
//! nothing here retries.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::Result;

pub use self::memory::InMemoryStore;
pub use self::redis::RedisStore;

/// Store-wide logical clock. Every committed mutation advances it; `0` means
/// "the key does not exist".
pub type Revision = i64;

// ═══════════════════════════════════════════════════════════════════════════════
// Entries & Requests
// ═══════════════════════════════════════════════════════════════════════════════

/// A stored entry together with its revision metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Revision at which the key was (last) created.
    pub create_revision: Revision,
    /// Revision of the last write to the key.
    pub mod_revision: Revision,
    /// Number of writes since creation.
    pub version: i64,
}

/// Upper bound of a range scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeEnd {
    /// Every key starting with the request's `start`.
    Prefix,
    /// Keys in `[start, end)`.
    Key(String),
}

/// Scan direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Ascend,
    Descend,
}

/// A range scan over the keyspace, sorted by key bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeRequest {
    pub start: String,
    pub end: RangeEnd,
    pub limit: Option<usize>,
    pub order: SortOrder,
}

impl RangeRequest {
    /// Scan all keys beginning with `prefix`.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            start: prefix.into(),
            end: RangeEnd::Prefix,
            limit: None,
            order: SortOrder::Ascend,
        }
    }

    /// Scan keys in `[start, end)`.
    pub fn between(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: RangeEnd::Key(end.into()),
            limit: None,
            order: SortOrder::Ascend,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn descending(mut self) -> Self {
        self.order = SortOrder::Descend;
        self
    }

    /// Whether `key` falls inside the requested range.
    pub fn contains(&self, key: &str) -> bool {
        match &self.end {
            RangeEnd::Prefix => key.starts_with(self.start.as_str()),
            RangeEnd::Key(end) => key >= self.start.as_str() && key < end.as_str(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Transactions
// ═══════════════════════════════════════════════════════════════════════════════

/// A transaction guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compare {
    /// The key's current mod revision equals `expected` (`0` = key absent).
    ModRevision { key: String, expected: Revision },
}

impl Compare {
    pub fn key(&self) -> &str {
        match self {
            Self::ModRevision { key, .. } => key,
        }
    }
}

/// A write applied when every guard holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

/// Guarded multi-key write. All `success` operations commit at one revision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Txn {
    pub compare: Vec<Compare>,
    pub success: Vec<TxnOp>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key` to be at `expected` mod revision.
    pub fn when_mod_revision(mut self, key: impl Into<String>, expected: Revision) -> Self {
        self.compare.push(Compare::ModRevision {
            key: key.into(),
            expected,
        });
        self
    }

    pub fn put(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.success.push(TxnOp::Put {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.success.push(TxnOp::Delete { key: key.into() });
        self
    }
}

/// Outcome of [`KvStore::transact`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnResponse {
    pub succeeded: bool,
    /// Commit revision on success, the store's current revision otherwise.
    pub revision: Revision,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Linearizable key-value store with per-key revisions.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Short backend name for logs and metrics.
    fn name(&self) -> &'static str;

    /// Read a single key.
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    /// Ordered scan.
    async fn range(&self, request: RangeRequest) -> Result<Vec<KeyValue>>;

    /// Unconditional write; returns the commit revision.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<Revision>;

    /// Delete one key; returns the number of keys removed.
    async fn delete(&self, key: &str) -> Result<u64>;

    /// Delete every key starting with `prefix`.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;

    /// Count keys starting with `prefix`.
    async fn count_prefix(&self, prefix: &str) -> Result<u64>;

    /// Run a guarded transaction.
    async fn transact(&self, txn: Txn) -> Result<TxnResponse>;
}

/// Build the store selected by configuration.
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn KvStore>> {
    match config.backend {
        StoreBackend::Memory => {
            tracing::info!(backend = "memory", "Using in-memory key-value store");
            Ok(Arc::new(InMemoryStore::new()))
        }
        StoreBackend::Redis => {
            let store = RedisStore::connect(&config.redis_url, &config.key_prefix).await?;
            tracing::info!(backend = "redis", key_prefix = %config.key_prefix, "Connected to Redis key-value store");
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_range_contains() {
        let req = RangeRequest::prefix("kvq_default_");
        assert!(req.contains("kvq_default_0001"));
        assert!(!req.contains("kvq_defaults_0001"));
        assert!(!req.contains("kvq_lock_w_0a"));
    }

    #[test]
    fn test_between_range_is_half_open() {
        let req = RangeRequest::between("b", "d");
        assert!(!req.contains("a"));
        assert!(req.contains("b"));
        assert!(req.contains("c~"));
        assert!(!req.contains("d"));
    }

    #[test]
    fn test_txn_builder() {
        let txn = Txn::new()
            .when_mod_revision("a", 3)
            .delete("a")
            .put("b", b"x".to_vec());
        assert_eq!(txn.compare.len(), 1);
        assert_eq!(txn.compare[0].key(), "a");
        assert_eq!(txn.success.len(), 2);
    }
}
