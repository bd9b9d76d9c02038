//! In-memory MVCC store.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{Compare, KeyValue, KvStore, RangeEnd, RangeRequest, Revision, SortOrder, Txn, TxnOp, TxnResponse};
use crate::error::{KvqError, Result};

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    create_revision: Revision,
    mod_revision: Revision,
    version: i64,
}

#[derive(Debug, Default)]
struct State {
    revision: Revision,
    data: BTreeMap<String, Entry>,
}

impl State {
    fn mod_revision(&self, key: &str) -> Revision {
        self.data.get(key).map(|e| e.mod_revision).unwrap_or(0)
    }

    fn apply_put(&mut self, key: String, value: Vec<u8>, revision: Revision) {
        match self.data.get_mut(&key) {
            Some(entry) => {
                entry.value = value;
                entry.mod_revision = revision;
                entry.version += 1;
            }
            None => {
                self.data.insert(
                    key,
                    Entry {
                        value,
                        create_revision: revision,
                        mod_revision: revision,
                        version: 1,
                    },
                );
            }
        }
    }

    fn scan<'a>(&'a self, request: &'a RangeRequest) -> impl Iterator<Item = (&'a String, &'a Entry)> + 'a {
        // BTreeMap::range panics on an inverted range.
        let upper = match &request.end {
            RangeEnd::Prefix => Bound::Unbounded,
            RangeEnd::Key(end) if *end < request.start => Bound::Excluded(request.start.clone()),
            RangeEnd::Key(end) => Bound::Excluded(end.clone()),
        };
        self.data
            .range((Bound::Included(request.start.clone()), upper))
            .take_while(move |(key, _)| request.contains(key))
    }
}

fn to_key_value(key: &str, entry: &Entry) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: entry.value.clone(),
        create_revision: entry.create_revision,
        mod_revision: entry.mod_revision,
        version: entry.version,
    }
}

/// Process-local store with the same revision semantics as a real cluster.
///
/// All operations serialize on one mutex, which makes every call (including
/// multi-key transactions) atomic. [`set_available`](Self::set_available)
/// simulates an outage: while unavailable every call fails with
/// `StoreUnavailable`.
#[derive(Debug)]
pub struct InMemoryStore {
    state: Mutex<State>,
    available: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle simulated availability.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Current store revision.
    pub fn revision(&self) -> Revision {
        self.state.lock().revision
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.state.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(KvqError::store_unavailable("memory", "store is marked unavailable"))
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        self.ensure_available()?;
        let state = self.state.lock();
        Ok(state.data.get(key).map(|entry| to_key_value(key, entry)))
    }

    async fn range(&self, request: RangeRequest) -> Result<Vec<KeyValue>> {
        self.ensure_available()?;
        let state = self.state.lock();
        let limit = request.limit.unwrap_or(usize::MAX);
        let items: Vec<KeyValue> = match request.order {
            SortOrder::Ascend => state
                .scan(&request)
                .take(limit)
                .map(|(k, e)| to_key_value(k, e))
                .collect(),
            SortOrder::Descend => {
                let all: Vec<_> = state.scan(&request).collect();
                all.into_iter()
                    .rev()
                    .take(limit)
                    .map(|(k, e)| to_key_value(k, e))
                    .collect()
            }
        };
        Ok(items)
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<Revision> {
        self.ensure_available()?;
        let mut state = self.state.lock();
        state.revision += 1;
        let revision = state.revision;
        state.apply_put(key.to_string(), value, revision);
        Ok(revision)
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        self.ensure_available()?;
        let mut state = self.state.lock();
        if state.data.remove(key).is_some() {
            state.revision += 1;
            Ok(1)
        } else {
            Ok(0)
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        self.ensure_available()?;
        let mut state = self.state.lock();
        let keys: Vec<String> = state
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            state.data.remove(key);
        }
        if !keys.is_empty() {
            state.revision += 1;
        }
        Ok(keys.len() as u64)
    }

    async fn count_prefix(&self, prefix: &str) -> Result<u64> {
        self.ensure_available()?;
        let state = self.state.lock();
        let count = state
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .count();
        Ok(count as u64)
    }

    async fn transact(&self, txn: Txn) -> Result<TxnResponse> {
        self.ensure_available()?;
        let mut state = self.state.lock();

        let holds = txn.compare.iter().all(|cmp| match cmp {
            Compare::ModRevision { key, expected } => state.mod_revision(key) == *expected,
        });
        if !holds {
            return Ok(TxnResponse {
                succeeded: false,
                revision: state.revision,
            });
        }
        if txn.success.is_empty() {
            return Ok(TxnResponse {
                succeeded: true,
                revision: state.revision,
            });
        }

        state.revision += 1;
        let revision = state.revision;
        for op in txn.success {
            match op {
                TxnOp::Put { key, value } => state.apply_put(key, value, revision),
                TxnOp::Delete { key } => {
                    state.data.remove(&key);
                }
            }
        }
        Ok(TxnResponse {
            succeeded: true,
            revision,
        })
    }
}
