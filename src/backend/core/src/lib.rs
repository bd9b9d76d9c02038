#![allow(clippy::result_large_err)]
//! # kvq
//!
//! A distributed, lease-based job queue on a linearizable key-value store.
//!
//! Workers discover due jobs with ordered range scans and claim them with a
//! single compare-and-swap transaction. There is no scheduler process: the
//! store is the only thing workers share.
//!
//! ## Architecture
//!
//! - **Store**: async key-value trait with in-memory and Redis implementations
//! - **Jobs**: key codec, job records, leases, availability scanning and the
//!   `JobBackend` surface
//! - **Config**: layered file + environment configuration
//! - **Telemetry**: structured logging and metrics

pub mod config;
pub mod error;
pub mod jobs;
pub mod store;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, KvqError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, QueueSettings, StoreBackend, StoreConfig};
    pub use crate::error::{ErrorCode, ErrorContext, KvqError, Result};
    pub use crate::jobs::{Job, JobBackend, JobId, JobState, KvJobBackend, NewJob};
    pub use crate::store::{InMemoryStore, KvStore, RedisStore};
}
