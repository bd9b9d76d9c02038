//! Lease-based job queue.
//!
//! - **Codec**: order-preserving keys for jobs and locks
//! - **Job**: the stored record and the [`NewJob`] builder
//! - **Lease**: atomic claim, release and recovery
//! - **Scanner**: due-window range scans with queue and priority filtering
//! - **Backend**: the [`JobBackend`] surface composed from the above
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   range    ┌─────────────┐
//! │   Scanner    │──────────▶│             │
//! └──────┬───────┘           │             │
//!        │ candidates        │   KvStore   │
//!        ▼                   │  (memory /  │
//! ┌──────────────┐   txn     │   redis)    │
//! │    Lease     │──────────▶│             │
//! └──────────────┘           └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use kvq_core::jobs::{JobBackend, KvJobBackend, NewJob};
//!
//! let backend = KvJobBackend::connect(&config.store, config.queue.clone()).await?;
//! backend.create(NewJob::new(payload).queue("mail").priority(-1)).await?;
//!
//! while let Some(mut job) = backend.reserve("host-1:4242", max_run_time).await? {
//!     match run(&job.payload).await {
//!         Ok(()) => backend.destroy(&job).await?,
//!         Err(e) => {
//!             job.attempts += 1;
//!             job.last_error = Some(e.to_string());
//!             backend.fail(&mut job).await?;
//!         }
//!     }
//! }
//! ```

pub mod backend;
pub mod codec;
pub mod job;
pub mod lease;
pub mod scanner;

pub use backend::{JobBackend, KvJobBackend};
pub use codec::{KeyCodec, LockKeyParts, PrimaryKeyParts};
pub use job::{Job, JobId, JobState, NewJob};
pub use lease::LeaseManager;
pub use scanner::AvailabilityScanner;
