//! Pipeline store: jobs, TTL locks, artifacts and the completion log
//!
//! ## Core Principles
//!
//! 1. **Single-row atomicity**: claim, lock acquisition and artifact upsert are
//!    each one conditional write. Workers never hold multi-row transactions.
//! 2. **Caller-supplied time**: adapters take `now` as an argument and never
//!    read the wall clock.
//! 3. **Retention**: jobs are kept for audit, artifacts are superseded.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use vecto_storage::{JobStore, LockStore, Lock, NewJob, SqliteStore};
//!
//! let store = SqliteStore::connect("sqlite://pipeline.db").await?;
//!
//! // Duplicate triggers for an in-flight resource collapse onto one job
//! let enqueued = store.enqueue_job(NewJob::new("driver-42", "strategy", payload), now).await?;
//!
//! // Exactly one worker gets each job
//! if let Some(job) = store.claim_job("worker-1", now).await? {
//!     let lock = Lock::new(&job.resource_key, token, now + ttl);
//!     if store.try_acquire_lock(&lock, now).await? {
//!         // run the pipeline
//!     }
//! }
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use domain::{
    Artifact, ArtifactStatus, ArtifactStore, EnqueueResult, GeoPoint, Job, JobFailure, JobOutcome,
    JobStateMachine, JobStatus, JobStore, Lock, LockStore, NewJob, Notification, NotificationLog,
    PipelineStore, UpsertOutcome,
};

pub use infrastructure::InMemoryStore;

#[cfg(feature = "sqlite")]
pub use infrastructure::SqliteStore;
