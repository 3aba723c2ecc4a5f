//! Domain layer for the pipeline store
//!
//! # Core Principles
//!
//! 1. **Single-row atomicity**: every mutation is one conditional write on one
//!    row (conditional upsert or compare-and-swap). No operation spans rows
//!    owned by different workers, so workers can never deadlock each other.
//! 2. **Caller-supplied time**: stores never read the wall clock. Every
//!    time-dependent operation takes `now`, which keeps TTL and backoff
//!    behaviour testable with a controllable clock.
//! 3. **Retention**: jobs are never deleted; artifacts are superseded, not
//!    edited in place. Only completion log entries are pruned, and their
//!    sequence numbers are never reused.
//!
//! # Domain Models
//!
//! - `Job`: a unit of pipeline work for one resource key
//! - `Lock`: TTL mutex row keyed by resource key
//! - `Artifact`: the single persisted pipeline output per resource key
//! - `Notification`: an entry in the completion log (store-backed bus)
//!
//! # Port Traits
//!
//! - `JobStore`, `LockStore`, `ArtifactStore`, `NotificationLog`
//! - `PipelineStore`: all four, implemented by every adapter

pub mod job;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StorageError};

pub use job::{EnqueueResult, Job, JobFailure, JobOutcome, JobStateMachine, JobStatus, NewJob};

// ═══════════════════════════════════════════════════════════════════════════
// Domain Models
// ═══════════════════════════════════════════════════════════════════════════

/// WGS84 position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// TTL mutex row
///
/// At most one non-expired lock exists per `lock_key`. A lock whose
/// `expires_at` has passed is free for anyone to take, so a crashed holder
/// never blocks the resource for longer than the TTL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub lock_key: String,
    pub owner_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Lock {
    pub fn new(
        lock_key: impl Into<String>,
        owner_token: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            lock_key: lock_key.into(),
            owner_token: owner_token.into(),
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Artifact status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    /// Servable while inside its validity window
    Active,
    /// Invalidated (expired or the resource moved); the next run replaces it
    Superseded,
}

impl ArtifactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactStatus::Active => "active",
            ArtifactStatus::Superseded => "superseded",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(ArtifactStatus::Active),
            "superseded" => Ok(ArtifactStatus::Superseded),
            _ => Err(StorageError::serialization(format!(
                "Invalid artifact status: {}",
                s
            ))),
        }
    }
}

/// Persisted pipeline output, one row per resource key
///
/// # Identity
///
/// `resource_key` is unique. Concurrent writers race on that key and exactly
/// one of them wins; the others get [`UpsertOutcome::Conflict`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub resource_key: String,
    pub content: serde_json::Value,
    /// `role:provider` entries naming who served each call
    pub provider_chain_used: Vec<String>,
    /// Position the artifact was generated for
    pub origin: GeoPoint,
    pub valid_window_start: DateTime<Utc>,
    pub valid_window_end: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub status: ArtifactStatus,
    /// Bumped every time a superseded row is replaced
    pub generation: u32,
}

impl Artifact {
    pub fn is_servable(&self, now: DateTime<Utc>) -> bool {
        self.status == ArtifactStatus::Active && now <= self.valid_window_end
    }

    /// Whether a new write may take this row's place
    pub fn is_replaceable(&self, now: DateTime<Utc>) -> bool {
        self.status == ArtifactStatus::Superseded || self.valid_window_end <= now
    }
}

/// Result of [`ArtifactStore::upsert_artifact`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced { generation: u32 },
    /// A live artifact already exists; the caller's result was not written
    Conflict,
}

impl UpsertOutcome {
    pub fn is_written(&self) -> bool {
        !matches!(self, UpsertOutcome::Conflict)
    }
}

/// Completion log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub seq: i64,
    pub resource_key: String,
    pub status: String,
    pub published_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Port Traits
// ═══════════════════════════════════════════════════════════════════════════

/// Persistent job queue
///
/// # Invariants
///
/// - At most one job with status in {queued, running} per resource key.
/// - `claim_job` hands a given job to exactly one caller.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a queued job unless the resource already has an active one
    ///
    /// # Returns
    ///
    /// The new job id with `created = true`, or the active job's id with
    /// `created = false`.
    async fn enqueue_job(&self, job: NewJob, now: DateTime<Utc>) -> Result<EnqueueResult>;

    /// Atomically pick the oldest claimable queued job and mark it running
    ///
    /// A job is claimable once `run_after <= now`. Increments `attempts`.
    async fn claim_job(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Job>>;

    /// RUNNING → OK
    ///
    /// # Errors
    ///
    /// `InvalidTransition` if the job is not running.
    async fn complete_job(
        &self,
        job_id: Uuid,
        outcome: JobOutcome,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// RUNNING → QUEUED (when `retry_at` is set) or RUNNING → ERROR
    async fn fail_job(&self, job_id: Uuid, failure: &JobFailure, now: DateTime<Utc>)
        -> Result<()>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// Most recently created job for a resource key
    async fn latest_job(&self, resource_key: &str) -> Result<Option<Job>>;

    /// Return running jobs not touched since `stale_before` to the queue
    ///
    /// # Returns
    ///
    /// Number of jobs requeued
    async fn requeue_abandoned(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64>;
}

/// TTL lock rows
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Conditional upsert of `lock`
    ///
    /// Succeeds when no row exists, or when the row's previously stored
    /// `expires_at` (the value before this write) is `<= now`.
    async fn try_acquire_lock(&self, lock: &Lock, now: DateTime<Utc>) -> Result<bool>;

    /// Delete the row only if `owner_token` still owns it
    async fn release_lock(&self, lock_key: &str, owner_token: &str) -> Result<bool>;

    async fn get_lock(&self, lock_key: &str) -> Result<Option<Lock>>;
}

/// Artifact rows, unique by resource key
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Insert, or replace a superseded/expired row; otherwise `Conflict`
    ///
    /// The stored `generation` is assigned by the store.
    async fn upsert_artifact(&self, artifact: &Artifact, now: DateTime<Utc>)
        -> Result<UpsertOutcome>;

    async fn get_artifact(&self, resource_key: &str) -> Result<Option<Artifact>>;

    /// ACTIVE → SUPERSEDED; `false` if there was nothing active to supersede
    async fn supersede_artifact(&self, resource_key: &str) -> Result<bool>;
}

/// Completion log backing the store-side notification bus, pruned by age
#[async_trait]
pub trait NotificationLog: Send + Sync {
    /// Append an entry and return its sequence number
    async fn append_notification(
        &self,
        resource_key: &str,
        status: &str,
        now: DateTime<Utc>,
    ) -> Result<i64>;

    /// Entries for `resource_key` with `seq > after_seq`, oldest first
    async fn notifications_since(
        &self,
        resource_key: &str,
        after_seq: i64,
    ) -> Result<Vec<Notification>>;

    /// Highest sequence number written so far (0 when nothing was ever written)
    ///
    /// Pruning does not lower it.
    async fn latest_notification_seq(&self) -> Result<i64>;

    /// Delete entries published before `before`; returns how many went
    async fn prune_notifications(&self, before: DateTime<Utc>) -> Result<u64>;
}

/// Everything the orchestrator needs from persistence
pub trait PipelineStore: JobStore + LockStore + ArtifactStore + NotificationLog {}

impl<T> PipelineStore for T where T: JobStore + LockStore + ArtifactStore + NotificationLog {}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════
