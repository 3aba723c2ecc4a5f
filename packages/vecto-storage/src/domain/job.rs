//! Job records and their lifecycle.
//!
//! A job is created by a trigger event, mutated only by the worker that
//! claimed it, and never deleted.
//!
//! ```text
//!            claim                complete
//!  queued ─────────────▶ running ───────────▶ ok
//!    ▲                     │
//!    └──── fail(retry) ────┤ fail(terminal)
//!                          └────────────────▶ error
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StorageError};

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Ok,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Ok => "ok",
            JobStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "ok" => Ok(JobStatus::Ok),
            "error" => Ok(JobStatus::Error),
            _ => Err(StorageError::serialization(format!(
                "Invalid job status: {}",
                s
            ))),
        }
    }

    /// Queued or running. At most one active job exists per resource key.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a job reached `ok`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    /// This job's pipeline run produced (or attempted to persist) the artifact
    Produced,
    /// The resource lock was held by another run; that run owns the artifact
    Duplicate,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Produced => "produced",
            JobOutcome::Duplicate => "duplicate",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "produced" => Ok(JobOutcome::Produced),
            "duplicate" => Ok(JobOutcome::Duplicate),
            _ => Err(StorageError::serialization(format!(
                "Invalid job outcome: {}",
                s
            ))),
        }
    }
}

/// Persistent job record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub resource_key: String,
    pub kind: String,
    pub status: JobStatus,
    pub outcome: Option<JobOutcome>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    /// Number of times the job has been claimed
    pub attempts: u32,
    /// Trigger snapshot the pipeline runs against
    pub payload: serde_json::Value,
    pub worker_id: Option<String>,
    /// Earliest instant the job may be claimed (retry backoff)
    pub run_after: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a fresh queued job from an enqueue request
    pub fn queued(new_job: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            resource_key: new_job.resource_key,
            kind: new_job.kind,
            status: JobStatus::Queued,
            outcome: None,
            error_code: None,
            error_message: None,
            attempts: 0,
            payload: new_job.payload,
            worker_id: None,
            run_after: now,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Enqueue request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub resource_key: String,
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl NewJob {
    pub fn new(
        resource_key: impl Into<String>,
        kind: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            resource_key: resource_key.into(),
            kind: kind.into(),
            payload,
        }
    }
}

/// Result of an enqueue: either a new job or the already-active one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueResult {
    pub job_id: Uuid,
    pub created: bool,
}

/// Failure to record against a running job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub error_code: String,
    pub error_message: String,
    /// `Some` puts the job back in the queue at that instant, `None` is terminal
    pub retry_at: Option<DateTime<Utc>>,
}

/// Validated transitions over a [`Job`]
pub struct JobStateMachine {
    job: Job,
}

impl JobStateMachine {
    pub fn new(job: Job) -> Self {
        Self { job }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn into_job(self) -> Job {
        self.job
    }

    fn invalid(&self, to: &str) -> StorageError {
        StorageError::invalid_transition(format!(
            "job {}: {} -> {}",
            self.job.id, self.job.status, to
        ))
    }

    /// Transition: QUEUED → RUNNING
    pub fn claim(&mut self, worker_id: &str, now: DateTime<Utc>) -> Result<()> {
        if self.job.status != JobStatus::Queued {
            return Err(self.invalid("running"));
        }
        self.job.status = JobStatus::Running;
        self.job.worker_id = Some(worker_id.to_string());
        self.job.attempts += 1;
        self.job.updated_at = now;
        Ok(())
    }

    /// Transition: RUNNING → OK
    pub fn complete(&mut self, outcome: JobOutcome, now: DateTime<Utc>) -> Result<()> {
        if self.job.status != JobStatus::Running {
            return Err(self.invalid("ok"));
        }
        self.job.status = JobStatus::Ok;
        self.job.outcome = Some(outcome);
        self.job.error_code = None;
        self.job.error_message = None;
        self.job.updated_at = now;
        Ok(())
    }

    /// Transition: RUNNING → QUEUED (retry) or RUNNING → ERROR
    pub fn fail(&mut self, failure: &JobFailure, now: DateTime<Utc>) -> Result<()> {
        if self.job.status != JobStatus::Running {
            return Err(self.invalid("error"));
        }
        self.job.error_code = Some(failure.error_code.clone());
        self.job.error_message = Some(failure.error_message.clone());
        match failure.retry_at {
            Some(retry_at) => {
                self.job.status = JobStatus::Queued;
                self.job.run_after = retry_at;
                self.job.worker_id = None;
            }
            None => self.job.status = JobStatus::Error,
        }
        self.job.updated_at = now;
        Ok(())
    }

    /// Transition: RUNNING → QUEUED after its worker went silent
    pub fn requeue(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.job.status != JobStatus::Running {
            return Err(self.invalid("queued"));
        }
        self.job.status = JobStatus::Queued;
        self.job.worker_id = None;
        self.job.run_after = now;
        self.job.updated_at = now;
        Ok(())
    }
}
