//! Job queue policy over the store
//!
//! The store provides the atomic primitives (conditional enqueue, single
//! statement claim); this layer adds the clock, the retry policy and logging.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vecto_storage::{EnqueueResult, Job, JobFailure, JobOutcome, PipelineStore};

use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::error::{OrchestratorError, Result};
use crate::job::{RetryDecision, RetryPolicy, Trigger};

/// Where a failed job ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDisposition {
    /// Back in the queue, claimable from `at`
    Retrying { at: DateTime<Utc> },
    /// `error` status; a manual re-trigger is required
    Terminal,
}

impl FailDisposition {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FailDisposition::Terminal)
    }
}

pub struct JobQueue {
    store: Arc<dyn PipelineStore>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    abandoned_after: chrono::Duration,
}

impl JobQueue {
    pub fn new(store: Arc<dyn PipelineStore>, clock: Arc<dyn Clock>, config: &QueueConfig) -> Self {
        Self {
            store,
            clock,
            policy: RetryPolicy::from_config(config),
            abandoned_after: chrono::Duration::seconds(
                i64::try_from(config.abandoned_after_secs).unwrap_or(i64::MAX / 1_000),
            ),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Idempotent: a trigger for a resource with an active job returns that job
    pub async fn enqueue(&self, trigger: &Trigger) -> Result<EnqueueResult> {
        let result = self
            .store
            .enqueue_job(trigger.to_new_job()?, self.clock.now())
            .await?;

        if result.created {
            info!(
                resource_key = %trigger.resource_key,
                job_id = %result.job_id,
                "job enqueued"
            );
        } else {
            debug!(
                resource_key = %trigger.resource_key,
                job_id = %result.job_id,
                "trigger collapsed onto active job"
            );
        }
        Ok(result)
    }

    pub async fn claim(&self, worker_id: &str) -> Result<Option<Job>> {
        let job = self.store.claim_job(worker_id, self.clock.now()).await?;
        if let Some(job) = &job {
            debug!(
                job_id = %job.id,
                resource_key = %job.resource_key,
                attempt = job.attempts,
                worker_id,
                "job claimed"
            );
        }
        Ok(job)
    }

    pub async fn complete(&self, job_id: Uuid) -> Result<()> {
        self.store
            .complete_job(job_id, JobOutcome::Produced, self.clock.now())
            .await?;
        Ok(())
    }

    /// Finish a job whose resource is already being produced by another run
    ///
    /// The job is never requeued here: the lock holder owns the artifact.
    pub async fn complete_as_duplicate(&self, job_id: Uuid) -> Result<()> {
        self.store
            .complete_job(job_id, JobOutcome::Duplicate, self.clock.now())
            .await?;
        Ok(())
    }

    /// Record a failed run and schedule the retry, if any
    pub async fn fail(&self, job: &Job, err: &OrchestratorError) -> Result<FailDisposition> {
        let now = self.clock.now();
        let decision = self.policy.decide(job.attempts, err, now);
        let retry_at = match decision {
            RetryDecision::Retry { at } => Some(at),
            RetryDecision::GiveUp => None,
        };

        self.store
            .fail_job(
                job.id,
                &JobFailure {
                    error_code: err.code().to_string(),
                    error_message: err.to_string(),
                    retry_at,
                },
                now,
            )
            .await?;

        match retry_at {
            Some(at) => {
                warn!(
                    job_id = %job.id,
                    resource_key = %job.resource_key,
                    code = err.code(),
                    attempt = job.attempts,
                    retry_at = %at,
                    "job failed, retry scheduled: {}",
                    err
                );
                Ok(FailDisposition::Retrying { at })
            }
            None => {
                error!(
                    job_id = %job.id,
                    resource_key = %job.resource_key,
                    code = err.code(),
                    category = %err.category(),
                    attempt = job.attempts,
                    "job failed permanently: {}",
                    err
                );
                Ok(FailDisposition::Terminal)
            }
        }
    }

    /// Requeue running jobs whose worker stopped touching them
    pub async fn requeue_abandoned(&self) -> Result<u64> {
        let now = self.clock.now();
        let requeued = self
            .store
            .requeue_abandoned(now - self.abandoned_after, now)
            .await?;
        if requeued > 0 {
            warn!(requeued, "requeued abandoned jobs");
        }
        Ok(requeued)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.store.get_job(job_id).await?)
    }

    pub async fn latest_job(&self, resource_key: &str) -> Result<Option<Job>> {
        Ok(self.store.latest_job(resource_key).await?)
    }
}
