//! Worker loop: claim, lock, run, release, record
//!
//! Any number of workers (tasks or processes) may poll the same store. The
//! claim hands each job to one worker; the resource lock keeps two runs for
//! the same key from overlapping. A worker that finds the lock taken
//! completes its job as a duplicate instead of requeueing it, so contention
//! never turns into a reclaim loop.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vecto_storage::{Job, UpsertOutcome};

use crate::audit::AuditRecord;
use crate::config::OrchestrationConfig;
use crate::error::{OrchestratorError, Result};
use crate::job::Trigger;
use crate::lock::LockManager;
use crate::metrics::PipelineMetrics;
use crate::notify::{CompletionStatus, NotificationBus};
use crate::orchestrator::{PipelineFailure, PipelineOrchestrator};
use crate::queue::{FailDisposition, JobQueue};

/// What one `process_next` call did with the job it claimed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    Produced {
        job_id: Uuid,
        resource_key: String,
        persisted: UpsertOutcome,
    },
    /// Lock busy: another run owns the resource
    Duplicate { job_id: Uuid, resource_key: String },
    Failed {
        job_id: Uuid,
        resource_key: String,
        code: &'static str,
        disposition: FailDisposition,
    },
}

pub struct Worker {
    id: String,
    queue: Arc<JobQueue>,
    locks: Arc<LockManager>,
    orchestrator: Arc<PipelineOrchestrator>,
    bus: Arc<dyn NotificationBus>,
    metrics: PipelineMetrics,
    lock_ttl: chrono::Duration,
    notification_retention: chrono::Duration,
    poll_interval: Duration,
    reap_every: Duration,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        config: &OrchestrationConfig,
        queue: Arc<JobQueue>,
        locks: Arc<LockManager>,
        orchestrator: Arc<PipelineOrchestrator>,
        bus: Arc<dyn NotificationBus>,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            locks,
            orchestrator,
            bus,
            metrics: PipelineMetrics::disabled(),
            lock_ttl: config.lock_ttl(),
            notification_retention: config.queue.notification_retention(),
            poll_interval: config.queue.poll_interval(),
            reap_every: Duration::from_secs((config.queue.abandoned_after_secs / 2).max(1)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: PipelineMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Cancelling `shutdown` stops the poll loop and aborts an in-flight run
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Claim and process at most one job; `None` when the queue is empty
    pub async fn process_next(&self) -> Result<Option<WorkOutcome>> {
        let job = match self.queue.claim(&self.id).await? {
            Some(job) => job,
            None => return Ok(None),
        };
        self.metrics.job_claimed();

        let trigger = match Trigger::from_job(&job) {
            Ok(trigger) => trigger,
            Err(err) => return self.fail_unstarted(&job, err).await.map(Some),
        };

        let lease = match self
            .locks
            .try_acquire(&job.resource_key, self.lock_ttl)
            .await
        {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                let busy = OrchestratorError::LockBusy(job.resource_key.clone());
                warn!(
                    job_id = %job.id,
                    resource_key = %job.resource_key,
                    code = busy.code(),
                    "{}, completing as duplicate",
                    busy
                );
                self.queue.complete_as_duplicate(job.id).await?;
                self.metrics.job_duplicate();
                return Ok(Some(WorkOutcome::Duplicate {
                    job_id: job.id,
                    resource_key: job.resource_key,
                }));
            }
            // Back to the queue with backoff instead of waiting for the reaper
            Err(err) => return self.fail_unstarted(&job, err).await.map(Some),
        };

        let result = tokio::select! {
            result = AssertUnwindSafe(self.orchestrator.run(&trigger)).catch_unwind() => match result {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "pipeline panicked".to_string());
                    error!(job_id = %job.id, resource_key = %job.resource_key, "pipeline panicked: {}", message);
                    Err(self.orchestrator.abandoned_run(&trigger, OrchestratorError::Internal(message)))
                }
            },
            _ = self.shutdown.cancelled() => Err(self.orchestrator.abandoned_run(
                &trigger,
                OrchestratorError::Cancelled(format!("worker {} shutting down", self.id)),
            )),
        };

        // The TTL frees the lock if this fails
        if let Err(e) = self.locks.release_lease(&lease).await {
            warn!(resource_key = %lease.lock_key, "lock release failed: {}", e);
        }

        match result {
            Ok(report) => {
                self.queue.complete(job.id).await?;
                self.metrics.job_completed();
                AuditRecord::from_report(&report).emit();
                info!(job_id = %job.id, resource_key = %job.resource_key, "job completed");
                Ok(Some(WorkOutcome::Produced {
                    job_id: job.id,
                    resource_key: job.resource_key,
                    persisted: report.persisted,
                }))
            }
            Err(failure) => self.record_failure(&job, failure).await.map(Some),
        }
    }

    async fn record_failure(&self, job: &Job, failure: PipelineFailure) -> Result<WorkOutcome> {
        let code = failure.error.code();
        let disposition = self.queue.fail(job, &failure.error).await?;
        self.metrics.job_failed(code);
        if disposition.is_terminal() {
            AuditRecord::from_failure(&failure).emit();
            self.publish_failed(&job.resource_key).await;
        }
        Ok(WorkOutcome::Failed {
            job_id: job.id,
            resource_key: job.resource_key.clone(),
            code,
            disposition,
        })
    }

    /// Failure before the pipeline started: bad payload or lock store error
    async fn fail_unstarted(&self, job: &Job, err: OrchestratorError) -> Result<WorkOutcome> {
        let code = err.code();
        let disposition = self.queue.fail(job, &err).await?;
        self.metrics.job_failed(code);
        if disposition.is_terminal() {
            AuditRecord::rejected(&job.resource_key, code).emit();
            self.publish_failed(&job.resource_key).await;
        }
        Ok(WorkOutcome::Failed {
            job_id: job.id,
            resource_key: job.resource_key.clone(),
            code,
            disposition,
        })
    }

    async fn publish_failed(&self, resource_key: &str) {
        if let Err(e) = self.bus.publish(resource_key, CompletionStatus::Failed).await {
            warn!(resource_key, "failed to publish failure: {}", e);
        }
    }

    /// Housekeeping run from the poll loop: requeue jobs abandoned by crashed
    /// workers and prune the completion log
    pub async fn sweep(&self) {
        if let Err(e) = self.queue.requeue_abandoned().await {
            warn!(worker_id = %self.id, "abandoned job sweep failed: {}", e);
        }
        if let Err(e) = self.bus.prune(self.notification_retention).await {
            warn!(worker_id = %self.id, "notification prune failed: {}", e);
        }
    }

    /// Poll until `shutdown` is cancelled
    ///
    /// Drains the queue without sleeping while jobs are available, waits
    /// `poll_interval` when it is empty, and sweeps every half
    /// `abandoned_after_secs`.
    pub async fn run(&self) {
        info!(worker_id = %self.id, "worker started");
        let mut last_reap: Option<Instant> = None;

        while !self.shutdown.is_cancelled() {
            if last_reap.map_or(true, |at| at.elapsed() >= self.reap_every) {
                self.sweep().await;
                last_reap = Some(Instant::now());
            }

            let idle = match self.process_next().await {
                Ok(Some(outcome)) => {
                    debug!(worker_id = %self.id, ?outcome, "processed");
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    error!(worker_id = %self.id, code = e.code(), "worker iteration failed: {}", e);
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }
        info!(worker_id = %self.id, "worker stopped");
    }
}
