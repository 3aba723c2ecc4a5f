//! Caller-facing surface: enqueue triggers and read artifacts
//!
//! Serving applies the freshness gates. An artifact that expired, or whose
//! origin is too far from the caller's current position, is superseded and a
//! new job is enqueued; the caller sees `Pending` until that job finishes.
//! A failed job surfaces only after the queue gave up on it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};
use vecto_storage::{Artifact, EnqueueResult, JobStatus, PipelineStore};

use crate::clock::Clock;
use crate::config::FreshnessConfig;
use crate::error::Result;
use crate::freshness::{FreshnessGuard, Validity};
use crate::job::Trigger;
use crate::notify::NotificationBus;
use crate::queue::JobQueue;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ArtifactView {
    Pending,
    Ready {
        content: serde_json::Value,
        valid_window_start: DateTime<Utc>,
        valid_window_end: DateTime<Utc>,
    },
    Failed {
        code: String,
        message: String,
    },
}

impl ArtifactView {
    pub fn is_pending(&self) -> bool {
        matches!(self, ArtifactView::Pending)
    }

    fn ready(artifact: Artifact) -> Self {
        ArtifactView::Ready {
            content: artifact.content,
            valid_window_start: artifact.valid_window_start,
            valid_window_end: artifact.valid_window_end,
        }
    }
}

pub struct ArtifactService {
    queue: Arc<JobQueue>,
    store: Arc<dyn PipelineStore>,
    bus: Arc<dyn NotificationBus>,
    guard: FreshnessGuard,
}

impl ArtifactService {
    pub fn new(
        queue: Arc<JobQueue>,
        store: Arc<dyn PipelineStore>,
        bus: Arc<dyn NotificationBus>,
        clock: Arc<dyn Clock>,
        freshness: FreshnessConfig,
    ) -> Self {
        Self {
            queue,
            store,
            bus,
            guard: FreshnessGuard::new(freshness, clock),
        }
    }

    /// Enqueue unless the trigger's input is stale
    ///
    /// Idempotent: a trigger for a resource that already has an active job
    /// returns that job.
    ///
    /// # Errors
    ///
    /// `StaleInput` when the trigger is older than `max_input_age_secs`.
    pub async fn enqueue_if_fresh(&self, trigger: &Trigger) -> Result<EnqueueResult> {
        self.guard.check_input(trigger)?;
        self.queue.enqueue(trigger).await
    }

    /// Current state of the resource's artifact as seen from `current`
    ///
    /// `current` carries the caller's latest position and is the payload of
    /// any job this call enqueues.
    pub async fn get_artifact(&self, current: &Trigger) -> Result<ArtifactView> {
        let key = current.resource_key.as_str();

        if let Some(artifact) = self.store.get_artifact(key).await? {
            match self.guard.validity(&artifact, current.coordinates) {
                Validity::Valid => return Ok(ArtifactView::ready(artifact)),
                Validity::Expired => {
                    info!(resource_key = key, window_end = %artifact.valid_window_end, "artifact expired");
                    return self.invalidate(current).await;
                }
                Validity::Moved { distance_m } => {
                    info!(resource_key = key, distance_m, "resource moved away from artifact origin");
                    return self.invalidate(current).await;
                }
                Validity::Superseded => {}
            }
        }

        match self.queue.latest_job(key).await? {
            Some(job) if job.status.is_active() => Ok(ArtifactView::Pending),
            Some(job) if job.status == JobStatus::Error => Ok(ArtifactView::Failed {
                code: job.error_code.unwrap_or_else(|| "INTERNAL".to_string()),
                message: job.error_message.unwrap_or_default(),
            }),
            // Nothing queued, or the last job finished without leaving a
            // servable artifact
            _ => {
                self.enqueue_if_fresh(current).await?;
                Ok(ArtifactView::Pending)
            }
        }
    }

    async fn invalidate(&self, current: &Trigger) -> Result<ArtifactView> {
        self.store.supersede_artifact(&current.resource_key).await?;
        self.enqueue_if_fresh(current).await?;
        Ok(ArtifactView::Pending)
    }

    /// [`get_artifact`](Self::get_artifact), waiting up to `timeout` for a
    /// pending artifact to complete
    ///
    /// Subscribes before the first read so a completion in between is not
    /// missed. On timeout the store is read once more.
    pub async fn await_artifact(&self, current: &Trigger, timeout: Duration) -> Result<ArtifactView> {
        let mut subscription = self.bus.subscribe(&current.resource_key).await?;

        let view = self.get_artifact(current).await?;
        if !view.is_pending() {
            return Ok(view);
        }

        match subscription.wait(timeout).await {
            Some(status) => debug!(resource_key = %current.resource_key, %status, "completion received"),
            None => debug!(resource_key = %current.resource_key, "no completion before timeout, reading store"),
        }
        self.get_artifact(current).await
    }
}
