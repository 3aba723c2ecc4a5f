//! Job payload and retry policy
//!
//! The queue row itself lives in `vecto_storage`; this module owns what the
//! orchestrator puts into it (the [`Trigger`] snapshot) and when a failed job
//! comes back ([`RetryPolicy`]).

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vecto_storage::{GeoPoint, Job, NewJob};

use crate::config::QueueConfig;
use crate::error::{OrchestratorError, Result};

/// Job kind for a strategy pipeline run
pub const STRATEGY_JOB_KIND: &str = "strategy";

/// Trigger snapshot: what the pipeline runs against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Trigger {
    pub resource_key: String,
    pub coordinates: GeoPoint,
    pub address: String,
    /// When the coordinates/address were resolved upstream
    pub resolved_at: DateTime<Utc>,
}

impl Trigger {
    pub fn new(
        resource_key: impl Into<String>,
        coordinates: GeoPoint,
        address: impl Into<String>,
        resolved_at: DateTime<Utc>,
    ) -> Self {
        Self {
            resource_key: resource_key.into(),
            coordinates,
            address: address.into(),
            resolved_at,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.resolved_at
    }

    pub fn to_new_job(&self) -> Result<NewJob> {
        let payload = serde_json::to_value(self).map_err(OrchestratorError::serialization)?;
        Ok(NewJob::new(
            self.resource_key.clone(),
            STRATEGY_JOB_KIND,
            payload,
        ))
    }

    /// Decode the payload of a claimed job
    ///
    /// # Errors
    ///
    /// `SchemaMismatch` when the payload does not decode or names a different
    /// resource than the job row.
    pub fn from_job(job: &Job) -> Result<Self> {
        let trigger: Trigger = serde_json::from_value(job.payload.clone()).map_err(|e| {
            OrchestratorError::schema(format!("job {} payload: {}", job.id, e))
        })?;
        if trigger.resource_key != job.resource_key {
            return Err(OrchestratorError::schema(format!(
                "job {} is for {} but its payload names {}",
                job.id, job.resource_key, trigger.resource_key
            )));
        }
        Ok(trigger)
    }
}

/// Capped exponential backoff
///
/// `attempts` is the number of claims so far (1 after the first run), so the
/// first retry waits `base`, the second `2 * base`, and so on up to `max`.
pub fn next_backoff(attempts: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempts.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent)
        .map_or(max, |delay| delay.min(max))
}

/// What to do with a job whose run failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { at: DateTime<Utc> },
    GiveUp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base: Duration::from_millis(config.backoff_base_ms),
            max: Duration::from_millis(config.backoff_max_ms),
        }
    }

    pub fn next_backoff(&self, attempts: u32) -> Duration {
        next_backoff(attempts, self.base, self.max)
    }

    /// Only transient errors are retried, and only below `max_attempts`
    pub fn decide(
        &self,
        attempts: u32,
        error: &OrchestratorError,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        if !error.is_retryable() || attempts >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        chrono::Duration::from_std(self.next_backoff(attempts))
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .map_or(RetryDecision::GiveUp, |at| RetryDecision::Retry { at })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}
