//! Freshness and validity checks
//!
//! Three gates:
//! - input recency before enqueue (`STALE_INPUT`)
//! - validity window before serving an artifact
//! - movement: an artifact generated too far from the current position is
//!   invalid whatever its window says

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use vecto_storage::{Artifact, ArtifactStatus, GeoPoint};

use crate::clock::Clock;
use crate::config::FreshnessConfig;
use crate::error::{OrchestratorError, Result};
use crate::job::Trigger;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters
pub fn haversine_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let d_lat = lat2 - lat1;
    let d_lng = (b.lng - a.lng).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// Why an artifact can or cannot be served
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Validity {
    Valid,
    Superseded,
    Expired,
    Moved { distance_m: f64 },
}

impl Validity {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validity::Valid)
    }
}

fn secs(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1_000))
}

fn mins(value: u64) -> Duration {
    Duration::minutes(i64::try_from(value).unwrap_or(i64::MAX / 60_000))
}

pub struct FreshnessGuard {
    config: FreshnessConfig,
    clock: Arc<dyn Clock>,
}

impl FreshnessGuard {
    pub fn new(config: FreshnessConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    pub fn config(&self) -> &FreshnessConfig {
        &self.config
    }

    /// Whether the trigger's input is recent enough to run on
    pub fn is_fresh(&self, trigger: &Trigger, now: DateTime<Utc>) -> bool {
        trigger.age(now) <= secs(self.config.max_input_age_secs)
    }

    /// # Errors
    ///
    /// `StaleInput` when the trigger was resolved more than
    /// `max_input_age_secs` ago.
    pub fn check_input(&self, trigger: &Trigger) -> Result<()> {
        let now = self.clock.now();
        if self.is_fresh(trigger, now) {
            Ok(())
        } else {
            Err(OrchestratorError::StaleInput {
                resource_key: trigger.resource_key.clone(),
                age_secs: trigger.age(now).num_seconds(),
                max_secs: self.config.max_input_age_secs,
            })
        }
    }

    /// Strictly farther than the movement threshold
    pub fn is_moved(&self, origin: GeoPoint, current: GeoPoint) -> bool {
        haversine_m(origin, current) > self.config.movement_threshold_m
    }

    pub fn validity(&self, artifact: &Artifact, current: GeoPoint) -> Validity {
        if artifact.status == ArtifactStatus::Superseded {
            return Validity::Superseded;
        }
        if self.clock.now() > artifact.valid_window_end {
            return Validity::Expired;
        }
        let distance_m = haversine_m(artifact.origin, current);
        if distance_m > self.config.movement_threshold_m {
            return Validity::Moved { distance_m };
        }
        Validity::Valid
    }

    /// Serving window for an artifact generated at `generated_at`
    pub fn window(&self, generated_at: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let validity = mins(self.config.artifact_validity_mins).min(mins(self.config.max_window_mins));
        (generated_at, generated_at + validity)
    }

    /// # Errors
    ///
    /// `InvalidOutput` when the window is inverted or longer than
    /// `max_window_mins`.
    pub fn check_window(&self, artifact: &Artifact) -> Result<()> {
        let length = artifact.valid_window_end - artifact.valid_window_start;
        if length < Duration::zero() || length > mins(self.config.max_window_mins) {
            return Err(OrchestratorError::invalid_output(format!(
                "validity window of {}s exceeds {} minutes",
                length.num_seconds(),
                self.config.max_window_mins
            )));
        }
        Ok(())
    }

    /// Whether an artifact stamped `generated_at` may answer `trigger`
    ///
    /// The stamp may trail the trigger's input by the input recency window
    /// plus `generation_skew_secs`, and lead it by `generation_skew_secs`.
    ///
    /// # Errors
    ///
    /// `StaleInput` when a retried or reaped job outlived its input;
    /// `InvalidOutput` when the stamp precedes the input.
    pub fn check_generation(&self, trigger: &Trigger, generated_at: DateTime<Utc>) -> Result<()> {
        let skew = secs(self.config.generation_skew_secs);
        let lag = generated_at - trigger.resolved_at;
        let max_lag = secs(self.config.max_input_age_secs) + skew;
        if lag > max_lag {
            return Err(OrchestratorError::StaleInput {
                resource_key: trigger.resource_key.clone(),
                age_secs: lag.num_seconds(),
                max_secs: u64::try_from(max_lag.num_seconds()).unwrap_or(u64::MAX),
            });
        }
        if -lag > skew {
            return Err(OrchestratorError::invalid_output(format!(
                "generated_at is {}s before the trigger was resolved",
                (-lag).num_seconds()
            )));
        }
        Ok(())
    }
}
