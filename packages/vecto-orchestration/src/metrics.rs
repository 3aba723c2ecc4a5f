//! Prometheus counters for the worker and router
//!
//! Without the `metrics` feature [`PipelineMetrics`] is a no-op handle with
//! the same API, so call sites never need `cfg` attributes.

#[cfg(feature = "metrics")]
use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry, IntCounter,
    IntCounterVec, Opts, Registry,
};
#[cfg(feature = "metrics")]
use std::sync::Arc;

#[cfg(feature = "metrics")]
struct Counters {
    claimed: IntCounter,
    completed: IntCounter,
    duplicates: IntCounter,
    failed: IntCounterVec,
    fallbacks: IntCounterVec,
}

#[derive(Clone, Default)]
pub struct PipelineMetrics {
    #[cfg(feature = "metrics")]
    counters: Option<Arc<Counters>>,
}

impl PipelineMetrics {
    pub fn disabled() -> Self {
        Self::default()
    }

    #[cfg(feature = "metrics")]
    pub fn register(registry: &Registry) -> prometheus::Result<Self> {
        let counters = Counters {
            claimed: register_int_counter_with_registry!(
                Opts::new("vecto_jobs_claimed_total", "Jobs claimed by workers"),
                registry
            )?,
            completed: register_int_counter_with_registry!(
                Opts::new("vecto_jobs_completed_total", "Jobs that produced an artifact"),
                registry
            )?,
            duplicates: register_int_counter_with_registry!(
                Opts::new(
                    "vecto_jobs_duplicate_total",
                    "Jobs completed as duplicate (resource lock busy)"
                ),
                registry
            )?,
            failed: register_int_counter_vec_with_registry!(
                Opts::new("vecto_jobs_failed_total", "Failed pipeline runs by error code"),
                &["code"],
                registry
            )?,
            fallbacks: register_int_counter_vec_with_registry!(
                Opts::new(
                    "vecto_provider_fallbacks_total",
                    "Calls that moved past the primary provider"
                ),
                &["role"],
                registry
            )?,
        };
        Ok(Self {
            counters: Some(Arc::new(counters)),
        })
    }

    pub fn job_claimed(&self) {
        #[cfg(feature = "metrics")]
        if let Some(c) = &self.counters {
            c.claimed.inc();
        }
    }

    pub fn job_completed(&self) {
        #[cfg(feature = "metrics")]
        if let Some(c) = &self.counters {
            c.completed.inc();
        }
    }

    pub fn job_duplicate(&self) {
        #[cfg(feature = "metrics")]
        if let Some(c) = &self.counters {
            c.duplicates.inc();
        }
    }

    pub fn job_failed(&self, _code: &str) {
        #[cfg(feature = "metrics")]
        if let Some(c) = &self.counters {
            c.failed.with_label_values(&[_code]).inc();
        }
    }

    pub fn provider_fallback(&self, _role: &str) {
        #[cfg(feature = "metrics")]
        if let Some(c) = &self.counters {
            c.fallbacks.with_label_values(&[_role]).inc();
        }
    }
}

impl std::fmt::Debug for PipelineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        #[cfg(feature = "metrics")]
        let enabled = self.counters.is_some();
        #[cfg(not(feature = "metrics"))]
        let enabled = false;
        f.debug_struct("PipelineMetrics")
            .field("enabled", &enabled)
            .finish()
    }
}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use super::*;

    #[test]
    fn test_counters_register_and_count() {
        let registry = Registry::new();
        let metrics = PipelineMetrics::register(&registry).unwrap();
        metrics.job_claimed();
        metrics.job_failed("TIMEOUT");
        metrics.provider_fallback("strategist");

        let families = registry.gather();
        let names: Vec<_> = families.iter().map(|f| f.get_name().to_string()).collect();
        assert!(names.contains(&"vecto_jobs_claimed_total".to_string()));
        assert!(names.contains(&"vecto_jobs_failed_total".to_string()));
    }

    #[test]
    fn test_duplicate_registration_is_an_error() {
        let registry = Registry::new();
        PipelineMetrics::register(&registry).unwrap();
        assert!(PipelineMetrics::register(&registry).is_err());
    }
}
