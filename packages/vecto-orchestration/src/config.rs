//! Orchestration configuration (YAML schema v1)
//!
//! ```yaml
//! version: 1
//! queue:
//!   max_attempts: 5
//! pipeline:
//!   quorum: 2
//! providers:
//!   consolidator:
//!     - { kind: openai, model: gpt-5, timeout_ms: 20000 }
//!     - { kind: anthropic, model: claude-sonnet-4-5, timeout_ms: 20000 }
//! ```
//!
//! Every section is optional and falls back to its defaults.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SUPPORTED_VERSIONS: &[u32] = &[1];

/// Configuration error type
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Range validation error
    #[error("Invalid range for field '{field}': {value} not in {min}..={max}")]
    Range {
        field: String,
        value: String,
        min: String,
        max: String,
    },

    /// Two settings that cannot hold together
    #[error("Configuration conflict: {issue}. Fix: {fix}")]
    Conflict { issue: String, fix: String },

    /// A role the pipeline calls has no provider chain
    #[error("No providers configured for role '{0}'")]
    MissingProviders(String),

    #[error("Missing 'version' field in configuration file. Add 'version: 1' to the top of your YAML file.")]
    MissingVersion,

    #[error("Unsupported configuration version {found}. Supported versions: {}", supported.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", "))]
    UnsupportedVersion { found: u64, supported: Vec<u32> },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

impl ConfigError {
    pub fn range(
        field: impl Into<String>,
        value: impl ToString,
        min: impl ToString,
        max: impl ToString,
    ) -> Self {
        Self::Range {
            field: field.into(),
            value: value.to_string(),
            min: min.to_string(),
            max: max.to_string(),
        }
    }

    pub fn conflict(issue: impl Into<String>, fix: impl Into<String>) -> Self {
        Self::Conflict {
            issue: issue.into(),
            fix: fix.into(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Sections
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Claims per job before a transient failure becomes terminal
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Idle worker sleep between empty claims
    pub poll_interval_ms: u64,
    /// Running jobs untouched this long are handed back to the queue
    pub abandoned_after_secs: u64,
    /// Completion log entries older than this are pruned by the worker sweep
    pub notification_retention_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 2_000,
            backoff_max_ms: 60_000,
            poll_interval_ms: 500,
            abandoned_after_secs: 300,
            notification_retention_secs: 3_600,
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn notification_retention(&self) -> chrono::Duration {
        let secs = i64::try_from(self.notification_retention_secs).unwrap_or(i64::MAX / 1_000);
        chrono::Duration::seconds(secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockConfig {
    pub ttl_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { ttl_secs: 90 }
    }
}

/// One parallel fan-out call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FanoutRole {
    pub name: String,
    pub instruction: String,
}

impl FanoutRole {
    pub fn new(name: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instruction: instruction.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Overall budget for fan-out, consolidation and enrichment
    pub deadline_ms: u64,
    pub quorum: usize,
    pub fanout_roles: Vec<FanoutRole>,
    pub consolidator_role: String,
    pub min_venues: usize,
    /// Words of reasoning each venue needs; 0 disables the check
    pub min_reasoning_words: usize,
    pub enrichment_concurrency: usize,
    pub enrichment_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            deadline_ms: 50_000,
            quorum: 2,
            fanout_roles: vec![
                FanoutRole::new(
                    "strategist",
                    "Assess current demand: surge likelihood, event and airport activity, timing.",
                ),
                FanoutRole::new(
                    "tactician",
                    "Propose specific pickup venues near the driver with addresses and categories.",
                ),
                FanoutRole::new(
                    "briefer",
                    "Summarize traffic, weather and closures that affect the next hour of driving.",
                ),
            ],
            consolidator_role: "consolidator".to_string(),
            min_venues: 4,
            min_reasoning_words: 15,
            enrichment_concurrency: 4,
            enrichment_timeout_ms: 5_000,
        }
    }
}

impl PipelineConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn enrichment_timeout(&self) -> Duration {
        Duration::from_millis(self.enrichment_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FreshnessConfig {
    /// Oldest acceptable `resolved_at` on a trigger
    pub max_input_age_secs: u64,
    /// Distance from the artifact origin that invalidates it
    pub movement_threshold_m: f64,
    pub artifact_validity_mins: u64,
    pub max_window_mins: u64,
    /// Slack on `generated_at` around the trigger's `resolved_at`, on top of
    /// `max_input_age_secs`
    pub generation_skew_secs: u64,
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            max_input_age_secs: 120,
            movement_threshold_m: 500.0,
            artifact_validity_mins: 60,
            max_window_mins: 60,
            generation_skew_secs: 5,
        }
    }
}

/// Provider vendor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    OpenAi,
    Gemini,
    Local,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Local => "local",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn default_provider_timeout_ms() -> u64 {
    15_000
}

/// One entry in a role's ordered provider chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderSpec {
    pub kind: ProviderKind,
    pub model: String,
    #[serde(default = "default_provider_timeout_ms")]
    pub timeout_ms: u64,
    /// Extra attempts on this provider for transient errors
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl ProviderSpec {
    pub fn new(kind: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            kind,
            model: model.into(),
            timeout_ms: default_provider_timeout_ms(),
            max_retries: 0,
            temperature: None,
            reasoning_effort: None,
            endpoint: None,
        }
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// `kind/model`, as recorded in `provider_used`
    pub fn id(&self) -> String {
        format!("{}/{}", self.kind, self.model)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_providers() -> BTreeMap<String, Vec<ProviderSpec>> {
    use ProviderKind::*;

    let mut providers = BTreeMap::new();
    providers.insert(
        "strategist".to_string(),
        vec![
            ProviderSpec::new(Anthropic, "claude-sonnet-4-5"),
            ProviderSpec::new(OpenAi, "gpt-5"),
        ],
    );
    providers.insert(
        "tactician".to_string(),
        vec![
            ProviderSpec::new(OpenAi, "gpt-5"),
            ProviderSpec::new(Gemini, "gemini-2.5-pro"),
        ],
    );
    providers.insert(
        "briefer".to_string(),
        vec![
            ProviderSpec::new(Gemini, "gemini-2.5-flash"),
            ProviderSpec::new(Anthropic, "claude-haiku-4-5"),
        ],
    );
    providers.insert(
        "consolidator".to_string(),
        vec![
            ProviderSpec::new(OpenAi, "gpt-5").timeout_ms(20_000),
            ProviderSpec::new(Anthropic, "claude-sonnet-4-5").timeout_ms(20_000),
        ],
    );
    providers
}

// ═══════════════════════════════════════════════════════════════════════════
// Root
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrchestrationConfig {
    /// Schema version (always 1 for v1)
    pub version: u32,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub freshness: FreshnessConfig,
    /// Role name → ordered provider chain
    #[serde(default = "default_providers")]
    pub providers: BTreeMap<String, Vec<ProviderSpec>>,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            version: 1,
            queue: QueueConfig::default(),
            lock: LockConfig::default(),
            pipeline: PipelineConfig::default(),
            freshness: FreshnessConfig::default(),
            providers: default_providers(),
        }
    }
}

impl OrchestrationConfig {
    pub fn from_yaml_str(yaml: &str) -> ConfigResult<Self> {
        let raw: serde_yaml::Value = serde_yaml::from_str(yaml)?;
        match raw.get("version") {
            None => return Err(ConfigError::MissingVersion),
            Some(v) => {
                let found = v.as_u64().unwrap_or(0);
                if !SUPPORTED_VERSIONS.iter().any(|s| u64::from(*s) == found) {
                    return Err(ConfigError::UnsupportedVersion {
                        found,
                        supported: SUPPORTED_VERSIONS.to_vec(),
                    });
                }
            }
        }

        let config: Self = serde_yaml::from_value(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn providers_for(&self, role: &str) -> &[ProviderSpec] {
        self.providers.get(role).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Lock TTL as a chrono duration, for expiry arithmetic
    pub fn lock_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.lock.ttl_secs).unwrap_or(i64::MAX / 1_000))
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let pipeline = &self.pipeline;
        let roles = pipeline.fanout_roles.len();

        if roles == 0 {
            return Err(ConfigError::conflict(
                "pipeline.fanout_roles is empty",
                "declare at least one fan-out role",
            ));
        }
        for (i, role) in pipeline.fanout_roles.iter().enumerate() {
            if pipeline.fanout_roles[..i].iter().any(|r| r.name == role.name) {
                return Err(ConfigError::conflict(
                    format!("fan-out role '{}' is declared twice", role.name),
                    "give every fan-out role a unique name",
                ));
            }
            if role.name == pipeline.consolidator_role {
                return Err(ConfigError::conflict(
                    format!("'{}' is both a fan-out role and the consolidator", role.name),
                    "use a distinct consolidator_role",
                ));
            }
        }
        if pipeline.quorum < 1 || pipeline.quorum > roles {
            return Err(ConfigError::range("pipeline.quorum", pipeline.quorum, 1, roles));
        }
        if pipeline.enrichment_concurrency < 1 {
            return Err(ConfigError::range(
                "pipeline.enrichment_concurrency",
                pipeline.enrichment_concurrency,
                1,
                usize::MAX,
            ));
        }
        for (field, value) in [
            ("pipeline.deadline_ms", pipeline.deadline_ms),
            ("pipeline.enrichment_timeout_ms", pipeline.enrichment_timeout_ms),
            ("queue.poll_interval_ms", self.queue.poll_interval_ms),
            ("lock.ttl_secs", self.lock.ttl_secs),
            ("queue.notification_retention_secs", self.queue.notification_retention_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::range(field, value, 1, u64::MAX));
            }
        }

        if self.queue.max_attempts < 1 {
            return Err(ConfigError::range(
                "queue.max_attempts",
                self.queue.max_attempts,
                1,
                u32::MAX,
            ));
        }
        if self.queue.backoff_base_ms > self.queue.backoff_max_ms {
            return Err(ConfigError::conflict(
                "queue.backoff_base_ms exceeds queue.backoff_max_ms",
                "raise backoff_max_ms or lower backoff_base_ms",
            ));
        }

        if self.lock.ttl_secs.saturating_mul(1_000) <= pipeline.deadline_ms {
            return Err(ConfigError::conflict(
                format!(
                    "lock.ttl_secs ({}s) does not outlast pipeline.deadline_ms ({}ms)",
                    self.lock.ttl_secs, pipeline.deadline_ms
                ),
                "make the lock TTL longer than the pipeline deadline",
            ));
        }
        // A job still inside its deadline must never look abandoned
        if self.queue.abandoned_after_secs <= self.lock.ttl_secs {
            return Err(ConfigError::conflict(
                format!(
                    "queue.abandoned_after_secs ({}s) does not outlast lock.ttl_secs ({}s)",
                    self.queue.abandoned_after_secs, self.lock.ttl_secs
                ),
                "requeue abandoned jobs only after the lock TTL (and so the deadline) has passed",
            ));
        }

        let freshness = &self.freshness;
        if freshness.artifact_validity_mins == 0
            || freshness.artifact_validity_mins > freshness.max_window_mins
        {
            return Err(ConfigError::range(
                "freshness.artifact_validity_mins",
                freshness.artifact_validity_mins,
                1,
                freshness.max_window_mins,
            ));
        }
        if freshness.movement_threshold_m.is_nan() || freshness.movement_threshold_m <= 0.0 {
            return Err(ConfigError::range(
                "freshness.movement_threshold_m",
                freshness.movement_threshold_m,
                "0 (exclusive)",
                f64::MAX,
            ));
        }

        let called = pipeline
            .fanout_roles
            .iter()
            .map(|r| r.name.as_str())
            .chain(std::iter::once(pipeline.consolidator_role.as_str()));
        for role in called {
            let chain = self.providers_for(role);
            if chain.is_empty() {
                return Err(ConfigError::MissingProviders(role.to_string()));
            }
            if let Some(spec) = chain.iter().find(|s| s.timeout_ms == 0) {
                return Err(ConfigError::range(
                    format!("providers.{}.{}.timeout_ms", role, spec.id()),
                    0,
                    1,
                    u64::MAX,
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_is_valid() {
        let config = OrchestrationConfig::default();
        config.validate().unwrap();
        assert_eq!(config.freshness.max_input_age_secs, 120);
        assert_eq!(config.freshness.movement_threshold_m, 500.0);
        assert_eq!(config.pipeline.deadline_ms, 50_000);
        assert_eq!(config.pipeline.fanout_roles.len(), 3);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = OrchestrationConfig::default();
        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("version: 1"));
        assert!(yaml.contains("kind: openai"));

        let back = OrchestrationConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_yaml_partial_sections_use_defaults() {
        let yaml = r#"
version: 1
queue:
  max_attempts: 3
pipeline:
  quorum: 3
"#;
        let config = OrchestrationConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.queue.backoff_base_ms, 2_000);
        assert_eq!(config.pipeline.quorum, 3);
        assert_eq!(config.lock.ttl_secs, 90);
        assert!(!config.providers_for("consolidator").is_empty());
    }

    #[test]
    fn test_yaml_loading_from_file() {
        let yaml = r#"
version: 1
providers:
  strategist:
    - { kind: local, model: rideshare-ft-7b, endpoint: "http://gpu-1:8000", timeout_ms: 8000 }
  tactician:
    - { kind: openai, model: o4-mini, reasoning_effort: high, max_retries: 1 }
  briefer:
    - { kind: gemini, model: gemini-2.5-flash, temperature: 0.3 }
  consolidator:
    - { kind: anthropic, model: claude-sonnet-4-5 }
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let config = OrchestrationConfig::from_yaml_file(file.path()).unwrap();
        let strategist = &config.providers_for("strategist")[0];
        assert_eq!(strategist.kind, ProviderKind::Local);
        assert_eq!(strategist.endpoint.as_deref(), Some("http://gpu-1:8000"));
        assert_eq!(strategist.timeout_ms, 8_000);

        let tactician = &config.providers_for("tactician")[0];
        assert_eq!(tactician.reasoning_effort.as_deref(), Some("high"));
        assert_eq!(tactician.max_retries, 1);
        assert_eq!(tactician.timeout_ms, 15_000);
    }

    #[test]
    fn test_yaml_missing_version() {
        let err = OrchestrationConfig::from_yaml_str("queue:\n  max_attempts: 3\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingVersion));
    }

    #[test]
    fn test_yaml_unsupported_version() {
        let err = OrchestrationConfig::from_yaml_str("version: 2\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedVersion { found: 2, .. }));
    }

    #[test]
    fn test_yaml_unknown_field_rejected() {
        let err = OrchestrationConfig::from_yaml_str("version: 1\nlock:\n  ttl: 90\n").unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
    }

    #[test]
    fn test_quorum_out_of_range() {
        let mut config = OrchestrationConfig::default();
        config.pipeline.quorum = 4;
        assert!(matches!(config.validate(), Err(ConfigError::Range { .. })));

        config.pipeline.quorum = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Range { .. })));
    }

    #[test]
    fn test_lock_ttl_must_outlast_deadline() {
        let mut config = OrchestrationConfig::default();
        config.lock.ttl_secs = 50;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("lock.ttl_secs"));
    }

    #[test]
    fn test_abandoned_after_must_outlast_lock_and_deadline() {
        let mut config = OrchestrationConfig::default();
        for secs in [0, 30, 90] {
            config.queue.abandoned_after_secs = secs;
            let err = config.validate().unwrap_err();
            assert!(matches!(err, ConfigError::Conflict { .. }), "{}", secs);
            assert!(err.to_string().contains("queue.abandoned_after_secs"));
        }

        config.queue.abandoned_after_secs = 91;
        assert!(config.validate().is_ok());

        config.lock.ttl_secs = 120;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validity_cannot_exceed_max_window() {
        let mut config = OrchestrationConfig::default();
        config.freshness.artifact_validity_mins = 90;
        assert!(matches!(config.validate(), Err(ConfigError::Range { .. })));
    }

    #[test]
    fn test_missing_provider_chain() {
        let mut config = OrchestrationConfig::default();
        config.providers.remove("briefer");
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::MissingProviders(role) if role == "briefer"));
    }
}
