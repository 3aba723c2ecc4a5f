//! One machine-parseable line per finished pipeline run
//!
//! Written on the `vecto::audit` target in logfmt, for both successful runs
//! and terminal failures:
//!
//! ```text
//! resource_key=driver-1 lat=32.776700 lng=-96.797000 window_start=2025-10-09T08:53:20Z window_end=... providers_used=strategist:openai/gpt-5,... freshness_ok=true quorum_met=true outcome=produced
//! ```
//!
//! Every provider call gets its own line on `vecto::provider_call`:
//!
//! ```text
//! role=strategist provider=openai/gpt-5 outcome=ok latency_ms=812 tokens_in=120 tokens_out=80 prompt_sha256=9f86d0...
//! ```

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::info;
use vecto_storage::{GeoPoint, UpsertOutcome};

use crate::orchestrator::{PipelineFailure, PipelineReport};
use crate::router::{AttemptOutcome, ProviderAttempt};

pub const AUDIT_TARGET: &str = "vecto::audit";
pub const PROVIDER_CALL_TARGET: &str = "vecto::provider_call";

#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub resource_key: String,
    pub coordinates: Option<GeoPoint>,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    pub providers_used: Vec<String>,
    pub freshness_ok: bool,
    pub quorum_met: bool,
    /// `produced`, `discarded` (lost the upsert race) or `error`
    pub outcome: &'static str,
    pub error_code: Option<&'static str>,
}

impl AuditRecord {
    pub fn from_report(report: &PipelineReport) -> Self {
        Self {
            resource_key: report.run.resource_key.clone(),
            coordinates: Some(report.run.origin),
            window_start: Some(report.artifact.valid_window_start),
            window_end: Some(report.artifact.valid_window_end),
            providers_used: report.run.providers_used.clone(),
            freshness_ok: report.run.freshness_ok,
            quorum_met: report.run.quorum_met,
            outcome: match report.persisted {
                UpsertOutcome::Conflict => "discarded",
                UpsertOutcome::Inserted | UpsertOutcome::Replaced { .. } => "produced",
            },
            error_code: None,
        }
    }

    pub fn from_failure(failure: &PipelineFailure) -> Self {
        Self {
            resource_key: failure.run.resource_key.clone(),
            coordinates: Some(failure.run.origin),
            window_start: None,
            window_end: None,
            providers_used: failure.run.providers_used.clone(),
            freshness_ok: failure.run.freshness_ok,
            quorum_met: failure.run.quorum_met,
            outcome: "error",
            error_code: Some(failure.error.code()),
        }
    }

    /// Failure before a run could start (undecodable payload, lock store down)
    pub fn rejected(resource_key: &str, error_code: &'static str) -> Self {
        Self {
            resource_key: resource_key.to_string(),
            coordinates: None,
            window_start: None,
            window_end: None,
            providers_used: Vec::new(),
            freshness_ok: false,
            quorum_met: false,
            outcome: "error",
            error_code: Some(error_code),
        }
    }

    pub fn to_logfmt(&self) -> String {
        let timestamp = |t: Option<DateTime<Utc>>| {
            t.map_or_else(|| "-".to_string(), |t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        };
        let (lat, lng) = self.coordinates.map_or_else(
            || ("-".to_string(), "-".to_string()),
            |p| (format!("{:.6}", p.lat), format!("{:.6}", p.lng)),
        );
        let providers = if self.providers_used.is_empty() {
            "-".to_string()
        } else {
            self.providers_used.join(",")
        };

        let mut line = [
            ("resource_key", self.resource_key.clone()),
            ("lat", lat),
            ("lng", lng),
            ("window_start", timestamp(self.window_start)),
            ("window_end", timestamp(self.window_end)),
            ("providers_used", providers),
            ("freshness_ok", self.freshness_ok.to_string()),
            ("quorum_met", self.quorum_met.to_string()),
            ("outcome", self.outcome.to_string()),
        ]
        .iter()
        .map(|(k, v)| format!("{}={}", k, logfmt_value(v)))
        .collect::<Vec<_>>()
        .join(" ");

        if let Some(code) = self.error_code {
            line.push_str(" error_code=");
            line.push_str(code);
        }
        line
    }

    pub fn emit(&self) {
        info!(target: AUDIT_TARGET, "{}", self.to_logfmt());
    }
}

impl ProviderAttempt {
    pub fn to_logfmt(&self) -> String {
        let tokens = |t: Option<u64>| t.map_or_else(|| "-".to_string(), |t| t.to_string());
        let (outcome, error) = match &self.outcome {
            AttemptOutcome::Ok => ("ok", None),
            AttemptOutcome::Failed(e) => ("failed", Some(e.as_str())),
        };

        let mut line = [
            ("role", self.role.clone()),
            ("provider", self.provider.clone()),
            ("outcome", outcome.to_string()),
            ("latency_ms", self.latency_ms.to_string()),
            ("tokens_in", tokens(self.tokens_in)),
            ("tokens_out", tokens(self.tokens_out)),
            ("prompt_sha256", self.prompt_sha256.clone()),
        ]
        .iter()
        .map(|(k, v)| format!("{}={}", k, logfmt_value(v)))
        .collect::<Vec<_>>()
        .join(" ");

        if let Some(error) = error {
            line.push_str(" error=");
            line.push_str(&logfmt_value(error));
        }
        line
    }

    pub fn emit(&self) {
        info!(target: PROVIDER_CALL_TARGET, "{}", self.to_logfmt());
    }
}

fn logfmt_value(value: &str) -> String {
    if value.is_empty() {
        return "\"\"".to_string();
    }
    if value.chars().any(|c| c.is_whitespace() || c == '=' || c == '"') {
        format!("{:?}", value)
    } else {
        value.to_string()
    }
}
