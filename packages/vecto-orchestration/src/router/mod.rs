//! Hedged router: ordered fallback across redundant providers per role
//!
//! For each role the chain is tried strictly in order, one provider at a time
//! (no simultaneous racing). Each provider call carries its own timeout and
//! may be retried `max_retries` times on transient errors before the router
//! falls through to the next provider. The first success wins and is reported
//! as `provider_used`.

pub mod adapters;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use adapters::{AdapterSettings, ProviderAdapter};

use crate::config::{OrchestrationConfig, ProviderSpec};
use crate::error::{OrchestratorError, Result};
use crate::metrics::PipelineMetrics;

/// Vendor-neutral request built by the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub role: String,
    pub system: Option<String>,
    pub prompt: String,
    /// Ask for a single JSON document back
    pub json_mode: bool,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl PipelineRequest {
    pub fn new(role: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            system: None,
            prompt: prompt.into(),
            json_mode: false,
            temperature: 0.7,
            max_tokens: 4096,
        }
    }

    /// JSON mode with the lower temperature and larger budget it needs
    pub fn json(mut self) -> Self {
        self.json_mode = true;
        self.temperature = 0.2;
        self.max_tokens = 8192;
        self
    }

    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn prompt_sha256(&self) -> String {
        let mut hasher = Sha256::new();
        if let Some(system) = &self.system {
            hasher.update(system.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(self.prompt.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Vendor wire request produced by an adapter
#[derive(Debug, Clone, PartialEq)]
pub struct WireRequest {
    /// `kind/model` of the provider this is addressed to
    pub provider: String,
    pub url: String,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WireResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderOutput {
    pub text: String,
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("transport error: {message}")]
    Transport { message: String, transient: bool },

    #[error("HTTP {code}: {message}")]
    Status { code: u16, message: String },

    #[error("decode error: {0}")]
    Decode(String),
}

impl ProviderError {
    /// Worth another attempt on the same provider
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Timeout { .. } => true,
            ProviderError::Transport { transient, .. } => *transient,
            ProviderError::Status { code, .. } => *code == 429 || *code >= 500,
            ProviderError::Decode(_) => false,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ProviderError::Timeout { .. } => "timeout",
            ProviderError::Transport { .. } => "transport",
            ProviderError::Status { .. } => "status",
            ProviderError::Decode(_) => "decode",
        }
    }
}

/// Network seam to the provider pool
#[async_trait]
pub trait ProviderTransport: Send + Sync {
    async fn send(&self, request: WireRequest) -> std::result::Result<WireResponse, ProviderError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Ok,
    Failed(String),
}

/// One provider invocation, successful or not
///
/// Emitted on the `vecto::provider_call` target as it happens and kept on the
/// run for the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderAttempt {
    pub role: String,
    pub provider: String,
    pub outcome: AttemptOutcome,
    pub latency_ms: u64,
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
    pub prompt_sha256: String,
}

#[derive(Debug, Clone)]
pub struct RoutedResponse {
    pub output: ProviderOutput,
    pub provider_used: String,
    pub attempts: Vec<ProviderAttempt>,
}

struct Route {
    spec: ProviderSpec,
    adapter: ProviderAdapter,
}

pub struct HedgedRouter {
    chains: BTreeMap<String, Vec<Route>>,
    transport: Arc<dyn ProviderTransport>,
    metrics: PipelineMetrics,
}

impl HedgedRouter {
    pub fn new(
        providers: &BTreeMap<String, Vec<ProviderSpec>>,
        transport: Arc<dyn ProviderTransport>,
    ) -> Self {
        let chains = providers
            .iter()
            .map(|(role, specs)| {
                let routes = specs
                    .iter()
                    .map(|spec| Route {
                        spec: spec.clone(),
                        adapter: ProviderAdapter::from_spec(spec),
                    })
                    .collect();
                (role.clone(), routes)
            })
            .collect();

        Self {
            chains,
            transport,
            metrics: PipelineMetrics::disabled(),
        }
    }

    pub fn from_config(config: &OrchestrationConfig, transport: Arc<dyn ProviderTransport>) -> Self {
        Self::new(&config.providers, transport)
    }

    pub fn with_metrics(mut self, metrics: PipelineMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// `kind/model` ids configured for a role, in call order
    pub fn chain(&self, role: &str) -> Vec<String> {
        self.chains
            .get(role)
            .map(|routes| routes.iter().map(|r| r.spec.id()).collect())
            .unwrap_or_default()
    }

    /// Invoke the role's chain until one provider succeeds
    ///
    /// # Errors
    ///
    /// `ProviderFailure` when every provider in the chain failed.
    pub async fn call(&self, role: &str, request: &PipelineRequest) -> Result<RoutedResponse> {
        let routes = self
            .chains
            .get(role)
            .filter(|routes| !routes.is_empty())
            .ok_or_else(|| OrchestratorError::ProviderFailure {
                role: role.to_string(),
                detail: "no providers configured".to_string(),
            })?;

        let fingerprint = request.prompt_sha256();
        let mut attempts = Vec::new();

        for (position, route) in routes.iter().enumerate() {
            if position > 0 {
                self.metrics.provider_fallback(role);
            }
            let provider = route.spec.id();

            for attempt in 0..=route.spec.max_retries {
                let started = Instant::now();
                let result = self.invoke(route, request).await;
                let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

                match result {
                    Ok(output) => {
                        let record = ProviderAttempt {
                            role: role.to_string(),
                            provider: provider.clone(),
                            outcome: AttemptOutcome::Ok,
                            latency_ms,
                            tokens_in: output.tokens_in,
                            tokens_out: output.tokens_out,
                            prompt_sha256: fingerprint.clone(),
                        };
                        record.emit();
                        attempts.push(record);
                        if position > 0 {
                            info!(role, provider = %provider, "served by fallback provider");
                        }
                        return Ok(RoutedResponse {
                            output,
                            provider_used: provider,
                            attempts,
                        });
                    }
                    Err(err) => {
                        let record = ProviderAttempt {
                            role: role.to_string(),
                            provider: provider.clone(),
                            outcome: AttemptOutcome::Failed(err.to_string()),
                            latency_ms,
                            tokens_in: None,
                            tokens_out: None,
                            prompt_sha256: fingerprint.clone(),
                        };
                        record.emit();
                        attempts.push(record);
                        let retry = err.is_transient() && attempt < route.spec.max_retries;
                        if retry {
                            debug!(role, provider = %provider, attempt, "retrying provider: {}", err);
                        } else {
                            warn!(
                                role,
                                provider = %provider,
                                error = err.label(),
                                "provider failed: {}",
                                err
                            );
                            break;
                        }
                    }
                }
            }
        }

        let detail = attempts
            .iter()
            .filter_map(|a| match &a.outcome {
                AttemptOutcome::Failed(e) => Some(format!("{}: {}", a.provider, e)),
                AttemptOutcome::Ok => None,
            })
            .collect::<Vec<_>>()
            .join("; ");
        Err(OrchestratorError::ProviderFailure {
            role: role.to_string(),
            detail,
        })
    }

    async fn invoke(
        &self,
        route: &Route,
        request: &PipelineRequest,
    ) -> std::result::Result<ProviderOutput, ProviderError> {
        let wire = route.adapter.encode(request);
        match tokio::time::timeout(route.spec.timeout(), self.transport.send(wire)).await {
            Err(_) => Err(ProviderError::Timeout {
                after_ms: route.spec.timeout_ms,
            }),
            Ok(Err(err)) => Err(err),
            Ok(Ok(response)) => route.adapter.decode(request, response),
        }
    }
}
