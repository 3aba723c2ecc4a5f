//! Pipeline orchestrator
//!
//! One run per resource key, executed by the worker that holds the key's
//! lock:
//!
//! ```text
//! Idle → FanningOut → Consolidating → Enriching → Persisted → Notified
//!            │              │              │
//!            └──────────────┴──────────────┴──▶ Errored
//! ```
//!
//! Fan-out, consolidation and enrichment share one deadline. Persisting
//! happens only after all three finished inside it, so a timed-out run never
//! writes a partial artifact.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};
use vecto_storage::{Artifact, ArtifactStatus, GeoPoint, PipelineStore, UpsertOutcome};

use crate::clock::Clock;
use crate::config::{OrchestrationConfig, PipelineConfig};
use crate::enrichment::{enrich_venues, EnrichedVenue, EnrichmentService};
use crate::error::{OrchestratorError, Result};
use crate::freshness::FreshnessGuard;
use crate::job::Trigger;
use crate::notify::{CompletionStatus, NotificationBus};
use crate::plan::{StagingArea, StrategyPlan};
use crate::prompts;
use crate::router::{HedgedRouter, ProviderAttempt, ProviderOutput, RoutedResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    FanningOut,
    Consolidating,
    Enriching,
    Persisted,
    Notified,
    Errored,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::FanningOut => "fanning_out",
            PipelineState::Consolidating => "consolidating",
            PipelineState::Enriching => "enriching",
            PipelineState::Persisted => "persisted",
            PipelineState::Notified => "notified",
            PipelineState::Errored => "errored",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Notified | PipelineState::Errored)
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-memory record of one run, owned by the executing worker
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub resource_key: String,
    pub origin: GeoPoint,
    pub started_at: DateTime<Utc>,
    pub state: PipelineState,
    /// Trigger input was within the recency window at run start
    pub freshness_ok: bool,
    pub quorum_met: bool,
    /// `role:kind/model` for every call that succeeded
    pub providers_used: Vec<String>,
    pub attempts: Vec<ProviderAttempt>,
}

impl PipelineRun {
    pub fn new(trigger: &Trigger, started_at: DateTime<Utc>, freshness_ok: bool) -> Self {
        Self {
            resource_key: trigger.resource_key.clone(),
            origin: trigger.coordinates,
            started_at,
            state: PipelineState::Idle,
            freshness_ok,
            quorum_met: false,
            providers_used: Vec::new(),
            attempts: Vec::new(),
        }
    }

    fn advance(&mut self, to: PipelineState) {
        debug!(resource_key = %self.resource_key, from = %self.state, to = %to, "pipeline state");
        self.state = to;
    }

    fn record(&mut self, role: &str, routed: RoutedResponse) -> ProviderOutput {
        self.attempts.extend(routed.attempts);
        self.providers_used
            .push(format!("{}:{}", role, routed.provider_used));
        routed.output
    }
}

/// A run that reached `Persisted`
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub run: PipelineRun,
    /// The artifact this run built; not stored when `persisted` is `Conflict`
    pub artifact: Artifact,
    pub persisted: UpsertOutcome,
}

/// A run that ended in `Errored`
#[derive(Debug)]
pub struct PipelineFailure {
    pub run: PipelineRun,
    pub error: OrchestratorError,
}

impl std::fmt::Display for PipelineFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pipeline for {} failed: {}",
            self.run.resource_key, self.error
        )
    }
}

#[derive(Serialize)]
struct ArtifactContent<'a> {
    summary: &'a str,
    staging_area: &'a StagingArea,
    venues: &'a [EnrichedVenue],
}

pub struct PipelineOrchestrator {
    router: Arc<HedgedRouter>,
    enrichment: Arc<dyn EnrichmentService>,
    store: Arc<dyn PipelineStore>,
    bus: Arc<dyn NotificationBus>,
    clock: Arc<dyn Clock>,
    guard: FreshnessGuard,
    config: PipelineConfig,
}

impl PipelineOrchestrator {
    pub fn new(
        config: &OrchestrationConfig,
        router: Arc<HedgedRouter>,
        enrichment: Arc<dyn EnrichmentService>,
        store: Arc<dyn PipelineStore>,
        bus: Arc<dyn NotificationBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            router,
            enrichment,
            store,
            bus,
            guard: FreshnessGuard::new(config.freshness.clone(), clock.clone()),
            clock,
            config: config.pipeline.clone(),
        }
    }

    /// Failure record for a run that never produced its own (panic, shutdown)
    pub fn abandoned_run(&self, trigger: &Trigger, error: OrchestratorError) -> PipelineFailure {
        let now = self.clock.now();
        let mut run = PipelineRun::new(trigger, now, self.guard.is_fresh(trigger, now));
        run.state = PipelineState::Errored;
        PipelineFailure { run, error }
    }

    /// Execute the whole pipeline for one trigger
    pub async fn run(&self, trigger: &Trigger) -> std::result::Result<PipelineReport, PipelineFailure> {
        let started_at = self.clock.now();
        let freshness_ok = self.guard.is_fresh(trigger, started_at);
        let mut run = PipelineRun::new(trigger, started_at, freshness_ok);
        info!(
            resource_key = %trigger.resource_key,
            freshness_ok,
            "pipeline started"
        );

        let result = self.execute(trigger, &mut run).await;
        match result {
            Ok((artifact, persisted)) => Ok(PipelineReport {
                run,
                artifact,
                persisted,
            }),
            Err(error) => {
                warn!(
                    resource_key = %trigger.resource_key,
                    state = %run.state,
                    code = error.code(),
                    "pipeline errored: {}",
                    error
                );
                run.advance(PipelineState::Errored);
                Err(PipelineFailure { run, error })
            }
        }
    }

    async fn execute(
        &self,
        trigger: &Trigger,
        run: &mut PipelineRun,
    ) -> Result<(Artifact, UpsertOutcome)> {
        // The artifact is stamped with the run start
        self.guard.check_generation(trigger, run.started_at)?;

        let deadline = self.config.deadline();
        let produced = tokio::time::timeout(deadline, self.produce(trigger, run)).await;
        let content = match produced {
            Ok(content) => content?,
            Err(_) => {
                return Err(OrchestratorError::Timeout(format!(
                    "pipeline deadline of {}ms passed while {}",
                    self.config.deadline_ms, run.state
                )))
            }
        };

        let (window_start, window_end) = self.guard.window(run.started_at);
        let artifact = Artifact {
            resource_key: trigger.resource_key.clone(),
            content,
            provider_chain_used: run.providers_used.clone(),
            origin: trigger.coordinates,
            valid_window_start: window_start,
            valid_window_end: window_end,
            generated_at: run.started_at,
            status: ArtifactStatus::Active,
            generation: 1,
        };
        self.guard.check_window(&artifact)?;

        let persisted = self
            .store
            .upsert_artifact(&artifact, self.clock.now())
            .await?;
        match persisted {
            UpsertOutcome::Conflict => info!(
                resource_key = %artifact.resource_key,
                "live artifact already exists, discarding this run's result"
            ),
            UpsertOutcome::Inserted | UpsertOutcome::Replaced { .. } => info!(
                resource_key = %artifact.resource_key,
                window_end = %artifact.valid_window_end,
                providers = artifact.provider_chain_used.len(),
                "artifact persisted"
            ),
        }
        run.advance(PipelineState::Persisted);

        match self
            .bus
            .publish(&artifact.resource_key, CompletionStatus::Ready)
            .await
        {
            Ok(()) => run.advance(PipelineState::Notified),
            // Waiters fall back to the store
            Err(e) => warn!(resource_key = %artifact.resource_key, "notify failed: {}", e),
        }

        Ok((artifact, persisted))
    }

    async fn produce(&self, trigger: &Trigger, run: &mut PipelineRun) -> Result<serde_json::Value> {
        run.advance(PipelineState::FanningOut);
        let analyses = self.fan_out(trigger, run).await?;

        run.advance(PipelineState::Consolidating);
        let plan = self.consolidate(trigger, run, &analyses).await?;

        run.advance(PipelineState::Enriching);
        let venues = enrich_venues(
            self.enrichment.as_ref(),
            plan.venues.clone(),
            self.config.enrichment_concurrency,
            self.config.enrichment_timeout(),
        )
        .await;
        let known = venues.iter().filter(|v| v.coordinates.is_known()).count();
        debug!(resource_key = %trigger.resource_key, venues = venues.len(), known, "venues enriched");

        serde_json::to_value(ArtifactContent {
            summary: &plan.summary,
            staging_area: &plan.staging_area,
            venues: &venues,
        })
        .map_err(OrchestratorError::serialization)
    }

    /// Call every fan-out role concurrently; succeed once the quorum answered
    async fn fan_out(&self, trigger: &Trigger, run: &mut PipelineRun) -> Result<Vec<(String, String)>> {
        let now = run.started_at;
        let calls = self.config.fanout_roles.iter().map(|role| async move {
            let request = prompts::fanout_request(role, trigger, now);
            (role.name.as_str(), self.router.call(&role.name, &request).await)
        });
        let results = join_all(calls).await;

        let total = results.len();
        let mut analyses = Vec::with_capacity(total);
        for (role, result) in results {
            match result {
                Ok(routed) => {
                    let output = run.record(role, routed);
                    analyses.push((role.to_string(), output.text));
                }
                Err(e) => warn!(resource_key = %trigger.resource_key, role, "fan-out role failed: {}", e),
            }
        }

        if analyses.len() < self.config.quorum {
            return Err(OrchestratorError::QuorumNotMet {
                succeeded: analyses.len(),
                required: self.config.quorum,
                total,
            });
        }
        run.quorum_met = true;
        info!(
            resource_key = %trigger.resource_key,
            succeeded = analyses.len(),
            total,
            "fan-out quorum met"
        );
        Ok(analyses)
    }

    async fn consolidate(
        &self,
        trigger: &Trigger,
        run: &mut PipelineRun,
        analyses: &[(String, String)],
    ) -> Result<StrategyPlan> {
        let role = &self.config.consolidator_role;
        let request = prompts::consolidation_request(
            role,
            trigger,
            run.started_at,
            analyses,
            self.config.min_venues,
            self.config.min_reasoning_words,
        );
        let routed = self.router.call(role, &request).await?;
        let output = run.record(role, routed);
        StrategyPlan::parse(
            &output.text,
            self.config.min_venues,
            self.config.min_reasoning_words,
        )
    }
}
