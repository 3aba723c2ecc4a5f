/*
 * Vecto Orchestration - Strategy Pipeline Core
 *
 * Turns a driver's position into a persisted strategy artifact, with
 * single-writer-per-resource semantics across any number of workers.
 *
 * Architecture:
 * - Job Queue (atomic claim, retry with capped backoff)
 * - TTL Locks (conditional upsert, self-healing after crashes)
 * - Pipeline: fan-out with quorum → consolidate → enrich → persist → notify
 * - Hedged Router (sequential provider fallback, per-provider timeouts)
 * - Notification Bus (in-process broadcast or store-backed log)
 * - Freshness Guard (input recency, validity window, movement)
 */

// Public modules
pub mod audit;
pub mod clock;
pub mod config;
pub mod enrichment;
pub mod error;
pub mod freshness;
pub mod job;
pub mod lock;
pub mod metrics;
pub mod notify;
pub mod orchestrator;
pub mod plan;
pub mod prompts;
pub mod queue;
pub mod router;
pub mod service;
pub mod telemetry;
pub mod worker;

// Re-exports
pub use audit::{AuditRecord, AUDIT_TARGET, PROVIDER_CALL_TARGET};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    ConfigError, FanoutRole, FreshnessConfig, LockConfig, OrchestrationConfig, PipelineConfig,
    ProviderKind, ProviderSpec, QueueConfig,
};
pub use enrichment::{enrich_venues, EnrichedVenue, Enrichment, EnrichmentService, VenueDetails};
pub use error::{ErrorCategory, OrchestratorError, Result};
pub use freshness::{haversine_m, FreshnessGuard, Validity};
pub use job::{next_backoff, RetryDecision, RetryPolicy, Trigger, STRATEGY_JOB_KIND};
pub use lock::{LockLease, LockManager};
pub use metrics::PipelineMetrics;
pub use notify::{
    CompletionStatus, InProcessBus, NotificationBus, StoreNotificationBus, Subscription,
};
pub use orchestrator::{
    PipelineFailure, PipelineOrchestrator, PipelineReport, PipelineRun, PipelineState,
};
pub use plan::{StagingArea, StrategyPlan, Venue};
pub use queue::{FailDisposition, JobQueue};
pub use router::{
    AttemptOutcome, HedgedRouter, PipelineRequest, ProviderAdapter, ProviderAttempt,
    ProviderError, ProviderOutput, ProviderTransport, RoutedResponse, WireRequest, WireResponse,
};
pub use service::{ArtifactService, ArtifactView};
pub use telemetry::init_tracing;
pub use worker::{WorkOutcome, Worker};
