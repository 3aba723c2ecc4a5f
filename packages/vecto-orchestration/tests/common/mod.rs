//! Shared fakes and wiring for the integration tests

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use vecto_orchestration::{
    ArtifactService, Clock, EnrichmentService, HedgedRouter, InProcessBus, JobQueue, LockManager,
    ManualClock, OrchestrationConfig, PipelineOrchestrator, ProviderError, ProviderKind,
    ProviderSpec, ProviderTransport, Trigger, Venue, VenueDetails, WireRequest, WireResponse,
    Worker,
};
use uuid::Uuid;
use vecto_storage::{
    Artifact, ArtifactStore, EnqueueResult, GeoPoint, InMemoryStore, Job, JobFailure, JobOutcome,
    JobStore, Lock, LockStore, NewJob, Notification, NotificationLog, PipelineStore, SqliteStore,
    StorageError, UpsertOutcome,
};

pub const ROLES: [&str; 4] = ["strategist", "tactician", "briefer", "consolidator"];

pub fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_760_000_000, 0).unwrap()
}

pub fn downtown() -> GeoPoint {
    GeoPoint::new(32.7767, -96.7970)
}

pub fn plan_json(venues: usize) -> Value {
    let venues: Vec<_> = (0..venues)
        .map(|i| {
            json!({
                "name": format!("Venue {}", i),
                "address": format!("{} Elm St, Dallas, TX", 2700 + i),
                "category": if i % 2 == 0 { "nightlife" } else { "dining" },
                "distance_miles": 0.5 + i as f64 / 10.0,
                "drive_time_minutes": 2 + i,
                "reasoning": "Close-out crowd spills onto Elm Street around last call and most of them need a short ride home."
            })
        })
        .collect();
    json!({
        "summary": "Work Deep Ellum until midnight, then reposition uptown.",
        "staging_area": {
            "name": "Good Latimer lot",
            "address": "2650 Elm St, Dallas, TX",
            "reasoning": "Two minutes from every venue."
        },
        "venues": venues
    })
}

/// Wire-shaped success body for a vendor
pub fn reply(kind: ProviderKind, text: &str) -> WireResponse {
    let body = match kind {
        ProviderKind::OpenAi => json!({
            "choices": [{"message": {"content": text}}],
            "usage": {"prompt_tokens": 120, "completion_tokens": 80}
        }),
        ProviderKind::Anthropic => json!({
            "content": [{"type": "text", "text": text}],
            "usage": {"input_tokens": 120, "output_tokens": 80}
        }),
        ProviderKind::Gemini => json!({
            "candidates": [{"content": {"parts": [{"text": text}]}}]
        }),
        ProviderKind::Local => json!({"choices": [{"text": text}]}),
    };
    WireResponse { status: 200, body }
}

/// Provider pool where each role is served by `local/<role>`
pub struct FakeProviders {
    failing: Mutex<HashSet<String>>,
    consolidated: Mutex<String>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl FakeProviders {
    pub fn healthy() -> Arc<Self> {
        Arc::new(Self {
            failing: Mutex::new(HashSet::new()),
            consolidated: Mutex::new(plan_json(5).to_string()),
            delay: Mutex::new(None),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn fail_role(&self, role: &str) {
        self.failing.lock().insert(role.to_string());
    }

    pub fn heal(&self) {
        self.failing.lock().clear();
    }

    pub fn consolidate_with(&self, text: impl Into<String>) {
        *self.consolidated.lock() = text.into();
    }

    /// Every call takes this long before answering
    pub fn delay(&self, by: Duration) {
        *self.delay.lock() = Some(by);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderTransport for FakeProviders {
    async fn send(&self, request: WireRequest) -> Result<WireResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let role = request.provider.trim_start_matches("local/").to_string();
        if self.failing.lock().contains(&role) {
            return Err(ProviderError::Status {
                code: 503,
                message: format!("{} unavailable", role),
            });
        }
        let text = if role == "consolidator" {
            self.consolidated.lock().clone()
        } else {
            format!("{} says: demand is building downtown", role)
        };
        Ok(reply(ProviderKind::Local, &text))
    }
}

/// Knows every venue except those named `closed ...`; `flaky ...` errors
pub struct FakeEnrichment;

#[async_trait]
impl EnrichmentService for FakeEnrichment {
    async fn lookup(&self, venue: &Venue) -> anyhow::Result<Option<VenueDetails>> {
        if venue.name.starts_with("flaky") {
            anyhow::bail!("places API returned 500");
        }
        if venue.name.starts_with("closed") {
            return Ok(None);
        }
        Ok(Some(VenueDetails {
            hours: Some("16:00-02:00".to_string()),
            coordinates: Some(GeoPoint::new(32.784, -96.784)),
        }))
    }
}

pub fn test_config() -> OrchestrationConfig {
    let mut config = OrchestrationConfig::default();
    let mut providers = BTreeMap::new();
    for role in ROLES {
        providers.insert(
            role.to_string(),
            // Longer than the pipeline deadline so the deadline fires first
            vec![ProviderSpec::new(ProviderKind::Local, role).timeout_ms(60_000)],
        );
    }
    config.providers = providers;
    config
}

pub async fn sqlite_store() -> Arc<dyn PipelineStore> {
    Arc::new(SqliteStore::in_memory().await.unwrap())
}

pub fn memory_store() -> Arc<dyn PipelineStore> {
    Arc::new(InMemoryStore::new())
}

/// Delegates to an in-memory store; lock writes fail while `down` is set
pub struct LockOutage {
    inner: InMemoryStore,
    down: AtomicBool,
}

impl LockOutage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryStore::new(),
            down: AtomicBool::new(true),
        })
    }

    pub fn restore(&self) {
        self.down.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobStore for LockOutage {
    async fn enqueue_job(
        &self,
        job: NewJob,
        now: DateTime<Utc>,
    ) -> vecto_storage::Result<EnqueueResult> {
        self.inner.enqueue_job(job, now).await
    }

    async fn claim_job(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> vecto_storage::Result<Option<Job>> {
        self.inner.claim_job(worker_id, now).await
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        outcome: JobOutcome,
        now: DateTime<Utc>,
    ) -> vecto_storage::Result<()> {
        self.inner.complete_job(job_id, outcome, now).await
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> vecto_storage::Result<()> {
        self.inner.fail_job(job_id, failure, now).await
    }

    async fn get_job(&self, job_id: Uuid) -> vecto_storage::Result<Option<Job>> {
        self.inner.get_job(job_id).await
    }

    async fn latest_job(&self, resource_key: &str) -> vecto_storage::Result<Option<Job>> {
        self.inner.latest_job(resource_key).await
    }

    async fn requeue_abandoned(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> vecto_storage::Result<u64> {
        self.inner.requeue_abandoned(stale_before, now).await
    }
}

#[async_trait]
impl LockStore for LockOutage {
    async fn try_acquire_lock(&self, lock: &Lock, now: DateTime<Utc>) -> vecto_storage::Result<bool> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StorageError::database("database is locked"));
        }
        self.inner.try_acquire_lock(lock, now).await
    }

    async fn release_lock(&self, lock_key: &str, owner_token: &str) -> vecto_storage::Result<bool> {
        self.inner.release_lock(lock_key, owner_token).await
    }

    async fn get_lock(&self, lock_key: &str) -> vecto_storage::Result<Option<Lock>> {
        self.inner.get_lock(lock_key).await
    }
}

#[async_trait]
impl ArtifactStore for LockOutage {
    async fn upsert_artifact(
        &self,
        artifact: &Artifact,
        now: DateTime<Utc>,
    ) -> vecto_storage::Result<UpsertOutcome> {
        self.inner.upsert_artifact(artifact, now).await
    }

    async fn get_artifact(&self, resource_key: &str) -> vecto_storage::Result<Option<Artifact>> {
        self.inner.get_artifact(resource_key).await
    }

    async fn supersede_artifact(&self, resource_key: &str) -> vecto_storage::Result<bool> {
        self.inner.supersede_artifact(resource_key).await
    }
}

#[async_trait]
impl NotificationLog for LockOutage {
    async fn append_notification(
        &self,
        resource_key: &str,
        status: &str,
        now: DateTime<Utc>,
    ) -> vecto_storage::Result<i64> {
        self.inner.append_notification(resource_key, status, now).await
    }

    async fn notifications_since(
        &self,
        resource_key: &str,
        after_seq: i64,
    ) -> vecto_storage::Result<Vec<Notification>> {
        self.inner.notifications_since(resource_key, after_seq).await
    }

    async fn latest_notification_seq(&self) -> vecto_storage::Result<i64> {
        self.inner.latest_notification_seq().await
    }

    async fn prune_notifications(&self, before: DateTime<Utc>) -> vecto_storage::Result<u64> {
        self.inner.prune_notifications(before).await
    }
}

/// Everything a node runs, wired against one store
pub struct Harness {
    pub config: OrchestrationConfig,
    pub clock: Arc<ManualClock>,
    pub store: Arc<dyn PipelineStore>,
    pub bus: Arc<InProcessBus>,
    pub providers: Arc<FakeProviders>,
    pub queue: Arc<JobQueue>,
    pub locks: Arc<LockManager>,
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub service: ArtifactService,
}

impl Harness {
    pub fn new(store: Arc<dyn PipelineStore>) -> Self {
        Self::with_config(store, test_config())
    }

    pub fn with_config(store: Arc<dyn PipelineStore>, config: OrchestrationConfig) -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        let bus = Arc::new(InProcessBus::default());
        let providers = FakeProviders::healthy();

        let queue = Arc::new(JobQueue::new(store.clone(), clock.clone(), &config.queue));
        let locks = Arc::new(LockManager::new(store.clone(), clock.clone()));
        let router = Arc::new(HedgedRouter::from_config(&config, providers.clone()));
        let orchestrator = Arc::new(PipelineOrchestrator::new(
            &config,
            router,
            Arc::new(FakeEnrichment),
            store.clone(),
            bus.clone(),
            clock.clone(),
        ));
        let service = ArtifactService::new(
            queue.clone(),
            store.clone(),
            bus.clone(),
            clock.clone(),
            config.freshness.clone(),
        );

        Self {
            config,
            clock,
            store,
            bus,
            providers,
            queue,
            locks,
            orchestrator,
            service,
        }
    }

    pub fn worker(&self, id: &str) -> Worker {
        Worker::new(
            id,
            &self.config,
            self.queue.clone(),
            self.locks.clone(),
            self.orchestrator.clone(),
            self.bus.clone(),
        )
    }

    pub fn trigger(&self, resource_key: &str) -> Trigger {
        Trigger::new(
            resource_key,
            downtown(),
            "2200 Main St, Dallas, TX",
            self.clock.now(),
        )
    }
}
