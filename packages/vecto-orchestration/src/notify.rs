//! Completion notifications
//!
//! The bus only saves waiters from polling. The artifact store stays the
//! source of truth: a subscriber that times out reads the store instead.
//!
//! - [`InProcessBus`]: `tokio::sync::broadcast`, single node
//! - [`StoreNotificationBus`]: appends to the store's notification log and
//!   polls it, so publishers and subscribers may live in different processes

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use vecto_storage::PipelineStore;

use crate::clock::Clock;
use crate::error::{OrchestratorError, Result};

/// Status published when a resource's pipeline finishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    /// An artifact was persisted (by this run or a racing one)
    Ready,
    /// The job failed terminally
    Failed,
}

impl CompletionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionStatus::Ready => "ready",
            CompletionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "ready" => Ok(CompletionStatus::Ready),
            "failed" => Ok(CompletionStatus::Failed),
            _ => Err(OrchestratorError::schema(format!(
                "unknown completion status: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stream of statuses for one resource key
pub struct Subscription {
    resource_key: String,
    inner: BoxStream<'static, CompletionStatus>,
}

impl Subscription {
    pub fn new(resource_key: impl Into<String>, inner: BoxStream<'static, CompletionStatus>) -> Self {
        Self {
            resource_key: resource_key.into(),
            inner,
        }
    }

    pub fn resource_key(&self) -> &str {
        &self.resource_key
    }

    /// `None` once the bus is gone
    pub async fn next(&mut self) -> Option<CompletionStatus> {
        self.inner.next().await
    }

    /// Next status, or `None` when `timeout` elapses first
    pub async fn wait(&mut self, timeout: Duration) -> Option<CompletionStatus> {
        tokio::time::timeout(timeout, self.next()).await.ok().flatten()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("resource_key", &self.resource_key)
            .finish()
    }
}

#[async_trait]
pub trait NotificationBus: Send + Sync {
    async fn publish(&self, resource_key: &str, status: CompletionStatus) -> Result<()>;

    /// Only statuses published after this call are delivered
    async fn subscribe(&self, resource_key: &str) -> Result<Subscription>;

    /// Drop delivered history older than `retention`; buses that keep none
    /// return 0
    async fn prune(&self, _retention: chrono::Duration) -> Result<u64> {
        Ok(0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// In-process broadcast
// ═══════════════════════════════════════════════════════════════════════════

pub struct InProcessBus {
    sender: broadcast::Sender<(String, CompletionStatus)>,
}

impl InProcessBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl NotificationBus for InProcessBus {
    async fn publish(&self, resource_key: &str, status: CompletionStatus) -> Result<()> {
        // No receivers is fine: nobody is waiting
        let delivered = self
            .sender
            .send((resource_key.to_string(), status))
            .unwrap_or(0);
        debug!(resource_key, %status, delivered, "published");
        Ok(())
    }

    async fn subscribe(&self, resource_key: &str) -> Result<Subscription> {
        let receiver = self.sender.subscribe();
        let key = resource_key.to_string();

        let inner = stream::unfold((receiver, key.clone()), |(mut receiver, key)| async move {
            loop {
                match receiver.recv().await {
                    Ok((k, status)) if k == key => return Some((status, (receiver, key))),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(resource_key = %key, skipped, "subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(Subscription::new(key, inner.boxed()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Store-backed log
// ═══════════════════════════════════════════════════════════════════════════

pub struct StoreNotificationBus {
    store: Arc<dyn PipelineStore>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
}

impl StoreNotificationBus {
    pub fn new(store: Arc<dyn PipelineStore>, clock: Arc<dyn Clock>, poll_interval: Duration) -> Self {
        Self {
            store,
            clock,
            poll_interval,
        }
    }
}

struct PollState {
    store: Arc<dyn PipelineStore>,
    key: String,
    cursor: i64,
    pending: VecDeque<CompletionStatus>,
    poll_interval: Duration,
}

#[async_trait]
impl NotificationBus for StoreNotificationBus {
    async fn publish(&self, resource_key: &str, status: CompletionStatus) -> Result<()> {
        let seq = self
            .store
            .append_notification(resource_key, status.as_str(), self.clock.now())
            .await?;
        debug!(resource_key, %status, seq, "notification appended");
        Ok(())
    }

    async fn prune(&self, retention: chrono::Duration) -> Result<u64> {
        let pruned = self
            .store
            .prune_notifications(self.clock.now() - retention)
            .await?;
        if pruned > 0 {
            debug!(pruned, "completion log pruned");
        }
        Ok(pruned)
    }

    async fn subscribe(&self, resource_key: &str) -> Result<Subscription> {
        let state = PollState {
            store: self.store.clone(),
            key: resource_key.to_string(),
            cursor: self.store.latest_notification_seq().await?,
            pending: VecDeque::new(),
            poll_interval: self.poll_interval,
        };

        let inner = stream::unfold(state, |mut state| async move {
            loop {
                if let Some(status) = state.pending.pop_front() {
                    return Some((status, state));
                }
                match state.store.notifications_since(&state.key, state.cursor).await {
                    Ok(entries) if !entries.is_empty() => {
                        for entry in entries {
                            state.cursor = state.cursor.max(entry.seq);
                            match CompletionStatus::parse(&entry.status) {
                                Ok(status) => state.pending.push_back(status),
                                Err(e) => warn!(resource_key = %state.key, seq = entry.seq, "{}", e),
                            }
                        }
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(resource_key = %state.key, "notification poll failed: {}", e),
                }
                tokio::time::sleep(state.poll_interval).await;
            }
        });

        Ok(Subscription::new(resource_key, inner.boxed()))
    }
}
