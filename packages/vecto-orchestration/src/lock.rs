//! TTL lock manager
//!
//! A lease is a row `{lock_key, owner_token, expires_at}`. Acquisition is a
//! single conditional upsert decided on the expiry stored *before* the write,
//! so a held lock is never mistaken for a free one, and a crashed holder's
//! lock frees itself once `expires_at` passes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;
use vecto_storage::{Lock, PipelineStore};

use crate::clock::Clock;
use crate::error::Result;

/// Proof of ownership returned by a successful acquire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub lock_key: String,
    pub owner_token: String,
    pub expires_at: DateTime<Utc>,
}

pub struct LockManager {
    store: Arc<dyn PipelineStore>,
    clock: Arc<dyn Clock>,
}

impl LockManager {
    pub fn new(store: Arc<dyn PipelineStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// `None` while another owner's lease is unexpired
    pub async fn try_acquire(
        &self,
        lock_key: &str,
        ttl: chrono::Duration,
    ) -> Result<Option<LockLease>> {
        let now = self.clock.now();
        let lock = Lock::new(lock_key, Uuid::new_v4().to_string(), now + ttl);

        if self.store.try_acquire_lock(&lock, now).await? {
            debug!(lock_key, expires_at = %lock.expires_at, "lock acquired");
            Ok(Some(LockLease {
                lock_key: lock.lock_key,
                owner_token: lock.owner_token,
                expires_at: lock.expires_at,
            }))
        } else {
            debug!(lock_key, "lock held elsewhere");
            Ok(None)
        }
    }

    /// No-op unless `owner_token` still owns the row
    pub async fn release(&self, lock_key: &str, owner_token: &str) -> Result<bool> {
        let released = self.store.release_lock(lock_key, owner_token).await?;
        if !released {
            warn!(lock_key, "lock release skipped: lease expired and was taken over");
        }
        Ok(released)
    }

    pub async fn release_lease(&self, lease: &LockLease) -> Result<bool> {
        self.release(&lease.lock_key, &lease.owner_token).await
    }
}
