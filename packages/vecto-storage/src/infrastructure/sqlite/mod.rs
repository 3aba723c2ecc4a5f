//! SQLite adapter for the pipeline store
//!
//! Every mutation is a single statement, so SQLite's write lock makes each one
//! atomic without explicit transactions:
//!
//! - claim: `UPDATE ... WHERE id = (SELECT ... LIMIT 1) RETURNING ...`
//! - lock acquire: `INSERT ... ON CONFLICT DO UPDATE ... WHERE locks.expires_at <= now`.
//!   The `WHERE` of an upsert sees the row as it was before the write, which is
//!   exactly the expiry the decision must be based on.
//! - artifact upsert: `INSERT ... ON CONFLICT DO UPDATE ... WHERE replaceable RETURNING`

mod schema;

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use crate::domain::{
    Artifact, ArtifactStatus, ArtifactStore, EnqueueResult, GeoPoint, Job, JobFailure, JobOutcome,
    JobStatus, JobStore, Lock, LockStore, NewJob, Notification, NotificationLog, UpsertOutcome,
};
use crate::error::{Result, StorageError};

pub use schema::MIGRATIONS;

const JOB_COLUMNS: &str = "id, resource_key, kind, status, outcome, error_code, error_message, \
     attempts, payload, worker_id, run_after, created_at, updated_at";

/// Enqueue retries when the active job finishes between the insert and the lookup
const ENQUEUE_RACE_RETRIES: usize = 3;

fn millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StorageError::serialization(format!("Timestamp out of range: {}", ms)))
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| StorageError::serialization(format!("Invalid job id {}: {}", s, e)))
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let outcome: Option<String> = row.try_get("outcome")?;
    let attempts: i64 = row.try_get("attempts")?;
    let payload: String = row.try_get("payload")?;

    Ok(Job {
        id: parse_uuid(&id)?,
        resource_key: row.try_get("resource_key")?,
        kind: row.try_get("kind")?,
        status: JobStatus::parse(&status)?,
        outcome: outcome.as_deref().map(JobOutcome::parse).transpose()?,
        error_code: row.try_get("error_code")?,
        error_message: row.try_get("error_message")?,
        attempts: u32::try_from(attempts)
            .map_err(|_| StorageError::serialization(format!("Invalid attempts: {}", attempts)))?,
        payload: serde_json::from_str(&payload)?,
        worker_id: row.try_get("worker_id")?,
        run_after: from_millis(row.try_get("run_after")?)?,
        created_at: from_millis(row.try_get("created_at")?)?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
    })
}

fn artifact_from_row(row: &SqliteRow) -> Result<Artifact> {
    let content: String = row.try_get("content")?;
    let chain: String = row.try_get("provider_chain_used")?;
    let status: String = row.try_get("status")?;
    let generation: i64 = row.try_get("generation")?;

    Ok(Artifact {
        resource_key: row.try_get("resource_key")?,
        content: serde_json::from_str(&content)?,
        provider_chain_used: serde_json::from_str(&chain)?,
        origin: GeoPoint::new(row.try_get("origin_lat")?, row.try_get("origin_lng")?),
        valid_window_start: from_millis(row.try_get("valid_window_start")?)?,
        valid_window_end: from_millis(row.try_get("valid_window_end")?)?,
        generated_at: from_millis(row.try_get("generated_at")?)?,
        status: ArtifactStatus::parse(&status)?,
        generation: u32::try_from(generation).map_err(|_| {
            StorageError::serialization(format!("Invalid generation: {}", generation))
        })?,
    })
}

/// SQLite-backed store
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) a database file and run migrations
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// Private in-memory database
    ///
    /// One connection only: every new connection to `sqlite::memory:` opens a
    /// fresh, empty database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("sqlite schema ready ({} statements)", MIGRATIONS.len());
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn active_job_id(&self, resource_key: &str) -> Result<Option<Uuid>> {
        let row = sqlx::query(
            "SELECT id FROM jobs WHERE resource_key = ? AND status IN ('queued', 'running')",
        )
        .bind(resource_key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let id: String = row.try_get("id")?;
                Ok(Some(parse_uuid(&id)?))
            }
            None => Ok(None),
        }
    }

    /// Explain why a guarded `UPDATE` on a job matched no row
    async fn transition_error(&self, job_id: Uuid, to: &str) -> StorageError {
        match self.get_job(job_id).await {
            Ok(Some(job)) => {
                StorageError::invalid_transition(format!("job {}: {} -> {}", job_id, job.status, to))
            }
            Ok(None) => StorageError::job_not_found(job_id),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn enqueue_job(&self, job: NewJob, now: DateTime<Utc>) -> Result<EnqueueResult> {
        let payload = serde_json::to_string(&job.payload)?;

        for _ in 0..ENQUEUE_RACE_RETRIES {
            let job_id = Uuid::new_v4();
            let inserted = sqlx::query(
                r#"
INSERT INTO jobs (id, resource_key, kind, status, attempts, payload, run_after, created_at, updated_at)
VALUES (?, ?, ?, 'queued', 0, ?, ?, ?, ?)
ON CONFLICT DO NOTHING
"#,
            )
            .bind(job_id.to_string())
            .bind(&job.resource_key)
            .bind(&job.kind)
            .bind(&payload)
            .bind(millis(now))
            .bind(millis(now))
            .bind(millis(now))
            .execute(&self.pool)
            .await?
            .rows_affected();

            if inserted == 1 {
                return Ok(EnqueueResult {
                    job_id,
                    created: true,
                });
            }

            if let Some(active) = self.active_job_id(&job.resource_key).await? {
                return Ok(EnqueueResult {
                    job_id: active,
                    created: false,
                });
            }
        }

        Err(StorageError::database(format!(
            "enqueue for {} kept racing with job completion",
            job.resource_key
        )))
    }

    async fn claim_job(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
        let sql = format!(
            r#"
UPDATE jobs
SET status = 'running', attempts = attempts + 1, worker_id = ?, updated_at = ?
WHERE id = (
    SELECT id FROM jobs
    WHERE status = 'queued' AND run_after <= ?
    ORDER BY run_after, created_at
    LIMIT 1
)
AND status = 'queued'
RETURNING {}
"#,
            JOB_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(worker_id)
            .bind(millis(now))
            .bind(millis(now))
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        outcome: JobOutcome,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let updated = sqlx::query(
            r#"
UPDATE jobs
SET status = 'ok', outcome = ?, error_code = NULL, error_message = NULL, updated_at = ?
WHERE id = ? AND status = 'running'
"#,
        )
        .bind(outcome.as_str())
        .bind(millis(now))
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(self.transition_error(job_id, "ok").await);
        }
        Ok(())
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let query = match failure.retry_at {
            Some(retry_at) => sqlx::query(
                r#"
UPDATE jobs
SET status = 'queued', error_code = ?, error_message = ?, worker_id = NULL,
    run_after = ?, updated_at = ?
WHERE id = ? AND status = 'running'
"#,
            )
            .bind(&failure.error_code)
            .bind(&failure.error_message)
            .bind(millis(retry_at)),
            None => sqlx::query(
                r#"
UPDATE jobs
SET status = 'error', error_code = ?, error_message = ?, updated_at = ?
WHERE id = ? AND status = 'running'
"#,
            )
            .bind(&failure.error_code)
            .bind(&failure.error_message),
        };

        let updated = query
            .bind(millis(now))
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();

        if updated == 0 {
            let to = if failure.retry_at.is_some() { "queued" } else { "error" };
            return Err(self.transition_error(job_id, to).await);
        }
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        let sql = format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn latest_job(&self, resource_key: &str) -> Result<Option<Job>> {
        let sql = format!(
            "SELECT {} FROM jobs WHERE resource_key = ? ORDER BY created_at DESC, rowid DESC LIMIT 1",
            JOB_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(resource_key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn requeue_abandoned(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let requeued = sqlx::query(
            r#"
UPDATE jobs
SET status = 'queued', worker_id = NULL, run_after = ?, updated_at = ?
WHERE status = 'running' AND updated_at < ?
"#,
        )
        .bind(millis(now))
        .bind(millis(now))
        .bind(millis(stale_before))
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(requeued)
    }
}

#[async_trait]
impl LockStore for SqliteStore {
    async fn try_acquire_lock(&self, lock: &Lock, now: DateTime<Utc>) -> Result<bool> {
        let changed = sqlx::query(
            r#"
INSERT INTO locks (lock_key, owner_token, expires_at)
VALUES (?, ?, ?)
ON CONFLICT (lock_key) DO UPDATE
SET owner_token = excluded.owner_token, expires_at = excluded.expires_at
WHERE locks.expires_at <= ?
"#,
        )
        .bind(&lock.lock_key)
        .bind(&lock.owner_token)
        .bind(millis(lock.expires_at))
        .bind(millis(now))
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(changed == 1)
    }

    async fn release_lock(&self, lock_key: &str, owner_token: &str) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM locks WHERE lock_key = ? AND owner_token = ?")
            .bind(lock_key)
            .bind(owner_token)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted == 1)
    }

    async fn get_lock(&self, lock_key: &str) -> Result<Option<Lock>> {
        let row = sqlx::query("SELECT lock_key, owner_token, expires_at FROM locks WHERE lock_key = ?")
            .bind(lock_key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(Lock {
                lock_key: row.try_get("lock_key")?,
                owner_token: row.try_get("owner_token")?,
                expires_at: from_millis(row.try_get("expires_at")?)?,
            })),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ArtifactStore for SqliteStore {
    async fn upsert_artifact(
        &self,
        artifact: &Artifact,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let row = sqlx::query(
            r#"
INSERT INTO artifacts (
    resource_key, content, provider_chain_used, origin_lat, origin_lng,
    valid_window_start, valid_window_end, generated_at, status, generation
)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1)
ON CONFLICT (resource_key) DO UPDATE SET
    content = excluded.content,
    provider_chain_used = excluded.provider_chain_used,
    origin_lat = excluded.origin_lat,
    origin_lng = excluded.origin_lng,
    valid_window_start = excluded.valid_window_start,
    valid_window_end = excluded.valid_window_end,
    generated_at = excluded.generated_at,
    status = excluded.status,
    generation = artifacts.generation + 1
WHERE artifacts.status = 'superseded' OR artifacts.valid_window_end <= ?
RETURNING generation
"#,
        )
        .bind(&artifact.resource_key)
        .bind(serde_json::to_string(&artifact.content)?)
        .bind(serde_json::to_string(&artifact.provider_chain_used)?)
        .bind(artifact.origin.lat)
        .bind(artifact.origin.lng)
        .bind(millis(artifact.valid_window_start))
        .bind(millis(artifact.valid_window_end))
        .bind(millis(artifact.generated_at))
        .bind(artifact.status.as_str())
        .bind(millis(now))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(UpsertOutcome::Conflict);
        };
        let generation: i64 = row.try_get("generation")?;
        if generation <= 1 {
            Ok(UpsertOutcome::Inserted)
        } else {
            Ok(UpsertOutcome::Replaced {
                generation: u32::try_from(generation).map_err(|_| {
                    StorageError::serialization(format!("Invalid generation: {}", generation))
                })?,
            })
        }
    }

    async fn get_artifact(&self, resource_key: &str) -> Result<Option<Artifact>> {
        let row = sqlx::query(
            r#"
SELECT resource_key, content, provider_chain_used, origin_lat, origin_lng,
       valid_window_start, valid_window_end, generated_at, status, generation
FROM artifacts WHERE resource_key = ?
"#,
        )
        .bind(resource_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(artifact_from_row).transpose()
    }

    async fn supersede_artifact(&self, resource_key: &str) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE artifacts SET status = 'superseded' WHERE resource_key = ? AND status = 'active'",
        )
        .bind(resource_key)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated == 1)
    }
}

#[async_trait]
impl NotificationLog for SqliteStore {
    async fn append_notification(
        &self,
        resource_key: &str,
        status: &str,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO notifications (resource_key, status, published_at) VALUES (?, ?, ?) RETURNING seq",
        )
        .bind(resource_key)
        .bind(status)
        .bind(millis(now))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("seq")?)
    }

    async fn notifications_since(
        &self,
        resource_key: &str,
        after_seq: i64,
    ) -> Result<Vec<Notification>> {
        let rows = sqlx::query(
            r#"
SELECT seq, resource_key, status, published_at FROM notifications
WHERE resource_key = ? AND seq > ?
ORDER BY seq
"#,
        )
        .bind(resource_key)
        .bind(after_seq)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(Notification {
                    seq: row.try_get("seq")?,
                    resource_key: row.try_get("resource_key")?,
                    status: row.try_get("status")?,
                    published_at: from_millis(row.try_get("published_at")?)?,
                })
            })
            .collect()
    }

    async fn latest_notification_seq(&self) -> Result<i64> {
        // AUTOINCREMENT keeps the high-water mark even after every row is pruned
        let row = sqlx::query(
            "SELECT COALESCE((SELECT seq FROM sqlite_sequence WHERE name = 'notifications'), 0) AS seq",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("seq")?)
    }

    async fn prune_notifications(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM notifications WHERE published_at < ?")
            .bind(millis(before))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
