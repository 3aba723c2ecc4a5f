//! Store contract, run against every adapter
//!
//! Timestamps are whole seconds so the SQLite adapter (millisecond precision)
//! round-trips them exactly.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use vecto_storage::{
    Artifact, ArtifactStatus, ArtifactStore, ErrorKind, GeoPoint, InMemoryStore, JobFailure,
    JobOutcome, JobStatus, JobStore, Lock, LockStore, NewJob, NotificationLog, PipelineStore,
    SqliteStore, UpsertOutcome,
};

fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_760_000_000, 0).unwrap()
}

fn new_job(key: &str) -> NewJob {
    NewJob::new(key, "strategy", json!({"resource_key": key}))
}

fn artifact(key: &str, now: DateTime<Utc>, summary: &str) -> Artifact {
    Artifact {
        resource_key: key.to_string(),
        content: json!({"summary": summary}),
        provider_chain_used: vec!["consolidator:openai".to_string()],
        origin: GeoPoint::new(32.7767, -96.7970),
        valid_window_start: now,
        valid_window_end: now + Duration::minutes(60),
        generated_at: now,
        status: ArtifactStatus::Active,
        generation: 1,
    }
}

async fn stores() -> Vec<(&'static str, Arc<dyn PipelineStore>)> {
    vec![
        ("memory", Arc::new(InMemoryStore::new())),
        ("sqlite", Arc::new(SqliteStore::in_memory().await.unwrap())),
    ]
}

#[tokio::test]
async fn enqueue_collapses_duplicate_triggers() {
    for (name, store) in stores().await {
        let first = store.enqueue_job(new_job("driver-1"), t0()).await.unwrap();
        let second = store.enqueue_job(new_job("driver-1"), t0()).await.unwrap();
        assert!(first.created, "{name}");
        assert!(!second.created, "{name}");
        assert_eq!(first.job_id, second.job_id, "{name}");

        // Still collapses while running
        let job = store.claim_job("w1", t0()).await.unwrap().unwrap();
        let third = store.enqueue_job(new_job("driver-1"), t0()).await.unwrap();
        assert_eq!(third.job_id, job.id, "{name}");

        // A finished job frees the resource for a new one
        store.complete_job(job.id, JobOutcome::Produced, t0()).await.unwrap();
        let fourth = store.enqueue_job(new_job("driver-1"), t0()).await.unwrap();
        assert!(fourth.created, "{name}");
        assert_ne!(fourth.job_id, job.id, "{name}");
    }
}

#[tokio::test]
async fn claim_is_fifo_and_round_trips_the_job() {
    for (name, store) in stores().await {
        store.enqueue_job(new_job("a"), t0()).await.unwrap();
        store
            .enqueue_job(new_job("b"), t0() + Duration::seconds(1))
            .await
            .unwrap();

        let now = t0() + Duration::seconds(2);
        let first = store.claim_job("w1", now).await.unwrap().unwrap();
        let second = store.claim_job("w2", now).await.unwrap().unwrap();
        assert!(store.claim_job("w3", now).await.unwrap().is_none(), "{name}");

        assert_eq!(first.resource_key, "a", "{name}");
        assert_eq!(second.resource_key, "b", "{name}");
        assert_eq!(first.status, JobStatus::Running, "{name}");
        assert_eq!(first.attempts, 1, "{name}");
        assert_eq!(first.worker_id.as_deref(), Some("w1"), "{name}");
        assert_eq!(first.payload, json!({"resource_key": "a"}), "{name}");
        assert_eq!(first.created_at, t0(), "{name}");
        assert_eq!(first.updated_at, now, "{name}");
    }
}

#[tokio::test]
async fn concurrent_claims_hand_out_each_job_once() {
    for (name, store) in stores().await {
        const JOBS: usize = 40;
        for i in 0..JOBS {
            store
                .enqueue_job(new_job(&format!("driver-{i}")), t0())
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for w in 0..4 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let worker = format!("w{w}");
                let mut claimed = Vec::new();
                while let Some(job) = store.claim_job(&worker, t0()).await.unwrap() {
                    claimed.push(job.id);
                    tokio::task::yield_now().await;
                }
                claimed
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "{name}: job {id} claimed twice");
            }
        }
        assert_eq!(seen.len(), JOBS, "{name}");
    }
}

#[tokio::test]
async fn fail_with_retry_requeues_after_run_after() {
    for (name, store) in stores().await {
        store.enqueue_job(new_job("driver-1"), t0()).await.unwrap();
        let job = store.claim_job("w1", t0()).await.unwrap().unwrap();

        let retry_at = t0() + Duration::seconds(4);
        let failure = JobFailure {
            error_code: "QUORUM_NOT_MET".to_string(),
            error_message: "1 of 3 roles succeeded".to_string(),
            retry_at: Some(retry_at),
        };
        store.fail_job(job.id, &failure, t0()).await.unwrap();

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued, "{name}");
        assert_eq!(stored.run_after, retry_at, "{name}");
        assert_eq!(stored.error_code.as_deref(), Some("QUORUM_NOT_MET"), "{name}");

        assert!(store.claim_job("w1", t0()).await.unwrap().is_none(), "{name}");
        let again = store.claim_job("w2", retry_at).await.unwrap().unwrap();
        assert_eq!(again.id, job.id, "{name}");
        assert_eq!(again.attempts, 2, "{name}");
    }
}

#[tokio::test]
async fn terminal_failure_and_transition_errors() {
    for (name, store) in stores().await {
        let enqueued = store.enqueue_job(new_job("driver-1"), t0()).await.unwrap();

        let err = store
            .complete_job(enqueued.job_id, JobOutcome::Produced, t0())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidTransition, "{name}");

        let missing = store
            .complete_job(uuid::Uuid::new_v4(), JobOutcome::Produced, t0())
            .await
            .unwrap_err();
        assert_eq!(missing.kind, ErrorKind::NotFound, "{name}");

        let job = store.claim_job("w1", t0()).await.unwrap().unwrap();
        let failure = JobFailure {
            error_code: "SCHEMA_MISMATCH".to_string(),
            error_message: "payload missing coordinates".to_string(),
            retry_at: None,
        };
        store.fail_job(job.id, &failure, t0()).await.unwrap();

        let latest = store.latest_job("driver-1").await.unwrap().unwrap();
        assert_eq!(latest.status, JobStatus::Error, "{name}");
        assert_eq!(latest.error_message.as_deref(), Some("payload missing coordinates"), "{name}");
    }
}

#[tokio::test]
async fn requeue_abandoned_only_touches_stale_running_jobs() {
    for (name, store) in stores().await {
        store.enqueue_job(new_job("stale"), t0()).await.unwrap();
        let stale = store.claim_job("crashed", t0()).await.unwrap().unwrap();

        let later = t0() + Duration::seconds(400);
        store.enqueue_job(new_job("fresh"), later).await.unwrap();
        store.claim_job("alive", later).await.unwrap().unwrap();

        let requeued = store
            .requeue_abandoned(later - Duration::seconds(300), later)
            .await
            .unwrap();
        assert_eq!(requeued, 1, "{name}");

        let job = store.get_job(stale.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued, "{name}");
        assert!(job.worker_id.is_none(), "{name}");
    }
}

#[tokio::test]
async fn lock_ttl_and_owner_checks() {
    for (name, store) in stores().await {
        let ttl = Duration::seconds(90);
        let a = Lock::new("driver-1", "token-a", t0() + ttl);
        assert!(store.try_acquire_lock(&a, t0()).await.unwrap(), "{name}");

        let mid = t0() + Duration::seconds(30);
        let b = Lock::new("driver-1", "token-b", mid + ttl);
        assert!(!store.try_acquire_lock(&b, mid).await.unwrap(), "{name}");

        // Wrong owner cannot release
        assert!(!store.release_lock("driver-1", "token-b").await.unwrap(), "{name}");

        // Expired without any release
        let after = t0() + ttl;
        let c = Lock::new("driver-1", "token-c", after + ttl);
        assert!(store.try_acquire_lock(&c, after).await.unwrap(), "{name}");

        // The original holder must not free the reacquired lock
        assert!(!store.release_lock("driver-1", "token-a").await.unwrap(), "{name}");
        let held = store.get_lock("driver-1").await.unwrap().unwrap();
        assert_eq!(held.owner_token, "token-c", "{name}");

        assert!(store.release_lock("driver-1", "token-c").await.unwrap(), "{name}");
        assert!(store.get_lock("driver-1").await.unwrap().is_none(), "{name}");
    }
}

#[tokio::test]
async fn artifact_upsert_conflict_supersede_and_replace() {
    for (name, store) in stores().await {
        let first = artifact("driver-1", t0(), "first");
        assert_eq!(
            store.upsert_artifact(&first, t0()).await.unwrap(),
            UpsertOutcome::Inserted,
            "{name}"
        );

        // Racing writer loses while the row is live
        let racer = artifact("driver-1", t0(), "racer");
        assert_eq!(
            store.upsert_artifact(&racer, t0()).await.unwrap(),
            UpsertOutcome::Conflict,
            "{name}"
        );
        let stored = store.get_artifact("driver-1").await.unwrap().unwrap();
        assert_eq!(stored.content, json!({"summary": "first"}), "{name}");

        assert!(store.supersede_artifact("driver-1").await.unwrap(), "{name}");
        assert!(!store.supersede_artifact("driver-1").await.unwrap(), "{name}");

        let next = artifact("driver-1", t0(), "second");
        assert_eq!(
            store.upsert_artifact(&next, t0()).await.unwrap(),
            UpsertOutcome::Replaced { generation: 2 },
            "{name}"
        );
        let stored = store.get_artifact("driver-1").await.unwrap().unwrap();
        assert_eq!(stored.generation, 2, "{name}");
        assert_eq!(stored.status, ArtifactStatus::Active, "{name}");
        assert_eq!(stored.provider_chain_used, vec!["consolidator:openai"], "{name}");
        assert_eq!(stored.valid_window_end, t0() + Duration::minutes(60), "{name}");

        // An expired row is replaceable without an explicit supersede
        let expired_at = t0() + Duration::minutes(60);
        let third = artifact("driver-1", expired_at, "third");
        assert_eq!(
            store.upsert_artifact(&third, expired_at).await.unwrap(),
            UpsertOutcome::Replaced { generation: 3 },
            "{name}"
        );
    }
}

#[tokio::test]
async fn racing_artifact_writers_leave_one_row() {
    for (name, store) in stores().await {
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let a = artifact("driver-1", t0(), &format!("writer-{i}"));
                store.upsert_artifact(&a, t0()).await.unwrap()
            }));
        }

        let mut written = 0;
        for handle in handles {
            if handle.await.unwrap().is_written() {
                written += 1;
            }
        }
        assert_eq!(written, 1, "{name}");
        assert!(store.get_artifact("driver-1").await.unwrap().is_some(), "{name}");
    }
}

#[tokio::test]
async fn notification_log_is_ordered_per_resource() {
    for (name, store) in stores().await {
        assert_eq!(store.latest_notification_seq().await.unwrap(), 0, "{name}");

        let s1 = store.append_notification("a", "ready", t0()).await.unwrap();
        store.append_notification("b", "ready", t0()).await.unwrap();
        let s3 = store.append_notification("a", "failed", t0()).await.unwrap();
        assert!(s1 < s3, "{name}");

        let for_a = store.notifications_since("a", 0).await.unwrap();
        let statuses: Vec<_> = for_a.iter().map(|n| n.status.as_str()).collect();
        assert_eq!(statuses, vec!["ready", "failed"], "{name}");

        let tail = store.notifications_since("a", s1).await.unwrap();
        assert_eq!(tail.len(), 1, "{name}");
        assert_eq!(tail[0].seq, s3, "{name}");
        assert_eq!(store.latest_notification_seq().await.unwrap(), s3, "{name}");
    }
}

#[tokio::test]
async fn pruning_drops_old_entries_without_reusing_seq() {
    for (name, store) in stores().await {
        let old = store.append_notification("a", "ready", t0()).await.unwrap();
        let later = t0() + Duration::hours(2);
        let kept = store.append_notification("b", "ready", later).await.unwrap();

        let cutoff = t0() + Duration::hours(1);
        assert_eq!(store.prune_notifications(cutoff).await.unwrap(), 1, "{name}");
        assert!(store.notifications_since("a", 0).await.unwrap().is_empty(), "{name}");
        assert_eq!(store.notifications_since("b", 0).await.unwrap()[0].seq, kept, "{name}");

        // Entries published exactly at the cutoff stay
        assert_eq!(store.prune_notifications(later).await.unwrap(), 0, "{name}");

        // Emptying the log keeps the high-water mark
        let emptied = store
            .prune_notifications(later + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(emptied, 1, "{name}");
        assert_eq!(store.latest_notification_seq().await.unwrap(), kept, "{name}");
        let next = store.append_notification("a", "failed", later).await.unwrap();
        assert!(next > kept && kept > old, "{name}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_pool_handles_share_one_database_safely() {
    const JOBS: usize = 200;
    const TASKS: usize = 16;

    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("pipeline.db").display());
    let handles: Vec<Arc<dyn PipelineStore>> = vec![
        Arc::new(SqliteStore::connect(&url).await.unwrap()),
        Arc::new(SqliteStore::connect(&url).await.unwrap()),
    ];
    for i in 0..JOBS {
        handles[i % 2]
            .enqueue_job(new_job(&format!("driver-{i}")), t0())
            .await
            .unwrap();
    }

    let mut tasks = Vec::new();
    for t in 0..TASKS {
        let store = Arc::clone(&handles[t % 2]);
        tasks.push(tokio::spawn(async move {
            let worker = format!("w{t}");
            let mut claimed = Vec::new();
            while let Some(job) = store.claim_job(&worker, t0()).await.unwrap() {
                claimed.push(job.id);
            }

            let lock = Lock::new("hot-key", format!("token-{t}"), t0() + Duration::seconds(90));
            let locked = store.try_acquire_lock(&lock, t0()).await.unwrap();

            let written = store
                .upsert_artifact(&artifact("hot-key", t0(), &worker), t0())
                .await
                .unwrap()
                .is_written();
            (claimed, locked, written)
        }));
    }

    let mut seen = HashSet::new();
    let (mut lock_wins, mut writes) = (0, 0);
    for task in tasks {
        let (claimed, locked, written) = task.await.unwrap();
        for id in claimed {
            assert!(seen.insert(id), "job {id} claimed twice");
        }
        lock_wins += usize::from(locked);
        writes += usize::from(written);
    }
    assert_eq!(seen.len(), JOBS);
    assert_eq!(lock_wins, 1);
    assert_eq!(writes, 1);
}

#[tokio::test]
async fn sqlite_file_store_persists_across_connections() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("pipeline.db").display());

    let job_id = {
        let store = SqliteStore::connect(&url).await.unwrap();
        store.enqueue_job(new_job("driver-1"), t0()).await.unwrap().job_id
    };

    let reopened = SqliteStore::connect(&url).await.unwrap();
    let job = reopened.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.resource_key, "driver-1");
}
