//! Crashed holders, deadlines and shutdown

mod common;

use std::time::Duration;

use std::sync::Arc;

use common::{memory_store, sqlite_store, t0, Harness, LockOutage};
use tokio_util::sync::CancellationToken;
use vecto_orchestration::{
    Clock, CompletionStatus, FailDisposition, NotificationBus, StoreNotificationBus, WorkOutcome,
    Worker,
};
use vecto_storage::{ArtifactStore, JobStatus, JobStore, LockStore, NotificationLog};

#[tokio::test]
async fn lock_frees_itself_after_ttl() {
    for store in [memory_store(), sqlite_store().await] {
        let h = Harness::new(store);
        let ttl = h.config.lock_ttl();

        let crashed = h.locks.try_acquire("driver-1", ttl).await.unwrap().unwrap();
        drop(crashed);

        h.clock.advance(ttl - chrono::Duration::seconds(1));
        assert!(h.locks.try_acquire("driver-1", ttl).await.unwrap().is_none());

        h.clock.advance(chrono::Duration::seconds(1));
        let lease = h.locks.try_acquire("driver-1", ttl).await.unwrap().unwrap();
        assert_eq!(lease.expires_at, h.clock.now() + ttl);

        let stored = h.store.get_lock("driver-1").await.unwrap().unwrap();
        assert_eq!(stored.owner_token, lease.owner_token);
    }
}

#[tokio::test]
async fn abandoned_job_is_finished_by_another_worker() {
    let mut config = common::test_config();
    config.queue.abandoned_after_secs = 100;
    let h = Harness::with_config(memory_store(), config);
    let trigger = h.trigger("driver-1");
    let enqueued = h.service.enqueue_if_fresh(&trigger).await.unwrap();

    // Worker claims, takes the lock, then dies
    let job = h.queue.claim("crashed").await.unwrap().unwrap();
    h.locks
        .try_acquire(&job.resource_key, h.config.lock_ttl())
        .await
        .unwrap()
        .unwrap();

    let survivor = h.worker("w2");
    assert!(survivor.process_next().await.unwrap().is_none());

    h.clock.advance(chrono::Duration::seconds(
        h.config.queue.abandoned_after_secs as i64 + 1,
    ));
    assert_eq!(h.queue.requeue_abandoned().await.unwrap(), 1);

    match survivor.process_next().await.unwrap().unwrap() {
        WorkOutcome::Produced { job_id, .. } => assert_eq!(job_id, enqueued.job_id),
        other => panic!("expected Produced, got {:?}", other),
    }
    let job = h.store.get_job(enqueued.job_id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 2);
    assert_eq!(job.worker_id.as_deref(), Some("w2"));
}

#[tokio::test]
async fn sweep_requeues_abandoned_jobs_and_prunes_the_log() {
    let h = Harness::new(memory_store());
    let bus = Arc::new(StoreNotificationBus::new(
        h.store.clone(),
        h.clock.clone(),
        Duration::from_millis(5),
    ));
    let worker = Worker::new(
        "w1",
        &h.config,
        h.queue.clone(),
        h.locks.clone(),
        h.orchestrator.clone(),
        bus.clone(),
    );

    let enqueued = h.service.enqueue_if_fresh(&h.trigger("driver-1")).await.unwrap();
    h.queue.claim("crashed").await.unwrap().unwrap();
    bus.publish("driver-0", CompletionStatus::Ready).await.unwrap();

    h.clock.advance(chrono::Duration::seconds(
        h.config.queue.notification_retention_secs as i64 + 1,
    ));
    bus.publish("driver-2", CompletionStatus::Failed).await.unwrap();
    worker.sweep().await;

    let job = h.store.get_job(enqueued.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert!(h.store.notifications_since("driver-0", 0).await.unwrap().is_empty());
    assert_eq!(h.store.notifications_since("driver-2", 0).await.unwrap().len(), 1);
    assert_eq!(h.store.latest_notification_seq().await.unwrap(), 2);
}

#[tokio::test]
async fn lock_store_error_requeues_the_job_with_backoff() {
    let store = LockOutage::new();
    let h = Harness::new(store.clone());
    let enqueued = h.service.enqueue_if_fresh(&h.trigger("driver-1")).await.unwrap();
    let worker = h.worker("w1");

    match worker.process_next().await.unwrap().unwrap() {
        WorkOutcome::Failed {
            code, disposition, ..
        } => {
            assert_eq!(code, "STORAGE");
            assert_eq!(
                disposition,
                FailDisposition::Retrying {
                    at: t0() + chrono::Duration::seconds(2)
                }
            );
        }
        other => panic!("expected Failed, got {:?}", other),
    }
    let job = h.store.get_job(enqueued.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.error_code.as_deref(), Some("STORAGE"));
    assert_eq!(h.providers.calls(), 0);

    store.restore();
    h.clock.advance(chrono::Duration::seconds(2));
    match worker.process_next().await.unwrap().unwrap() {
        WorkOutcome::Produced { job_id, .. } => assert_eq!(job_id, enqueued.job_id),
        other => panic!("expected Produced, got {:?}", other),
    }
    assert_eq!(h.store.get_job(enqueued.job_id).await.unwrap().unwrap().attempts, 2);
}

#[tokio::test]
async fn retry_past_the_input_lifetime_fails_permanently() {
    let h = Harness::new(memory_store());
    h.providers.fail_role("tactician");
    h.providers.fail_role("briefer");
    let trigger = h.trigger("driver-1");
    h.service.enqueue_if_fresh(&trigger).await.unwrap();
    let worker = h.worker("w1");

    match worker.process_next().await.unwrap().unwrap() {
        WorkOutcome::Failed { disposition, .. } => assert!(!disposition.is_terminal()),
        other => panic!("expected Failed, got {:?}", other),
    }
    let calls = h.providers.calls();

    // Providers recover, but the retry only becomes due after the input aged out
    h.providers.heal();
    h.clock.advance(chrono::Duration::seconds(126));
    match worker.process_next().await.unwrap().unwrap() {
        WorkOutcome::Failed {
            code, disposition, ..
        } => {
            assert_eq!(code, "STALE_INPUT");
            assert!(disposition.is_terminal());
        }
        other => panic!("expected Failed, got {:?}", other),
    }
    assert_eq!(h.providers.calls(), calls);
    assert!(h.store.get_artifact("driver-1").await.unwrap().is_none());
    assert!(h.store.get_lock("driver-1").await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn deadline_releases_lock_and_schedules_retry() {
    let h = Harness::new(memory_store());
    h.providers.delay(Duration::from_secs(120));
    let enqueued = h.service.enqueue_if_fresh(&h.trigger("driver-1")).await.unwrap();

    let started = tokio::time::Instant::now();
    let outcome = h.worker("w1").process_next().await.unwrap().unwrap();
    let elapsed = started.elapsed();

    match outcome {
        WorkOutcome::Failed {
            code, disposition, ..
        } => {
            assert_eq!(code, "TIMEOUT");
            assert_eq!(
                disposition,
                FailDisposition::Retrying {
                    at: t0() + chrono::Duration::seconds(2)
                }
            );
        }
        other => panic!("expected Failed, got {:?}", other),
    }
    assert!(elapsed >= Duration::from_secs(50));
    assert!(elapsed < Duration::from_secs(51));

    // Nothing half-written, lock free, job back in the queue
    assert!(h.store.get_artifact("driver-1").await.unwrap().is_none());
    assert!(h.store.get_lock("driver-1").await.unwrap().is_none());
    let job = h.store.get_job(enqueued.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.error_code.as_deref(), Some("TIMEOUT"));
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_in_flight_run() {
    let h = Harness::new(memory_store());
    h.providers.delay(Duration::from_secs(30));
    h.service.enqueue_if_fresh(&h.trigger("driver-1")).await.unwrap();

    let shutdown = CancellationToken::new();
    let worker = h.worker("w1").with_shutdown(shutdown.clone());

    let cancel = async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.cancel();
    };
    let (outcome, ()) = tokio::join!(worker.process_next(), cancel);

    match outcome.unwrap().unwrap() {
        WorkOutcome::Failed {
            code, disposition, ..
        } => {
            assert_eq!(code, "CANCELLED");
            assert!(!disposition.is_terminal());
        }
        other => panic!("expected Failed, got {:?}", other),
    }
    assert!(h.store.get_lock("driver-1").await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn run_loop_drains_queue_until_shutdown() {
    let h = Harness::new(memory_store());
    for i in 0..3 {
        h.service
            .enqueue_if_fresh(&h.trigger(&format!("driver-{}", i)))
            .await
            .unwrap();
    }

    let shutdown = CancellationToken::new();
    let worker = h.worker("w1").with_shutdown(shutdown.clone());
    let stop = async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        shutdown.cancel();
    };
    tokio::join!(worker.run(), stop);

    for i in 0..3 {
        let key = format!("driver-{}", i);
        assert!(h.store.get_artifact(&key).await.unwrap().is_some(), "{}", key);
    }
}
