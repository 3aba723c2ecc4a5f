//! In-memory adapter
//!
//! Single-process stand-in for the SQL store. Each operation takes the one
//! mutex for its whole duration, which gives the same single-row atomicity
//! the SQL adapter gets from conditional statements.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::domain::{
    Artifact, ArtifactStatus, ArtifactStore, EnqueueResult, Job, JobFailure, JobOutcome,
    JobStateMachine, JobStatus, JobStore, Lock, LockStore, NewJob, Notification, NotificationLog,
    UpsertOutcome,
};
use crate::error::{Result, StorageError};

#[derive(Default)]
struct State {
    /// Insertion order doubles as FIFO claim order
    jobs: Vec<Job>,
    locks: HashMap<String, Lock>,
    artifacts: HashMap<String, Artifact>,
    notifications: Vec<Notification>,
    last_seq: i64,
}

impl State {
    fn job_mut(&mut self, job_id: Uuid) -> Result<&mut Job> {
        self.jobs
            .iter_mut()
            .find(|job| job.id == job_id)
            .ok_or_else(|| StorageError::job_not_found(job_id))
    }

    /// Apply a state-machine transition to the stored job
    fn transition<F>(&mut self, job_id: Uuid, apply: F) -> Result<()>
    where
        F: FnOnce(&mut JobStateMachine) -> Result<()>,
    {
        let slot = self.job_mut(job_id)?;
        let mut sm = JobStateMachine::new(slot.clone());
        apply(&mut sm)?;
        *slot = sm.into_job();
        Ok(())
    }
}

/// In-memory store for tests and single-node development
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every job, oldest first
    pub fn jobs(&self) -> Vec<Job> {
        self.state.lock().jobs.clone()
    }

    pub fn artifact_count(&self) -> usize {
        self.state.lock().artifacts.len()
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn enqueue_job(&self, job: NewJob, now: DateTime<Utc>) -> Result<EnqueueResult> {
        let mut state = self.state.lock();

        if let Some(active) = state
            .jobs
            .iter()
            .find(|j| j.resource_key == job.resource_key && j.status.is_active())
        {
            return Ok(EnqueueResult {
                job_id: active.id,
                created: false,
            });
        }

        let job = Job::queued(job, now);
        let job_id = job.id;
        state.jobs.push(job);
        Ok(EnqueueResult {
            job_id,
            created: true,
        })
    }

    async fn claim_job(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
        let mut state = self.state.lock();

        let Some(slot) = state
            .jobs
            .iter_mut()
            .filter(|j| j.status == JobStatus::Queued && j.run_after <= now)
            .min_by_key(|j| (j.run_after, j.created_at))
        else {
            return Ok(None);
        };

        let mut sm = JobStateMachine::new(slot.clone());
        sm.claim(worker_id, now)?;
        *slot = sm.into_job();
        Ok(Some(slot.clone()))
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        outcome: JobOutcome,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.state
            .lock()
            .transition(job_id, |sm| sm.complete(outcome, now))
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.state
            .lock()
            .transition(job_id, |sm| sm.fail(failure, now))
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self
            .state
            .lock()
            .jobs
            .iter()
            .find(|j| j.id == job_id)
            .cloned())
    }

    async fn latest_job(&self, resource_key: &str) -> Result<Option<Job>> {
        Ok(self
            .state
            .lock()
            .jobs
            .iter()
            .rev()
            .find(|j| j.resource_key == resource_key)
            .cloned())
    }

    async fn requeue_abandoned(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut state = self.state.lock();
        let mut requeued = 0;
        for slot in state
            .jobs
            .iter_mut()
            .filter(|j| j.status == JobStatus::Running && j.updated_at < stale_before)
        {
            let mut sm = JobStateMachine::new(slot.clone());
            sm.requeue(now)?;
            *slot = sm.into_job();
            requeued += 1;
        }
        Ok(requeued)
    }
}

#[async_trait]
impl LockStore for InMemoryStore {
    async fn try_acquire_lock(&self, lock: &Lock, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.lock();

        // Decide on the stored expiry before writing anything
        let previous_expiry = state.locks.get(&lock.lock_key).map(|l| l.expires_at);
        match previous_expiry {
            Some(expires_at) if expires_at > now => Ok(false),
            _ => {
                state.locks.insert(lock.lock_key.clone(), lock.clone());
                Ok(true)
            }
        }
    }

    async fn release_lock(&self, lock_key: &str, owner_token: &str) -> Result<bool> {
        let mut state = self.state.lock();
        let owned = state
            .locks
            .get(lock_key)
            .is_some_and(|lock| lock.owner_token == owner_token);
        if owned {
            state.locks.remove(lock_key);
        }
        Ok(owned)
    }

    async fn get_lock(&self, lock_key: &str) -> Result<Option<Lock>> {
        Ok(self.state.lock().locks.get(lock_key).cloned())
    }
}

#[async_trait]
impl ArtifactStore for InMemoryStore {
    async fn upsert_artifact(
        &self,
        artifact: &Artifact,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let mut state = self.state.lock();

        let existing = state
            .artifacts
            .get(&artifact.resource_key)
            .map(|row| (row.is_replaceable(now), row.generation));

        let (outcome, generation) = match existing {
            None => (UpsertOutcome::Inserted, 1),
            Some((true, previous)) => {
                let generation = previous + 1;
                (UpsertOutcome::Replaced { generation }, generation)
            }
            Some((false, _)) => return Ok(UpsertOutcome::Conflict),
        };

        let mut row = artifact.clone();
        row.generation = generation;
        state.artifacts.insert(row.resource_key.clone(), row);
        Ok(outcome)
    }

    async fn get_artifact(&self, resource_key: &str) -> Result<Option<Artifact>> {
        Ok(self.state.lock().artifacts.get(resource_key).cloned())
    }

    async fn supersede_artifact(&self, resource_key: &str) -> Result<bool> {
        let mut state = self.state.lock();
        match state.artifacts.get_mut(resource_key) {
            Some(artifact) if artifact.status == ArtifactStatus::Active => {
                artifact.status = ArtifactStatus::Superseded;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl NotificationLog for InMemoryStore {
    async fn append_notification(
        &self,
        resource_key: &str,
        status: &str,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let mut state = self.state.lock();
        state.last_seq += 1;
        let seq = state.last_seq;
        state.notifications.push(Notification {
            seq,
            resource_key: resource_key.to_string(),
            status: status.to_string(),
            published_at: now,
        });
        Ok(seq)
    }

    async fn notifications_since(
        &self,
        resource_key: &str,
        after_seq: i64,
    ) -> Result<Vec<Notification>> {
        Ok(self
            .state
            .lock()
            .notifications
            .iter()
            .filter(|n| n.seq > after_seq && n.resource_key == resource_key)
            .cloned()
            .collect())
    }

    async fn latest_notification_seq(&self) -> Result<i64> {
        Ok(self.state.lock().last_seq)
    }

    async fn prune_notifications(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock();
        let total = state.notifications.len();
        state.notifications.retain(|n| n.published_at >= before);
        Ok((total - state.notifications.len()) as u64)
    }
}
