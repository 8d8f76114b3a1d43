//! In-process row store.
//!
//! [`MemoryJobStore`] keeps jobs in a map and publishes every written
//! snapshot on a broadcast change log, which is what
//! `genq_events::MemoryChangeFeed` subscribes to. It also stands in for the
//! external worker in tests and demos via
//! [`apply_worker_update`](MemoryJobStore::apply_worker_update).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use genq_core::job::{Job, JobPatch, JobStatus, NewJobRecord};
use genq_core::types::{JobId, OwnerId};
use tokio::sync::{broadcast, RwLock};

use crate::store::{JobRowStore, StoreError, UpdateOutcome};

/// Buffer capacity for the change log.
const CHANGE_LOG_CAPACITY: usize = 256;

pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    next_id: AtomicU64,
    changes: broadcast::Sender<Job>,
    /// Number of upcoming reads that fail with `Unavailable`.
    failing_reads: AtomicU32,
    unavailable: AtomicBool,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_LOG_CAPACITY);
        Self {
            jobs: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            changes,
            failing_reads: AtomicU32::new(0),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Receive every snapshot written after this call.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<Job> {
        self.changes.subscribe()
    }

    /// Number of stored rows.
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Make the next `n` calls to `get_by_id` fail.
    pub fn fail_next_reads(&self, n: u32) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    /// Make every operation fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Write a worker-side update, enforcing the lifecycle graph.
    ///
    /// Entering `processing` stamps `started_at` and counts an attempt.
    /// Entering a terminal status stamps `completed_at` and `duration_ms`
    /// unless the patch carries them.
    pub async fn apply_worker_update(&self, id: &JobId, patch: JobPatch) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        let next = patch.status.unwrap_or(job.status);
        if !job.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                id: id.clone(),
                from: job.status,
                to: next,
            });
        }

        let now = Utc::now();
        let entering_processing = job.status == JobStatus::Queued && next == JobStatus::Processing;
        job.apply(&patch);

        if entering_processing {
            if patch.started_at.is_none() {
                job.started_at = Some(now);
            }
            if patch.attempts.is_none() {
                job.attempts += 1;
            }
        }
        if next.is_terminal() {
            let completed_at = *job.completed_at.get_or_insert(now);
            if job.duration_ms.is_none() {
                job.duration_ms = job
                    .started_at
                    .map(|started| (completed_at - started).num_milliseconds());
            }
        }

        let snapshot = job.clone();
        let _ = self.changes.send(snapshot.clone());
        Ok(snapshot)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }

    fn take_read_failure(&self) -> bool {
        self.failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobRowStore for MemoryJobStore {
    async fn insert(&self, record: &NewJobRecord) -> Result<JobId, StoreError> {
        self.check_available()?;
        let id = JobId::new(format!("job-{}", self.next_id.fetch_add(1, Ordering::SeqCst)));
        let job = Job::queued(id.clone(), record, Utc::now());

        let mut jobs = self.jobs.write().await;
        jobs.insert(id.clone(), job.clone());
        let _ = self.changes.send(job);
        Ok(id)
    }

    async fn get_by_id(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        self.check_available()?;
        if self.take_read_failure() {
            return Err(StoreError::Unavailable("injected read failure".to_string()));
        }
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn conditional_update(
        &self,
        id: &JobId,
        patch: &JobPatch,
        expected: JobStatus,
    ) -> Result<UpdateOutcome, StoreError> {
        self.check_available()?;
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(id) {
            Some(job) if job.status == expected => {
                job.apply(patch);
                let _ = self.changes.send(job.clone());
                Ok(UpdateOutcome::Updated)
            }
            _ => Ok(UpdateOutcome::NoMatch),
        }
    }

    async fn count_where(&self, owner: &OwnerId, statuses: &[JobStatus]) -> Result<i64, StoreError> {
        self.check_available()?;
        let jobs = self.jobs.read().await;
        let count = jobs
            .values()
            .filter(|job| &job.owner_id == owner && statuses.contains(&job.status))
            .count();
        Ok(count as i64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use genq_core::job::{JobAction, JobRequest, ACTIVE_STATUSES};

    fn record(owner: &str) -> NewJobRecord {
        NewJobRecord::from_request(
            OwnerId::from(owner),
            JobRequest::new("make a snake game", JobAction::Create),
            3,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn insert_assigns_sequential_ids_and_queues() {
        let store = MemoryJobStore::new();
        let first = store.insert(&record("u1")).await.unwrap();
        let second = store.insert(&record("u1")).await.unwrap();
        assert_eq!(first.as_str(), "job-1");
        assert_eq!(second.as_str(), "job-2");

        let job = store.get_by_id(&first).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.progress, 0);
    }

    #[tokio::test]
    async fn conditional_update_requires_expected_status() {
        let store = MemoryJobStore::new();
        let id = store.insert(&record("u1")).await.unwrap();
        store
            .apply_worker_update(&id, JobPatch::progress(10, None))
            .await
            .unwrap();

        let outcome = store
            .conditional_update(&id, &JobPatch::cancelled(Utc::now()), JobStatus::Queued)
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::NoMatch);

        let job = store.get_by_id(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn conditional_update_on_missing_row_is_no_match() {
        let store = MemoryJobStore::new();
        let outcome = store
            .conditional_update(
                &JobId::from("nope"),
                &JobPatch::cancelled(Utc::now()),
                JobStatus::Queued,
            )
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::NoMatch);
    }

    #[tokio::test]
    async fn count_filters_by_owner_and_status() {
        let store = MemoryJobStore::new();
        let a = store.insert(&record("u1")).await.unwrap();
        store.insert(&record("u1")).await.unwrap();
        store.insert(&record("u2")).await.unwrap();
        store
            .apply_worker_update(&a, JobPatch::progress(0, None))
            .await
            .unwrap();
        store
            .apply_worker_update(&a, JobPatch::failed("boom", Utc::now()))
            .await
            .unwrap();

        let owner = OwnerId::from("u1");
        assert_eq!(store.count_where(&owner, &ACTIVE_STATUSES).await.unwrap(), 1);
        assert_eq!(
            store
                .count_where(&owner, &[JobStatus::Failed])
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn worker_update_stamps_start_and_duration() {
        let store = MemoryJobStore::new();
        let id = store.insert(&record("u1")).await.unwrap();

        let job = store
            .apply_worker_update(&id, JobPatch::progress(5, Some("planning")))
            .await
            .unwrap();
        assert!(job.started_at.is_some());
        assert_eq!(job.attempts, 1);

        let job = store
            .apply_worker_update(&id, JobPatch::completed(serde_json::json!({"files": {}}), Utc::now()))
            .await
            .unwrap();
        assert!(job.completed_at.is_some());
        assert!(job.duration_ms.is_some());
        assert!(job.check_invariants().is_ok());
    }

    #[tokio::test]
    async fn worker_update_rejects_writes_after_terminal() {
        let store = MemoryJobStore::new();
        let id = store.insert(&record("u1")).await.unwrap();
        store
            .conditional_update(&id, &JobPatch::cancelled(Utc::now()), JobStatus::Queued)
            .await
            .unwrap();

        let err = store
            .apply_worker_update(&id, JobPatch::progress(50, None))
            .await
            .unwrap_err();
        assert_matches!(
            err,
            StoreError::InvalidTransition {
                from: JobStatus::Cancelled,
                to: JobStatus::Processing,
                ..
            }
        );
    }

    #[tokio::test]
    async fn change_log_sees_every_write() {
        let store = MemoryJobStore::new();
        let mut changes = store.subscribe_changes();

        let id = store.insert(&record("u1")).await.unwrap();
        store
            .apply_worker_update(&id, JobPatch::progress(40, None))
            .await
            .unwrap();

        assert_eq!(changes.recv().await.unwrap().status, JobStatus::Queued);
        let second = changes.recv().await.unwrap();
        assert_eq!(second.status, JobStatus::Processing);
        assert_eq!(second.progress, 40);
    }

    #[tokio::test]
    async fn injected_read_failures_are_consumed() {
        let store = MemoryJobStore::new();
        let id = store.insert(&record("u1")).await.unwrap();
        store.fail_next_reads(2);

        assert_matches!(store.get_by_id(&id).await, Err(StoreError::Unavailable(_)));
        assert_matches!(store.get_by_id(&id).await, Err(StoreError::Unavailable(_)));
        assert_matches!(store.get_by_id(&id).await, Ok(Some(_)));
    }

    #[tokio::test]
    async fn unavailable_store_fails_everything() {
        let store = MemoryJobStore::new();
        store.set_unavailable(true);
        assert_matches!(store.insert(&record("u1")).await, Err(StoreError::Unavailable(_)));
        assert!(store.is_empty().await);
    }
}
