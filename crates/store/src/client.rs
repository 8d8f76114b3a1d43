//! Job store client: authentication, admission control, and retry over a
//! [`JobRowStore`].
//!
//! The admission check (`count_active`) and the insert are two store calls.
//! Two concurrent submits from one owner can both pass the check, so the
//! limit is soft: an owner may briefly hold one job more than allowed.

use std::sync::Arc;

use chrono::Utc;
use genq_core::error::CoreError;
use genq_core::job::{Job, JobPatch, JobRequest, JobStatus, NewJobRecord, ACTIVE_STATUSES};
use genq_core::retry::{retry, RetryConfig};
use genq_core::types::{JobId, OwnerId};

use crate::store::{JobRowStore, StoreError, UpdateOutcome};

/// Default number of queued or processing jobs one owner may hold.
pub const DEFAULT_MAX_ACTIVE_JOBS: i64 = 3;

/// Default worker attempts recorded on each new job.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Source of the authenticated owner for submissions.
pub trait Session: Send + Sync {
    /// The signed-in owner, or `None` when nobody is authenticated.
    fn owner_id(&self) -> Option<OwnerId>;
}

/// A session whose owner never changes.
#[derive(Debug, Clone)]
pub struct FixedSession(Option<OwnerId>);

impl FixedSession {
    pub fn signed_in(owner: impl Into<String>) -> Self {
        Self(Some(OwnerId::new(owner)))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }
}

impl Session for FixedSession {
    fn owner_id(&self) -> Option<OwnerId> {
        self.0.clone()
    }
}

// ---------------------------------------------------------------------------
// Config / errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionConfig {
    /// Queued or processing jobs allowed per owner.
    pub max_active_jobs: i64,
    /// Worker attempts recorded on each new job.
    pub max_attempts: i32,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_active_jobs: DEFAULT_MAX_ACTIVE_JOBS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Errors surfaced by [`JobStoreClient`].
#[derive(Debug, thiserror::Error)]
pub enum JobClientError {
    /// No authenticated owner at submit time.
    #[error("Not signed in: an authenticated user is required to submit jobs")]
    Unauthenticated,

    /// The owner is already at the active-job limit.
    #[error(
        "Too many concurrent jobs: {active} active, the limit is {limit}. \
         Wait for a running job to finish and try again."
    )]
    AdmissionDenied { limit: i64, active: i64 },

    #[error("Job {0} not found")]
    NotFound(JobId),

    /// The request failed validation before reaching the store.
    #[error(transparent)]
    Invalid(#[from] CoreError),

    /// The row store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Thin access layer over the row store used by the orchestrator.
pub struct JobStoreClient {
    store: Arc<dyn JobRowStore>,
    session: Arc<dyn Session>,
    admission: AdmissionConfig,
    retry: RetryConfig,
}

impl JobStoreClient {
    pub fn new(
        store: Arc<dyn JobRowStore>,
        session: Arc<dyn Session>,
        admission: AdmissionConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            session,
            admission,
            retry,
        }
    }

    pub fn admission(&self) -> &AdmissionConfig {
        &self.admission
    }

    pub fn owner_id(&self) -> Option<OwnerId> {
        self.session.owner_id()
    }

    /// Validate, admit, and insert a new job. Returns the new id.
    ///
    /// The insert itself is not retried: a lost response would otherwise
    /// create a duplicate job.
    pub async fn insert(&self, request: JobRequest) -> Result<JobId, JobClientError> {
        let owner = self
            .session
            .owner_id()
            .ok_or(JobClientError::Unauthenticated)?;
        let record = NewJobRecord::from_request(owner, request, self.admission.max_attempts)?;

        let active = self.count_active(&record.owner_id).await?;
        if active >= self.admission.max_active_jobs {
            tracing::info!(
                owner_id = %record.owner_id,
                active,
                limit = self.admission.max_active_jobs,
                "Submission rejected by admission control",
            );
            return Err(JobClientError::AdmissionDenied {
                limit: self.admission.max_active_jobs,
                active,
            });
        }

        let id = self.store.insert(&record).await?;
        tracing::info!(
            job_id = %id,
            owner_id = %record.owner_id,
            action = %record.action,
            "Job submitted",
        );
        Ok(id)
    }

    /// Read a job, retrying store failures with backoff.
    pub async fn get_by_id(&self, id: &JobId) -> Result<Job, JobClientError> {
        let job = retry(&self.retry, || self.store.get_by_id(id))
            .await?
            .ok_or_else(|| JobClientError::NotFound(id.clone()))?;
        log_invariant_violation(&job);
        Ok(job)
    }

    /// Single-attempt read for callers that run their own retry loop.
    pub async fn fetch(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        let job = self.store.get_by_id(id).await?;
        if let Some(job) = &job {
            log_invariant_violation(job);
        }
        Ok(job)
    }

    /// Cancel a job that is still queued.
    ///
    /// The store applies the `queued` guard atomically. Returns `false` when
    /// the job was already processing, terminal, or missing.
    pub async fn cancel(&self, id: &JobId) -> Result<bool, JobClientError> {
        let patch = JobPatch::cancelled(Utc::now());
        let outcome = retry(&self.retry, || {
            self.store
                .conditional_update(id, &patch, JobStatus::Queued)
        })
        .await?;

        let cancelled = outcome == UpdateOutcome::Updated;
        if cancelled {
            tracing::info!(job_id = %id, "Job cancelled");
        } else {
            tracing::info!(job_id = %id, "Cancel skipped, job is no longer queued");
        }
        Ok(cancelled)
    }

    /// Count the owner's queued and processing jobs.
    pub async fn count_active(&self, owner: &OwnerId) -> Result<i64, JobClientError> {
        let count = retry(&self.retry, || {
            self.store.count_where(owner, &ACTIVE_STATUSES)
        })
        .await?;
        Ok(count)
    }
}

fn log_invariant_violation(job: &Job) {
    if let Err(e) = job.check_invariants() {
        tracing::warn!(job_id = %job.id, error = %e, "Job row violates outcome invariants");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
