//! The row-store contract.

use async_trait::async_trait;
use genq_core::job::{Job, JobPatch, JobStatus, NewJobRecord};
use genq_core::types::{JobId, OwnerId};

/// Result of a conditional update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The row matched the expected status and was written.
    Updated,
    /// The row was missing or its status differed; nothing was written.
    NoMatch,
}

/// Errors raised by a row store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A database query failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A row could not be decoded into a [`Job`].
    #[error("Failed to decode job row: {0}")]
    Decode(String),

    /// The store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A write would break the job lifecycle.
    #[error("Invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    /// The addressed job does not exist.
    #[error("Job {0} not found")]
    NotFound(JobId),
}

/// Persistent storage for job records.
///
/// Implementations decode rows into [`Job`] before returning them.
#[async_trait]
pub trait JobRowStore: Send + Sync {
    /// Insert a new `queued` row and return its id.
    async fn insert(&self, record: &NewJobRecord) -> Result<JobId, StoreError>;

    /// Read one job, `None` when absent.
    async fn get_by_id(&self, id: &JobId) -> Result<Option<Job>, StoreError>;

    /// Apply `patch` only if the row's current status is `expected`.
    ///
    /// The check and the write are one atomic store operation.
    async fn conditional_update(
        &self,
        id: &JobId,
        patch: &JobPatch,
        expected: JobStatus,
    ) -> Result<UpdateOutcome, StoreError>;

    /// Count `owner`'s jobs whose status is in `statuses`.
    async fn count_where(&self, owner: &OwnerId, statuses: &[JobStatus]) -> Result<i64, StoreError>;
}
