use std::time::Duration;

use genq_core::types::JobId;
use genq_store::JobClientError;

/// Errors surfaced by [`JobOrchestrator`](crate::JobOrchestrator).
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Authentication, admission, validation, or store failure.
    #[error(transparent)]
    Client(#[from] JobClientError),

    /// `wait_for` hit its ceiling. The job itself is left untouched.
    #[error("Timed out after {}s waiting for job {job_id}", waited.as_secs())]
    Timeout { job_id: JobId, waited: Duration },

    #[error("Job {job_id} failed: {message}")]
    JobFailed { job_id: JobId, message: String },

    #[error("Job {job_id} was cancelled")]
    JobCancelled { job_id: JobId },

    /// Tracking ended before any terminal snapshot arrived.
    #[error("Job tracking ended before the job finished")]
    ChannelClosed,
}
