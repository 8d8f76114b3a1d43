//! Job submission and tracking facade.

use std::sync::Arc;
use std::time::Duration;

use genq_core::job::{Job, JobRequest, JobStatus};
use genq_core::types::JobId;
use genq_events::ChangeFeed;
use genq_store::{JobRowStore, JobStoreClient, Session};
use tokio::sync::mpsc;

use crate::config::OrchestratorConfig;
use crate::delivery::{DeliveryChannel, DeliveryConfig, DeliveryError, DeliveryHandle};
use crate::error::OrchestratorError;

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was queued and is now cancelled.
    Cancelled,
    /// A worker picked the job up first; nothing changed.
    AlreadyStarted,
    /// The caller's view of the job was not `queued`; the store was not
    /// contacted.
    NotCancellable(JobStatus),
}

#[derive(Clone)]
pub struct JobOrchestrator {
    client: Arc<JobStoreClient>,
    delivery: DeliveryChannel,
}

impl JobOrchestrator {
    pub fn new(
        client: Arc<JobStoreClient>,
        feed: Arc<dyn ChangeFeed>,
        delivery: DeliveryConfig,
    ) -> Self {
        let channel = DeliveryChannel::new(Arc::clone(&client), feed, delivery);
        Self {
            client,
            delivery: channel,
        }
    }

    /// Wire a store, session, and feed together using `config`.
    pub fn from_config(
        store: Arc<dyn JobRowStore>,
        session: Arc<dyn Session>,
        feed: Arc<dyn ChangeFeed>,
        config: &OrchestratorConfig,
    ) -> Self {
        let client = Arc::new(JobStoreClient::new(
            store,
            session,
            config.admission,
            config.retry,
        ));
        Self::new(client, feed, config.delivery)
    }

    pub fn client(&self) -> &Arc<JobStoreClient> {
        &self.client
    }

    /// Create a job and return its id without waiting for it to run.
    pub async fn submit(&self, request: JobRequest) -> Result<JobId, OrchestratorError> {
        Ok(self.client.insert(request).await?)
    }

    pub async fn get(&self, id: &JobId) -> Result<Job, OrchestratorError> {
        Ok(self.client.get_by_id(id).await?)
    }

    /// Stream snapshots of `id` until a terminal status or cleanup.
    ///
    /// Failures and cancellations arrive as snapshots, not errors. Calls are
    /// not deduplicated.
    pub fn track(
        &self,
        id: &JobId,
        on_update: impl Fn(Job) + Send + Sync + 'static,
        on_error: impl Fn(DeliveryError) + Send + Sync + 'static,
    ) -> DeliveryHandle {
        self.delivery.open(id.clone(), on_update, on_error)
    }

    /// Cancel `id` if it is still queued.
    ///
    /// `known_status` is the caller's latest snapshot; anything other than
    /// `queued` short-circuits without touching the store.
    pub async fn cancel(
        &self,
        id: &JobId,
        known_status: JobStatus,
    ) -> Result<CancelOutcome, OrchestratorError> {
        if known_status != JobStatus::Queued {
            tracing::debug!(job_id = %id, status = %known_status, "Job not cancellable");
            return Ok(CancelOutcome::NotCancellable(known_status));
        }
        if self.client.cancel(id).await? {
            Ok(CancelOutcome::Cancelled)
        } else {
            Ok(CancelOutcome::AlreadyStarted)
        }
    }

    /// Track `id` until it completes, turning failure, cancellation, and
    /// the `timeout` ceiling into errors.
    ///
    /// `on_progress` sees every snapshot. The job is never cancelled here,
    /// even on timeout.
    pub async fn wait_for(
        &self,
        id: &JobId,
        on_progress: impl Fn(&Job) + Send + Sync + 'static,
        timeout: Duration,
    ) -> Result<Job, OrchestratorError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = self.track(
            id,
            move |job| {
                on_progress(&job);
                let _ = tx.send(job);
            },
            |e| tracing::debug!(error = %e, "Delivery problem while waiting"),
        );

        let settled = tokio::time::timeout(timeout, async {
            while let Some(job) = rx.recv().await {
                match job.status {
                    JobStatus::Completed => return Ok(job),
                    JobStatus::Failed => {
                        return Err(OrchestratorError::JobFailed {
                            message: job
                                .error_message
                                .unwrap_or_else(|| "unknown error".to_string()),
                            job_id: job.id,
                        })
                    }
                    JobStatus::Cancelled => {
                        return Err(OrchestratorError::JobCancelled { job_id: job.id })
                    }
                    JobStatus::Queued | JobStatus::Processing => {}
                }
            }
            Err(OrchestratorError::ChannelClosed)
        })
        .await;
        handle.cleanup();

        match settled {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(
                    job_id = %id,
                    waited_secs = timeout.as_secs(),
                    "Gave up waiting for job",
                );
                Err(OrchestratorError::Timeout {
                    job_id: id.clone(),
                    waited: timeout,
                })
            }
        }
    }
}
