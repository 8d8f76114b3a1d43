//! The change-feed contract.
//!
//! A [`FeedSubscription`] is fed by a background task owned by the
//! transport. Dropping the subscription (or calling
//! [`unsubscribe`](FeedSubscription::unsubscribe)) cancels that task.
//! A quiet subscription is not an error: transports only emit
//! [`FeedEvent::Error`] when the channel itself is broken.

use async_trait::async_trait;
use genq_core::job::Job;
use genq_core::types::JobId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Events buffered per subscription before the forwarder waits.
pub const SUBSCRIPTION_BUFFER: usize = 64;

/// Channel-level failures. Data errors never surface here.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The transport could not be reached when subscribing.
    #[error("Change feed unavailable: {0}")]
    Unavailable(String),

    /// An established subscription dropped.
    #[error("Change feed disconnected: {0}")]
    Disconnected(String),

    /// The PostgreSQL listener failed.
    #[error("Change listener error: {0}")]
    Listener(#[from] sqlx::Error),
}

#[derive(Debug)]
pub enum FeedEvent {
    /// A fresh snapshot of the subscribed job.
    Changed(Job),
    /// The subscription broke. No further events follow.
    Error(TransportError),
}

/// Receiving end of one job's change stream.
#[derive(Debug)]
pub struct FeedSubscription {
    job_id: JobId,
    receiver: mpsc::Receiver<FeedEvent>,
    cancel: CancellationToken,
}

impl FeedSubscription {
    /// Wrap a receiver fed by a task that stops when `cancel` fires.
    pub fn new(
        job_id: JobId,
        receiver: mpsc::Receiver<FeedEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_id,
            receiver,
            cancel,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Next event, or `None` once the forwarding task has ended.
    pub async fn next(&mut self) -> Option<FeedEvent> {
        self.receiver.recv().await
    }

    /// Release the subscription.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A source of per-job change notifications.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Subscribe to writes of job `id`.
    async fn subscribe(&self, id: &JobId) -> Result<FeedSubscription, TransportError>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
