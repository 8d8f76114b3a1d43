//! In-process change feed over [`MemoryJobStore`]'s change log.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use genq_core::job::Job;
use genq_core::types::JobId;
use genq_store::MemoryJobStore;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::feed::{ChangeFeed, FeedEvent, FeedSubscription, TransportError, SUBSCRIPTION_BUFFER};

pub struct MemoryChangeFeed {
    store: Arc<MemoryJobStore>,
    available: AtomicBool,
    /// Cancelled by [`disconnect_all`](Self::disconnect_all), then replaced.
    connection: Mutex<CancellationToken>,
}

impl MemoryChangeFeed {
    pub fn new(store: Arc<MemoryJobStore>) -> Self {
        Self {
            store,
            available: AtomicBool::new(true),
            connection: Mutex::new(CancellationToken::new()),
        }
    }

    /// While unavailable, `subscribe` fails with [`TransportError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Break every open subscription with [`TransportError::Disconnected`].
    pub fn disconnect_all(&self) {
        let mut connection = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
        connection.cancel();
        *connection = CancellationToken::new();
        tracing::info!("Memory change feed dropped all subscriptions");
    }

    fn current_connection(&self) -> CancellationToken {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ChangeFeed for MemoryChangeFeed {
    async fn subscribe(&self, id: &JobId) -> Result<FeedSubscription, TransportError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable(
                "memory change feed is offline".to_string(),
            ));
        }

        let changes = self.store.subscribe_changes();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let cancel = CancellationToken::new();

        tokio::spawn(forward(
            id.clone(),
            changes,
            tx,
            cancel.clone(),
            self.current_connection(),
        ));
        tracing::debug!(job_id = %id, "Subscribed to memory change feed");

        Ok(FeedSubscription::new(id.clone(), rx, cancel))
    }
}

/// Forward snapshots of `id` from the change log until cancelled or broken.
async fn forward(
    id: JobId,
    mut changes: broadcast::Receiver<Job>,
    tx: mpsc::Sender<FeedEvent>,
    cancel: CancellationToken,
    connection: CancellationToken,
) {
    loop {
        let broken = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = connection.cancelled() => {
                TransportError::Disconnected("subscription dropped by the feed".to_string())
            }
            msg = changes.recv() => match msg {
                Ok(job) if job.id == id => {
                    if tx.send(FeedEvent::Changed(job)).await.is_err() {
                        break;
                    }
                    continue;
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(job_id = %id, skipped = n, "Change feed lagged");
                    TransportError::Disconnected(format!("change log lagged by {n} events"))
                }
                Err(broadcast::error::RecvError::Closed) => {
                    TransportError::Disconnected("change log closed".to_string())
                }
            },
        };

        let _ = tx.send(FeedEvent::Error(broken)).await;
        break;
    }
    tracing::debug!(job_id = %id, "Memory change feed forwarder stopped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
