//! PostgreSQL change feed.
//!
//! The `jobs` trigger publishes `{"id": ..., "status": ...}` on
//! [`CHANGE_CHANNEL`]. Each subscription holds its own `PgListener`, and on
//! every matching notification it re-reads the row through [`PgJobStore`]
//! so decoding stays at the store boundary.

use async_trait::async_trait;
use genq_core::types::JobId;
use genq_store::pg::CHANGE_CHANNEL;
use genq_store::{DbPool, JobRowStore, PgJobStore};
use serde::Deserialize;
use sqlx::postgres::PgListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::feed::{ChangeFeed, FeedEvent, FeedSubscription, TransportError, SUBSCRIPTION_BUFFER};

/// Payload of a `job_changes` notification.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ChangeNotice {
    pub id: String,
    pub status: String,
}

impl ChangeNotice {
    pub fn parse(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

#[derive(Clone)]
pub struct PgChangeFeed {
    pool: DbPool,
    store: PgJobStore,
}

impl PgChangeFeed {
    pub fn new(pool: DbPool) -> Self {
        let store = PgJobStore::new(pool.clone());
        Self { pool, store }
    }
}

#[async_trait]
impl ChangeFeed for PgChangeFeed {
    async fn subscribe(&self, id: &JobId) -> Result<FeedSubscription, TransportError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(CHANGE_CHANNEL).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let cancel = CancellationToken::new();
        tokio::spawn(listen(
            id.clone(),
            listener,
            self.store.clone(),
            tx,
            cancel.clone(),
        ));
        tracing::debug!(job_id = %id, channel = CHANGE_CHANNEL, "Listening for job changes");

        Ok(FeedSubscription::new(id.clone(), rx, cancel))
    }
}

async fn listen(
    id: JobId,
    mut listener: PgListener,
    store: PgJobStore,
    tx: mpsc::Sender<FeedEvent>,
    cancel: CancellationToken,
) {
    let broken = loop {
        // `try_recv` yields `Ok(None)` when the connection drops. Notifications
        // sent while reconnecting are lost, so that counts as a broken feed.
        let notification = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            received = listener.try_recv() => match received {
                Ok(Some(notification)) => notification,
                Ok(None) => {
                    break TransportError::Disconnected("listener connection lost".to_string())
                }
                Err(e) => break TransportError::Listener(e),
            },
        };

        let notice = match ChangeNotice::parse(notification.payload()) {
            Ok(notice) => notice,
            Err(e) => {
                tracing::warn!(
                    payload = notification.payload(),
                    error = %e,
                    "Ignoring malformed job change notification",
                );
                continue;
            }
        };
        if notice.id != id.as_str() {
            continue;
        }

        match store.get_by_id(&id).await {
            Ok(Some(job)) => {
                if tx.send(FeedEvent::Changed(job)).await.is_err() {
                    return;
                }
            }
            Ok(None) => {
                tracing::debug!(job_id = %id, "Notified job no longer exists");
            }
            Err(e) => {
                break TransportError::Disconnected(format!("re-read after notification failed: {e}"));
            }
        }
    };

    tracing::warn!(job_id = %id, error = %broken, "Job change listener stopped");
    let _ = tx.send(FeedEvent::Error(broken)).await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
