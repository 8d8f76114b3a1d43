#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use genq_core::job::{JobAction, JobPatch, JobRequest};
use genq_core::retry::RetryConfig;
use genq_core::types::JobId;
use genq_events::MemoryChangeFeed;
use genq_orchestrator::{JobOrchestrator, OrchestratorConfig};
use genq_store::{FixedSession, MemoryJobStore};

/// In-memory store, feed, and orchestrator wired together.
pub struct Harness {
    pub store: Arc<MemoryJobStore>,
    pub feed: Arc<MemoryChangeFeed>,
    pub orchestrator: JobOrchestrator,
}

/// Default config with short retry delays.
pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        retry: RetryConfig {
            max_retries: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
        },
        ..OrchestratorConfig::default()
    }
}

/// Harness signed in as `u1` with [`test_config`].
pub fn harness() -> Harness {
    harness_with(FixedSession::signed_in("u1"), test_config())
}

pub fn harness_with(session: FixedSession, config: OrchestratorConfig) -> Harness {
    let store = Arc::new(MemoryJobStore::new());
    let feed = Arc::new(MemoryChangeFeed::new(Arc::clone(&store)));
    let orchestrator =
        JobOrchestrator::from_config(store.clone(), Arc::new(session), feed.clone(), &config);
    Harness {
        store,
        feed,
        orchestrator,
    }
}

pub fn snake_request() -> JobRequest {
    JobRequest::new("make a snake game", JobAction::Create)
}

impl Harness {
    /// Worker-side progress write.
    pub async fn progress(&self, id: &JobId, percent: u8, message: &str) {
        self.store
            .apply_worker_update(id, JobPatch::progress(percent, Some(message)))
            .await
            .unwrap();
    }

    pub async fn complete(&self, id: &JobId) {
        let files = serde_json::json!({ "files": { "index.html": "<canvas></canvas>" } });
        self.store
            .apply_worker_update(id, JobPatch::completed(files, Utc::now()))
            .await
            .unwrap();
    }

    pub async fn fail(&self, id: &JobId, message: &str) {
        self.store
            .apply_worker_update(id, JobPatch::failed(message, Utc::now()))
            .await
            .unwrap();
    }
}

/// Let spawned tasks run without advancing time.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
