//! Integration tests for submission, tracking, cancellation, and waiting
//! against the in-memory store and change feed.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use common::{harness, harness_with, settle, snake_request, test_config};
use genq_core::job::{Job, JobStatus};
use genq_events::TransportError;
use genq_orchestrator::{CancelOutcome, DeliveryError, DeliveryMode, OrchestratorError};
use genq_store::{FixedSession, JobClientError};

type Seen = Arc<Mutex<Vec<Job>>>;

fn recorder() -> (Seen, impl Fn(Job) + Send + Sync + 'static) {
    let seen: Seen = Arc::default();
    let sink = Arc::clone(&seen);
    (seen, move |job| sink.lock().unwrap().push(job))
}

fn statuses(seen: &Seen) -> Vec<JobStatus> {
    seen.lock().unwrap().iter().map(|job| job.status).collect()
}

// ---------------------------------------------------------------------------
// Test: submit then get
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submitted_job_starts_queued_at_zero() {
    let h = harness();
    let id = h.orchestrator.submit(snake_request()).await.unwrap();

    let job = h.orchestrator.get(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.progress, 0);
    assert!(job.result.is_none());
}

// ---------------------------------------------------------------------------
// Test: admission control
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fourth_active_job_is_denied_without_insert() {
    let h = harness();
    for _ in 0..3 {
        h.orchestrator.submit(snake_request()).await.unwrap();
    }

    let err = h.orchestrator.submit(snake_request()).await.unwrap_err();
    assert_matches!(
        err,
        OrchestratorError::Client(JobClientError::AdmissionDenied { limit: 3, active: 3 })
    );
    assert_eq!(h.store.len().await, 3);
}

#[tokio::test]
async fn anonymous_submit_is_unauthenticated() {
    let h = harness_with(FixedSession::anonymous(), test_config());
    assert_matches!(
        h.orchestrator.submit(snake_request()).await,
        Err(OrchestratorError::Client(JobClientError::Unauthenticated))
    );
}

// ---------------------------------------------------------------------------
// Test: tracking over push
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn track_follows_the_lifecycle_and_stops_at_terminal() {
    let h = harness();
    let id = h.orchestrator.submit(snake_request()).await.unwrap();
    let (seen, on_update) = recorder();
    let handle = h.orchestrator.track(&id, on_update, |_| {});
    settle().await;

    h.progress(&id, 10, "Planning").await;
    h.progress(&id, 40, "Writing game loop").await;
    h.complete(&id).await;
    handle.closed().await;

    assert_eq!(
        statuses(&seen),
        vec![
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Processing,
            JobStatus::Completed,
        ]
    );
    assert_eq!(handle.mode(), DeliveryMode::TornDown);

    // Nothing arrives once the channel is closed.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(seen.lock().unwrap().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn two_tracks_open_two_channels() {
    let h = harness();
    let id = h.orchestrator.submit(snake_request()).await.unwrap();
    let (first, on_first) = recorder();
    let (second, on_second) = recorder();
    let _a = h.orchestrator.track(&id, on_first, |_| {});
    let _b = h.orchestrator.track(&id, on_second, |_| {});
    settle().await;

    h.progress(&id, 25, "Planning").await;
    settle().await;

    assert_eq!(statuses(&first), statuses(&second));
    assert_eq!(first.lock().unwrap().last().map(|j| j.progress), Some(25));
}

// ---------------------------------------------------------------------------
// Test: failover to polling
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn disconnect_fails_over_and_still_delivers_terminal() {
    let h = harness();
    let id = h.orchestrator.submit(snake_request()).await.unwrap();

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    let (seen, on_update) = recorder();
    let handle = h
        .orchestrator
        .track(&id, on_update, move |e| sink.lock().unwrap().push(e));
    settle().await;
    assert_eq!(handle.mode(), DeliveryMode::Push);

    h.feed.disconnect_all();
    settle().await;
    assert_eq!(handle.mode(), DeliveryMode::Poll);
    assert_matches!(
        errors.lock().unwrap().as_slice(),
        [DeliveryError::Transport(TransportError::Disconnected(_))]
    );

    h.progress(&id, 70, "Testing").await;
    h.complete(&id).await;

    tokio::time::timeout(Duration::from_secs(6), handle.closed())
        .await
        .expect("terminal snapshot within one poll interval");
    assert_eq!(statuses(&seen).last(), Some(&JobStatus::Completed));
}

#[tokio::test(start_paused = true)]
async fn terminal_write_before_tracking_is_recovered_by_first_poll() {
    let h = harness();
    let id = h.orchestrator.submit(snake_request()).await.unwrap();
    h.progress(&id, 50, "Writing files").await;
    h.fail(&id, "model refused").await;
    h.feed.set_available(false);

    let (seen, on_update) = recorder();
    let handle = h.orchestrator.track(&id, on_update, |_| {});
    settle().await;

    assert_eq!(statuses(&seen), vec![JobStatus::Failed]);
    assert_eq!(handle.mode(), DeliveryMode::TornDown);
}

// ---------------------------------------------------------------------------
// Test: cancel
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_queued_job() {
    let h = harness();
    let id = h.orchestrator.submit(snake_request()).await.unwrap();

    let outcome = h.orchestrator.cancel(&id, JobStatus::Queued).await.unwrap();
    assert_eq!(outcome, CancelOutcome::Cancelled);

    let job = h.orchestrator.get(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.completed_at.is_some());
}

#[tokio::test]
async fn cancel_after_worker_started_leaves_row_unchanged() {
    let h = harness();
    let id = h.orchestrator.submit(snake_request()).await.unwrap();
    h.progress(&id, 5, "Planning").await;
    let before = h.orchestrator.get(&id).await.unwrap();

    // The caller still believes the job is queued.
    let outcome = h.orchestrator.cancel(&id, JobStatus::Queued).await.unwrap();
    assert_eq!(outcome, CancelOutcome::AlreadyStarted);
    assert_eq!(h.orchestrator.get(&id).await.unwrap(), before);
}

#[tokio::test]
async fn cancel_is_idempotent() {
    let h = harness();
    let id = h.orchestrator.submit(snake_request()).await.unwrap();

    assert_eq!(
        h.orchestrator.cancel(&id, JobStatus::Queued).await.unwrap(),
        CancelOutcome::Cancelled
    );
    assert_eq!(
        h.orchestrator.cancel(&id, JobStatus::Queued).await.unwrap(),
        CancelOutcome::AlreadyStarted
    );
    assert_eq!(
        h.orchestrator.get(&id).await.unwrap().status,
        JobStatus::Cancelled
    );
}

#[tokio::test]
async fn known_non_queued_status_skips_the_store() {
    let h = harness();
    let id = h.orchestrator.submit(snake_request()).await.unwrap();
    h.store.set_unavailable(true);

    let outcome = h
        .orchestrator
        .cancel(&id, JobStatus::Processing)
        .await
        .unwrap();
    assert_eq!(outcome, CancelOutcome::NotCancellable(JobStatus::Processing));
}

// ---------------------------------------------------------------------------
// Test: wait_for
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn wait_for_resolves_on_completion_and_reports_progress() {
    let h = Arc::new(harness());
    let id = h.orchestrator.submit(snake_request()).await.unwrap();

    let worker = {
        let h = Arc::clone(&h);
        let id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            h.progress(&id, 40, "Writing game loop").await;
            tokio::time::sleep(Duration::from_secs(2)).await;
            h.complete(&id).await;
        })
    };

    let progress = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&progress);
    let job = h
        .orchestrator
        .wait_for(
            &id,
            move |job| sink.lock().unwrap().push(job.progress),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
    worker.await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.result.is_some());
    assert_eq!(*progress.lock().unwrap(), vec![0, 40, 100]);
}

#[tokio::test(start_paused = true)]
async fn wait_for_surfaces_failure_message() {
    let h = harness();
    let id = h.orchestrator.submit(snake_request()).await.unwrap();
    h.progress(&id, 30, "Writing files").await;
    h.fail(&id, "generation crashed").await;

    let err = h
        .orchestrator
        .wait_for(&id, |_| {}, Duration::from_secs(60))
        .await
        .unwrap_err();
    assert_matches!(
        err,
        OrchestratorError::JobFailed { message, .. } if message == "generation crashed"
    );
}

#[tokio::test(start_paused = true)]
async fn wait_for_surfaces_cancellation() {
    let h = harness();
    let id = h.orchestrator.submit(snake_request()).await.unwrap();
    h.orchestrator.cancel(&id, JobStatus::Queued).await.unwrap();

    assert_matches!(
        h.orchestrator
            .wait_for(&id, |_| {}, Duration::from_secs(60))
            .await,
        Err(OrchestratorError::JobCancelled { job_id }) if job_id == id
    );
}

#[tokio::test(start_paused = true)]
async fn wait_for_times_out_without_touching_the_job() {
    let h = harness();
    let id = h.orchestrator.submit(snake_request()).await.unwrap();

    let err = h
        .orchestrator
        .wait_for(&id, |_| {}, Duration::from_secs(10))
        .await
        .unwrap_err();
    assert_matches!(
        err,
        OrchestratorError::Timeout { waited, .. } if waited == Duration::from_secs(10)
    );
    assert_eq!(
        h.orchestrator.get(&id).await.unwrap().status,
        JobStatus::Queued
    );
}
