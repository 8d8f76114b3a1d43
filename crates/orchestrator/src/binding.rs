//! Single-job lifecycle holder for UI consumers.
//!
//! [`JobBinding`] owns at most one active job. It publishes a [`JobView`]
//! through a `watch` channel, fires one terminal hook per job, and tears
//! down tracking (and its optional [`TimeoutMonitor`]) on terminal status,
//! `reset`, a new `submit`, or drop.
//!
//! Every tracking session carries a generation number. Snapshots from an
//! older generation are ignored, so a late delivery for an abandoned job
//! never overwrites the current one.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use genq_core::job::{Job, JobRequest, JobStatus};
use genq_core::timeout::{TimeoutHooks, TimeoutMonitor, TimeoutStatus, TimeoutThresholds};
use genq_core::types::JobId;
use serde::Serialize;
use tokio::sync::watch;

use crate::delivery::{DeliveryError, DeliveryHandle};
use crate::error::OrchestratorError;
use crate::orchestrator::{CancelOutcome, JobOrchestrator};

// ---------------------------------------------------------------------------
// View
// ---------------------------------------------------------------------------

/// Consumer-facing state of the bound job.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobView {
    /// Latest snapshot, replaced wholesale on every update.
    pub job: Option<Job>,
    pub is_submitting: bool,
    /// Last submit or cancel error.
    pub error_message: Option<String>,
    /// Latest timeout classification while a monitor runs.
    pub timeout: Option<TimeoutStatus>,
}

impl JobView {
    fn status(&self) -> Option<JobStatus> {
        self.job.as_ref().map(|job| job.status)
    }

    /// Queued or processing.
    pub fn is_processing(&self) -> bool {
        self.status().is_some_and(JobStatus::is_active)
    }

    pub fn is_complete(&self) -> bool {
        self.status() == Some(JobStatus::Completed)
    }

    pub fn is_failed(&self) -> bool {
        self.status() == Some(JobStatus::Failed)
    }

    pub fn is_cancelled(&self) -> bool {
        self.status() == Some(JobStatus::Cancelled)
    }

    pub fn progress(&self) -> u8 {
        self.job.as_ref().map_or(0, |job| job.progress)
    }

    pub fn status_message(&self) -> Option<&str> {
        self.job.as_ref()?.status_message.as_deref()
    }

    pub fn result(&self) -> Option<&serde_json::Value> {
        self.job.as_ref()?.result.as_ref()
    }

    /// Local submit or cancel error, else the failed job's message.
    pub fn error_message(&self) -> Option<&str> {
        self.error_message
            .as_deref()
            .or_else(|| self.job.as_ref()?.error_message.as_deref())
    }
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

type JobHook = Box<dyn Fn(&Job) + Send + Sync>;

/// Terminal hooks. Each fires at most once per job.
#[derive(Default)]
pub struct BindingHooks {
    on_complete: Option<JobHook>,
    on_failed: Option<JobHook>,
    on_cancelled: Option<JobHook>,
}

impl BindingHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_complete(mut self, f: impl Fn(&Job) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    pub fn on_failed(mut self, f: impl Fn(&Job) + Send + Sync + 'static) -> Self {
        self.on_failed = Some(Box::new(f));
        self
    }

    pub fn on_cancelled(mut self, f: impl Fn(&Job) + Send + Sync + 'static) -> Self {
        self.on_cancelled = Some(Box::new(f));
        self
    }

    fn for_status(&self, status: JobStatus) -> Option<&JobHook> {
        match status {
            JobStatus::Completed => self.on_complete.as_ref(),
            JobStatus::Failed => self.on_failed.as_ref(),
            JobStatus::Cancelled => self.on_cancelled.as_ref(),
            JobStatus::Queued | JobStatus::Processing => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Binding
// ---------------------------------------------------------------------------

pub struct JobBinding {
    inner: Arc<Inner>,
}

struct Inner {
    orchestrator: JobOrchestrator,
    hooks: BindingHooks,
    thresholds: Option<TimeoutThresholds>,
    view: watch::Sender<JobView>,
    session: Mutex<Session>,
}

/// The active tracking session.
#[derive(Default)]
struct Session {
    generation: u64,
    /// Set once a terminal snapshot has been applied.
    finished: bool,
    delivery: Option<DeliveryHandle>,
    monitor: Option<TimeoutMonitor>,
}

impl Session {
    fn take_resources(&mut self) -> (Option<DeliveryHandle>, Option<TimeoutMonitor>) {
        (self.delivery.take(), self.monitor.take())
    }
}

fn release(resources: (Option<DeliveryHandle>, Option<TimeoutMonitor>)) {
    let (delivery, monitor) = resources;
    if let Some(delivery) = delivery {
        delivery.cleanup();
    }
    if let Some(monitor) = monitor {
        monitor.stop();
    }
}

impl JobBinding {
    pub fn new(orchestrator: JobOrchestrator, hooks: BindingHooks) -> Self {
        Self::build(orchestrator, hooks, None)
    }

    /// Also run a [`TimeoutMonitor`] for each tracked job. The monitor is
    /// advisory: reaching `aborted` does not cancel the job.
    pub fn with_timeouts(
        orchestrator: JobOrchestrator,
        hooks: BindingHooks,
        thresholds: TimeoutThresholds,
    ) -> Self {
        Self::build(orchestrator, hooks, Some(thresholds))
    }

    fn build(
        orchestrator: JobOrchestrator,
        hooks: BindingHooks,
        thresholds: Option<TimeoutThresholds>,
    ) -> Self {
        let (view, _) = watch::channel(JobView::default());
        Self {
            inner: Arc::new(Inner {
                orchestrator,
                hooks,
                thresholds,
                view,
                session: Mutex::new(Session::default()),
            }),
        }
    }

    /// Receive every published [`JobView`].
    pub fn subscribe(&self) -> watch::Receiver<JobView> {
        self.inner.view.subscribe()
    }

    /// Current view.
    pub fn view(&self) -> JobView {
        self.inner.view.borrow().clone()
    }

    /// Abandon any current job, submit `request`, and start tracking it.
    pub async fn submit(&self, request: JobRequest) -> Result<JobId, OrchestratorError> {
        let generation = self.inner.tear_down();
        self.inner.publish(generation, |view| {
            *view = JobView {
                is_submitting: true,
                ..JobView::default()
            };
        });

        let submitted = self.inner.submit_and_track(generation, request).await;

        self.inner.publish(generation, |view| {
            view.is_submitting = false;
            if let Err(e) = &submitted {
                view.error_message = Some(e.to_string());
            }
        });
        submitted
    }

    /// Cancel the bound job if its cached status is `queued`.
    ///
    /// Returns `None` when no job is bound.
    pub async fn cancel(&self) -> Result<Option<CancelOutcome>, OrchestratorError> {
        let Some(job) = self.inner.view.borrow().job.clone() else {
            return Ok(None);
        };
        let generation = self.inner.generation();

        let outcome = match self.inner.orchestrator.cancel(&job.id, job.status).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.inner.publish(generation, |view| {
                    view.error_message = Some(e.to_string());
                });
                return Err(e);
            }
        };

        if outcome == CancelOutcome::Cancelled {
            // Surface the cancellation without waiting for the next delivery.
            match self.inner.orchestrator.get(&job.id).await {
                Ok(snapshot) => self.inner.apply_snapshot(generation, snapshot),
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "Post-cancel read failed");
                }
            }
        }
        Ok(Some(outcome))
    }

    /// Stop tracking and clear the view. The job itself is not cancelled.
    pub fn reset(&self) {
        let generation = self.inner.tear_down();
        self.inner.publish(generation, |view| *view = JobView::default());
    }
}

impl Drop for JobBinding {
    fn drop(&mut self) {
        self.inner.tear_down();
    }
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Release the current session and start a new generation.
    fn tear_down(&self) -> u64 {
        let (generation, resources) = {
            let mut session = self.lock();
            session.generation += 1;
            session.finished = false;
            (session.generation, session.take_resources())
        };
        release(resources);
        generation
    }

    /// Modify the view if `generation` is still current.
    fn publish(&self, generation: u64, modify: impl FnOnce(&mut JobView)) {
        let session = self.lock();
        if session.generation == generation {
            self.view.send_modify(modify);
        }
    }

    async fn submit_and_track(
        self: &Arc<Self>,
        generation: u64,
        request: JobRequest,
    ) -> Result<JobId, OrchestratorError> {
        let id = self.orchestrator.submit(request).await?;

        match self.orchestrator.get(&id).await {
            Ok(job) => self.apply_snapshot(generation, job),
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "Initial job read failed, tracking anyway");
            }
        }

        self.open_tracking(generation, &id);
        Ok(id)
    }

    fn open_tracking(self: &Arc<Self>, generation: u64, id: &JobId) {
        let mut session = self.lock();
        if session.generation != generation || session.finished {
            return;
        }

        let on_update = {
            let inner = Arc::downgrade(self);
            move |job: Job| {
                if let Some(inner) = inner.upgrade() {
                    inner.apply_snapshot(generation, job);
                }
            }
        };
        let on_error = {
            let id = id.clone();
            move |e: DeliveryError| {
                tracing::warn!(job_id = %id, error = %e, "Job delivery degraded");
            }
        };
        session.delivery = Some(self.orchestrator.track(id, on_update, on_error));

        if let Some(thresholds) = self.thresholds {
            let hooks = monitor_hooks(Arc::downgrade(self), generation, id);
            let monitor = TimeoutMonitor::new(thresholds, hooks);
            monitor.start();
            session.monitor = Some(monitor);
        }
        tracing::info!(job_id = %id, generation, "Tracking job");
    }

    /// Apply a snapshot from `generation`. A terminal snapshot ends the
    /// session and fires its hook once.
    fn apply_snapshot(&self, generation: u64, job: Job) {
        let resources = {
            let mut session = self.lock();
            if session.generation != generation || session.finished {
                return;
            }
            let terminal = job.is_terminal();
            self.view.send_modify(|view| view.job = Some(job.clone()));
            if !terminal {
                return;
            }
            session.finished = true;
            session.take_resources()
        };
        release(resources);

        tracing::info!(job_id = %job.id, status = %job.status, "Job finished");
        if let Some(hook) = self.hooks.for_status(job.status) {
            hook(&job);
        }
    }
}

fn monitor_hooks(inner: Weak<Inner>, generation: u64, id: &JobId) -> TimeoutHooks {
    let edge = |level: tracing::Level, id: JobId| {
        move |status: &TimeoutStatus| {
            if level == tracing::Level::WARN {
                tracing::warn!(
                    job_id = %id,
                    stage = ?status.stage,
                    elapsed_secs = status.elapsed.as_secs(),
                    "{}",
                    status.message,
                );
            } else {
                tracing::info!(
                    job_id = %id,
                    stage = ?status.stage,
                    elapsed_secs = status.elapsed.as_secs(),
                    "{}",
                    status.message,
                );
            }
        }
    };

    TimeoutHooks::new()
        .on_status(move |status| {
            if let Some(inner) = inner.upgrade() {
                let status = status.clone();
                inner.publish(generation, |view| view.timeout = Some(status));
            }
        })
        .on_warning(edge(tracing::Level::INFO, id.clone()))
        .on_soft_timeout(edge(tracing::Level::INFO, id.clone()))
        .on_hard_timeout(edge(tracing::Level::WARN, id.clone()))
        .on_abort(edge(tracing::Level::WARN, id.clone()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
