//! Per-job status delivery with push-to-poll failover.
//!
//! A channel starts in [`DeliveryMode::Push`], forwarding snapshots from the
//! change feed. Once subscribed it reads the job once, so writes made before
//! the subscription existed are not missed. A transport failure (subscribe
//! error, stream error, or the stream ending) is reported once through
//! `on_error` and the channel switches to [`DeliveryMode::Poll`], reading
//! the job from the store every `poll_interval`. The first poll runs
//! immediately so a terminal write missed during the switch is recovered.
//!
//! Delivering a terminal snapshot moves the channel to
//! [`DeliveryMode::TornDown`] under the same lock that admits deliveries,
//! so nothing is delivered after it. `TornDown` is absorbing.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use genq_core::job::Job;
use genq_core::types::JobId;
use genq_events::{ChangeFeed, FeedEvent, TransportError};
use genq_store::{JobStoreClient, StoreError};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Default interval between store reads while polling.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryConfig {
    pub poll_interval: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Push,
    Poll,
    TornDown,
}

impl DeliveryMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Poll => "poll",
            Self::TornDown => "torn_down",
        }
    }
}

impl std::fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-fatal problems reported through `on_error`.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// Push delivery broke; the channel has switched to polling.
    #[error("Real-time updates unavailable, falling back to polling: {0}")]
    Transport(#[source] TransportError),

    /// One poll read failed; polling continues on the next tick.
    #[error("Status poll failed: {0}")]
    Poll(#[source] StoreError),
}

type UpdateFn = Box<dyn Fn(Job) + Send + Sync>;
type ErrorFn = Box<dyn Fn(DeliveryError) + Send + Sync>;

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// Opens delivery channels against one store client and change feed.
#[derive(Clone)]
pub struct DeliveryChannel {
    client: Arc<JobStoreClient>,
    feed: Arc<dyn ChangeFeed>,
    config: DeliveryConfig,
}

impl DeliveryChannel {
    pub fn new(
        client: Arc<JobStoreClient>,
        feed: Arc<dyn ChangeFeed>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            client,
            feed,
            config,
        }
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Start delivering snapshots of `id`. Must be called inside a Tokio
    /// runtime. Every call opens an independent channel.
    pub fn open(
        &self,
        id: JobId,
        on_update: impl Fn(Job) + Send + Sync + 'static,
        on_error: impl Fn(DeliveryError) + Send + Sync + 'static,
    ) -> DeliveryHandle {
        let shared = Arc::new(Shared {
            job_id: id,
            mode: Mutex::new(DeliveryMode::Push),
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
        });

        tracing::debug!(job_id = %shared.job_id, "Opening delivery channel");
        tokio::spawn(run(
            Arc::clone(&shared),
            Arc::clone(&self.client),
            Arc::clone(&self.feed),
            self.config,
            Box::new(on_update),
            Box::new(on_error),
        ));

        DeliveryHandle { shared }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Owner of one running channel. Dropping it tears the channel down.
pub struct DeliveryHandle {
    shared: Arc<Shared>,
}

impl DeliveryHandle {
    pub fn job_id(&self) -> &JobId {
        &self.shared.job_id
    }

    pub fn mode(&self) -> DeliveryMode {
        *self.shared.lock()
    }

    /// Stop delivery. Safe to call repeatedly and concurrently with the
    /// terminal path.
    ///
    /// A callback already running on another thread when this returns is
    /// allowed to finish; nothing new starts afterwards. Callbacks may call
    /// `cleanup` themselves, so the mode lock is not held across them.
    pub fn cleanup(&self) {
        if self.shared.tear_down() {
            tracing::debug!(job_id = %self.shared.job_id, "Delivery channel cleaned up");
        }
    }

    /// Resolves once the channel task has exited.
    pub async fn closed(&self) {
        self.shared.done.cancelled().await;
    }
}

impl Drop for DeliveryHandle {
    fn drop(&mut self) {
        self.shared.tear_down();
    }
}

struct Shared {
    job_id: JobId,
    mode: Mutex<DeliveryMode>,
    /// Cancelled on teardown; stops the channel task.
    cancel: CancellationToken,
    /// Cancelled when the channel task exits.
    done: CancellationToken,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, DeliveryMode> {
        self.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `true` if this call performed the teardown.
    fn tear_down(&self) -> bool {
        let mut mode = self.lock();
        if *mode == DeliveryMode::TornDown {
            return false;
        }
        *mode = DeliveryMode::TornDown;
        self.cancel.cancel();
        true
    }

    /// Admit `job` for delivery. A terminal snapshot tears the channel down
    /// before the lock is released.
    fn admit(&self, job: &Job) -> bool {
        let mut mode = self.lock();
        if *mode == DeliveryMode::TornDown {
            return false;
        }
        if job.is_terminal() {
            *mode = DeliveryMode::TornDown;
            self.cancel.cancel();
        }
        true
    }

    /// Switch push to poll. `false` when already torn down.
    fn enter_poll(&self) -> bool {
        let mut mode = self.lock();
        if *mode == DeliveryMode::TornDown {
            return false;
        }
        *mode = DeliveryMode::Poll;
        true
    }

    fn is_torn_down(&self) -> bool {
        *self.lock() == DeliveryMode::TornDown
    }

    fn deliver(&self, job: Job, on_update: &UpdateFn) {
        if !self.admit(&job) {
            return;
        }
        // A concurrent cleanup may have landed after admission.
        if !job.is_terminal() && self.is_torn_down() {
            return;
        }
        if job.is_terminal() {
            tracing::info!(
                job_id = %self.job_id,
                status = %job.status,
                "Terminal status delivered, closing channel",
            );
        }
        on_update(job);
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

async fn run(
    shared: Arc<Shared>,
    client: Arc<JobStoreClient>,
    feed: Arc<dyn ChangeFeed>,
    config: DeliveryConfig,
    on_update: UpdateFn,
    on_error: ErrorFn,
) {
    let _done = shared.done.clone().drop_guard();

    let Some(failure) = push(&shared, &client, feed.as_ref(), &on_update).await else {
        return;
    };
    if !shared.enter_poll() {
        return;
    }

    tracing::warn!(
        job_id = %shared.job_id,
        error = %failure,
        mode = %DeliveryMode::Poll,
        "Push delivery failed, switching to polling",
    );
    on_error(DeliveryError::Transport(failure));

    poll(&shared, &client, config.poll_interval, &on_update, &on_error).await;
}

/// Forward feed events until teardown (`None`) or a transport failure.
async fn push(
    shared: &Shared,
    client: &JobStoreClient,
    feed: &dyn ChangeFeed,
    on_update: &UpdateFn,
) -> Option<TransportError> {
    let subscribed = tokio::select! {
        biased;
        _ = shared.cancel.cancelled() => return None,
        subscribed = feed.subscribe(&shared.job_id) => subscribed,
    };
    let mut subscription = match subscribed {
        Ok(subscription) => subscription,
        Err(e) => return Some(e),
    };

    match client.fetch(&shared.job_id).await {
        Ok(Some(job)) => shared.deliver(job, on_update),
        Ok(None) => {}
        Err(e) => {
            tracing::debug!(job_id = %shared.job_id, error = %e, "Catch-up read failed");
        }
    }

    loop {
        let event = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => return None,
            event = subscription.next() => event,
        };
        match event {
            Some(FeedEvent::Changed(job)) => shared.deliver(job, on_update),
            Some(FeedEvent::Error(e)) => return Some(e),
            None => {
                return Some(TransportError::Disconnected(
                    "change feed ended".to_string(),
                ))
            }
        }
    }
}

async fn poll(
    shared: &Shared,
    client: &JobStoreClient,
    interval: Duration,
    on_update: &UpdateFn,
    on_error: &ErrorFn,
) {
    let mut ticks = tokio::time::interval(interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let fetched = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            _ = ticks.tick() => client.fetch(&shared.job_id).await,
        };

        match fetched {
            Ok(Some(job)) => shared.deliver(job, on_update),
            Ok(None) => report_poll_error(
                shared,
                on_error,
                StoreError::NotFound(shared.job_id.clone()),
            ),
            Err(e) => report_poll_error(shared, on_error, e),
        }
    }
    tracing::debug!(job_id = %shared.job_id, "Polling stopped");
}

fn report_poll_error(shared: &Shared, on_error: &ErrorFn, error: StoreError) {
    if shared.is_torn_down() {
        return;
    }
    tracing::warn!(job_id = %shared.job_id, error = %error, "Status poll failed");
    on_error(DeliveryError::Poll(error));
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
