//! Staged timeout escalation for long-running client-side waits.
//!
//! [`TimeoutMonitor`] classifies elapsed wall-clock time into ordered
//! [`TimeoutStage`]s and fires hooks when the stage changes. The stage
//! transition itself is the pure function [`next_stage`]; the monitor only
//! owns the clock, the tick task, and the abort signal.
//!
//! The monitor is advisory: reaching [`TimeoutStage::Aborted`] cancels the
//! token returned by [`TimeoutMonitor::signal`] and nothing else.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;

/// Stage messages are second-granular, so 1 Hz is enough.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Escalation stage, ordered by elapsed time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutStage {
    Normal,
    Warning,
    SoftTimeout,
    HardTimeout,
    Aborted,
}

impl TimeoutStage {
    pub const ALL: [TimeoutStage; 5] = [
        TimeoutStage::Normal,
        TimeoutStage::Warning,
        TimeoutStage::SoftTimeout,
        TimeoutStage::HardTimeout,
        TimeoutStage::Aborted,
    ];
}

/// Elapsed-time thresholds at which each stage begins.
///
/// Must be strictly increasing: `warning < soft < hard < abort`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutThresholds {
    pub warning: Duration,
    pub soft: Duration,
    pub hard: Duration,
    pub abort: Duration,
}

impl Default for TimeoutThresholds {
    fn default() -> Self {
        Self {
            warning: Duration::from_secs(30),
            soft: Duration::from_secs(60),
            hard: Duration::from_secs(120),
            abort: Duration::from_secs(180),
        }
    }
}

impl TimeoutThresholds {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.warning.is_zero() {
            return Err(CoreError::Validation(
                "Warning threshold must be greater than zero".to_string(),
            ));
        }
        if !(self.warning < self.soft && self.soft < self.hard && self.hard < self.abort) {
            return Err(CoreError::Validation(format!(
                "Timeout thresholds must be strictly increasing (got {:?} / {:?} / {:?} / {:?})",
                self.warning, self.soft, self.hard, self.abort
            )));
        }
        Ok(())
    }
}

/// The highest stage whose threshold `elapsed` has reached.
pub fn stage_for(elapsed: Duration, thresholds: &TimeoutThresholds) -> TimeoutStage {
    if elapsed >= thresholds.abort {
        TimeoutStage::Aborted
    } else if elapsed >= thresholds.hard {
        TimeoutStage::HardTimeout
    } else if elapsed >= thresholds.soft {
        TimeoutStage::SoftTimeout
    } else if elapsed >= thresholds.warning {
        TimeoutStage::Warning
    } else {
        TimeoutStage::Normal
    }
}

/// Stage after a tick at `elapsed`. Never moves backwards.
pub fn next_stage(
    current: TimeoutStage,
    elapsed: Duration,
    thresholds: &TimeoutThresholds,
) -> TimeoutStage {
    current.max(stage_for(elapsed, thresholds))
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Consumer-facing view of one tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutStatus {
    pub stage: TimeoutStage,
    pub elapsed: Duration,
    pub message: String,
    pub suggestion: Option<String>,
    pub can_retry: bool,
    pub should_abort: bool,
}

impl TimeoutStatus {
    pub fn compute(stage: TimeoutStage, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs();
        let (message, suggestion, can_retry, should_abort) = match stage {
            TimeoutStage::Normal => (format!("Generating... ({secs}s)"), None, false, false),
            TimeoutStage::Warning => (
                format!("This is taking longer than usual ({secs}s)"),
                Some("Larger requests can take a minute or two.".to_string()),
                false,
                false,
            ),
            TimeoutStage::SoftTimeout => (
                format!("Still working on a complex request ({secs}s)"),
                Some("You can keep waiting, or cancel and try a smaller prompt.".to_string()),
                true,
                false,
            ),
            TimeoutStage::HardTimeout => (
                format!("The request is taking much longer than expected ({secs}s)"),
                Some("Consider cancelling and retrying.".to_string()),
                true,
                false,
            ),
            TimeoutStage::Aborted => (
                format!("Gave up waiting after {secs}s"),
                Some("Retry the request; the job may still finish in the background.".to_string()),
                true,
                true,
            ),
        };
        Self {
            stage,
            elapsed,
            message,
            suggestion,
            can_retry,
            should_abort,
        }
    }
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// Callback receiving a derived status.
pub type StatusHook = Box<dyn Fn(&TimeoutStatus) + Send + Sync>;

/// Hooks invoked by the monitor.
///
/// `on_status` fires on every tick. The stage hooks fire once, on the tick
/// where the stage is first entered.
#[derive(Default)]
pub struct TimeoutHooks {
    on_status: Option<StatusHook>,
    on_warning: Option<StatusHook>,
    on_soft_timeout: Option<StatusHook>,
    on_hard_timeout: Option<StatusHook>,
    on_abort: Option<StatusHook>,
}

impl TimeoutHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_status(mut self, f: impl Fn(&TimeoutStatus) + Send + Sync + 'static) -> Self {
        self.on_status = Some(Box::new(f));
        self
    }

    pub fn on_warning(mut self, f: impl Fn(&TimeoutStatus) + Send + Sync + 'static) -> Self {
        self.on_warning = Some(Box::new(f));
        self
    }

    pub fn on_soft_timeout(mut self, f: impl Fn(&TimeoutStatus) + Send + Sync + 'static) -> Self {
        self.on_soft_timeout = Some(Box::new(f));
        self
    }

    pub fn on_hard_timeout(mut self, f: impl Fn(&TimeoutStatus) + Send + Sync + 'static) -> Self {
        self.on_hard_timeout = Some(Box::new(f));
        self
    }

    pub fn on_abort(mut self, f: impl Fn(&TimeoutStatus) + Send + Sync + 'static) -> Self {
        self.on_abort = Some(Box::new(f));
        self
    }

    fn for_stage(&self, stage: TimeoutStage) -> Option<&StatusHook> {
        match stage {
            TimeoutStage::Normal => None,
            TimeoutStage::Warning => self.on_warning.as_ref(),
            TimeoutStage::SoftTimeout => self.on_soft_timeout.as_ref(),
            TimeoutStage::HardTimeout => self.on_hard_timeout.as_ref(),
            TimeoutStage::Aborted => self.on_abort.as_ref(),
        }
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Periodic elapsed-time classifier with an owned abort signal.
///
/// Dropping the monitor stops its tick task.
pub struct TimeoutMonitor {
    shared: Arc<Shared>,
}

struct Shared {
    thresholds: TimeoutThresholds,
    tick_interval: Duration,
    hooks: TimeoutHooks,
    state: Mutex<MonitorState>,
}

struct MonitorState {
    started_at: Option<Instant>,
    stage: TimeoutStage,
    last_status: Option<TimeoutStatus>,
    /// Cancels the running tick task, if any.
    ticker: Option<CancellationToken>,
    signal: CancellationToken,
}

impl TimeoutMonitor {
    pub fn new(thresholds: TimeoutThresholds, hooks: TimeoutHooks) -> Self {
        Self::with_tick_interval(thresholds, hooks, DEFAULT_TICK_INTERVAL)
    }

    pub fn with_tick_interval(
        thresholds: TimeoutThresholds,
        hooks: TimeoutHooks,
        tick_interval: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                thresholds,
                tick_interval,
                hooks,
                state: Mutex::new(MonitorState {
                    started_at: None,
                    stage: TimeoutStage::Normal,
                    last_status: None,
                    ticker: None,
                    signal: CancellationToken::new(),
                }),
            }),
        }
    }

    /// Start (or restart) timing from now.
    ///
    /// Resets the stage to `normal`, replaces the abort signal with a fresh
    /// one, and spawns the tick task. Must be called inside a Tokio runtime.
    pub fn start(&self) {
        let ticker = CancellationToken::new();
        {
            let mut state = self.shared.lock();
            if let Some(previous) = state.ticker.take() {
                previous.cancel();
            }
            state.started_at = Some(Instant::now());
            state.stage = TimeoutStage::Normal;
            state.last_status = None;
            state.signal = CancellationToken::new();
            state.ticker = Some(ticker.clone());
        }

        let weak = Arc::downgrade(&self.shared);
        let interval = self.shared.tick_interval;
        tokio::spawn(run_ticker(weak, interval, ticker));
    }

    /// Stop ticking without signalling abort.
    pub fn stop(&self) {
        self.shared.stop_ticker();
    }

    /// Signal abort and stop ticking.
    pub fn abort(&self) {
        self.shared.abort();
    }

    /// Token cancelled when the monitor aborts. Pass it to guarded I/O.
    pub fn signal(&self) -> CancellationToken {
        self.shared.lock().signal.clone()
    }

    pub fn stage(&self) -> TimeoutStage {
        self.shared.lock().stage
    }

    /// Status computed by the most recent tick.
    pub fn status(&self) -> Option<TimeoutStatus> {
        self.shared.lock().last_status.clone()
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().ticker.is_some()
    }

    pub fn thresholds(&self) -> &TimeoutThresholds {
        &self.shared.thresholds
    }
}

impl Drop for TimeoutMonitor {
    fn drop(&mut self) {
        self.shared.stop_ticker();
    }
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stop_ticker(&self) {
        if let Some(ticker) = self.lock().ticker.take() {
            ticker.cancel();
        }
    }

    fn abort(&self) {
        let mut state = self.lock();
        state.signal.cancel();
        if let Some(ticker) = state.ticker.take() {
            ticker.cancel();
        }
    }

    /// Recompute the stage and fire hooks. Hooks run outside the lock,
    /// after an abort has already been applied.
    fn tick(&self, ticker: &CancellationToken) {
        let (status, entered) = {
            let mut state = self.lock();
            // A restart may have replaced this ticker between wake-up and lock.
            if ticker.is_cancelled() {
                return;
            }
            let Some(started_at) = state.started_at else {
                return;
            };
            let elapsed = started_at.elapsed();
            let previous = state.stage;
            let stage = next_stage(previous, elapsed, &self.thresholds);
            state.stage = stage;

            let status = TimeoutStatus::compute(stage, elapsed);
            state.last_status = Some(status.clone());

            let entered: Vec<TimeoutStage> = TimeoutStage::ALL
                .into_iter()
                .filter(|s| *s > previous && *s <= stage)
                .collect();

            // Abort under the same lock so a restart from a hook keeps its
            // fresh signal.
            if entered.contains(&TimeoutStage::Aborted) {
                state.signal.cancel();
                if let Some(ticker) = state.ticker.take() {
                    ticker.cancel();
                }
            }
            (status, entered)
        };

        if let Some(hook) = &self.hooks.on_status {
            hook(&status);
        }

        for stage in &entered {
            tracing::debug!(
                stage = ?stage,
                elapsed_secs = status.elapsed.as_secs(),
                "Timeout stage entered",
            );
            if let Some(hook) = self.hooks.for_stage(*stage) {
                hook(&status);
            }
        }

    }
}

async fn run_ticker(shared: Weak<Shared>, interval: Duration, ticker: CancellationToken) {
    let mut ticks = tokio::time::interval(interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.cancelled() => break,
            _ = ticks.tick() => {
                let Some(shared) = shared.upgrade() else { break };
                shared.tick(&ticker);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::OnceLock;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn stage_for_picks_highest_crossed_threshold() {
        let t = TimeoutThresholds::default();
        assert_eq!(stage_for(secs(0), &t), TimeoutStage::Normal);
        assert_eq!(stage_for(secs(29), &t), TimeoutStage::Normal);
        assert_eq!(stage_for(secs(30), &t), TimeoutStage::Warning);
        assert_eq!(stage_for(secs(60), &t), TimeoutStage::SoftTimeout);
        assert_eq!(stage_for(secs(119), &t), TimeoutStage::SoftTimeout);
        assert_eq!(stage_for(secs(120), &t), TimeoutStage::HardTimeout);
        assert_eq!(stage_for(secs(180), &t), TimeoutStage::Aborted);
        assert_eq!(stage_for(secs(10_000), &t), TimeoutStage::Aborted);
    }

    #[test]
    fn next_stage_never_regresses() {
        let t = TimeoutThresholds::default();
        assert_eq!(
            next_stage(TimeoutStage::HardTimeout, secs(5), &t),
            TimeoutStage::HardTimeout
        );
        assert_eq!(
            next_stage(TimeoutStage::Warning, secs(61), &t),
            TimeoutStage::SoftTimeout
        );
    }

    #[test]
    fn thresholds_must_increase() {
        assert!(TimeoutThresholds::default().validate().is_ok());
        let bad = TimeoutThresholds {
            soft: secs(30),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn aborted_status_requests_abort() {
        let status = TimeoutStatus::compute(TimeoutStage::Aborted, secs(181));
        assert!(status.should_abort);
        assert!(status.can_retry);
        assert!(status.message.contains("181s"));

        let status = TimeoutStatus::compute(TimeoutStage::Normal, secs(3));
        assert!(!status.should_abort);
        assert!(status.suggestion.is_none());
    }

    struct Counters {
        status: AtomicU32,
        warning: AtomicU32,
        soft: AtomicU32,
        hard: AtomicU32,
        abort: AtomicU32,
    }

    fn counting_monitor(thresholds: TimeoutThresholds) -> (TimeoutMonitor, Arc<Counters>) {
        let counters = Arc::new(Counters {
            status: AtomicU32::new(0),
            warning: AtomicU32::new(0),
            soft: AtomicU32::new(0),
            hard: AtomicU32::new(0),
            abort: AtomicU32::new(0),
        });
        let (c1, c2, c3, c4, c5) = (
            Arc::clone(&counters),
            Arc::clone(&counters),
            Arc::clone(&counters),
            Arc::clone(&counters),
            Arc::clone(&counters),
        );
        let hooks = TimeoutHooks::new()
            .on_status(move |_| {
                c1.status.fetch_add(1, Ordering::SeqCst);
            })
            .on_warning(move |_| {
                c2.warning.fetch_add(1, Ordering::SeqCst);
            })
            .on_soft_timeout(move |_| {
                c3.soft.fetch_add(1, Ordering::SeqCst);
            })
            .on_hard_timeout(move |_| {
                c4.hard.fetch_add(1, Ordering::SeqCst);
            })
            .on_abort(move |_| {
                c5.abort.fetch_add(1, Ordering::SeqCst);
            });
        (TimeoutMonitor::new(thresholds, hooks), counters)
    }

    fn snapshot(c: &Counters) -> (u32, u32, u32, u32) {
        (
            c.warning.load(Ordering::SeqCst),
            c.soft.load(Ordering::SeqCst),
            c.hard.load(Ordering::SeqCst),
            c.abort.load(Ordering::SeqCst),
        )
    }

    /// Sleep to `t` seconds (plus half a tick) after the monitor started.
    async fn advance_to(start: Instant, t: u64) {
        tokio::time::sleep_until(start + secs(t) + Duration::from_millis(500)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn stage_hooks_fire_once_at_each_threshold() {
        let (monitor, counters) = counting_monitor(TimeoutThresholds::default());
        let start = Instant::now();
        monitor.start();
        let signal = monitor.signal();

        advance_to(start, 29).await;
        assert_eq!(snapshot(&counters), (0, 0, 0, 0));
        assert_eq!(monitor.stage(), TimeoutStage::Normal);

        advance_to(start, 30).await;
        assert_eq!(snapshot(&counters), (1, 0, 0, 0));
        assert_eq!(monitor.stage(), TimeoutStage::Warning);

        advance_to(start, 59).await;
        assert_eq!(snapshot(&counters), (1, 0, 0, 0));

        advance_to(start, 60).await;
        assert_eq!(snapshot(&counters), (1, 1, 0, 0));

        advance_to(start, 120).await;
        assert_eq!(snapshot(&counters), (1, 1, 1, 0));
        assert!(!signal.is_cancelled());

        advance_to(start, 180).await;
        assert_eq!(snapshot(&counters), (1, 1, 1, 1));
        assert!(signal.is_cancelled());
        assert!(!monitor.is_running());

        let ticks_at_abort = counters.status.load(Ordering::SeqCst);
        assert_eq!(ticks_at_abort, 181);

        advance_to(start, 300).await;
        assert_eq!(snapshot(&counters), (1, 1, 1, 1));
        assert_eq!(counters.status.load(Ordering::SeqCst), ticks_at_abort);
        assert!(monitor.status().unwrap().should_abort);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_halts_ticks_without_abort() {
        let (monitor, counters) = counting_monitor(TimeoutThresholds::default());
        let start = Instant::now();
        monitor.start();

        advance_to(start, 10).await;
        monitor.stop();
        let ticks = counters.status.load(Ordering::SeqCst);

        advance_to(start, 200).await;
        assert_eq!(counters.status.load(Ordering::SeqCst), ticks);
        assert_eq!(snapshot(&counters), (0, 0, 0, 0));
        assert!(!monitor.signal().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_resets_stage_and_signal() {
        let thresholds = TimeoutThresholds {
            warning: secs(2),
            soft: secs(4),
            hard: secs(6),
            abort: secs(8),
        };
        let (monitor, counters) = counting_monitor(thresholds);
        let start = Instant::now();
        monitor.start();
        let first_signal = monitor.signal();

        advance_to(start, 9).await;
        assert!(first_signal.is_cancelled());
        assert_eq!(monitor.stage(), TimeoutStage::Aborted);

        let restart = Instant::now();
        monitor.start();
        assert_eq!(monitor.stage(), TimeoutStage::Normal);
        assert!(!monitor.signal().is_cancelled());

        advance_to(restart, 2).await;
        assert_eq!(monitor.stage(), TimeoutStage::Warning);
        assert_eq!(counters.warning.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_from_abort_hook_keeps_fresh_signal() {
        let thresholds = TimeoutThresholds {
            warning: secs(1),
            soft: secs(2),
            hard: secs(3),
            abort: secs(4),
        };
        let slot: Arc<OnceLock<Weak<TimeoutMonitor>>> = Arc::default();
        let restarts = Arc::new(AtomicU32::new(0));
        let hook_slot = Arc::clone(&slot);
        let hook_restarts = Arc::clone(&restarts);
        let hooks = TimeoutHooks::new().on_abort(move |_| {
            if hook_restarts.fetch_add(1, Ordering::SeqCst) == 0 {
                if let Some(monitor) = hook_slot.get().and_then(Weak::upgrade) {
                    monitor.start();
                }
            }
        });
        let monitor = Arc::new(TimeoutMonitor::new(thresholds, hooks));
        slot.set(Arc::downgrade(&monitor)).unwrap();

        let start = Instant::now();
        monitor.start();
        let first_signal = monitor.signal();

        advance_to(start, 4).await;
        assert_eq!(restarts.load(Ordering::SeqCst), 1);
        assert!(first_signal.is_cancelled());
        assert!(!monitor.signal().is_cancelled());
        assert!(monitor.is_running());
        assert_eq!(monitor.stage(), TimeoutStage::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_abort_cancels_signal() {
        let (monitor, _counters) = counting_monitor(TimeoutThresholds::default());
        monitor.start();
        let signal = monitor.signal();
        monitor.abort();
        assert!(signal.is_cancelled());
        assert!(!monitor.is_running());
    }
}
