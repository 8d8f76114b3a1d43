use std::str::FromStr;
use std::time::Duration;

use genq_core::error::CoreError;
use genq_core::retry::RetryConfig;
use genq_core::timeout::TimeoutThresholds;
use genq_store::AdmissionConfig;

use crate::delivery::DeliveryConfig;

/// Default ceiling for `wait_for` callers such as the CLI.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Every tunable of the orchestration layer.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub retry: RetryConfig,
    pub admission: AdmissionConfig,
    pub delivery: DeliveryConfig,
    pub timeouts: TimeoutThresholds,
    /// Hard client-side ceiling for `wait_for`.
    pub wait_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            admission: AdmissionConfig::default(),
            delivery: DeliveryConfig::default(),
            timeouts: TimeoutThresholds::default(),
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                      | Default  |
    /// |------------------------------|----------|
    /// | `GENQ_RETRY_MAX_RETRIES`     | `3`      |
    /// | `GENQ_RETRY_BASE_DELAY_MS`   | `1000`   |
    /// | `GENQ_RETRY_MAX_DELAY_MS`    | `10000`  |
    /// | `GENQ_MAX_ACTIVE_JOBS`       | `3`      |
    /// | `GENQ_MAX_ATTEMPTS`          | `3`      |
    /// | `GENQ_POLL_INTERVAL_MS`      | `5000`   |
    /// | `GENQ_TIMEOUT_WARNING_SECS`  | `30`     |
    /// | `GENQ_TIMEOUT_SOFT_SECS`     | `60`     |
    /// | `GENQ_TIMEOUT_HARD_SECS`     | `120`    |
    /// | `GENQ_TIMEOUT_ABORT_SECS`    | `180`    |
    /// | `GENQ_WAIT_TIMEOUT_SECS`     | `300`    |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading values through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CoreError> {
        let defaults = Self::default();

        let retry = RetryConfig {
            max_retries: read(&lookup, "GENQ_RETRY_MAX_RETRIES", defaults.retry.max_retries)?,
            base_delay: read_millis(&lookup, "GENQ_RETRY_BASE_DELAY_MS", defaults.retry.base_delay)?,
            max_delay: read_millis(&lookup, "GENQ_RETRY_MAX_DELAY_MS", defaults.retry.max_delay)?,
        };
        retry.validate()?;

        let admission = AdmissionConfig {
            max_active_jobs: read(
                &lookup,
                "GENQ_MAX_ACTIVE_JOBS",
                defaults.admission.max_active_jobs,
            )?,
            max_attempts: read(&lookup, "GENQ_MAX_ATTEMPTS", defaults.admission.max_attempts)?,
        };
        if admission.max_active_jobs < 1 {
            return Err(CoreError::Validation(
                "GENQ_MAX_ACTIVE_JOBS must be at least 1".to_string(),
            ));
        }

        let delivery = DeliveryConfig {
            poll_interval: read_millis(
                &lookup,
                "GENQ_POLL_INTERVAL_MS",
                defaults.delivery.poll_interval,
            )?,
        };
        if delivery.poll_interval.is_zero() {
            return Err(CoreError::Validation(
                "GENQ_POLL_INTERVAL_MS must be positive".to_string(),
            ));
        }

        let timeouts = TimeoutThresholds {
            warning: read_secs(&lookup, "GENQ_TIMEOUT_WARNING_SECS", defaults.timeouts.warning)?,
            soft: read_secs(&lookup, "GENQ_TIMEOUT_SOFT_SECS", defaults.timeouts.soft)?,
            hard: read_secs(&lookup, "GENQ_TIMEOUT_HARD_SECS", defaults.timeouts.hard)?,
            abort: read_secs(&lookup, "GENQ_TIMEOUT_ABORT_SECS", defaults.timeouts.abort)?,
        };
        timeouts.validate()?;

        let wait_timeout = read_secs(&lookup, "GENQ_WAIT_TIMEOUT_SECS", defaults.wait_timeout)?;

        Ok(Self {
            retry,
            admission,
            delivery,
            timeouts,
            wait_timeout,
        })
    }
}

fn read<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, CoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| CoreError::Validation(format!("{key} is invalid ({raw:?}): {e}"))),
    }
}

fn read_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, CoreError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    read(lookup, key, default_ms).map(Duration::from_millis)
}

fn read_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, CoreError> {
    read(lookup, key, default.as_secs()).map(Duration::from_secs)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
