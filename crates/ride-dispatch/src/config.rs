//! Dispatch configuration.
//!
//! Every field has a default; deployments override through JSON
//! (`serde`) or `RIDE_DISPATCH_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};
use crate::ride::Side;

const DEFAULT_ARBITER_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_STORE_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Store that owns newly requested rides.
    pub origin_side: Side,
    /// Upper bound on acceptance CAS attempts before answering `AlreadyTaken`.
    pub arbiter_max_attempts: u32,
    /// Per-call budget for foreground store calls.
    pub store_timeout_ms: u64,
    pub backoff: BackoffPolicy,
    pub worker: WorkerConfig,
    pub sweeper: SweeperConfig,
    pub matching: MatchingConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            origin_side: Side::Passenger,
            arbiter_max_attempts: DEFAULT_ARBITER_MAX_ATTEMPTS,
            store_timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
            backoff: BackoffPolicy::default(),
            worker: WorkerConfig::default(),
            sweeper: SweeperConfig::default(),
            matching: MatchingConfig::default(),
        }
    }
}

/// Exponential retry schedule for mirror propagation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub factor: u32,
    pub cap_ms: u64,
    /// Total attempts, including the first inline one.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            factor: 2,
            cap_ms: 30_000,
            max_attempts: 6,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retrying after failed attempt `attempt` (1-based).
    ///
    /// `min(base * factor^(attempt-1), cap)`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let multiplier = u64::from(self.factor).saturating_pow(exponent);
        Duration::from_millis(self.base_ms.saturating_mul(multiplier).min(self.cap_ms))
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Worst-case time from the first failure to the last retry.
    pub fn window(&self) -> Duration {
        (1..self.max_attempts).map(|n| self.delay_after(n)).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub poll_interval_ms: u64,
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            batch_size: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub interval_secs: u64,
    /// Trailing `updated_at` window scanned each pass.
    pub window_secs: u64,
    /// Minimum age of an origin write before a lagging mirror counts as diverged.
    pub grace_secs: u64,
    /// Rides loaded per page of the window scan. A pass pages until the
    /// window is exhausted.
    pub scan_page_size: usize,
    pub max_dead_letters_per_sweep: usize,
    /// Concurrent repairs within one pass.
    pub repair_concurrency: usize,
    /// Budget for an entire pass, separate from foreground timeouts.
    pub sweep_timeout_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            window_secs: 24 * 60 * 60,
            grace_secs: 30,
            scan_page_size: 500,
            max_dead_letters_per_sweep: 1_000,
            repair_concurrency: 8,
            sweep_timeout_secs: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub decline_ttl_secs: u64,
    pub max_candidates: usize,
    pub max_radius_m: f64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            decline_ttl_secs: 300,
            max_candidates: 20,
            max_radius_m: 50_000.0,
        }
    }
}

impl DispatchConfig {
    /// Defaults overlaid with `RIDE_DISPATCH_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but cannot be parsed, or if
    /// the resulting configuration fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(side) = env_string("RIDE_DISPATCH_ORIGIN_SIDE") {
            config.origin_side = match side.as_str() {
                "passenger" => Side::Passenger,
                "rider" => Side::Rider,
                other => {
                    return Err(DispatchError::InvalidRequest(format!(
                        "RIDE_DISPATCH_ORIGIN_SIDE must be passenger or rider, got {other}"
                    )))
                }
            };
        }
        if let Some(v) = env_parse("RIDE_DISPATCH_ARBITER_MAX_ATTEMPTS")? {
            config.arbiter_max_attempts = v;
        }
        if let Some(v) = env_parse("RIDE_DISPATCH_STORE_TIMEOUT_MS")? {
            config.store_timeout_ms = v;
        }
        if let Some(v) = env_parse("RIDE_DISPATCH_BACKOFF_BASE_MS")? {
            config.backoff.base_ms = v;
        }
        if let Some(v) = env_parse("RIDE_DISPATCH_BACKOFF_FACTOR")? {
            config.backoff.factor = v;
        }
        if let Some(v) = env_parse("RIDE_DISPATCH_BACKOFF_CAP_MS")? {
            config.backoff.cap_ms = v;
        }
        if let Some(v) = env_parse("RIDE_DISPATCH_BACKOFF_MAX_ATTEMPTS")? {
            config.backoff.max_attempts = v;
        }
        if let Some(v) = env_parse("RIDE_DISPATCH_WORKER_POLL_MS")? {
            config.worker.poll_interval_ms = v;
        }
        if let Some(v) = env_parse("RIDE_DISPATCH_WORKER_BATCH_SIZE")? {
            config.worker.batch_size = v;
        }
        if let Some(v) = env_parse("RIDE_DISPATCH_SWEEP_INTERVAL_SECS")? {
            config.sweeper.interval_secs = v;
        }
        if let Some(v) = env_parse("RIDE_DISPATCH_SWEEP_WINDOW_SECS")? {
            config.sweeper.window_secs = v;
        }
        if let Some(v) = env_parse("RIDE_DISPATCH_SWEEP_GRACE_SECS")? {
            config.sweeper.grace_secs = v;
        }
        if let Some(v) = env_parse("RIDE_DISPATCH_SWEEP_PAGE_SIZE")? {
            config.sweeper.scan_page_size = v;
        }
        if let Some(v) = env_parse("RIDE_DISPATCH_SWEEP_MAX_DEAD_LETTERS")? {
            config.sweeper.max_dead_letters_per_sweep = v;
        }
        if let Some(v) = env_parse("RIDE_DISPATCH_SWEEP_REPAIR_CONCURRENCY")? {
            config.sweeper.repair_concurrency = v;
        }
        if let Some(v) = env_parse("RIDE_DISPATCH_SWEEP_TIMEOUT_SECS")? {
            config.sweeper.sweep_timeout_secs = v;
        }
        if let Some(v) = env_parse("RIDE_DISPATCH_DECLINE_TTL_SECS")? {
            config.matching.decline_ttl_secs = v;
        }
        if let Some(v) = env_parse("RIDE_DISPATCH_MAX_CANDIDATES")? {
            config.matching.max_candidates = v;
        }
        if let Some(v) = env_parse("RIDE_DISPATCH_MAX_RADIUS_M")? {
            config.matching.max_radius_m = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would break the retry or sweep bounds.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::InvalidRequest`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(DispatchError::InvalidRequest(msg.to_string()));

        if self.arbiter_max_attempts == 0 {
            return invalid("arbiter_max_attempts must be at least 1");
        }
        if self.store_timeout_ms == 0 {
            return invalid("store_timeout_ms must be positive");
        }
        if self.backoff.max_attempts == 0 {
            return invalid("backoff.max_attempts must be at least 1");
        }
        if self.backoff.factor == 0 || self.backoff.base_ms > self.backoff.cap_ms {
            return invalid("backoff requires factor >= 1 and base_ms <= cap_ms");
        }
        if self.sweeper.interval_secs == 0 || self.sweeper.window_secs == 0 {
            return invalid("sweeper interval and window must be positive");
        }
        if self.sweeper.sweep_timeout_secs == 0 || self.sweeper.repair_concurrency == 0 {
            return invalid("sweeper timeout and concurrency must be positive");
        }
        if self.sweeper.scan_page_size == 0 || self.sweeper.max_dead_letters_per_sweep == 0 {
            return invalid("sweeper page size and dead letter batch must be positive");
        }
        if self.worker.batch_size == 0 || self.worker.poll_interval_ms == 0 {
            return invalid("worker batch size and poll interval must be positive");
        }
        if self.matching.max_radius_m.is_nan() || self.matching.max_radius_m <= 0.0 {
            return invalid("matching.max_radius_m must be positive");
        }
        if self.matching.max_candidates == 0 {
            return invalid("matching.max_candidates must be at least 1");
        }
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.window_secs).unwrap_or(i64::MAX))
    }

    pub fn grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.grace_secs).unwrap_or(i64::MAX))
    }

    pub fn sweep_timeout(&self) -> Duration {
        Duration::from_secs(self.sweep_timeout_secs)
    }
}

impl MatchingConfig {
    pub fn decline_ttl(&self) -> Duration {
        Duration::from_secs(self.decline_ttl_secs)
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse()
        .map(Some)
        .map_err(|e| DispatchError::InvalidRequest(format!("{name}={v}: {e}")))
}
