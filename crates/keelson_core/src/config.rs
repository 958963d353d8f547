//! Engine configuration.

use crate::error::{CoreError, CoreResult};
use rand::Rng;
use std::time::Duration;

/// Configuration for an [`Engine`](crate::Engine).
#[derive(Debug, Clone)]
pub struct Config {
    /// How often active transactions are re-stamped.
    pub keep_alive_interval: Duration,

    /// How long an active transaction may go without a renewal before
    /// readers treat it as rolled back.
    pub transaction_timeout: Duration,

    /// Number of keep-alive renewal workers.
    pub keep_alive_workers: usize,

    /// Maximum number of finished transactions kept in the cache.
    pub cache_capacity: usize,

    /// Maximum age of a cache entry before it is looked up again.
    pub cache_max_age: Duration,

    /// Capacity of the read-resolution queue. Submissions beyond it are dropped.
    pub resolver_queue_capacity: usize,

    /// Number of read-resolution workers.
    pub resolver_workers: usize,

    /// Retry policy for retryable write outcomes.
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(15),
            transaction_timeout: Duration::from_secs(60),
            keep_alive_workers: 2,
            cache_capacity: 8192,
            cache_max_age: Duration::from_secs(300),
            resolver_queue_capacity: 1024,
            resolver_workers: 1,
            retry: RetryConfig::default(),
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the keep-alive interval.
    #[must_use]
    pub const fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Sets the transaction timeout.
    #[must_use]
    pub const fn transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    /// Sets the number of keep-alive workers.
    #[must_use]
    pub const fn keep_alive_workers(mut self, workers: usize) -> Self {
        self.keep_alive_workers = workers;
        self
    }

    /// Sets the completed-transaction cache capacity.
    #[must_use]
    pub const fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Sets the maximum cache entry age.
    #[must_use]
    pub const fn cache_max_age(mut self, age: Duration) -> Self {
        self.cache_max_age = age;
        self
    }

    /// Sets the read-resolution queue capacity.
    #[must_use]
    pub const fn resolver_queue_capacity(mut self, capacity: usize) -> Self {
        self.resolver_queue_capacity = capacity;
        self
    }

    /// Sets the number of read-resolution workers.
    #[must_use]
    pub const fn resolver_workers(mut self, workers: usize) -> Self {
        self.resolver_workers = workers;
        self
    }

    /// Sets the write retry policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Checks the configuration for values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] describing the first problem.
    pub fn validate(&self) -> CoreResult<()> {
        if self.keep_alive_interval.is_zero() {
            return Err(CoreError::invalid_config("keep_alive_interval must be positive"));
        }
        if self.keep_alive_interval >= self.transaction_timeout {
            return Err(CoreError::invalid_config(format!(
                "keep_alive_interval ({:?}) must be shorter than transaction_timeout ({:?})",
                self.keep_alive_interval, self.transaction_timeout
            )));
        }
        if self.keep_alive_workers == 0 || self.resolver_workers == 0 {
            return Err(CoreError::invalid_config("worker pools need at least one thread"));
        }
        if self.resolver_queue_capacity == 0 {
            return Err(CoreError::invalid_config("resolver_queue_capacity must be positive"));
        }
        self.retry.validate()
    }
}

/// Retry policy for retryable write outcomes.
///
/// Delays grow exponentially from `initial_delay` and are capped at
/// `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay, before jitter.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% random jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a policy with `max_attempts` and default delays.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a policy that retries `max_attempts - 1` times without waiting.
    #[must_use]
    pub fn no_delay(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.add_jitter = jitter;
        self
    }

    /// Checks the policy for values a pipeline cannot retry with.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] if no attempt is allowed or the
    /// multiplier is below 1.0 or not finite.
    pub fn validate(&self) -> CoreResult<()> {
        if self.max_attempts == 0 {
            return Err(CoreError::invalid_config("retry.max_attempts must be at least 1"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(CoreError::invalid_config(format!(
                "retry.backoff_multiplier must be finite and at least 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        Ok(())
    }

    /// Returns the delay before `attempt` (0-indexed; attempt 0 never waits).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        // NaN and negative products collapse to no delay.
        let capped = base.max(0.0).min(self.max_delay.as_secs_f64());

        if self.add_jitter && capped > 0.0 {
            let jitter = capped * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(capped + jitter)
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Per-pipeline write options.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Route terminal row rejects to the bad-record sink instead of failing.
    pub permissive: bool,
    /// Bad records tolerated before the load fails; negative means unlimited.
    pub tolerance: i64,
    /// Source file name the bad-record sink is named after.
    pub source_name: Option<String>,
}

impl WriteOptions {
    /// Strict writes: the first terminal reject fails the operation.
    #[must_use]
    pub fn strict() -> Self {
        Self::default()
    }

    /// Permissive bulk load tolerating `tolerance` bad records from `source_name`.
    #[must_use]
    pub fn permissive(source_name: impl Into<String>, tolerance: i64) -> Self {
        Self {
            permissive: true,
            tolerance,
            source_name: Some(source_name.into()),
        }
    }
}
