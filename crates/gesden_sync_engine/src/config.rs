//! Configuration for the sync engine.

use crate::error::{EngineError, EngineResult};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the bridge engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path of the durable operation journal.
    pub journal_path: PathBuf,
    /// Number of queue worker threads.
    pub worker_count: usize,
    /// Interval between change feed polls when the feed is healthy.
    pub poll_interval: Duration,
    /// Per-call timeout handed to the store clients.
    pub store_timeout: Duration,
    /// Retry behavior of the executor for transient apply failures.
    pub retry: RetryConfig,
    /// Backoff applied by a reader whose store is unreachable.
    pub reader_backoff: RetryConfig,
    /// Occurrences before a learned conflict pattern may auto-resolve.
    pub pattern_confidence_threshold: u32,
    /// Window within which an identical alert does not re-fire.
    pub alert_cooldown: Duration,
    /// Journal records accumulated before a compaction rewrite.
    pub journal_compact_threshold: usize,
}

impl EngineConfig {
    /// Creates a configuration with defaults for everything but the
    /// journal path.
    pub fn new(journal_path: impl Into<PathBuf>) -> Self {
        Self {
            journal_path: journal_path.into(),
            worker_count: 2,
            poll_interval: Duration::from_secs(2),
            store_timeout: Duration::from_secs(5),
            retry: RetryConfig::default(),
            reader_backoff: RetryConfig::new(u32::MAX)
                .with_initial_delay(Duration::from_secs(1))
                .with_max_delay(Duration::from_secs(30)),
            pattern_confidence_threshold: 3,
            alert_cooldown: Duration::from_secs(300),
            journal_compact_threshold: 10_000,
        }
    }

    /// Sets the number of worker threads.
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Sets the change feed poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the per-call store timeout.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Sets the executor retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the alert dedup cooldown.
    pub fn with_alert_cooldown(mut self, cooldown: Duration) -> Self {
        self.alert_cooldown = cooldown;
        self
    }

    /// Sets the journal compaction threshold.
    pub fn with_journal_compact_threshold(mut self, threshold: usize) -> Self {
        self.journal_compact_threshold = threshold;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] on the first invalid
    /// setting; startup must not proceed past this.
    pub fn validate(&self) -> EngineResult<()> {
        if self.journal_path.as_os_str().is_empty() {
            return Err(EngineError::Configuration("journal path is empty".into()));
        }
        if self.worker_count == 0 {
            return Err(EngineError::Configuration(
                "worker_count must be at least 1".into(),
            ));
        }
        if self.store_timeout.is_zero() {
            return Err(EngineError::Configuration(
                "store_timeout must be non-zero".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(EngineError::Configuration(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.journal_compact_threshold == 0 {
            return Err(EngineError::Configuration(
                "journal_compact_threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (first try included).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Calculates the delay before the given attempt (0-indexed; the
    /// first attempt has no delay).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1).min(32) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter
            let jitter = delay_secs * 0.25 * pseudo_jitter();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Simple time-derived jitter (no external RNG dependency).
fn pseudo_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builder() {
        let config = EngineConfig::new("/var/lib/gesden-sync/journal.jsonl")
            .with_worker_count(4)
            .with_store_timeout(Duration::from_secs(10));

        assert_eq!(config.worker_count, 4);
        assert_eq!(config.store_timeout, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_settings() {
        assert!(EngineConfig::new("").validate().is_err());
        assert!(EngineConfig::new("journal.jsonl")
            .with_worker_count(0)
            .validate()
            .is_err());
        assert!(EngineConfig::new("journal.jsonl")
            .with_store_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(EngineConfig::new("journal.jsonl")
            .with_retry(RetryConfig {
                max_attempts: 0,
                ..RetryConfig::default()
            })
            .validate()
            .is_err());
    }

    #[test]
    fn reader_backoff_defaults_match_contract() {
        // Base 1s, cap 30s per the change feed contract.
        let config = EngineConfig::new("journal.jsonl");
        assert_eq!(config.reader_backoff.initial_delay, Duration::from_secs(1));
        assert_eq!(config.reader_backoff.max_delay, Duration::from_secs(30));
        assert!(config.reader_backoff.add_jitter);
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0)
            .without_jitter();

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn retry_delay_respects_cap() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(30))
            .without_jitter();

        assert_eq!(config.delay_for_attempt(20), Duration::from_secs(30));
    }

    #[test]
    fn jittered_delay_stays_within_bounds() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        let delay = config.delay_for_attempt(1);
        assert!(delay >= Duration::from_millis(100));
        assert!(delay <= Duration::from_millis(125));
    }
}
