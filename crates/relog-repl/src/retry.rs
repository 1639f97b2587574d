//! Exponential backoff for replication retries.

use std::time::Duration;

use rand::Rng;

/// Configuration for retry pacing.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry (default: 100ms).
    pub initial_backoff: Duration,
    /// Longest delay ever returned, jitter included (default: 5 seconds).
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff (default: 2.0).
    pub backoff_multiplier: f64,
    /// Whether to add random jitter to backoff (default: true).
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Backoff state for one worker.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    attempt: u32,
}

impl Backoff {
    /// Start a fresh backoff sequence.
    pub fn new(config: RetryConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Return to the initial delay, e.g. after the follower recovered.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay to sleep before the next attempt.
    ///
    /// Computes `initial_backoff * backoff_multiplier^attempt`. With jitter
    /// enabled up to 50% of that is added. The result never exceeds `max_backoff`.
    pub fn next_delay(&mut self) -> Duration {
        let base_ms = self.config.initial_backoff.as_millis() as f64;
        let max_ms = self.config.max_backoff.as_millis() as u64;
        let computed = base_ms * self.config.backoff_multiplier.powi(self.attempt as i32);
        let delay_ms = computed.min(max_ms as f64) as u64;

        self.attempt = self.attempt.saturating_add(1);

        let jittered = if self.config.jitter && delay_ms > 1 {
            delay_ms.saturating_add(rand::thread_rng().gen_range(0..=delay_ms / 2))
        } else {
            delay_ms
        };
        Duration::from_millis(jittered.min(max_ms))
    }
}
