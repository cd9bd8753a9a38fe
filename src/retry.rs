//! Backoff policy for transient protocol failures.
//!
//! Retries are only safe for idempotent operations: reads and SSE
//! reconnects always, producer appends because they carry
//! Producer-Id/Epoch/Seq. Plain appends retry on transport and 5xx/429
//! failures only; deduplication there is the caller's problem.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with full jitter.
///
/// One policy bounds all three retry loops: transient append failures in
/// the stream handle, transient read failures in the consumer, and SSE
/// reconnect attempts. Whether an error is worth retrying at all is the
/// error's own call ([`StreamError::is_retryable`]); this type only paces
/// and bounds the attempts.
///
/// [`StreamError::is_retryable`]: crate::error::StreamError::is_retryable
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            max_retries: 8,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the delay before the first retry.
    pub fn initial_backoff(mut self, delay: Duration) -> Self {
        self.initial_backoff = delay;
        self
    }

    /// Cap the exponential growth.
    pub fn max_backoff(mut self, delay: Duration) -> Self {
        self.max_backoff = delay;
        self
    }

    /// Set the growth factor between attempts.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Bound the number of retries.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Whether retry number `attempt` (0-based) may still run.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Delay before retry number `attempt`: exponential growth capped at
    /// `max_backoff`, fully jittered so herds of reconnecting readers
    /// spread out instead of stampeding the server together.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let grown = self.initial_backoff.as_secs_f64() * self.multiplier.powi(attempt.min(32) as i32);
        let capped = grown.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(rand::thread_rng().gen::<f64>() * capped)
    }
}
