//! Automatic retry with exponential backoff and jitter.
//!
//! Retries transient upstream failures (429, 5xx, network errors and
//! timeouts) with configurable exponential backoff. Never retries 400 (bad
//! request) or 401 (auth) errors. Only the request itself is retried; a
//! stream that has already started delivering chunks is never replayed.

use std::time::Duration;

use crate::UpstreamError;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries (0 = no retries, just fail immediately).
    pub max_retries: u32,
    /// Initial delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Backoff multiplier (typically 2.0 for exponential backoff).
    pub multiplier: f64,
    /// Whether to add jitter to prevent thundering herd.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a config with the given number of retries. Uses sensible defaults.
    pub fn with_retries(retries: u32) -> Self {
        Self {
            max_retries: retries,
            ..Default::default()
        }
    }

    /// A config that never retries.
    pub fn disabled() -> Self {
        Self::with_retries(0)
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        if self.jitter {
            // Deterministic jitter keyed on the attempt number; no rand dependency.
            let jitter_factor = match attempt % 4 {
                0 => 0.75,
                1 => 0.90,
                2 => 0.60,
                3 => 0.85,
                _ => 0.80,
            };
            Duration::from_secs_f64(capped * jitter_factor)
        } else {
            Duration::from_secs_f64(capped)
        }
    }

    /// Whether another attempt is allowed after `attempt` failed with `error`.
    pub fn should_retry(&self, attempt: u32, error: &UpstreamError) -> bool {
        attempt < self.max_retries && is_transient(error)
    }
}

/// Whether an upstream failure is transient (worth retrying).
pub fn is_transient(error: &UpstreamError) -> bool {
    match error {
        UpstreamError::RateLimit(_) => true,
        UpstreamError::Api {
            status: Some(status),
            ..
        } => matches!(*status, 408 | 409 | 500 | 502 | 503 | 504),
        // Connect failures, timeouts, reset connections.
        UpstreamError::Api { status: None, .. } => true,
        UpstreamError::Authentication(_)
        | UpstreamError::BadRequest(_)
        | UpstreamError::Other(_) => false,
    }
}
