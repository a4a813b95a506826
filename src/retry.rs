//! Retry policies consulted by the connection supervisor
//!
//! A policy only decides *whether* and *when* to try again. Fatal errors are
//! filtered out by the supervisor before a policy is ever asked.

use crate::error::TransportError;
use rand::Rng;
use std::fmt;
use std::time::Duration;

/// Outcome of consulting a [`RetryPolicy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this long, then attempt again.
    Retry(Duration),
    /// Give up.
    Stop,
}

/// Pluggable reconnection policy
pub trait RetryPolicy: Send + Sync + fmt::Debug {
    /// Called after the `attempt`-th consecutive failed connection attempt
    /// (starting at 1) with the error that attempt produced.
    fn should_retry(&self, attempt: u32, last_error: &TransportError) -> RetryDecision;

    /// Whether this policy can ever return [`RetryDecision::Retry`].
    fn permits_retry(&self) -> bool {
        true
    }
}

/// Exponential backoff with optional jitter
///
/// Attempt `n` waits `min_interval * 2^(n-1)`, clamped to `max_interval`.
/// With jitter the wait is scaled by a random factor in `[0.95, 1.05)`.
/// `max_attempts` counts every attempt, including the first one.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub max_attempts: Option<u32>,
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(128),
            max_interval: Duration::from_secs(30),
            max_attempts: None,
            jitter: true,
        }
    }
}

impl ExponentialBackoff {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_intervals(mut self, min_interval: Duration, max_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self.max_interval = max_interval;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before the attempt following failure `attempt`, before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.min_interval
            .checked_mul(factor)
            .unwrap_or(self.max_interval)
            .min(self.max_interval)
    }

    fn apply_jitter(delay: Duration) -> Duration {
        let factor = rand::thread_rng().gen_range(0.95..1.05);
        delay.mul_f64(factor)
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn should_retry(&self, attempt: u32, _last_error: &TransportError) -> RetryDecision {
        if self.max_attempts.is_some_and(|max| attempt >= max) {
            return RetryDecision::Stop;
        }
        let delay = self.base_delay(attempt);
        if self.jitter {
            RetryDecision::Retry(Self::apply_jitter(delay))
        } else {
            RetryDecision::Retry(delay)
        }
    }

    fn permits_retry(&self) -> bool {
        self.max_attempts.map_or(true, |max| max > 1)
    }
}

/// Explicit delay pattern followed by a sustained delay
///
/// Defaults to 25ms, 50ms, 100ms, 250ms and then 250ms forever.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternBackoff {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Delays in milliseconds for the first attempts
    pub backoff_pattern: Vec<u64>,
    /// Delay in milliseconds once the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for PatternBackoff {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![25, 50, 100, 250],
            sustained_delay: 250,
        }
    }
}

impl PatternBackoff {
    /// Delay in milliseconds after failure `attempt` (1-based).
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }

    /// Sum of every delay the policy can impose, or None when unlimited.
    pub fn calculate_max_total_time(&self) -> Option<u64> {
        self.max_attempts
            .map(|max| (1..max).map(|a| self.calculate_backoff_delay(a)).sum())
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == Some(0) {
            return Err("max_attempts must be greater than 0 or None for unlimited".to_string());
        }
        if self.sustained_delay == 0 {
            return Err("sustained_delay must be greater than 0".to_string());
        }
        Ok(())
    }
}

impl RetryPolicy for PatternBackoff {
    fn should_retry(&self, attempt: u32, _last_error: &TransportError) -> RetryDecision {
        if self.max_attempts.is_some_and(|max| attempt >= max) {
            return RetryDecision::Stop;
        }
        RetryDecision::Retry(Duration::from_millis(self.calculate_backoff_delay(attempt)))
    }

    fn permits_retry(&self) -> bool {
        self.max_attempts.map_or(true, |max| max > 1)
    }
}

/// Never retries. Rejected by the session client options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn should_retry(&self, _attempt: u32, _last_error: &TransportError) -> RetryDecision {
        RetryDecision::Stop
    }

    fn permits_retry(&self) -> bool {
        false
    }
}
