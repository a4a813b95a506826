//! Session client configuration surface

use super::store::OverflowStrategy;
use crate::error::{SessionError, SessionResult};
use crate::retry::{ExponentialBackoff, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;

/// Options fixed for the lifetime of a [`SessionClient`](super::SessionClient)
#[derive(Debug, Clone)]
pub struct SessionClientOptions {
    /// Capacity of the pending-request store (at least 1)
    pub max_pending_requests: usize,
    pub overflow_strategy: OverflowStrategy,
    /// Consulted after every failed reconnection attempt. Must permit retries.
    pub connection_retry_policy: Arc<dyn RetryPolicy>,
    /// Apply the retry policy to the initial connect as well
    pub retry_on_first_connect: bool,
    /// Upper bound for a single CONNECT/CONNACK exchange
    pub connection_attempt_timeout: Duration,
}

impl Default for SessionClientOptions {
    fn default() -> Self {
        Self {
            max_pending_requests: 1000,
            overflow_strategy: OverflowStrategy::DropOldest,
            connection_retry_policy: Arc::new(ExponentialBackoff::default()),
            retry_on_first_connect: false,
            connection_attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl SessionClientOptions {
    pub fn with_retry_policy<P: RetryPolicy + 'static>(mut self, policy: P) -> Self {
        self.connection_retry_policy = Arc::new(policy);
        self
    }

    pub fn with_max_pending(mut self, max: usize, strategy: OverflowStrategy) -> Self {
        self.max_pending_requests = max;
        self.overflow_strategy = strategy;
        self
    }

    pub fn validate(&self) -> SessionResult<()> {
        if self.max_pending_requests == 0 {
            return Err(SessionError::configuration(
                "max_pending_requests must be at least 1",
            ));
        }
        if self.connection_attempt_timeout.is_zero() {
            return Err(SessionError::configuration(
                "connection_attempt_timeout must be greater than zero",
            ));
        }
        if !self.connection_retry_policy.permits_retry() {
            return Err(SessionError::configuration(format!(
                "connection retry policy {:?} never retries; session recovery requires retries",
                self.connection_retry_policy
            )));
        }
        Ok(())
    }
}
