use std::time::Duration;

use crate::error::HandlerError;
use crate::types::Message;

/// What to do with a message after a handler failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-invoke the handler in place, same unit of work, no requeue
    RetryNow,

    /// Schedule redelivery after the given interval via the delayed-delivery
    /// scheduler
    Delay(Duration),

    /// No further attempts; the message is exhausted and must be
    /// dead-lettered
    Discontinue,
}

/// Policy invoked on handler failure. Pure with respect to queue state: it
/// only computes a decision; the receive strategy executes it.
///
/// `attempts` counts failed processing attempts for the message, across
/// redeliveries and in-process retries alike.
pub trait RetryPolicy: Send + Sync {
    fn on_failure(&self, message: &Message, attempts: u32, error: &HandlerError) -> RetryDecision;
}

/// Never retry; every failure dead-letters immediately
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetryPolicy;

impl RetryPolicy for NoRetryPolicy {
    fn on_failure(&self, _message: &Message, _attempts: u32, _error: &HandlerError) -> RetryDecision {
        RetryDecision::Discontinue
    }
}

/// Retry in place up to a budget, then dead-letter
#[derive(Debug, Clone, Copy)]
pub struct ImmediateRetryPolicy {
    /// Total attempt budget, including the first
    pub max_attempts: u32,
}

impl Default for ImmediateRetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

impl RetryPolicy for ImmediateRetryPolicy {
    fn on_failure(&self, _message: &Message, attempts: u32, _error: &HandlerError) -> RetryDecision {
        if attempts >= self.max_attempts {
            RetryDecision::Discontinue
        } else {
            RetryDecision::RetryNow
        }
    }
}

/// Linearly backed-off redelivery up to a budget, then dead-letter
#[derive(Debug, Clone, Copy)]
pub struct DelayedRetryPolicy {
    /// Total attempt budget, including the first
    pub max_attempts: u32,

    /// Delay for the first redelivery; attempt n waits `base_delay * n`
    pub base_delay: Duration,
}

impl Default for DelayedRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy for DelayedRetryPolicy {
    fn on_failure(&self, _message: &Message, attempts: u32, _error: &HandlerError) -> RetryDecision {
        if attempts >= self.max_attempts {
            RetryDecision::Discontinue
        } else {
            RetryDecision::Delay(self.base_delay * attempts)
        }
    }
}
