//! Retry policy: decides between another attempt and permanent failure.

use std::time::Duration;

use crate::domain::{FailureKind, FailureReason};

/// What to do with a record after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Keep the record `Running` and dispatch it again after `delay`.
    ScheduleRetry { delay: Duration },

    FailPermanently { reason: FailureReason },

    /// Nothing was persisted; rerun the same step after `delay`.
    RetryStorage { delay: Duration },
}

/// Retry policy for failed records.
///
/// Exponential backoff capped at `max_delay`:
/// delay = base_delay * multiplier^(failures - 1)
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,

    pub multiplier: f64,

    pub max_delay: Duration,

    /// Retryable failures tolerated before the next one is final.
    pub max_retries: u32,
}

impl RetryPolicy {
    /// Delay before the next attempt, given the number of failures so far
    /// (1-indexed).
    ///
    /// Example with base_delay=1s, multiplier=2.0:
    /// - failure 1: 1s
    /// - failure 2: 2s
    /// - failure 3: 4s
    pub fn next_delay(&self, failures: u32) -> Duration {
        let exponent = i32::try_from(failures.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// `failure_count` is the persisted count before this failure.
    pub fn decide(&self, failure_count: u32, kind: FailureKind) -> RetryDecision {
        match kind {
            FailureKind::Permanent => RetryDecision::FailPermanently {
                reason: FailureReason::NonRetryable,
            },
            FailureKind::Retryable if failure_count >= self.max_retries => {
                RetryDecision::FailPermanently {
                    reason: FailureReason::RetryBudgetExhausted,
                }
            }
            FailureKind::Retryable => RetryDecision::ScheduleRetry {
                delay: self.next_delay(failure_count.saturating_add(1)),
            },
            // Storage failures are not counted and never exhaust the budget.
            FailureKind::Storage => RetryDecision::RetryStorage {
                delay: self.base_delay,
            },
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        crate::config::QueueConfig::default().retry_policy()
    }
}
