//! Outcome of one operation attempt, as reported by the operation runner.
//!
//! The queue never inspects task-specific error details: it only sees which
//! of the three outcomes occurred and, for failures, a message for logs and
//! diagnostics.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient (timeout, rate limiting). Retried within budget.
    Retryable,

    /// The task can never succeed (invalid input, revoked permission).
    Permanent,

    /// A store transaction could not commit. Retried without counting.
    Storage,
}

/// Error reported by an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    message: String,
}

impl OperationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for OperationError {}

/// Why a record ended up `PermanentlyFailed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NonRetryable,

    /// A retryable failure arrived after `max_retries` was reached.
    RetryBudgetExhausted,
}

/// Exactly one of these is reported per attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    Success,
    RetryableFailure(OperationError),
    PermanentFailure(OperationError),
}

impl OperationOutcome {
    pub fn success() -> Self {
        OperationOutcome::Success
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        OperationOutcome::RetryableFailure(OperationError::new(message))
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        OperationOutcome::PermanentFailure(OperationError::new(message))
    }

    /// `None` for success.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            OperationOutcome::Success => None,
            OperationOutcome::RetryableFailure(_) => Some(FailureKind::Retryable),
            OperationOutcome::PermanentFailure(_) => Some(FailureKind::Permanent),
        }
    }

    pub fn error(&self) -> Option<&OperationError> {
        match self {
            OperationOutcome::Success => None,
            OperationOutcome::RetryableFailure(e) | OperationOutcome::PermanentFailure(e) => {
                Some(e)
            }
        }
    }
}
