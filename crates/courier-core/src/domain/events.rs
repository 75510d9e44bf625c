//! QueueEvent - 状態遷移の通知
//!
//! 状態遷移が永続化された後で、subscribe しているすべての受信者に broadcast されます。
//! 観測用であり、queue の動作はイベントの受信有無に依存しません。

use std::time::Duration;

use super::ids::JobRecordId;
use super::label::Label;
use super::outcome::FailureReason;

/// Every event is sent only after the transition it describes is durable.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// `setup()` finished its recovery scan.
    Recovered { label: Label, count: usize },

    /// The operation is about to run. `failure_count` is the count before this attempt.
    Dispatched { id: JobRecordId, failure_count: u32 },

    /// The operation succeeded and the record was deleted.
    Succeeded { id: JobRecordId },

    /// The record is `Running` with `failure_count` failures and waits `delay`.
    RetryScheduled {
        id: JobRecordId,
        failure_count: u32,
        delay: Duration,
    },

    PermanentlyFailed {
        id: JobRecordId,
        failure_count: u32,
        reason: FailureReason,
        error: String,
    },

    /// A transaction failed; nothing about this attempt was persisted.
    StorageFailed { id: JobRecordId, error: String },
}

impl QueueEvent {
    pub fn job_id(&self) -> Option<JobRecordId> {
        match self {
            QueueEvent::Recovered { .. } => None,
            QueueEvent::Dispatched { id, .. }
            | QueueEvent::Succeeded { id }
            | QueueEvent::RetryScheduled { id, .. }
            | QueueEvent::PermanentlyFailed { id, .. }
            | QueueEvent::StorageFailed { id, .. } => Some(*id),
        }
    }
}
