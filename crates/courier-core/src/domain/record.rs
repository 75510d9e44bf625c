//! Job record: the persisted unit of work.

use serde::{Deserialize, Serialize};

use super::ids::{JobRecordId, SortId};
use super::label::Label;
use super::payload::JobPayload;
use super::status::{JobStatus, TransitionError};

/// A job record as it exists in the store.
///
/// - The store is the single source of truth; queue structures hold ids only.
/// - All status transitions go through the methods below so the state
///   machine is enforced in one place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub unique_id: JobRecordId,
    pub sort_id: SortId,
    pub label: Label,
    pub status: JobStatus,
    pub failure_count: u32,
    pub payload: JobPayload,
}

/// A job record before insertion: everything except the store-assigned `sort_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJobRecord {
    pub unique_id: JobRecordId,
    pub label: Label,
    pub status: JobStatus,
    pub failure_count: u32,
    pub payload: JobPayload,
}

impl NewJobRecord {
    /// A fresh record: `Ready`, no failures.
    pub fn new(unique_id: JobRecordId, label: Label, payload: JobPayload) -> Self {
        Self {
            unique_id,
            label,
            status: JobStatus::Ready,
            failure_count: 0,
            payload,
        }
    }

    pub fn with_sort_id(self, sort_id: SortId) -> JobRecord {
        JobRecord {
            unique_id: self.unique_id,
            sort_id,
            label: self.label,
            status: self.status,
            failure_count: self.failure_count,
            payload: self.payload,
        }
    }
}

impl From<&JobRecord> for NewJobRecord {
    /// Used by migration: keeps identity and state, drops the old `sort_id`.
    fn from(record: &JobRecord) -> Self {
        Self {
            unique_id: record.unique_id,
            label: record.label.clone(),
            status: record.status,
            failure_count: record.failure_count,
            payload: record.payload.clone(),
        }
    }
}

impl JobRecord {
    fn illegal(&self, step: &'static str) -> TransitionError {
        TransitionError {
            id: self.unique_id,
            from: self.status,
            step,
        }
    }

    /// Ready -> Running. A Running record (retry or recovery) stays Running.
    pub fn start_dispatch(&mut self) -> Result<(), TransitionError> {
        match self.status {
            JobStatus::Ready | JobStatus::Running => {
                self.status = JobStatus::Running;
                Ok(())
            }
            JobStatus::PermanentlyFailed => Err(self.illegal("dispatch")),
        }
    }

    /// Running -> Running with one more failure.
    pub fn record_retryable_failure(&mut self) -> Result<(), TransitionError> {
        if self.status != JobStatus::Running {
            return Err(self.illegal("record a retryable failure"));
        }
        self.failure_count = self.failure_count.saturating_add(1);
        Ok(())
    }

    /// Running -> PermanentlyFailed. The failure that caused it is counted too.
    pub fn mark_permanently_failed(&mut self) -> Result<(), TransitionError> {
        if self.status != JobStatus::Running {
            return Err(self.illegal("fail permanently"));
        }
        self.failure_count = self.failure_count.saturating_add(1);
        self.status = JobStatus::PermanentlyFailed;
        Ok(())
    }

    /// Checks that the record may be deleted as succeeded.
    pub fn ensure_completable(&self) -> Result<(), TransitionError> {
        if self.status != JobStatus::Running {
            return Err(self.illegal("complete"));
        }
        Ok(())
    }
}
