//! JobStatus - JobRecord のライフサイクル状態
//!
//! 成功は status ではなく record の削除で表現します。

use serde::{Deserialize, Serialize};

use super::ids::JobRecordId;

/// JobStatus は永続化される状態
///
/// # 状態遷移
/// - Ready → Running（dispatch）
/// - Running → （削除）成功時
/// - Running → Running 予算内の retryable failure（failure_count + 1）
/// - Running → PermanentlyFailed 予算切れ、または non-retryable failure
///
/// `PermanentlyFailed` は終端。診断用に残し、削除も復活もしない。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Ready,

    /// dispatch 済みで、結果がまだ永続化されていない。
    /// 起動時にこの状態で見つかった record は中断された実行として扱う。
    Running,

    PermanentlyFailed,
}

impl JobStatus {
    /// recovery が拾い、dispatch してよい状態
    pub const RUNNABLE: [JobStatus; 2] = [JobStatus::Ready, JobStatus::Running];

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::PermanentlyFailed)
    }

    pub fn is_runnable(self) -> bool {
        !self.is_terminal()
    }

    /// Integer column encoding.
    pub fn as_i64(self) -> i64 {
        match self {
            JobStatus::Ready => 1,
            JobStatus::Running => 2,
            JobStatus::PermanentlyFailed => 3,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(JobStatus::Ready),
            2 => Some(JobStatus::Running),
            3 => Some(JobStatus::PermanentlyFailed),
            _ => None,
        }
    }
}

/// 状態機械が許さない遷移を要求されたときのエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition for {id}: {from:?} cannot {step}")]
pub struct TransitionError {
    pub id: JobRecordId,
    pub from: JobStatus,
    pub step: &'static str,
}
