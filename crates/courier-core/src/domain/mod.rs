//! Domain model (ids, records, status, payloads, outcomes, events).
//!
//! 永続化される JobRecord と、その状態遷移・分類に必要な型をまとめます。
//! ここにはストレージや実行の詳細を持ち込みません。

pub mod events;
pub mod ids;
pub mod label;
pub mod outcome;
pub mod payload;
pub mod record;
pub mod status;

pub use events::QueueEvent;
pub use ids::{JobRecordId, SortId};
pub use label::Label;
pub use outcome::{FailureKind, FailureReason, OperationError, OperationOutcome};
pub use payload::{JobPayload, MessageSendPayload, PayloadError, SessionResetPayload};
pub use record::{JobRecord, NewJobRecord};
pub use status::{JobStatus, TransitionError};
