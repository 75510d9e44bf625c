//! Operation port - JobRecord の背後にあるタスクを実行する

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{JobRecord, OperationOutcome};

/// Operation は 1 件の job を実行し、結果を分類して返す
///
/// # 契約
/// - 永続化はすべて queue の責務。Operation は JobRecord を書き換えず、
///   外部への作用（例: ネットワーク送信）だけを行う
/// - at-least-once: クラッシュ後に `Running` で見つかった record は再実行される。
///   重複実行に耐えること
/// - 理解できない payload は `OperationOutcome::PermanentFailure` で返す
/// - panic した場合は retryable な失敗として扱われる
#[async_trait]
pub trait Operation: Send + Sync + 'static {
    async fn perform(&self, record: &JobRecord) -> OperationOutcome;
}

#[async_trait]
impl<T: Operation + ?Sized> Operation for Arc<T> {
    async fn perform(&self, record: &JobRecord) -> OperationOutcome {
        (**self).perform(record).await
    }
}
