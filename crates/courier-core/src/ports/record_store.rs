//! RecordStore port - JobRecord の正本（source of truth）
//!
//! queue core はこの契約にだけ依存し、具体的なエンジンは知りません。
//! JobRecord の変更はすべて write transaction の中で行い、
//! status の変更をメモリ上だけで済ませることはありません。
//!
//! # トランザクション
//! - `read_with` / `write_with` は object-safe（`&mut dyn FnMut` を受け取る）
//! - 通常は値を返す `RecordStoreExt::read` / `write` を使う。
//!   `try_write` は block が呼び出し側のエラー型（例: `JobQueue::add` の
//!   `QueueError`）で失敗できる版
//! - block が `Ok` を返したときだけ commit される。`add_completion` で登録した
//!   callback は commit 成功後、store の lock の外で実行され、rollback 時は捨てられる

use crate::domain::{JobRecord, JobRecordId, JobStatus, Label, NewJobRecord};

/// write transaction の commit 後に一度だけ実行される callback
pub type Completion = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("job record not found: {0}")]
    NotFound(JobRecordId),

    #[error("duplicate job record: {0}")]
    Duplicate(JobRecordId),

    /// The block of a `try_write` returned its own error; the transaction was
    /// rolled back.
    #[error("transaction aborted by caller")]
    Aborted,
}

/// 呼び出し側が JobRecord と同じ transaction で書くドキュメント
/// （例: job が参照する送信メッセージ）。ドメインの書き込みと enqueue を
/// まとめて commit するために使う。
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub collection: String,
    pub key: String,
    pub value: serde_json::Value,
}

pub trait ReadTransaction {
    /// Fetch by `uniqueId`.
    fn fetch_record(&self, id: &JobRecordId) -> Result<Option<JobRecord>, StoreError>;

    /// Records of `label` whose status is in `statuses`, by ascending `sort_id`.
    fn fetch_all(
        &self,
        label: &Label,
        statuses: &[JobStatus],
    ) -> Result<Vec<JobRecord>, StoreError>;

    /// Every record of every label, by ascending `sort_id`.
    fn fetch_all_records(&self) -> Result<Vec<JobRecord>, StoreError>;

    fn get_document(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, StoreError>;

    /// Every document. Order is unspecified.
    fn documents(&self) -> Result<Vec<Document>, StoreError>;
}

pub trait WriteTransaction: ReadTransaction {
    /// Insert a record. The store assigns a `sort_id` greater than every
    /// `sort_id` it has assigned before.
    fn insert(&mut self, record: NewJobRecord) -> Result<JobRecord, StoreError>;

    /// Overwrite status and failure count of an existing record.
    /// `sort_id`, `label` and payload are never changed.
    fn update(&mut self, record: &JobRecord) -> Result<(), StoreError>;

    /// Delete a record. Deleting a missing record is not an error.
    fn delete(&mut self, id: &JobRecordId) -> Result<(), StoreError>;

    fn put_document(
        &mut self,
        collection: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), StoreError>;

    fn remove_document(&mut self, collection: &str, key: &str) -> Result<(), StoreError>;

    fn add_completion(&mut self, completion: Completion);
}

/// RecordStore はストレージエンジンの抽象
///
/// # 設計原則
/// - write transaction は実装側で直列化する
/// - `Send + Sync`: 複数 label の worker から共有される
pub trait RecordStore: Send + Sync {
    fn read_with(
        &self,
        block: &mut dyn FnMut(&dyn ReadTransaction) -> Result<(), StoreError>,
    ) -> Result<(), StoreError>;

    fn write_with(
        &self,
        block: &mut dyn FnMut(&mut dyn WriteTransaction) -> Result<(), StoreError>,
    ) -> Result<(), StoreError>;
}

/// Value-returning helpers on top of the object-safe `RecordStore` methods.
pub trait RecordStoreExt: RecordStore {
    fn read<R>(
        &self,
        block: impl FnOnce(&dyn ReadTransaction) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut block = Some(block);
        let mut out = None;
        self.read_with(&mut |txn| {
            if let Some(block) = block.take() {
                out = Some(block(txn)?);
            }
            Ok(())
        })?;
        out.ok_or_else(|| StoreError::Backend("read block was not invoked".to_string()))
    }

    fn write<R>(
        &self,
        block: impl FnOnce(&mut dyn WriteTransaction) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        self.try_write(block)
    }

    /// Like `write`, but the block may fail with the caller's own error type.
    /// Any `Err` from the block rolls the transaction back and is returned
    /// unchanged.
    fn try_write<R, E>(
        &self,
        block: impl FnOnce(&mut dyn WriteTransaction) -> Result<R, E>,
    ) -> Result<R, E>
    where
        E: From<StoreError>,
    {
        let mut block = Some(block);
        let mut out: Option<Result<R, E>> = None;
        let committed = self.write_with(&mut |txn| {
            let Some(block) = block.take() else {
                return Ok(());
            };
            match block(txn) {
                Ok(value) => {
                    out = Some(Ok(value));
                    Ok(())
                }
                Err(err) => {
                    out = Some(Err(err));
                    Err(StoreError::Aborted)
                }
            }
        });
        match (committed, out) {
            (Ok(()), Some(result)) => result,
            (Err(_), Some(Err(err))) => Err(err),
            (Err(err), _) => Err(err.into()),
            (Ok(()), None) => {
                Err(StoreError::Backend("write block was not invoked".to_string()).into())
            }
        }
    }
}

impl<S: RecordStore + ?Sized> RecordStoreExt for S {}
