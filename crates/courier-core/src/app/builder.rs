//! QueueSetBuilder - 複数 label の queue の構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - `Arc<dyn ManagedQueue>` による Operation 型の消去

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::domain::{JobRecordId, Label, QueueEvent};
use crate::error::QueueError;
use crate::observability::QueueCounts;
use crate::ports::Operation;
use crate::queue::JobQueue;

/// ManagedQueue は Operation の型に依存しない JobQueue の object-safe なビュー
#[async_trait]
pub trait ManagedQueue: Send + Sync {
    fn label(&self) -> &Label;
    fn setup(&self) -> Result<(), QueueError>;
    fn run_any_queued_retry(&self) -> Option<JobRecordId>;
    fn next_retry_deadline(&self) -> Option<Instant>;
    fn counts(&self) -> Result<QueueCounts, QueueError>;
    fn subscribe(&self) -> broadcast::Receiver<QueueEvent>;
    async fn shutdown(&self);
}

#[async_trait]
impl<O: Operation> ManagedQueue for JobQueue<O> {
    fn label(&self) -> &Label {
        JobQueue::label(self)
    }

    fn setup(&self) -> Result<(), QueueError> {
        JobQueue::setup(self)
    }

    fn run_any_queued_retry(&self) -> Option<JobRecordId> {
        JobQueue::run_any_queued_retry(self)
    }

    fn next_retry_deadline(&self) -> Option<Instant> {
        JobQueue::next_retry_deadline(self)
    }

    fn counts(&self) -> Result<QueueCounts, QueueError> {
        JobQueue::counts(self)
    }

    fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        JobQueue::subscribe(self)
    }

    async fn shutdown(&self) {
        JobQueue::shutdown(self).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("a queue for label '{0}' is already registered")]
    DuplicateLabel(Label),

    #[error("missing queues for labels: {0:?}")]
    MissingLabels(Vec<String>),
}

/// QueueSetBuilder は QueueSet を構築
///
/// # 使用例
/// ```ignore
/// let queues = QueueSetBuilder::new()
///     .register(Arc::clone(&sender))?
///     .register(Arc::clone(&session_reset))?
///     .expect_labels(&["MessageSender", "SessionReset"])
///     .build()?;
/// queues.setup_all()?;
/// ```
///
/// # Fail-fast 設計
/// - 同じ label の二重登録は `BuildError::DuplicateLabel`
/// - expect_labels() で期待される label を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェックし、不足があれば BuildError
#[derive(Default)]
pub struct QueueSetBuilder {
    queues: BTreeMap<Label, Arc<dyn ManagedQueue>>,
    expected_labels: Option<Vec<String>>,
}

impl QueueSetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// queue を登録。`add()` を呼ぶために呼び出し側も自分の `Arc` を保持する
    pub fn register<O: Operation>(mut self, queue: Arc<JobQueue<O>>) -> Result<Self, BuildError> {
        let label = JobQueue::label(&queue).clone();
        if self.queues.contains_key(&label) {
            return Err(BuildError::DuplicateLabel(label));
        }
        self.queues.insert(label, queue);
        Ok(self)
    }

    pub fn expect_labels(mut self, labels: &[&str]) -> Self {
        self.expected_labels = Some(labels.iter().map(|l| l.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<QueueSet, BuildError> {
        if let Some(expected) = &self.expected_labels {
            let missing: Vec<String> = expected
                .iter()
                .filter(|l| !self.queues.contains_key(&Label::new(l.as_str())))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingLabels(missing));
            }
        }
        Ok(QueueSet {
            queues: self.queues,
        })
    }
}

/// 登録済みの queue（label ごとに 1 つ）
pub struct QueueSet {
    queues: BTreeMap<Label, Arc<dyn ManagedQueue>>,
}

impl QueueSet {
    pub fn labels(&self) -> impl Iterator<Item = &Label> {
        self.queues.keys()
    }

    pub fn get(&self, label: &str) -> Option<&Arc<dyn ManagedQueue>> {
        self.queues.get(&Label::new(label))
    }

    /// Sets up every queue, in label order. Stops at the first error.
    pub fn setup_all(&self) -> Result<(), QueueError> {
        for queue in self.queues.values() {
            queue.setup()?;
        }
        Ok(())
    }

    /// Forces the retry with the earliest deadline across all labels.
    pub fn run_any_queued_retry(&self) -> Option<(Label, JobRecordId)> {
        let queue = self
            .queues
            .values()
            .filter_map(|q| q.next_retry_deadline().map(|deadline| (deadline, q)))
            .min_by_key(|(deadline, _)| *deadline)
            .map(|(_, q)| q)?;
        let id = queue.run_any_queued_retry()?;
        Some((queue.label().clone(), id))
    }

    pub fn counts(&self) -> Result<Vec<QueueCounts>, QueueError> {
        self.queues.values().map(|q| q.counts()).collect()
    }

    pub async fn shutdown_all(&self) {
        for queue in self.queues.values() {
            queue.shutdown().await;
        }
    }
}
