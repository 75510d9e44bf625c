//! courier-core
//!
//! Durable, crash-recoverable job queue. label ごとの FIFO 配送、
//! at-least-once 実行、上限付きの backoff retry を提供します。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, label, status, record, payload, outcome, events）
//! - **ports**: 抽象化レイヤー（RecordStore, Operation, Clock, IdGenerator）
//! - **impls**: ストレージ実装（legacy key-value, sqlite）
//! - **queue**: JobQueue 本体（RetryPolicy, RetrySchedule）
//! - **app**: 複数 label のワイヤリング（QueueSetBuilder / QueueSet）
//! - **migrate**: legacy → sqlite の一回限りの取り込み
//! - **config**, **error**, **observability**

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod migrate;
pub mod observability;
pub mod ports;
pub mod queue;

pub use config::{QueueConfig, StorageEngine, StoreConfig};
pub use error::QueueError;
pub use queue::JobQueue;
