//! Ports - 抽象化レイヤー
//!
//! queue core と外部の協調者の境界を trait として定義します。
//! core はこれらの trait にだけ依存し、具体的な実装は知りません。
//!
//! # 設計原則
//! - RecordStore が source of truth（正本）
//! - Operation はタスクの実行だけを担当し、JobRecord には触れない
//! - Clock / IdGenerator はテストで差し替え可能

pub mod clock;
pub mod id_generator;
pub mod operation;
pub mod record_store;

// 主要な trait を再エクスポート
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::operation::Operation;
pub use self::record_store::{
    Completion, Document, ReadTransaction, RecordStore, RecordStoreExt, StoreError,
    WriteTransaction,
};
