//! App - 複数 label の queue のワイヤリング
//!
//! - **QueueSetBuilder**: 登録と起動時検証（Fail-fast 設計）
//! - **QueueSet**: label 横断の setup / 強制 retry / counts / shutdown

pub mod builder;

pub use self::builder::{BuildError, ManagedQueue, QueueSet, QueueSetBuilder};
