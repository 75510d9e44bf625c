//! Impls - ストレージ実装
//!
//! このモジュールには RecordStore port の実装を含めます。
//!
//! # 含まれる実装
//! - **InMemoryRecordStore**: legacy key-value エンジン（プロセス内のみ）
//! - **SqliteRecordStore**: 現行エンジン。再起動をまたいで永続
//!
//! どちらを使うかは `StoreConfig::engine`（単一のランタイムフラグ）で決まります。

mod memory_store;
mod sqlite_store;

use std::sync::Arc;

pub use memory_store::InMemoryRecordStore;
pub use sqlite_store::SqliteRecordStore;

use crate::config::{StorageEngine, StoreConfig};
use crate::ports::{RecordStore, StoreError};

/// `config.engine` で選ばれたエンジンを開く
pub fn open_record_store(config: &StoreConfig) -> Result<Arc<dyn RecordStore>, StoreError> {
    let store: Arc<dyn RecordStore> = match config.engine {
        StorageEngine::KeyValue => Arc::new(InMemoryRecordStore::new()),
        StorageEngine::Sqlite => match &config.path {
            Some(path) => Arc::new(SqliteRecordStore::open(path)?),
            None => Arc::new(SqliteRecordStore::in_memory()?),
        },
    };
    tracing::debug!(engine = ?config.engine, path = ?config.path, "record store opened");
    Ok(store)
}
