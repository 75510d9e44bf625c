//! InMemoryRecordStore - legacy key-value エンジン
//!
//! # 設計
//! - record は `SortId` をキーにした `BTreeMap` に置くので、列挙は常に挿入順
//! - write transaction は lock の中で状態を直接変更し、変更ごとに undo を記録する。
//!   commit されなかった transaction は巻き戻されるので all-or-nothing になる。
//!   コストは transaction が触れた分だけ（ストア全体のコピーはしない）
//! - プロセスが終われば何も残らない。永続化が必要なら sqlite エンジンを使う

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::domain::{JobRecord, JobRecordId, JobStatus, Label, NewJobRecord, SortId};
use crate::ports::{
    Completion, Document, ReadTransaction, RecordStore, StoreError, WriteTransaction,
};

#[derive(Debug, Default)]
struct MemoryState {
    records: BTreeMap<SortId, JobRecord>,
    by_unique_id: HashMap<JobRecordId, SortId>,
    documents: HashMap<(String, String), serde_json::Value>,
    last_sort_id: u64,
}

impl ReadTransaction for MemoryState {
    fn fetch_record(&self, id: &JobRecordId) -> Result<Option<JobRecord>, StoreError> {
        Ok(self
            .by_unique_id
            .get(id)
            .and_then(|sort_id| self.records.get(sort_id))
            .cloned())
    }

    fn fetch_all(
        &self,
        label: &Label,
        statuses: &[JobStatus],
    ) -> Result<Vec<JobRecord>, StoreError> {
        Ok(self
            .records
            .values()
            .filter(|r| &r.label == label && statuses.contains(&r.status))
            .cloned()
            .collect())
    }

    fn fetch_all_records(&self) -> Result<Vec<JobRecord>, StoreError> {
        Ok(self.records.values().cloned().collect())
    }

    fn get_document(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self
            .documents
            .get(&(collection.to_string(), key.to_string()))
            .cloned())
    }

    fn documents(&self) -> Result<Vec<Document>, StoreError> {
        Ok(self
            .documents
            .iter()
            .map(|((collection, key), value)| Document {
                collection: collection.clone(),
                key: key.clone(),
                value: value.clone(),
            })
            .collect())
    }
}

/// Inverse of one applied change.
enum Undo {
    Inserted(SortId),
    /// An update or delete: put this record back under its `sort_id`.
    Replaced(JobRecord),
    Document((String, String), Option<serde_json::Value>),
}

/// Applies changes in place and keeps an undo log. Dropped without
/// `commit()`, e.g. on an `Err` from the block or a panic, it replays the
/// log backwards.
struct MemoryWriteTxn<'s> {
    state: &'s mut MemoryState,
    undo: Vec<Undo>,
    completions: Vec<Completion>,
    committed: bool,
}

impl<'s> MemoryWriteTxn<'s> {
    fn new(state: &'s mut MemoryState) -> Self {
        Self {
            state,
            undo: Vec::new(),
            completions: Vec::new(),
            committed: false,
        }
    }

    fn commit(mut self) -> Vec<Completion> {
        self.committed = true;
        std::mem::take(&mut self.completions)
    }
}

impl Drop for MemoryWriteTxn<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        // `last_sort_id` is left alone: sort ids are never handed out twice.
        while let Some(undo) = self.undo.pop() {
            match undo {
                Undo::Inserted(sort_id) => {
                    if let Some(record) = self.state.records.remove(&sort_id) {
                        self.state.by_unique_id.remove(&record.unique_id);
                    }
                }
                Undo::Replaced(record) => {
                    self.state.by_unique_id.insert(record.unique_id, record.sort_id);
                    self.state.records.insert(record.sort_id, record);
                }
                Undo::Document(key, Some(value)) => {
                    self.state.documents.insert(key, value);
                }
                Undo::Document(key, None) => {
                    self.state.documents.remove(&key);
                }
            }
        }
    }
}

impl ReadTransaction for MemoryWriteTxn<'_> {
    fn fetch_record(&self, id: &JobRecordId) -> Result<Option<JobRecord>, StoreError> {
        self.state.fetch_record(id)
    }

    fn fetch_all(
        &self,
        label: &Label,
        statuses: &[JobStatus],
    ) -> Result<Vec<JobRecord>, StoreError> {
        self.state.fetch_all(label, statuses)
    }

    fn fetch_all_records(&self) -> Result<Vec<JobRecord>, StoreError> {
        self.state.fetch_all_records()
    }

    fn get_document(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        self.state.get_document(collection, key)
    }

    fn documents(&self) -> Result<Vec<Document>, StoreError> {
        self.state.documents()
    }
}

impl WriteTransaction for MemoryWriteTxn<'_> {
    fn insert(&mut self, record: NewJobRecord) -> Result<JobRecord, StoreError> {
        if self.state.by_unique_id.contains_key(&record.unique_id) {
            return Err(StoreError::Duplicate(record.unique_id));
        }
        self.state.last_sort_id += 1;
        let sort_id = SortId::new(self.state.last_sort_id);
        let record = record.with_sort_id(sort_id);
        self.state.by_unique_id.insert(record.unique_id, sort_id);
        self.state.records.insert(sort_id, record.clone());
        self.undo.push(Undo::Inserted(sort_id));
        Ok(record)
    }

    fn update(&mut self, record: &JobRecord) -> Result<(), StoreError> {
        let sort_id = *self
            .state
            .by_unique_id
            .get(&record.unique_id)
            .ok_or(StoreError::NotFound(record.unique_id))?;
        let stored = self
            .state
            .records
            .get_mut(&sort_id)
            .ok_or(StoreError::NotFound(record.unique_id))?;
        let previous = stored.clone();
        stored.status = record.status;
        stored.failure_count = record.failure_count;
        self.undo.push(Undo::Replaced(previous));
        Ok(())
    }

    fn delete(&mut self, id: &JobRecordId) -> Result<(), StoreError> {
        if let Some(sort_id) = self.state.by_unique_id.remove(id) {
            if let Some(record) = self.state.records.remove(&sort_id) {
                self.undo.push(Undo::Replaced(record));
            }
        }
        Ok(())
    }

    fn put_document(
        &mut self,
        collection: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let key = (collection.to_string(), key.to_string());
        let previous = self.state.documents.insert(key.clone(), value.clone());
        self.undo.push(Undo::Document(key, previous));
        Ok(())
    }

    fn remove_document(&mut self, collection: &str, key: &str) -> Result<(), StoreError> {
        let key = (collection.to_string(), key.to_string());
        if let Some(previous) = self.state.documents.remove(&key) {
            self.undo.push(Undo::Document(key, Some(previous)));
        }
        Ok(())
    }

    fn add_completion(&mut self, completion: Completion) {
        self.completions.push(completion);
    }
}

#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    state: Mutex<MemoryState>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A panicking block has already been rolled back by the time the lock
    /// is poisoned, so the state behind it is consistent.
    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RecordStore for InMemoryRecordStore {
    fn read_with(
        &self,
        block: &mut dyn FnMut(&dyn ReadTransaction) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let state = self.lock();
        block(&*state)
    }

    fn write_with(
        &self,
        block: &mut dyn FnMut(&mut dyn WriteTransaction) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let completions = {
            let mut state = self.lock();
            let mut txn = MemoryWriteTxn::new(&mut state);
            block(&mut txn)?;
            txn.commit()
        };
        for completion in completions {
            completion();
        }
        Ok(())
    }
}
