//! SqliteRecordStore - the current storage engine.
//!
//! `job_records.id` is an `AUTOINCREMENT` primary key, which makes it the
//! `sort_id`: strictly increasing and never reused, even after deletes.
//! The payload discriminator is stored in `record_type` next to `label`.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};

use crate::domain::{JobPayload, JobRecord, JobRecordId, JobStatus, Label, NewJobRecord, SortId};
use crate::ports::{
    Completion, Document, ReadTransaction, RecordStore, StoreError, WriteTransaction,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS job_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        unique_id TEXT NOT NULL UNIQUE,
        record_type TEXT NOT NULL,
        label TEXT NOT NULL,
        status INTEGER NOT NULL,
        failure_count INTEGER NOT NULL,
        payload TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS job_records_label_status
        ON job_records (label, status, id);
    CREATE TABLE IF NOT EXISTS documents (
        collection TEXT NOT NULL,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (collection, key)
    );
";

const RECORD_COLUMNS: &str = "id, unique_id, record_type, label, status, failure_count, payload";

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Raw row, decoded outside the rusqlite row callback so decode errors keep
/// their own `StoreError` variant.
struct RecordRow {
    id: i64,
    unique_id: String,
    record_type: String,
    label: String,
    status: i64,
    failure_count: i64,
    payload: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RecordRow> {
    Ok(RecordRow {
        id: row.get(0)?,
        unique_id: row.get(1)?,
        record_type: row.get(2)?,
        label: row.get(3)?,
        status: row.get(4)?,
        failure_count: row.get(5)?,
        payload: row.get(6)?,
    })
}

impl RecordRow {
    fn decode(self) -> Result<JobRecord, StoreError> {
        let unique_id: JobRecordId = self
            .unique_id
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("unique_id: {e}")))?;
        let status = JobStatus::from_i64(self.status)
            .ok_or_else(|| StoreError::Corrupt(format!("{unique_id}: status {}", self.status)))?;
        let sort_id = u64::try_from(self.id)
            .map_err(|_| StoreError::Corrupt(format!("{unique_id}: sort id {}", self.id)))?;
        let failure_count = u32::try_from(self.failure_count).map_err(|_| {
            StoreError::Corrupt(format!("{unique_id}: failure count {}", self.failure_count))
        })?;
        let payload: JobPayload = serde_json::from_str(&self.payload)?;
        // The column is what external queries see; it must agree with the tag.
        if payload.record_type() != self.record_type {
            return Err(StoreError::Corrupt(format!(
                "{unique_id}: record_type column '{}' but payload is '{}'",
                self.record_type,
                payload.record_type()
            )));
        }

        Ok(JobRecord {
            unique_id,
            sort_id: SortId::new(sort_id),
            label: Label::new(self.label),
            status,
            failure_count,
            payload,
        })
    }
}

fn collect_records(rows: Vec<RecordRow>) -> Result<Vec<JobRecord>, StoreError> {
    rows.into_iter().map(RecordRow::decode).collect()
}

// Shared by the read and write transactions; `rusqlite::Transaction` derefs
// to `Connection`.

fn fetch_record(conn: &Connection, id: &JobRecordId) -> Result<Option<JobRecord>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM job_records WHERE unique_id = ?1"),
            params![id.as_ulid().to_string()],
            read_row,
        )
        .optional()?;
    row.map(RecordRow::decode).transpose()
}

fn fetch_all(
    conn: &Connection,
    label: &Label,
    statuses: &[JobStatus],
) -> Result<Vec<JobRecord>, StoreError> {
    if statuses.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = (0..statuses.len())
        .map(|i| format!("?{}", i + 2))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM job_records
         WHERE label = ?1 AND status IN ({placeholders})
         ORDER BY id ASC"
    );

    let mut values: Vec<rusqlite::types::Value> = vec![label.as_str().to_string().into()];
    values.extend(statuses.iter().map(|s| s.as_i64().into()));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(values), read_row)?
        .collect::<Result<Vec<_>, _>>()?;
    collect_records(rows)
}

fn fetch_all_records(conn: &Connection) -> Result<Vec<JobRecord>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RECORD_COLUMNS} FROM job_records ORDER BY id ASC"
    ))?;
    let rows = stmt
        .query_map([], read_row)?
        .collect::<Result<Vec<_>, _>>()?;
    collect_records(rows)
}

fn get_document(
    conn: &Connection,
    collection: &str,
    key: &str,
) -> Result<Option<serde_json::Value>, StoreError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM documents WHERE collection = ?1 AND key = ?2",
            params![collection, key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(raw.map(|s| serde_json::from_str(&s)).transpose()?)
}

fn documents(conn: &Connection) -> Result<Vec<Document>, StoreError> {
    let mut stmt = conn.prepare("SELECT collection, key, value FROM documents")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(collection, key, value)| {
            Ok::<_, StoreError>(Document {
                collection,
                key,
                value: serde_json::from_str(&value)?,
            })
        })
        .collect()
}

struct SqliteReadTxn<'c> {
    conn: &'c Connection,
}

impl ReadTransaction for SqliteReadTxn<'_> {
    fn fetch_record(&self, id: &JobRecordId) -> Result<Option<JobRecord>, StoreError> {
        fetch_record(self.conn, id)
    }

    fn fetch_all(
        &self,
        label: &Label,
        statuses: &[JobStatus],
    ) -> Result<Vec<JobRecord>, StoreError> {
        fetch_all(self.conn, label, statuses)
    }

    fn fetch_all_records(&self) -> Result<Vec<JobRecord>, StoreError> {
        fetch_all_records(self.conn)
    }

    fn get_document(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        get_document(self.conn, collection, key)
    }

    fn documents(&self) -> Result<Vec<Document>, StoreError> {
        documents(self.conn)
    }
}

struct SqliteWriteTxn<'c> {
    tx: rusqlite::Transaction<'c>,
    completions: Vec<Completion>,
}

impl ReadTransaction for SqliteWriteTxn<'_> {
    fn fetch_record(&self, id: &JobRecordId) -> Result<Option<JobRecord>, StoreError> {
        fetch_record(&self.tx, id)
    }

    fn fetch_all(
        &self,
        label: &Label,
        statuses: &[JobStatus],
    ) -> Result<Vec<JobRecord>, StoreError> {
        fetch_all(&self.tx, label, statuses)
    }

    fn fetch_all_records(&self) -> Result<Vec<JobRecord>, StoreError> {
        fetch_all_records(&self.tx)
    }

    fn get_document(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        get_document(&self.tx, collection, key)
    }

    fn documents(&self) -> Result<Vec<Document>, StoreError> {
        documents(&self.tx)
    }
}

impl WriteTransaction for SqliteWriteTxn<'_> {
    fn insert(&mut self, record: NewJobRecord) -> Result<JobRecord, StoreError> {
        if fetch_record(&self.tx, &record.unique_id)?.is_some() {
            return Err(StoreError::Duplicate(record.unique_id));
        }
        let payload = serde_json::to_string(&record.payload)?;
        self.tx.execute(
            "INSERT INTO job_records (unique_id, record_type, label, status, failure_count, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.unique_id.as_ulid().to_string(),
                record.payload.record_type(),
                record.label.as_str(),
                record.status.as_i64(),
                i64::from(record.failure_count),
                payload,
            ],
        )?;
        let rowid = self.tx.last_insert_rowid();
        let sort_id = u64::try_from(rowid)
            .map_err(|_| StoreError::Corrupt(format!("negative rowid {rowid}")))?;
        Ok(record.with_sort_id(SortId::new(sort_id)))
    }

    fn update(&mut self, record: &JobRecord) -> Result<(), StoreError> {
        let changed = self.tx.execute(
            "UPDATE job_records SET status = ?1, failure_count = ?2 WHERE unique_id = ?3",
            params![
                record.status.as_i64(),
                i64::from(record.failure_count),
                record.unique_id.as_ulid().to_string(),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(record.unique_id));
        }
        Ok(())
    }

    fn delete(&mut self, id: &JobRecordId) -> Result<(), StoreError> {
        self.tx.execute(
            "DELETE FROM job_records WHERE unique_id = ?1",
            params![id.as_ulid().to_string()],
        )?;
        Ok(())
    }

    fn put_document(
        &mut self,
        collection: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), StoreError> {
        self.tx.execute(
            "INSERT INTO documents (collection, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT (collection, key) DO UPDATE SET value = excluded.value",
            params![collection, key, serde_json::to_string(value)?],
        )?;
        Ok(())
    }

    fn remove_document(&mut self, collection: &str, key: &str) -> Result<(), StoreError> {
        self.tx.execute(
            "DELETE FROM documents WHERE collection = ?1 AND key = ?2",
            params![collection, key],
        )?;
        Ok(())
    }

    fn add_completion(&mut self, completion: Completion) {
        self.completions.push(completion);
    }
}

pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::bootstrap(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("sqlite connection lock poisoned".to_string()))
    }
}

impl RecordStore for SqliteRecordStore {
    fn read_with(
        &self,
        block: &mut dyn FnMut(&dyn ReadTransaction) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        block(&SqliteReadTxn { conn: &conn })
    }

    fn write_with(
        &self,
        block: &mut dyn FnMut(&mut dyn WriteTransaction) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let completions = {
            let mut conn = self.lock()?;
            let mut txn = SqliteWriteTxn {
                tx: conn.transaction()?,
                completions: Vec::new(),
            };
            // Dropping `txn.tx` on error rolls back.
            block(&mut txn)?;
            let SqliteWriteTxn { tx, completions } = txn;
            tx.commit()?;
            completions
        };
        for completion in completions {
            completion();
        }
        Ok(())
    }
}
