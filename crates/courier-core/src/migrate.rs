//! One-shot import from the legacy key-value engine into the current engine.
//!
//! Job records are copied in ascending legacy `sort_id`, so the target
//! assigns new `sort_id`s in the same relative order and every label keeps its
//! FIFO order. Documents carry no order and are copied as enumerated. The
//! whole import is one target write transaction ending with a marker
//! document; a second run finds the marker and does nothing.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::NewJobRecord;
use crate::ports::{RecordStore, RecordStoreExt, StoreError};

pub const MARKER_COLLECTION: &str = "courier.migrations";
pub const MARKER_KEY: &str = "legacy_import";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub records: usize,
    pub documents: usize,
    /// The marker was already present; nothing was copied.
    pub skipped: bool,
}

pub fn import_legacy(
    legacy: &dyn RecordStore,
    target: &dyn RecordStore,
) -> Result<MigrationReport, StoreError> {
    if target
        .read(|txn| txn.get_document(MARKER_COLLECTION, MARKER_KEY))?
        .is_some()
    {
        info!("legacy import already done, skipping");
        return Ok(MigrationReport {
            skipped: true,
            ..MigrationReport::default()
        });
    }

    let (records, documents) =
        legacy.read(|txn| Ok((txn.fetch_all_records()?, txn.documents()?)))?;

    let report = target.write(|txn| {
        // The marker is checked again under the write lock.
        if txn.get_document(MARKER_COLLECTION, MARKER_KEY)?.is_some() {
            return Ok(MigrationReport {
                skipped: true,
                ..MigrationReport::default()
            });
        }
        for record in &records {
            txn.insert(NewJobRecord::from(record))?;
        }
        for doc in &documents {
            txn.put_document(&doc.collection, &doc.key, &doc.value)?;
        }
        let report = MigrationReport {
            records: records.len(),
            documents: documents.len(),
            skipped: false,
        };
        txn.put_document(
            MARKER_COLLECTION,
            MARKER_KEY,
            &serde_json::to_value(&report)?,
        )?;
        Ok(report)
    })?;

    info!(
        records = report.records,
        documents = report.documents,
        skipped = report.skipped,
        "legacy import finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobPayload, JobRecord, JobRecordId, JobStatus, Label};
    use crate::impls::{InMemoryRecordStore, SqliteRecordStore};
    use serde_json::json;
    use ulid::Ulid;

    fn ids(records: &[JobRecord]) -> Vec<JobRecordId> {
        records.iter().map(|r| r.unique_id).collect()
    }

    fn new_record(label: &str, payload: JobPayload) -> NewJobRecord {
        NewJobRecord::new(JobRecordId::from_ulid(Ulid::new()), Label::new(label), payload)
    }

    fn seeded_legacy() -> InMemoryRecordStore {
        let legacy = InMemoryRecordStore::new();
        legacy
            .write(|txn| {
                let message = |id: &str| JobPayload::persisted_message(id, "t1");
                txn.insert(new_record("MessageSender", message("m1")))?;
                let gap = txn.insert(new_record("MessageSender", message("m2")))?;
                txn.insert(new_record("SessionReset", JobPayload::session_reset("t2")))?;
                let mut m3 = txn.insert(new_record("MessageSender", message("m3")))?;
                txn.delete(&gap.unique_id)?;

                m3.status = JobStatus::Running;
                m3.failure_count = 4;
                txn.update(&m3)?;
                txn.put_document("messages", "m1", &json!({ "body": "hello" }))?;
                txn.put_document("threads", "t1", &json!({ "title": "friends" }))?;
                Ok(())
            })
            .unwrap();
        legacy
    }

    #[test]
    fn copies_records_in_order_with_state() {
        let legacy = seeded_legacy();
        let target = SqliteRecordStore::in_memory().unwrap();

        let report = import_legacy(&legacy, &target).unwrap();
        assert_eq!(
            report,
            MigrationReport {
                records: 3,
                documents: 2,
                skipped: false
            }
        );

        let before = legacy.read(|txn| txn.fetch_all_records()).unwrap();
        let after = target.read(|txn| txn.fetch_all_records()).unwrap();
        assert_eq!(ids(&before), ids(&after));

        let m3 = after.last().unwrap();
        assert_eq!(m3.status, JobStatus::Running);
        assert_eq!(m3.failure_count, 4);
        assert_eq!(m3.payload, JobPayload::persisted_message("m3", "t1"));

        let doc = target.read(|txn| txn.get_document("threads", "t1")).unwrap();
        assert_eq!(doc, Some(json!({ "title": "friends" })));
    }

    #[test]
    fn second_run_is_skipped() {
        let legacy = seeded_legacy();
        let target = SqliteRecordStore::in_memory().unwrap();

        import_legacy(&legacy, &target).unwrap();
        let again = import_legacy(&legacy, &target).unwrap();

        assert!(again.skipped);
        let after = target.read(|txn| txn.fetch_all_records()).unwrap();
        assert_eq!(after.len(), 3);
    }

    #[test]
    fn empty_legacy_store_still_writes_marker() {
        let legacy = InMemoryRecordStore::new();
        let target = InMemoryRecordStore::new();

        let report = import_legacy(&legacy, &target).unwrap();
        assert_eq!(report.records, 0);
        let marker = target
            .read(|txn| txn.get_document(MARKER_COLLECTION, MARKER_KEY))
            .unwrap();
        assert!(marker.is_some());
    }
}
