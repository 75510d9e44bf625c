use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use courier_core::app::QueueSetBuilder;
use courier_core::domain::{
    JobPayload, JobRecord, Label, NewJobRecord, OperationOutcome, QueueEvent,
};
use courier_core::impls::{InMemoryRecordStore, open_record_store};
use courier_core::migrate::import_legacy;
use courier_core::ports::{
    IdGenerator, Operation, RecordStore, RecordStoreExt, SystemClock, UlidGenerator,
};
use courier_core::{JobQueue, QueueConfig, QueueError, StoreConfig};

const MESSAGE_SENDER: &str = "MessageSender";
const SESSION_RESET: &str = "SessionReset";

/// FakeSender：送信のふりをする。最初の `flaky` 回は timeout で失敗
struct FakeSender {
    flaky: AtomicU32,
}

impl FakeSender {
    fn new(flaky: u32) -> Self {
        Self {
            flaky: AtomicU32::new(flaky),
        }
    }
}

#[async_trait]
impl Operation for FakeSender {
    async fn perform(&self, record: &JobRecord) -> OperationOutcome {
        let JobPayload::MessageSend(payload) = &record.payload else {
            return OperationOutcome::permanent("not a message send payload");
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        if self
            .flaky
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
        {
            return OperationOutcome::retryable("network timeout");
        }
        info!(
            job_id = %record.unique_id,
            message_id = ?payload.message_id,
            thread_id = ?payload.thread_id,
            "message sent"
        );
        OperationOutcome::success()
    }
}

struct SessionResetter;

#[async_trait]
impl Operation for SessionResetter {
    async fn perform(&self, record: &JobRecord) -> OperationOutcome {
        match &record.payload {
            JobPayload::SessionReset(payload) => {
                info!(contact_thread_id = %payload.contact_thread_id, "session reset");
                OperationOutcome::success()
            }
            _ => OperationOutcome::permanent("not a session reset payload"),
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// A legacy store holding one job that was never run.
fn legacy_store() -> anyhow::Result<InMemoryRecordStore> {
    let legacy = InMemoryRecordStore::new();
    let ids = UlidGenerator::new(SystemClock);
    legacy.write(|txn| {
        txn.insert(NewJobRecord::new(
            ids.generate_job_record_id(),
            Label::new(SESSION_RESET),
            JobPayload::session_reset("thread-legacy"),
        ))
    })?;
    Ok(legacy)
}

async fn wait_until_drained(
    store: &dyn RecordStore,
    events: &mut broadcast::Receiver<QueueEvent>,
) -> anyhow::Result<()> {
    loop {
        let outstanding = store
            .read(|txn| txn.fetch_all_records())?
            .iter()
            .filter(|r| r.status.is_runnable())
            .count();
        if outstanding == 0 {
            return Ok(());
        }
        // 他の label のイベントはここでは見えないので、ストアもポーリングする
        match tokio::time::timeout(Duration::from_millis(500), events.recv()).await {
            Ok(Ok(QueueEvent::PermanentlyFailed { id, error, .. })) => {
                warn!(job_id = %id, %error, "delivery failed");
            }
            Ok(Ok(event)) => info!(?event, "queue event"),
            Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                warn!(skipped = n, "events lagged")
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => return Ok(()),
            Err(_elapsed) => {}
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = QueueConfig::from_env();
    let store_config = StoreConfig::from_env();
    let store = open_record_store(&store_config).context("opening record store")?;

    // (A) legacy エンジンの record を一度だけ取り込む（2 回目以降は skip）
    let report = import_legacy(&legacy_store()?, store.as_ref()).context("legacy import")?;
    info!(records = report.records, skipped = report.skipped, "legacy import");

    // (B) label ごとに queue を作り、QueueSet に登録（不足は build() で検出）
    let sender = Arc::new(JobQueue::new(
        MESSAGE_SENDER,
        Arc::clone(&store),
        FakeSender::new(1),
        &config,
    )?);
    let resets = Arc::new(JobQueue::new(
        SESSION_RESET,
        Arc::clone(&store),
        SessionResetter,
        &config,
    )?);
    let queues = QueueSetBuilder::new()
        .register(Arc::clone(&sender))?
        .register(Arc::clone(&resets))?
        .expect_labels(&[MESSAGE_SENDER, SESSION_RESET])
        .build()?;

    // setup 前に subscribe しておけばイベントを取りこぼさない
    let mut events = sender.subscribe();

    // (C) メッセージ本体と job を同じ transaction で書く
    store.try_write(|txn| {
        for (i, body) in ["hello", "are you there?", "see you"].iter().enumerate() {
            let message_id = format!("m{}", i + 1);
            txn.put_document("messages", &message_id, &json!({ "body": body }))?;
            sender.add(JobPayload::persisted_message(message_id, "thread-1"), txn)?;
        }
        sender.add(
            JobPayload::invisible_message("thread-1", json!({ "kind": "read_receipt" })),
            txn,
        )?;
        Ok::<_, QueueError>(())
    })?;

    // (D) setup で recovery と配送が始まる。全件処理されるか Ctrl-C まで待つ
    queues.setup_all()?;

    tokio::select! {
        result = wait_until_drained(store.as_ref(), &mut events) => result?,
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    for counts in queues.counts()? {
        info!(
            label = %counts.label,
            ready = counts.ready,
            running = counts.running,
            permanently_failed = counts.permanently_failed,
            "final counts"
        );
    }
    // (E) 実行中の operation は中断せずに worker を止める
    queues.shutdown_all().await;
    Ok(())
}
