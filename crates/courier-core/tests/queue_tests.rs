mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    FlakyStore, HookAt, HookedStore, PanicsOn, Scripted, enqueue, labelled_queue, manual_retries,
    message, sender_queue, wait_for, wait_succeeded,
};
use courier_core::app::QueueSetBuilder;
use courier_core::domain::{FailureReason, JobStatus, OperationOutcome, QueueEvent};
use courier_core::impls::InMemoryRecordStore;
use courier_core::ports::{RecordStore, RecordStoreExt};
use courier_core::{QueueConfig, QueueError};
use rstest::rstest;

fn memory_store() -> Arc<dyn RecordStore> {
    Arc::new(InMemoryRecordStore::new())
}

#[tokio::test]
async fn dispatches_in_enqueue_order() {
    let store = memory_store();
    let op = Scripted::new();
    let queue = sender_queue(&store, Arc::clone(&op), &QueueConfig::default());
    let mut events = queue.subscribe();

    enqueue(store.as_ref(), &queue, &["m1", "m2", "m3"]);
    queue.setup().unwrap();
    wait_succeeded(&mut events, 3).await;

    assert_eq!(op.log(), vec!["m1", "m2", "m3"]);
    assert_eq!(queue.counts().unwrap().outstanding(), 0);
    queue.shutdown().await;
}

#[tokio::test]
async fn retry_then_success_deletes_the_record() {
    let store = memory_store();
    let op = Scripted::new();
    op.script("m4", [OperationOutcome::retryable("timeout")]);
    let queue = sender_queue(&store, Arc::clone(&op), &manual_retries(30));
    let mut events = queue.subscribe();

    let m4 = enqueue(store.as_ref(), &queue, &["m4"]).remove(0);
    queue.setup().unwrap();

    let scheduled = wait_for(&mut events, |e| matches!(e, QueueEvent::RetryScheduled { .. })).await;
    assert_eq!(
        scheduled,
        QueueEvent::RetryScheduled {
            id: m4.unique_id,
            failure_count: 1,
            delay: Duration::from_secs(3600),
        }
    );
    assert_eq!(queue.run_any_queued_retry(), Some(m4.unique_id));
    wait_succeeded(&mut events, 1).await;

    assert_eq!(op.log(), vec!["m4", "m4"]);
    let stored = store.read(|txn| txn.fetch_record(&m4.unique_id)).unwrap();
    assert!(stored.is_none());
    queue.shutdown().await;
}

#[tokio::test]
async fn nothing_is_dispatched_before_setup() {
    let store = memory_store();
    let op = Scripted::new();
    let queue = sender_queue(&store, Arc::clone(&op), &QueueConfig::default());
    let mut events = queue.subscribe();

    let m1 = enqueue(store.as_ref(), &queue, &["m1"]).remove(0);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(op.log().is_empty());
    let stored = store.read(|txn| txn.fetch_record(&m1.unique_id)).unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Ready);

    queue.setup().unwrap();
    wait_succeeded(&mut events, 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(op.log(), vec!["m1"]);
    queue.shutdown().await;
}

#[tokio::test]
async fn retry_budget_ends_in_permanent_failure() {
    let store = memory_store();
    let op = Scripted::new();
    op.script("m1", (0..10).map(|_| OperationOutcome::retryable("rate limited")));
    let queue = sender_queue(&store, Arc::clone(&op), &manual_retries(3));
    let mut events = queue.subscribe();

    let m1 = enqueue(store.as_ref(), &queue, &["m1"]).remove(0);
    queue.setup().unwrap();

    for expected in 1..=3 {
        let event = wait_for(&mut events, |e| matches!(e, QueueEvent::RetryScheduled { .. })).await;
        assert!(matches!(event, QueueEvent::RetryScheduled { failure_count, .. } if failure_count == expected));

        let stored = store.read(|txn| txn.fetch_record(&m1.unique_id)).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Running);
        assert_eq!(stored.failure_count, expected);

        assert_eq!(queue.run_any_queued_retry(), Some(m1.unique_id));
    }

    let failed = wait_for(&mut events, |e| matches!(e, QueueEvent::PermanentlyFailed { .. })).await;
    assert!(matches!(
        failed,
        QueueEvent::PermanentlyFailed {
            failure_count: 4,
            reason: FailureReason::RetryBudgetExhausted,
            ..
        }
    ));

    let stored = store.read(|txn| txn.fetch_record(&m1.unique_id)).unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::PermanentlyFailed);
    assert_eq!(stored.failure_count, 4);

    assert_eq!(queue.run_any_queued_retry(), None);
    assert_eq!(queue.run_any_queued_retry(), None);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(op.log().len(), 4);

    let diagnostics = queue.permanently_failed().unwrap();
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].unique_id, m1.unique_id);
    queue.shutdown().await;
}

#[tokio::test]
async fn non_retryable_failure_is_final_and_unblocks_the_label() {
    let store = memory_store();
    let op = Scripted::new();
    op.script("m1", [OperationOutcome::permanent("recipient unregistered")]);
    let queue = sender_queue(&store, Arc::clone(&op), &manual_retries(30));
    let mut events = queue.subscribe();

    let records = enqueue(store.as_ref(), &queue, &["m1", "m2"]);
    queue.setup().unwrap();

    let failed = wait_for(&mut events, |e| matches!(e, QueueEvent::PermanentlyFailed { .. })).await;
    assert_eq!(
        failed,
        QueueEvent::PermanentlyFailed {
            id: records[0].unique_id,
            failure_count: 1,
            reason: FailureReason::NonRetryable,
            error: "recipient unregistered".to_string(),
        }
    );
    wait_succeeded(&mut events, 1).await;

    assert_eq!(op.log(), vec!["m1", "m2"]);
    let counts = queue.counts().unwrap();
    assert_eq!(counts.permanently_failed, 1);
    assert_eq!(counts.outstanding(), 0);
    queue.shutdown().await;
}

#[tokio::test]
async fn storage_failure_at_dispatch_is_not_counted() {
    let flaky = Arc::new(FlakyStore::default());
    let store: Arc<dyn RecordStore> = flaky.clone();
    let op = Scripted::new();
    let queue = sender_queue(&store, Arc::clone(&op), &manual_retries(30));
    let mut events = queue.subscribe();

    let m1 = enqueue(store.as_ref(), &queue, &["m1"]).remove(0);
    flaky.fail_writes(0, 1);
    queue.setup().unwrap();

    let failed = wait_for(&mut events, |e| matches!(e, QueueEvent::StorageFailed { .. })).await;
    assert_eq!(failed.job_id(), Some(m1.unique_id));
    assert!(op.log().is_empty());

    assert_eq!(queue.run_any_queued_retry(), Some(m1.unique_id));
    let dispatched = wait_for(&mut events, |e| matches!(e, QueueEvent::Dispatched { .. })).await;
    assert_eq!(
        dispatched,
        QueueEvent::Dispatched {
            id: m1.unique_id,
            failure_count: 0
        }
    );
    wait_succeeded(&mut events, 1).await;
    assert_eq!(op.log(), vec!["m1"]);
    queue.shutdown().await;
}

#[tokio::test]
async fn storage_failure_recording_an_outcome_keeps_the_count() {
    let flaky = Arc::new(FlakyStore::default());
    let store: Arc<dyn RecordStore> = flaky.clone();
    let op = Scripted::new();
    op.script("m1", [OperationOutcome::retryable("timeout")]);
    let queue = sender_queue(&store, Arc::clone(&op), &manual_retries(30));
    let mut events = queue.subscribe();

    let m1 = enqueue(store.as_ref(), &queue, &["m1"]).remove(0);
    // The dispatch write succeeds, the failure write does not.
    flaky.fail_writes(1, 1);
    queue.setup().unwrap();

    wait_for(&mut events, |e| matches!(e, QueueEvent::StorageFailed { .. })).await;
    let stored = store.read(|txn| txn.fetch_record(&m1.unique_id)).unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Running);
    assert_eq!(stored.failure_count, 0);

    assert_eq!(queue.run_any_queued_retry(), Some(m1.unique_id));
    wait_succeeded(&mut events, 1).await;
    assert_eq!(op.log(), vec!["m1", "m1"]);
    queue.shutdown().await;
}

#[tokio::test]
async fn labels_are_independent() {
    let store = memory_store();
    let op_a = Scripted::new();
    op_a.script("a1", [OperationOutcome::retryable("timeout")]);
    let op_b = Scripted::new();

    let a = Arc::new(labelled_queue("A", &store, Arc::clone(&op_a), &manual_retries(30)));
    let b = Arc::new(labelled_queue("B", &store, Arc::clone(&op_b), &manual_retries(30)));
    let queues = QueueSetBuilder::new()
        .register(Arc::clone(&a))
        .unwrap()
        .register(Arc::clone(&b))
        .unwrap()
        .build()
        .unwrap();
    let mut events_a = a.subscribe();
    let mut events_b = b.subscribe();

    let a_records = enqueue(store.as_ref(), &a, &["a1", "a2"]);
    enqueue(store.as_ref(), &b, &["b1", "b2"]);
    queues.setup_all().unwrap();

    wait_for(&mut events_a, |e| matches!(e, QueueEvent::RetryScheduled { .. })).await;
    wait_succeeded(&mut events_b, 2).await;

    // a1 waits on its backoff, so a2 has not run; B drained regardless.
    assert_eq!(op_a.log(), vec!["a1"]);
    assert_eq!(op_b.log(), vec!["b1", "b2"]);

    let (label, id) = queues.run_any_queued_retry().unwrap();
    assert_eq!(label.as_str(), "A");
    assert_eq!(id, a_records[0].unique_id);
    wait_succeeded(&mut events_a, 2).await;
    assert_eq!(op_a.log(), vec!["a1", "a1", "a2"]);
    queues.shutdown_all().await;
}

#[tokio::test]
async fn rolled_back_enqueue_leaves_nothing_behind() {
    let store = memory_store();
    let op = Scripted::new();
    let queue = sender_queue(&store, Arc::clone(&op), &QueueConfig::default());
    let mut events = queue.subscribe();

    let result: Result<(), QueueError> = store.try_write(|txn| {
        txn.put_document("messages", "m1", &serde_json::json!({ "body": "hi" }))?;
        queue.add(message("m1"), txn)?;
        Err(QueueError::Config("caller gave up".to_string()))
    });
    assert!(matches!(result, Err(QueueError::Config(_))));

    queue.setup().unwrap();
    let recovered = wait_for(&mut events, |e| matches!(e, QueueEvent::Recovered { .. })).await;
    assert!(matches!(recovered, QueueEvent::Recovered { count: 0, .. }));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(op.log().is_empty());
    let doc = store.read(|txn| txn.get_document("messages", "m1")).unwrap();
    assert!(doc.is_none());
    queue.shutdown().await;
}

#[tokio::test]
async fn records_added_after_setup_follow_recovered_ones() {
    let store = memory_store();
    let op = Scripted::new();
    let queue = sender_queue(&store, Arc::clone(&op), &QueueConfig::default());
    let mut events = queue.subscribe();

    enqueue(store.as_ref(), &queue, &["m1", "m2"]);
    queue.setup().unwrap();
    enqueue(store.as_ref(), &queue, &["m3"]);
    enqueue(store.as_ref(), &queue, &["m4"]);
    wait_succeeded(&mut events, 4).await;

    assert_eq!(op.log(), vec!["m1", "m2", "m3", "m4"]);
    queue.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn retries_back_off_exponentially_on_the_timer() {
    let store = memory_store();
    let op = Scripted::new();
    op.script(
        "m1",
        [
            OperationOutcome::retryable("timeout"),
            OperationOutcome::retryable("timeout"),
        ],
    );
    let config = QueueConfig {
        base_delay_ms: 1_000,
        multiplier: 2.0,
        max_delay_ms: 60_000,
        ..QueueConfig::default()
    };
    let queue = sender_queue(&store, Arc::clone(&op), &config);
    let mut events = queue.subscribe();

    enqueue(store.as_ref(), &queue, &["m1"]);
    let started = tokio::time::Instant::now();
    queue.setup().unwrap();

    let mut delays = Vec::new();
    for _ in 0..2 {
        if let QueueEvent::RetryScheduled { delay, .. } =
            wait_for(&mut events, |e| matches!(e, QueueEvent::RetryScheduled { .. })).await
        {
            delays.push(delay);
        }
    }
    wait_succeeded(&mut events, 1).await;

    assert_eq!(delays, vec![Duration::from_secs(1), Duration::from_secs(2)]);
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(op.log(), vec!["m1", "m1", "m1"]);
    queue.shutdown().await;
}

#[tokio::test]
async fn shutdown_leaves_pending_retry_running_in_store() {
    let store = memory_store();
    let op = Scripted::new();
    op.script("m1", [OperationOutcome::retryable("timeout")]);
    let queue = sender_queue(&store, Arc::clone(&op), &manual_retries(30));
    let mut events = queue.subscribe();

    let m1 = enqueue(store.as_ref(), &queue, &["m1"]).remove(0);
    queue.setup().unwrap();
    wait_for(&mut events, |e| matches!(e, QueueEvent::RetryScheduled { .. })).await;
    queue.shutdown().await;

    let stored = store.read(|txn| txn.fetch_record(&m1.unique_id)).unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Running);
    assert_eq!(stored.failure_count, 1);

    let restarted = sender_queue(&store, Arc::clone(&op), &manual_retries(30));
    let mut events = restarted.subscribe();
    restarted.setup().unwrap();
    wait_succeeded(&mut events, 1).await;
    assert_eq!(op.log(), vec!["m1", "m1"]);
    restarted.shutdown().await;
}

#[rstest]
#[case::committed_before_the_scan(HookAt::BeforeRead, 3)]
#[case::committed_after_the_scan(HookAt::AfterRead, 2)]
#[tokio::test]
async fn add_racing_the_recovery_scan_runs_after_recovered_records(
    #[case] at: HookAt,
    #[case] scanned: usize,
) {
    let hooked = Arc::new(HookedStore::default());
    let store: Arc<dyn RecordStore> = hooked.clone();
    let op = Scripted::new();
    let queue = Arc::new(sender_queue(&store, Arc::clone(&op), &QueueConfig::default()));
    let mut events = queue.subscribe();

    enqueue(store.as_ref(), &queue, &["m1", "m2"]);
    let (racing_store, racing_queue) = (Arc::clone(&store), Arc::clone(&queue));
    hooked.on_next_read(at, move || {
        enqueue(racing_store.as_ref(), &racing_queue, &["m3"]);
    });
    queue.setup().unwrap();

    let recovered = wait_for(&mut events, |e| matches!(e, QueueEvent::Recovered { .. })).await;
    assert!(matches!(recovered, QueueEvent::Recovered { count, .. } if count == scanned));
    wait_succeeded(&mut events, 3).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(op.log(), vec!["m1", "m2", "m3"]);
    queue.shutdown().await;
}

#[tokio::test]
async fn panicking_operation_goes_through_the_retry_budget() {
    let store = memory_store();
    let op = PanicsOn::new("m1");
    let queue = sender_queue(&store, Arc::clone(&op), &manual_retries(1));
    let mut events = queue.subscribe();

    let m1 = enqueue(store.as_ref(), &queue, &["m1", "m2", "m3"]).remove(0);
    queue.setup().unwrap();

    let scheduled = wait_for(&mut events, |e| matches!(e, QueueEvent::RetryScheduled { .. })).await;
    assert_eq!(scheduled.job_id(), Some(m1.unique_id));
    assert_eq!(queue.run_any_queued_retry(), Some(m1.unique_id));

    let failed = wait_for(&mut events, |e| matches!(e, QueueEvent::PermanentlyFailed { .. })).await;
    match failed {
        QueueEvent::PermanentlyFailed {
            id,
            failure_count,
            reason,
            error,
        } => {
            assert_eq!(id, m1.unique_id);
            assert_eq!(failure_count, 2);
            assert_eq!(reason, FailureReason::RetryBudgetExhausted);
            assert!(error.contains("panicked"), "unexpected error: {error}");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // The worker survived the panics and drained the rest of the label.
    wait_succeeded(&mut events, 2).await;
    assert_eq!(op.log(), vec!["m1", "m1", "m2", "m3"]);
    let counts = queue.counts().unwrap();
    assert_eq!(counts.outstanding(), 0);
    assert_eq!(counts.permanently_failed, 1);
    queue.shutdown().await;
}

#[tokio::test]
async fn setup_after_shutdown_recovers_and_resumes() {
    let store = memory_store();
    let op = Scripted::new();
    let queue = sender_queue(&store, Arc::clone(&op), &QueueConfig::default());
    let mut events = queue.subscribe();

    enqueue(store.as_ref(), &queue, &["m1"]);
    queue.setup().unwrap();
    wait_succeeded(&mut events, 1).await;
    queue.shutdown().await;
    assert!(!queue.is_setup());

    // Shut down again: adds only persist.
    enqueue(store.as_ref(), &queue, &["m2"]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(op.log(), vec!["m1"]);
    assert_eq!(queue.counts().unwrap().ready, 1);

    queue.setup().unwrap();
    let recovered = wait_for(&mut events, |e| matches!(e, QueueEvent::Recovered { .. })).await;
    assert!(matches!(recovered, QueueEvent::Recovered { count: 1, .. }));
    wait_succeeded(&mut events, 1).await;
    assert_eq!(op.log(), vec!["m1", "m2"]);
    queue.shutdown().await;
}
