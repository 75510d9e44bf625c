#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use courier_core::domain::{JobPayload, JobRecord, OperationOutcome, QueueEvent};
use courier_core::impls::InMemoryRecordStore;
use courier_core::ports::{
    Operation, ReadTransaction, RecordStore, RecordStoreExt, StoreError, WriteTransaction,
};
use courier_core::{JobQueue, QueueConfig, QueueError};

/// Message id for message sends, contact thread for session resets.
pub fn key(record: &JobRecord) -> String {
    match &record.payload {
        JobPayload::MessageSend(p) => p
            .message_id
            .clone()
            .unwrap_or_else(|| "invisible".to_string()),
        JobPayload::SessionReset(p) => p.contact_thread_id.clone(),
    }
}

/// Logs every attempt and replays scripted outcomes per key; success once
/// the script for a key runs out.
#[derive(Default)]
pub struct Scripted {
    log: Mutex<Vec<String>>,
    outcomes: Mutex<HashMap<String, VecDeque<OperationOutcome>>>,
}

impl Scripted {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, key: &str, outcomes: impl IntoIterator<Item = OperationOutcome>) {
        self.outcomes
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .extend(outcomes);
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl Operation for Scripted {
    async fn perform(&self, record: &JobRecord) -> OperationOutcome {
        let key = key(record);
        self.log.lock().unwrap().push(key.clone());
        self.outcomes
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
            .unwrap_or(OperationOutcome::Success)
    }
}

/// Panics on one key and succeeds on every other. Logs every attempt.
pub struct PanicsOn {
    key: &'static str,
    log: Mutex<Vec<String>>,
}

impl PanicsOn {
    pub fn new(key: &'static str) -> Arc<Self> {
        Arc::new(Self {
            key,
            log: Mutex::new(Vec::new()),
        })
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl Operation for PanicsOn {
    async fn perform(&self, record: &JobRecord) -> OperationOutcome {
        let key = key(record);
        self.log.lock().unwrap().push(key.clone());
        if key == self.key {
            panic!("send of {key} blew up");
        }
        OperationOutcome::Success
    }
}

/// Never finishes: stands in for a process killed mid-attempt.
pub struct Stuck;

#[async_trait]
impl Operation for Stuck {
    async fn perform(&self, _record: &JobRecord) -> OperationOutcome {
        std::future::pending().await
    }
}

/// In-memory store whose write transactions can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: InMemoryRecordStore,
    skip_writes: AtomicU32,
    failing_writes: AtomicU32,
}

impl FlakyStore {
    /// Let `skip` writes through, then fail the next `fail` writes.
    pub fn fail_writes(&self, skip: u32, fail: u32) {
        self.skip_writes.store(skip, Ordering::SeqCst);
        self.failing_writes.store(fail, Ordering::SeqCst);
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl RecordStore for FlakyStore {
    fn read_with(
        &self,
        block: &mut dyn FnMut(&dyn ReadTransaction) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        self.inner.read_with(block)
    }

    fn write_with(
        &self,
        block: &mut dyn FnMut(&mut dyn WriteTransaction) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        if !take_one(&self.skip_writes) && take_one(&self.failing_writes) {
            return Err(StoreError::Backend("disk I/O error".to_string()));
        }
        self.inner.write_with(block)
    }
}

/// Where `HookedStore` runs its hook relative to the read it intercepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAt {
    BeforeRead,
    AfterRead,
}

type Hook = Box<dyn FnOnce() + Send>;

/// In-memory store that runs a hook once, around the next read transaction.
/// The hook runs outside the store lock, so it may write to the store.
#[derive(Default)]
pub struct HookedStore {
    inner: InMemoryRecordStore,
    hook: Mutex<Option<(HookAt, Hook)>>,
}

impl HookedStore {
    pub fn on_next_read(&self, at: HookAt, hook: impl FnOnce() + Send + 'static) {
        *self.hook.lock().unwrap() = Some((at, Box::new(hook)));
    }

    fn take_hook(&self, at: HookAt) -> Option<Hook> {
        let mut slot = self.hook.lock().unwrap();
        match slot.as_ref() {
            Some((armed, _)) if *armed == at => {
                slot.take().map(|(_, hook)| hook)
            }
            _ => None,
        }
    }
}

impl RecordStore for HookedStore {
    fn read_with(
        &self,
        block: &mut dyn FnMut(&dyn ReadTransaction) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        if let Some(hook) = self.take_hook(HookAt::BeforeRead) {
            hook();
        }
        let result = self.inner.read_with(block);
        if let Some(hook) = self.take_hook(HookAt::AfterRead) {
            hook();
        }
        result
    }

    fn write_with(
        &self,
        block: &mut dyn FnMut(&mut dyn WriteTransaction) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        self.inner.write_with(block)
    }
}

/// A "MessageSender" queue over `store`.
pub fn sender_queue<O: Operation>(
    store: &Arc<dyn RecordStore>,
    op: O,
    config: &QueueConfig,
) -> JobQueue<O> {
    labelled_queue("MessageSender", store, op, config)
}

pub fn labelled_queue<O: Operation>(
    label: &str,
    store: &Arc<dyn RecordStore>,
    op: O,
    config: &QueueConfig,
) -> JobQueue<O> {
    JobQueue::new(label, Arc::clone(store), op, config).unwrap()
}

/// Retries that never fire on their own; tests advance them explicitly.
pub fn manual_retries(max_retries: u32) -> QueueConfig {
    QueueConfig {
        max_retries,
        base_delay_ms: 3_600_000,
        max_delay_ms: 3_600_000,
        ..QueueConfig::default()
    }
}

pub fn message(key: &str) -> JobPayload {
    JobPayload::persisted_message(key, "thread-1")
}

/// Adds one message per key in a single transaction.
pub fn enqueue<O: Operation>(
    store: &dyn RecordStore,
    queue: &JobQueue<O>,
    keys: &[&str],
) -> Vec<JobRecord> {
    store
        .try_write(|txn| {
            keys.iter()
                .map(|k| queue.add(message(k), txn))
                .collect::<Result<Vec<_>, QueueError>>()
        })
        .unwrap()
}

pub async fn wait_for(
    events: &mut broadcast::Receiver<QueueEvent>,
    mut matches: impl FnMut(&QueueEvent) -> bool,
) -> QueueEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) => continue,
                Err(err) => panic!("event stream broken: {err}"),
            }
        }
    })
    .await
    .expect("timed out waiting for a queue event")
}

pub async fn wait_succeeded(events: &mut broadcast::Receiver<QueueEvent>, n: usize) {
    for _ in 0..n {
        wait_for(events, |e| matches!(e, QueueEvent::Succeeded { .. })).await;
    }
}
