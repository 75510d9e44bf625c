//! JobQueue - durable, per-label FIFO dispatch with retry and recovery.
//!
//! # Flow
//! - `add()` inserts a `Ready` record inside the caller's write transaction.
//!   Once that transaction commits, the record is handed to the worker (if the
//!   queue is set up).
//! - `setup()` loads every `Ready`/`Running` record of the label by ascending
//!   `sort_id` and spawns the worker. A `Running` record is an interrupted
//!   attempt and is dispatched again.
//! - The worker runs one record at a time. Each transition is written to the
//!   store before the next step; in-memory structures only hold ids.
//! - A retryable failure keeps the record `Running` and parks it in the
//!   `RetrySchedule`. Until it resolves, later records of the label wait.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::retry::{RetryDecision, RetryPolicy};
use super::schedule::RetrySchedule;
use crate::config::QueueConfig;
use crate::domain::{
    FailureKind, JobPayload, JobRecord, JobRecordId, JobStatus, Label, NewJobRecord,
    OperationOutcome, QueueEvent, SortId, TransitionError,
};
use crate::error::QueueError;
use crate::observability::QueueCounts;
use crate::ports::{
    IdGenerator, Operation, RecordStore, RecordStoreExt, StoreError, SystemClock, UlidGenerator,
    WriteTransaction,
};

/// In-memory scheduling state. Ids only; the store holds the records.
#[derive(Debug, Default)]
struct QueueState {
    is_setup: bool,

    /// The recovery scan has been merged into `pending`.
    recovered: bool,

    /// Records waiting for their first dispatch in this process, by `sort_id`.
    /// Keyed by `sort_id`, so a record reported by both the recovery scan and
    /// its own commit hook is queued once.
    pending: BTreeMap<SortId, JobRecordId>,

    retries: RetrySchedule,

    /// Retries pulled forward by `run_any_queued_retry`.
    forced: VecDeque<JobRecordId>,
}

enum Step {
    Dispatch(JobRecordId),
    WaitUntil(Instant),
    Idle,
}

impl QueueState {
    fn next_step(&mut self, now: Instant) -> Step {
        if let Some(id) = self.forced.pop_front() {
            return Step::Dispatch(id);
        }
        if let Some(id) = self.retries.pop_due(now) {
            return Step::Dispatch(id);
        }
        // A record awaiting retry keeps the label blocked.
        if let Some(deadline) = self.retries.next_deadline() {
            return Step::WaitUntil(deadline);
        }
        if !self.recovered {
            return Step::Idle;
        }
        match self.pending.pop_first() {
            Some((_, id)) => Step::Dispatch(id),
            None => Step::Idle,
        }
    }
}

/// Result of a read-modify-write on one record.
enum Modified<T> {
    Applied(JobRecord, T),
    Missing,
    Rejected(TransitionError),
}

struct Inner<O> {
    label: Label,
    store: Arc<dyn RecordStore>,
    operation: O,
    policy: RetryPolicy,
    ids: Arc<dyn IdGenerator>,
    state: Mutex<QueueState>,
    wake: Notify,
    events: broadcast::Sender<QueueEvent>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

pub struct JobQueue<O: Operation> {
    inner: Arc<Inner<O>>,
}

impl<O: Operation> JobQueue<O> {
    pub fn new(
        label: impl Into<Label>,
        store: Arc<dyn RecordStore>,
        operation: O,
        config: &QueueConfig,
    ) -> Result<Self, QueueError> {
        Self::with_id_generator(
            label,
            store,
            operation,
            config,
            Arc::new(UlidGenerator::new(SystemClock)),
        )
    }

    pub fn with_id_generator(
        label: impl Into<Label>,
        store: Arc<dyn RecordStore>,
        operation: O,
        config: &QueueConfig,
        ids: Arc<dyn IdGenerator>,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        let (events, _) = broadcast::channel(config.event_capacity);
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                label: label.into(),
                store,
                operation,
                policy: config.retry_policy(),
                ids,
                state: Mutex::new(QueueState::default()),
                wake: Notify::new(),
                events,
                shutdown_tx,
                worker: Mutex::new(None),
            }),
        })
    }

    pub fn label(&self) -> &Label {
        &self.inner.label
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.inner.store
    }

    /// Persists a new `Ready` record in `txn`.
    ///
    /// Nothing is scheduled until the transaction commits. If it rolls back,
    /// the record never existed. Before `setup()` the record only waits in the
    /// store.
    pub fn add(
        &self,
        payload: JobPayload,
        txn: &mut dyn WriteTransaction,
    ) -> Result<JobRecord, QueueError> {
        payload.validate()?;
        let id = self.inner.ids.generate_job_record_id();
        let record = txn.insert(NewJobRecord::new(id, self.inner.label.clone(), payload))?;

        let sort_id = record.sort_id;
        let inner = Arc::downgrade(&self.inner);
        txn.add_completion(Box::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.enqueue_committed(sort_id, id);
            }
        }));

        debug!(
            label = %record.label,
            job_id = %id,
            sort_id = %sort_id,
            record_type = record.payload.record_type(),
            "job added"
        );
        Ok(record)
    }

    /// Starts processing: recovers `Ready`/`Running` records and spawns the
    /// worker. Calling it again is a no-op until `shutdown()`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn setup(&self) -> Result<(), QueueError> {
        {
            let mut state = self.inner.lock_state();
            if state.is_setup {
                return Ok(());
            }
            // Set before the scan: a record committed from here on is reported
            // by its commit hook even if the scan misses it.
            state.is_setup = true;
        }

        let label = self.inner.label.clone();
        let recovered = match self
            .inner
            .store
            .read(|txn| txn.fetch_all(&label, &JobStatus::RUNNABLE))
        {
            Ok(records) => records,
            Err(err) => {
                let mut state = self.inner.lock_state();
                state.is_setup = false;
                state.pending.clear();
                return Err(err.into());
            }
        };

        let interrupted = recovered
            .iter()
            .filter(|r| r.status == JobStatus::Running)
            .count();
        let count = recovered.len();
        {
            let mut state = self.inner.lock_state();
            state
                .pending
                .extend(recovered.iter().map(|r| (r.sort_id, r.unique_id)));
            state.recovered = true;
        }

        info!(label = %label, count, interrupted, "queue set up");
        self.inner.emit(QueueEvent::Recovered { label, count });

        // A previous shutdown() left the flag set.
        self.inner.shutdown_tx.send_replace(false);
        let shutdown_rx = self.inner.shutdown_tx.subscribe();
        let handle = tokio::spawn(run_worker(Arc::clone(&self.inner), shutdown_rx));
        *self
            .inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    pub fn is_setup(&self) -> bool {
        self.inner.lock_state().is_setup
    }

    /// Pulls the earliest pending retry forward so the worker runs it now.
    /// Returns its id, or `None` when no retry is pending.
    pub fn run_any_queued_retry(&self) -> Option<JobRecordId> {
        let id = {
            let mut state = self.inner.lock_state();
            let id = state.retries.pop_earliest()?;
            state.forced.push_back(id);
            id
        };
        debug!(label = %self.inner.label, job_id = %id, "retry forced");
        self.inner.wake.notify_one();
        Some(id)
    }

    pub fn next_retry_deadline(&self) -> Option<Instant> {
        self.inner.lock_state().retries.next_deadline()
    }

    /// Subscribe before `setup()` to observe every event.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    pub fn counts(&self) -> Result<QueueCounts, QueueError> {
        let label = self.inner.label.clone();
        let records = self.inner.store.read(|txn| {
            txn.fetch_all(
                &label,
                &[
                    JobStatus::Ready,
                    JobStatus::Running,
                    JobStatus::PermanentlyFailed,
                ],
            )
        })?;
        Ok(QueueCounts::tally(label, &records))
    }

    /// Terminal records of this label, kept for diagnostics.
    pub fn permanently_failed(&self) -> Result<Vec<JobRecord>, QueueError> {
        let label = &self.inner.label;
        Ok(self
            .inner
            .store
            .read(|txn| txn.fetch_all(label, &[JobStatus::PermanentlyFailed]))?)
    }

    /// Stops the worker after its current step and waits for it.
    ///
    /// An in-flight operation is never cancelled. A record awaiting retry
    /// stays `Running` in the store. The queue returns to its inert state:
    /// `add()` only persists, and a later `setup()` recovers from the store
    /// and starts a new worker.
    pub async fn shutdown(&self) {
        self.inner.shutdown_tx.send_replace(true);
        let handle = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(label = %self.inner.label, error = %err, "worker ended abnormally");
            }
        }
        *self.inner.lock_state() = QueueState::default();
        info!(label = %self.inner.label, "queue shut down");
    }
}

impl<O: Operation> Drop for JobQueue<O> {
    fn drop(&mut self) {
        self.inner.shutdown_tx.send_replace(true);
    }
}

impl<O: Operation> Inner<O> {
    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn enqueue_committed(&self, sort_id: SortId, id: JobRecordId) {
        {
            let mut state = self.lock_state();
            if !state.is_setup {
                return;
            }
            state.pending.insert(sort_id, id);
        }
        self.wake.notify_one();
    }

    fn schedule_retry(&self, id: JobRecordId, delay: Duration) {
        self.lock_state()
            .retries
            .schedule(id, Instant::now() + delay);
        self.wake.notify_one();
    }

    /// Refetches the record inside a write transaction, applies `step` and
    /// persists the result with `persist`. A rejected step writes nothing.
    fn modify<T>(
        &self,
        id: JobRecordId,
        step: impl FnOnce(&mut JobRecord) -> Result<T, TransitionError>,
        persist: impl FnOnce(&mut dyn WriteTransaction, &JobRecord) -> Result<(), StoreError>,
    ) -> Result<Modified<T>, StoreError> {
        self.store.write(|txn| {
            let Some(mut record) = txn.fetch_record(&id)? else {
                return Ok(Modified::Missing);
            };
            match step(&mut record) {
                Ok(value) => {
                    persist(txn, &record)?;
                    Ok(Modified::Applied(record, value))
                }
                Err(err) => Ok(Modified::Rejected(err)),
            }
        })
    }

    async fn process(self: &Arc<Self>, id: JobRecordId) {
        let record = match self.modify(id, JobRecord::start_dispatch, |txn, r| txn.update(r)) {
            Ok(Modified::Applied(record, ())) => record,
            Ok(Modified::Missing) => {
                debug!(label = %self.label, job_id = %id, "record gone, skipping");
                return;
            }
            Ok(Modified::Rejected(err)) => {
                debug!(label = %self.label, job_id = %id, %err, "record not dispatchable");
                return;
            }
            Err(err) => return self.storage_failed(id, err),
        };

        debug!(
            label = %self.label,
            job_id = %id,
            sort_id = %record.sort_id,
            failure_count = record.failure_count,
            "dispatching"
        );
        self.emit(QueueEvent::Dispatched {
            id,
            failure_count: record.failure_count,
        });

        // One task per attempt; a panic ends the attempt, not the worker.
        let attempt = {
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.operation.perform(&record).await })
        };
        match attempt.await {
            Ok(OperationOutcome::Success) => self.complete(id),
            Ok(OperationOutcome::RetryableFailure(err)) => {
                self.fail(id, FailureKind::Retryable, err.message())
            }
            Ok(OperationOutcome::PermanentFailure(err)) => {
                self.fail(id, FailureKind::Permanent, err.message())
            }
            Err(err) => {
                error!(label = %self.label, job_id = %id, error = %err, "operation panicked");
                self.fail(id, FailureKind::Retryable, &err.to_string())
            }
        }
    }

    fn complete(&self, id: JobRecordId) {
        match self.modify(id, |r| r.ensure_completable(), |txn, r| txn.delete(&r.unique_id)) {
            Ok(Modified::Applied(..)) => {
                info!(label = %self.label, job_id = %id, "job succeeded");
                self.emit(QueueEvent::Succeeded { id });
            }
            Ok(Modified::Missing) => {
                debug!(label = %self.label, job_id = %id, "record deleted during dispatch");
            }
            Ok(Modified::Rejected(err)) => {
                warn!(label = %self.label, job_id = %id, %err, "success not recorded");
            }
            Err(err) => self.storage_failed(id, err),
        }
    }

    fn fail(&self, id: JobRecordId, kind: FailureKind, message: &str) {
        let policy = &self.policy;
        let result = self.modify(
            id,
            |record| {
                let decision = policy.decide(record.failure_count, kind);
                match decision {
                    RetryDecision::ScheduleRetry { .. } => record.record_retryable_failure()?,
                    RetryDecision::FailPermanently { .. } => record.mark_permanently_failed()?,
                    RetryDecision::RetryStorage { .. } => {}
                }
                Ok(decision)
            },
            |txn, r| txn.update(r),
        );

        match result {
            Ok(Modified::Applied(record, RetryDecision::ScheduleRetry { delay })) => {
                self.schedule_retry(id, delay);
                warn!(
                    label = %self.label,
                    job_id = %id,
                    failure_count = record.failure_count,
                    delay_ms = delay.as_millis() as u64,
                    error = message,
                    "retry scheduled"
                );
                self.emit(QueueEvent::RetryScheduled {
                    id,
                    failure_count: record.failure_count,
                    delay,
                });
            }
            Ok(Modified::Applied(record, RetryDecision::FailPermanently { reason })) => {
                error!(
                    label = %self.label,
                    job_id = %id,
                    failure_count = record.failure_count,
                    ?reason,
                    error = message,
                    "job permanently failed"
                );
                self.emit(QueueEvent::PermanentlyFailed {
                    id,
                    failure_count: record.failure_count,
                    reason,
                    error: message.to_string(),
                });
            }
            Ok(Modified::Applied(_, RetryDecision::RetryStorage { delay })) => {
                self.schedule_retry(id, delay);
            }
            Ok(Modified::Missing) => {
                debug!(label = %self.label, job_id = %id, "record deleted during dispatch");
            }
            Ok(Modified::Rejected(err)) => {
                warn!(label = %self.label, job_id = %id, %err, "failure not recorded");
            }
            Err(err) => self.storage_failed(id, err),
        }
    }

    /// Nothing about the attempt was persisted: the failure is not counted and
    /// the record is tried again after the storage backoff.
    fn storage_failed(&self, id: JobRecordId, err: StoreError) {
        let delay = match self.policy.decide(0, FailureKind::Storage) {
            RetryDecision::RetryStorage { delay } => delay,
            _ => self.policy.base_delay,
        };
        warn!(
            label = %self.label,
            job_id = %id,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "storage failure, attempt will be rerun"
        );
        self.schedule_retry(id, delay);
        self.emit(QueueEvent::StorageFailed {
            id,
            error: err.to_string(),
        });
    }
}

async fn run_worker<O: Operation>(inner: Arc<Inner<O>>, mut shutdown_rx: watch::Receiver<bool>) {
    debug!(label = %inner.label, "worker started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let step = inner.lock_state().next_step(Instant::now());
        match step {
            Step::Dispatch(id) => inner.process(id).await,
            Step::WaitUntil(deadline) => {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = inner.wake.notified() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            Step::Idle => {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = inner.wake.notified() => {}
                }
            }
        }
    }
    debug!(label = %inner.label, "worker stopped");
}
