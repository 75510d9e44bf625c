//! Pending delayed retries, ordered by deadline.
//!
//! A sorted set of (deadline, id) pairs. The worker advances it by real time
//! (`pop_due`); callers and tests can advance it explicitly (`pop_earliest`),
//! which makes retry timing deterministic without waiting on a timer.

use std::collections::{BTreeSet, HashMap};

use tokio::time::Instant;

use crate::domain::JobRecordId;

#[derive(Debug, Default)]
pub struct RetrySchedule {
    by_deadline: BTreeSet<(Instant, JobRecordId)>,
    deadlines: HashMap<JobRecordId, Instant>,
}

impl RetrySchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `id` at `deadline`. An existing entry for `id` is replaced,
    /// so a record is never scheduled twice.
    pub fn schedule(&mut self, id: JobRecordId, deadline: Instant) {
        self.cancel(&id);
        self.by_deadline.insert((deadline, id));
        self.deadlines.insert(id, deadline);
    }

    pub fn cancel(&mut self, id: &JobRecordId) -> Option<Instant> {
        let deadline = self.deadlines.remove(id)?;
        self.by_deadline.remove(&(deadline, *id));
        Some(deadline)
    }

    pub fn contains(&self, id: &JobRecordId) -> bool {
        self.deadlines.contains_key(id)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.by_deadline.first().map(|(deadline, _)| *deadline)
    }

    /// Removes and returns the earliest entry whose deadline has passed.
    pub fn pop_due(&mut self, now: Instant) -> Option<JobRecordId> {
        match self.by_deadline.first() {
            Some((deadline, _)) if *deadline <= now => self.pop_earliest(),
            _ => None,
        }
    }

    /// Removes and returns the earliest entry regardless of its deadline.
    pub fn pop_earliest(&mut self) -> Option<JobRecordId> {
        let (_, id) = self.by_deadline.pop_first()?;
        self.deadlines.remove(&id);
        Some(id)
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}
