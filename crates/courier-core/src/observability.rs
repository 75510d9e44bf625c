use serde::{Deserialize, Serialize};

use crate::domain::{JobRecord, JobStatus, Label};

/// Records per status for one label, read from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub label: Label,
    pub ready: usize,
    pub running: usize,
    pub permanently_failed: usize,
}

impl QueueCounts {
    pub fn tally<'a>(label: Label, records: impl IntoIterator<Item = &'a JobRecord>) -> Self {
        let mut counts = Self {
            label,
            ready: 0,
            running: 0,
            permanently_failed: 0,
        };
        for record in records {
            match record.status {
                JobStatus::Ready => counts.ready += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::PermanentlyFailed => counts.permanently_failed += 1,
            }
        }
        counts
    }

    /// Records that will still be dispatched.
    pub fn outstanding(&self) -> usize {
        self.ready + self.running
    }
}
