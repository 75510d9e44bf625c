//! Queue module: retry policy, retry schedule and the per-label job queue.

mod job_queue;
mod retry;
mod schedule;

pub use job_queue::JobQueue;
pub use retry::{RetryDecision, RetryPolicy};
pub use schedule::RetrySchedule;
