//! Per-queue job cursor driven by the queue's dequeue strategy

use gangplank_core::{JobId, JobInfo};
use std::cmp::Ordering;
use std::collections::VecDeque;

use crate::queue::DequeueStrategy;

/// Result of one attempt at the job at the head of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Every pending task was placed and committed
    Allocated,
    /// The job had nothing left to place
    NothingPending,
    /// Some task could not be placed, or only best-effort tasks were pending
    Failed,
}

/// What the queue does after an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// The queue may offer another job this pass
    Continue,
    /// The queue offers nothing more this pass
    Blocked,
}

/// Dequeue order within a queue: higher priority, then older, then by id
pub fn job_order(a: &JobInfo, b: &JobInfo) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Ordered pending sequence of one queue for one scheduling pass
#[derive(Debug, Clone)]
pub struct JobCursor {
    strategy: DequeueStrategy,
    pending: VecDeque<JobId>,
    blocked: bool,
}

impl JobCursor {
    /// Build a cursor over `jobs`, sorted into dequeue order
    pub fn new<'a>(strategy: DequeueStrategy, jobs: impl IntoIterator<Item = &'a JobInfo>) -> Self {
        let mut sorted: Vec<&JobInfo> = jobs.into_iter().collect();
        sorted.sort_by(|a, b| job_order(a, b));
        Self {
            strategy,
            pending: sorted.into_iter().map(|j| j.id.clone()).collect(),
            blocked: false,
        }
    }

    /// Strategy driving this cursor
    pub fn strategy(&self) -> DequeueStrategy {
        self.strategy
    }

    /// Job to attempt next, if the queue still offers one this pass
    pub fn head(&self) -> Option<&JobId> {
        if self.blocked {
            return None;
        }
        self.pending.front()
    }

    /// Jobs still in the sequence, head first
    pub fn remaining(&self) -> impl Iterator<Item = &JobId> {
        self.pending.iter()
    }

    /// Whether the queue can offer another job this pass
    pub fn is_exhausted(&self) -> bool {
        self.blocked || self.pending.is_empty()
    }

    /// Apply the outcome of attempting the head job
    ///
    /// Under FIFO a failed head stays where it is and the queue stops
    /// for this pass. Under Traverse it is dropped from this pass and the
    /// next job becomes the head. A job with nothing pending is passed
    /// through under both strategies.
    pub fn record(&mut self, outcome: AttemptOutcome) -> Continuation {
        if self.blocked {
            return Continuation::Blocked;
        }

        if outcome == AttemptOutcome::Failed && self.strategy == DequeueStrategy::Fifo {
            self.blocked = true;
            return Continuation::Blocked;
        }

        self.pending.pop_front();
        if self.pending.is_empty() {
            Continuation::Blocked
        } else {
            Continuation::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn jobs(names: &[&str]) -> Vec<JobInfo> {
        let base = chrono::Utc::now();
        names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let mut job = JobInfo::new("c1", *name, "q1");
                job.created_at = base + Duration::seconds(i as i64);
                job
            })
            .collect()
    }

    #[test]
    fn test_fifo_blocks_on_failed_head() {
        let jobs = jobs(&["pg1", "pg2"]);
        let mut cursor = JobCursor::new(DequeueStrategy::Fifo, &jobs);

        assert_eq!(cursor.head().map(String::as_str), Some("c1/pg1"));
        assert_eq!(cursor.record(AttemptOutcome::Failed), Continuation::Blocked);
        assert!(cursor.head().is_none());
        assert!(cursor.is_exhausted());
        // the failed head is kept for the next pass
        assert_eq!(cursor.remaining().count(), 2);
        assert_eq!(cursor.record(AttemptOutcome::Allocated), Continuation::Blocked);
    }

    #[test]
    fn test_traverse_skips_failed_head() {
        let jobs = jobs(&["pg1", "pg2", "pg3"]);
        let mut cursor = JobCursor::new(DequeueStrategy::Traverse, &jobs);

        assert_eq!(cursor.record(AttemptOutcome::Failed), Continuation::Continue);
        assert_eq!(cursor.head().map(String::as_str), Some("c1/pg2"));
        assert_eq!(cursor.record(AttemptOutcome::Allocated), Continuation::Continue);
        assert_eq!(cursor.head().map(String::as_str), Some("c1/pg3"));
        assert_eq!(cursor.record(AttemptOutcome::Failed), Continuation::Blocked);
        assert!(cursor.is_exhausted());
    }

    #[test]
    fn test_nothing_pending_passes_through_fifo() {
        let jobs = jobs(&["pg1", "pg2"]);
        let mut cursor = JobCursor::new(DequeueStrategy::Fifo, &jobs);

        assert_eq!(
            cursor.record(AttemptOutcome::NothingPending),
            Continuation::Continue
        );
        assert_eq!(cursor.head().map(String::as_str), Some("c1/pg2"));
    }

    #[test]
    fn test_fifo_advances_on_success() {
        let jobs = jobs(&["pg1", "pg2"]);
        let mut cursor = JobCursor::new(DequeueStrategy::Fifo, &jobs);

        assert_eq!(cursor.record(AttemptOutcome::Allocated), Continuation::Continue);
        assert_eq!(cursor.head().map(String::as_str), Some("c1/pg2"));
        assert_eq!(cursor.record(AttemptOutcome::Allocated), Continuation::Blocked);
        assert!(cursor.head().is_none());
    }

    #[test]
    fn test_order_by_priority_then_age() {
        let mut jobs = jobs(&["old", "young", "urgent"]);
        jobs[2].priority = 10;
        let cursor = JobCursor::new(DequeueStrategy::Traverse, &jobs);

        let order: Vec<&str> = cursor.remaining().map(String::as_str).collect();
        assert_eq!(order, vec!["c1/urgent", "c1/old", "c1/young"]);
    }

    #[test]
    fn test_empty_cursor() {
        let cursor = JobCursor::new(DequeueStrategy::Fifo, &Vec::<JobInfo>::new());
        assert!(cursor.head().is_none());
        assert!(cursor.is_exhausted());
    }
}
