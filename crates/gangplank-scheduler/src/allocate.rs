//! Job admission loop
//!
//! Queues take turns by weighted dominant share. Each turn offers the
//! head of the queue's cursor; the whole gang is placed or none of it,
//! and the queue's dequeue strategy decides what happens after a failure.

use gangplank_core::{JobId, JobInfo, JobPhase, QueueId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dequeue::{AttemptOutcome, Continuation, JobCursor};
use crate::placement::{BindRecord, Binder};
use crate::queue::DequeueStrategy;
use crate::session::{Session, Statement};

/// What happened to a job in one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    /// Every pending task was bound
    Allocated { tasks: usize },
    /// Nothing was left to place
    NothingPending,
    /// Attempt failed; the queue moved on to its next job
    Skipped { reason: String },
    /// Attempt failed; the queue stopped for this cycle
    Blocked { reason: String },
    /// Never dequeued: the job failed validation
    Invalid { reason: String, message: String },
}

/// Per-job entry of a [`CycleReport`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job: JobId,
    pub queue: QueueId,
    #[serde(flatten)]
    pub outcome: JobOutcome,
}

/// Summary of one scheduling cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    /// Jobs in the order they were handled
    pub jobs: Vec<JobReport>,
    /// Bindings made this cycle
    pub binds: Vec<BindRecord>,
}

impl CycleReport {
    pub fn outcome(&self, job: &str) -> Option<&JobOutcome> {
        self.jobs.iter().rev().find(|r| r.job == job).map(|r| &r.outcome)
    }

    pub fn allocated_jobs(&self) -> usize {
        self.jobs
            .iter()
            .filter(|r| matches!(r.outcome, JobOutcome::Allocated { .. }))
            .count()
    }

    fn push(&mut self, job: &JobInfo, outcome: JobOutcome) {
        self.jobs.push(JobReport {
            job: job.id.clone(),
            queue: job.queue.clone(),
            outcome,
        });
    }
}

/// Result of one gang attempt, before the strategy is applied
enum Attempt {
    Allocated(Vec<BindRecord>),
    NothingPending,
    Failed(String),
}

impl Attempt {
    fn outcome(&self) -> AttemptOutcome {
        match self {
            Attempt::Allocated(_) => AttemptOutcome::Allocated,
            Attempt::NothingPending => AttemptOutcome::NothingPending,
            Attempt::Failed(_) => AttemptOutcome::Failed,
        }
    }
}

/// Admits pending jobs from every queue into the cluster
#[derive(Debug, Default, Clone, Copy)]
pub struct AllocateAction;

impl AllocateAction {
    pub fn new() -> Self {
        Self
    }

    /// Run one admission pass over the session
    pub fn execute(&self, session: &mut Session, binder: &mut dyn Binder) -> CycleReport {
        let mut report = CycleReport::default();
        let mut cursors = self.build_cursors(session, &mut report);
        let mut active: BTreeSet<QueueId> = cursors
            .iter()
            .filter(|(_, c)| !c.is_exhausted())
            .map(|(q, _)| q.clone())
            .collect();

        while let Some(queue_id) = Self::next_queue(session, &active) {
            let Some(queue) = session.queue(&queue_id) else {
                active.remove(&queue_id);
                continue;
            };
            if session.is_overused(queue) {
                debug!(queue = %queue_id, "Queue is overused, skipping");
                active.remove(&queue_id);
                continue;
            }

            let Some(cursor) = cursors.get_mut(&queue_id) else {
                active.remove(&queue_id);
                continue;
            };
            let Some(job_id) = cursor.head().cloned() else {
                active.remove(&queue_id);
                continue;
            };

            let attempt = Self::attempt(session, &job_id, binder);
            let continuation = cursor.record(attempt.outcome());

            if let Some(job) = session.job(&job_id) {
                let outcome = match attempt {
                    Attempt::Allocated(binds) => {
                        let tasks = binds.len();
                        report.binds.extend(binds);
                        JobOutcome::Allocated { tasks }
                    }
                    Attempt::NothingPending => JobOutcome::NothingPending,
                    Attempt::Failed(reason) => match cursor.strategy() {
                        DequeueStrategy::Fifo => JobOutcome::Blocked { reason },
                        DequeueStrategy::Traverse => JobOutcome::Skipped { reason },
                    },
                };
                report.push(job, outcome);
            }

            if continuation == Continuation::Blocked || cursor.is_exhausted() {
                active.remove(&queue_id);
            }
        }

        info!(
            jobs = report.jobs.len(),
            allocated = report.allocated_jobs(),
            binds = report.binds.len(),
            "Allocate action finished"
        );
        report
    }

    /// Validate candidates and build one cursor per queue
    fn build_cursors(&self, session: &Session, report: &mut CycleReport) -> BTreeMap<QueueId, JobCursor> {
        let mut by_queue: BTreeMap<QueueId, Vec<&JobInfo>> = BTreeMap::new();

        for job in session.jobs() {
            if !matches!(job.phase, JobPhase::Inqueue | JobPhase::Running) {
                continue;
            }
            if session.queue(&job.queue).is_none() {
                warn!(job = %job.id, queue = %job.queue, "Job references unknown queue");
                continue;
            }

            let mut result = job.validate_gang();
            if result.pass {
                result = session.allocator().validate_job(job);
            }
            if !result.pass {
                warn!(
                    job = %job.id,
                    reason = %result.reason,
                    message = %result.message,
                    "Job failed validation"
                );
                report.push(
                    job,
                    JobOutcome::Invalid {
                        reason: result.reason,
                        message: result.message,
                    },
                );
                continue;
            }

            by_queue.entry(job.queue.clone()).or_default().push(job);
        }

        by_queue
            .into_iter()
            .filter_map(|(queue_id, jobs)| {
                let strategy = session.queue(&queue_id)?.dequeue_strategy;
                Some((queue_id, JobCursor::new(strategy, jobs)))
            })
            .collect()
    }

    /// Active queue with the lowest weighted share; ties by name
    fn next_queue(session: &Session, active: &BTreeSet<QueueId>) -> Option<QueueId> {
        let mut best: Option<(&QueueId, f64)> = None;
        for queue_id in active {
            let share = session
                .queue(queue_id)
                .map(|q| session.queue_share(q))
                .unwrap_or(f64::MAX);
            if best.map_or(true, |(_, s)| share < s) {
                best = Some((queue_id, share));
            }
        }
        best.map(|(q, _)| q.clone())
    }

    /// Place every pending task of a job, or none
    fn attempt(session: &mut Session, job_id: &JobId, binder: &mut dyn Binder) -> Attempt {
        let Some(job) = session.job(job_id) else {
            return Attempt::Failed(format!("job {} not found", job_id));
        };
        if !job.has_pending() {
            return Attempt::NothingPending;
        }
        if job.only_best_effort_pending() {
            debug!(job = %job_id, "Only best-effort tasks pending");
            return Attempt::Failed("only best-effort tasks pending".to_string());
        }

        let request = job.pending_request();
        if let Some(queue) = session.queue(&job.queue) {
            if !session.queue_fits(queue, &request) {
                debug!(job = %job_id, queue = %queue.name, "Queue capability exceeded");
                return Attempt::Failed(format!("queue {} capability exceeded", queue.name));
            }
        }

        let pending: Vec<Uuid> = job.pending_tasks().map(|t| t.uid).collect();
        let mut stmt = Statement::new(job.clone());

        for uid in pending {
            let placed = {
                let nodes: Vec<_> = session.nodes.values().collect();
                match stmt.job().task(&uid) {
                    Some(task) => session.pipeline.place(stmt.job(), task, &nodes),
                    None => continue,
                }
            };

            let result = placed.and_then(|node| {
                stmt.allocate(&mut session.nodes, session.allocator.as_ref(), uid, &node)
                    .map(|_| ())
            });
            if let Err(e) = result {
                debug!(job = %job_id, error = %e, "Gang placement failed");
                stmt.discard(&mut session.nodes);
                return Attempt::Failed(e.to_string());
            }
        }

        match stmt.commit(&mut session.nodes, binder) {
            Ok((job, binds)) => {
                info!(job = %job.id, queue = %job.queue, tasks = binds.len(), "Job allocated");
                session.charge_queue(&job.queue, &request);
                session.jobs.insert(job.id.clone(), job);
                Attempt::Allocated(binds)
            }
            Err(e) => Attempt::Failed(e.to_string()),
        }
    }
}
