//! CLI commands implementation

use anyhow::{Context, Result};
use gangplank_core::{ClusterSnapshot, JobInfo, JobPhase, SchedulerConfig};
use gangplank_scheduler::{allocator_for, CycleReport, JobOutcome, Scheduler};
use serde::Serialize;
use std::path::Path;

/// Load the scheduler configuration, or the defaults when no file is given
pub fn load_config(path: Option<&Path>) -> Result<SchedulerConfig> {
    match path {
        Some(p) => SchedulerConfig::from_file(p)
            .with_context(|| format!("loading config {}", p.display())),
        None => Ok(SchedulerConfig::default()),
    }
}

/// Build a scheduler holding everything in a snapshot file
pub async fn load_scheduler(snapshot: &Path, config: &SchedulerConfig) -> Result<Scheduler> {
    let (queues, nodes, jobs) = ClusterSnapshot::from_file(snapshot)
        .and_then(ClusterSnapshot::into_model)
        .with_context(|| format!("loading snapshot {}", snapshot.display()))?;

    let scheduler = Scheduler::new(config);
    for queue in queues {
        scheduler.add_queue(queue).await;
    }
    for node in nodes {
        scheduler.add_node(node).await;
    }
    for job in jobs {
        scheduler.submit_job(job).await?;
    }
    Ok(scheduler)
}

/// Final state of a job, for reports
#[derive(Debug, Serialize)]
pub struct JobSummary {
    pub job: String,
    pub queue: String,
    pub phase: JobPhase,
}

#[derive(Debug, Serialize)]
struct RunOutput<'a> {
    cycles: &'a [CycleReport],
    jobs: Vec<JobSummary>,
}

/// Run scheduling cycles
pub async fn run(snapshot: &Path, config: &SchedulerConfig, cycles: u32, json: bool) -> Result<()> {
    let scheduler = load_scheduler(snapshot, config).await?;

    let mut reports = Vec::with_capacity(cycles as usize);
    for _ in 0..cycles {
        reports.push(scheduler.run_cycle().await);
    }

    let jobs: Vec<JobSummary> = scheduler
        .list_jobs()
        .await
        .into_iter()
        .map(|j| JobSummary {
            job: j.id,
            queue: j.queue,
            phase: j.phase,
        })
        .collect();

    if json {
        let output = RunOutput {
            cycles: &reports,
            jobs,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    for (i, report) in reports.iter().enumerate() {
        print_cycle(i + 1, report);
    }

    println!("\nJobs:");
    println!("{:<30} {:<20} {:<10}", "JOB", "QUEUE", "PHASE");
    println!("{}", "-".repeat(62));
    for job in jobs {
        println!("{:<30} {:<20} {:<10}", job.job, job.queue, job.phase);
    }

    Ok(())
}

/// Show queues
pub async fn queues(snapshot: &Path, config: &SchedulerConfig) -> Result<()> {
    let scheduler = load_scheduler(snapshot, config).await?;
    let queues = scheduler.list_queues().await;
    let jobs = scheduler.list_jobs().await;

    if queues.is_empty() {
        println!("No queues found");
        return Ok(());
    }

    println!(
        "{:<20} {:<8} {:<10} {:<12} {:<6} {:<20}",
        "NAME", "WEIGHT", "STRATEGY", "RECLAIMABLE", "JOBS", "HIERARCHY"
    );
    println!("{}", "-".repeat(80));
    for queue in queues {
        let count = jobs.iter().filter(|j| j.queue == queue.name).count();
        println!(
            "{:<20} {:<8} {:<10} {:<12} {:<6} {:<20}",
            queue.name,
            queue.weight,
            queue.dequeue_strategy,
            queue.is_reclaimable(),
            count,
            if queue.hierarchy.is_empty() {
                "-"
            } else {
                queue.hierarchy.as_str()
            }
        );
    }

    Ok(())
}

/// Check every job in a snapshot
pub fn validate(snapshot: &Path, config: &SchedulerConfig) -> Result<()> {
    let (_, _, jobs) = ClusterSnapshot::from_file(snapshot)
        .and_then(ClusterSnapshot::into_model)
        .with_context(|| format!("loading snapshot {}", snapshot.display()))?;
    let allocator = allocator_for(
        config.scheduler.accelerator,
        config.scheduler.device_score_weight,
    );

    println!("{:<30} {:<20} {:<8} {:<30}", "JOB", "QUEUE", "RESULT", "REASON");
    println!("{}", "-".repeat(90));

    let mut invalid = 0;
    for job in &jobs {
        let (pass, detail) = check_job(job, |j| allocator.validate_job(j));
        if !pass {
            invalid += 1;
        }
        println!(
            "{:<30} {:<20} {:<8} {:<30}",
            job.id,
            job.queue,
            if pass { "ok" } else { "invalid" },
            detail
        );
    }

    if invalid > 0 {
        anyhow::bail!("{} of {} jobs are invalid", invalid, jobs.len());
    }
    Ok(())
}

/// Gang check first, then the device check
fn check_job(
    job: &JobInfo,
    device_check: impl Fn(&JobInfo) -> gangplank_core::ValidateResult,
) -> (bool, String) {
    let mut result = job.validate_gang();
    if result.pass {
        result = device_check(job);
    }
    if result.pass {
        (true, String::new())
    } else {
        (false, format!("{}: {}", result.reason, result.message))
    }
}

/// Short label and detail for a job outcome
fn outcome_label(outcome: &JobOutcome) -> (&'static str, String) {
    match outcome {
        JobOutcome::Allocated { tasks } => ("allocated", format!("{} tasks bound", tasks)),
        JobOutcome::NothingPending => ("idle", String::new()),
        JobOutcome::Skipped { reason } => ("skipped", reason.clone()),
        JobOutcome::Blocked { reason } => ("blocked", reason.clone()),
        JobOutcome::Invalid { reason, message } => ("invalid", format!("{}: {}", reason, message)),
    }
}

fn print_cycle(cycle: usize, report: &CycleReport) {
    println!("Cycle {}: {} tasks bound", cycle, report.binds.len());

    if !report.jobs.is_empty() {
        println!("  {:<30} {:<20} {:<10} {}", "JOB", "QUEUE", "OUTCOME", "DETAIL");
        for entry in &report.jobs {
            let (label, detail) = outcome_label(&entry.outcome);
            println!("  {:<30} {:<20} {:<10} {}", entry.job, entry.queue, label, detail);
        }
    }

    for bind in &report.binds {
        println!(
            "  bind {}/{} -> {} (devices: {:?})",
            bind.job, bind.task, bind.node, bind.devices
        );
    }
}
