//! Main scheduler logic

use gangplank_core::{
    JobId, JobInfo, JobPhase, NodeInfo, QueueId, QueueSpec, SchedError, SchedResult,
    SchedulerConfig,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::allocate::{AllocateAction, CycleReport};
use crate::placement::{Binder, RecordingBinder};
use crate::queue::QueueInfo;
use crate::session::Session;
use crate::topology::{allocator_for, TopologyAllocator};

type QueuesMap = BTreeMap<QueueId, Arc<QueueSpec>>;
type JobsMap = BTreeMap<JobId, JobInfo>;
type NodesMap = BTreeMap<String, NodeInfo>;

/// Scheduler holds cluster state and runs admission cycles over it
pub struct Scheduler {
    /// Queues indexed by name
    queues: RwLock<QueuesMap>,
    /// Jobs indexed by `namespace/name`
    jobs: RwLock<JobsMap>,
    /// Nodes indexed by name
    nodes: RwLock<NodesMap>,
    /// Device allocator for the configured accelerator family
    allocator: Arc<dyn TopologyAllocator>,
    /// Receives committed placements
    binder: Mutex<Box<dyn Binder>>,
    /// Completed cycles
    cycles: RwLock<u64>,
}

impl Scheduler {
    /// Create a scheduler that records its bindings in memory
    pub fn new(config: &SchedulerConfig) -> Self {
        Self::with_binder(config, Box::new(RecordingBinder::new()))
    }

    /// Create a scheduler that hands bindings to `binder`
    pub fn with_binder(config: &SchedulerConfig, binder: Box<dyn Binder>) -> Self {
        let allocator: Arc<dyn TopologyAllocator> = Arc::from(allocator_for(
            config.scheduler.accelerator,
            config.scheduler.device_score_weight,
        ));

        info!(
            accelerator = %config.scheduler.accelerator,
            weight = config.scheduler.device_score_weight,
            "Scheduler initialized"
        );

        Self {
            queues: RwLock::new(BTreeMap::new()),
            jobs: RwLock::new(BTreeMap::new()),
            nodes: RwLock::new(BTreeMap::new()),
            allocator,
            binder: Mutex::new(binder),
            cycles: RwLock::new(0),
        }
    }

    /// Register or replace a queue
    pub async fn add_queue(&self, queue: QueueSpec) {
        debug!(queue = %queue.name, weight = queue.weight, "Adding queue");
        self.queues
            .write()
            .await
            .insert(queue.name.clone(), Arc::new(queue));
    }

    /// Register or replace a node
    pub async fn add_node(&self, node: NodeInfo) {
        debug!(node = %node.name, "Adding node");
        self.nodes.write().await.insert(node.name.clone(), node);
    }

    /// Submit a job to its queue
    pub async fn submit_job(&self, job: JobInfo) -> SchedResult<JobId> {
        if !self.queues.read().await.contains_key(&job.queue) {
            return Err(SchedError::QueueNotFound(job.queue.clone()));
        }

        info!(
            job = %job.id,
            queue = %job.queue,
            tasks = job.tasks.len(),
            "Submitting job"
        );

        let id = job.id.clone();
        self.jobs.write().await.insert(id.clone(), job);
        Ok(id)
    }

    /// Remove a job, returning its devices to the nodes it held
    pub async fn remove_job(&self, id: &str) -> SchedResult<JobInfo> {
        let job = self
            .jobs
            .write()
            .await
            .remove(id)
            .ok_or_else(|| SchedError::JobNotFound(id.to_string()))?;

        let mut nodes = self.nodes.write().await;
        for task in job.tasks.iter().filter(|t| t.status.occupies_node()) {
            let Some(node_name) = task.node_name.as_deref() else {
                continue;
            };
            if let Some(node) = nodes.get_mut(node_name) {
                let mut released = self.allocator.release(task, node);
                released.remove_task(task);
                *node = released;
            }
        }

        info!(job = %id, "Job removed");
        Ok(job)
    }

    /// Run one admission cycle over the current state
    ///
    /// Holds the job and node write locks for the whole cycle, so cycles
    /// never overlap.
    pub async fn run_cycle(&self) -> CycleReport {
        let queues = self.queues.read().await;
        let mut jobs = self.jobs.write().await;
        let mut nodes = self.nodes.write().await;
        let mut binder = self.binder.lock().await;

        let mut session = Session::new(
            queues.values().cloned(),
            std::mem::take(&mut *jobs).into_values(),
            std::mem::take(&mut *nodes).into_values(),
            self.allocator.clone(),
        );
        let report = AllocateAction::new().execute(&mut session, &mut **binder);

        let (new_jobs, new_nodes) = session.into_parts();
        *jobs = new_jobs.into_iter().map(|j| (j.id.clone(), j)).collect();
        *nodes = new_nodes.into_iter().map(|n| (n.name.clone(), n)).collect();

        let mut cycles = self.cycles.write().await;
        *cycles += 1;
        info!(
            cycle = *cycles,
            bound = report.binds.len(),
            "Scheduling cycle complete"
        );
        report
    }

    /// Phase of a job
    pub async fn job_phase(&self, id: &str) -> SchedResult<JobPhase> {
        self.jobs
            .read()
            .await
            .get(id)
            .map(|j| j.phase)
            .ok_or_else(|| SchedError::JobNotFound(id.to_string()))
    }

    /// Get a job
    pub async fn get_job(&self, id: &str) -> SchedResult<JobInfo> {
        self.jobs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SchedError::JobNotFound(id.to_string()))
    }

    /// Get a node
    pub async fn get_node(&self, name: &str) -> SchedResult<NodeInfo> {
        self.nodes
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| SchedError::NodeNotFound(name.to_string()))
    }

    /// Per-cycle views of every queue
    pub async fn list_queues(&self) -> Vec<QueueInfo> {
        self.queues
            .read()
            .await
            .values()
            .cloned()
            .map(QueueInfo::new)
            .collect()
    }

    /// All jobs
    pub async fn list_jobs(&self) -> Vec<JobInfo> {
        self.jobs.read().await.values().cloned().collect()
    }

    /// Number of completed cycles
    pub async fn cycles(&self) -> u64 {
        *self.cycles.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{DequeueStrategy, DEQUEUE_STRATEGY_ANNOTATION};
    use gangplank_core::{AcceleratorFamily, ResourceList, TaskStatus};

    const NPU: &str = "huawei.com/Ascend910";

    fn cpu_job(name: &str, cores: u64) -> JobInfo {
        let mut job = JobInfo::new("c1", name, "q1");
        job.add_task("p1", ResourceList::new(cores * 1000, 0));
        job
    }

    async fn scheduler_with_fifo_queue() -> Scheduler {
        let scheduler = Scheduler::new(&SchedulerConfig::default());
        scheduler
            .add_queue(QueueSpec::new("q1", 1).with_annotation(DEQUEUE_STRATEGY_ANNOTATION, "fifo"))
            .await;
        scheduler
            .add_node(NodeInfo::new("n1", ResourceList::new(2000, 0)))
            .await;
        scheduler
    }

    #[tokio::test]
    async fn test_submit_requires_queue() {
        let scheduler = Scheduler::new(&SchedulerConfig::default());
        let result = scheduler.submit_job(cpu_job("pg1", 1)).await;
        assert!(matches!(result, Err(SchedError::QueueNotFound(_))));
    }

    #[tokio::test]
    async fn test_run_cycle_binds_job() {
        let scheduler = scheduler_with_fifo_queue().await;
        let id = scheduler.submit_job(cpu_job("pg1", 1)).await.unwrap();

        let report = scheduler.run_cycle().await;

        assert_eq!(report.binds.len(), 1);
        assert_eq!(scheduler.job_phase(&id).await.unwrap(), JobPhase::Running);
        assert_eq!(scheduler.get_node("n1").await.unwrap().used.cpu_millis, 1000);
        assert_eq!(scheduler.cycles().await, 1);
    }

    #[tokio::test]
    async fn test_fifo_head_blocks_across_cycles() {
        let scheduler = scheduler_with_fifo_queue().await;
        let mut big = cpu_job("pg1", 10);
        big.created_at = chrono::Utc::now() - chrono::Duration::seconds(10);
        scheduler.submit_job(big).await.unwrap();
        scheduler.submit_job(cpu_job("pg2", 1)).await.unwrap();

        for _ in 0..3 {
            let report = scheduler.run_cycle().await;
            assert!(report.binds.is_empty());
        }
        assert_eq!(scheduler.job_phase("c1/pg2").await.unwrap(), JobPhase::Inqueue);

        // once the head goes away the rest of the queue moves
        scheduler.remove_job("c1/pg1").await.unwrap();
        let report = scheduler.run_cycle().await;
        assert_eq!(report.binds.len(), 1);
        assert_eq!(scheduler.job_phase("c1/pg2").await.unwrap(), JobPhase::Running);
    }

    #[tokio::test]
    async fn test_remove_job_releases_devices() {
        let mut config = SchedulerConfig::default();
        config.scheduler.accelerator = AcceleratorFamily::Module8;
        let scheduler = Scheduler::new(&config);
        scheduler.add_queue(QueueSpec::new("q1", 1)).await;
        scheduler
            .add_node(
                NodeInfo::new("n1", ResourceList::new(8000, 0).with_scalar(NPU, 8))
                    .with_annotation(NPU, "Ascend910-0,Ascend910-1,Ascend910-2,Ascend910-3"),
            )
            .await;

        let mut job = JobInfo::new("c1", "train", "q1");
        job.add_task("w0", ResourceList::new(1000, 0).with_scalar(NPU, 2));
        scheduler.submit_job(job).await.unwrap();
        scheduler.run_cycle().await;

        let node = scheduler.get_node("n1").await.unwrap();
        assert_eq!(node.annotations[NPU], "Ascend910-2,Ascend910-3");
        let job = scheduler.get_job("c1/train").await.unwrap();
        assert_eq!(job.tasks[0].status, TaskStatus::Bound);

        scheduler.remove_job("c1/train").await.unwrap();
        let node = scheduler.get_node("n1").await.unwrap();
        assert_eq!(
            node.annotations[NPU],
            "Ascend910-0,Ascend910-1,Ascend910-2,Ascend910-3"
        );
        assert_eq!(node.used.cpu_millis, 0);
        assert!(scheduler.remove_job("c1/train").await.is_err());
    }

    #[tokio::test]
    async fn test_list_queues() {
        let scheduler = scheduler_with_fifo_queue().await;
        scheduler.add_queue(QueueSpec::new("q2", 3)).await;

        let queues = scheduler.list_queues().await;
        assert_eq!(queues.len(), 2);
        assert_eq!(queues[0].dequeue_strategy, DequeueStrategy::Fifo);
        assert_eq!(queues[1].dequeue_strategy, DequeueStrategy::Traverse);
        assert_eq!(queues[1].weight, 3);
    }
}
