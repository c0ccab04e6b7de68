//! Per-cycle scheduling session and the placement statement

use gangplank_core::{
    JobId, JobInfo, JobPhase, NodeInfo, QueueId, QueueSpec, ResourceList, SchedError, SchedResult,
    TaskStatus,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::placement::{BindRecord, Binder, PlacementPipeline};
use crate::queue::QueueInfo;
use crate::topology::TopologyAllocator;

/// Snapshot of cluster state for one scheduling cycle
pub struct Session {
    pub(crate) queues: BTreeMap<QueueId, QueueInfo>,
    pub(crate) jobs: BTreeMap<JobId, JobInfo>,
    pub(crate) nodes: BTreeMap<String, NodeInfo>,
    pub(crate) allocator: Arc<dyn TopologyAllocator>,
    pub(crate) pipeline: PlacementPipeline,
    queue_allocated: BTreeMap<QueueId, ResourceList>,
    total: ResourceList,
}

impl Session {
    /// Open a session over queues, jobs and nodes
    pub fn new(
        queues: impl IntoIterator<Item = Arc<QueueSpec>>,
        jobs: impl IntoIterator<Item = JobInfo>,
        nodes: impl IntoIterator<Item = NodeInfo>,
        allocator: Arc<dyn TopologyAllocator>,
    ) -> Self {
        let queues: BTreeMap<_, _> = queues
            .into_iter()
            .map(|q| {
                let info = QueueInfo::new(q);
                (info.uid.clone(), info)
            })
            .collect();
        let jobs: BTreeMap<_, _> = jobs.into_iter().map(|j| (j.id.clone(), j)).collect();
        let nodes: BTreeMap<_, _> = nodes.into_iter().map(|n| (n.name.clone(), n)).collect();

        let mut total = ResourceList::default();
        for node in nodes.values() {
            total.add(&node.allocatable);
        }

        let mut queue_allocated: BTreeMap<QueueId, ResourceList> = BTreeMap::new();
        for job in jobs.values() {
            let held = queue_allocated.entry(job.queue.clone()).or_default();
            for task in job.tasks.iter().filter(|t| t.status.occupies_node()) {
                held.add(&task.resreq);
            }
        }

        debug!(
            queues = queues.len(),
            jobs = jobs.len(),
            nodes = nodes.len(),
            allocator = allocator.name(),
            "Session opened"
        );

        Self {
            queues,
            jobs,
            nodes,
            pipeline: PlacementPipeline::new(allocator.clone()),
            allocator,
            queue_allocated,
            total,
        }
    }

    pub fn queue(&self, id: &str) -> Option<&QueueInfo> {
        self.queues.get(id)
    }

    pub fn queues(&self) -> impl Iterator<Item = &QueueInfo> {
        self.queues.values()
    }

    pub fn job(&self, id: &str) -> Option<&JobInfo> {
        self.jobs.get(id)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &JobInfo> {
        self.jobs.values()
    }

    pub fn node(&self, name: &str) -> Option<&NodeInfo> {
        self.nodes.get(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values()
    }

    pub fn allocator(&self) -> &dyn TopologyAllocator {
        self.allocator.as_ref()
    }

    /// Sum of allocatable resources over all nodes
    pub fn total_resource(&self) -> &ResourceList {
        &self.total
    }

    /// Resources held by the queue's placed tasks
    pub fn queue_allocated(&self, id: &str) -> ResourceList {
        self.queue_allocated.get(id).cloned().unwrap_or_default()
    }

    /// Weighted dominant share; lower shares are served first
    pub fn queue_share(&self, queue: &QueueInfo) -> f64 {
        let share = self.queue_allocated(&queue.uid).dominant_share(&self.total);
        share / f64::from(queue.weight.max(1))
    }

    /// Whether the queue already holds more than its capability
    pub fn is_overused(&self, queue: &QueueInfo) -> bool {
        match queue.capability() {
            Some(cap) => !within_capability(&self.queue_allocated(&queue.uid), cap),
            None => false,
        }
    }

    /// Whether granting `request` keeps the queue within its capability
    pub fn queue_fits(&self, queue: &QueueInfo, request: &ResourceList) -> bool {
        match queue.capability() {
            Some(cap) => {
                let mut after = self.queue_allocated(&queue.uid);
                after.add(request);
                within_capability(&after, cap)
            }
            None => true,
        }
    }

    /// Consume the session, returning the final jobs and nodes
    pub fn into_parts(self) -> (Vec<JobInfo>, Vec<NodeInfo>) {
        (
            self.jobs.into_values().collect(),
            self.nodes.into_values().collect(),
        )
    }

    pub(crate) fn charge_queue(&mut self, queue: &str, request: &ResourceList) {
        self.queue_allocated
            .entry(queue.to_string())
            .or_default()
            .add(request);
    }
}

/// Compare only the dimensions a capability actually sets
fn within_capability(used: &ResourceList, cap: &ResourceList) -> bool {
    (cap.cpu_millis == 0 || used.cpu_millis <= cap.cpu_millis)
        && (cap.memory_bytes == 0 || used.memory_bytes <= cap.memory_bytes)
        && cap
            .scalars
            .iter()
            .all(|(name, limit)| used.scalar(name) <= *limit)
}

/// One task placement held by a [`Statement`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub task: Uuid,
    pub node: String,
    pub devices: Vec<u32>,
}

/// Tentative placements of one job, applied all together or not at all
///
/// Placements mutate the session's nodes in place, so later tasks of the
/// same job see earlier ones. Every touched node is snapshotted first and
/// restored on discard.
pub struct Statement {
    job: JobInfo,
    originals: BTreeMap<String, NodeInfo>,
    placements: Vec<Placement>,
}

impl Statement {
    /// Start a statement over a working copy of `job`
    pub fn new(job: JobInfo) -> Self {
        Self {
            job,
            originals: BTreeMap::new(),
            placements: Vec::new(),
        }
    }

    /// Working copy of the job, with tentative placements applied
    pub fn job(&self) -> &JobInfo {
        &self.job
    }

    pub fn placements(&self) -> &[Placement] {
        &self.placements
    }

    /// Place a task of the job on `node_name`
    ///
    /// Charges the node, selects devices when the task asks for the
    /// allocator's resource, and marks the task allocated.
    pub fn allocate(
        &mut self,
        nodes: &mut BTreeMap<String, NodeInfo>,
        allocator: &dyn TopologyAllocator,
        task_uid: Uuid,
        node_name: &str,
    ) -> SchedResult<&Placement> {
        let node = nodes
            .get_mut(node_name)
            .ok_or_else(|| SchedError::NodeNotFound(node_name.to_string()))?;
        let index = self
            .job
            .tasks
            .iter()
            .position(|t| t.uid == task_uid)
            .ok_or_else(|| SchedError::Internal(format!("task {} not in job {}", task_uid, self.job.id)))?;

        self.originals
            .entry(node_name.to_string())
            .or_insert_with(|| node.clone());

        let mut task = self.job.tasks[index].clone();
        let devices = if allocator.task_request(&task)? > 0 {
            allocator.allocate(&self.job, &mut task, node)?
        } else {
            Vec::new()
        };

        node.add_task(&task);
        task.status = TaskStatus::Allocated;
        task.node_name = Some(node_name.to_string());
        self.job.tasks[index] = task;

        self.placements.push(Placement {
            task: task_uid,
            node: node_name.to_string(),
            devices,
        });
        let last = self.placements.len() - 1;
        Ok(&self.placements[last])
    }

    /// Undo every placement, restoring touched nodes exactly
    pub fn discard(self, nodes: &mut BTreeMap<String, NodeInfo>) {
        debug!(job = %self.job.id, placements = self.placements.len(), "Discarding statement");
        for (name, original) in self.originals {
            nodes.insert(name, original);
        }
    }

    /// Bind every placement and return the updated job
    ///
    /// A bind failure discards the whole statement.
    pub fn commit(
        mut self,
        nodes: &mut BTreeMap<String, NodeInfo>,
        binder: &mut dyn Binder,
    ) -> SchedResult<(JobInfo, Vec<BindRecord>)> {
        let mut records = Vec::with_capacity(self.placements.len());
        for i in 0..self.placements.len() {
            let placement = &self.placements[i];
            let Some(task) = self.job.task(&placement.task) else {
                let err = SchedError::Internal(format!("task {} vanished", placement.task));
                self.discard(nodes);
                return Err(err);
            };

            if let Err(e) = binder.bind(task, &placement.node, &placement.devices) {
                warn!(job = %self.job.id, task = %task.name, error = %e, "Bind failed");
                self.discard(nodes);
                return Err(e);
            }
            records.push(BindRecord {
                job: self.job.id.clone(),
                task: task.name.clone(),
                node: placement.node.clone(),
                devices: placement.devices.clone(),
            });
        }

        for placement in &self.placements {
            if let Some(task) = self.job.task_mut(&placement.task) {
                task.status = TaskStatus::Bound;
            }
        }
        self.job.phase = JobPhase::Running;
        Ok((self.job, records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placement::RecordingBinder;
    use crate::topology::ModuleAllocator;
    use gangplank_core::TaskInfo;

    const NPU: &str = "huawei.com/Ascend910";

    fn npu_nodes() -> BTreeMap<String, NodeInfo> {
        let node = NodeInfo::new("n1", ResourceList::new(8000, 0).with_scalar(NPU, 8))
            .with_annotation(NPU, "Ascend910-0,Ascend910-1,Ascend910-2,Ascend910-3");
        BTreeMap::from([("n1".to_string(), node)])
    }

    fn npu_job(tasks: usize, per_task: u64) -> JobInfo {
        let mut job = JobInfo::new("c1", "pg1", "q1");
        for i in 0..tasks {
            job.add_task(
                format!("p{}", i),
                ResourceList::new(1000, 0).with_scalar(NPU, per_task),
            );
        }
        job
    }

    struct FailingBinder;

    impl Binder for FailingBinder {
        fn bind(&mut self, _task: &TaskInfo, node: &str, _devices: &[u32]) -> SchedResult<()> {
            Err(SchedError::Bind(format!("{} unreachable", node)))
        }
    }

    #[test]
    fn test_later_tasks_see_earlier_placements() {
        let allocator = ModuleAllocator::module8(8.0);
        let mut nodes = npu_nodes();
        let job = npu_job(2, 2);
        let uids: Vec<Uuid> = job.tasks.iter().map(|t| t.uid).collect();
        let mut stmt = Statement::new(job);

        let first = stmt.allocate(&mut nodes, &allocator, uids[0], "n1").unwrap().clone();
        let second = stmt.allocate(&mut nodes, &allocator, uids[1], "n1").unwrap().clone();

        assert_eq!(first.devices, vec![0, 1]);
        assert_eq!(second.devices, vec![2, 3]);
        assert_eq!(nodes["n1"].annotations[NPU], "");
        assert_eq!(nodes["n1"].used.cpu_millis, 2000);
        assert_eq!(stmt.job().tasks[0].status, TaskStatus::Allocated);
    }

    #[test]
    fn test_discard_restores_nodes() {
        let allocator = ModuleAllocator::module8(8.0);
        let mut nodes = npu_nodes();
        let before = nodes["n1"].clone();
        let job = npu_job(1, 4);
        let uid = job.tasks[0].uid;

        let mut stmt = Statement::new(job);
        stmt.allocate(&mut nodes, &allocator, uid, "n1").unwrap();
        assert_ne!(nodes["n1"].annotations[NPU], before.annotations[NPU]);

        stmt.discard(&mut nodes);
        assert_eq!(nodes["n1"].annotations, before.annotations);
        assert_eq!(nodes["n1"].used, before.used);
    }

    #[test]
    fn test_commit_binds_and_runs() {
        let allocator = ModuleAllocator::module8(8.0);
        let mut nodes = npu_nodes();
        let job = npu_job(1, 1);
        let uid = job.tasks[0].uid;

        let mut stmt = Statement::new(job);
        stmt.allocate(&mut nodes, &allocator, uid, "n1").unwrap();
        let mut binder = RecordingBinder::new();
        let (job, records) = stmt.commit(&mut nodes, &mut binder).unwrap();

        assert_eq!(job.phase, JobPhase::Running);
        assert_eq!(job.tasks[0].status, TaskStatus::Bound);
        assert_eq!(job.tasks[0].node_name.as_deref(), Some("n1"));
        assert_eq!(records, binder.records());
        assert_eq!(records[0].devices, vec![0]);
    }

    #[test]
    fn test_bind_failure_discards() {
        let allocator = ModuleAllocator::module8(8.0);
        let mut nodes = npu_nodes();
        let before = nodes["n1"].clone();
        let job = npu_job(1, 2);
        let uid = job.tasks[0].uid;

        let mut stmt = Statement::new(job);
        stmt.allocate(&mut nodes, &allocator, uid, "n1").unwrap();
        let err = stmt.commit(&mut nodes, &mut FailingBinder).unwrap_err();

        assert!(matches!(err, SchedError::Bind(_)));
        assert_eq!(nodes["n1"].annotations, before.annotations);
    }

    #[test]
    fn test_unknown_node() {
        let allocator = ModuleAllocator::module8(8.0);
        let mut nodes = npu_nodes();
        let job = npu_job(1, 1);
        let uid = job.tasks[0].uid;

        let mut stmt = Statement::new(job);
        assert!(matches!(
            stmt.allocate(&mut nodes, &allocator, uid, "missing"),
            Err(SchedError::NodeNotFound(_))
        ));
    }

    #[test]
    fn test_queue_share_and_capability() {
        let mut spec = QueueSpec::new("q1", 2);
        spec.capability = Some(ResourceList::new(2000, 0));
        let mut job = npu_job(1, 0);
        job.tasks[0].status = TaskStatus::Running;
        job.tasks[0].node_name = Some("n1".to_string());

        let session = Session::new(
            [Arc::new(spec)],
            [job],
            npu_nodes().into_values(),
            Arc::new(ModuleAllocator::module8(8.0)),
        );
        let queue = session.queue("q1").unwrap();

        // 1 of 8 cores held, weight 2
        assert_eq!(session.queue_share(queue), 0.0625);
        assert!(!session.is_overused(queue));
        assert!(session.queue_fits(queue, &ResourceList::new(1000, 0)));
        assert!(!session.queue_fits(queue, &ResourceList::new(1500, 0)));
        // memory is not capped
        assert!(session.queue_fits(queue, &ResourceList::new(0, 1 << 30)));
    }
}
