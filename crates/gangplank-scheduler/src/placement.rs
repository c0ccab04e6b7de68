//! Task placement decisions

use gangplank_core::{JobId, JobInfo, NodeInfo, SchedError, SchedResult, TaskInfo};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::topology::TopologyAllocator;

/// A filter/score stage of the placement pipeline
pub trait PlacementPlugin: Send + Sync {
    /// Plugin name, for logs
    fn name(&self) -> &'static str;

    /// Reject a node that cannot host the task
    fn filter(&self, job: &JobInfo, task: &TaskInfo, node: &NodeInfo) -> SchedResult<()>;

    /// Score nodes that passed every filter; higher is better
    fn score(
        &self,
        job: &JobInfo,
        task: &TaskInfo,
        nodes: &[&NodeInfo],
    ) -> SchedResult<BTreeMap<String, f64>>;
}

/// Idle CPU, memory and extended resources must cover the request
pub struct ResourceFit;

/// Score scale of [`ResourceFit`]
const MAX_FIT_SCORE: f64 = 10.0;

impl PlacementPlugin for ResourceFit {
    fn name(&self) -> &'static str {
        "resource-fit"
    }

    fn filter(&self, _job: &JobInfo, task: &TaskInfo, node: &NodeInfo) -> SchedResult<()> {
        let idle = node.idle();
        if task.resreq.less_equal(&idle) {
            return Ok(());
        }
        Err(SchedError::Predicate(format!(
            "node {} has insufficient {}",
            node.name,
            task.resreq.exceeded_dimensions(&idle).join(", ")
        )))
    }

    /// Least-requested: nodes left emptier after placement score higher
    fn score(
        &self,
        _job: &JobInfo,
        task: &TaskInfo,
        nodes: &[&NodeInfo],
    ) -> SchedResult<BTreeMap<String, f64>> {
        Ok(nodes
            .iter()
            .map(|node| {
                let mut after = node.used.clone();
                after.add(&task.resreq);
                let share = after.dominant_share(&node.allocatable).min(1.0);
                (node.name.clone(), (1.0 - share) * MAX_FIT_SCORE)
            })
            .collect())
    }
}

/// Device topology stage backed by the configured allocator
pub struct DeviceTopologyFit {
    allocator: Arc<dyn TopologyAllocator>,
}

impl DeviceTopologyFit {
    pub fn new(allocator: Arc<dyn TopologyAllocator>) -> Self {
        Self { allocator }
    }
}

impl PlacementPlugin for DeviceTopologyFit {
    fn name(&self) -> &'static str {
        "device-topology"
    }

    fn filter(&self, job: &JobInfo, task: &TaskInfo, node: &NodeInfo) -> SchedResult<()> {
        self.allocator
            .check_feasible(job, task, node)
            .map_err(|e| SchedError::Predicate(format!("node {}: {}", node.name, e)))
    }

    fn score(
        &self,
        job: &JobInfo,
        task: &TaskInfo,
        nodes: &[&NodeInfo],
    ) -> SchedResult<BTreeMap<String, f64>> {
        if self.allocator.task_request(task)? == 0 {
            return Ok(BTreeMap::new());
        }
        self.allocator.score(job, task, nodes)
    }
}

/// Runs every plugin's filter, sums their scores and picks a node
pub struct PlacementPipeline {
    plugins: Vec<Box<dyn PlacementPlugin>>,
}

impl PlacementPipeline {
    /// Default pipeline: resource fit, then device topology
    pub fn new(allocator: Arc<dyn TopologyAllocator>) -> Self {
        Self::with_plugins(vec![
            Box::new(ResourceFit),
            Box::new(DeviceTopologyFit::new(allocator)),
        ])
    }

    pub fn with_plugins(plugins: Vec<Box<dyn PlacementPlugin>>) -> Self {
        Self { plugins }
    }

    /// Choose a node for `task`
    ///
    /// Nodes are visited in the given order. The highest total score wins;
    /// equal scores go to the lowest node name.
    pub fn place(&self, job: &JobInfo, task: &TaskInfo, nodes: &[&NodeInfo]) -> SchedResult<String> {
        let mut feasible = Vec::new();
        let mut reasons = Vec::new();
        for node in nodes {
            match self.plugins.iter().try_for_each(|p| p.filter(job, task, node)) {
                Ok(()) => feasible.push(*node),
                Err(e) => reasons.push(e.to_string()),
            }
        }

        if feasible.is_empty() {
            return Err(SchedError::Predicate(format!(
                "task {} fits no node: {}",
                task.name,
                if reasons.is_empty() {
                    "no nodes".to_string()
                } else {
                    reasons.join("; ")
                }
            )));
        }

        let mut totals: BTreeMap<String, f64> =
            feasible.iter().map(|n| (n.name.clone(), 0.0)).collect();
        for plugin in &self.plugins {
            for (node, score) in plugin.score(job, task, &feasible)? {
                if let Some(total) = totals.get_mut(&node) {
                    *total += score;
                }
            }
        }

        // BTreeMap order makes the first maximum the lowest name
        let mut best: Option<(&String, f64)> = None;
        for (node, score) in &totals {
            if best.map_or(true, |(_, s)| *score > s) {
                best = Some((node, *score));
            }
        }

        let (node, score) = best.ok_or_else(|| SchedError::Internal("no node scored".to_string()))?;
        debug!(task = %task.name, node = %node, score = score, "Placement chosen");
        Ok(node.clone())
    }
}

/// A committed task placement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindRecord {
    pub job: JobId,
    pub task: String,
    pub node: String,
    pub devices: Vec<u32>,
}

/// Hands committed placements to the cluster
pub trait Binder: Send {
    fn bind(&mut self, task: &TaskInfo, node: &str, devices: &[u32]) -> SchedResult<()>;
}

/// Binder that only remembers what it was asked to bind
#[derive(Debug, Default)]
pub struct RecordingBinder {
    records: Vec<BindRecord>,
}

impl RecordingBinder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[BindRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<BindRecord> {
        self.records
    }
}

impl Binder for RecordingBinder {
    fn bind(&mut self, task: &TaskInfo, node: &str, devices: &[u32]) -> SchedResult<()> {
        self.records.push(BindRecord {
            job: task.job.clone(),
            task: task.name.clone(),
            node: node.to_string(),
            devices: devices.to_vec(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::ModuleAllocator;
    use gangplank_core::ResourceList;

    const NPU: &str = "huawei.com/Ascend910";

    fn pipeline() -> PlacementPipeline {
        PlacementPipeline::new(Arc::new(ModuleAllocator::module8(8.0)))
    }

    fn cpu_node(name: &str, cpu: u64) -> NodeInfo {
        NodeInfo::new(name, ResourceList::new(cpu * 1000, 0))
    }

    fn npu_node(name: &str, free: &str) -> NodeInfo {
        NodeInfo::new(name, ResourceList::new(8000, 0).with_scalar(NPU, 8)).with_annotation(NPU, free)
    }

    #[test]
    fn test_resource_fit_filter() {
        let mut job = JobInfo::new("c1", "pg1", "q1");
        job.add_task("p1", ResourceList::new(3000, 0));
        let small = cpu_node("n1", 2);

        let err = ResourceFit.filter(&job, &job.tasks[0], &small).unwrap_err();
        assert!(matches!(err, SchedError::Predicate(_)));
        assert!(err.to_string().contains("cpu"));
        assert!(ResourceFit.filter(&job, &job.tasks[0], &cpu_node("n2", 4)).is_ok());
    }

    #[test]
    fn test_place_prefers_emptier_node() {
        let mut job = JobInfo::new("c1", "pg1", "q1");
        job.add_task("p1", ResourceList::new(1000, 0));
        let mut busy = cpu_node("a", 4);
        busy.used = ResourceList::new(2000, 0);
        let idle = cpu_node("b", 4);

        let node = pipeline().place(&job, &job.tasks[0], &[&busy, &idle]).unwrap();
        assert_eq!(node, "b");
    }

    #[test]
    fn test_place_ties_go_to_lowest_name() {
        let mut job = JobInfo::new("c1", "pg1", "q1");
        job.add_task("p1", ResourceList::new(1000, 0));
        let a = cpu_node("a", 4);
        let b = cpu_node("b", 4);

        assert_eq!(pipeline().place(&job, &job.tasks[0], &[&b, &a]).unwrap(), "a");
    }

    #[test]
    fn test_place_uses_topology_score() {
        let mut job = JobInfo::new("c1", "pg1", "q1");
        job.add_task("p1", ResourceList::new(1000, 0).with_scalar(NPU, 2));
        let loose = npu_node("a", "Ascend910-0,Ascend910-1,Ascend910-2");
        let tight = npu_node("b", "Ascend910-4,Ascend910-5");

        assert_eq!(pipeline().place(&job, &job.tasks[0], &[&loose, &tight]).unwrap(), "b");
    }

    #[test]
    fn test_place_no_feasible_node() {
        let mut job = JobInfo::new("c1", "pg1", "q1");
        job.add_task("p1", ResourceList::new(1000, 0).with_scalar(NPU, 4));
        let n = npu_node("a", "Ascend910-0,Ascend910-5");

        let err = pipeline().place(&job, &job.tasks[0], &[&n]).unwrap_err();
        assert!(err.is_infeasible());
        assert!(pipeline().place(&job, &job.tasks[0], &[]).is_err());
    }

    #[test]
    fn test_recording_binder() {
        let task = TaskInfo::new("c1/pg1", "p1", ResourceList::new(1000, 0));
        let mut binder = RecordingBinder::new();
        binder.bind(&task, "n1", &[0, 1]).unwrap();

        assert_eq!(
            binder.records(),
            &[BindRecord {
                job: "c1/pg1".to_string(),
                task: "p1".to_string(),
                node: "n1".to_string(),
                devices: vec![0, 1],
            }]
        );
    }
}
