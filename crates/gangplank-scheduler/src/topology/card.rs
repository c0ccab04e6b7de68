//! Multi-chip card nodes
//!
//! A node holds several cards, each carrying `card_size` chips. A task
//! never spans cards, so allocation picks the card whose free chips fit
//! the request most tightly.

use gangplank_core::{
    DeviceCodec, JobInfo, NodeInfo, SchedError, SchedResult, TaskInfo, ValidateResult,
};
use std::collections::BTreeMap;
use tracing::debug;

use super::{TopologyAllocator, DISTRIBUTED_INFER_LABEL, TASK_NUM_INVALID};
use crate::priority::{affinity_score, affinity_table, ascending_priority, group_devices};

const RESOURCE_NAME: &str = "huawei.com/Ascend310P";
const DEVICE_PREFIX: &str = "Ascend310P-";

/// Reason reported when a distributed inference job has too many tasks
pub const JOB_TASK_NUM_INVALID: &str = "job task num is invalid";

/// Allocator for nodes built from fixed-size cards
#[derive(Debug, Clone)]
pub struct CardAllocator {
    name: &'static str,
    codec: DeviceCodec,
    card_size: u32,
    capacity: u32,
    score_weight: f64,
    table: Vec<Vec<u32>>,
}

impl CardAllocator {
    /// Create an allocator for cards of `card_size` chips, `capacity` chips per node
    pub fn new(
        name: &'static str,
        codec: DeviceCodec,
        card_size: u32,
        capacity: u32,
        score_weight: f64,
    ) -> Self {
        Self {
            name,
            codec,
            card_size,
            capacity,
            score_weight,
            table: affinity_table(card_size),
        }
    }

    /// Dual-chip cards, up to eight per node
    pub fn card_duo(score_weight: f64) -> Self {
        Self::new(
            "card-duo",
            DeviceCodec::new(RESOURCE_NAME, DEVICE_PREFIX),
            2,
            16,
            score_weight,
        )
    }

    fn check_request(&self, request: u32) -> SchedResult<()> {
        if request < 1 || request > self.card_size {
            return Err(SchedError::InvalidRequest(format!(
                "illegal request npu number: {}",
                request
            )));
        }
        Ok(())
    }

    /// Free chips grouped per card
    pub fn card_groups(&self, devices: &[u32]) -> Vec<Vec<u32>> {
        group_devices(devices, self.card_size)
    }

    /// Best affinity score over all cards; lower is better
    pub fn best_score(&self, request: u32, devices: &[u32]) -> SchedResult<u32> {
        self.check_request(request)?;

        let infeasible = self.table.len() as u32;
        let mut best = infeasible;
        for group in self.card_groups(devices) {
            best = best.min(affinity_score(&self.table, request as usize, group.len()));
            if best == 0 {
                break;
            }
        }

        if best == infeasible {
            return Err(SchedError::Infeasible(format!(
                "{:?} not meet req npu({})",
                devices, request
            )));
        }
        Ok(best)
    }

    /// Take chips from the card that fits `request` most tightly
    pub fn select_from(&self, request: u32, devices: &[u32]) -> SchedResult<Vec<u32>> {
        let groups = self.card_groups(devices);
        let n = request as usize;
        for size in ascending_priority(request, self.card_size)? {
            if let Some(group) = groups.iter().find(|g| g.len() == size as usize) {
                return Ok(group[..n].to_vec());
            }
        }
        Err(SchedError::Infeasible(format!(
            "{:?} not meet req npu({})",
            devices, request
        )))
    }
}

impl TopologyAllocator for CardAllocator {
    fn name(&self) -> &'static str {
        self.name
    }

    fn codec(&self) -> &DeviceCodec {
        &self.codec
    }

    fn node_capacity(&self) -> u32 {
        self.capacity
    }

    fn validate_job(&self, job: &JobInfo) -> ValidateResult {
        let distributed_infer =
            job.labels.get(DISTRIBUTED_INFER_LABEL).map(String::as_str) == Some("true");
        let device_tasks = job.device_task_count(self.resource_name());
        if distributed_infer && device_tasks > 1 {
            return ValidateResult::fail(
                JOB_TASK_NUM_INVALID,
                format!("job <{}> task num <{}> is invalid", job.id, device_tasks),
            );
        }

        for task in &job.tasks {
            let request = match self.task_request(task) {
                Ok(n) => n,
                Err(e) => return ValidateResult::fail(TASK_NUM_INVALID, e.to_string()),
            };
            if request > self.card_size {
                return ValidateResult::fail(
                    TASK_NUM_INVALID,
                    format!("task <{}> req npu num <{}> is invalid", task.name, request),
                );
            }
        }
        ValidateResult::ok()
    }

    fn check_feasible(&self, job: &JobInfo, task: &TaskInfo, node: &NodeInfo) -> SchedResult<()> {
        let request = self.task_request(task)?;
        if request == 0 {
            return Ok(());
        }
        self.check_request(request)?;

        let top = self.usable_topology(job, node)?;
        let groups = self.card_groups(&top.devices());
        if groups.iter().any(|g| g.len() >= request as usize) {
            return Ok(());
        }
        Err(SchedError::Infeasible(format!(
            "node {} has no card with {} free chips",
            node.name, request
        )))
    }

    fn score(
        &self,
        job: &JobInfo,
        task: &TaskInfo,
        nodes: &[&NodeInfo],
    ) -> SchedResult<BTreeMap<String, f64>> {
        if nodes.is_empty() {
            return Err(SchedError::Argument("no nodes to score".to_string()));
        }
        let request = self.task_request(task)?;
        self.check_request(request)?;

        let mut scores = BTreeMap::new();
        for node in nodes {
            let best = self
                .usable_topology(job, node)
                .and_then(|top| self.best_score(request, &top.devices()));
            match best {
                Ok(best) => {
                    let score = self.score_weight * (self.card_size as f64 - best as f64);
                    scores.insert(node.name.clone(), score);
                }
                Err(e) => debug!(node = %node.name, error = %e, "Node left unscored"),
            }
        }
        Ok(scores)
    }

    fn select_devices(&self, job: &JobInfo, task: &TaskInfo, node: &NodeInfo) -> SchedResult<Vec<u32>> {
        let top = self.usable_topology(job, node)?;
        self.select_from(self.task_request(task)?, &top.devices())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gangplank_core::ResourceList;

    fn job_with_tasks(requests: &[u64]) -> JobInfo {
        let mut job = JobInfo::new("c1", "infer", "q1");
        for (i, n) in requests.iter().enumerate() {
            job.add_task(
                format!("p{}", i),
                ResourceList::new(1000, 0).with_scalar(RESOURCE_NAME, *n),
            );
        }
        job
    }

    fn node(name: &str, devices: &[u32]) -> NodeInfo {
        let codec = DeviceCodec::new(RESOURCE_NAME, DEVICE_PREFIX);
        NodeInfo::new(name, ResourceList::new(64_000, 0).with_scalar(RESOURCE_NAME, 16))
            .with_annotation(RESOURCE_NAME, codec.encode(devices))
    }

    #[test]
    fn test_card_groups() {
        let a = CardAllocator::card_duo(8.0);
        assert_eq!(
            a.card_groups(&[0, 1, 3, 6]),
            vec![vec![0, 1], vec![3], vec![6]]
        );
        // raw slices are grouped without sizing by the largest index
        assert_eq!(a.card_groups(&[u32::MAX]), vec![vec![u32::MAX]]);
        assert!(a.select_from(2, &[u32::MAX]).is_err());
    }

    #[test]
    fn test_best_score() {
        let a = CardAllocator::card_duo(8.0);
        // a half-used card is the exact fit for one chip
        assert_eq!(a.best_score(1, &[0, 1, 3]).unwrap(), 0);
        assert_eq!(a.best_score(1, &[0, 1]).unwrap(), 1);
        assert_eq!(a.best_score(2, &[0, 1]).unwrap(), 0);
        assert!(a.best_score(2, &[1, 2]).is_err());
        assert!(a.best_score(3, &[0, 1, 2, 3]).is_err());
    }

    #[test]
    fn test_select_prefers_fragmented_card() {
        let a = CardAllocator::card_duo(8.0);
        assert_eq!(a.select_from(1, &[0, 1, 3]).unwrap(), vec![3]);
        assert_eq!(a.select_from(2, &[0, 1, 3]).unwrap(), vec![0, 1]);
        assert!(a.select_from(2, &[1, 2, 5]).is_err());
    }

    #[test]
    fn test_select_is_deterministic() {
        let a = CardAllocator::card_duo(8.0);
        let first = a.select_from(1, &[2, 3, 5, 7]).unwrap();
        assert_eq!(first, vec![5]);
        for _ in 0..10 {
            assert_eq!(a.select_from(1, &[2, 3, 5, 7]).unwrap(), first);
        }
    }

    #[test]
    fn test_score_nodes() {
        let a = CardAllocator::card_duo(8.0);
        let job = job_with_tasks(&[1]);
        let tight = node("n1", &[3]);
        let loose = node("n2", &[0, 1]);
        let empty = node("n3", &[]);

        let scores = a.score(&job, &job.tasks[0], &[&tight, &loose, &empty]).unwrap();
        assert_eq!(scores["n1"], 16.0);
        assert_eq!(scores["n2"], 8.0);
        assert!(!scores.contains_key("n3"));
    }

    #[test]
    fn test_allocate_and_release() {
        let a = CardAllocator::card_duo(8.0);
        let mut job = job_with_tasks(&[2]);
        let mut n = node("n1", &[0, 2, 3]);

        let view = job.clone();
        let selected = a.allocate(&view, &mut job.tasks[0], &mut n).unwrap();
        assert_eq!(selected, vec![2, 3]);
        assert_eq!(n.annotations[RESOURCE_NAME], "Ascend310P-0");

        let restored = a.release(&job.tasks[0], &n);
        assert_eq!(restored.annotations[RESOURCE_NAME], "Ascend310P-0,Ascend310P-2,Ascend310P-3");
    }

    #[test]
    fn test_validate_distributed_infer() {
        let a = CardAllocator::card_duo(8.0);
        let mut job = job_with_tasks(&[1, 1]);
        assert!(a.validate_job(&job).pass);

        job.labels
            .insert(DISTRIBUTED_INFER_LABEL.to_string(), "true".to_string());
        let result = a.validate_job(&job);
        assert!(!result.pass);
        assert_eq!(result.reason, JOB_TASK_NUM_INVALID);

        let single = {
            let mut j = job_with_tasks(&[2]);
            j.labels
                .insert(DISTRIBUTED_INFER_LABEL.to_string(), "true".to_string());
            j
        };
        assert!(a.validate_job(&single).pass);

        // a CPU-only sidecar is not a device task
        let mut sidecar = job_with_tasks(&[1, 0]);
        sidecar
            .labels
            .insert(DISTRIBUTED_INFER_LABEL.to_string(), "true".to_string());
        assert_eq!(sidecar.device_task_count(RESOURCE_NAME), 1);
        assert!(a.validate_job(&sidecar).pass);
    }

    #[test]
    fn test_out_of_range_request() {
        let a = CardAllocator::card_duo(8.0);
        let job = job_with_tasks(&[(1 << 32) + 1]);

        let result = a.validate_job(&job);
        assert!(!result.pass);
        assert_eq!(result.reason, TASK_NUM_INVALID);
        assert!(matches!(
            a.check_feasible(&job, &job.tasks[0], &node("n1", &[0, 1])),
            Err(SchedError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_validate_oversized_task() {
        let a = CardAllocator::card_duo(8.0);
        let result = a.validate_job(&job_with_tasks(&[3]));
        assert!(!result.pass);
        assert_eq!(result.reason, TASK_NUM_INVALID);
    }

    #[test]
    fn test_check_feasible() {
        let a = CardAllocator::card_duo(8.0);
        let job = job_with_tasks(&[2]);
        assert!(a.check_feasible(&job, &job.tasks[0], &node("n1", &[4, 5])).is_ok());
        assert!(a.check_feasible(&job, &job.tasks[0], &node("n1", &[1, 2])).is_err());
    }
}
