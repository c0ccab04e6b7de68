//! Two-module accelerator nodes
//!
//! A node carries two modules of `capacity / 2` devices. Requests up to
//! one module are served inside a module; larger requests take devices in
//! cross-module pairs.

use gangplank_core::{
    DeviceCodec, DeviceTopology, JobInfo, NodeInfo, SchedError, SchedResult, TaskInfo,
    ValidateResult,
};
use std::collections::BTreeMap;
use tracing::debug;

use super::{is_exempt_task, TopologyAllocator, JOB_CHECK_FAILED, TASK_NUM_INVALID};
use crate::priority::{affinity_score, affinity_table, is_valid_module_request, module_priority_array};

const RESOURCE_NAME: &str = "huawei.com/Ascend910";
const DEVICE_PREFIX: &str = "Ascend910-";

/// Allocator for nodes built from two equal device modules
#[derive(Debug, Clone)]
pub struct ModuleAllocator {
    name: &'static str,
    codec: DeviceCodec,
    capacity: u32,
    /// Multi-task jobs must take a whole node per task
    full_node_distributed: bool,
    score_weight: f64,
    table: Vec<Vec<u32>>,
}

impl ModuleAllocator {
    /// Create an allocator for a node of `capacity` devices
    pub fn new(
        name: &'static str,
        codec: DeviceCodec,
        capacity: u32,
        full_node_distributed: bool,
        score_weight: f64,
    ) -> Self {
        Self {
            name,
            codec,
            capacity,
            full_node_distributed,
            score_weight,
            table: affinity_table(capacity / 2),
        }
    }

    /// 8 devices per node, two modules of 4
    pub fn module8(score_weight: f64) -> Self {
        Self::new(
            "module-8",
            DeviceCodec::new(RESOURCE_NAME, DEVICE_PREFIX),
            8,
            false,
            score_weight,
        )
    }

    /// 16 devices per node, two modules of 8; distributed jobs take whole nodes
    pub fn module16(score_weight: f64) -> Self {
        Self::new(
            "module-16",
            DeviceCodec::new(RESOURCE_NAME, DEVICE_PREFIX),
            16,
            true,
            score_weight,
        )
    }

    fn half(&self) -> u32 {
        self.capacity / 2
    }

    /// Check that `top` can hold `request` devices at all
    pub fn judge(&self, request: u32, top: &DeviceTopology, multi_replica: bool) -> SchedResult<()> {
        if !is_valid_module_request(request, self.capacity) {
            return Err(SchedError::InvalidRequest(format!(
                "illegal request npu number: {}",
                request
            )));
        }

        let n = request as usize;
        let fits = if request == self.capacity {
            top.len() == n
        } else {
            top.left().len() >= n
                || top.right().len() >= n
                || (request > self.half() && top.cross_count(multi_replica) >= n)
        };

        if !fits {
            return Err(SchedError::Infeasible(format!(
                "{:?} not meet req npu({})",
                top.devices(),
                request
            )));
        }
        Ok(())
    }

    /// Best affinity score of `top` for `request`; lower is better
    pub fn best_score(&self, request: u32, top: &DeviceTopology, multi_replica: bool) -> SchedResult<u32> {
        if top.is_empty() {
            return Err(SchedError::Infeasible("node top is empty".to_string()));
        }

        let n = request as usize;
        let infeasible = self.table.len() as u32;
        let best = if request == self.capacity {
            if top.len() == n {
                0
            } else {
                infeasible
            }
        } else if request > self.half() {
            affinity_score(&self.table, n / 2, top.cross_count(multi_replica) / 2)
        } else {
            let left = top.left().len();
            let right = top.right().len();
            match (left, right) {
                (_, 0) => affinity_score(&self.table, n, left),
                (0, _) => affinity_score(&self.table, n, right),
                _ => affinity_score(&self.table, n, left).min(affinity_score(&self.table, n, right)),
            }
        };

        if best == infeasible {
            return Err(SchedError::Infeasible(format!(
                "{:?} has no fit for req npu({})",
                top.devices(),
                request
            )));
        }
        Ok(best)
    }

    /// Take the tightest group in `top` that holds `request` devices
    ///
    /// Candidate sizes are tried in priority order, each against the left
    /// module, the right module and then the cross-module group.
    pub fn select_from(
        &self,
        request: u32,
        top: &DeviceTopology,
        multi_replica: bool,
    ) -> SchedResult<Vec<u32>> {
        let n = request as usize;
        if request == self.capacity {
            if top.len() == n {
                return Ok(top.devices());
            }
            return Err(SchedError::Infeasible(format!(
                "{:?} not meet req npu({})",
                top.devices(),
                request
            )));
        }

        let groups = [top.left(), top.right(), top.cross_group(multi_replica)];
        for size in module_priority_array(request, self.capacity)? {
            if let Some(group) = groups.iter().find(|g| g.len() == size as usize) {
                return Ok(group[..n].to_vec());
            }
        }

        Err(SchedError::Infeasible(format!(
            "{:?} not meet req npu({})",
            top.devices(),
            request
        )))
    }

    fn validate_full_node(&self, job: &JobInfo) -> ValidateResult {
        for task in &job.tasks {
            let request = match self.task_request(task) {
                Ok(n) => n,
                Err(e) => return ValidateResult::fail(TASK_NUM_INVALID, e.to_string()),
            };
            if request == 0 && is_exempt_task(task) {
                continue;
            }
            if request != self.capacity {
                return ValidateResult::fail(
                    JOB_CHECK_FAILED,
                    format!(
                        "distributed job require npu {}, instead of {}",
                        self.capacity, request
                    ),
                );
            }
        }
        ValidateResult::ok()
    }
}

impl TopologyAllocator for ModuleAllocator {
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
        if self.full_node_distributed && job.tasks.len() > 1 {
            return self.validate_full_node(job);
        }

        for task in &job.tasks {
            let request = match self.task_request(task) {
                Ok(n) => n,
                Err(e) => return ValidateResult::fail(TASK_NUM_INVALID, e.to_string()),
            };
            if request == 0 {
                continue;
            }
            if !is_valid_module_request(request, self.capacity) {
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
        let top = self.usable_topology(job, node)?;
        self.judge(request, &top, self.is_multi_replica(job))
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
        if request == 0 {
            return Err(SchedError::Argument(format!(
                "task {} requests no {}",
                task.name,
                self.resource_name()
            )));
        }

        let multi = self.is_multi_replica(job);
        let mut scores = BTreeMap::new();
        for node in nodes {
            let best = self
                .usable_topology(job, node)
                .and_then(|top| self.best_score(request, &top, multi));
            match best {
                Ok(best) => {
                    let score = self.score_weight * (self.table.len() as f64 - best as f64);
                    scores.insert(node.name.clone(), score);
                }
                Err(e) => debug!(node = %node.name, error = %e, "Node left unscored"),
            }
        }
        Ok(scores)
    }

    fn select_devices(&self, job: &JobInfo, task: &TaskInfo, node: &NodeInfo) -> SchedResult<Vec<u32>> {
        let top = self.usable_topology(job, node)?;
        self.select_from(self.task_request(task)?, &top, self.is_multi_replica(job))
    }
}
