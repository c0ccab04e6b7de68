//! Topology-aware accelerator allocation
//!
//! One [`TopologyAllocator`] contract, implemented per hardware family.
//! The active family is picked once from static configuration.

mod card;
mod module;

pub use card::CardAllocator;
pub use module::ModuleAllocator;

use gangplank_core::{
    AcceleratorFamily, DeviceCodec, DeviceTopology, JobInfo, NodeInfo, SchedError, SchedResult,
    TaskInfo, ValidateResult,
};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Task annotation marking a task that is handled by the scheduler itself
pub const TASK_SPEC_ANNOTATION: &str = "gangplank.dev/task-spec";
/// Value of [`TASK_SPEC_ANNOTATION`] exempting a task from device checks
pub const TASK_SPEC_SCHEDULER: &str = "scheduler";
/// Task annotation opting a task out of device allocation
pub const SKIP_DEVICE_PLUGIN_ANNOTATION: &str = "gangplank.dev/skip-device-plugin";
/// Value of [`SKIP_DEVICE_PLUGIN_ANNOTATION`] that enables the opt-out
pub const SKIP_DEVICE_PLUGIN_ENABLED: &str = "skip";
/// Job label marking a distributed inference job
pub const DISTRIBUTED_INFER_LABEL: &str = "gangplank.dev/distributed-infer";

/// Reason reported when a job fails a structural check
pub const JOB_CHECK_FAILED: &str = "job check failed";
/// Reason reported when a task asks for a device count the family cannot serve
pub const TASK_NUM_INVALID: &str = "task req npu num invalid";

/// Chooses concrete accelerator devices for tasks on nodes
pub trait TopologyAllocator: Send + Sync {
    /// Allocator name, for logs
    fn name(&self) -> &'static str;

    /// Annotation codec for this family's devices
    fn codec(&self) -> &DeviceCodec;

    /// Devices on a fully free node
    fn node_capacity(&self) -> u32;

    /// Structural check of a job before it may be dequeued
    fn validate_job(&self, job: &JobInfo) -> ValidateResult;

    /// Whether `node` can serve `task` at all
    fn check_feasible(&self, job: &JobInfo, task: &TaskInfo, node: &NodeInfo) -> SchedResult<()>;

    /// Weighted affinity score per node; infeasible nodes are left out
    fn score(
        &self,
        job: &JobInfo,
        task: &TaskInfo,
        nodes: &[&NodeInfo],
    ) -> SchedResult<BTreeMap<String, f64>>;

    /// Pick the devices `task` should use on `node`
    fn select_devices(&self, job: &JobInfo, task: &TaskInfo, node: &NodeInfo)
        -> SchedResult<Vec<u32>>;

    /// Resource name this allocator serves
    fn resource_name(&self) -> &str {
        self.codec().resource_name()
    }

    /// Number of devices a task asks for
    ///
    /// A count that does not fit a `u32` is an invalid request.
    fn task_request(&self, task: &TaskInfo) -> SchedResult<u32> {
        let requested = task.resreq.scalar(self.resource_name());
        u32::try_from(requested).map_err(|_| {
            SchedError::InvalidRequest(format!(
                "task {} req npu num {} is out of range",
                task.name, requested
            ))
        })
    }

    /// Whether the job runs more than one device task
    fn is_multi_replica(&self, job: &JobInfo) -> bool {
        job.device_task_count(self.resource_name()) > 1
    }

    /// Free devices on `node` that `job` may use
    ///
    /// Unhealthy devices are never usable. Devices with a broken
    /// inter-node link are usable only by single-task jobs.
    fn usable_topology(&self, job: &JobInfo, node: &NodeInfo) -> SchedResult<DeviceTopology> {
        let codec = self.codec();
        if !node.annotations.contains_key(codec.resource_name()) {
            return Err(SchedError::Argument(format!(
                "node {} has no {} annotation",
                node.name,
                codec.resource_name()
            )));
        }

        let free = codec.read(&node.annotations, codec.resource_name())?;
        let mut excluded = codec.read(&node.annotations, &codec.unhealthy_key())?;
        if self.is_multi_replica(job) {
            excluded.extend(codec.read(&node.annotations, &codec.network_unhealthy_key())?);
        }

        let capacity = self.node_capacity();
        if let Some(bad) = free.iter().find(|d| **d >= capacity) {
            return Err(SchedError::Argument(format!(
                "node {} reports device {} beyond capacity {}",
                node.name, bad, capacity
            )));
        }

        Ok(DeviceTopology::new(free, capacity).without(&excluded))
    }

    /// Select devices and record them on both the node and the task
    ///
    /// The selected devices leave the node's free list and are written to
    /// the task annotation the node's device plugin reads.
    fn allocate(&self, job: &JobInfo, task: &mut TaskInfo, node: &mut NodeInfo) -> SchedResult<Vec<u32>> {
        let selected = self.select_devices(job, task, node)?;
        let codec = self.codec();

        let free = codec.read(&node.annotations, codec.resource_name())?;
        let remaining = DeviceTopology::new(free, self.node_capacity()).without(&selected);
        node.annotations.insert(
            codec.resource_name().to_string(),
            codec.encode(&remaining.devices()),
        );
        task.annotations
            .insert(codec.resource_name().to_string(), codec.encode(&selected));

        debug!(
            allocator = self.name(),
            task = %task.name,
            node = %node.name,
            devices = ?selected,
            "Selected devices"
        );
        Ok(selected)
    }

    /// Node with the task's devices returned to the free list
    ///
    /// Set union: releasing devices that are already free is a no-op.
    fn release(&self, task: &TaskInfo, node: &NodeInfo) -> NodeInfo {
        let mut released = node.clone();
        let codec = self.codec();

        let held = match codec.read(&task.annotations, codec.resource_name()) {
            Ok(held) => held,
            Err(e) => {
                warn!(task = %task.name, error = %e, "Ignoring malformed device annotation");
                return released;
            }
        };
        if held.is_empty() {
            return released;
        }

        let free = match codec.read(&node.annotations, codec.resource_name()) {
            Ok(free) => free,
            Err(e) => {
                warn!(node = %node.name, error = %e, "Ignoring malformed device annotation");
                return released;
            }
        };

        let merged = DeviceTopology::new(free, self.node_capacity()).union(&held);
        released.annotations.insert(
            codec.resource_name().to_string(),
            codec.encode(&merged.devices()),
        );
        released
    }
}

/// Build the allocator for a hardware family
pub fn allocator_for(family: AcceleratorFamily, score_weight: f64) -> Box<dyn TopologyAllocator> {
    match family {
        AcceleratorFamily::Module8 => Box::new(ModuleAllocator::module8(score_weight)),
        AcceleratorFamily::Module16 => Box::new(ModuleAllocator::module16(score_weight)),
        AcceleratorFamily::CardDuo => Box::new(CardAllocator::card_duo(score_weight)),
    }
}

/// Whether a zero-device task is exempt from per-task device checks
pub(crate) fn is_exempt_task(task: &TaskInfo) -> bool {
    task.annotations.get(TASK_SPEC_ANNOTATION).map(String::as_str) == Some(TASK_SPEC_SCHEDULER)
        || task
            .annotations
            .get(SKIP_DEVICE_PLUGIN_ANNOTATION)
            .map(String::as_str)
            == Some(SKIP_DEVICE_PLUGIN_ENABLED)
}
