//! Queue, Job, Task, Node and resource type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::{SchedError, SchedResult};

/// Job identifier, `namespace/name`
pub type JobId = String;

/// Queue identifier (the queue name)
pub type QueueId = String;

/// Resource quantities requested by a task or offered by a node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceList {
    /// CPU in millicores
    pub cpu_millis: u64,
    /// Memory in bytes
    pub memory_bytes: u64,
    /// Extended resources (accelerators, pods, ...) in whole units
    pub scalars: BTreeMap<String, u64>,
}

impl ResourceList {
    /// Create a resource list with only CPU and memory set
    pub fn new(cpu_millis: u64, memory_bytes: u64) -> Self {
        Self {
            cpu_millis,
            memory_bytes,
            scalars: BTreeMap::new(),
        }
    }

    /// Builder: set an extended resource
    pub fn with_scalar(mut self, name: impl Into<String>, value: u64) -> Self {
        self.scalars.insert(name.into(), value);
        self
    }

    /// Build from Kubernetes-style quantity strings keyed by resource name
    ///
    /// `cpu` is read as cores (`"2"`, `"500m"`), `memory` as bytes
    /// (`"4G"`, `"16Gi"`), everything else as whole units.
    pub fn from_quantities(quantities: &BTreeMap<String, String>) -> SchedResult<Self> {
        let mut list = ResourceList::default();
        for (name, raw) in quantities {
            let value = parse_quantity(raw)?;
            match name.as_str() {
                "cpu" => list.cpu_millis = (value * 1000.0).round() as u64,
                "memory" => list.memory_bytes = value.round() as u64,
                _ => {
                    list.scalars.insert(name.clone(), value.round() as u64);
                }
            }
        }
        Ok(list)
    }

    /// Amount of an extended resource (0 if absent)
    pub fn scalar(&self, name: &str) -> u64 {
        self.scalars.get(name).copied().unwrap_or(0)
    }

    /// A best-effort request asks for nothing at all
    pub fn is_empty(&self) -> bool {
        self.cpu_millis == 0 && self.memory_bytes == 0 && self.scalars.values().all(|v| *v == 0)
    }

    /// Whether every requested dimension fits into `other`
    pub fn less_equal(&self, other: &ResourceList) -> bool {
        self.cpu_millis <= other.cpu_millis
            && self.memory_bytes <= other.memory_bytes
            && self
                .scalars
                .iter()
                .all(|(name, value)| *value == 0 || *value <= other.scalar(name))
    }

    /// Add `other` into this list
    pub fn add(&mut self, other: &ResourceList) {
        self.cpu_millis += other.cpu_millis;
        self.memory_bytes += other.memory_bytes;
        for (name, value) in &other.scalars {
            *self.scalars.entry(name.clone()).or_insert(0) += value;
        }
    }

    /// Subtract `other`, saturating at zero
    pub fn sub(&mut self, other: &ResourceList) {
        self.cpu_millis = self.cpu_millis.saturating_sub(other.cpu_millis);
        self.memory_bytes = self.memory_bytes.saturating_sub(other.memory_bytes);
        for (name, value) in &other.scalars {
            if let Some(current) = self.scalars.get_mut(name) {
                *current = current.saturating_sub(*value);
            }
        }
    }

    /// Names of the dimensions in which this list exceeds `other`
    pub fn exceeded_dimensions(&self, other: &ResourceList) -> Vec<String> {
        let mut dims = Vec::new();
        if self.cpu_millis > other.cpu_millis {
            dims.push("cpu".to_string());
        }
        if self.memory_bytes > other.memory_bytes {
            dims.push("memory".to_string());
        }
        for (name, value) in &self.scalars {
            if *value > 0 && *value > other.scalar(name) {
                dims.push(name.clone());
            }
        }
        dims
    }

    /// Largest fraction of `total` used by this list in any dimension
    pub fn dominant_share(&self, total: &ResourceList) -> f64 {
        let ratio = |used: u64, cap: u64| {
            if cap == 0 {
                0.0
            } else {
                used as f64 / cap as f64
            }
        };

        let mut share = ratio(self.cpu_millis, total.cpu_millis)
            .max(ratio(self.memory_bytes, total.memory_bytes));
        for (name, value) in &self.scalars {
            share = share.max(ratio(*value, total.scalar(name)));
        }
        share
    }
}

impl std::fmt::Display for ResourceList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cpu {}m, memory {}", self.cpu_millis, self.memory_bytes)?;
        for (name, value) in &self.scalars {
            write!(f, ", {} {}", name, value)?;
        }
        Ok(())
    }
}

/// Parse a Kubernetes-style quantity into a plain number
///
/// Supports decimal (`k`, `M`, `G`, `T`, `P`), binary (`Ki` .. `Pi`) and
/// milli (`m`) suffixes.
pub fn parse_quantity(raw: &str) -> SchedResult<f64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);

    let number: f64 = number
        .parse()
        .map_err(|_| SchedError::Config(format!("invalid quantity '{}'", raw)))?;

    let multiplier = match suffix {
        "" => 1.0,
        "m" => 1e-3,
        "k" | "K" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "Pi" => 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0,
        other => {
            return Err(SchedError::Config(format!(
                "unknown quantity suffix '{}' in '{}'",
                other, raw
            )))
        }
    };

    Ok(number * multiplier)
}

/// Persisted queue object, as stored by the cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSpec {
    /// Queue name
    pub name: String,
    /// Fairness weight
    pub weight: i32,
    /// Whether other queues may reclaim resources lent by this queue
    pub reclaimable: Option<bool>,
    /// Upper bound on the resources this queue may hold
    pub capability: Option<ResourceList>,
    /// Free-form annotations (dequeue strategy, hierarchy, ...)
    pub annotations: BTreeMap<String, String>,
}

impl QueueSpec {
    /// Create a queue with the given weight and no annotations
    pub fn new(name: impl Into<String>, weight: i32) -> Self {
        Self {
            name: name.into(),
            weight,
            reclaimable: None,
            capability: None,
            annotations: BTreeMap::new(),
        }
    }

    /// Builder: set an annotation
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }
}

/// Job (pod group) phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    /// Waiting for the enqueue gate
    Pending,
    /// Admitted to its queue, waiting for placement
    Inqueue,
    /// All tasks placed
    Running,
    /// Finished
    Completed,
    /// Phase could not be determined
    Unknown,
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPhase::Pending => write!(f, "Pending"),
            JobPhase::Inqueue => write!(f, "Inqueue"),
            JobPhase::Running => write!(f, "Running"),
            JobPhase::Completed => write!(f, "Completed"),
            JobPhase::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for placement
    Pending,
    /// Placed within the current cycle, not yet bound
    Allocated,
    /// Bound to a node
    Bound,
    /// Running on a node
    Running,
    /// Finished successfully
    Succeeded,
    /// Finished with an error
    Failed,
}

impl TaskStatus {
    /// Whether a task in this status holds resources on its node
    pub fn occupies_node(&self) -> bool {
        matches!(
            self,
            TaskStatus::Allocated | TaskStatus::Bound | TaskStatus::Running
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "Pending"),
            TaskStatus::Allocated => write!(f, "Allocated"),
            TaskStatus::Bound => write!(f, "Bound"),
            TaskStatus::Running => write!(f, "Running"),
            TaskStatus::Succeeded => write!(f, "Succeeded"),
            TaskStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// A schedulable unit of a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    /// Unique task identifier
    pub uid: Uuid,
    /// Task name, unique within its job
    pub name: String,
    /// Owning job
    pub job: JobId,
    /// Current status
    pub status: TaskStatus,
    /// Requested resources
    pub resreq: ResourceList,
    /// Node the task is placed on, if any
    pub node_name: Option<String>,
    /// Annotations (selected devices are written here)
    pub annotations: BTreeMap<String, String>,
}

impl TaskInfo {
    /// Create a pending task
    pub fn new(job: impl Into<JobId>, name: impl Into<String>, resreq: ResourceList) -> Self {
        Self {
            uid: Uuid::new_v4(),
            name: name.into(),
            job: job.into(),
            status: TaskStatus::Pending,
            resreq,
            node_name: None,
            annotations: BTreeMap::new(),
        }
    }

    /// Task with no resource request at all
    pub fn is_best_effort(&self) -> bool {
        self.resreq.is_empty()
    }
}

/// Outcome of a structural job check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateResult {
    /// Whether the job passed
    pub pass: bool,
    /// Short machine-readable reason
    pub reason: String,
    /// Human-readable explanation
    pub message: String,
}

impl ValidateResult {
    /// A passing result
    pub fn ok() -> Self {
        Self {
            pass: true,
            reason: String::new(),
            message: String::new(),
        }
    }

    /// A failing result
    pub fn fail(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            pass: false,
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// Job (pod group): a gang of tasks scheduled as a unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    /// `namespace/name`
    pub id: JobId,
    /// Job name
    pub name: String,
    /// Job namespace
    pub namespace: String,
    /// Queue the job belongs to
    pub queue: QueueId,
    /// Current phase
    pub phase: JobPhase,
    /// Minimum number of tasks that make up the gang
    pub min_available: u32,
    /// Higher priority jobs are dequeued first
    pub priority: i32,
    /// Creation timestamp, breaks priority ties
    pub created_at: DateTime<Utc>,
    /// Job labels
    pub labels: BTreeMap<String, String>,
    /// Tasks in creation order
    pub tasks: Vec<TaskInfo>,
}

impl JobInfo {
    /// Create an empty, admitted job
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        queue: impl Into<QueueId>,
    ) -> Self {
        let namespace = namespace.into();
        let name = name.into();
        Self {
            id: format!("{}/{}", namespace, name),
            name,
            namespace,
            queue: queue.into(),
            phase: JobPhase::Inqueue,
            min_available: 1,
            priority: 0,
            created_at: Utc::now(),
            labels: BTreeMap::new(),
            tasks: Vec::new(),
        }
    }

    /// Append a pending task and return it for further tweaking
    pub fn add_task(&mut self, name: impl Into<String>, resreq: ResourceList) -> &mut TaskInfo {
        let task = TaskInfo::new(self.id.clone(), name, resreq);
        self.tasks.push(task);
        let last = self.tasks.len() - 1;
        &mut self.tasks[last]
    }

    /// Tasks still waiting for placement
    pub fn pending_tasks(&self) -> impl Iterator<Item = &TaskInfo> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
    }

    /// Whether anything is left to place
    pub fn has_pending(&self) -> bool {
        self.pending_tasks().next().is_some()
    }

    /// Whether every pending task is best-effort
    pub fn only_best_effort_pending(&self) -> bool {
        self.has_pending() && self.pending_tasks().all(|t| t.is_best_effort())
    }

    /// Sum of the requests of all pending tasks
    pub fn pending_request(&self) -> ResourceList {
        let mut total = ResourceList::default();
        for task in self.pending_tasks() {
            total.add(&task.resreq);
        }
        total
    }

    /// Number of tasks requesting at least one unit of `resource`
    pub fn device_task_count(&self, resource: &str) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.resreq.scalar(resource) > 0)
            .count()
    }

    /// Look up a task by uid
    pub fn task(&self, uid: &Uuid) -> Option<&TaskInfo> {
        self.tasks.iter().find(|t| &t.uid == uid)
    }

    /// Look up a task by uid, mutably
    pub fn task_mut(&mut self, uid: &Uuid) -> Option<&mut TaskInfo> {
        self.tasks.iter_mut().find(|t| &t.uid == uid)
    }

    /// Gang validity: the job must carry at least `min_available` tasks
    pub fn validate_gang(&self) -> ValidateResult {
        if (self.tasks.len() as u32) < self.min_available {
            return ValidateResult::fail(
                "not enough tasks",
                format!(
                    "job <{}> has {} tasks, less than min available {}",
                    self.id,
                    self.tasks.len(),
                    self.min_available
                ),
            );
        }
        ValidateResult::ok()
    }
}

/// A cluster node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node name
    pub name: String,
    /// Total resources the node offers
    pub allocatable: ResourceList,
    /// Resources held by tasks placed on the node
    pub used: ResourceList,
    /// Node labels
    pub labels: BTreeMap<String, String>,
    /// Node annotations (free device topology lives here)
    pub annotations: BTreeMap<String, String>,
}

impl NodeInfo {
    /// Create an empty node
    pub fn new(name: impl Into<String>, allocatable: ResourceList) -> Self {
        Self {
            name: name.into(),
            allocatable,
            used: ResourceList::default(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    /// Builder: set an annotation
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Resources not yet used
    pub fn idle(&self) -> ResourceList {
        let mut idle = self.allocatable.clone();
        idle.sub(&self.used);
        idle
    }

    /// Account a task's request against this node
    pub fn add_task(&mut self, task: &TaskInfo) {
        self.used.add(&task.resreq);
    }

    /// Return a task's request to this node
    pub fn remove_task(&mut self, task: &TaskInfo) {
        self.used.sub(&task.resreq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("2").unwrap(), 2.0);
        assert_eq!(parse_quantity("500m").unwrap(), 0.5);
        assert_eq!(parse_quantity("4G").unwrap(), 4e9);
        assert_eq!(parse_quantity("1Gi").unwrap(), 1024.0 * 1024.0 * 1024.0);
        assert!(parse_quantity("ten").is_err());
        assert!(parse_quantity("4Q").is_err());
    }

    #[test]
    fn test_resource_list_from_quantities() {
        let mut q = BTreeMap::new();
        q.insert("cpu".to_string(), "1500m".to_string());
        q.insert("memory".to_string(), "1G".to_string());
        q.insert("huawei.com/Ascend910".to_string(), "4".to_string());

        let list = ResourceList::from_quantities(&q).unwrap();
        assert_eq!(list.cpu_millis, 1500);
        assert_eq!(list.memory_bytes, 1_000_000_000);
        assert_eq!(list.scalar("huawei.com/Ascend910"), 4);
        assert_eq!(list.scalar("nvidia.com/gpu"), 0);
    }

    #[test]
    fn test_resource_list_fit() {
        let node = ResourceList::new(2000, 4_000_000_000).with_scalar("pods", 10);
        let small = ResourceList::new(1000, 1_000_000_000);
        let big = ResourceList::new(10_000, 10_000_000_000);

        assert!(small.less_equal(&node));
        assert!(!big.less_equal(&node));
        assert_eq!(big.exceeded_dimensions(&node), vec!["cpu", "memory"]);
        assert!(ResourceList::default().is_empty());
        assert!(!small.is_empty());
    }

    #[test]
    fn test_resource_list_sub_saturates() {
        let mut a = ResourceList::new(1000, 10);
        a.sub(&ResourceList::new(3000, 5));
        assert_eq!(a.cpu_millis, 0);
        assert_eq!(a.memory_bytes, 5);
    }

    #[test]
    fn test_dominant_share() {
        let total = ResourceList::new(4000, 1000);
        let used = ResourceList::new(1000, 500);
        assert_eq!(used.dominant_share(&total), 0.5);
    }

    #[test]
    fn test_job_pending_tasks() {
        let mut job = JobInfo::new("c1", "pg1", "q1");
        job.add_task("p1", ResourceList::new(1000, 0));
        job.add_task("p2", ResourceList::default()).status = TaskStatus::Running;

        assert_eq!(job.id, "c1/pg1");
        assert_eq!(job.phase, JobPhase::Inqueue);
        assert_eq!(job.pending_tasks().count(), 1);
        assert!(!job.only_best_effort_pending());
    }

    #[test]
    fn test_job_only_best_effort() {
        let mut job = JobInfo::new("c1", "pg1", "q1");
        job.add_task("p1", ResourceList::default());
        assert!(job.only_best_effort_pending());

        job.tasks[0].status = TaskStatus::Running;
        assert!(!job.has_pending());
        assert!(!job.only_best_effort_pending());
    }

    #[test]
    fn test_validate_gang() {
        let mut job = JobInfo::new("c1", "pg1", "q1");
        job.min_available = 2;
        job.add_task("p1", ResourceList::new(1000, 0));

        let result = job.validate_gang();
        assert!(!result.pass);
        assert_eq!(result.reason, "not enough tasks");

        job.add_task("p2", ResourceList::new(1000, 0));
        assert!(job.validate_gang().pass);
    }

    #[test]
    fn test_node_idle() {
        let mut node = NodeInfo::new("n1", ResourceList::new(4000, 8_000_000_000));
        let task = TaskInfo::new("c1/pg1", "p1", ResourceList::new(1000, 1_000_000_000));
        node.add_task(&task);
        assert_eq!(node.idle().cpu_millis, 3000);
        node.remove_task(&task);
        assert_eq!(node.idle().cpu_millis, 4000);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(JobPhase::Inqueue.to_string(), "Inqueue");
        assert_eq!(TaskStatus::Bound.to_string(), "Bound");
    }
}
