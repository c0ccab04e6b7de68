//! Configuration types for gangplank

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::{
    JobInfo, JobPhase, NodeInfo, QueueSpec, ResourceList, SchedError, SchedResult, TaskStatus,
};

/// Main scheduler configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Scheduling cycle configuration
    pub scheduler: CycleConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl SchedulerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> SchedResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SchedError::Config(format!("Failed to read config file: {}", e)))?;
        toml::from_str(&content)
            .map_err(|e| SchedError::Config(format!("Failed to parse config: {}", e)))
    }
}

/// Scheduling cycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    /// Accelerator family whose topology allocator is active
    pub accelerator: AcceleratorFamily,
    /// Multiplier applied to device affinity scores
    pub device_score_weight: f64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            accelerator: AcceleratorFamily::Module8,
            device_score_weight: 8.0,
        }
    }
}

/// Accelerator hardware family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AcceleratorFamily {
    /// 8 devices per node in two modules of 4
    #[serde(rename = "module-8")]
    Module8,
    /// 16 devices per node in two modules of 8, distributed jobs take whole nodes
    #[serde(rename = "module-16")]
    Module16,
    /// Dual-chip cards, up to 16 chips per node
    CardDuo,
}

impl std::fmt::Display for AcceleratorFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcceleratorFamily::Module8 => write!(f, "module-8"),
            AcceleratorFamily::Module16 => write!(f, "module-16"),
            AcceleratorFamily::CardDuo => write!(f, "card-duo"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

/// Cluster snapshot file format (TOML)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSnapshot {
    pub queues: Vec<QueueEntry>,
    pub nodes: Vec<NodeEntry>,
    pub jobs: Vec<JobEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: i32,
    pub reclaimable: Option<bool>,
    pub capability: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    pub name: String,
    pub allocatable: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEntry {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub queue: String,
    #[serde(default = "default_phase")]
    pub phase: JobPhase,
    #[serde(default = "default_min_available")]
    pub min_available: u32,
    #[serde(default)]
    pub priority: i32,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub tasks: Vec<TaskEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEntry {
    pub name: String,
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
    #[serde(default = "default_task_status")]
    pub status: TaskStatus,
    pub node: Option<String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

fn default_weight() -> i32 {
    1
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_phase() -> JobPhase {
    JobPhase::Inqueue
}

fn default_min_available() -> u32 {
    1
}

fn default_task_status() -> TaskStatus {
    TaskStatus::Pending
}

impl ClusterSnapshot {
    /// Load a snapshot from a TOML file
    pub fn from_file(path: &Path) -> SchedResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SchedError::Config(format!("Failed to read snapshot: {}", e)))?;
        Ok(toml::from_str(&content)?)
    }

    /// Convert into model values
    ///
    /// Jobs without a timestamp are stamped in file order, so the file
    /// order decides ties between equal-priority jobs. Tasks that already
    /// occupy a node are charged to that node.
    pub fn into_model(self) -> SchedResult<(Vec<QueueSpec>, Vec<NodeInfo>, Vec<JobInfo>)> {
        let mut queues = Vec::with_capacity(self.queues.len());
        for entry in self.queues {
            let capability = entry
                .capability
                .as_ref()
                .map(ResourceList::from_quantities)
                .transpose()?;
            queues.push(QueueSpec {
                name: entry.name,
                weight: entry.weight,
                reclaimable: entry.reclaimable,
                capability,
                annotations: entry.annotations,
            });
        }

        let mut nodes = Vec::with_capacity(self.nodes.len());
        for entry in self.nodes {
            let mut node = NodeInfo::new(
                entry.name,
                ResourceList::from_quantities(&entry.allocatable)?,
            );
            node.labels = entry.labels;
            node.annotations = entry.annotations;
            nodes.push(node);
        }

        let base = Utc::now();
        let mut jobs = Vec::with_capacity(self.jobs.len());
        for (i, entry) in self.jobs.into_iter().enumerate() {
            let mut job = JobInfo::new(entry.namespace, entry.name, entry.queue);
            job.phase = entry.phase;
            job.min_available = entry.min_available;
            job.priority = entry.priority;
            job.created_at = entry
                .created_at
                .unwrap_or_else(|| base + Duration::milliseconds(i as i64));
            job.labels = entry.labels;

            for task_entry in entry.tasks {
                let resreq = ResourceList::from_quantities(&task_entry.resources)?;
                let task = job.add_task(task_entry.name, resreq);
                task.status = task_entry.status;
                task.node_name = task_entry.node;
                task.annotations = task_entry.annotations;

                if task.status.occupies_node() {
                    let node_name = task.node_name.as_deref().ok_or_else(|| {
                        SchedError::Config(format!(
                            "task {} is {} but names no node",
                            task.name, task.status
                        ))
                    })?;
                    let node = nodes
                        .iter_mut()
                        .find(|n| n.name == node_name)
                        .ok_or_else(|| SchedError::NodeNotFound(node_name.to_string()))?;
                    node.add_task(task);
                }
            }
            jobs.push(job);
        }

        Ok((queues, nodes, jobs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_scheduler_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.scheduler.accelerator, AcceleratorFamily::Module8);
        assert_eq!(config.scheduler.device_score_weight, 8.0);
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_scheduler_config_parse() {
        let toml_str = r#"
[scheduler]
accelerator = "card-duo"

[logging]
level = "debug"
"#;
        let config: SchedulerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.scheduler.accelerator, AcceleratorFamily::CardDuo);
        assert_eq!(config.scheduler.device_score_weight, 8.0);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_accelerator_family_names() {
        let config: CycleConfig = toml::from_str(r#"accelerator = "module-16""#).unwrap();
        assert_eq!(config.accelerator, AcceleratorFamily::Module16);
        assert_eq!(AcceleratorFamily::Module8.to_string(), "module-8");
    }

    #[test]
    fn test_snapshot_parse() {
        let toml_str = r#"
[[queues]]
name = "q1"
annotations = { "gangplank.dev/dequeue-strategy" = "fifo" }

[[nodes]]
name = "n1"
allocatable = { cpu = "2", memory = "4G", pods = "10" }

[[jobs]]
name = "pg1"
namespace = "c1"
queue = "q1"

[[jobs.tasks]]
name = "p1"
resources = { cpu = "10", memory = "10G" }

[[jobs]]
name = "pg2"
namespace = "c1"
queue = "q1"
phase = "running"

[[jobs.tasks]]
name = "p2"
resources = { cpu = "1", memory = "1G" }
status = "running"
node = "n1"
"#;
        let snapshot: ClusterSnapshot = toml::from_str(toml_str).unwrap();
        let (queues, nodes, jobs) = snapshot.into_model().unwrap();

        assert_eq!(queues[0].weight, 1);
        assert_eq!(nodes[0].allocatable.cpu_millis, 2000);
        assert_eq!(nodes[0].allocatable.scalar("pods"), 10);
        assert_eq!(nodes[0].used.cpu_millis, 1000);
        assert_eq!(jobs[0].id, "c1/pg1");
        assert_eq!(jobs[0].phase, JobPhase::Inqueue);
        assert_eq!(jobs[1].phase, JobPhase::Running);
        assert!(jobs[0].created_at < jobs[1].created_at);
    }

    #[test]
    fn test_snapshot_running_task_without_node() {
        let toml_str = r#"
[[jobs]]
name = "pg1"
queue = "q1"

[[jobs.tasks]]
name = "p1"
status = "running"
"#;
        let snapshot: ClusterSnapshot = toml::from_str(toml_str).unwrap();
        assert!(matches!(snapshot.into_model(), Err(SchedError::Config(_))));
    }
}
