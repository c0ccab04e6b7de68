//! Queue model and dequeue strategy parsing

use gangplank_core::{QueueId, QueueSpec, ResourceList};
use std::sync::Arc;
use tracing::warn;

/// Annotation key selecting a queue's dequeue strategy
pub const DEQUEUE_STRATEGY_ANNOTATION: &str = "gangplank.dev/dequeue-strategy";
/// Annotation key holding the queue's hierarchy path, e.g. `root/eng/ml`
pub const HIERARCHY_ANNOTATION: &str = "gangplank.dev/hierarchy";
/// Annotation key holding per-level hierarchy weights, e.g. `1/2/4`
pub const HIERARCHY_WEIGHTS_ANNOTATION: &str = "gangplank.dev/hierarchy-weights";

/// What a queue does when the job at its head cannot be placed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DequeueStrategy {
    /// Keep retrying the head job; nothing behind it is attempted
    Fifo,
    /// Skip the failed job and try the next one in the same pass
    #[default]
    Traverse,
}

impl DequeueStrategy {
    /// Literal annotation value
    pub fn as_str(&self) -> &'static str {
        match self {
            DequeueStrategy::Fifo => "fifo",
            DequeueStrategy::Traverse => "traverse",
        }
    }

    /// Parse an exact, case-sensitive annotation value
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "fifo" => Some(DequeueStrategy::Fifo),
            "traverse" => Some(DequeueStrategy::Traverse),
            _ => None,
        }
    }

    /// Resolve the strategy of a queue object
    ///
    /// A missing or empty annotation means the default. Any other
    /// unrecognized value also means the default, with a warning.
    pub fn from_queue(queue: &QueueSpec) -> Self {
        match queue.annotations.get(DEQUEUE_STRATEGY_ANNOTATION) {
            None => DequeueStrategy::default(),
            Some(value) if value.is_empty() => DequeueStrategy::default(),
            Some(value) => DequeueStrategy::parse(value).unwrap_or_else(|| {
                let fallback = DequeueStrategy::default();
                warn!(
                    queue = %queue.name,
                    strategy = %value,
                    default = fallback.as_str(),
                    "Invalid dequeue strategy, using default"
                );
                fallback
            }),
        }
    }
}

impl std::fmt::Display for DequeueStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Per-cycle view of a queue
///
/// Built fresh every scheduling cycle. Cloning copies the scalar fields
/// and shares the underlying queue object.
#[derive(Debug, Clone)]
pub struct QueueInfo {
    pub uid: QueueId,
    pub name: String,
    pub weight: i32,
    /// Slash-separated per-level weights
    pub weights: String,
    /// Slash-separated path from the root queue
    pub hierarchy: String,
    pub dequeue_strategy: DequeueStrategy,
    pub queue: Arc<QueueSpec>,
}

impl QueueInfo {
    /// Build the per-cycle view of a queue object
    pub fn new(queue: Arc<QueueSpec>) -> Self {
        let annotation = |key: &str| queue.annotations.get(key).cloned().unwrap_or_default();

        Self {
            uid: queue.name.clone(),
            name: queue.name.clone(),
            weight: queue.weight,
            weights: annotation(HIERARCHY_WEIGHTS_ANNOTATION),
            hierarchy: annotation(HIERARCHY_ANNOTATION),
            dequeue_strategy: DequeueStrategy::from_queue(&queue),
            queue,
        }
    }

    /// Whether resources lent by `queue` may be reclaimed
    ///
    /// No queue is never reclaimable; an unset flag means reclaimable.
    pub fn reclaimable(queue: Option<&QueueInfo>) -> bool {
        match queue {
            None => false,
            Some(q) => q.queue.reclaimable.unwrap_or(true),
        }
    }

    /// Method form of [`QueueInfo::reclaimable`]
    pub fn is_reclaimable(&self) -> bool {
        Self::reclaimable(Some(self))
    }

    /// Resource cap of the queue, if any
    pub fn capability(&self) -> Option<&ResourceList> {
        self.queue.capability.as_ref()
    }

    /// Hierarchy path segments, root first
    pub fn hierarchy_path(&self) -> Vec<&str> {
        self.hierarchy
            .split('/')
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Per-level weights; malformed entries count as 1.0
    pub fn hierarchy_weights(&self) -> Vec<f64> {
        self.weights
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|w| {
                w.parse::<f64>().unwrap_or_else(|_| {
                    warn!(queue = %self.name, weight = %w, "Invalid hierarchy weight, using 1");
                    1.0
                })
            })
            .collect()
    }
}
