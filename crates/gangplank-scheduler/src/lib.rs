//! gangplank-scheduler: Queue admission and device allocation for gangplank
//!
//! This crate decides which pending jobs are admitted each cycle:
//! - Per-queue dequeue strategies (FIFO and Traverse)
//! - Gang placement through a filter/score pipeline
//! - Topology-aware accelerator device selection
//! - An async service holding cluster state between cycles

pub mod allocate;
pub mod dequeue;
pub mod placement;
pub mod priority;
pub mod queue;
pub mod scheduler;
pub mod session;
pub mod topology;

pub use allocate::{AllocateAction, CycleReport, JobOutcome, JobReport};
pub use dequeue::{AttemptOutcome, Continuation, JobCursor};
pub use placement::{BindRecord, Binder, PlacementPipeline, PlacementPlugin, RecordingBinder};
pub use queue::{DequeueStrategy, QueueInfo};
pub use scheduler::Scheduler;
pub use session::{Session, Statement};
pub use topology::{allocator_for, CardAllocator, ModuleAllocator, TopologyAllocator};
