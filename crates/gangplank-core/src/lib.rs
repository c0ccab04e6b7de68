//! gangplank-core: Core types for the gangplank scheduler
//!
//! This crate provides the fundamental types used throughout gangplank:
//! - Queue, job, task and node models with resource arithmetic
//! - Accelerator device topology and its annotation encoding
//! - Configuration and cluster snapshot types
//! - Error handling

pub mod config;
pub mod device;
pub mod error;
pub mod model;

pub use config::*;
pub use device::*;
pub use error::*;
pub use model::*;
