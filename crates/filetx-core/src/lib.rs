//! Core types shared across filetx.
//!
//! This crate provides the error taxonomy used by the operation engine,
//! the engine and scheduler configuration, and a small amount of system
//! probing used to size concurrency limits.

mod config;
mod error;
mod system;

pub use config::{EngineConfig, EngineConfigBuilder, SchedulerConfig, SchedulerConfigBuilder};
pub use error::{OpsError, OpsResult};
pub use system::{chunk_width_for_memory, cpu_count, pool_size_for, total_memory_bytes};
