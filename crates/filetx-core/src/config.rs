//! Engine and scheduler configuration types.

use std::path::PathBuf;
use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::system::{chunk_width_for_memory, cpu_count, pool_size_for, total_memory_bytes};

/// Smallest number of batch items executed concurrently.
pub const MIN_CHUNK_WIDTH: usize = 4;
/// Largest number of batch items executed concurrently.
pub const MAX_CHUNK_WIDTH: usize = 16;

const FOURTEEN_DAYS: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// Configuration for the file operation engine.
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct EngineConfig {
    /// Application data directory; backups and history live below it.
    pub data_dir: PathBuf,

    /// Maximum entries kept on each of the undo and redo stacks.
    #[builder(default = "50")]
    #[serde(default = "default_undo_capacity")]
    pub undo_capacity: usize,

    /// Stashed backups older than this are deleted on prune.
    #[builder(default = "FOURTEEN_DAYS")]
    #[serde(default = "default_stash_max_age")]
    pub stash_max_age: Duration,

    /// Maximum number of stashed backups kept after pruning.
    #[builder(default = "200")]
    #[serde(default = "default_stash_max_files")]
    pub stash_max_files: usize,

    /// Attempts at finding a free sibling name for an overwrite backup.
    #[builder(default = "10")]
    #[serde(default = "default_backup_retries")]
    pub backup_retries: u32,

    /// Concurrent items per executor chunk (None = derive from memory).
    #[builder(default)]
    #[serde(default)]
    pub chunk_width: Option<usize>,
}

fn default_undo_capacity() -> usize {
    50
}

fn default_stash_max_age() -> Duration {
    FOURTEEN_DAYS
}

fn default_stash_max_files() -> usize {
    200
}

fn default_backup_retries() -> u32 {
    10
}

impl EngineConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        match self.data_dir {
            Some(ref dir) if dir.as_os_str().is_empty() => {
                return Err("Data directory cannot be empty".to_string());
            }
            None => return Err("Data directory is required".to_string()),
            _ => {}
        }
        if self.undo_capacity == Some(0) {
            return Err("Undo capacity must be at least 1".to_string());
        }
        Ok(())
    }
}

impl EngineConfig {
    /// Create a new engine config builder.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Create a config with defaults rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            undo_capacity: default_undo_capacity(),
            stash_max_age: FOURTEEN_DAYS,
            stash_max_files: default_stash_max_files(),
            backup_retries: default_backup_retries(),
            chunk_width: None,
        }
    }

    /// Directory holding stashed overwrite backups.
    pub fn backup_dir(&self) -> PathBuf {
        self.data_dir.join("overwrite-backups")
    }

    /// File the command-line front end persists undo history to.
    pub fn history_path(&self) -> PathBuf {
        self.data_dir.join("history.json")
    }

    /// Chunk width to use, always within 4..=16.
    pub fn effective_chunk_width(&self) -> usize {
        match self.chunk_width {
            Some(width) => width.clamp(MIN_CHUNK_WIDTH, MAX_CHUNK_WIDTH),
            None => chunk_width_for_memory(total_memory_bytes()),
        }
    }
}

/// Configuration for the background task scheduler.
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(setter(into))]
pub struct SchedulerConfig {
    /// Upper bound on pool size regardless of hardware.
    #[builder(default = "8")]
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Hard cap on queued plus in-flight tasks.
    #[builder(default = "256")]
    #[serde(default = "default_queue_cap")]
    pub queue_cap: usize,

    /// Exact pool size (None = derive from CPU count and memory).
    #[builder(default)]
    #[serde(default)]
    pub workers: Option<usize>,
}

fn default_max_workers() -> usize {
    8
}

fn default_queue_cap() -> usize {
    256
}

impl SchedulerConfig {
    /// Create a new scheduler config builder.
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder::default()
    }

    /// Number of worker slots to create, at least one.
    pub fn effective_workers(&self) -> usize {
        match self.workers {
            Some(n) => n.clamp(1, self.max_workers.max(1)),
            None => pool_size_for(cpu_count(), total_memory_bytes(), self.max_workers),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            queue_cap: default_queue_cap(),
            workers: None,
        }
    }
}
