//! Transactional file operations engine for filetx.
//!
//! Batches of copies and moves are planned up front, executed in bounded
//! parallel chunks, and unwound on failure. Anything an overwrite would
//! destroy is first relocated to a sibling backup, which is deleted on
//! commit, moved back on rollback, or stashed for manual recovery when
//! neither is possible. Completed work is recorded in a bounded undo/redo
//! history whose replay re-checks the filesystem before touching it.

mod backup;
mod conflict;
mod engine;
mod executor;
mod fs_move;
mod naming;
mod plan;
mod progress;
mod replay;
mod undo;

pub use backup::{BackupStore, OverwriteBackups, PruneReport, StashedBackup};
pub use conflict::{BoxFuture, ConflictChoice, ConflictPolicy, ConflictResolver};
pub use engine::FileOpsEngine;
pub use executor::{BatchExecutor, BatchReport};
pub use fs_move::{copy_new, copy_path, move_path, remove_path};
pub use naming::{collision_key, path_exists, unique_child_name, validate_child_name};
pub use plan::{allow_absolute_paths, PathSafety, Plan, PlannedOperation, Planner};
pub use progress::{OperationProgress, OperationType};
pub use replay::UndoManager;
pub use undo::{MoveOrigin, RenamePair, UndoAction, UndoEntry, UndoHistory};

/// Default channel buffer size for operation progress updates.
pub const OPERATION_CHANNEL_SIZE: usize = 100;
