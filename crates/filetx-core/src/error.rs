//! Error types for file operations.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Result alias used throughout the operation engine.
pub type OpsResult<T> = Result<T, OpsError>;

/// Errors reported by planning, execution and undo/redo.
///
/// Validation errors are raised before anything on disk changes. Batch
/// failures are raised after compensation has run; when some overwritten
/// data could not be put back, `recovery` lists where it was stashed.
#[derive(Debug, Error)]
pub enum OpsError {
    /// A path was rejected by the path-safety predicate.
    #[error("Refusing unsafe path: {path}")]
    UnsafePath { path: PathBuf },

    /// A child name is not usable on this platform.
    #[error("Invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    /// Two sources would land on the same destination name.
    #[error("Multiple items would be named '{name}' in the destination")]
    NameCollision { name: String },

    /// A directory would be copied or moved into itself.
    #[error("Cannot copy or move '{item}' into itself ({destination})")]
    SelfContainment { item: PathBuf, destination: PathBuf },

    /// The batch had no sources.
    #[error("No items to process")]
    EmptyBatch,

    /// The user (or the conflict resolver) cancelled the batch.
    #[error("Operation cancelled")]
    Cancelled,

    /// A batch failed part-way and was rolled back.
    #[error("{operation} failed at {path}: {message}{}", recovery_hint(.recovery))]
    BatchFailed {
        operation: String,
        path: PathBuf,
        message: String,
        recovery: Vec<PathBuf>,
    },

    /// An undo/redo source no longer exists.
    #[error("Source no longer exists: {path}")]
    SourceMissing { path: PathBuf },

    /// An undo/redo target is already occupied.
    #[error("Target already exists: {path}")]
    TargetExists { path: PathBuf },

    /// Recorded state no longer matches the filesystem.
    #[error("{path} has changed since it was recorded: {reason}")]
    Stale { path: PathBuf, reason: String },

    /// A multi-item undo stopped part-way; the remainder stays retryable.
    #[error("Undo partially failed: {reverted} restored, {remaining} left to retry: {message}")]
    PartialUndo {
        reverted: usize,
        remaining: usize,
        message: String,
    },

    /// The undo stack is empty.
    #[error("Nothing to undo")]
    NothingToUndo,

    /// The redo stack is empty.
    #[error("Nothing to redo")]
    NothingToRedo,

    /// Permission denied for a path.
    #[error("Permission denied: {path}")]
    PermissionDenied { path: PathBuf },

    /// Path not found.
    #[error("Path not found: {path}")]
    NotFound { path: PathBuf },

    /// Destination is not a directory.
    #[error("Not a directory: {path}")]
    NotADirectory { path: PathBuf },

    /// Generic I/O error.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A blocking filesystem task could not be joined.
    #[error("Background task failed: {message}")]
    TaskFailed { message: String },
}

impl OpsError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            std::io::ErrorKind::NotFound => Self::NotFound { path },
            _ => Self::Io { path, source },
        }
    }

    /// Create a batch failure for `operation` at `path`.
    pub fn batch_failed(
        operation: impl Into<String>,
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        recovery: Vec<PathBuf>,
    ) -> Self {
        Self::BatchFailed {
            operation: operation.into(),
            path: path.into(),
            message: message.into(),
            recovery,
        }
    }

    /// Whether this error was raised before any mutation took place.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::UnsafePath { .. }
                | Self::InvalidName { .. }
                | Self::NameCollision { .. }
                | Self::SelfContainment { .. }
                | Self::EmptyBatch
        )
    }

    /// Stash locations the user should be told about, if any.
    pub fn recovery_paths(&self) -> &[PathBuf] {
        match self {
            Self::BatchFailed { recovery, .. } => recovery,
            _ => &[],
        }
    }
}

fn recovery_hint(recovery: &[PathBuf]) -> String {
    match recovery {
        [] => String::new(),
        [single] => format!(" (overwritten data saved to {})", single.display()),
        many => format!(
            " (overwritten data saved to {} files under {})",
            many.len(),
            many[0].parent().unwrap_or(Path::new("")).display()
        ),
    }
}
