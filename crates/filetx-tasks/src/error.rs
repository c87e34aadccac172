//! Error types for the task scheduler.

use thiserror::Error;

use crate::protocol::TaskId;

/// Errors that reject a scheduled task.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    /// Queued plus in-flight tasks already reached the hard cap.
    #[error("Task queue is full ({cap} tasks queued or running)")]
    QueueFull { cap: usize },

    /// The task's operation was cancelled.
    #[error("Operation '{operation_id}' was cancelled")]
    Cancelled { operation_id: String },

    /// The worker running the task died; its slot has been replaced.
    #[error("Worker {slot} crashed while running task {task}: {reason}")]
    WorkerCrashed {
        slot: usize,
        task: TaskId,
        reason: String,
    },

    /// The scheduler was shut down before the task finished.
    #[error("Task scheduler is shut down")]
    ShutDown,

    /// No handler is registered for the task type.
    #[error("Unknown task type: {task_type}")]
    UnknownTaskType { task_type: String },

    /// The payload did not match what the handler expects.
    #[error("Invalid payload: {message}")]
    InvalidPayload { message: String },

    /// The handler reported a failure.
    #[error("Task failed: {message}")]
    Failed { message: String },
}

impl TaskError {
    /// Create a failure from any displayable error.
    pub fn failed(message: impl std::fmt::Display) -> Self {
        Self::Failed {
            message: message.to_string(),
        }
    }

    /// Create a payload error.
    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidPayload {
            message: message.into(),
        }
    }
}

/// Result type for task operations.
pub type TaskResult<T> = Result<T, TaskError>;
