//! Task handlers and the registry workers dispatch through.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::builtin::{Checksum, FolderSize, ListDirectory};
use crate::error::{TaskError, TaskResult};
use crate::protocol::{TaskId, WorkerMessage};

/// What a handler sees while it runs.
///
/// Handlers run on the blocking pool and must poll [`is_cancelled`]
/// (or [`check_cancelled`]) at natural checkpoints; cancellation is
/// never forced.
///
/// [`is_cancelled`]: TaskContext::is_cancelled
/// [`check_cancelled`]: TaskContext::check_cancelled
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: TaskId,
    operation_id: Option<String>,
    cancel: CancellationToken,
    progress: mpsc::UnboundedSender<WorkerMessage>,
}

impl TaskContext {
    pub(crate) fn new(
        task_id: TaskId,
        operation_id: Option<String>,
        cancel: CancellationToken,
        progress: mpsc::UnboundedSender<WorkerMessage>,
    ) -> Self {
        Self {
            task_id,
            operation_id,
            cancel,
            progress,
        }
    }

    /// ID of the running task.
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Operation the task belongs to, if any.
    pub fn operation_id(&self) -> Option<&str> {
        self.operation_id.as_deref()
    }

    /// Token cancelled when the task's operation is cancelled.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the task's operation has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Return `Err(Cancelled)` once the operation has been cancelled.
    pub fn check_cancelled(&self) -> TaskResult<()> {
        if self.cancel.is_cancelled() {
            Err(TaskError::Cancelled {
                operation_id: self.operation_id.clone().unwrap_or_default(),
            })
        } else {
            Ok(())
        }
    }

    /// Send a progress update to scheduler subscribers.
    pub fn report(&self, data: Value) {
        let _ = self.progress.send(WorkerMessage::Progress {
            task: self.task_id,
            operation_id: self.operation_id.clone(),
            data,
        });
    }
}

/// A named kind of background work.
pub trait TaskHandler: Send + Sync {
    /// Run the task to completion. Called on the blocking pool.
    fn run(&self, payload: &Value, ctx: &TaskContext) -> TaskResult<Value>;
}

impl<F> TaskHandler for F
where
    F: Fn(&Value, &TaskContext) -> TaskResult<Value> + Send + Sync,
{
    fn run(&self, payload: &Value, ctx: &TaskContext) -> TaskResult<Value> {
        self(payload, ctx)
    }
}

/// Handlers by task type name.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.task_types())
            .finish()
    }
}

impl HandlerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with `folder-size`, `checksum` and `list-directory`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("folder-size", FolderSize);
        registry.register("checksum", Checksum);
        registry.register("list-directory", ListDirectory);
        registry
    }

    /// Register `handler` for `task_type`, replacing any previous one.
    pub fn register(&mut self, task_type: impl Into<String>, handler: impl TaskHandler + 'static) {
        self.handlers.insert(task_type.into(), Arc::new(handler));
    }

    /// Handler for `task_type`.
    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    /// Whether a handler is registered for `task_type`.
    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Registered task types, sorted.
    pub fn task_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}
