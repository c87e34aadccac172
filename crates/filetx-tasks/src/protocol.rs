//! Messages exchanged between the scheduler and its workers.
//!
//! The shapes follow the worker wire format: tasks go out as
//! `{id, type, payload, operationId?}`, results and progress come back
//! tagged by `type`. Workers currently run in-process, so the messages
//! travel over channels, but they serialize to the same JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Scheduler-assigned task identifier.
pub type TaskId = u64;

/// A unit of background work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Handler name, e.g. `folder-size`.
    #[serde(rename = "type")]
    pub task_type: String,
    pub payload: Value,
    /// Caller-chosen key grouping tasks for cancellation and progress.
    #[serde(
        rename = "operationId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub operation_id: Option<String>,
}

/// Scheduler → worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerCommand {
    /// Run one task to completion.
    Run { task: Task },
    /// Cancel any running task belonging to the operation.
    Cancel {
        #[serde(rename = "operationId")]
        operation_id: String,
    },
}

/// Worker → scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerMessage {
    /// Final outcome of a task.
    Result {
        id: TaskId,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Intermediate progress of a running task.
    Progress {
        task: TaskId,
        #[serde(rename = "operationId")]
        operation_id: Option<String>,
        data: Value,
    },
}

impl WorkerMessage {
    /// A successful result.
    pub fn success(id: TaskId, data: Value) -> Self {
        Self::Result {
            id,
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// A failed result.
    pub fn failure(id: TaskId, error: impl Into<String>) -> Self {
        Self::Result {
            id,
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Progress update fanned out to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub task: TaskId,
    #[serde(rename = "operationId")]
    pub operation_id: Option<String>,
    pub data: Value,
}
