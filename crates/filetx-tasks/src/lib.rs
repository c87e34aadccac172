//! Background task scheduler for filetx.
//!
//! Named tasks are queued and handed to a fixed pool of workers, one task
//! per worker at a time. Tasks can be grouped under an operation ID for
//! cancellation and progress reporting. A worker that crashes fails only
//! its own task and is replaced in place.

mod builtin;
mod error;
mod handler;
mod pool;
mod protocol;
mod worker;

pub use builtin::{Checksum, FolderSize, ListDirectory};
pub use error::{TaskError, TaskResult};
pub use handler::{HandlerRegistry, TaskContext, TaskHandler};
pub use pool::{TaskHandle, TaskScheduler, PROGRESS_CHANNEL_SIZE};
pub use protocol::{Task, TaskId, TaskProgress, WorkerCommand, WorkerMessage};
