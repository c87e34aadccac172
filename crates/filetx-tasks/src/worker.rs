//! One worker: runs a single task at a time on the blocking pool.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::handler::{HandlerRegistry, TaskContext};
use crate::protocol::{Task, WorkerCommand, WorkerMessage};

/// What a worker tells the pool. `generation` identifies the worker
/// instance occupying `slot`, so messages from a replaced worker are
/// recognisable.
#[derive(Debug)]
pub(crate) struct WorkerEvent {
    pub slot: usize,
    pub generation: u64,
    pub kind: WorkerEventKind,
}

#[derive(Debug)]
pub(crate) enum WorkerEventKind {
    Message(WorkerMessage),
    /// The worker stopped. `None` is a clean exit after its command
    /// channel closed; `Some` carries the crash reason.
    Exited(Option<String>),
}

/// Start a worker for `slot` and return its command channel.
pub(crate) fn spawn_worker(
    slot: usize,
    generation: u64,
    registry: Arc<HandlerRegistry>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) -> mpsc::UnboundedSender<WorkerCommand> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let worker = Worker {
            slot,
            generation,
            registry,
            events: events.clone(),
        };
        let reason = worker.run(rx).await.err();
        let _ = events.send(WorkerEvent {
            slot,
            generation,
            kind: WorkerEventKind::Exited(reason),
        });
    });
    tracing::debug!(slot, generation, "worker started");
    tx
}

struct Worker {
    slot: usize,
    generation: u64,
    registry: Arc<HandlerRegistry>,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl Worker {
    fn emit(&self, message: WorkerMessage) {
        let _ = self.events.send(WorkerEvent {
            slot: self.slot,
            generation: self.generation,
            kind: WorkerEventKind::Message(message),
        });
    }

    /// Process commands until the channel closes. An `Err` means the
    /// worker crashed and must be replaced.
    async fn run(&self, mut commands: mpsc::UnboundedReceiver<WorkerCommand>) -> Result<(), String> {
        while let Some(command) = commands.recv().await {
            let task = match command {
                WorkerCommand::Run { task } => task,
                // Nothing running; late cancellations are harmless.
                WorkerCommand::Cancel { .. } => continue,
            };
            let closed = self.execute(task, &mut commands).await?;
            if closed {
                break;
            }
        }
        Ok(())
    }

    /// Run one task, servicing cancellations meanwhile. Returns whether
    /// the command channel closed during the task.
    async fn execute(
        &self,
        task: Task,
        commands: &mut mpsc::UnboundedReceiver<WorkerCommand>,
    ) -> Result<bool, String> {
        let Some(handler) = self.registry.get(&task.task_type) else {
            self.emit(WorkerMessage::failure(
                task.id,
                format!("Unknown task type: {}", task.task_type),
            ));
            return Ok(false);
        };

        let cancel = CancellationToken::new();
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let ctx = TaskContext::new(task.id, task.operation_id.clone(), cancel.clone(), progress_tx);
        let payload = task.payload.clone();
        let mut job = tokio::task::spawn_blocking(move || handler.run(&payload, &ctx));

        let mut closed = false;
        let outcome = loop {
            tokio::select! {
                result = &mut job => break result,
                Some(message) = progress_rx.recv() => self.emit(message),
                command = commands.recv(), if !closed => match command {
                    Some(WorkerCommand::Cancel { operation_id }) => {
                        if task.operation_id.as_deref() == Some(operation_id.as_str()) {
                            tracing::debug!(task = task.id, %operation_id, "cancelling running task");
                            cancel.cancel();
                        }
                    }
                    Some(WorkerCommand::Run { task: other }) => {
                        tracing::warn!(slot = self.slot, task = other.id, "worker busy, rejecting task");
                        self.emit(WorkerMessage::failure(other.id, "worker busy"));
                    }
                    None => {
                        closed = true;
                        cancel.cancel();
                    }
                },
            }
        };

        while let Ok(message) = progress_rx.try_recv() {
            self.emit(message);
        }

        match outcome {
            Ok(Ok(data)) => self.emit(WorkerMessage::success(task.id, data)),
            Ok(Err(e)) => self.emit(WorkerMessage::failure(task.id, e.to_string())),
            Err(e) if e.is_panic() => return Err(format!("task {} panicked", task.id)),
            Err(e) => return Err(e.to_string()),
        }
        Ok(closed)
    }
}
