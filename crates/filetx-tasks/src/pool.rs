//! The scheduler: a fixed arena of worker slots fed from one queue.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use filetx_core::SchedulerConfig;

use crate::error::{TaskError, TaskResult};
use crate::handler::HandlerRegistry;
use crate::protocol::{Task, TaskId, TaskProgress, WorkerCommand, WorkerMessage};
use crate::worker::{spawn_worker, WorkerEvent, WorkerEventKind};

/// Buffer size of the progress broadcast channel.
pub const PROGRESS_CHANNEL_SIZE: usize = 256;

struct InFlight {
    task: TaskId,
    operation_id: Option<String>,
    cancelled: bool,
}

struct Slot {
    generation: u64,
    /// `None` once the worker is known dead or the pool is shut down.
    commands: Option<mpsc::UnboundedSender<WorkerCommand>>,
    busy: Option<InFlight>,
}

#[derive(Default)]
struct State {
    slots: Vec<Slot>,
    queue: VecDeque<Task>,
    pending: HashMap<TaskId, oneshot::Sender<TaskResult<Value>>>,
    next_id: TaskId,
    shut_down: bool,
}

impl State {
    fn in_flight(&self) -> usize {
        self.slots.iter().filter(|slot| slot.busy.is_some()).count()
    }

    fn settle(&mut self, id: TaskId, result: TaskResult<Value>) {
        if let Some(tx) = self.pending.remove(&id) {
            let _ = tx.send(result);
        }
    }

    /// Hand queued tasks to idle live workers.
    fn drain(&mut self) {
        let State { slots, queue, .. } = self;
        for (index, slot) in slots.iter_mut().enumerate() {
            if queue.is_empty() {
                break;
            }
            if slot.busy.is_some() {
                continue;
            }
            let Some(commands) = &slot.commands else {
                continue;
            };
            let Some(task) = queue.pop_front() else {
                break;
            };
            let in_flight = InFlight {
                task: task.id,
                operation_id: task.operation_id.clone(),
                cancelled: false,
            };
            match commands.send(WorkerCommand::Run { task }) {
                Ok(()) => slot.busy = Some(in_flight),
                Err(mpsc::error::SendError(command)) => {
                    // The worker is gone; its exit event will respawn the slot.
                    tracing::debug!(slot = index, "worker channel closed, requeueing task");
                    slot.commands = None;
                    if let WorkerCommand::Run { task } = command {
                        queue.push_front(task);
                    }
                }
            }
        }
    }
}

struct Inner {
    state: Mutex<State>,
    registry: Arc<HandlerRegistry>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    progress: broadcast::Sender<TaskProgress>,
    queue_cap: usize,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self, event: WorkerEvent) {
        let mut state = self.state();
        let shut_down = state.shut_down;
        let Some(slot) = state.slots.get_mut(event.slot) else {
            return;
        };
        if slot.generation != event.generation {
            tracing::trace!(slot = event.slot, "ignoring event from replaced worker");
            return;
        }

        match event.kind {
            WorkerEventKind::Message(WorkerMessage::Progress {
                task,
                operation_id,
                data,
            }) => {
                let _ = self.progress.send(TaskProgress {
                    task,
                    operation_id,
                    data,
                });
            }
            WorkerEventKind::Message(WorkerMessage::Result {
                id,
                success,
                data,
                error,
            }) => {
                let in_flight = if slot.busy.as_ref().is_some_and(|current| current.task == id) {
                    slot.busy.take()
                } else {
                    None
                };
                let result = if success {
                    Ok(data.unwrap_or(Value::Null))
                } else {
                    match in_flight {
                        Some(InFlight {
                            cancelled: true,
                            operation_id,
                            ..
                        }) => Err(TaskError::Cancelled {
                            operation_id: operation_id.unwrap_or_default(),
                        }),
                        _ => Err(TaskError::Failed {
                            message: error.unwrap_or_else(|| "unknown error".to_string()),
                        }),
                    }
                };
                state.settle(id, result);
                state.drain();
            }
            WorkerEventKind::Exited(reason) => {
                if shut_down {
                    return;
                }
                let reason = reason.unwrap_or_else(|| "worker exited unexpectedly".to_string());
                tracing::warn!(slot = event.slot, %reason, "worker crashed, respawning");

                let crashed = slot.busy.take();
                slot.generation += 1;
                slot.commands = Some(spawn_worker(
                    event.slot,
                    slot.generation,
                    Arc::clone(&self.registry),
                    self.events.clone(),
                ));

                if let Some(in_flight) = crashed {
                    state.settle(
                        in_flight.task,
                        Err(TaskError::WorkerCrashed {
                            slot: event.slot,
                            task: in_flight.task,
                            reason,
                        }),
                    );
                }
                state.drain();
            }
        }
    }
}

/// Handle to a submitted task; resolves to the task's result.
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    rx: oneshot::Receiver<TaskResult<Value>>,
}

impl TaskHandle {
    /// Scheduler-assigned ID of the task.
    pub fn id(&self) -> TaskId {
        self.id
    }
}

impl Future for TaskHandle {
    type Output = TaskResult<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(TaskError::ShutDown)))
    }
}

/// Runs named background tasks on a bounded pool of workers.
///
/// Each slot holds exactly one worker running at most one task. A worker
/// that crashes fails its in-flight task with [`TaskError::WorkerCrashed`]
/// and is replaced in the same slot. Must be created inside a Tokio runtime.
pub struct TaskScheduler {
    inner: Arc<Inner>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("workers", &self.worker_count())
            .field("queue_cap", &self.inner.queue_cap)
            .finish_non_exhaustive()
    }
}

impl TaskScheduler {
    /// Create a pool sized from `config` running handlers from `registry`.
    pub fn new(config: &SchedulerConfig, registry: HandlerRegistry) -> Self {
        let workers = config.effective_workers();
        let registry = Arc::new(registry);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (progress, _) = broadcast::channel(PROGRESS_CHANNEL_SIZE);

        let slots = (0..workers)
            .map(|index| Slot {
                generation: 0,
                commands: Some(spawn_worker(
                    index,
                    0,
                    Arc::clone(&registry),
                    events_tx.clone(),
                )),
                busy: None,
            })
            .collect();

        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                slots,
                ..State::default()
            }),
            registry,
            events: events_tx,
            progress,
            queue_cap: config.queue_cap.max(1),
        });

        let supervisor = {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                while let Some(event) = events_rx.recv().await {
                    inner.handle(event);
                }
            })
        };

        tracing::debug!(workers, queue_cap = inner.queue_cap, "task scheduler started");
        Self {
            inner,
            supervisor: Mutex::new(Some(supervisor)),
        }
    }

    /// Create a pool with the built-in handlers.
    pub fn with_builtins(config: &SchedulerConfig) -> Self {
        Self::new(config, HandlerRegistry::with_builtins())
    }

    /// Number of worker slots.
    pub fn worker_count(&self) -> usize {
        self.inner.state().slots.len()
    }

    /// Tasks waiting for a worker.
    pub fn queued(&self) -> usize {
        self.inner.state().queue.len()
    }

    /// Tasks currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.state().in_flight()
    }

    /// Receive progress updates from running tasks.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskProgress> {
        self.inner.progress.subscribe()
    }

    /// Queue a task and return a handle resolving to its result.
    ///
    /// Fails immediately when the scheduler is shut down, the task type is
    /// unknown, or queued plus in-flight tasks already reach the cap.
    pub fn submit(
        &self,
        task_type: impl Into<String>,
        payload: Value,
        operation_id: Option<String>,
    ) -> TaskResult<TaskHandle> {
        let task_type = task_type.into();
        let mut state = self.inner.state();
        if state.shut_down {
            return Err(TaskError::ShutDown);
        }
        if !self.inner.registry.contains(&task_type) {
            return Err(TaskError::UnknownTaskType { task_type });
        }
        if state.queue.len() + state.in_flight() >= self.inner.queue_cap {
            tracing::warn!(cap = self.inner.queue_cap, %task_type, "task queue full");
            return Err(TaskError::QueueFull {
                cap: self.inner.queue_cap,
            });
        }

        let id = state.next_id;
        state.next_id += 1;
        let (tx, rx) = oneshot::channel();
        state.pending.insert(id, tx);
        state.queue.push_back(Task {
            id,
            task_type,
            payload,
            operation_id,
        });
        state.drain();
        Ok(TaskHandle { id, rx })
    }

    /// Queue a task and wait for its result.
    pub async fn run_task(
        &self,
        task_type: impl Into<String>,
        payload: Value,
        operation_id: Option<String>,
    ) -> TaskResult<Value> {
        self.submit(task_type, payload, operation_id)?.await
    }

    /// Cancel every task belonging to `operation_id`.
    ///
    /// Queued tasks are rejected with [`TaskError::Cancelled`] right away;
    /// running ones are asked to stop and settle when their handler next
    /// checks for cancellation. Returns the number of queued tasks removed.
    pub fn cancel_operation(&self, operation_id: &str) -> usize {
        let mut state = self.inner.state();

        for slot in &mut state.slots {
            if let Some(in_flight) = &mut slot.busy {
                if in_flight.operation_id.as_deref() == Some(operation_id) {
                    in_flight.cancelled = true;
                }
            }
            if let Some(commands) = &slot.commands {
                let _ = commands.send(WorkerCommand::Cancel {
                    operation_id: operation_id.to_string(),
                });
            }
        }

        let (cancelled, kept): (Vec<Task>, Vec<Task>) = std::mem::take(&mut state.queue)
            .into_iter()
            .partition(|task| task.operation_id.as_deref() == Some(operation_id));
        state.queue = kept.into();

        for task in &cancelled {
            state.settle(
                task.id,
                Err(TaskError::Cancelled {
                    operation_id: operation_id.to_string(),
                }),
            );
        }
        if !cancelled.is_empty() {
            tracing::debug!(operation_id, removed = cancelled.len(), "cancelled queued tasks");
        }
        cancelled.len()
    }

    /// Reject all queued and running work and stop every worker.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            state.queue.clear();
            for (_, tx) in state.pending.drain() {
                let _ = tx.send(Err(TaskError::ShutDown));
            }
            for slot in &mut state.slots {
                slot.busy = None;
                // Dropping the sender stops the worker after its current task.
                slot.commands = None;
            }
        }

        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(supervisor) = supervisor {
            supervisor.abort();
        }
        tracing::debug!("task scheduler shut down");
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
