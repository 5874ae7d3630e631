use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

use rtsched_core::{DispatchConfig, MetricsSnapshot, Priority, TaskId};

use crate::event_log::{EventKind, EventLog, LogEvent};
use crate::queue::ReadyQueue;
use crate::results::ResultSets;
use crate::submission::Submitter;
use crate::task::{ProgressEvent, Task};

/// Dispatcher loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum DispatcherState {
    /// No task executing; blocked on the ready queue.
    Idle = 0,
    /// Selecting the next task, possibly preempting.
    Dispatching = 1,
    /// One task running on the execution pool.
    Executing = 2,
    /// Post-execution bookkeeping.
    Classifying = 3,
}

impl DispatcherState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => DispatcherState::Dispatching,
            2 => DispatcherState::Executing,
            3 => DispatcherState::Classifying,
            _ => DispatcherState::Idle,
        }
    }
}

/// Read-only view of the task currently executing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentTask {
    pub id: TaskId,
    pub name: String,
    pub priority: Priority,
    pub started_at: Option<DateTime<Utc>>,
}

/// Priority dispatcher. Owns the loop; the queue, result sets and event log
/// are injected so producers and consumers can hold their own handles.
pub struct Dispatcher {
    pub(super) config: DispatchConfig,
    pub(super) queue: Arc<ReadyQueue>,
    pub(super) results: Arc<ResultSets>,
    pub(super) log: Arc<EventLog>,
    /// Progress fan-out from the execution pool.
    pub(super) progress: broadcast::Sender<ProgressEvent>,
    /// Accepted submissions, shared with every [`Submitter`].
    pub(super) submitted: Arc<AtomicUsize>,
    /// Single writer (the loop), many readers. Replaced as a whole.
    pub(super) current: RwLock<Option<Arc<Task>>>,
    pub(super) state: AtomicU8,
    /// Shutdown signal.
    pub(super) shutdown: Arc<AtomicBool>,
}

impl Dispatcher {
    /// Create a dispatcher over injected services.
    pub fn new(
        config: DispatchConfig,
        queue: Arc<ReadyQueue>,
        results: Arc<ResultSets>,
        log: Arc<EventLog>,
    ) -> Self {
        let (progress, _) = broadcast::channel(config.progress_capacity.max(1));
        Self {
            config,
            queue,
            results,
            log,
            progress,
            submitted: Arc::new(AtomicUsize::new(0)),
            current: RwLock::new(None),
            state: AtomicU8::new(DispatcherState::Idle as u8),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a dispatcher with fresh queue, result sets and event log.
    pub fn with_defaults(config: DispatchConfig) -> Self {
        let log = Arc::new(EventLog::new(config.event_capacity));
        Self::new(
            config,
            Arc::new(ReadyQueue::new()),
            Arc::new(ResultSets::new()),
            log,
        )
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Producer handle sharing this dispatcher's queue, log and task cap.
    pub fn submitter(&self) -> Submitter {
        Submitter::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.log),
            Arc::clone(&self.submitted),
            self.config.max_tasks,
        )
    }

    pub fn queue(&self) -> Arc<ReadyQueue> {
        Arc::clone(&self.queue)
    }

    pub fn results(&self) -> Arc<ResultSets> {
        Arc::clone(&self.results)
    }

    pub fn event_log(&self) -> Arc<EventLog> {
        Arc::clone(&self.log)
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<LogEvent> {
        self.log.subscribe()
    }

    /// Point-in-time metrics snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.results.metrics()
    }

    pub fn state(&self) -> DispatcherState {
        DispatcherState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(super) fn set_state(&self, state: DispatcherState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn current(&self) -> Option<CurrentTask> {
        let current = self.current.read().unwrap_or_else(PoisonError::into_inner);
        current.as_ref().map(|task| CurrentTask {
            id: task.id(),
            name: task.name().to_string(),
            priority: task.priority(),
            started_at: task.started_at(),
        })
    }

    pub(super) fn set_current(&self, task: Option<Arc<Task>>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = task;
    }

    /// Interrupt the executing task for a reason other than preemption.
    ///
    /// Returns `false` when nothing is executing.
    pub fn interrupt_current(&self) -> bool {
        let current = self.current.read().unwrap_or_else(PoisonError::into_inner);
        match current.as_ref() {
            Some(task) => {
                info!(task = task.name(), "external interrupt requested");
                task.interrupt();
                true
            }
            None => false,
        }
    }

    /// Signal the loop to stop.
    pub fn shutdown(&self) {
        info!("Dispatcher shutdown requested");
        self.shutdown.store(true, Ordering::Release);
    }

    /// Get an Arc to the shutdown flag (for external shutdown signaling).
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub(super) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(super) fn log_event(&self, kind: EventKind, task: &Task, message: String) {
        self.log.record(kind, Some(task.name()), message);
    }
}
