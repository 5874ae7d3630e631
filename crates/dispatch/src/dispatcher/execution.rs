use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rayon::ThreadPool;
use tracing::{debug, error, info, warn};

use rtsched_core::{Classification, SchedError};

use crate::event_log::EventKind;
use crate::task::{RunContext, RunOutcome, Task};

use super::{Dispatcher, DispatcherState};

type RunResult = Result<RunOutcome, SchedError>;

/// A task handed to the execution pool, plus the channel its result comes
/// back on.
struct Running {
    task: Arc<Task>,
    done: Receiver<RunResult>,
}

impl Running {
    /// Block until the run reports. A dropped sender means the pool job died
    /// without reporting, which is treated as a fault.
    fn wait(&self) -> RunResult {
        self.done.recv().unwrap_or_else(|_| {
            Err(SchedError::fault(
                self.task.name(),
                "execution worker exited without reporting",
            ))
        })
    }
}

impl Dispatcher {
    /// Run the dispatch loop. Blocks until shutdown is signaled.
    ///
    /// Task runs happen on a `rayon` pool so the loop can keep watching the
    /// ready queue for higher-priority arrivals while a task executes.
    pub fn run(&self) -> Result<(), SchedError> {
        let num_workers = self.config.resolved_worker_threads();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_workers)
            .thread_name(|i| format!("rtsched-exec-{i}"))
            .build()
            .map_err(|e| SchedError::Pool(e.to_string()))?;

        info!(
            "Dispatcher starting with {} workers, tick {}ms",
            num_workers, self.config.tick_ms
        );

        let mut running: Option<Running> = None;
        while !self.is_shutting_down() {
            running = match running.take() {
                None => self.dispatch_next(&pool),
                Some(active) => self.supervise(&pool, active),
            };
        }

        if let Some(active) = running {
            self.stop_for_shutdown(active);
        }
        self.set_state(DispatcherState::Idle);

        info!("Dispatcher stopped");
        Ok(())
    }

    /// Idle → Dispatching. A queue timeout leaves the loop idle.
    fn dispatch_next(&self, pool: &ThreadPool) -> Option<Running> {
        self.set_state(DispatcherState::Idle);
        let task = self.queue.take_next(self.config.idle_poll())?;
        self.set_state(DispatcherState::Dispatching);
        Some(self.start(pool, task))
    }

    /// Wait for the running task while watching for a higher-priority arrival.
    fn supervise(&self, pool: &ThreadPool, active: Running) -> Option<Running> {
        match active.done.recv_timeout(self.config.preempt_poll()) {
            Ok(result) => {
                self.classify(&active.task, result);
                None
            }
            Err(RecvTimeoutError::Disconnected) => {
                let result = active.wait();
                self.classify(&active.task, result);
                None
            }
            Err(RecvTimeoutError::Timeout) => {
                let candidate = self
                    .queue
                    .take_higher_than(active.task.priority(), Duration::ZERO);
                let Some(candidate) = candidate else {
                    return Some(active);
                };
                self.set_state(DispatcherState::Dispatching);
                self.preempt(active, &candidate);
                Some(self.start(pool, candidate))
            }
        }
    }

    /// Hand `task` to the pool and make it the current task.
    ///
    /// A requeued task is withdrawn from Interrupted before it becomes
    /// current again.
    fn start(&self, pool: &ThreadPool, task: Arc<Task>) -> Running {
        if let Some(class) = self.results.withdraw(task.id()) {
            debug!(task = task.name(), from = class.label(), "withdrawn for re-run");
        }
        self.set_current(Some(Arc::clone(&task)));
        self.set_state(DispatcherState::Executing);
        self.log_event(
            EventKind::Started,
            &task,
            format!("Starting: {} (priority {})", task.name(), task.priority()),
        );

        let (tx, done) = mpsc::sync_channel::<RunResult>(1);
        let ctx = RunContext {
            tick: self.config.tick(),
            resume_policy: self.config.resume_policy,
            progress: self.progress.clone(),
        };
        let job_task = Arc::clone(&task);

        pool.spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| job_task.run(&ctx)))
                .unwrap_or_else(|payload| {
                    Err(SchedError::fault(job_task.name(), panic_message(payload.as_ref())))
                });
            let _ = tx.send(result);
        });

        Running { task, done }
    }

    /// Interrupt the running task for `candidate`, wait for it to stop at its
    /// tick boundary, file it as Interrupted and put it back in the queue.
    fn preempt(&self, active: Running, candidate: &Task) {
        let preempted = &active.task;
        self.log_event(
            EventKind::Preempted,
            preempted,
            format!("Preempting: {} for {}", preempted.name(), candidate.name()),
        );
        preempted.interrupt();

        match active.wait() {
            Ok(RunOutcome::Interrupted) => {
                preempted.note_preempted();
                self.requeue_interrupted(preempted);
            }
            // Finished (or faulted) at the same boundary the interrupt landed on.
            other => self.classify(preempted, other),
        }
    }

    /// Executing → Classifying → (Idle).
    fn classify(&self, task: &Arc<Task>, result: RunResult) {
        self.set_state(DispatcherState::Classifying);

        match result {
            Ok(RunOutcome::Completed) => {
                self.set_current(None);
                self.file_by_deadline(task);
            }
            Ok(RunOutcome::Interrupted) if self.config.retry_interrupted => {
                self.log_event(
                    EventKind::Interrupted,
                    task,
                    format!("{} interrupted, retrying.", task.name()),
                );
                self.requeue_interrupted(task);
            }
            Ok(RunOutcome::Interrupted) => {
                self.set_current(None);
                self.results.file(Classification::Interrupted, task.record());
                self.log_event(
                    EventKind::Interrupted,
                    task,
                    format!("{} interrupted.", task.name()),
                );
            }
            Err(e) => {
                error!(task = task.name(), error = %e, "task execution fault");
                task.note_fault(e.to_string());
                self.set_current(None);
                self.log_event(EventKind::Fault, task, format!("{} faulted: {e}", task.name()));
                self.file_by_deadline(task);
            }
        }
    }

    /// Completed unless the run ended after the deadline.
    fn file_by_deadline(&self, task: &Task) {
        let ended = task.ended_at().unwrap_or_else(Utc::now);
        let record = task.record();
        if ended > task.deadline() {
            debug!(
                task = task.name(),
                late_ms = (ended - task.deadline()).num_milliseconds(),
                "deadline missed"
            );
            self.results.file(Classification::Missed, record);
            self.log_event(
                EventKind::DeadlineMissed,
                task,
                format!("{} missed deadline!", task.name()),
            );
        } else {
            self.results.file(Classification::Completed, record);
            self.log_event(
                EventKind::Completed,
                task,
                format!("{} completed.", task.name()),
            );
        }
    }

    /// File as Interrupted and resubmit. The current reference is cleared
    /// before the task can reappear in the queue.
    fn requeue_interrupted(&self, task: &Arc<Task>) {
        self.set_current(None);
        self.results.file(Classification::Interrupted, task.record());
        task.clear_interrupt();
        self.log_event(
            EventKind::Requeued,
            task,
            format!("{} re-queued with priority {}", task.name(), task.priority()),
        );
        self.queue.submit(Arc::clone(task));
    }

    /// Stop the running task on shutdown. It is filed as Interrupted unless
    /// it finished on its own first.
    fn stop_for_shutdown(&self, active: Running) {
        warn!(task = active.task.name(), "interrupting running task for shutdown");
        active.task.interrupt();
        match active.wait() {
            Ok(RunOutcome::Interrupted) => {
                self.set_current(None);
                self.results
                    .file(Classification::Interrupted, active.task.record());
                self.log_event(
                    EventKind::Shutdown,
                    &active.task,
                    format!("{} interrupted by shutdown.", active.task.name()),
                );
            }
            other => self.classify(&active.task, other),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
