//! Producer-side submission API: validation, the total-task cap and seeding.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use rtsched_core::{Priority, SchedError, TaskId};

use crate::event_log::{EventKind, EventLog};
use crate::queue::ReadyQueue;
use crate::task::Task;

/// Cloneable handle used by any number of producer threads.
#[derive(Clone)]
pub struct Submitter {
    queue: Arc<ReadyQueue>,
    log: Arc<EventLog>,
    submitted: Arc<AtomicUsize>,
    max_tasks: usize,
}

impl Submitter {
    pub fn new(
        queue: Arc<ReadyQueue>,
        log: Arc<EventLog>,
        submitted: Arc<AtomicUsize>,
        max_tasks: usize,
    ) -> Self {
        Self {
            queue,
            log,
            submitted,
            max_tasks,
        }
    }

    /// Validate and enqueue a task.
    ///
    /// `priority` must be in 1..=10, `duration_ms` positive and
    /// `deadline_epoch_ms` a representable instant.
    pub fn submit(
        &self,
        name: &str,
        priority: i64,
        duration_ms: i64,
        deadline_epoch_ms: i64,
    ) -> Result<TaskId, SchedError> {
        let task = build_task(name, priority, duration_ms, deadline_epoch_ms)
            .map_err(|e| self.reject(name, e))?;
        self.submit_task(task)
    }

    /// Like [`Submitter::submit`] but takes the raw text of an entry form.
    pub fn submit_form(
        &self,
        name: &str,
        priority: &str,
        duration_ms: &str,
        deadline_epoch_ms: &str,
    ) -> Result<TaskId, SchedError> {
        let parsed = parse_field("priority", priority).and_then(|p| {
            let d = parse_field("duration", duration_ms)?;
            let dl = parse_field("deadline", deadline_epoch_ms)?;
            Ok((p, d, dl))
        });
        let (priority, duration_ms, deadline_epoch_ms) =
            parsed.map_err(|e| self.reject(name, e))?;
        self.submit(name, priority, duration_ms, deadline_epoch_ms)
    }

    /// Enqueue an already-built task, enforcing the total-task cap.
    ///
    /// The submission event is logged before the task becomes visible to the
    /// dispatcher.
    pub fn submit_task(&self, task: Task) -> Result<TaskId, SchedError> {
        let max = self.max_tasks;
        if self
            .submitted
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .is_err()
        {
            return Err(self.reject(task.name(), SchedError::CapacityExceeded(max)));
        }

        let id = task.id();
        self.log.record(
            EventKind::Submitted,
            Some(task.name()),
            format!(
                "Task {} added (priority {}, duration {}ms)",
                task.name(),
                task.priority(),
                task.duration().as_millis()
            ),
        );
        self.queue.submit(Arc::new(task));
        Ok(id)
    }

    /// Generate `count` tasks named `Task-<i>` with random priority in 1..=10,
    /// duration of 2, 3 or 4 seconds and a deadline two seconds past that.
    pub fn seed<R: Rng>(&self, count: usize, rng: &mut R) -> Result<Vec<TaskId>, SchedError> {
        (1..=count)
            .map(|i| {
                let priority = rng.random_range(1..=10);
                let duration_ms = rng.random_range(2..=4) * 1000;
                let deadline = Utc::now().timestamp_millis() + duration_ms + 2000;
                self.submit(&format!("Task-{i}"), priority, duration_ms, deadline)
            })
            .collect()
    }

    /// Tasks accepted so far.
    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }

    fn reject(&self, name: &str, err: SchedError) -> SchedError {
        let label = if name.trim().is_empty() { None } else { Some(name) };
        self.log
            .record(EventKind::Rejected, label, format!("Rejected task '{name}': {err}"));
        err
    }
}

fn parse_field(field: &str, raw: &str) -> Result<i64, SchedError> {
    raw.trim()
        .parse()
        .map_err(|e| SchedError::invalid(format!("{field} '{}' is not an integer: {e}", raw.trim())))
}

fn build_task(
    name: &str,
    priority: i64,
    duration_ms: i64,
    deadline_epoch_ms: i64,
) -> Result<Task, SchedError> {
    let priority = Priority::new(priority)?;
    if duration_ms <= 0 {
        return Err(SchedError::invalid(format!(
            "duration must be positive, got {duration_ms}ms"
        )));
    }
    let deadline = DateTime::<Utc>::from_timestamp_millis(deadline_epoch_ms).ok_or_else(|| {
        SchedError::invalid(format!("deadline {deadline_epoch_ms} is out of range"))
    })?;
    Task::new(name, priority, Duration::from_millis(duration_ms as u64), deadline)
}
