//! Task data and cooperative, tick-sliced execution.
//!
//! A [`Task`] is shared between the ready queue, the dispatcher and the
//! execution pool through an `Arc`. Identity fields are immutable; execution
//! state sits behind a mutex and the interrupt request is an atomic flag that
//! any thread may set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use rtsched_core::{Priority, ResumePolicy, SchedError, TaskId, TaskRecord};

/// A progress notification produced on the execution thread.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub task_id: TaskId,
    pub task: String,
    /// 0..=100
    pub percent: u8,
    pub at: DateTime<Utc>,
}

/// Per-tick hook run on the execution thread. Returning an error aborts the
/// run as an execution fault.
pub trait Workload: Send + Sync {
    fn on_tick(&self, task: &str, percent: u8) -> Result<(), String>;
}

impl<F> Workload for F
where
    F: Fn(&str, u8) -> Result<(), String> + Send + Sync,
{
    fn on_tick(&self, task: &str, percent: u8) -> Result<(), String> {
        self(task, percent)
    }
}

/// How a single run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Elapsed time reached the nominal duration.
    Completed,
    /// The interrupt flag was observed at a tick boundary.
    Interrupted,
}

/// Settings a run needs from the dispatcher.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub tick: Duration,
    pub resume_policy: ResumePolicy,
    pub progress: broadcast::Sender<ProgressEvent>,
}

#[derive(Debug, Default)]
struct ExecState {
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    /// Execution time accumulated across runs (used by `ResumePolicy::Resume`).
    consumed: Duration,
    runs: u32,
    preemptions: u32,
    fault: Option<String>,
}

pub struct Task {
    id: TaskId,
    name: String,
    priority: Priority,
    duration: Duration,
    deadline: DateTime<Utc>,
    interrupted: AtomicBool,
    exec: Mutex<ExecState>,
    workload: Option<Arc<dyn Workload>>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("duration", &self.duration)
            .field("deadline", &self.deadline)
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

impl Task {
    /// Build a task, rejecting an empty name or a zero duration.
    pub fn new(
        name: impl Into<String>,
        priority: Priority,
        duration: Duration,
        deadline: DateTime<Utc>,
    ) -> Result<Self, SchedError> {
        let name = name.into().trim().to_string();
        if name.is_empty() {
            return Err(SchedError::invalid("task name is empty"));
        }
        if duration.is_zero() {
            return Err(SchedError::invalid(format!("duration of {name} must be positive")));
        }
        Ok(Self {
            id: TaskId::new(),
            name,
            priority,
            duration,
            deadline,
            interrupted: AtomicBool::new(false),
            exec: Mutex::new(ExecState::default()),
            workload: None,
        })
    }

    /// Attach a per-tick workload hook.
    pub fn with_workload(mut self, workload: Arc<dyn Workload>) -> Self {
        self.workload = Some(workload);
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    /// Request a stop at the next tick boundary. Idempotent, callable from
    /// any thread.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub(crate) fn clear_interrupt(&self) {
        self.interrupted.store(false, Ordering::SeqCst);
    }

    fn exec(&self) -> MutexGuard<'_, ExecState> {
        self.exec.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.exec().started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.exec().ended_at
    }

    pub(crate) fn note_preempted(&self) {
        self.exec().preemptions += 1;
    }

    /// Record a fault and close the run if it never reached its end stamp.
    pub(crate) fn note_fault(&self, reason: impl Into<String>) {
        let mut exec = self.exec();
        exec.fault = Some(reason.into());
        if exec.ended_at.is_none() {
            exec.ended_at = Some(Utc::now());
        }
    }

    /// Snapshot for a result set.
    pub fn record(&self) -> TaskRecord {
        let exec = self.exec();
        TaskRecord {
            id: self.id,
            name: self.name.clone(),
            priority: self.priority,
            duration_ms: self.duration.as_millis() as u64,
            deadline: self.deadline,
            started_at: exec.started_at,
            ended_at: exec.ended_at,
            runs: exec.runs,
            preemptions: exec.preemptions,
            fault: exec.fault.clone(),
        }
    }

    /// Percentage of the nominal duration covered by `elapsed`, capped at 100.
    pub fn progress_for(&self, elapsed: Duration) -> u8 {
        let pct = elapsed.as_nanos() * 100 / self.duration.as_nanos().max(1);
        pct.min(100) as u8
    }

    /// Execute one run in `ctx.tick` slices until the nominal duration is
    /// covered or the interrupt flag is seen at a slice boundary.
    ///
    /// The current slice always runs to its boundary; there is no finer
    /// cancellation granularity.
    pub fn run(&self, ctx: &RunContext) -> Result<RunOutcome, SchedError> {
        let carried = {
            let mut exec = self.exec();
            exec.runs += 1;
            exec.ended_at = None;
            exec.fault = None;
            let carried = match ctx.resume_policy {
                ResumePolicy::Restart => Duration::ZERO,
                ResumePolicy::Resume => exec.consumed,
            };
            if carried.is_zero() || exec.started_at.is_none() {
                exec.started_at = Some(Utc::now());
            }
            carried
        };

        let begun = Instant::now();
        let elapsed = || carried + begun.elapsed();

        let outcome = loop {
            let so_far = elapsed();
            if so_far >= self.duration {
                break RunOutcome::Completed;
            }
            if self.is_interrupted() {
                break RunOutcome::Interrupted;
            }

            std::thread::sleep(ctx.tick.min(self.duration - so_far));

            let percent = self.progress_for(elapsed());
            let _ = ctx.progress.send(ProgressEvent {
                task_id: self.id,
                task: self.name.clone(),
                percent,
                at: Utc::now(),
            });

            if let Some(workload) = &self.workload {
                if let Err(reason) = workload.on_tick(&self.name, percent) {
                    self.finish(elapsed());
                    self.exec().fault = Some(reason.clone());
                    return Err(SchedError::fault(&self.name, reason));
                }
            }
        };

        self.finish(elapsed());
        Ok(outcome)
    }

    fn finish(&self, elapsed: Duration) {
        let mut exec = self.exec();
        exec.ended_at = Some(Utc::now());
        exec.consumed = elapsed.min(self.duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(tick_ms: u64) -> (RunContext, broadcast::Receiver<ProgressEvent>) {
        let (tx, rx) = broadcast::channel(64);
        (
            RunContext {
                tick: Duration::from_millis(tick_ms),
                resume_policy: ResumePolicy::Restart,
                progress: tx,
            },
            rx,
        )
    }

    fn task(name: &str, duration_ms: u64) -> Task {
        Task::new(
            name,
            Priority::new(5).unwrap(),
            Duration::from_millis(duration_ms),
            Utc::now() + chrono::Duration::seconds(10),
        )
        .unwrap()
    }

    #[test]
    fn rejects_empty_name_and_zero_duration() {
        let deadline = Utc::now();
        let p = Priority::new(1).unwrap();
        assert!(matches!(
            Task::new("   ", p, Duration::from_millis(10), deadline),
            Err(SchedError::InvalidInput(_))
        ));
        assert!(matches!(
            Task::new("t", p, Duration::ZERO, deadline),
            Err(SchedError::InvalidInput(_))
        ));
    }

    #[test]
    fn runs_to_completion_and_reports_progress() {
        let (ctx, mut rx) = ctx(5);
        let t = task("full", 30);

        assert_eq!(t.run(&ctx).unwrap(), RunOutcome::Completed);
        assert!(!t.is_interrupted());

        let record = t.record();
        assert_eq!(record.runs, 1);
        assert!(record.turnaround_ms().unwrap() >= 30);

        let mut last = 0;
        while let Ok(event) = rx.try_recv() {
            assert!(event.percent >= last, "progress went backwards");
            last = event.percent;
        }
        assert_eq!(last, 100);
    }

    #[test]
    fn interrupt_stops_at_tick_boundary() {
        let (ctx, _rx) = ctx(5);
        let t = Arc::new(task("long", 5_000));

        let runner = {
            let t = Arc::clone(&t);
            std::thread::spawn(move || t.run(&ctx))
        };
        std::thread::sleep(Duration::from_millis(20));
        t.interrupt();

        let outcome = runner.join().unwrap().unwrap();
        assert_eq!(outcome, RunOutcome::Interrupted);
        assert!(t.is_interrupted());
        let record = t.record();
        assert!(record.ended_at.is_some());
        assert!(record.turnaround_ms().unwrap() < 5_000);
    }

    #[test]
    fn interrupt_is_idempotent() {
        let (ctx, _rx) = ctx(5);
        let once = task("once", 1_000);
        let twice = task("twice", 1_000);

        once.interrupt();
        twice.interrupt();
        twice.interrupt();

        assert_eq!(once.run(&ctx).unwrap(), twice.run(&ctx).unwrap());
        assert_eq!(once.is_interrupted(), twice.is_interrupted());
    }

    #[test]
    fn workload_error_is_an_execution_fault() {
        let (ctx, _rx) = ctx(5);
        let t = task("faulty", 1_000)
            .with_workload(Arc::new(|_: &str, _: u8| Err("sensor offline".to_string())));

        let err = t.run(&ctx).unwrap_err();
        assert!(matches!(err, SchedError::ExecutionFault { .. }));
        let record = t.record();
        assert_eq!(record.fault.as_deref(), Some("sensor offline"));
        assert!(record.ended_at.is_some());
    }

    #[test]
    fn resume_policy_carries_elapsed_time() {
        let (mut ctx, _rx) = ctx(5);
        ctx.resume_policy = ResumePolicy::Resume;
        let t = Arc::new(task("resumable", 200));

        let runner = {
            let t = Arc::clone(&t);
            let ctx = ctx.clone();
            std::thread::spawn(move || t.run(&ctx))
        };
        std::thread::sleep(Duration::from_millis(120));
        t.interrupt();
        assert_eq!(runner.join().unwrap().unwrap(), RunOutcome::Interrupted);

        t.clear_interrupt();
        let resumed_at = Instant::now();
        assert_eq!(t.run(&ctx).unwrap(), RunOutcome::Completed);
        assert!(
            resumed_at.elapsed() < Duration::from_millis(190),
            "resume should not restart the full duration"
        );
        assert_eq!(t.record().runs, 2);
    }

    #[test]
    fn progress_is_capped() {
        let t = task("cap", 100);
        assert_eq!(t.progress_for(Duration::from_millis(50)), 50);
        assert_eq!(t.progress_for(Duration::from_millis(500)), 100);
    }
}
