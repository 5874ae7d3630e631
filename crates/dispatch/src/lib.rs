pub mod dispatcher;
pub mod event_log;
pub mod queue;
pub mod results;
pub mod submission;
pub mod task;

pub use dispatcher::{CurrentTask, Dispatcher, DispatcherState};
pub use event_log::{EventKind, EventLog, LogEvent};
pub use queue::ReadyQueue;
pub use results::ResultSets;
pub use submission::Submitter;
pub use task::{ProgressEvent, RunContext, RunOutcome, Task, Workload};
