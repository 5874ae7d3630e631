//! Append-only scheduling event log.
//!
//! Every event is mirrored to `tracing`, kept in memory in arrival order and
//! fanned out to subscribers over a broadcast channel. Uses `std::sync::RwLock`
//! so producers, the dispatcher thread and async consumers can share it.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{RwLock, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use rtsched_core::SchedError;

/// Scheduling transition that produced a log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Submitted,
    Rejected,
    Preempted,
    Started,
    Completed,
    DeadlineMissed,
    Interrupted,
    Requeued,
    Fault,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEvent {
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    pub kind: EventKind,
    pub message: String,
}

impl LogEvent {
    /// `[<epoch ms>] <message>`
    pub fn line(&self) -> String {
        format!("[{}] {}", self.at.timestamp_millis(), self.message)
    }
}

pub struct EventLog {
    entries: RwLock<Vec<LogEvent>>,
    tx: broadcast::Sender<LogEvent>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            entries: RwLock::new(Vec::new()),
            tx,
        }
    }

    /// Append an event. Subscribers see events in append order.
    pub fn record(&self, kind: EventKind, task: Option<&str>, message: impl Into<String>) {
        let event = LogEvent {
            at: Utc::now(),
            task: task.map(str::to_string),
            kind,
            message: message.into(),
        };

        match kind {
            EventKind::Rejected | EventKind::DeadlineMissed | EventKind::Fault => {
                warn!(kind = ?kind, task = task.unwrap_or("-"), "{}", event.message)
            }
            _ => info!(kind = ?kind, task = task.unwrap_or("-"), "{}", event.message),
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        // Sent under the write lock so channel order matches list order.
        let _ = self.tx.send(event.clone());
        entries.push(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.tx.subscribe()
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events concerning one task, in order.
    pub fn events_for(&self, task: &str) -> Vec<LogEvent> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.task.as_deref() == Some(task))
            .cloned()
            .collect()
    }

    pub fn lines(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(LogEvent::line)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Write one line per event. Returns the number of lines written.
    pub fn export_to_file(&self, path: impl AsRef<Path>) -> Result<usize, SchedError> {
        let lines = self.lines();
        let mut writer = BufWriter::new(File::create(path.as_ref())?);
        for line in &lines {
            writeln!(writer, "{line}")?;
        }
        writer.flush()?;
        info!(path = %path.as_ref().display(), lines = lines.len(), "event log exported");
        Ok(lines.len())
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(1024)
    }
}
