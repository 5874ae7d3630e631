//! Completed / Interrupted / Missed result sets and the metrics aggregator.
//!
//! All three sets live behind one `RwLock` so a metrics snapshot never sees
//! a task half-moved between sets.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};

use rtsched_core::{Classification, MetricsSnapshot, TaskId, TaskRecord, TaskSummary};

#[derive(Debug, Default)]
struct Sets {
    completed: Vec<TaskRecord>,
    interrupted: Vec<TaskRecord>,
    missed: Vec<TaskRecord>,
}

impl Sets {
    fn get(&self, class: Classification) -> &Vec<TaskRecord> {
        match class {
            Classification::Completed => &self.completed,
            Classification::Interrupted => &self.interrupted,
            Classification::Missed => &self.missed,
        }
    }

    fn get_mut(&mut self, class: Classification) -> &mut Vec<TaskRecord> {
        match class {
            Classification::Completed => &mut self.completed,
            Classification::Interrupted => &mut self.interrupted,
            Classification::Missed => &mut self.missed,
        }
    }
}

const ALL: [Classification; 3] = [
    Classification::Completed,
    Classification::Interrupted,
    Classification::Missed,
];

/// Pairwise-disjoint result sets.
#[derive(Debug, Default)]
pub struct ResultSets {
    sets: RwLock<Sets>,
}

impl ResultSets {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Sets> {
        self.sets.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Sets> {
        self.sets.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// File a record into `class`.
    ///
    /// A preempted task is already in Interrupted when it is filed again
    /// after its re-run; any earlier entry for the same id is removed so the
    /// sets stay disjoint.
    pub fn file(&self, class: Classification, record: TaskRecord) {
        let mut sets = self.write();
        for other in ALL {
            sets.get_mut(other).retain(|r| r.id != record.id);
        }
        sets.get_mut(class).push(record);
    }

    /// Remove `id` from whichever set holds it. Returns the set it was in.
    pub fn withdraw(&self, id: TaskId) -> Option<Classification> {
        let mut sets = self.write();
        ALL.into_iter().find(|&class| {
            let set = sets.get_mut(class);
            let before = set.len();
            set.retain(|r| r.id != id);
            set.len() != before
        })
    }

    /// Which set holds `id`, if any.
    pub fn classification_of(&self, id: TaskId) -> Option<Classification> {
        let sets = self.read();
        ALL.into_iter()
            .find(|&class| sets.get(class).iter().any(|r| r.id == id))
    }

    pub fn records(&self, class: Classification) -> Vec<TaskRecord> {
        self.read().get(class).clone()
    }

    pub fn summaries(&self, class: Classification) -> Vec<TaskSummary> {
        self.read().get(class).iter().map(TaskRecord::summary).collect()
    }

    pub fn completed(&self) -> Vec<TaskSummary> {
        self.summaries(Classification::Completed)
    }

    pub fn interrupted(&self) -> Vec<TaskSummary> {
        self.summaries(Classification::Interrupted)
    }

    pub fn missed(&self) -> Vec<TaskSummary> {
        self.summaries(Classification::Missed)
    }

    pub fn total(&self) -> usize {
        let sets = self.read();
        sets.completed.len() + sets.interrupted.len() + sets.missed.len()
    }

    /// Consistent counts plus mean turnaround over completed tasks.
    pub fn metrics(&self) -> MetricsSnapshot {
        let sets = self.read();
        let turnarounds: Vec<i64> = sets
            .completed
            .iter()
            .filter_map(TaskRecord::turnaround_ms)
            .collect();
        let avg_turnaround_ms = if turnarounds.is_empty() {
            0
        } else {
            (turnarounds.iter().sum::<i64>() / turnarounds.len() as i64).max(0) as u64
        };

        MetricsSnapshot {
            total: sets.completed.len() + sets.interrupted.len() + sets.missed.len(),
            completed: sets.completed.len(),
            interrupted: sets.interrupted.len(),
            missed: sets.missed.len(),
            avg_turnaround_ms,
        }
    }
}
