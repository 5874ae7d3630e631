//! Thread-safe ready queue ordered by descending priority, FIFO among equals.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rtsched_core::Priority;

use crate::task::Task;

struct Entry {
    priority: Priority,
    /// Arrival sequence; lower = earlier.
    seq: u64,
    task: Arc<Task>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Max-heap: higher priority first, then the earlier arrival.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

/// Unbounded priority queue shared by producers and the dispatcher.
///
/// `submit` never blocks on capacity; `take_next` blocks up to a timeout and
/// returns `None` when nothing arrives.
#[derive(Default)]
pub struct ReadyQueue {
    inner: Mutex<Inner>,
    available: Condvar,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a task. Arrival order is fixed when the lock is taken.
    pub fn submit(&self, task: Arc<Task>) {
        let mut inner = self.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(Entry {
            priority: task.priority(),
            seq,
            task,
        });
        drop(inner);
        self.available.notify_all();
    }

    /// Remove the highest-priority task, waiting up to `timeout` for one.
    pub fn take_next(&self, timeout: Duration) -> Option<Arc<Task>> {
        self.take_where(timeout, |_| true)
    }

    /// Remove the head only if it outranks `priority`, waiting up to `timeout`.
    pub fn take_higher_than(&self, priority: Priority, timeout: Duration) -> Option<Arc<Task>> {
        self.take_where(timeout, |head| head > priority)
    }

    fn take_where(
        &self,
        timeout: Duration,
        accept: impl Fn(Priority) -> bool,
    ) -> Option<Arc<Task>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if inner.heap.peek().is_some_and(|head| accept(head.priority)) {
                return inner.heap.pop().map(|entry| entry.task);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .available
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            inner = guard;
        }
    }

    pub fn peek_priority(&self) -> Option<Priority> {
        self.lock().heap.peek().map(|entry| entry.priority)
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().heap.is_empty()
    }

    /// Queued task names in dequeue order.
    pub fn pending(&self) -> Vec<String> {
        let inner = self.lock();
        let mut entries: Vec<&Entry> = inner.heap.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.iter().map(|e| e.task.name().to_string()).collect()
    }
}
