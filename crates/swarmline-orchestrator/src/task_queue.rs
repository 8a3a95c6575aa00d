use crate::types::Priority;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tokio::time::Instant;
use uuid::Uuid;

/// A queue entry: which task, at what priority, submitted when.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedTask {
    pub task_id: Uuid,
    pub priority: Priority,
    /// Monotonic submission counter; breaks ties within a priority band.
    pub seq: u64,
}

impl Ord for QueuedTask {
    // BinaryHeap is a max-heap: the "greatest" entry is the lowest priority
    // value, then the earliest submission.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Delayed {
    ready_at: Instant,
    entry: QueuedTask,
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| self.entry.cmp(&other.entry))
    }
}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Pending work ordered by priority, then submission order.
///
/// Tasks waiting out a retry backoff sit in a separate delayed heap and
/// become eligible once their deadline passes. Entries are ids only; a task
/// cancelled while queued is skipped by the dispatcher when popped.
#[derive(Debug, Default)]
pub struct TaskQueue {
    ready: BinaryHeap<QueuedTask>,
    delayed: BinaryHeap<Delayed>,
    next_seq: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a newly submitted task. Returns its submission sequence.
    pub fn push(&mut self, task_id: Uuid, priority: Priority) -> QueuedTask {
        let entry = QueuedTask {
            task_id,
            priority,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.ready.push(entry);
        entry
    }

    /// Put an entry back keeping its original submission order.
    pub fn requeue(&mut self, entry: QueuedTask) {
        self.ready.push(entry);
    }

    /// Re-admit an entry once `ready_at` has passed.
    pub fn push_delayed(&mut self, entry: QueuedTask, ready_at: Instant) {
        self.delayed.push(Delayed { ready_at, entry });
    }

    /// Pop the best entry that is eligible at `now`.
    pub fn pop_ready(&mut self, now: Instant) -> Option<QueuedTask> {
        while self.delayed.peek().is_some_and(|d| d.ready_at <= now) {
            if let Some(d) = self.delayed.pop() {
                self.ready.push(d.entry);
            }
        }
        self.ready.pop()
    }

    /// Earliest deadline among delayed entries.
    pub fn next_wakeup(&self) -> Option<Instant> {
        self.delayed.peek().map(|d| d.ready_at)
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn delayed_len(&self) -> usize {
        self.delayed.len()
    }

    pub fn len(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
