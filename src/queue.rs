#![forbid(unsafe_code)]

/*
 *     ______   __  __     __         ______     ______
 *    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
 *    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
 *     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
 *      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
 *
 * Author: Colin MacRitchie / Ripple Group
 */

/* Shared FIFO run queues for the two scheduling levels */

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam::queue::SegQueue;
use dashmap::DashMap;

use crate::engine::TaskId;
use crate::level::Level;
use crate::slice::TimeSlice;

/// Run queue identifier.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueId {
    /// Queue for HIGH-level tasks.
    High = 0,
    /// Queue for LOW-level tasks.
    Low = 1,
}

impl QueueId {
    /// Queue serving `level`.
    #[inline]
    #[must_use]
    pub const fn for_level(level: Level) -> Self {
        match level {
            Level::High => Self::High,
            Level::Low => Self::Low,
        }
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::High => f.write_str("HI"),
            Self::Low => f.write_str("LO"),
        }
    }
}

/// Entry handed to an execution unit by dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedTask {
    /// Task to run.
    pub task: TaskId,
    /// Slice granted for this run.
    pub slice: TimeSlice,
    /// Queue the entry came from.
    pub queue: QueueId,
    /// Host enqueue flags, passed through untouched.
    pub flags: u64,
}

#[derive(Debug)]
struct Slot {
    entry: QueuedTask,
    ticket: u64,
}

/// Unbounded MPMC FIFO.
#[derive(Debug)]
pub struct RunQueue {
    id: QueueId,
    slots: SegQueue<Slot>,
    depth: AtomicUsize,
    consumed: AtomicU64,
    skipped: AtomicU64,
}

impl RunQueue {
    fn new(id: QueueId) -> Self {
        Self {
            id,
            slots: SegQueue::new(),
            depth: AtomicUsize::new(0),
            consumed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    /// Queue identifier.
    pub fn id(&self) -> QueueId {
        self.id
    }

    /// Entries physically queued, including withdrawn ones not yet skipped.
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries handed out by dispatch.
    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }

    /// Withdrawn or superseded entries discarded at the head.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    fn push(&self, slot: Slot) {
        self.depth.fetch_add(1, Ordering::AcqRel);
        self.slots.push(slot);
    }

    fn pop(&self) -> Option<Slot> {
        let slot = self.slots.pop()?;
        self.depth.fetch_sub(1, Ordering::AcqRel);
        Some(slot)
    }
}

/// The HIGH and LOW run queues plus the live-entry table.
///
/// Each task has at most one live entry. Enqueueing a task that is already
/// queued supersedes the older entry, and [`RunQueues::cancel`] withdraws
/// the live entry of a task that left the scheduler. Stale entries are
/// discarded when they reach the head of their queue.
#[derive(Debug)]
pub struct RunQueues {
    high: RunQueue,
    low: RunQueue,
    live: DashMap<TaskId, u64>,
    next_ticket: AtomicU64,
}

impl RunQueues {
    /// Creates both queues, empty.
    #[must_use]
    pub fn new() -> Self {
        Self {
            high: RunQueue::new(QueueId::High),
            low: RunQueue::new(QueueId::Low),
            live: DashMap::new(),
            next_ticket: AtomicU64::new(1),
        }
    }

    /// Appends `task` to the tail of `queue`.
    pub fn enqueue(&self, queue: QueueId, task: TaskId, slice: TimeSlice, flags: u64) {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);

        // Register before publishing so a consumer never sees an unknown ticket
        self.live.insert(task, ticket);
        self.queue(queue).push(Slot {
            entry: QueuedTask {
                task,
                slice,
                queue,
                flags,
            },
            ticket,
        });
    }

    /// Removes and returns the head entry of `queue`, skipping stale entries.
    pub fn consume_one(&self, queue: QueueId) -> Option<QueuedTask> {
        let run_queue = self.queue(queue);

        while let Some(slot) = run_queue.pop() {
            let claimed = self
                .live
                .remove_if(&slot.entry.task, |_, live_ticket| *live_ticket == slot.ticket)
                .is_some();

            if claimed {
                run_queue.consumed.fetch_add(1, Ordering::Relaxed);
                return Some(slot.entry);
            }
            run_queue.skipped.fetch_add(1, Ordering::Relaxed);
        }

        None
    }

    /// Withdraws the live entry of `task`. Returns whether one existed.
    pub fn cancel(&self, task: TaskId) -> bool {
        self.live.remove(&task).is_some()
    }

    /// Whether `task` has a live entry.
    pub fn is_queued(&self, task: TaskId) -> bool {
        self.live.contains_key(&task)
    }

    /// Live entries across both queues.
    pub fn live_entries(&self) -> usize {
        self.live.len()
    }

    /// Access to one queue's counters.
    pub fn queue(&self, id: QueueId) -> &RunQueue {
        match id {
            QueueId::High => &self.high,
            QueueId::Low => &self.low,
        }
    }
}

impl Default for RunQueues {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn slice() -> TimeSlice {
        TimeSlice::from_millis(50)
    }

    #[test]
    fn test_fifo_order() {
        let queues = RunQueues::new();
        for pid in 1..=3 {
            queues.enqueue(QueueId::High, TaskId(pid), slice(), 0);
        }

        let order: Vec<u32> = std::iter::from_fn(|| queues.consume_one(QueueId::High))
            .map(|entry| entry.task.0)
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(queues.queue(QueueId::High).consumed(), 3);
    }

    #[test]
    fn test_queues_are_independent() {
        let queues = RunQueues::new();
        queues.enqueue(QueueId::Low, TaskId(1), TimeSlice::INFINITE, 0);

        assert!(queues.consume_one(QueueId::High).is_none());
        let entry = queues.consume_one(QueueId::Low).expect("low entry");
        assert_eq!(entry.task, TaskId(1));
        assert_eq!(entry.queue, QueueId::Low);
        assert!(entry.slice.is_infinite());
    }

    #[test]
    fn test_cancel_withdraws_entry() {
        let queues = RunQueues::new();
        queues.enqueue(QueueId::High, TaskId(1), slice(), 0);
        queues.enqueue(QueueId::High, TaskId(2), slice(), 0);

        assert!(queues.cancel(TaskId(1)));
        assert!(!queues.cancel(TaskId(1)));

        let entry = queues.consume_one(QueueId::High).expect("entry");
        assert_eq!(entry.task, TaskId(2));
        assert!(queues.consume_one(QueueId::High).is_none());
        assert_eq!(queues.queue(QueueId::High).skipped(), 1);
        assert!(queues.queue(QueueId::High).is_empty());
    }

    #[test]
    fn test_requeue_supersedes_older_entry() {
        let queues = RunQueues::new();
        queues.enqueue(QueueId::High, TaskId(7), slice(), 0);
        queues.enqueue(QueueId::Low, TaskId(7), TimeSlice::INFINITE, 3);

        assert!(queues.consume_one(QueueId::High).is_none());
        let entry = queues.consume_one(QueueId::Low).expect("entry");
        assert_eq!(entry.flags, 3);
        assert!(!queues.is_queued(TaskId(7)));
    }

    #[test]
    fn test_concurrent_no_loss_no_duplicates() {
        let queues = Arc::new(RunQueues::new());
        let mut producers = vec![];

        for t in 0..4u32 {
            let queues = Arc::clone(&queues);
            producers.push(thread::spawn(move || {
                for i in 0..1_000u32 {
                    queues.enqueue(QueueId::High, TaskId(t * 10_000 + i), slice(), 0);
                }
            }));
        }
        for handle in producers {
            handle.join().expect("Producer panicked");
        }

        let mut consumers = vec![];
        for _ in 0..4 {
            let queues = Arc::clone(&queues);
            consumers.push(thread::spawn(move || {
                let mut seen = Vec::new();
                while let Some(entry) = queues.consume_one(QueueId::High) {
                    seen.push(entry.task);
                }
                seen
            }));
        }

        let mut all = HashSet::new();
        let mut total = 0;
        for handle in consumers {
            for task in handle.join().expect("Consumer panicked") {
                assert!(all.insert(task), "Task dispatched twice: {task:?}");
                total += 1;
            }
        }
        assert_eq!(total, 4_000);
    }
}
