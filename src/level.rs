//! Per-task priority level storage
//!
//! Every task the engine has seen maps to a [`Level`]. The store is bounded:
//! once `capacity` entries are resident, inserting a new task evicts an
//! entry that has not been touched recently (CLOCK second chance). Lookups
//! for evicted or never-seen tasks report [`Level::High`], so a task that
//! loses its entry simply starts over at the top level.
//!
//! Writes are best-effort. If eviction cannot free a slot within a bounded
//! number of attempts the write is dropped and counted.

#![forbid(unsafe_code)]
#![allow(clippy::trivially_copy_pass_by_ref)]

//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};

use crossbeam::queue::ArrayQueue;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::engine::TaskId;

/// Default number of resident level entries.
pub const DEFAULT_LEVEL_CAPACITY: usize = 65_536;

/* Clock tokens examined per eviction before falling back */
const EVICTION_SWEEP: usize = 64;

/* Reserve/evict rounds before a write is dropped */
const INSERT_ATTEMPTS: usize = 4;

/// Scheduling level of a task.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Level {
    /// Round-robin level with a bounded slice. Every task starts here.
    #[default]
    High = 0,
    /// FIFO level with an unbounded slice.
    Low = 1,
}

impl Level {
    /// Raw stored value.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decodes a stored value.
    #[inline]
    #[must_use]
    pub const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::High),
            1 => Some(Self::Low),
            _ => None,
        }
    }

    /// Short label used in report lines.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::High => "HI",
            Self::Low => "LO",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug)]
struct LevelSlot {
    level: AtomicU8,
    referenced: AtomicBool, /* Second-chance bit */
}

impl LevelSlot {
    fn new(level: Level) -> Self {
        Self {
            level: AtomicU8::new(level.as_u8()),
            referenced: AtomicBool::new(true),
        }
    }

    #[inline]
    fn load(&self) -> Level {
        self.referenced.store(true, Ordering::Relaxed);
        Level::from_u8(self.level.load(Ordering::Acquire)).unwrap_or_default()
    }

    #[inline]
    fn store(&self, level: Level) -> bool {
        self.level.store(level.as_u8(), Ordering::Release);
        self.referenced.store(true, Ordering::Relaxed);
        true
    }

    // HIGH to LOW, exactly one caller wins
    #[inline]
    fn demote(&self) -> bool {
        self.referenced.store(true, Ordering::Relaxed);
        self.level
            .compare_exchange(Level::High.as_u8(), Level::Low.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn into_level(self) -> Level {
        Level::from_u8(self.level.into_inner()).unwrap_or_default()
    }
}

/// Bounded concurrent map from task to [`Level`].
#[derive(Debug)]
pub struct LevelStore {
    entries: DashMap<TaskId, LevelSlot>,
    capacity: usize,
    reserved: AtomicUsize,
    clock_ring: ArrayQueue<TaskId>,
    evictions: AtomicU64,
    dropped_writes: AtomicU64,
}

impl LevelStore {
    /// Creates a store holding at most `capacity` entries (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: DashMap::new(),
            capacity,
            reserved: AtomicUsize::new(0),
            clock_ring: ArrayQueue::new(capacity),
            evictions: AtomicU64::new(0),
            dropped_writes: AtomicU64::new(0),
        }
    }

    /// Returns the level of `task`, [`Level::High`] when absent.
    #[inline]
    pub fn get(&self, task: TaskId) -> Level {
        match self.entries.get(&task) {
            Some(slot) => slot.load(),
            None => Level::High,
        }
    }

    /// Records `level` for `task`, evicting a cold entry if the store is full.
    pub fn set(&self, task: TaskId, level: Level) {
        if let Some(slot) = self.entries.get(&task) {
            slot.store(level);
            return;
        }

        if self.upsert(task, level, |slot| slot.store(level)).is_none() {
            self.record_dropped_write(task, level);
        }
    }

    /// Moves `task` from HIGH to LOW. Returns `true` for the one caller
    /// that performed the transition.
    ///
    /// A missing task counts as HIGH and is inserted at LOW. If the store
    /// cannot make room the transition still counts, but the task keeps
    /// reading HIGH, as if its entry had been evicted right away.
    pub fn demote(&self, task: TaskId) -> bool {
        if let Some(slot) = self.entries.get(&task) {
            return slot.demote();
        }

        match self.upsert(task, Level::Low, LevelSlot::demote) {
            Some(won) => won,
            None => {
                self.record_dropped_write(task, Level::Low);
                true
            },
        }
    }

    /// Removes the entry for `task` and returns its level, `None` when absent.
    ///
    /// Concurrent callers for the same task see at most one `Some`.
    pub fn take(&self, task: TaskId) -> Option<Level> {
        let (_, slot) = self.entries.remove(&task)?;
        self.release();
        Some(slot.into_level())
    }

    /// Removes the entry for `task`. Absent tasks are ignored.
    pub fn delete(&self, task: TaskId) {
        let _ = self.take(task);
    }

    /// Whether `task` has a resident entry. Does not mark it referenced.
    pub fn contains(&self, task: TaskId) -> bool {
        self.entries.contains_key(&task)
    }

    /// Resident entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are resident.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum resident entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries removed to make room.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Writes dropped because no slot could be freed.
    pub fn dropped_writes(&self) -> u64 {
        self.dropped_writes.load(Ordering::Relaxed)
    }

    // Claim one of the `capacity` slots
    fn try_reserve(&self) -> bool {
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| {
                (held < self.capacity).then_some(held + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        self.reserved.fetch_sub(1, Ordering::AcqRel);
    }

    // Inserts at `level`, or applies `on_occupied` if another caller got there
    // first. `None` when no slot could be freed.
    fn upsert<F>(&self, task: TaskId, level: Level, on_occupied: F) -> Option<bool>
    where
        F: FnOnce(&LevelSlot) -> bool,
    {
        for _ in 0..INSERT_ATTEMPTS {
            if self.try_reserve() {
                return Some(self.insert_reserved(task, level, on_occupied));
            }
            self.evict_one();
        }
        None
    }

    fn insert_reserved<F>(&self, task: TaskId, level: Level, on_occupied: F) -> bool
    where
        F: FnOnce(&LevelSlot) -> bool,
    {
        match self.entries.entry(task) {
            Entry::Occupied(occupied) => {
                let applied = on_occupied(occupied.get());
                drop(occupied);
                self.release();
                applied
            },
            Entry::Vacant(vacant) => {
                vacant.insert(LevelSlot::new(level));
                // A displaced token is stale or gets re-queued on its next sweep
                let _ = self.clock_ring.force_push(task);
                true
            },
        }
    }

    fn remove_entry(&self, task: TaskId) -> bool {
        self.take(task).is_some()
    }

    fn record_dropped_write(&self, _task: TaskId, _level: Level) {
        self.dropped_writes.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "tracing")]
        tracing::trace!(task_id = ?_task, level = %_level, "Level write dropped, store saturated");
    }

    // CLOCK sweep over insertion tokens
    fn evict_one(&self) -> bool {
        for _ in 0..EVICTION_SWEEP {
            let Some(candidate) = self.clock_ring.pop() else {
                break;
            };

            let second_chance = match self.entries.get(&candidate) {
                Some(slot) => slot.referenced.swap(false, Ordering::AcqRel),
                None => continue,
            };

            if second_chance {
                let _ = self.clock_ring.push(candidate);
                continue;
            }

            if self.remove_entry(candidate) {
                self.record_eviction(candidate);
                return true;
            }
        }

        // Ring exhausted or every token was hot
        let victim = self.entries.iter().next().map(|entry| *entry.key());
        match victim {
            Some(task) if self.remove_entry(task) => {
                self.record_eviction(task);
                true
            },
            _ => false,
        }
    }

    fn record_eviction(&self, _task: TaskId) {
        self.evictions.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "tracing")]
        tracing::trace!(task_id = ?_task, "Level entry evicted");
    }
}

impl Default for LevelStore {
    fn default() -> Self {
        Self::new(DEFAULT_LEVEL_CAPACITY)
    }
}
