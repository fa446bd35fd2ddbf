//! Per-execution-unit scheduling counters
//!
//! Each unit owns one cache-padded shard of five counters and only ever
//! increments its own shard, so the hot path never contends on a shared
//! cache line. Readers sum all shards; the result is eventually consistent
//! and counters never decrease.

#![forbid(unsafe_code)]

//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

use crate::engine::CpuId;

/// Number of counters per unit.
pub const STAT_COUNT: usize = 5;

/// Counter slot.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatIndex {
    /// Tasks enqueued to the HIGH queue.
    EnqHigh = 0,
    /// Tasks enqueued to the LOW queue.
    EnqLow = 1,
    /// Dispatch cycles that tried the HIGH queue.
    DispatchHighAttempt = 2,
    /// Dispatch cycles that fell through to the LOW queue.
    DispatchLowAttempt = 3,
    /// HIGH to LOW demotions.
    Demote = 4,
}

impl StatIndex {
    /// All slots in index order.
    pub const ALL: [Self; STAT_COUNT] = [
        Self::EnqHigh,
        Self::EnqLow,
        Self::DispatchHighAttempt,
        Self::DispatchLowAttempt,
        Self::Demote,
    ];

    /// Metric name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::EnqHigh => "enq_hi",
            Self::EnqLow => "enq_lo",
            Self::DispatchHighAttempt => "dispatch_hi",
            Self::DispatchLowAttempt => "dispatch_lo",
            Self::Demote => "demote",
        }
    }
}

#[derive(Debug, Default)]
struct StatShard {
    counters: [AtomicU64; STAT_COUNT],
}

/// Sharded counters, one shard per execution unit.
#[derive(Debug)]
pub struct StatCounters {
    shards: Box<[CachePadded<StatShard>]>,
}

impl StatCounters {
    /// Creates zeroed counters for `units` execution units (minimum 1).
    #[must_use]
    pub fn new(units: usize) -> Self {
        let shards = (0..units.max(1))
            .map(|_| CachePadded::new(StatShard::default()))
            .collect();
        Self { shards }
    }

    /// Number of shards.
    pub fn units(&self) -> usize {
        self.shards.len()
    }

    /// Adds one to `index` in the shard of `unit`.
    ///
    /// Units beyond the configured count fold onto existing shards.
    #[inline]
    pub fn increment(&self, unit: CpuId, index: StatIndex) {
        let shard = &self.shards[unit.index() % self.shards.len()];
        shard.counters[index as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Sum of one counter over all units.
    pub fn read(&self, index: StatIndex) -> u64 {
        self.shards
            .iter()
            .map(|shard| shard.counters[index as usize].load(Ordering::Relaxed))
            .fold(0u64, u64::wrapping_add)
    }

    /// Sum of every counter over all units.
    pub fn read_all(&self) -> StatsSnapshot {
        let mut counters = [0u64; STAT_COUNT];
        for shard in self.shards.iter() {
            for (total, counter) in counters.iter_mut().zip(shard.counters.iter()) {
                *total = total.wrapping_add(counter.load(Ordering::Relaxed));
            }
        }
        StatsSnapshot { counters }
    }

    /// Counters of a single unit, `None` when out of range.
    pub fn unit_snapshot(&self, unit: CpuId) -> Option<StatsSnapshot> {
        let shard = self.shards.get(unit.index())?;
        let mut counters = [0u64; STAT_COUNT];
        for (value, counter) in counters.iter_mut().zip(shard.counters.iter()) {
            *value = counter.load(Ordering::Relaxed);
        }
        Some(StatsSnapshot { counters })
    }
}

/// Point-in-time counter values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StatsSnapshot {
    counters: [u64; STAT_COUNT],
}

impl StatsSnapshot {
    /// Value of one counter.
    #[inline]
    pub fn get(&self, index: StatIndex) -> u64 {
        self.counters[index as usize]
    }

    /// Raw values in index order.
    pub fn as_array(&self) -> [u64; STAT_COUNT] {
        self.counters
    }

    /// HIGH enqueues.
    pub fn enq_high(&self) -> u64 {
        self.get(StatIndex::EnqHigh)
    }

    /// LOW enqueues.
    pub fn enq_low(&self) -> u64 {
        self.get(StatIndex::EnqLow)
    }

    /// Dispatch cycles that tried HIGH.
    pub fn dispatch_high_attempts(&self) -> u64 {
        self.get(StatIndex::DispatchHighAttempt)
    }

    /// Dispatch cycles that fell through to LOW.
    pub fn dispatch_low_attempts(&self) -> u64 {
        self.get(StatIndex::DispatchLowAttempt)
    }

    /// Demotions.
    pub fn demotions(&self) -> u64 {
        self.get(StatIndex::Demote)
    }

    /// Exports the counters as `metrics` gauges.
    #[cfg(feature = "metrics")]
    pub fn publish(&self) {
        for index in StatIndex::ALL {
            metrics::gauge!(format!("mlfq_pulse.{}", index.name())).set(self.get(index) as f64);
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "enq_hi={} enq_lo={} demote={}",
            self.enq_high(),
            self.enq_low(),
            self.demotions()
        )
    }
}
