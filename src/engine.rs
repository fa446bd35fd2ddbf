//! Two-level feedback queue decision engine
//!
//! Tasks enter at [`Level::High`] and receive a bounded quantum. A task that
//! burns through its whole quantum while still runnable is demoted to
//! [`Level::Low`], where it runs FIFO with an unbounded slice until it
//! leaves the scheduler. There is no promotion back.
//!
//! All entry points take `&self` and are safe to call concurrently from every
//! execution unit. None of them block or fail; resource exhaustion in the
//! level store or event stream degrades silently and is counted.

#![forbid(unsafe_code)]
#![allow(clippy::trivially_copy_pass_by_ref)] // TaskId references are more idiomatic

//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{ConfigProfile, InitError, MlfqConfig, validate_quantum};
use crate::events::{Event, EventKind, EventStream};
use crate::level::{Level, LevelStore};
use crate::queue::{QueueId, QueuedTask, RunQueues};
use crate::slice::TimeSlice;
use crate::stats::{StatCounters, StatIndex, StatsSnapshot};
use crate::timing::{Clock, create_clock};

/// Task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TaskId(pub u32);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Execution unit (CPU) identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CpuId(pub u32);

impl CpuId {
    /// Index into per-unit arrays.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Context of an enqueue hook
#[derive(Debug, Clone, Copy, Default)]
pub struct EnqueueContext {
    /// Unit running the hook
    pub cpu: CpuId,
    /// Host enqueue flags
    pub flags: u64,
}

impl EnqueueContext {
    /// Context for `cpu` with no flags.
    #[must_use]
    pub const fn on(cpu: CpuId) -> Self {
        Self { cpu, flags: 0 }
    }
}

/// Context of a stopping hook
#[derive(Debug, Clone, Copy)]
pub struct StopContext {
    /// Unit the task ran on
    pub cpu: CpuId,
    /// Whether the task can run again immediately
    pub runnable: bool,
    /// Slice left when the task stopped
    pub slice_remaining: TimeSlice,
}

impl StopContext {
    /// Task was preempted with its slice fully used.
    #[must_use]
    pub const fn slice_expired(cpu: CpuId) -> Self {
        Self {
            cpu,
            runnable: true,
            slice_remaining: TimeSlice::ZERO,
        }
    }

    /// Task stopped on its own (sleep, block, exit).
    #[must_use]
    pub const fn blocked(cpu: CpuId, slice_remaining: TimeSlice) -> Self {
        Self {
            cpu,
            runnable: false,
            slice_remaining,
        }
    }
}

/// Snapshot of engine state for monitoring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MlfqMetrics {
    /// Aggregated counters
    pub stats: StatsSnapshot,
    /// Entries handed out from the HIGH queue
    pub high_dispatched: u64,
    /// Entries handed out from the LOW queue
    pub low_dispatched: u64,
    /// Entries sitting in the HIGH queue
    pub high_depth: usize,
    /// Entries sitting in the LOW queue
    pub low_depth: usize,
    /// Resident level entries
    pub tracked_tasks: usize,
    /// Level entries evicted for space
    pub level_evictions: u64,
    /// Level writes lost to saturation
    pub level_dropped_writes: u64,
    /// Events committed to the ring
    pub events_emitted: u64,
    /// Events lost to a full ring
    pub events_dropped: u64,
    /// Events suppressed by the unit filter
    pub events_filtered: u64,
}

/// Main scheduling decision engine
pub struct MlfqScheduler {
    config: MlfqConfig,
    high_slice_ns: AtomicU64,
    levels: LevelStore,
    queues: RunQueues,
    stats: StatCounters,
    events: EventStream,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for MlfqScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MlfqScheduler")
            .field("high_slice", &self.high_slice())
            .field("units", &self.config.units)
            .field("tracked_tasks", &self.levels.len())
            .field("clock", &self.clock.name())
            .finish_non_exhaustive()
    }
}

impl MlfqScheduler {
    /// Creates the engine with the platform clock
    ///
    /// # Errors
    ///
    /// Returns an [`InitError`] if the configuration is invalid.
    ///
    /// # Examples
    ///
    /// ```
    /// use mlfq_pulse::{MlfqConfig, MlfqScheduler};
    ///
    /// let scheduler = MlfqScheduler::new(MlfqConfig::default()).expect("init");
    /// assert_eq!(scheduler.stats().enq_high(), 0);
    /// ```
    pub fn new(config: MlfqConfig) -> Result<Self, InitError> {
        Self::with_clock(config, create_clock())
    }

    /// Creates the engine from a preset.
    ///
    /// # Errors
    ///
    /// Returns an [`InitError`] if the preset does not validate on this host.
    pub fn with_profile(profile: ConfigProfile) -> Result<Self, InitError> {
        Self::new(profile.create_config())
    }

    /// Creates the engine reading timestamps from `clock`.
    ///
    /// # Errors
    ///
    /// Returns an [`InitError`] if the configuration is invalid.
    pub fn with_clock(config: MlfqConfig, clock: Arc<dyn Clock>) -> Result<Self, InitError> {
        config.validate()?;

        #[cfg(feature = "tracing")]
        tracing::info!(
            high_slice = %config.high_slice,
            level_capacity = config.level_capacity,
            event_capacity = config.event_capacity,
            units = config.units,
            filter = ?config.event_filter,
            clock = clock.name(),
            "MLFQ scheduler initialized"
        );

        Ok(Self {
            high_slice_ns: AtomicU64::new(config.high_slice.as_nanos()),
            levels: LevelStore::new(config.level_capacity),
            queues: RunQueues::new(),
            stats: StatCounters::new(config.units),
            events: EventStream::new(config.event_capacity, config.event_filter),
            clock,
            config,
        })
    }

    /// Task joined the scheduler: start it at HIGH.
    pub fn enable(&self, task: TaskId) {
        self.levels.set(task, Level::High);

        #[cfg(feature = "tracing")]
        tracing::trace!(task_id = ?task, "Task enabled at HIGH");
    }

    /// Task became runnable: queue it by level.
    pub fn enqueue(&self, task: TaskId, ctx: &EnqueueContext) -> QueueId {
        let level = self.levels.get(task);
        let queue = QueueId::for_level(level);

        let (slice, index) = match level {
            Level::High => (self.high_slice(), StatIndex::EnqHigh),
            Level::Low => (TimeSlice::INFINITE, StatIndex::EnqLow),
        };

        self.queues.enqueue(queue, task, slice, ctx.flags);
        self.stats.increment(ctx.cpu, index);
        queue
    }

    /// Unit `cpu` needs work: HIGH first, then LOW.
    pub fn dispatch(&self, cpu: CpuId) -> Option<QueuedTask> {
        self.stats.increment(cpu, StatIndex::DispatchHighAttempt);
        if let Some(entry) = self.queues.consume_one(QueueId::High) {
            return Some(entry);
        }

        self.stats.increment(cpu, StatIndex::DispatchLowAttempt);
        self.queues.consume_one(QueueId::Low)
    }

    /// Task stopped running. Returns whether it was demoted.
    pub fn stopping(&self, task: TaskId, ctx: &StopContext) -> bool {
        if !ctx.runnable || !ctx.slice_remaining.is_exhausted() {
            return false;
        }
        // Only the unit that wins the HIGH to LOW transition reports it
        if !self.levels.demote(task) {
            return false;
        }

        self.stats.increment(ctx.cpu, StatIndex::Demote);
        self.emit(task, ctx.cpu, EventKind::Demote);

        #[cfg(feature = "tracing")]
        tracing::debug!(task_id = ?task, cpu = ctx.cpu.0, "Task demoted to LOW");

        true
    }

    /// Task left the scheduler.
    pub fn disable(&self, task: TaskId, cpu: CpuId) {
        if self.levels.take(task) == Some(Level::Low) {
            self.emit(task, cpu, EventKind::DoneLow);

            #[cfg(feature = "tracing")]
            tracing::debug!(task_id = ?task, cpu = cpu.0, "LOW task finished");
        }

        if self.queues.cancel(task) {
            #[cfg(feature = "tracing")]
            tracing::trace!(task_id = ?task, "Withdrew queued entry of disabled task");
        }
    }

    /// Current level of `task`.
    pub fn level_of(&self, task: TaskId) -> Level {
        self.levels.get(task)
    }

    /// Current HIGH quantum.
    pub fn high_slice(&self) -> TimeSlice {
        TimeSlice::from_nanos(self.high_slice_ns.load(Ordering::Relaxed))
    }

    /// Changes the HIGH quantum for subsequent enqueues.
    ///
    /// # Errors
    ///
    /// Returns [`InitError::InvalidQuantum`] for a zero or unbounded slice.
    pub fn update_quantum(&self, slice: TimeSlice) -> Result<(), InitError> {
        validate_quantum(slice)?;
        self.high_slice_ns.store(slice.as_nanos(), Ordering::Relaxed);

        #[cfg(feature = "tracing")]
        tracing::info!(high_slice = %slice, "HIGH quantum updated");

        Ok(())
    }

    /// Configuration in effect, including any quantum update.
    pub fn config(&self) -> MlfqConfig {
        MlfqConfig {
            high_slice: self.high_slice(),
            ..self.config.clone()
        }
    }

    /// Counters summed over all units.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.read_all()
    }

    /// Counters of one unit.
    pub fn unit_stats(&self, cpu: CpuId) -> Option<StatsSnapshot> {
        self.stats.unit_snapshot(cpu)
    }

    /// Event stream for observers.
    pub fn events(&self) -> &EventStream {
        &self.events
    }

    /// Level store.
    pub fn levels(&self) -> &LevelStore {
        &self.levels
    }

    /// Run queues.
    pub fn queues(&self) -> &RunQueues {
        &self.queues
    }

    /// Clock used for event timestamps.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Gets current metrics snapshot
    pub fn metrics(&self) -> MlfqMetrics {
        let high = self.queues.queue(QueueId::High);
        let low = self.queues.queue(QueueId::Low);

        MlfqMetrics {
            stats: self.stats.read_all(),
            high_dispatched: high.consumed(),
            low_dispatched: low.consumed(),
            high_depth: high.len(),
            low_depth: low.len(),
            tracked_tasks: self.levels.len(),
            level_evictions: self.levels.evictions(),
            level_dropped_writes: self.levels.dropped_writes(),
            events_emitted: self.events.emitted(),
            events_dropped: self.events.dropped(),
            events_filtered: self.events.filtered(),
        }
    }

    fn emit(&self, task: TaskId, cpu: CpuId, kind: EventKind) {
        self.events.emit(Event {
            ts_ns: self.clock.now_ns(),
            cpu,
            task,
            kind,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::ManualClock;

    fn scheduler() -> MlfqScheduler {
        let config = MlfqConfig::builder().units(2).build().expect("config");
        MlfqScheduler::with_clock(config, Arc::new(ManualClock::new(0))).expect("init")
    }

    const CPU0: CpuId = CpuId(0);

    #[test]
    fn test_enqueue_routes_by_level() {
        let sched = scheduler();
        let task = TaskId(1);

        sched.enable(task);
        assert_eq!(sched.enqueue(task, &EnqueueContext::on(CPU0)), QueueId::High);

        let entry = sched.dispatch(CPU0).expect("dispatch");
        assert_eq!(entry.slice, TimeSlice::from_millis(50));

        assert!(sched.stopping(task, &StopContext::slice_expired(CPU0)));
        assert_eq!(sched.enqueue(task, &EnqueueContext::on(CPU0)), QueueId::Low);

        let entry = sched.dispatch(CPU0).expect("dispatch");
        assert_eq!(entry.queue, QueueId::Low);
        assert!(entry.slice.is_infinite());

        let stats = sched.stats();
        assert_eq!(stats.enq_high(), 1);
        assert_eq!(stats.enq_low(), 1);
        assert_eq!(stats.demotions(), 1);
    }

    #[test]
    fn test_dispatch_counts_attempts() {
        let sched = scheduler();

        assert!(sched.dispatch(CPU0).is_none());
        let stats = sched.stats();
        assert_eq!(stats.dispatch_high_attempts(), 1);
        assert_eq!(stats.dispatch_low_attempts(), 1);

        sched.enqueue(TaskId(1), &EnqueueContext::on(CPU0));
        assert!(sched.dispatch(CPU0).is_some());
        let stats = sched.stats();
        assert_eq!(stats.dispatch_high_attempts(), 2);
        assert_eq!(stats.dispatch_low_attempts(), 1);
    }

    #[test]
    fn test_no_demotion_without_expiry() {
        let sched = scheduler();
        let task = TaskId(3);
        sched.enable(task);

        // Blocked with slice left
        assert!(!sched.stopping(task, &StopContext::blocked(CPU0, TimeSlice::from_millis(10))));
        // Blocked with nothing left
        assert!(!sched.stopping(task, &StopContext::blocked(CPU0, TimeSlice::ZERO)));
        // Preempted with slice left
        let preempted = StopContext {
            cpu: CPU0,
            runnable: true,
            slice_remaining: TimeSlice::from_nanos(1),
        };
        assert!(!sched.stopping(task, &preempted));

        assert_eq!(sched.level_of(task), Level::High);
        assert_eq!(sched.stats().demotions(), 0);
        assert!(sched.events().is_empty());
    }

    #[test]
    fn test_demotion_is_one_way() {
        let sched = scheduler();
        let task = TaskId(4);
        sched.enable(task);

        assert!(sched.stopping(task, &StopContext::slice_expired(CPU0)));
        assert!(!sched.stopping(task, &StopContext::slice_expired(CPU0)));
        assert_eq!(sched.level_of(task), Level::Low);
        assert_eq!(sched.stats().demotions(), 1);
    }

    #[test]
    fn test_disable_emits_done_low_once() {
        let sched = scheduler();
        let task = TaskId(5);
        sched.enable(task);
        sched.stopping(task, &StopContext::slice_expired(CPU0));

        sched.disable(task, CPU0);
        sched.disable(task, CPU0);

        let events = sched.events().drain();
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Demote, EventKind::DoneLow]);
        assert!(!sched.levels().contains(task));
    }

    #[test]
    fn test_disable_withdraws_queued_entry() {
        let sched = scheduler();
        let task = TaskId(6);
        sched.enqueue(task, &EnqueueContext::on(CPU0));
        sched.disable(task, CPU0);

        assert!(sched.dispatch(CPU0).is_none());
    }

    #[test]
    fn test_update_quantum() {
        let sched = scheduler();
        sched.update_quantum(TimeSlice::from_millis(5)).expect("valid");
        assert_eq!(sched.config().high_slice, TimeSlice::from_millis(5));

        sched.enqueue(TaskId(1), &EnqueueContext::on(CPU0));
        let entry = sched.dispatch(CPU0).expect("entry");
        assert_eq!(entry.slice, TimeSlice::from_millis(5));

        assert_eq!(
            sched.update_quantum(TimeSlice::ZERO),
            Err(InitError::InvalidQuantum(TimeSlice::ZERO))
        );
        assert_eq!(sched.high_slice(), TimeSlice::from_millis(5));
    }

    #[test]
    fn test_event_timestamps_follow_clock() {
        let clock = Arc::new(ManualClock::new(1_000));
        let config = MlfqConfig::builder().units(1).build().expect("config");
        let sched = MlfqScheduler::with_clock(config, clock.clone()).expect("init");

        sched.enable(TaskId(9));
        clock.advance(500);
        sched.stopping(TaskId(9), &StopContext::slice_expired(CPU0));

        let events = sched.events().drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].ts_ns, 1_500);
        assert_eq!(events[0].cpu, CPU0);
    }

    #[test]
    fn test_metrics_snapshot() {
        let sched = scheduler();
        for pid in 0..3 {
            sched.enable(TaskId(pid));
            sched.enqueue(TaskId(pid), &EnqueueContext::on(CPU0));
        }
        sched.dispatch(CpuId(1));

        let metrics = sched.metrics();
        assert_eq!(metrics.stats.enq_high(), 3);
        assert_eq!(metrics.high_dispatched, 1);
        assert_eq!(metrics.high_depth, 2);
        assert_eq!(metrics.tracked_tasks, 3);
        assert_eq!(metrics.events_emitted, 0);

        assert_eq!(sched.unit_stats(CpuId(1)).map(|s| s.dispatch_high_attempts()), Some(1));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = MlfqConfig {
            units: 0,
            ..MlfqConfig::default()
        };
        assert_eq!(MlfqScheduler::new(config).err(), Some(InitError::NoExecutionUnits));
    }
}
