//! Deterministic virtual-time host
//!
//! [`SimHost`] plays the part of the kernel for any [`SchedOps`] policy. It
//! advances a virtual clock in fixed ticks over a set of execution units and
//! walks every task through the same hook sequence a real host would:
//!
//! - wake: `select_cpu`, `enable` on first wake, `enqueue`
//! - idle unit: `dispatch`
//! - slice expiry: `stopping(runnable)` then `enqueue`
//! - sleep: `stopping(!runnable)`, later woken again
//! - exit: `stopping(!runnable)` then `disable`
//!
//! Running tasks are never preempted except by slice expiry, so a task
//! holding an infinite slice keeps its unit until it sleeps or exits.

#![forbid(unsafe_code)]

//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::engine::{CpuId, EnqueueContext, StopContext, TaskId};
use crate::hooks::{IdleCpuPicker, SchedOps};
use crate::queue::QueueId;
use crate::slice::{NS_PER_MS, SliceBudget, TimeSlice};
use crate::timing::ManualClock;

/// Workload description of one simulated task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimTaskSpec {
    /// Task identifier
    pub task: TaskId,
    /// First wake-up time
    pub arrival_ns: u64,
    /// Total CPU time needed
    pub runtime_ns: u64,
    /// CPU time per burst before sleeping, `None` for CPU-bound
    pub burst_ns: Option<u64>,
    /// Sleep between bursts
    pub sleep_ns: u64,
}

impl SimTaskSpec {
    /// Task that runs until done.
    #[must_use]
    pub const fn cpu_bound(task: TaskId, arrival_ns: u64, runtime_ns: u64) -> Self {
        Self {
            task,
            arrival_ns,
            runtime_ns,
            burst_ns: None,
            sleep_ns: 0,
        }
    }

    /// Task alternating `burst_ns` of work with `sleep_ns` of sleep.
    #[must_use]
    pub const fn interactive(task: TaskId, arrival_ns: u64, runtime_ns: u64, burst_ns: u64, sleep_ns: u64) -> Self {
        Self {
            task,
            arrival_ns,
            runtime_ns,
            burst_ns: Some(burst_ns),
            sleep_ns,
        }
    }
}

/// Simulation parameters
#[derive(Debug, Clone, Copy)]
pub struct SimConfig {
    /// Execution units
    pub units: usize,
    /// Virtual time per step
    pub tick_ns: u64,
    /// Time limit
    pub max_time_ns: u64,
    /// Flags passed to `select_cpu`
    pub wake_flags: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            units: 1,
            tick_ns: NS_PER_MS,
            max_time_ns: 60_000 * NS_PER_MS,
            wake_flags: 0,
        }
    }
}

/// Per-task result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskOutcome {
    /// Task identifier
    pub task: TaskId,
    /// First wake-up time
    pub arrival_ns: u64,
    /// First time on a unit
    pub first_run_ns: Option<u64>,
    /// Exit time
    pub completion_ns: Option<u64>,
    /// Times the task was dispatched
    pub dispatches: u32,
}

impl TaskOutcome {
    /// Arrival to exit.
    pub fn turnaround_ns(&self) -> Option<u64> {
        self.completion_ns.map(|done| done.saturating_sub(self.arrival_ns))
    }

    /// Arrival to first run.
    pub fn response_ns(&self) -> Option<u64> {
        self.first_run_ns.map(|first| first.saturating_sub(self.arrival_ns))
    }
}

/// One dispatch decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchRecord {
    /// Virtual time
    pub at_ns: u64,
    /// Unit that dispatched
    pub cpu: CpuId,
    /// Task dispatched
    pub task: TaskId,
    /// Queue it came from
    pub queue: QueueId,
}

/// Result of a simulation run.
#[derive(Debug, Clone, Default)]
pub struct SimReport {
    /// Outcomes in workload order
    pub outcomes: Vec<TaskOutcome>,
    /// Dispatches in order
    pub dispatch_log: Vec<DispatchRecord>,
    /// Virtual time at the end
    pub finished_at_ns: u64,
    /// Whether the time limit cut the run short
    pub timed_out: bool,
}

impl SimReport {
    /// Outcome of `task`.
    pub fn outcome(&self, task: TaskId) -> Option<&TaskOutcome> {
        self.outcomes.iter().find(|outcome| outcome.task == task)
    }

    /// Finished tasks ordered by exit time.
    pub fn completion_order(&self) -> Vec<TaskId> {
        let mut done: Vec<&TaskOutcome> = self.outcomes.iter().filter(|o| o.completion_ns.is_some()).collect();
        done.sort_by_key(|o| (o.completion_ns, o.task));
        done.into_iter().map(|o| o.task).collect()
    }

    /// Mean turnaround of finished tasks.
    pub fn mean_turnaround_ns(&self) -> Option<u64> {
        let turnarounds: Vec<u64> = self.outcomes.iter().filter_map(TaskOutcome::turnaround_ns).collect();
        if turnarounds.is_empty() {
            return None;
        }
        Some(turnarounds.iter().sum::<u64>() / turnarounds.len() as u64)
    }
}

impl fmt::Display for SimReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for outcome in &self.outcomes {
            match outcome.turnaround_ns() {
                Some(turnaround) => writeln!(
                    f,
                    "pid={} turnaround={:.3}ms dispatches={}",
                    outcome.task,
                    turnaround as f64 / NS_PER_MS as f64,
                    outcome.dispatches
                )?,
                None => writeln!(f, "pid={} unfinished dispatches={}", outcome.task, outcome.dispatches)?,
            }
        }
        write!(f, "finished_at={:.3}ms", self.finished_at_ns as f64 / NS_PER_MS as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Queued,
    Running,
    Sleeping { wake_at_ns: u64 },
    Exited,
}

#[derive(Debug)]
struct SimTask {
    spec: SimTaskSpec,
    phase: Phase,
    remaining_ns: u64,
    burst_left_ns: Option<u64>,
    slice: SliceBudget,
    prev_cpu: CpuId,
    enabled: bool,
    outcome: TaskOutcome,
}

impl SimTask {
    fn new(spec: &SimTaskSpec) -> Self {
        Self {
            spec: *spec,
            phase: Phase::Pending,
            remaining_ns: spec.runtime_ns,
            burst_left_ns: spec.burst_ns,
            slice: SliceBudget::new(TimeSlice::ZERO),
            prev_cpu: CpuId(0),
            enabled: false,
            outcome: TaskOutcome {
                task: spec.task,
                arrival_ns: spec.arrival_ns,
                first_run_ns: None,
                completion_ns: None,
                dispatches: 0,
            },
        }
    }

    fn wake_due(&self, now_ns: u64) -> bool {
        match self.phase {
            Phase::Pending => self.spec.arrival_ns <= now_ns,
            Phase::Sleeping { wake_at_ns } => wake_at_ns <= now_ns,
            _ => false,
        }
    }
}

// Idle units at the moment of a wake-up
struct IdleSnapshot {
    idle: Vec<bool>,
}

impl IdleCpuPicker for IdleSnapshot {
    fn pick_cpu(&self, _task: TaskId, prev_cpu: CpuId, _wake_flags: u64) -> CpuId {
        if self.idle.get(prev_cpu.index()).copied().unwrap_or(false) {
            return prev_cpu;
        }
        self.idle
            .iter()
            .position(|idle| *idle)
            .map_or(prev_cpu, |unit| CpuId(unit as u32))
    }
}

/// Virtual-time host driving a scheduling policy.
pub struct SimHost {
    config: SimConfig,
    ops: Arc<dyn SchedOps>,
    clock: Option<Arc<ManualClock>>,
}

impl fmt::Debug for SimHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimHost")
            .field("config", &self.config)
            .field("ops", &self.ops.name())
            .finish_non_exhaustive()
    }
}

impl SimHost {
    /// Creates a host for `ops`.
    pub fn new(config: SimConfig, ops: Arc<dyn SchedOps>) -> Self {
        Self {
            config,
            ops,
            clock: None,
        }
    }

    /// Keeps `clock` in step with virtual time.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<ManualClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Runs `specs` to completion or until the time limit.
    ///
    /// Task ids must be unique. A spec reusing an earlier spec's id is
    /// skipped and gets no outcome.
    pub fn run(&self, specs: &[SimTaskSpec]) -> SimReport {
        let units = self.config.units.max(1);
        let tick_ns = self.config.tick_ns.max(1);

        let mut seen = HashSet::with_capacity(specs.len());
        let mut tasks: Vec<SimTask> = Vec::with_capacity(specs.len());
        for spec in specs {
            if seen.insert(spec.task) {
                tasks.push(SimTask::new(spec));
                continue;
            }

            #[cfg(feature = "tracing")]
            tracing::warn!(task_id = ?spec.task, "Duplicate task id in workload, spec skipped");
        }
        let index: HashMap<TaskId, usize> = tasks.iter().enumerate().map(|(i, t)| (t.spec.task, i)).collect();
        let mut running: Vec<Option<usize>> = vec![None; units];
        let mut dispatch_log = Vec::new();
        let mut now_ns = 0u64;
        let mut timed_out = false;

        #[cfg(feature = "tracing")]
        tracing::debug!(ops = self.ops.name(), units, tasks = tasks.len(), "Simulation started");

        loop {
            if tasks.iter().all(|task| task.phase == Phase::Exited) {
                break;
            }
            if now_ns >= self.config.max_time_ns {
                timed_out = true;
                break;
            }
            if let Some(clock) = &self.clock {
                clock.set(now_ns);
            }

            self.wake_tasks(&mut tasks, &running, now_ns);

            for unit in 0..units {
                if running[unit].is_none() {
                    running[unit] = self.dispatch_on(unit, &mut tasks, &index, now_ns, &mut dispatch_log);
                }
            }

            for unit in 0..units {
                let Some(idx) = running[unit] else {
                    continue;
                };
                if !self.execute_tick(&mut tasks[idx], CpuId(unit as u32), now_ns, tick_ns) {
                    running[unit] = None;
                }
            }

            now_ns = now_ns.saturating_add(tick_ns);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(finished_at_ns = now_ns, timed_out, "Simulation finished");

        SimReport {
            outcomes: tasks.into_iter().map(|task| task.outcome).collect(),
            dispatch_log,
            finished_at_ns: now_ns,
            timed_out,
        }
    }

    fn wake_tasks(&self, tasks: &mut [SimTask], running: &[Option<usize>], now_ns: u64) {
        let picker = IdleSnapshot {
            idle: running.iter().map(Option::is_none).collect(),
        };

        for task in tasks.iter_mut().filter(|task| task.wake_due(now_ns)) {
            let id = task.spec.task;
            let cpu = self.ops.select_cpu(id, task.prev_cpu, self.config.wake_flags, &picker);

            if !task.enabled {
                self.ops.enable(id);
                task.enabled = true;
            }
            self.ops.enqueue(id, &EnqueueContext::on(cpu));
            task.prev_cpu = cpu;
            task.phase = Phase::Queued;
        }
    }

    fn dispatch_on(
        &self,
        unit: usize,
        tasks: &mut [SimTask],
        index: &HashMap<TaskId, usize>,
        now_ns: u64,
        log: &mut Vec<DispatchRecord>,
    ) -> Option<usize> {
        let cpu = CpuId(unit as u32);
        let entry = self.ops.dispatch(cpu)?;
        let idx = *index.get(&entry.task)?;
        let task = &mut tasks[idx];

        // Ignore entries for tasks that are not waiting to run
        if task.phase != Phase::Queued {
            return None;
        }

        task.phase = Phase::Running;
        task.prev_cpu = cpu;
        task.slice.reset(entry.slice);
        task.outcome.first_run_ns.get_or_insert(now_ns);
        task.outcome.dispatches += 1;

        log.push(DispatchRecord {
            at_ns: now_ns,
            cpu,
            task: entry.task,
            queue: entry.queue,
        });

        Some(idx)
    }

    // Returns whether the task keeps the unit
    fn execute_tick(&self, task: &mut SimTask, cpu: CpuId, now_ns: u64, tick_ns: u64) -> bool {
        let id = task.spec.task;
        let mut ran = tick_ns.min(task.remaining_ns);
        if let Some(left) = task.burst_left_ns {
            ran = ran.min(left);
        }

        let expired = task.slice.consume(ran);
        task.remaining_ns -= ran;
        if let Some(left) = task.burst_left_ns.as_mut() {
            *left -= ran;
        }
        let stop_ns = now_ns.saturating_add(ran);

        if task.remaining_ns == 0 {
            self.ops.stopping(id, &StopContext::blocked(cpu, task.slice.remaining()));
            self.ops.disable(id, cpu);
            task.phase = Phase::Exited;
            task.outcome.completion_ns = Some(stop_ns);
            return false;
        }

        if task.burst_left_ns == Some(0) {
            self.ops.stopping(id, &StopContext::blocked(cpu, task.slice.remaining()));
            task.burst_left_ns = task.spec.burst_ns;
            task.phase = Phase::Sleeping {
                wake_at_ns: stop_ns.saturating_add(task.spec.sleep_ns),
            };
            return false;
        }

        if expired {
            self.ops.stopping(id, &StopContext::slice_expired(cpu));
            self.ops.enqueue(id, &EnqueueContext::on(cpu));
            task.phase = Phase::Queued;
            return false;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MlfqConfig;
    use crate::engine::MlfqScheduler;
    use crate::hooks::NullOps;

    const MS: u64 = NS_PER_MS;

    fn mlfq(units: usize) -> Arc<MlfqScheduler> {
        let config = MlfqConfig::builder().units(units).build().expect("config");
        Arc::new(MlfqScheduler::new(config).expect("init"))
    }

    #[test]
    fn test_single_task_runs_to_completion() {
        let sched = mlfq(1);
        let host = SimHost::new(SimConfig::default(), sched.clone());
        let report = host.run(&[SimTaskSpec::cpu_bound(TaskId(1), 0, 30 * MS)]);

        assert!(!report.timed_out);
        let outcome = report.outcome(TaskId(1)).expect("outcome");
        assert_eq!(outcome.completion_ns, Some(30 * MS));
        assert_eq!(outcome.dispatches, 1);
        assert_eq!(sched.stats().demotions(), 0);
    }

    #[test]
    fn test_slice_expiry_requeues_low() {
        let sched = mlfq(1);
        let host = SimHost::new(SimConfig::default(), sched.clone());
        let report = host.run(&[SimTaskSpec::cpu_bound(TaskId(1), 0, 120 * MS)]);

        let queues: Vec<QueueId> = report.dispatch_log.iter().map(|d| d.queue).collect();
        assert_eq!(queues, vec![QueueId::High, QueueId::Low]);
        assert_eq!(report.outcome(TaskId(1)).and_then(|o| o.completion_ns), Some(120 * MS));
        assert_eq!(sched.stats().demotions(), 1);
    }

    #[test]
    fn test_sleeping_task_wakes_again() {
        let sched = mlfq(1);
        let host = SimHost::new(SimConfig::default(), sched.clone());
        let report = host.run(&[SimTaskSpec::interactive(TaskId(1), 0, 9 * MS, 3 * MS, 5 * MS)]);

        let outcome = report.outcome(TaskId(1)).expect("outcome");
        assert_eq!(outcome.dispatches, 3);
        // 3 bursts of 3ms with two 5ms sleeps
        assert_eq!(outcome.completion_ns, Some(19 * MS));
        assert_eq!(sched.stats().enq_high(), 3);
    }

    #[test]
    fn test_null_ops_times_out() {
        let config = SimConfig {
            max_time_ns: 10 * MS,
            ..SimConfig::default()
        };
        let host = SimHost::new(config, Arc::new(NullOps));
        let report = host.run(&[SimTaskSpec::cpu_bound(TaskId(1), 0, MS)]);

        assert!(report.timed_out);
        assert!(report.completion_order().is_empty());
        assert_eq!(report.finished_at_ns, 10 * MS);
    }

    #[test]
    fn test_idle_snapshot_prefers_prev_cpu() {
        let picker = IdleSnapshot {
            idle: vec![false, true, true],
        };
        assert_eq!(picker.pick_cpu(TaskId(1), CpuId(2), 0), CpuId(2));
        assert_eq!(picker.pick_cpu(TaskId(1), CpuId(0), 0), CpuId(1));

        let busy = IdleSnapshot { idle: vec![false] };
        assert_eq!(busy.pick_cpu(TaskId(1), CpuId(0), 0), CpuId(0));
    }

    #[test]
    fn test_report_display() {
        let report = SimReport {
            outcomes: vec![TaskOutcome {
                task: TaskId(4),
                arrival_ns: 0,
                first_run_ns: Some(0),
                completion_ns: Some(2 * MS),
                dispatches: 1,
            }],
            finished_at_ns: 2 * MS,
            ..SimReport::default()
        };
        assert_eq!(report.to_string(), "pid=4 turnaround=2.000ms dispatches=1\nfinished_at=2.000ms");
        assert_eq!(report.mean_turnaround_ns(), Some(2 * MS));
    }

    #[test]
    fn test_duplicate_task_ids_skipped() {
        let host = SimHost::new(SimConfig::default(), mlfq(1));
        let report = host.run(&[
            SimTaskSpec::cpu_bound(TaskId(1), 0, 30 * MS),
            SimTaskSpec::cpu_bound(TaskId(1), 5 * MS, 5 * MS),
            SimTaskSpec::cpu_bound(TaskId(2), 0, 10 * MS),
        ]);

        assert!(!report.timed_out);
        assert_eq!(report.outcomes.len(), 2);

        let first = report.outcome(TaskId(1)).expect("outcome");
        assert_eq!(first.arrival_ns, 0);
        assert_eq!(first.completion_ns, Some(30 * MS));
        assert_eq!(first.dispatches, 1);
        assert_eq!(report.outcome(TaskId(2)).and_then(|o| o.completion_ns), Some(40 * MS));
    }
}
