//! MLFQ-Pulse: two-level feedback queue scheduling engine
//!
//! A CPU scheduling policy in the "one round of round-robin, then FIFO"
//! style. Newly runnable tasks enter a HIGH queue with a bounded quantum; a
//! task that uses its whole quantum while still runnable is demoted to a
//! LOW queue where it runs FIFO with an unbounded slice until it leaves.
//!
//! # Features
//!
//! - **Lock-free hot path**: sharded level store, MPMC run queues, per-unit counters
//! - **Bounded memory**: level entries evicted by approximate recency
//! - **Lossy event stream**: demotions and LOW completions, never blocking producers
//! - **Pluggable hosts**: hook trait driven by a kernel shim or the built-in simulator
//!
//! # Example
//!
//! ```rust
//! use mlfq_pulse::{CpuId, EnqueueContext, Level, MlfqConfig, MlfqScheduler, StopContext, TaskId};
//!
//! let config = MlfqConfig::builder().units(1).build().expect("config");
//! let scheduler = MlfqScheduler::new(config).expect("init");
//! let cpu = CpuId(0);
//! let task = TaskId(1001);
//!
//! scheduler.enable(task);
//! scheduler.enqueue(task, &EnqueueContext::on(cpu));
//! let entry = scheduler.dispatch(cpu).expect("runnable task");
//! assert_eq!(entry.task, task);
//!
//! // Used the whole quantum and still wants the CPU
//! scheduler.stopping(task, &StopContext::slice_expired(cpu));
//! assert_eq!(scheduler.level_of(task), Level::Low);
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![warn(rust_2018_idioms)]

//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
/// Configuration, presets and validation
pub mod config;
/// Scheduling decision engine
pub mod engine;
/// Event stream and wire format
pub mod events;
/// Hook interface for hosts
pub mod hooks;
/// Per-task level storage
pub mod level;
/// Shared run queues
pub mod queue;
/// Periodic text reporting
pub mod report;
/// Deterministic simulation host
pub mod sim;
/// Time slice accounting
pub mod slice;
/// Per-unit counters
pub mod stats;
/// Timestamp sources
pub mod timing;

// Public API exports
pub use config::{ConfigProfile, InitError, MlfqConfig, MlfqConfigBuilder};
pub use engine::{CpuId, EnqueueContext, MlfqMetrics, MlfqScheduler, StopContext, TaskId};
pub use events::{Event, EventDecodeError, EventFilter, EventKind, EventStream, RawEvent};
pub use hooks::{IdleCpuPicker, MLFQ_OPS_NAME, NullOps, OpsFlags, OpsRegistration, OpsTable, PrevCpuPicker, SchedOps};
pub use level::{Level, LevelStore};
pub use queue::{QueueId, QueuedTask, RunQueues};
pub use report::{ReportError, Reporter, ReporterConfig, ReporterThread};
pub use sim::{SimConfig, SimHost, SimReport, SimTaskSpec, TaskOutcome};
pub use slice::{SliceBudget, TimeSlice};
pub use stats::{StatCounters, StatIndex, StatsSnapshot};
pub use timing::{Clock, ClockError, ManualClock, create_clock};
