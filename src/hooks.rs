#![forbid(unsafe_code)]
#![allow(clippy::inline_always)] /* Performance-critical */

/*
 *     ______   __  __     __         ______     ______
 *    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
 *    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
 *     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
 *      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
 *
 * Author: Colin MacRitchie / Ripple Group
 */

/* Scheduler hook interface between a host and a scheduling policy */

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::engine::{CpuId, EnqueueContext, MlfqScheduler, StopContext, TaskId};
use crate::queue::QueuedTask;

/// Name the MLFQ policy registers under.
pub const MLFQ_OPS_NAME: &str = "mlfq";

/// Host service choosing a CPU for a waking task.
pub trait IdleCpuPicker: Send + Sync {
    /// Returns the CPU `task` should wake on.
    fn pick_cpu(&self, task: TaskId, prev_cpu: CpuId, wake_flags: u64) -> CpuId;
}

/// Picker that keeps every task on its previous CPU.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrevCpuPicker;

impl IdleCpuPicker for PrevCpuPicker {
    #[inline(always)]
    fn pick_cpu(&self, _task: TaskId, prev_cpu: CpuId, _wake_flags: u64) -> CpuId {
        prev_cpu
    }
}

/// Scheduling policy callbacks invoked by the host.
pub trait SchedOps: Send + Sync {
    /// Policy name.
    fn name(&self) -> &'static str;

    /// Chooses a CPU for a waking task. Defaults to the host's picker.
    #[inline]
    fn select_cpu(&self, task: TaskId, prev_cpu: CpuId, wake_flags: u64, picker: &dyn IdleCpuPicker) -> CpuId {
        picker.pick_cpu(task, prev_cpu, wake_flags)
    }

    /// Called once when a task joins the policy.
    fn enable(&self, task: TaskId);

    /// Called when a task becomes runnable.
    fn enqueue(&self, task: TaskId, ctx: &EnqueueContext);

    /// Called when `cpu` needs a task to run.
    fn dispatch(&self, cpu: CpuId) -> Option<QueuedTask>;

    /// Called when a task stops running.
    fn stopping(&self, task: TaskId, ctx: &StopContext);

    /// Called once when a task leaves the policy.
    fn disable(&self, task: TaskId, cpu: CpuId);
}

/// Policy that schedules nothing
#[derive(Debug, Default)]
pub struct NullOps;

impl SchedOps for NullOps {
    fn name(&self) -> &'static str {
        "null"
    }

    #[inline(always)]
    fn enable(&self, _task: TaskId) {
        // No-op
    }

    #[inline(always)]
    fn enqueue(&self, _task: TaskId, _ctx: &EnqueueContext) {
        // No-op
    }

    #[inline(always)]
    fn dispatch(&self, _cpu: CpuId) -> Option<QueuedTask> {
        None
    }

    #[inline(always)]
    fn stopping(&self, _task: TaskId, _ctx: &StopContext) {
        // No-op
    }

    #[inline(always)]
    fn disable(&self, _task: TaskId, _cpu: CpuId) {
        // No-op
    }
}

/// Registration flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpsFlags {
    /// Only tasks that opted in are handed to the policy
    pub switch_partial: bool,
}

/// Immutable record binding a policy to its name and flags.
pub struct OpsRegistration {
    name: &'static str,
    flags: OpsFlags,
    ops: Arc<dyn SchedOps>,
}

impl OpsRegistration {
    /// Registers `ops` under its own name with default flags.
    pub fn new(ops: Arc<dyn SchedOps>) -> Self {
        Self {
            name: ops.name(),
            flags: OpsFlags::default(),
            ops,
        }
    }

    /// Replaces the flags.
    #[must_use]
    pub fn with_flags(mut self, flags: OpsFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Registered name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Registered flags.
    pub fn flags(&self) -> OpsFlags {
        self.flags
    }

    /// Policy callbacks.
    pub fn ops(&self) -> &Arc<dyn SchedOps> {
        &self.ops
    }
}

impl fmt::Debug for OpsRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpsRegistration")
            .field("name", &self.name)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

/// Attach point the host calls through. Hooks are no-ops while detached.
pub struct OpsTable {
    attached: Arc<RwLock<Option<Arc<OpsRegistration>>>>,
}

impl OpsTable {
    /// Create empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            attached: Arc::new(RwLock::new(None)),
        }
    }

    /// Attach policy, returning the one it replaced.
    pub fn attach(&self, registration: OpsRegistration) -> Option<Arc<OpsRegistration>> {
        #[cfg(feature = "tracing")]
        tracing::info!(ops = registration.name(), flags = ?registration.flags(), "Scheduler ops attached");

        self.attached.write().replace(Arc::new(registration))
    }

    /// Detach policy.
    pub fn detach(&self) -> Option<Arc<OpsRegistration>> {
        let previous = self.attached.write().take();

        #[cfg(feature = "tracing")]
        if let Some(registration) = previous.as_ref() {
            tracing::info!(ops = registration.name(), "Scheduler ops detached");
        }

        previous
    }

    /// Check if a policy is attached.
    #[inline]
    pub fn is_attached(&self) -> bool {
        self.attached.read().is_some()
    }

    /// Name of the attached policy.
    pub fn attached_name(&self) -> Option<&'static str> {
        self.attached.read().as_ref().map(|registration| registration.name())
    }

    /// Wake-up CPU choice, host picker when detached.
    #[inline(always)]
    pub fn select_cpu(&self, task: TaskId, prev_cpu: CpuId, wake_flags: u64, picker: &dyn IdleCpuPicker) -> CpuId {
        match self.attached.read().as_ref() {
            Some(registration) => registration.ops.select_cpu(task, prev_cpu, wake_flags, picker),
            None => picker.pick_cpu(task, prev_cpu, wake_flags),
        }
    }

    /// Enable hook.
    #[inline(always)]
    pub fn enable(&self, task: TaskId) {
        if let Some(registration) = self.attached.read().as_ref() {
            registration.ops.enable(task);
        }
    }

    /// Enqueue hook.
    #[inline(always)]
    pub fn enqueue(&self, task: TaskId, ctx: &EnqueueContext) {
        if let Some(registration) = self.attached.read().as_ref() {
            registration.ops.enqueue(task, ctx);
        }
    }

    /// Dispatch hook.
    #[inline(always)]
    pub fn dispatch(&self, cpu: CpuId) -> Option<QueuedTask> {
        self.attached.read().as_ref().and_then(|registration| registration.ops.dispatch(cpu))
    }

    /// Stopping hook.
    #[inline(always)]
    pub fn stopping(&self, task: TaskId, ctx: &StopContext) {
        if let Some(registration) = self.attached.read().as_ref() {
            registration.ops.stopping(task, ctx);
        }
    }

    /// Disable hook.
    #[inline(always)]
    pub fn disable(&self, task: TaskId, cpu: CpuId) {
        if let Some(registration) = self.attached.read().as_ref() {
            registration.ops.disable(task, cpu);
        }
    }
}

impl Default for OpsTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OpsTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpsTable").field("attached", &self.attached_name()).finish()
    }
}

/// Adapter to use `MlfqScheduler` as `SchedOps`
impl SchedOps for MlfqScheduler {
    fn name(&self) -> &'static str {
        MLFQ_OPS_NAME
    }

    #[inline]
    fn enable(&self, task: TaskId) {
        self.enable(task);
    }

    #[inline]
    fn enqueue(&self, task: TaskId, ctx: &EnqueueContext) {
        self.enqueue(task, ctx);
    }

    #[inline]
    fn dispatch(&self, cpu: CpuId) -> Option<QueuedTask> {
        self.dispatch(cpu)
    }

    #[inline]
    fn stopping(&self, task: TaskId, ctx: &StopContext) {
        self.stopping(task, ctx);
    }

    #[inline]
    fn disable(&self, task: TaskId, cpu: CpuId) {
        self.disable(task, cpu);
    }
}

impl MlfqScheduler {
    /// Wraps the engine in a registration record.
    pub fn into_registration(self: Arc<Self>) -> OpsRegistration {
        OpsRegistration::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MlfqConfig;
    use crate::slice::TimeSlice;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Test implementation that counts hook calls
    #[derive(Default)]
    struct CountingOps {
        enable_count: AtomicU64,
        enqueue_count: AtomicU64,
        dispatch_count: AtomicU64,
        stopping_count: AtomicU64,
        disable_count: AtomicU64,
    }

    impl SchedOps for CountingOps {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn enable(&self, _task: TaskId) {
            self.enable_count.fetch_add(1, Ordering::Relaxed);
        }

        fn enqueue(&self, _task: TaskId, _ctx: &EnqueueContext) {
            self.enqueue_count.fetch_add(1, Ordering::Relaxed);
        }

        fn dispatch(&self, _cpu: CpuId) -> Option<QueuedTask> {
            self.dispatch_count.fetch_add(1, Ordering::Relaxed);
            None
        }

        fn stopping(&self, _task: TaskId, _ctx: &StopContext) {
            self.stopping_count.fetch_add(1, Ordering::Relaxed);
        }

        fn disable(&self, _task: TaskId, _cpu: CpuId) {
            self.disable_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    struct FixedPicker(CpuId);

    impl IdleCpuPicker for FixedPicker {
        fn pick_cpu(&self, _task: TaskId, _prev_cpu: CpuId, _wake_flags: u64) -> CpuId {
            self.0
        }
    }

    fn drive(table: &OpsTable) {
        let task = TaskId(1);
        table.enable(task);
        table.enqueue(task, &EnqueueContext::on(CpuId(0)));
        let _ = table.dispatch(CpuId(0));
        table.stopping(task, &StopContext::blocked(CpuId(0), TimeSlice::ZERO));
        table.disable(task, CpuId(0));
    }

    #[test]
    fn test_null_ops() {
        let ops = NullOps;
        assert_eq!(ops.name(), "null");
        ops.enable(TaskId(1));
        ops.enqueue(TaskId(1), &EnqueueContext::default());
        assert!(ops.dispatch(CpuId(0)).is_none());
        assert_eq!(ops.select_cpu(TaskId(1), CpuId(2), 0, &PrevCpuPicker), CpuId(2));
    }

    #[test]
    fn test_table_without_ops() {
        let table = OpsTable::new();
        assert!(!table.is_attached());
        assert_eq!(table.attached_name(), None);

        // Should not panic when nothing is attached
        drive(&table);
        assert!(table.dispatch(CpuId(0)).is_none());
        assert_eq!(table.select_cpu(TaskId(1), CpuId(0), 0, &FixedPicker(CpuId(3))), CpuId(3));
    }

    #[test]
    fn test_table_forwards_calls() {
        let table = OpsTable::new();
        let ops = Arc::new(CountingOps::default());

        let old = table.attach(OpsRegistration::new(ops.clone()));
        assert!(old.is_none());
        assert_eq!(table.attached_name(), Some("counting"));

        drive(&table);

        assert_eq!(ops.enable_count.load(Ordering::Relaxed), 1);
        assert_eq!(ops.enqueue_count.load(Ordering::Relaxed), 1);
        assert_eq!(ops.dispatch_count.load(Ordering::Relaxed), 1);
        assert_eq!(ops.stopping_count.load(Ordering::Relaxed), 1);
        assert_eq!(ops.disable_count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_table_replace_and_detach() {
        let table = OpsTable::new();
        let first = Arc::new(CountingOps::default());
        let second = Arc::new(CountingOps::default());

        table.attach(OpsRegistration::new(first.clone() as Arc<dyn SchedOps>));
        let old = table.attach(OpsRegistration::new(second.clone() as Arc<dyn SchedOps>));
        assert!(old.is_some());

        table.enable(TaskId(1));
        assert_eq!(first.enable_count.load(Ordering::Relaxed), 0);
        assert_eq!(second.enable_count.load(Ordering::Relaxed), 1);

        assert!(table.detach().is_some());
        assert!(table.detach().is_none());
        assert!(!table.is_attached());
    }

    #[test]
    fn test_registration_flags() {
        let registration =
            OpsRegistration::new(Arc::new(NullOps)).with_flags(OpsFlags { switch_partial: true });
        assert_eq!(registration.name(), "null");
        assert!(registration.flags().switch_partial);
    }

    #[test]
    fn test_mlfq_through_table() {
        let config = MlfqConfig::builder().units(1).build().expect("config");
        let scheduler = Arc::new(MlfqScheduler::new(config).expect("init"));
        let table = OpsTable::new();
        table.attach(Arc::clone(&scheduler).into_registration());
        assert_eq!(table.attached_name(), Some(MLFQ_OPS_NAME));

        let task = TaskId(10);
        table.enable(task);
        table.enqueue(task, &EnqueueContext::on(CpuId(0)));
        let entry = table.dispatch(CpuId(0)).expect("entry");
        assert_eq!(entry.task, task);

        table.stopping(task, &StopContext::slice_expired(CpuId(0)));
        assert_eq!(scheduler.stats().demotions(), 1);

        table.disable(task, CpuId(0));
        assert_eq!(scheduler.events().drain().len(), 2);
    }
}
