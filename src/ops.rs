//! The decision-point callback contract.
//!
//! A scheduling policy implements [`Ops`]. The host drives it through a
//! [`Scheduler`], which opens an [`Invocation`] for every decision point,
//! reports errors returned by the policy as fatal faults, and falls back to
//! the default behavior once the policy has been disabled.
use crate::{
    config::Config,
    cpu::CpuId,
    dispatch::Invocation,
    dsq::{DsqId, QueuedTask},
    error::{BoundsError, ConfigError, QueueError},
    fault::ExitInfo,
    flags::{EnqFlags, WakeFlags},
    host::Host,
    kobj::TaskRef,
    runtime::{Runtime, Setup, Unloaded},
};
use core::fmt;

/// The default time slice, in nanoseconds.
pub const DEFAULT_SLICE_NS: u64 = 20_000_000;

/// A scheduling policy.
///
/// Every method has a default implementation, so the simplest policy is an
/// empty `impl Ops for MyPolicy {}`, which schedules every task in global
/// FIFO order.
///
/// Callbacks run on the CPU named by [`Invocation::cpu`], possibly
/// concurrently with callbacks on every other CPU. They must not block.
pub trait Ops: Send + Sync {
    /// Sets up the policy's queues, in the sleepable setup context.
    fn init(&self, setup: &mut Setup<'_>) -> Result<(), ConfigError> {
        let _ = setup;
        Ok(())
    }

    /// Picks a CPU for a waking task.
    ///
    /// The task may also be dispatched from here, which skips
    /// [`Ops::enqueue`].
    fn select_cpu(
        &self,
        inv: &mut Invocation<'_>,
        task: &TaskRef,
        prev_cpu: CpuId,
        wake_flags: WakeFlags,
    ) -> CpuId {
        inv.select_cpu_default(task, prev_cpu, wake_flags)
    }

    /// Places a runnable task into a dispatch queue.
    fn enqueue(
        &self,
        inv: &mut Invocation<'_>,
        task: &TaskRef,
        flags: EnqFlags,
    ) -> Result<(), QueueError> {
        inv.enqueue_fifo(DsqId::GLOBAL, task, DEFAULT_SLICE_NS, flags)
    }

    /// Refills the invoking CPU's local queue.
    ///
    /// `prev` is the task which was running on the CPU, if it is still
    /// runnable. If the local queue is still empty afterwards, the global
    /// queue is consumed from.
    fn dispatch(&self, inv: &mut Invocation<'_>, prev: Option<&TaskRef>) -> Result<(), QueueError> {
        let _ = (inv, prev);
        Ok(())
    }

    /// Called when `task` starts running.
    fn running(&self, inv: &mut Invocation<'_>, task: &TaskRef) {
        let _ = (inv, task);
    }

    /// Called when `task` stops running.
    fn stopping(&self, inv: &mut Invocation<'_>, task: &TaskRef, runnable: bool) {
        let _ = (inv, task, runnable);
    }

    /// Called once, when the policy is unloaded.
    fn exit(&self, exit: &ExitInfo) {
        let _ = exit;
    }
}

/// Drives an [`Ops`] implementation on behalf of the host.
pub struct Scheduler<O> {
    rt: Runtime,
    ops: O,
}

impl<O: Ops> Scheduler<O> {
    /// Loads a runtime and initializes `ops` in its setup context.
    pub fn load(config: Config, host: impl Host, ops: O) -> Result<Self, ConfigError> {
        let rt = Runtime::load(config, host)?;
        ops.init(&mut rt.setup()?)?;
        Ok(Self { rt, ops })
    }

    /// Returns the runtime.
    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        &self.rt
    }

    /// Returns the policy.
    #[must_use]
    pub fn ops(&self) -> &O {
        &self.ops
    }

    /// Picks a CPU for a waking task, on behalf of `cpu`.
    ///
    /// Once the policy is disabled, this runs the default selection.
    pub fn select_cpu(
        &self,
        cpu: CpuId,
        task: &TaskRef,
        prev_cpu: CpuId,
        wake_flags: WakeFlags,
    ) -> Result<CpuId, BoundsError> {
        let mut inv = self.rt.enter(cpu)?;
        if !self.rt.is_enabled() {
            return Ok(inv.select_cpu_default(task, prev_cpu, wake_flags));
        }

        let selected = self.ops.select_cpu(&mut inv, task, prev_cpu, wake_flags);
        if self.rt.topology().check(selected).is_err() {
            fatal!(self.rt.reporter(), "select_cpu returned invalid CPU {selected}");
            return Ok(prev_cpu);
        }
        Ok(selected)
    }

    /// Hands a runnable task to the policy, on behalf of `cpu`.
    ///
    /// Returns `false` if the policy is disabled, in which case the host must
    /// schedule the task itself.
    pub fn enqueue(&self, cpu: CpuId, task: &TaskRef, flags: EnqFlags) -> Result<bool, BoundsError> {
        let mut inv = self.rt.enter(cpu)?;
        if !self.rt.is_enabled() {
            return Ok(false);
        }
        if let Err(error) = self.ops.enqueue(&mut inv, task, flags) {
            self.report("enqueue", error);
        }
        drop(inv);
        // A task the policy failed to place must not be lost.
        Ok(task.queued_on().is_some() || self.rt.is_enabled())
    }

    /// Returns the next task to run on `cpu`.
    ///
    /// If `cpu`'s local queue is empty, the policy's [`Ops::dispatch`] is
    /// invoked to refill it, and then the global queue is consumed from.
    pub fn dispatch(
        &self,
        cpu: CpuId,
        prev: Option<&TaskRef>,
    ) -> Result<Option<QueuedTask>, BoundsError> {
        let local = DsqId::local_on(cpu);
        if self.rt.dsqs().nr_queued(local, None) != Ok(0) || !self.rt.is_enabled() {
            return self.rt.dsqs().pop_local(cpu);
        }

        let mut inv = self.rt.enter(cpu)?;
        if let Err(error) = self.ops.dispatch(&mut inv, prev) {
            self.report("dispatch", error);
        }
        if inv.nr_queued(DsqId::LOCAL) == Ok(0) {
            inv.consume(DsqId::GLOBAL);
        }
        inv.commit();
        self.rt.dsqs().pop_local(cpu)
    }

    /// Notifies the policy that `task` started running on `cpu`.
    pub fn running(&self, cpu: CpuId, task: &TaskRef) -> Result<(), BoundsError> {
        let mut inv = self.rt.enter(cpu)?;
        task.set_running(cpu, true);
        if self.rt.is_enabled() {
            self.ops.running(&mut inv, task);
        }
        Ok(())
    }

    /// Notifies the policy that `task` stopped running on `cpu`.
    pub fn stopping(&self, cpu: CpuId, task: &TaskRef, runnable: bool) -> Result<(), BoundsError> {
        let mut inv = self.rt.enter(cpu)?;
        task.set_running(cpu, false);
        if self.rt.is_enabled() {
            self.ops.stopping(&mut inv, task, runnable);
        }
        Ok(())
    }

    /// Unloads the policy, returning its exit info and orphaned tasks.
    pub fn unload(self) -> Unloaded {
        let Self { rt, ops } = self;
        let unloaded = rt.unload();
        ops.exit(&unloaded.exit);
        unloaded
    }

    fn report(&self, callback: &str, error: QueueError) {
        if error != QueueError::Disabled {
            fatal!(self.rt.reporter(), "ops.{callback} failed: {error}");
        }
    }
}

impl<O: fmt::Debug> fmt::Debug for Scheduler<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("rt", &self.rt)
            .field("ops", &self.ops)
            .finish()
    }
}
