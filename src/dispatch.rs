//! The per-invocation context passed to policy callbacks.
//!
//! Every time the host invokes the policy at a decision point, it does so on
//! behalf of one CPU, through an [`Invocation`]. The invocation carries:
//!
//! - a bounded buffer of *speculative* dispatches, which only become visible
//!   to other CPUs when the invocation commits, and which may be rescinded
//!   with [`Invocation::cancel_pending`] until then;
//! - the CPU kicks requested during the invocation, which are delivered after
//!   its dispatches are visible.
//!
//! An invocation commits when it is dropped (or explicitly, with
//! [`Invocation::commit`]), on every exit path. [`Invocation::abort`] instead
//! releases the pending dispatches without placing them.
use crate::{
    context::AtomicGuard,
    cpu::CpuId,
    cpumask::Cpumask,
    dsq::{DsqId, Order},
    error::{KickError, QueueError},
    flags::{EnqFlags, KickFlags, WakeFlags},
    idle::IdleSnapshot,
    kobj::{Task, TaskRef},
    rcu::ReadSection,
    runtime::Runtime,
};
use core::fmt;

/// The context of a single decision-point invocation on one CPU.
#[must_use = "an `Invocation` commits its dispatches when dropped"]
pub struct Invocation<'rt> {
    rt: &'rt Runtime,
    cpu: CpuId,
    pending: Vec<Pending>,
    kicks: Vec<(CpuId, KickFlags)>,
    _guard: AtomicGuard,
}

struct Pending {
    id: DsqId,
    task: TaskRef,
    slice: u64,
    order: Order,
    flags: EnqFlags,
}

impl<'rt> Invocation<'rt> {
    pub(crate) fn new(rt: &'rt Runtime, cpu: CpuId) -> Self {
        Self {
            rt,
            cpu,
            pending: Vec::with_capacity(rt.config().dispatch_batch()),
            kicks: Vec::new(),
            _guard: AtomicGuard::enter_cpu(cpu),
        }
    }

    /// Returns the CPU this invocation runs on behalf of.
    #[must_use]
    #[inline]
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// Returns the runtime this invocation belongs to.
    #[must_use]
    #[inline]
    pub fn runtime(&self) -> &'rt Runtime {
        self.rt
    }

    // --- dispatching ---

    /// Speculatively dispatches `task` to the end of queue `id`.
    ///
    /// The dispatch takes effect when the invocation commits. The target is
    /// checked now, so an unknown queue fails immediately.
    ///
    /// Exceeding the invocation's [dispatch slots] is a fatal fault.
    ///
    /// [dispatch slots]: Invocation::nr_dispatch_slots
    pub fn dispatch(
        &mut self,
        id: DsqId,
        task: &TaskRef,
        slice: u64,
        flags: EnqFlags,
    ) -> Result<(), QueueError> {
        self.push_pending(id, task, slice, Order::Fifo, flags)
    }

    /// Speculatively dispatches `task` to a virtual-time ordered queue.
    ///
    /// See [`Invocation::dispatch`].
    pub fn dispatch_vtime(
        &mut self,
        id: DsqId,
        task: &TaskRef,
        slice: u64,
        vtime: u64,
        flags: EnqFlags,
    ) -> Result<(), QueueError> {
        self.push_pending(id, task, slice, Order::Vtime(vtime), flags)
    }

    /// Returns the number of speculative dispatches this invocation may still
    /// make.
    #[must_use]
    pub fn nr_dispatch_slots(&self) -> usize {
        self.rt.config().dispatch_batch() - self.pending.len()
    }

    /// Rescinds the most recent pending dispatch, releasing its reference to
    /// the task.
    ///
    /// Returns `false` if there was nothing to cancel. Committed dispatches,
    /// and those of other invocations, are never affected.
    pub fn cancel_pending(&mut self) -> bool {
        match self.pending.pop() {
            Some(pending) => {
                tracing::debug!(
                    cpu = self.cpu,
                    pid = pending.task.pid(),
                    dsq = %pending.id,
                    "cancelled pending dispatch"
                );
                true
            }
            None => false,
        }
    }

    /// Links `task` into the end of queue `id` immediately.
    pub fn enqueue_fifo(
        &mut self,
        id: DsqId,
        task: &TaskRef,
        slice: u64,
        flags: EnqFlags,
    ) -> Result<(), QueueError> {
        self.rt
            .dsqs()
            .enqueue(id, Some(self.cpu), task, slice, Order::Fifo, flags)
    }

    /// Links `task` into a virtual-time ordered queue immediately.
    ///
    /// Tasks with equal `vtime` keys are kept in the order they were
    /// enqueued.
    pub fn enqueue_vtime(
        &mut self,
        id: DsqId,
        task: &TaskRef,
        slice: u64,
        vtime: u64,
        flags: EnqFlags,
    ) -> Result<(), QueueError> {
        self.rt
            .dsqs()
            .enqueue(id, Some(self.cpu), task, slice, Order::Vtime(vtime), flags)
    }

    /// Moves the first task of queue `id` into this CPU's local queue.
    ///
    /// Pending dispatches are flushed first. Returns `false` if the queue was
    /// empty or could not be consumed from.
    pub fn consume(&mut self, id: DsqId) -> bool {
        self.flush_dispatches();
        self.rt.dsqs().consume(id, self.cpu)
    }

    /// Returns the number of tasks in queue `id`.
    ///
    /// [`DsqId::LOCAL`] refers to this invocation's CPU.
    pub fn nr_queued(&self, id: DsqId) -> Result<u32, QueueError> {
        self.rt.dsqs().nr_queued(id, Some(self.cpu))
    }

    // --- kicks ---

    /// Asks the host to re-invoke the scheduling decision point on `cpu`,
    /// once this invocation's dispatches are visible.
    pub fn kick_cpu(&mut self, cpu: CpuId, flags: KickFlags) -> Result<(), KickError> {
        if !self.rt.is_enabled() {
            return Err(KickError::Disabled);
        }
        self.rt.topology().check(cpu)?;
        self.kicks.push((cpu, flags));
        Ok(())
    }

    // --- idle CPUs ---

    /// Returns a snapshot of the idle mask.
    #[must_use]
    pub fn snapshot_idle(&self) -> IdleSnapshot<'_> {
        self.rt.idle().snapshot_idle()
    }

    /// Returns a snapshot of the SMT idle mask.
    #[must_use]
    pub fn snapshot_idle_smt(&self) -> IdleSnapshot<'_> {
        self.rt.idle().snapshot_idle_smt()
    }

    /// Atomically claims `cpu` if it is idle.
    pub fn try_claim_idle(&self, cpu: CpuId) -> bool {
        self.rt.idle().try_claim_idle(cpu)
    }

    /// Picks and claims an idle CPU in `allowed`.
    pub fn pick_idle_cpu(&self, allowed: &Cpumask, prefer_smt: bool) -> Option<CpuId> {
        self.rt.idle().pick_idle_cpu(allowed, prefer_smt)
    }

    /// Picks a CPU in `allowed`, preferring an idle one.
    pub fn pick_any_cpu(&self, allowed: &Cpumask) -> Option<CpuId> {
        self.rt.idle().pick_any_cpu(allowed)
    }

    /// Runs the default CPU selection for a waking task.
    ///
    /// See [`Runtime::select_cpu_default_idle`].
    pub fn select_cpu_default(&self, task: &Task, prev_cpu: CpuId, wake_flags: WakeFlags) -> CpuId {
        self.select_cpu_default_idle(task, prev_cpu, wake_flags).0
    }

    /// Runs the default CPU selection for a waking task, also returning
    /// whether the selected CPU was claimed idle.
    pub fn select_cpu_default_idle(
        &self,
        task: &Task,
        prev_cpu: CpuId,
        wake_flags: WakeFlags,
    ) -> (CpuId, bool) {
        self.rt
            .select_cpu_default_idle(Some(self.cpu), task, prev_cpu, wake_flags)
    }

    // --- objects ---

    /// Begins a read-side section.
    pub fn read_section(&self) -> ReadSection<'rt> {
        self.rt.read_section()
    }

    // --- completion ---

    /// Commits the invocation: flushes pending dispatches, then delivers
    /// kicks.
    ///
    /// This is equivalent to dropping the invocation.
    pub fn commit(self) {
        drop(self);
    }

    /// Ends the invocation without placing its pending dispatches.
    ///
    /// Dispatches which were already flushed (by [`Invocation::consume`]) and
    /// immediate enqueues are unaffected. Pending kicks are dropped.
    pub fn abort(mut self) {
        tracing::debug!(
            cpu = self.cpu,
            pending = self.pending.len(),
            kicks = self.kicks.len(),
            "aborting invocation"
        );
        self.pending.clear();
        self.kicks.clear();
    }

    fn push_pending(
        &mut self,
        id: DsqId,
        task: &TaskRef,
        slice: u64,
        order: Order,
        flags: EnqFlags,
    ) -> Result<(), QueueError> {
        if !self.rt.is_enabled() {
            return Err(QueueError::Disabled);
        }
        if id.is_builtin() && matches!(order, Order::Vtime(_)) {
            return Err(QueueError::VtimeOnBuiltin(id));
        }
        self.rt.dsqs().check_target(id, Some(self.cpu))?;
        if self.nr_dispatch_slots() == 0 {
            fatal!(
                self.rt.reporter(),
                "dispatch buffer overflow on CPU {} ({} slots)",
                self.cpu,
                self.pending.len(),
            );
            return Err(QueueError::SlotsExhausted);
        }
        self.pending.push(Pending {
            // Dispatching to `LOCAL` means this CPU, even once flushed.
            id: if id == DsqId::LOCAL {
                DsqId::local_on(self.cpu)
            } else {
                id
            },
            task: task.acquire(),
            slice,
            order,
            flags,
        });
        Ok(())
    }

    fn flush_dispatches(&mut self) {
        let dsqs = self.rt.dsqs();
        for Pending {
            id,
            task,
            slice,
            order,
            flags,
        } in self.pending.drain(..)
        {
            match dsqs.enqueue(id, Some(self.cpu), &task, slice, order, flags) {
                Ok(()) => {}
                // Already reported, or nothing left to report to.
                Err(QueueError::Disabled | QueueError::AlreadyQueued { .. }) => {}
                Err(error) => {
                    fatal!(
                        self.rt.reporter(),
                        "dispatching task {} to {id} failed: {error}",
                        task.pid(),
                    );
                }
            }
        }
    }

    fn deliver_kicks(&mut self) {
        for (cpu, flags) in self.kicks.drain(..) {
            if let Err(error) = self.rt.kick_cpu(cpu, flags) {
                tracing::debug!(cpu, ?flags, %error, "dropping kick");
            }
        }
    }
}

impl Drop for Invocation<'_> {
    fn drop(&mut self) {
        self.flush_dispatches();
        self.deliver_kicks();
    }
}

impl fmt::Debug for Invocation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("cpu", &self.cpu)
            .field("pending", &self.pending.len())
            .field("kicks", &self.kicks)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(loom)))]
mod tests;
