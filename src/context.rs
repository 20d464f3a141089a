//! Tracks whether the current thread is in an atomic context.
//!
//! Read-side sections and decision-point invocations must not block. While
//! either is live on a thread, that thread is in an atomic context, and
//! sleepable operations such as [`Runtime::setup`](crate::Runtime::setup)
//! refuse to run.
use crate::cpu::CpuId;
use core::{cell::Cell, fmt, marker::PhantomData};

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
    static CURRENT_CPU: Cell<Option<CpuId>> = const { Cell::new(None) };
}

/// Marks the current thread as being in an atomic context until dropped.
///
/// This type is `!Send`, so it is always dropped on the thread that created
/// it.
pub(crate) struct AtomicGuard {
    prev_cpu: Option<CpuId>,
    _not_send: PhantomData<*const ()>,
}

impl AtomicGuard {
    /// Enters an atomic context without changing the current CPU.
    pub(crate) fn enter() -> Self {
        DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self {
            prev_cpu: current_cpu(),
            _not_send: PhantomData,
        }
    }

    /// Enters an atomic context on behalf of `cpu`.
    pub(crate) fn enter_cpu(cpu: CpuId) -> Self {
        let guard = Self::enter();
        CURRENT_CPU.with(|current| current.set(Some(cpu)));
        guard
    }
}

impl Drop for AtomicGuard {
    fn drop(&mut self) {
        DEPTH.with(|depth| depth.set(depth.get() - 1));
        CURRENT_CPU.with(|current| current.set(self.prev_cpu));
    }
}

impl fmt::Debug for AtomicGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicGuard")
            .field("depth", &depth())
            .field("cpu", &current_cpu())
            .finish()
    }
}

/// Returns `true` if the current thread is in an atomic context.
pub(crate) fn in_atomic() -> bool {
    depth() > 0
}

/// Returns the CPU of the innermost invocation on this thread, if any.
pub(crate) fn current_cpu() -> Option<CpuId> {
    CURRENT_CPU.with(Cell::get)
}

fn depth() -> usize {
    DEPTH.with(Cell::get)
}
