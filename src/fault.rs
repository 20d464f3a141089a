//! Fatal fault reporting.
//!
//! When the policy (or the runtime on its behalf) detects that an invariant
//! has been violated, it reports a fatal fault. The first fault disables the
//! policy: every queue-mutating operation fails from then on, and the host is
//! asked to unload the policy and fall back to its baseline scheduler.
//!
//! Concurrent reports are resolved first-reporter-wins. Only the first
//! report's message is recorded and delivered to the host; later reports are
//! logged at the `DEBUG` level and dropped.
use crate::{
    context,
    cpu::CpuId,
    error::{BoundsError, KickError},
    flags::KickFlags,
    host::Host,
    loom::sync::atomic::{
        AtomicU8,
        Ordering::{AcqRel, Acquire, Release},
    },
};
use core::fmt;
use maitake_sync::{blocking::Mutex, spin::Spinlock};

/// The maximum length of an exit message, in bytes.
///
/// Longer messages are truncated.
pub const EXIT_MSG_LEN: usize = 1024;

/// Records fatal faults and forwards CPU kicks to the host.
pub struct ErrorReporter {
    state: AtomicU8,
    exit: Mutex<Option<ExitInfo>, Spinlock>,
    host: Box<dyn Host>,
    nr_cpus: usize,
}

/// Why a policy was disabled.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ExitInfo {
    /// The kind of exit.
    pub kind: ExitKind,
    /// A diagnostic message, at most [`EXIT_MSG_LEN`] bytes long.
    pub msg: String,
    /// The CPU whose invocation reported the exit, if any.
    pub cpu: Option<CpuId>,
}

/// The kind of a policy exit.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum ExitKind {
    /// The policy was unloaded normally.
    Done,
    /// The policy was unregistered by its loader.
    Unregistered,
    /// The policy reported a fatal fault.
    Error,
}

const ENABLED: u8 = 0;
const DISABLING: u8 = 1;
const DISABLED: u8 = 2;

// === impl ErrorReporter ===

impl ErrorReporter {
    pub(crate) fn new(host: Box<dyn Host>, nr_cpus: usize) -> Self {
        Self {
            state: AtomicU8::new(ENABLED),
            exit: Mutex::new_with_raw_mutex(None, Spinlock::new()),
            host,
            nr_cpus,
        }
    }

    /// Reports a fatal fault, disabling the policy.
    ///
    /// Prefer the [`fatal!`](crate::fatal) macro, which formats its arguments.
    ///
    /// # Returns
    ///
    /// - `true` if this was the first exit, which disabled the policy.
    /// - `false` if the policy was already disabled. The report is dropped.
    pub fn report_fatal(&self, args: fmt::Arguments<'_>) -> bool {
        self.exit(ExitKind::Error, args)
    }

    /// Disables the policy at the loader's request.
    ///
    /// Returns `false` if the policy was already disabled.
    pub fn unregister(&self) -> bool {
        self.exit(
            ExitKind::Unregistered,
            format_args!("unregistered by the loader"),
        )
    }

    /// Returns `true` if the policy has not been disabled.
    #[must_use]
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.state.load(Acquire) == ENABLED
    }

    /// Returns the recorded exit, if the policy has been disabled.
    #[must_use]
    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit.lock().clone()
    }

    /// Asks the host to re-invoke the scheduling decision point on `cpu`.
    ///
    /// Inside an [`Invocation`](crate::Invocation), use
    /// [`Invocation::kick_cpu`](crate::Invocation::kick_cpu) instead, which
    /// delivers the kick after the invocation's dispatches are visible.
    pub fn request_cpu_kick(&self, cpu: CpuId, flags: KickFlags) -> Result<(), KickError> {
        if !self.is_enabled() {
            return Err(KickError::Disabled);
        }
        if cpu >= self.nr_cpus {
            return Err(KickError::Bounds(BoundsError {
                index: cpu,
                len: self.nr_cpus,
            }));
        }
        test_trace!(cpu, ?flags, "request_cpu_kick");
        self.host.kick_cpu(cpu, flags);
        Ok(())
    }

    /// Takes the final exit info at unload.
    pub(crate) fn finish(&self) -> ExitInfo {
        self.exit.lock().take().unwrap_or(ExitInfo {
            kind: ExitKind::Done,
            msg: String::new(),
            cpu: None,
        })
    }

    fn exit(&self, kind: ExitKind, args: fmt::Arguments<'_>) -> bool {
        if let Err(state) = self
            .state
            .compare_exchange(ENABLED, DISABLING, AcqRel, Acquire)
        {
            tracing::debug!(state, ?kind, message = %args, "policy already disabled, dropping exit");
            return false;
        }

        let mut msg = args.to_string();
        truncate(&mut msg, EXIT_MSG_LEN);
        let info = ExitInfo {
            kind,
            msg,
            cpu: context::current_cpu(),
        };
        match kind {
            ExitKind::Error => {
                tracing::error!(cpu = ?info.cpu, message = %info.msg, "fatal policy fault")
            }
            _ => tracing::info!(?kind, message = %info.msg, "policy exiting"),
        }

        *self.exit.lock() = Some(info.clone());
        self.state.store(DISABLED, Release);
        self.host.request_unload(&info);
        true
    }
}

impl fmt::Debug for ErrorReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorReporter")
            .field("enabled", &self.is_enabled())
            .field("nr_cpus", &self.nr_cpus)
            .finish_non_exhaustive()
    }
}

fn truncate(msg: &mut String, max: usize) {
    if msg.len() <= max {
        return;
    }
    let mut end = max;
    while !msg.is_char_boundary(end) {
        end -= 1;
    }
    msg.truncate(end);
}

#[cfg(all(test, not(loom)))]
mod tests;
