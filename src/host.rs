//! The interface the runtime consumes from its host.
use crate::{cpu::CpuId, fault::ExitInfo, flags::KickFlags};

/// Services provided by the host runtime.
///
/// The host invokes the policy at its decision points, and the runtime calls
/// back into the host through this trait. Both methods may be called from any
/// CPU, inside a decision-point invocation, so they must not block.
pub trait Host: Send + Sync + 'static {
    /// Asks the host to re-invoke the scheduling decision point on `cpu`.
    fn kick_cpu(&self, cpu: CpuId, flags: KickFlags);

    /// Asks the host to unload the policy and fall back to its baseline
    /// scheduler.
    ///
    /// This is called at most once per load, by the first fatal fault or
    /// unregistration.
    fn request_unload(&self, exit: &ExitInfo);
}

/// A [`Host`] which ignores every request.
///
/// This is useful for tests and for driving a [`Runtime`](crate::Runtime)
/// without a host.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedHost {
    _p: (),
}

impl DetachedHost {
    /// Returns a new `DetachedHost`.
    #[must_use]
    pub const fn new() -> Self {
        Self { _p: () }
    }
}

impl Host for DetachedHost {
    fn kick_cpu(&self, cpu: CpuId, flags: KickFlags) {
        tracing::trace!(cpu, ?flags, "DetachedHost::kick_cpu");
    }

    fn request_unload(&self, exit: &ExitInfo) {
        tracing::trace!(?exit, "DetachedHost::request_unload");
    }
}
