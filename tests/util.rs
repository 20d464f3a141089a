#![cfg(not(loom))]
#![allow(dead_code)]

use mycosched::{
    ops::DEFAULT_SLICE_NS, ConfigError, CpuId, DsqId, EnqFlags, ExitInfo, Host, Invocation,
    KickFlags, Locality, Ops, QueueError, Setup, TaskRef, WakeFlags,
};
use std::sync::{
    atomic::{AtomicU64, Ordering::Relaxed},
    Arc, Mutex,
};

pub fn trace_init() {
    use tracing_subscriber::filter::LevelFilter;
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .with_test_writer()
        .try_init();
}

/// A host which records every request the runtime makes of it.
#[derive(Clone, Default)]
pub struct RecordingHost(Arc<Recorded>);

#[derive(Default)]
pub struct Recorded {
    kicks: Mutex<Vec<(CpuId, KickFlags)>>,
    unloads: Mutex<Vec<ExitInfo>>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kicks(&self) -> Vec<(CpuId, KickFlags)> {
        self.0.kicks.lock().unwrap().clone()
    }

    pub fn unloads(&self) -> Vec<ExitInfo> {
        self.0.unloads.lock().unwrap().clone()
    }
}

impl Host for RecordingHost {
    fn kick_cpu(&self, cpu: CpuId, flags: KickFlags) {
        self.0.kicks.lock().unwrap().push((cpu, flags));
    }

    fn request_unload(&self, exit: &ExitInfo) {
        self.0.unloads.lock().unwrap().push(exit.clone());
    }
}

/// A weighted virtual-time policy with a single shared queue.
///
/// Tasks which wake onto an idle CPU are dispatched straight to its local
/// queue. Everything else is ordered by virtual time on `SHARED`.
#[derive(Default)]
pub struct VtimePolicy {
    vtime_now: AtomicU64,
    exit: Arc<Mutex<Option<ExitInfo>>>,
}

impl VtimePolicy {
    pub const SHARED: DsqId = match DsqId::user(0) {
        Some(id) => id,
        None => DsqId::INVALID,
    };

    /// Returns a handle to the exit info passed to `Ops::exit`, which
    /// outlives the policy.
    pub fn exit_slot(&self) -> Arc<Mutex<Option<ExitInfo>>> {
        self.exit.clone()
    }
}

impl Ops for VtimePolicy {
    fn init(&self, setup: &mut Setup<'_>) -> Result<(), ConfigError> {
        setup.create_queue(Self::SHARED, Locality::Any)
    }

    fn select_cpu(
        &self,
        inv: &mut Invocation<'_>,
        task: &TaskRef,
        prev_cpu: CpuId,
        wake_flags: WakeFlags,
    ) -> CpuId {
        let (cpu, idle) = inv.select_cpu_default_idle(task, prev_cpu, wake_flags);
        if idle {
            let _ = inv.dispatch(DsqId::local_on(cpu), task, DEFAULT_SLICE_NS, EnqFlags::NONE);
        }
        cpu
    }

    fn enqueue(
        &self,
        inv: &mut Invocation<'_>,
        task: &TaskRef,
        flags: EnqFlags,
    ) -> Result<(), QueueError> {
        // Don't let a long-idle task bank more than one slice of credit.
        let floor = self
            .vtime_now
            .load(Relaxed)
            .saturating_sub(DEFAULT_SLICE_NS);
        let vtime = task.dsq_vtime().max(floor);
        inv.enqueue_vtime(Self::SHARED, task, DEFAULT_SLICE_NS, vtime, flags)
    }

    fn dispatch(&self, inv: &mut Invocation<'_>, _: Option<&TaskRef>) -> Result<(), QueueError> {
        inv.consume(Self::SHARED);
        Ok(())
    }

    fn running(&self, _: &mut Invocation<'_>, task: &TaskRef) {
        self.vtime_now.fetch_max(task.dsq_vtime(), Relaxed);
    }

    fn stopping(&self, _: &mut Invocation<'_>, task: &TaskRef, _: bool) {
        let charge = DEFAULT_SLICE_NS * 100 / u64::from(task.weight().max(1));
        task.set_dsq_vtime(task.dsq_vtime() + charge);
    }

    fn exit(&self, exit: &ExitInfo) {
        *self.exit.lock().unwrap() = Some(exit.clone());
    }
}
