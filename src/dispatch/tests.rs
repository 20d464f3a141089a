use super::*;
use crate::{
    config::Config,
    error::{BoundsError, ConfigError},
    fault::ExitInfo,
    host::{DetachedHost, Host},
    util::trace_init,
};
use std::sync::{Arc, Mutex};

type Kicks = Arc<Mutex<Vec<(CpuId, KickFlags, Option<DsqId>)>>>;

/// Records each kick, along with the queue a watched task was linked into
/// when the kick was delivered.
struct KickRecorder {
    kicks: Kicks,
    watched: TaskRef,
}

impl Host for KickRecorder {
    fn kick_cpu(&self, cpu: CpuId, flags: KickFlags) {
        let queued_on = self.watched.queued_on();
        self.kicks.lock().unwrap().push((cpu, flags, queued_on));
    }

    fn request_unload(&self, _: &ExitInfo) {}
}

fn runtime() -> Runtime {
    Runtime::load(Config::new(4).with_dispatch_batch(2), DetachedHost::new()).unwrap()
}

fn task(rt: &Runtime, pid: u64) -> TaskRef {
    rt.tasks().insert(Task::new(pid, 4)).unwrap();
    rt.lookup_task(pid).unwrap()
}

fn recording_runtime(watched: &TaskRef) -> (Runtime, Kicks) {
    let kicks = Kicks::default();
    let host = KickRecorder {
        kicks: kicks.clone(),
        watched: watched.acquire(),
    };
    (Runtime::load(Config::new(4), host).unwrap(), kicks)
}

#[test]
fn dispatches_are_speculative() {
    let _trace = trace_init();
    let rt = runtime();
    let t = task(&rt, 1);

    let mut inv = rt.enter(0).unwrap();
    inv.dispatch(DsqId::GLOBAL, &t, 100, EnqFlags::NONE).unwrap();
    assert_eq!(inv.nr_dispatch_slots(), 1);
    assert_eq!(inv.nr_queued(DsqId::GLOBAL), Ok(0));
    assert_eq!(t.queued_on(), None);
    inv.commit();

    assert_eq!(rt.nr_queued(DsqId::GLOBAL), Ok(1));
    assert_eq!(t.queued_on(), Some(DsqId::GLOBAL));
    assert_eq!(t.slice(), 100);
}

#[test]
fn cancel_pending_rescinds_latest() {
    let _trace = trace_init();
    let rt = runtime();
    let (a, b) = (task(&rt, 1), task(&rt, 2));

    let mut inv = rt.enter(1).unwrap();
    assert!(!inv.cancel_pending());
    inv.dispatch(DsqId::GLOBAL, &a, 1, EnqFlags::NONE).unwrap();
    inv.dispatch(DsqId::GLOBAL, &b, 1, EnqFlags::NONE).unwrap();
    assert_eq!(inv.nr_dispatch_slots(), 0);
    assert!(inv.cancel_pending());
    assert_eq!(inv.nr_dispatch_slots(), 1);
    // The cancelled dispatch's reference was released.
    assert_eq!(b.refs(), 2);
    drop(inv);

    assert_eq!(a.queued_on(), Some(DsqId::GLOBAL));
    assert_eq!(b.queued_on(), None);
    assert_eq!(rt.nr_queued(DsqId::GLOBAL), Ok(1));
}

#[test]
fn abort_releases_pending() {
    let _trace = trace_init();
    let rt = runtime();
    let t = task(&rt, 1);
    let mut inv = rt.enter(0).unwrap();
    inv.dispatch(DsqId::LOCAL, &t, 1, EnqFlags::NONE).unwrap();
    inv.abort();
    assert_eq!(t.queued_on(), None);
    assert_eq!(t.refs(), 2);
    assert_eq!(rt.nr_queued(DsqId::local_on(0)), Ok(0));
}

#[test]
fn slot_overflow_is_fatal() {
    let _trace = trace_init();
    let rt = runtime();
    let tasks: Vec<_> = (1..=3).map(|pid| task(&rt, pid)).collect();

    let mut inv = rt.enter(2).unwrap();
    inv.dispatch(DsqId::GLOBAL, &tasks[0], 1, EnqFlags::NONE).unwrap();
    inv.dispatch(DsqId::GLOBAL, &tasks[1], 1, EnqFlags::NONE).unwrap();
    assert_eq!(
        inv.dispatch(DsqId::GLOBAL, &tasks[2], 1, EnqFlags::NONE),
        Err(QueueError::SlotsExhausted)
    );
    drop(inv);

    let exit = rt.exit_info().unwrap();
    assert!(exit.msg.contains("dispatch buffer overflow"), "{}", exit.msg);
    assert_eq!(exit.cpu, Some(2));
    // Once disabled, the pending dispatches are not placed.
    assert_eq!(rt.nr_queued(DsqId::GLOBAL), Ok(0));
    assert!(tasks.iter().all(|t| t.refs() == 2));
}

#[test]
fn dispatch_checks_target() {
    let _trace = trace_init();
    let rt = runtime();
    let t = task(&rt, 1);
    let unknown = DsqId::user(3).unwrap();
    let mut inv = rt.enter(0).unwrap();
    assert_eq!(
        inv.dispatch(unknown, &t, 1, EnqFlags::NONE),
        Err(QueueError::Unknown(unknown))
    );
    assert_eq!(
        inv.dispatch_vtime(DsqId::GLOBAL, &t, 1, 1, EnqFlags::NONE),
        Err(QueueError::VtimeOnBuiltin(DsqId::GLOBAL))
    );
    assert_eq!(inv.nr_dispatch_slots(), 2);
    drop(inv);
    assert!(rt.is_enabled());
}

#[test]
fn local_dispatch_targets_invoking_cpu() {
    let _trace = trace_init();
    let rt = runtime();
    let t = task(&rt, 1);
    let mut inv = rt.enter(3).unwrap();
    inv.dispatch(DsqId::LOCAL, &t, 1, EnqFlags::NONE).unwrap();
    assert_eq!(inv.nr_queued(DsqId::LOCAL), Ok(0));
    drop(inv);
    assert_eq!(t.queued_on(), Some(DsqId::local_on(3)));
}

#[test]
fn consume_flushes_pending_first() {
    let _trace = trace_init();
    let rt = runtime();
    let t = task(&rt, 1);
    let mut inv = rt.enter(1).unwrap();
    inv.dispatch(DsqId::GLOBAL, &t, 1, EnqFlags::NONE).unwrap();
    assert!(inv.consume(DsqId::GLOBAL));
    assert_eq!(inv.nr_queued(DsqId::LOCAL), Ok(1));
    assert_eq!(inv.nr_dispatch_slots(), 2);
    drop(inv);
    assert_eq!(t.queued_on(), Some(DsqId::local_on(1)));
}

#[test]
fn kicks_follow_dispatches() {
    let _trace = trace_init();
    let t = TaskRef::new(Task::new(1, 4));
    let (rt, kicks) = recording_runtime(&t);

    let mut inv = rt.enter(0).unwrap();
    inv.kick_cpu(2, KickFlags::NONE).unwrap();
    inv.dispatch(DsqId::GLOBAL, &t, 1, EnqFlags::NONE).unwrap();
    assert_eq!(
        inv.kick_cpu(4, KickFlags::NONE),
        Err(KickError::Bounds(BoundsError { index: 4, len: 4 }))
    );
    // Nothing is delivered until the invocation commits.
    assert!(kicks.lock().unwrap().is_empty());
    inv.commit();

    // The kick observed the dispatch.
    assert_eq!(
        *kicks.lock().unwrap(),
        [(2, KickFlags::NONE, Some(DsqId::GLOBAL))]
    );
}

#[test]
fn idle_kicks_skip_busy_cpus() {
    let _trace = trace_init();
    let t = TaskRef::new(Task::new(1, 4));
    let (rt, kicks) = recording_runtime(&t);
    rt.idle().update_idle(3, true).unwrap();

    let idle = KickFlags::new().with(KickFlags::IDLE, true);
    let mut inv = rt.enter(0).unwrap();
    inv.kick_cpu(1, idle).unwrap();
    inv.kick_cpu(3, idle).unwrap();
    inv.commit();
    assert_eq!(*kicks.lock().unwrap(), [(3, idle, None)]);
}

#[test]
fn invocation_is_atomic_context() {
    let _trace = trace_init();
    let rt = runtime();
    let inv = rt.enter(0).unwrap();
    assert_eq!(rt.setup().unwrap_err(), ConfigError::AtomicContext);
    drop(inv);
    assert!(rt.setup().is_ok());
    assert_eq!(rt.enter(4).unwrap_err(), BoundsError { index: 4, len: 4 });
}
