use super::*;
use crate::{
    fault::ExitInfo,
    flags::KickFlags,
    host::{DetachedHost, Host},
    kobj::Task,
    util::trace_init,
};
use std::sync::{Mutex as StdMutex, OnceLock, Weak};

const NR_CPUS: usize = 4;

fn queues(config: Config) -> DispatchQueues {
    let reporter = Arc::new(ErrorReporter::new(
        Box::new(DetachedHost::new()),
        config.nr_cpus(),
    ));
    DispatchQueues::new(&config, Topology::new(&config), reporter)
}

fn task(pid: u64) -> TaskRef {
    TaskRef::new(Task::new(pid, NR_CPUS))
}

fn user(id: u64) -> DsqId {
    DsqId::user(id).unwrap()
}

fn fifo(dsqs: &DispatchQueues, id: DsqId, task: &TaskRef) -> Result<(), QueueError> {
    dsqs.enqueue(id, Some(0), task, 1000, Order::Fifo, EnqFlags::NONE)
}

fn vtime(dsqs: &DispatchQueues, id: DsqId, task: &TaskRef, vtime: u64) -> Result<(), QueueError> {
    dsqs.enqueue(id, Some(0), task, 1000, Order::Vtime(vtime), EnqFlags::NONE)
}

fn pids(entries: &[QueuedTask]) -> Vec<u64> {
    entries.iter().map(|entry| entry.task().pid()).collect()
}

#[test]
fn create_queue_errors() {
    let _trace = trace_init();
    let dsqs = queues(Config::new(NR_CPUS).with_nodes(2).with_max_queues(2));

    assert_eq!(dsqs.create_queue(user(5), Locality::Any), Ok(()));
    assert_eq!(
        dsqs.create_queue(user(5), Locality::Any),
        Err(ConfigError::DuplicateQueue(user(5)))
    );
    assert_eq!(
        dsqs.create_queue(DsqId::GLOBAL, Locality::Any),
        Err(ConfigError::BuiltinQueue(DsqId::GLOBAL))
    );
    assert_eq!(
        dsqs.create_queue(user(6), Locality::Node(2)),
        Err(ConfigError::InvalidLocality {
            node: 2,
            nr_nodes: 2
        })
    );
    assert_eq!(dsqs.create_queue(user(6), Locality::Node(1)), Ok(()));
    assert_eq!(
        dsqs.create_queue(user(7), Locality::Any),
        Err(ConfigError::QueueTableFull { max: 2 })
    );

    assert_eq!(dsqs.queue_ids(), [user(5), user(6)]);
    assert_eq!(dsqs.locality(user(6)), Ok(Locality::Node(1)));
}

#[test]
fn destroy_queue() {
    let _trace = trace_init();
    let dsqs = queues(Config::new(NR_CPUS));
    dsqs.create_queue(user(1), Locality::Any).unwrap();

    assert_eq!(dsqs.destroy_queue(user(2)), Err(QueueError::Unknown(user(2))));
    assert_eq!(
        dsqs.destroy_queue(DsqId::GLOBAL),
        Err(QueueError::Builtin(DsqId::GLOBAL))
    );
    assert_eq!(dsqs.destroy_queue(user(1)), Ok(()));
    assert!(dsqs.queue_ids().is_empty());
    assert_eq!(
        dsqs.nr_queued(user(1), None),
        Err(QueueError::Unknown(user(1)))
    );
}

#[test]
fn destroying_nonempty_queue_is_fatal() {
    let _trace = trace_init();
    let dsqs = queues(Config::new(NR_CPUS));
    dsqs.create_queue(user(1), Locality::Any).unwrap();
    let t = task(10);
    fifo(&dsqs, user(1), &t).unwrap();

    assert_eq!(dsqs.destroy_queue(user(1)), Err(QueueError::NotEmpty(user(1))));
    assert!(!dsqs.reporter.is_enabled());
    // The queue is kept, so its task is not lost.
    assert_eq!(dsqs.queue_ids(), [user(1)]);
    let drained = dsqs.drain_all();
    assert_eq!(pids(&drained), [10]);
    assert_eq!(t.queued_on(), None);
}

#[test]
fn fifo_round_trip() {
    let _trace = trace_init();
    let dsqs = queues(Config::new(NR_CPUS));
    let q = user(5);
    dsqs.create_queue(q, Locality::Any).unwrap();

    let t = task(1);
    fifo(&dsqs, q, &t).unwrap();
    assert_eq!(dsqs.nr_queued(q, None), Ok(1));
    assert_eq!(t.queued_on(), Some(q));
    assert_eq!(t.slice(), 1000);
    // The queue holds its own reference.
    assert_eq!(t.refs(), 2);

    assert!(dsqs.consume(q, 2));
    assert_eq!(dsqs.nr_queued(q, None), Ok(0));
    assert_eq!(dsqs.nr_queued(DsqId::local_on(2), None), Ok(1));
    assert_eq!(dsqs.nr_queued(DsqId::LOCAL, Some(2)), Ok(1));
    assert_eq!(t.queued_on(), Some(DsqId::local_on(2)));
    assert!(!dsqs.consume(q, 2));

    let entry = dsqs.pop_local(2).unwrap().unwrap();
    assert!(Ref::ptr_eq(entry.task(), &t));
    assert_eq!(entry.slice(), 1000);
    assert_eq!(t.queued_on(), None);
    drop(entry);
    assert_eq!(t.refs(), 1);
    assert!(dsqs.pop_local(2).unwrap().is_none());
}

#[test]
fn fifo_head_insertion() {
    let _trace = trace_init();
    let dsqs = queues(Config::new(NR_CPUS));
    let tasks: Vec<_> = (1..=3).map(task).collect();
    fifo(&dsqs, DsqId::GLOBAL, &tasks[0]).unwrap();
    fifo(&dsqs, DsqId::GLOBAL, &tasks[1]).unwrap();
    let head = EnqFlags::new().with(EnqFlags::HEAD, true);
    dsqs.enqueue(DsqId::GLOBAL, None, &tasks[2], 10, Order::Fifo, head)
        .unwrap();

    let mut order = Vec::new();
    while dsqs.consume(DsqId::GLOBAL, 0) {
        order.push(dsqs.pop_local(0).unwrap().unwrap().task().pid());
    }
    assert_eq!(order, [3, 1, 2]);
}

#[test]
fn vtime_order_with_ties() {
    let _trace = trace_init();
    let dsqs = queues(Config::new(NR_CPUS));
    let q = user(7);
    dsqs.create_queue(q, Locality::Any).unwrap();

    let keys = [(1, 30), (2, 10), (3, 20), (4, 10), (5, 30), (6, 0)];
    let tasks: Vec<_> = keys.iter().map(|&(pid, _)| task(pid)).collect();
    for (t, &(_, key)) in tasks.iter().zip(&keys) {
        vtime(&dsqs, q, t, key).unwrap();
    }
    assert_eq!(tasks[1].dsq_vtime(), 10);
    assert_eq!(dsqs.nr_queued(q, None), Ok(6));

    let mut order = Vec::new();
    while dsqs.consume(q, 1) {
        let entry = dsqs.pop_local(1).unwrap().unwrap();
        order.push((entry.task().pid(), entry.vtime()));
    }
    assert_eq!(order, [(6, 0), (2, 10), (4, 10), (3, 20), (1, 30), (5, 30)]);
}

#[test]
fn ordering_is_latched() {
    let _trace = trace_init();
    let dsqs = queues(Config::new(NR_CPUS));
    let q = user(1);
    dsqs.create_queue(q, Locality::Any).unwrap();
    let (a, b) = (task(1), task(2));

    vtime(&dsqs, q, &a, 5).unwrap();
    assert_eq!(fifo(&dsqs, q, &b), Err(QueueError::OrderingMismatch(q)));
    // A failed insertion leaves the task unqueued and unreferenced.
    assert_eq!(b.queued_on(), None);
    assert_eq!(b.refs(), 1);

    // Once the queue drains, the other ordering may be used.
    assert!(dsqs.dequeue(&a).is_some());
    fifo(&dsqs, q, &b).unwrap();
    assert_eq!(vtime(&dsqs, q, &a, 1), Err(QueueError::OrderingMismatch(q)));
    assert!(dsqs.reporter.is_enabled());
}

#[test]
fn vtime_on_builtin_queue() {
    let _trace = trace_init();
    let dsqs = queues(Config::new(NR_CPUS));
    let t = task(1);
    for id in [DsqId::GLOBAL, DsqId::LOCAL, DsqId::local_on(1)] {
        assert_eq!(vtime(&dsqs, id, &t, 1), Err(QueueError::VtimeOnBuiltin(id)));
    }
    assert_eq!(t.queued_on(), None);
}

/// A host which reads the queue table while handling an unload request.
#[derive(Clone, Default)]
struct Inspector {
    dsqs: Arc<OnceLock<Weak<DispatchQueues>>>,
    seen: Arc<StdMutex<Option<Vec<(DsqId, u32)>>>>,
}

impl Host for Inspector {
    fn kick_cpu(&self, _: CpuId, _: KickFlags) {}

    fn request_unload(&self, _: &ExitInfo) {
        let Some(dsqs) = self.dsqs.get().and_then(Weak::upgrade) else {
            return;
        };
        let seen = dsqs
            .queue_ids()
            .into_iter()
            .map(|id| (id, dsqs.nr_queued(id, None).unwrap()))
            .collect();
        *self.seen.lock().unwrap() = Some(seen);
    }
}

#[test]
fn host_reads_queues_during_fault() {
    let _trace = trace_init();
    let config = Config::new(NR_CPUS);
    let host = Inspector::default();
    let reporter = Arc::new(ErrorReporter::new(Box::new(host.clone()), NR_CPUS));
    let dsqs = Arc::new(DispatchQueues::new(&config, Topology::new(&config), reporter));
    host.dsqs.set(Arc::downgrade(&dsqs)).unwrap();

    dsqs.create_queue(user(1), Locality::Any).unwrap();
    fifo(&dsqs, user(1), &task(10)).unwrap();
    assert_eq!(dsqs.destroy_queue(user(1)), Err(QueueError::NotEmpty(user(1))));
    assert_eq!(*host.seen.lock().unwrap(), Some(vec![(user(1), 1)]));
}

#[test]
fn local_targets() {
    let _trace = trace_init();
    let dsqs = queues(Config::new(NR_CPUS));
    let t = task(1);

    assert_eq!(
        dsqs.enqueue(DsqId::LOCAL, None, &t, 0, Order::Fifo, EnqFlags::NONE),
        Err(QueueError::Unknown(DsqId::LOCAL))
    );
    assert_eq!(
        fifo(&dsqs, DsqId::local_on(NR_CPUS), &t),
        Err(QueueError::Bounds(BoundsError {
            index: NR_CPUS,
            len: NR_CPUS
        }))
    );
    // Wide CPU numbers must not wrap around onto a real CPU.
    assert_eq!(
        fifo(&dsqs, DsqId::local_on(1 << 32), &t),
        Err(QueueError::Bounds(BoundsError {
            index: u32::MAX as CpuId,
            len: NR_CPUS
        }))
    );
    assert_eq!(dsqs.nr_queued(DsqId::local_on(0), None), Ok(0));
    assert_eq!(
        fifo(&dsqs, DsqId::INVALID, &t),
        Err(QueueError::Unknown(DsqId::INVALID))
    );
    assert_eq!(t.queued_on(), None);

    fifo(&dsqs, DsqId::local_on(3), &t).unwrap();
    assert_eq!(t.queued_on(), Some(DsqId::local_on(3)));
    // Local queues cannot be consumed from.
    assert!(!dsqs.consume(DsqId::local_on(3), 0));
    assert!(!dsqs.consume(DsqId::LOCAL, 3));
    assert_eq!(dsqs.pop_local(3).unwrap().unwrap().task().pid(), 1);
    assert_eq!(
        dsqs.pop_local(NR_CPUS).unwrap_err(),
        BoundsError {
            index: NR_CPUS,
            len: NR_CPUS
        }
    );
}

#[test]
fn double_enqueue_is_fatal() {
    let _trace = trace_init();
    let dsqs = queues(Config::new(NR_CPUS));
    let t = task(9);
    fifo(&dsqs, DsqId::GLOBAL, &t).unwrap();
    assert_eq!(
        fifo(&dsqs, DsqId::local_on(1), &t),
        Err(QueueError::AlreadyQueued {
            pid: 9,
            dsq: DsqId::GLOBAL
        })
    );
    assert!(!dsqs.reporter.is_enabled());
    let exit = dsqs.reporter.exit_info().unwrap();
    assert!(exit.msg.contains("already queued on GLOBAL"), "{}", exit.msg);
    assert_eq!(dsqs.nr_queued(DsqId::GLOBAL, None), Ok(1));
}

#[test]
fn full_queue() {
    let _trace = trace_init();
    let dsqs = queues(Config::new(NR_CPUS).with_queue_capacity(2));
    let tasks: Vec<_> = (1..=3).map(task).collect();
    fifo(&dsqs, DsqId::GLOBAL, &tasks[0]).unwrap();
    fifo(&dsqs, DsqId::GLOBAL, &tasks[1]).unwrap();
    assert_eq!(
        fifo(&dsqs, DsqId::GLOBAL, &tasks[2]),
        Err(QueueError::Full(DsqId::GLOBAL))
    );
    assert_eq!(tasks[2].queued_on(), None);
    assert_eq!(tasks[2].refs(), 1);

    // Freed slots are reused.
    assert!(dsqs.consume(DsqId::GLOBAL, 0));
    fifo(&dsqs, DsqId::GLOBAL, &tasks[2]).unwrap();
}

#[test]
fn dequeue_from_any_queue() {
    let _trace = trace_init();
    let dsqs = queues(Config::new(NR_CPUS));
    let (fq, vq) = (user(1), user(2));
    dsqs.create_queue(fq, Locality::Any).unwrap();
    dsqs.create_queue(vq, Locality::Any).unwrap();
    let tasks: Vec<_> = (1..=6).map(task).collect();

    fifo(&dsqs, fq, &tasks[0]).unwrap();
    fifo(&dsqs, fq, &tasks[1]).unwrap();
    vtime(&dsqs, vq, &tasks[2], 3).unwrap();
    vtime(&dsqs, vq, &tasks[3], 1).unwrap();
    fifo(&dsqs, DsqId::GLOBAL, &tasks[4]).unwrap();
    assert!(dsqs.consume(DsqId::GLOBAL, 1));

    assert_eq!(dsqs.dequeue(&tasks[0]).unwrap().task().pid(), 1);
    assert_eq!(dsqs.dequeue(&tasks[2]).unwrap().vtime(), 3);
    assert_eq!(dsqs.dequeue(&tasks[4]).unwrap().task().pid(), 5);
    assert!(dsqs.dequeue(&tasks[5]).is_none());
    assert!(dsqs.dequeue(&tasks[0]).is_none());

    assert_eq!(dsqs.nr_queued(fq, None), Ok(1));
    assert_eq!(dsqs.nr_queued(vq, None), Ok(1));
    assert_eq!(dsqs.nr_queued(DsqId::local_on(1), None), Ok(0));
    for t in &tasks {
        if t.queued_on().is_none() {
            assert_eq!(t.refs(), 1, "task {} leaked a reference", t.pid());
        }
    }
}

#[test]
fn reenqueue_local_returns_tasks_in_order() {
    let _trace = trace_init();
    let dsqs = queues(Config::new(NR_CPUS));
    let tasks: Vec<_> = (1..=3).map(task).collect();
    for t in &tasks {
        fifo(&dsqs, DsqId::local_on(2), t).unwrap();
    }
    let drained = dsqs.reenqueue_local(2).unwrap();
    assert_eq!(pids(&drained), [1, 2, 3]);
    assert!(tasks.iter().all(|t| t.queued_on().is_none()));
    assert_eq!(dsqs.nr_queued(DsqId::local_on(2), None), Ok(0));

    // The drained tasks may be enqueued again.
    for entry in drained {
        fifo(&dsqs, DsqId::GLOBAL, &entry.into_task()).unwrap();
    }
    assert_eq!(dsqs.nr_queued(DsqId::GLOBAL, None), Ok(3));
}

#[test]
fn disabled_queues_refuse_mutation() {
    let _trace = trace_init();
    let dsqs = queues(Config::new(NR_CPUS));
    let q = user(1);
    dsqs.create_queue(q, Locality::Any).unwrap();
    let (a, b) = (task(1), task(2));
    fifo(&dsqs, q, &a).unwrap();

    assert!(fatal!(dsqs.reporter, "test fault"));
    assert_eq!(fifo(&dsqs, q, &b), Err(QueueError::Disabled));
    assert_eq!(
        dsqs.create_queue(user(2), Locality::Any),
        Err(ConfigError::Disabled)
    );
    assert_eq!(dsqs.destroy_queue(q), Err(QueueError::Disabled));
    assert!(!dsqs.consume(q, 0));
    assert_eq!(dsqs.reenqueue_local(0).unwrap_err(), QueueError::Disabled);
    // Counts are still readable.
    assert_eq!(dsqs.nr_queued(q, None), Ok(1));
    assert_eq!(b.queued_on(), None);

    let drained = dsqs.drain_all();
    assert_eq!(pids(&drained), [1]);
    drop(drained);
    assert_eq!(a.refs(), 1);
}

#[test]
fn drain_all_collects_every_queue() {
    let _trace = trace_init();
    let dsqs = queues(Config::new(NR_CPUS));
    dsqs.create_queue(user(1), Locality::Any).unwrap();
    let tasks: Vec<_> = (1..=4).map(task).collect();
    fifo(&dsqs, user(1), &tasks[0]).unwrap();
    fifo(&dsqs, DsqId::GLOBAL, &tasks[1]).unwrap();
    fifo(&dsqs, DsqId::local_on(0), &tasks[2]).unwrap();
    fifo(&dsqs, DsqId::local_on(3), &tasks[3]).unwrap();

    let mut drained = pids(&dsqs.drain_all());
    drained.sort_unstable();
    assert_eq!(drained, [1, 2, 3, 4]);
    assert!(dsqs.drain_all().is_empty());
}
