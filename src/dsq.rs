//! Dispatch queues.
//!
//! A dispatch queue holds tasks which are ready to run, until a CPU consumes
//! them. There are three kinds:
//!
//! - *User* queues are created and destroyed by the policy, in its sleepable
//!   [`Setup`](crate::Setup) context. Each is ordered either FIFO or by
//!   virtual time; the ordering is latched by the first insertion into an
//!   empty queue.
//! - The *global* queue ([`DsqId::GLOBAL`]) is a builtin FIFO queue shared by
//!   every CPU.
//! - Each CPU has a *local* queue ([`DsqId::LOCAL`] or
//!   [`DsqId::local_on`]), from which the host takes the next task to run on
//!   that CPU.
//!
//! A task is linked into at most one queue at a time. The queue holds an
//! owned [`TaskRef`] for every task it contains, and hands it back when the
//! task leaves the queue.
//!
//! Every queue is protected by its own spinlock, and no operation ever holds
//! two queue locks at once. Lengths are mirrored in an atomic counter, so
//! [`DispatchQueues::nr_queued`] never takes a lock.
use crate::{
    config::Config,
    cpu::{CpuId, PerCpu, Topology},
    error::{BoundsError, ConfigError, QueueError},
    fault::ErrorReporter,
    flags::EnqFlags,
    kobj::{Ref, TaskRef},
};
use core::fmt;
use maitake_sync::{
    blocking::{Mutex, RwLock},
    spin::Spinlock,
    util::{Backoff, CachePadded},
};
use rhizome::{Arena, List, Tree, UnlinkError};
use std::{
    collections::HashMap,
    sync::{
        atomic::{
            AtomicBool, AtomicU32,
            Ordering::{Acquire, Relaxed, Release},
        },
        Arc,
    },
};

mod id;

pub use self::id::{DsqId, Locality};

/// All of a policy's dispatch queues.
pub struct DispatchQueues {
    user: RwLock<HashMap<DsqId, Arc<Dsq>>>,
    global: Dsq,
    local: PerCpu<CachePadded<Dsq>>,
    /// Tasks which could not be placed after leaving a queue. They are handed
    /// back to the host at unload.
    strays: Mutex<Vec<QueuedTask>, Spinlock>,
    topology: Topology,
    max_queues: usize,
    capacity: usize,
    reporter: Arc<ErrorReporter>,
}

/// A task linked into a dispatch queue.
#[derive(Debug)]
pub struct QueuedTask {
    task: TaskRef,
    slice: u64,
    vtime: u64,
    flags: EnqFlags,
}

/// How a task is inserted into a queue.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Order {
    Fifo,
    Vtime(u64),
}

struct Dsq {
    id: DsqId,
    locality: Locality,
    nr: AtomicU32,
    destroyed: AtomicBool,
    inner: Mutex<DsqInner, Spinlock>,
}

struct DsqInner {
    arena: Arena<QueuedTask>,
    fifo: List<QueuedTask>,
    vtime: Tree<QueuedTask>,
}

/// How many times [`DispatchQueues::dequeue`] chases a task that is moving
/// between queues before giving up.
const DEQUEUE_RETRIES: usize = 64;

// === impl DispatchQueues ===

impl DispatchQueues {
    pub(crate) fn new(config: &Config, topology: Topology, reporter: Arc<ErrorReporter>) -> Self {
        let capacity = config.queue_capacity;
        Self {
            user: RwLock::new(HashMap::new()),
            global: Dsq::new(DsqId::GLOBAL, Locality::Any, capacity),
            // Local queues only ever receive tasks which already left another
            // queue, so they are not bounded by the per-queue capacity.
            local: PerCpu::new(topology.nr_cpus(), |cpu| {
                CachePadded::new(Dsq::new(
                    DsqId::local_on(cpu),
                    Locality::Any,
                    Arena::<QueuedTask>::MAX_CAPACITY,
                ))
            }),
            strays: Mutex::new_with_raw_mutex(Vec::new(), Spinlock::new()),
            topology,
            max_queues: config.max_queues,
            capacity,
            reporter,
        }
    }

    /// Creates a user dispatch queue.
    ///
    /// # Returns
    ///
    /// - `Ok(())` if the queue was created.
    /// - [`ConfigError::BuiltinQueue`] if `id` is a builtin ID.
    /// - [`ConfigError::DuplicateQueue`] if a queue with this ID exists.
    /// - [`ConfigError::QueueTableFull`] if the configured maximum number of
    ///   queues exist.
    /// - [`ConfigError::InvalidLocality`] if `locality` names a NUMA node which
    ///   does not exist.
    /// - [`ConfigError::Disabled`] if the policy has been disabled.
    pub(crate) fn create_queue(&self, id: DsqId, locality: Locality) -> Result<(), ConfigError> {
        if !self.reporter.is_enabled() {
            return Err(ConfigError::Disabled);
        }
        if id.is_builtin() {
            return Err(ConfigError::BuiltinQueue(id));
        }
        if let Locality::Node(node) = locality {
            let nr_nodes = self.topology.nr_nodes();
            if node >= nr_nodes {
                return Err(ConfigError::InvalidLocality { node, nr_nodes });
            }
        }

        let mut user = self.user.write();
        if user.contains_key(&id) {
            return Err(ConfigError::DuplicateQueue(id));
        }
        if user.len() >= self.max_queues {
            return Err(ConfigError::QueueTableFull {
                max: self.max_queues,
            });
        }
        user.insert(id, Arc::new(Dsq::new(id, locality, self.capacity)));
        tracing::debug!(%id, ?locality, queues = user.len(), "created dispatch queue");
        Ok(())
    }

    /// Destroys a user dispatch queue.
    ///
    /// Destroying a queue which still holds tasks is a fatal fault. The queue
    /// is left in place, so that its tasks are returned at unload.
    pub(crate) fn destroy_queue(&self, id: DsqId) -> Result<(), QueueError> {
        if !self.reporter.is_enabled() {
            return Err(QueueError::Disabled);
        }
        if id.is_builtin() {
            return Err(QueueError::Builtin(id));
        }

        let mut user = self.user.write();
        let dsq = user.get(&id).ok_or(QueueError::Unknown(id))?;
        let nr = {
            let inner = dsq.inner.lock();
            let nr = inner.len();
            if nr == 0 {
                // Inserters which resolved the queue before it was removed
                // from the table observe this under the queue's lock.
                dsq.destroyed.store(true, Relaxed);
            }
            nr
        };
        if nr > 0 {
            // The host may read the queue table while handling the fault.
            drop(user);
            fatal!(self.reporter, "destroying non-empty dispatch queue {id} ({nr} tasks)");
            return Err(QueueError::NotEmpty(id));
        }
        user.remove(&id);
        tracing::debug!(%id, queues = user.len(), "destroyed dispatch queue");
        Ok(())
    }

    /// Returns the number of tasks in a queue.
    ///
    /// The count may be stale by the time it is returned. This is never
    /// disabled by a fatal fault.
    pub fn nr_queued(&self, id: DsqId, cpu: Option<CpuId>) -> Result<u32, QueueError> {
        self.with_queue(id, cpu, |dsq| dsq.nr.load(Acquire))
    }

    /// Returns the locality hint a user queue was created with.
    pub fn locality(&self, id: DsqId) -> Result<Locality, QueueError> {
        self.with_queue(id, None, |dsq| dsq.locality)
    }

    /// Returns the IDs of every user queue, in ascending order.
    #[must_use]
    pub fn queue_ids(&self) -> Vec<DsqId> {
        let mut ids: Vec<_> = self.user.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Returns an error if `id` cannot be enqueued to from `cpu`.
    pub(crate) fn check_target(&self, id: DsqId, cpu: Option<CpuId>) -> Result<(), QueueError> {
        self.with_queue(id, cpu, |_| ())
    }

    /// Links `task` into queue `id`.
    ///
    /// The queue acquires its own reference to the task. If the task is
    /// already linked into a queue, this reports a fatal fault.
    pub(crate) fn enqueue(
        &self,
        id: DsqId,
        cpu: Option<CpuId>,
        task: &TaskRef,
        slice: u64,
        order: Order,
        flags: EnqFlags,
    ) -> Result<(), QueueError> {
        if !self.reporter.is_enabled() {
            return Err(QueueError::Disabled);
        }
        if id.is_builtin() && matches!(order, Order::Vtime(_)) {
            return Err(QueueError::VtimeOnBuiltin(id));
        }

        self.with_queue(id, cpu, |dsq| {
            if let Err(queued_on) = task.claim_queue(dsq.id) {
                fatal!(
                    self.reporter,
                    "task {} enqueued on {} while already queued on {queued_on}",
                    task.pid(),
                    dsq.id,
                );
                return Err(QueueError::AlreadyQueued {
                    pid: task.pid(),
                    dsq: queued_on,
                });
            }

            task.set_slice(slice);
            let vtime = match order {
                Order::Vtime(vtime) => {
                    task.set_dsq_vtime(vtime);
                    vtime
                }
                Order::Fifo => 0,
            };
            let entry = QueuedTask {
                task: task.acquire(),
                slice,
                vtime,
                flags,
            };
            dsq.insert(entry, order).map_err(|(error, entry)| {
                entry.task.clear_queued();
                error
            })?;
            test_trace!(dsq = %dsq.id, pid = task.pid(), ?order, "enqueued");
            Ok(())
        })?
    }

    /// Moves the first task of queue `id` to the end of `cpu`'s local queue.
    ///
    /// Returns `false` if the queue was empty, or if `id` names a local queue
    /// (which cannot be consumed from).
    pub(crate) fn consume(&self, id: DsqId, cpu: CpuId) -> bool {
        if !self.reporter.is_enabled() || id.is_local() {
            return false;
        }
        let Ok(local) = self.local.get(cpu) else {
            return false;
        };
        let entry = match self.with_queue(id, Some(cpu), Dsq::pop) {
            Ok(Some(entry)) => entry,
            Ok(None) => return false,
            Err(error) => {
                tracing::warn!(%id, cpu, %error, "cannot consume from dispatch queue");
                return false;
            }
        };

        let pid = entry.task.pid();
        match local.insert(entry, Order::Fifo) {
            Ok(()) => {
                test_trace!(from = %id, cpu, pid, "consumed");
                true
            }
            Err((error, entry)) => {
                fatal!(self.reporter, "cannot move task {pid} to {}: {error}", local.id);
                self.stray(entry);
                false
            }
        }
    }

    /// Unlinks `task` from whichever queue it is linked into.
    ///
    /// Returns `None` if the task is not queued. The task may be moving
    /// between queues concurrently; this retries a bounded number of times.
    pub fn dequeue(&self, task: &TaskRef) -> Option<QueuedTask> {
        let mut backoff = Backoff::new();
        for _ in 0..DEQUEUE_RETRIES {
            let id = task.queued_on()?;
            match self.with_queue(id, None, |dsq| dsq.remove(task)) {
                Ok(Ok(entry)) => {
                    entry.task.clear_queued();
                    test_trace!(dsq = %id, pid = task.pid(), "dequeued");
                    return Some(entry);
                }
                Ok(Err(UnlinkError::Corrupted)) => {
                    fatal!(self.reporter, "dispatch queue {id} is corrupted");
                    return None;
                }
                // The task left `id` after we loaded it, or has claimed `id`
                // but not been linked yet.
                _ => backoff.spin(),
            }
        }
        tracing::warn!(pid = task.pid(), "task kept moving between queues, giving up");
        None
    }

    /// Takes the first task from `cpu`'s local queue, so that the host can
    /// run it.
    pub fn pop_local(&self, cpu: CpuId) -> Result<Option<QueuedTask>, BoundsError> {
        let entry = self.local.get(cpu)?.pop();
        if let Some(entry) = &entry {
            entry.task.clear_queued();
        }
        Ok(entry)
    }

    /// Drains `cpu`'s local queue, returning its tasks in order so that the
    /// policy can enqueue them again.
    pub fn reenqueue_local(&self, cpu: CpuId) -> Result<Vec<QueuedTask>, QueueError> {
        if !self.reporter.is_enabled() {
            return Err(QueueError::Disabled);
        }
        let drained = self.local.get(cpu)?.drain();
        tracing::debug!(cpu, tasks = drained.len(), "reenqueue_local");
        Ok(drained)
    }

    /// Drains every queue, returning all of the tasks they held.
    pub(crate) fn drain_all(&self) -> Vec<QueuedTask> {
        let mut tasks = core::mem::take(&mut *self.strays.lock());
        for dsq in self.user.read().values() {
            tasks.extend(dsq.drain());
        }
        tasks.extend(self.global.drain());
        for (_, local) in self.local.iter() {
            tasks.extend(local.drain());
        }
        tasks
    }

    fn stray(&self, entry: QueuedTask) {
        entry.task.clear_queued();
        self.strays.lock().push(entry);
    }

    fn with_queue<T>(
        &self,
        id: DsqId,
        cpu: Option<CpuId>,
        f: impl FnOnce(&Dsq) -> T,
    ) -> Result<T, QueueError> {
        if id == DsqId::GLOBAL {
            return Ok(f(&self.global));
        }
        if id == DsqId::LOCAL {
            let cpu = cpu.ok_or(QueueError::Unknown(id))?;
            return Ok(f(&**self.local.get(cpu)?));
        }
        if let Some(cpu) = id.local_cpu() {
            return Ok(f(&**self.local.get(cpu)?));
        }
        if id.is_builtin() {
            return Err(QueueError::Unknown(id));
        }
        let dsq = self
            .user
            .read()
            .get(&id)
            .cloned()
            .ok_or(QueueError::Unknown(id))?;
        Ok(f(&dsq))
    }
}

impl fmt::Debug for DispatchQueues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchQueues")
            .field("user", &self.queue_ids())
            .field("global", &self.global)
            .field("max_queues", &self.max_queues)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

// === impl QueuedTask ===

impl QueuedTask {
    /// Returns the queued task.
    #[must_use]
    pub fn task(&self) -> &TaskRef {
        &self.task
    }

    /// Returns the time slice the task was enqueued with, in nanoseconds.
    #[must_use]
    pub fn slice(&self) -> u64 {
        self.slice
    }

    /// Returns the task's virtual time key, or 0 if it was enqueued in FIFO
    /// order.
    #[must_use]
    pub fn vtime(&self) -> u64 {
        self.vtime
    }

    /// Returns the flags the task was enqueued with.
    #[must_use]
    pub fn flags(&self) -> EnqFlags {
        self.flags
    }

    /// Consumes the entry, returning the owned task reference.
    pub fn into_task(self) -> TaskRef {
        self.task
    }
}

fn vtime_before(a: &QueuedTask, b: &QueuedTask) -> bool {
    a.vtime < b.vtime
}

// === impl Dsq ===

impl Dsq {
    fn new(id: DsqId, locality: Locality, capacity: usize) -> Self {
        Self {
            id,
            locality,
            nr: AtomicU32::new(0),
            destroyed: AtomicBool::new(false),
            inner: Mutex::new_with_raw_mutex(
                DsqInner {
                    arena: Arena::with_capacity(capacity),
                    fifo: List::new(),
                    vtime: Tree::new(vtime_before),
                },
                Spinlock::new(),
            ),
        }
    }

    /// Links `entry` into the queue, handing it back on failure.
    fn insert(&self, entry: QueuedTask, order: Order) -> Result<(), (QueueError, QueuedTask)> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        if self.destroyed.load(Relaxed) {
            return Err((QueueError::Unknown(self.id), entry));
        }
        let mismatch = match order {
            Order::Fifo => !inner.vtime.is_empty(),
            Order::Vtime(_) => !inner.fifo.is_empty(),
        };
        if mismatch {
            return Err((QueueError::OrderingMismatch(self.id), entry));
        }

        let head = entry.flags.get(EnqFlags::HEAD);
        let node = inner
            .arena
            .new_instance(entry)
            .map_err(|full| (QueueError::Full(self.id), full.into_inner()))?;
        let node_ref = node.node_ref();
        inner.arena[&node].task.set_queued(self.id, node_ref);
        let linked = match order {
            Order::Fifo if head => inner.fifo.push_front(&mut inner.arena, node),
            Order::Fifo => inner.fifo.push_back(&mut inner.arena, node),
            Order::Vtime(_) => inner.vtime.insert(&mut inner.arena, node),
        };
        if let Err(error) = linked {
            let entry = inner.arena.drop_instance(error.into_node());
            return Err((QueueError::Full(self.id), entry));
        }

        self.nr.fetch_add(1, Release);
        Ok(())
    }

    fn pop(&self) -> Option<QueuedTask> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let node = match inner.fifo.pop_front(&mut inner.arena) {
            Some(node) => node,
            None => inner.vtime.pop_first(&mut inner.arena)?,
        };
        self.nr.fetch_sub(1, Release);
        Some(inner.arena.drop_instance(node))
    }

    fn remove(&self, task: &TaskRef) -> Result<QueuedTask, UnlinkError> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let node_ref = task.node();
        // A task which has claimed this queue but not been linked yet still
        // carries the node of its previous entry, which may since have been
        // reused by another task.
        match inner.arena.get(node_ref) {
            Some(entry) if Ref::ptr_eq(&entry.task, task) => {}
            _ => return Err(UnlinkError::Stale),
        }
        let node = if inner.arena.container_of(node_ref) == Some(inner.fifo.id()) {
            inner.fifo.remove(&mut inner.arena, node_ref)?
        } else {
            inner.vtime.remove(&mut inner.arena, node_ref)?
        };
        self.nr.fetch_sub(1, Release);
        Ok(inner.arena.drop_instance(node))
    }

    fn drain(&self) -> Vec<QueuedTask> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let mut drained = Vec::with_capacity(inner.len());
        while let Some(node) = inner.fifo.pop_front(&mut inner.arena) {
            drained.push(inner.arena.drop_instance(node));
        }
        while let Some(node) = inner.vtime.pop_first(&mut inner.arena) {
            drained.push(inner.arena.drop_instance(node));
        }
        self.nr.store(0, Release);
        for entry in &drained {
            entry.task.clear_queued();
        }
        drained
    }
}

impl fmt::Debug for Dsq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dsq")
            .field("id", &self.id)
            .field("locality", &self.locality)
            .field("nr", &self.nr.load(Relaxed))
            .finish_non_exhaustive()
    }
}

impl DsqInner {
    fn len(&self) -> usize {
        self.fifo.len() + self.vtime.len()
    }
}

#[cfg(all(test, not(loom)))]
mod tests;
