use super::Object;
use crate::{cpu::CpuId, cpumask::Cpumask, dsq::DsqId};
use core::fmt;
use maitake_sync::blocking::RwLock;
use rhizome::NodeRef;
use std::sync::atomic::{
    AtomicBool, AtomicU32, AtomicU64, AtomicUsize,
    Ordering::{AcqRel, Acquire, Relaxed, Release},
};

/// A schedulable unit of work.
///
/// The host owns a task's identity and properties (pid, weight, affinity, and
/// cgroup). The remaining fields are owned by the scheduler: the policy's
/// time slice and virtual time, and the runtime's record of which dispatch
/// queue the task is linked into.
pub struct Task {
    pid: u64,
    weight: AtomicU32,
    cpus_allowed: RwLock<Cpumask>,
    cgroup: AtomicU64,

    slice: AtomicU64,
    dsq_vtime: AtomicU64,
    /// The raw ID of the queue this task is linked into, or `DsqId::INVALID`.
    queued: AtomicU64,
    /// The raw `NodeRef` of this task's entry in that queue.
    node: AtomicU64,
    cpu: AtomicUsize,
    running: AtomicBool,
}

impl Task {
    /// The default scheduling weight.
    pub const DEFAULT_WEIGHT: u32 = 100;

    /// The ID of the root cgroup, which tasks belong to by default.
    pub const ROOT_CGROUP: u64 = 1;

    /// Returns a new task which may run on any of `nr_cpus` CPUs.
    #[must_use]
    pub fn new(pid: u64, nr_cpus: usize) -> Self {
        Self {
            pid,
            weight: AtomicU32::new(Self::DEFAULT_WEIGHT),
            cpus_allowed: RwLock::new(Cpumask::full(nr_cpus)),
            cgroup: AtomicU64::new(Self::ROOT_CGROUP),
            slice: AtomicU64::new(0),
            dsq_vtime: AtomicU64::new(0),
            queued: AtomicU64::new(DsqId::INVALID.as_raw()),
            node: AtomicU64::new(0),
            cpu: AtomicUsize::new(0),
            running: AtomicBool::new(false),
        }
    }

    /// Sets the task's scheduling weight.
    #[must_use]
    pub fn with_weight(self, weight: u32) -> Self {
        self.weight.store(weight, Relaxed);
        self
    }

    /// Sets the task's CPU affinity.
    #[must_use]
    pub fn with_cpus_allowed(self, mask: Cpumask) -> Self {
        *self.cpus_allowed.write() = mask;
        self
    }

    /// Sets the cgroup the task belongs to.
    #[must_use]
    pub fn with_cgroup(self, cgroup: u64) -> Self {
        self.cgroup.store(cgroup, Relaxed);
        self
    }

    /// Returns the task's pid.
    #[must_use]
    #[inline]
    pub fn pid(&self) -> u64 {
        self.pid
    }

    /// Returns the task's scheduling weight.
    #[must_use]
    pub fn weight(&self) -> u32 {
        self.weight.load(Relaxed)
    }

    /// Changes the task's scheduling weight.
    pub fn set_weight(&self, weight: u32) {
        self.weight.store(weight, Relaxed);
    }

    /// Returns a copy of the task's CPU affinity mask.
    #[must_use]
    pub fn cpus_allowed(&self) -> Cpumask {
        self.cpus_allowed.read().clone()
    }

    /// Changes the task's CPU affinity.
    pub fn set_cpus_allowed(&self, mask: Cpumask) {
        *self.cpus_allowed.write() = mask;
    }

    /// Returns `true` if the task may run on `cpu`.
    ///
    /// Out-of-range CPUs are never allowed.
    #[must_use]
    pub fn is_allowed(&self, cpu: CpuId) -> bool {
        self.cpus_allowed.read().test(cpu).unwrap_or(false)
    }

    /// Returns the ID of the task's cgroup.
    #[must_use]
    pub fn cgroup_id(&self) -> u64 {
        self.cgroup.load(Relaxed)
    }

    /// Moves the task to another cgroup.
    pub fn set_cgroup(&self, cgroup: u64) {
        self.cgroup.store(cgroup, Relaxed);
    }

    /// Returns the time slice most recently assigned to the task, in
    /// nanoseconds.
    #[must_use]
    pub fn slice(&self) -> u64 {
        self.slice.load(Relaxed)
    }

    /// Sets the task's time slice, in nanoseconds.
    pub fn set_slice(&self, slice: u64) {
        self.slice.store(slice, Relaxed);
    }

    /// Returns the task's virtual time.
    #[must_use]
    pub fn dsq_vtime(&self) -> u64 {
        self.dsq_vtime.load(Relaxed)
    }

    /// Sets the task's virtual time.
    pub fn set_dsq_vtime(&self, vtime: u64) {
        self.dsq_vtime.store(vtime, Relaxed);
    }

    /// Returns the dispatch queue the task is linked into, if any.
    #[must_use]
    pub fn queued_on(&self) -> Option<DsqId> {
        let id = DsqId::from_raw(self.queued.load(Acquire));
        (id != DsqId::INVALID).then_some(id)
    }

    /// Returns the CPU the task last ran on.
    #[must_use]
    pub fn cpu(&self) -> CpuId {
        self.cpu.load(Relaxed)
    }

    /// Returns `true` if the task is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Acquire)
    }

    /// Claims the task for queue `id`.
    ///
    /// Fails with the queue the task is already linked into.
    pub(crate) fn claim_queue(&self, id: DsqId) -> Result<(), DsqId> {
        self.queued
            .compare_exchange(DsqId::INVALID.as_raw(), id.as_raw(), AcqRel, Acquire)
            .map(|_| ())
            .map_err(DsqId::from_raw)
    }

    /// Records that the task moved to queue `id` at `node`.
    pub(crate) fn set_queued(&self, id: DsqId, node: NodeRef) {
        self.node.store(node.into_raw(), Relaxed);
        self.queued.store(id.as_raw(), Release);
    }

    pub(crate) fn node(&self) -> NodeRef {
        NodeRef::from_raw(self.node.load(Acquire))
    }

    /// Records that the task is no longer linked into any queue.
    pub(crate) fn clear_queued(&self) {
        self.queued.store(DsqId::INVALID.as_raw(), Release);
    }

    pub(crate) fn set_running(&self, cpu: CpuId, running: bool) {
        self.cpu.store(cpu, Relaxed);
        self.running.store(running, Release);
    }
}

impl Object for Task {
    const KIND: &'static str = "task";

    fn id(&self) -> u64 {
        self.pid
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("pid", &self.pid)
            .field("weight", &self.weight())
            .field("cgroup", &self.cgroup_id())
            .field("queued_on", &self.queued_on())
            .field("cpu", &self.cpu())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
