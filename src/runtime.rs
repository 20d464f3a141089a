//! A loaded scheduling policy's runtime state.
//!
//! A [`Runtime`] owns everything a policy uses, from the moment it is loaded
//! until it is unloaded: the dispatch queues, the idle tracker, the tables of
//! tasks and cgroups registered by the host, and the error reporter.
use crate::{
    config::Config,
    context,
    cpu::{CpuId, Topology},
    dispatch::Invocation,
    dsq::{DispatchQueues, DsqId, Locality, QueuedTask},
    error::{BoundsError, ConfigError, KickError, NotFound, QueueError},
    fault::{ErrorReporter, ExitInfo},
    flags::{KickFlags, WakeFlags},
    host::Host,
    idle::IdleTracker,
    kobj::{Cgroup, CgroupRef, ObjectTable, Task, TaskRef},
    rcu::ReadSection,
};
use core::fmt;
use std::sync::Arc;

/// The runtime state of a loaded scheduling policy.
///
/// # Examples
///
/// ```
/// use mycosched::{Config, DetachedHost, DsqId, EnqFlags, Locality, Runtime, kobj::Task};
///
/// let rt = Runtime::load(Config::new(4), DetachedHost::new()).unwrap();
/// let queue = DsqId::user(5).unwrap();
/// rt.setup().unwrap().create_queue(queue, Locality::Any).unwrap();
///
/// rt.tasks().insert(Task::new(1, 4)).unwrap();
/// let task = rt.lookup_task(1).unwrap();
///
/// let mut inv = rt.enter(0).unwrap();
/// inv.enqueue_fifo(queue, &task, 5_000_000, EnqFlags::NONE).unwrap();
/// assert!(inv.consume(queue));
/// drop(inv);
///
/// assert_eq!(rt.nr_queued(queue), Ok(0));
/// let next = rt.dsqs().pop_local(0).unwrap().unwrap();
/// assert_eq!(next.task().pid(), 1);
/// ```
pub struct Runtime {
    config: Config,
    topology: Topology,
    reporter: Arc<ErrorReporter>,
    dsqs: DispatchQueues,
    idle: IdleTracker,
    tasks: ObjectTable<Task>,
    cgroups: ObjectTable<Cgroup>,
}

/// The sleepable setup context.
///
/// Queues may only be created and destroyed through a `Setup`, which cannot
/// be obtained inside a read-side section or an invocation.
pub struct Setup<'rt> {
    rt: &'rt Runtime,
}

/// What remains after a [`Runtime`] is unloaded.
#[derive(Debug)]
pub struct Unloaded {
    /// Why the policy exited.
    pub exit: ExitInfo,
    /// Every task which was still held in a dispatch queue. These must be
    /// scheduled by the host's baseline scheduler.
    pub orphans: Vec<QueuedTask>,
}

// === impl Runtime ===

impl Runtime {
    /// Loads a policy runtime with the given configuration.
    ///
    /// # Returns
    ///
    /// - `Ok(Runtime)` if the configuration is valid.
    /// - [`ConfigError::InvalidTopology`] if it is not.
    pub fn load(config: Config, host: impl Host) -> Result<Self, ConfigError> {
        config.validate()?;
        let topology = Topology::new(&config);
        let reporter = Arc::new(ErrorReporter::new(Box::new(host), topology.nr_cpus()));
        let dsqs = DispatchQueues::new(&config, topology.clone(), reporter.clone());
        let idle = IdleTracker::new(topology.clone());
        tracing::info!(
            name = config.name().unwrap_or("<unnamed>"),
            nr_cpus = topology.nr_cpus(),
            threads_per_core = topology.threads_per_core(),
            nr_nodes = topology.nr_nodes(),
            max_queues = config.max_queues(),
            dispatch_batch = config.dispatch_batch(),
            "loaded scheduling policy"
        );
        Ok(Self {
            config,
            topology,
            reporter,
            dsqs,
            idle,
            tasks: ObjectTable::new(),
            cgroups: ObjectTable::new(),
        })
    }

    /// Enters the sleepable setup context.
    ///
    /// # Returns
    ///
    /// - [`ConfigError::AtomicContext`] if a read-side section or invocation
    ///   is live on this thread.
    /// - [`ConfigError::Disabled`] if the policy has been disabled.
    pub fn setup(&self) -> Result<Setup<'_>, ConfigError> {
        if context::in_atomic() {
            return Err(ConfigError::AtomicContext);
        }
        if !self.is_enabled() {
            return Err(ConfigError::Disabled);
        }
        Ok(Setup { rt: self })
    }

    /// Begins a decision-point invocation on behalf of `cpu`.
    pub fn enter(&self, cpu: CpuId) -> Result<Invocation<'_>, BoundsError> {
        self.topology.check(cpu)?;
        Ok(Invocation::new(self, cpu))
    }

    /// Begins a read-side section.
    pub fn read_section(&self) -> ReadSection<'_> {
        ReadSection::new(&self.tasks, &self.cgroups)
    }

    /// Returns the runtime's configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the CPU topology.
    #[must_use]
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Returns the table of tasks registered by the host.
    #[must_use]
    pub fn tasks(&self) -> &ObjectTable<Task> {
        &self.tasks
    }

    /// Returns the table of cgroups registered by the host.
    #[must_use]
    pub fn cgroups(&self) -> &ObjectTable<Cgroup> {
        &self.cgroups
    }

    /// Looks up a task by pid, acquiring a reference to it.
    pub fn lookup_task(&self, pid: u64) -> Result<TaskRef, NotFound> {
        self.tasks.lookup(pid)
    }

    /// Looks up a cgroup by ID, acquiring a reference to it.
    pub fn lookup_cgroup(&self, id: u64) -> Result<CgroupRef, NotFound> {
        self.cgroups.lookup(id)
    }

    /// Returns the cgroup `task` belongs to, acquiring a reference to it.
    pub fn task_cgroup(&self, task: &Task) -> Result<CgroupRef, NotFound> {
        self.lookup_cgroup(task.cgroup_id())
    }

    /// Returns the idle CPU tracker.
    #[must_use]
    pub fn idle(&self) -> &IdleTracker {
        &self.idle
    }

    /// Returns the dispatch queues.
    #[must_use]
    pub fn dsqs(&self) -> &DispatchQueues {
        &self.dsqs
    }

    /// Returns the error reporter.
    #[must_use]
    pub fn reporter(&self) -> &ErrorReporter {
        &self.reporter
    }

    /// Returns `true` if the policy has not been disabled by a fatal fault.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.reporter.is_enabled()
    }

    /// Returns the recorded exit, if the policy has been disabled.
    #[must_use]
    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.reporter.exit_info()
    }

    /// Returns the number of tasks in queue `id`.
    ///
    /// [`DsqId::LOCAL`] cannot be used here, as there is no invoking CPU.
    pub fn nr_queued(&self, id: DsqId) -> Result<u32, QueueError> {
        self.dsqs.nr_queued(id, None)
    }

    /// Asks the host to re-invoke the scheduling decision point on `cpu`.
    ///
    /// With [`KickFlags::IDLE`], the CPU is only kicked if it is idle.
    pub fn kick_cpu(&self, cpu: CpuId, flags: KickFlags) -> Result<(), KickError> {
        let busy = self.topology.check(cpu).is_ok() && !self.idle.is_idle(cpu);
        if flags.get(KickFlags::IDLE) && busy && self.is_enabled() {
            test_trace!(cpu, "not kicking busy CPU");
            return Ok(());
        }
        self.reporter.request_cpu_kick(cpu, flags)
    }

    /// Selects a CPU for a waking task, without policy input.
    ///
    /// This is the path the host falls back to once the policy is disabled,
    /// so it is never refused.
    pub fn select_cpu_default(&self, task: &Task, prev_cpu: CpuId, wake_flags: WakeFlags) -> CpuId {
        self.select_cpu_default_idle(context::current_cpu(), task, prev_cpu, wake_flags)
            .0
    }

    /// Selects a CPU for a waking task, also returning whether the CPU was
    /// claimed idle.
    ///
    /// `waker_cpu` is the CPU performing the wakeup, if any. In order:
    ///
    /// 1. A task allowed on only one CPU gets that CPU.
    /// 2. For a synchronous wakeup ([`WakeFlags::SYNC`]), the waker's CPU, if
    ///    the task may run there, its local queue is empty, and `prev_cpu` is
    ///    not idle.
    /// 3. With SMT, `prev_cpu` if its whole core is idle, then any CPU on a
    ///    wholly idle core.
    /// 4. `prev_cpu`, if it is idle.
    /// 5. Any idle allowed CPU.
    /// 6. `prev_cpu` if the task may run there, otherwise any allowed CPU.
    pub fn select_cpu_default_idle(
        &self,
        waker_cpu: Option<CpuId>,
        task: &Task,
        prev_cpu: CpuId,
        wake_flags: WakeFlags,
    ) -> (CpuId, bool) {
        let allowed = task.cpus_allowed();
        let idle = &self.idle;

        if allowed.weight() == 1 {
            if let Some(cpu) = allowed.first() {
                return (cpu, idle.try_claim_idle(cpu));
            }
        }

        if wake_flags.get(WakeFlags::SYNC) {
            if let Some(cpu) = waker_cpu {
                let local_empty = self.dsqs.nr_queued(DsqId::local_on(cpu), None) == Ok(0);
                if task.is_allowed(cpu) && local_empty && !idle.is_idle(prev_cpu) {
                    test_trace!(cpu, pid = task.pid(), "sync wakeup on waker CPU");
                    return (cpu, false);
                }
            }
        }

        if self.topology.smt_enabled() {
            let prev_core_idle = idle.snapshot_idle_smt().test(prev_cpu).unwrap_or(false);
            if prev_core_idle && task.is_allowed(prev_cpu) && idle.try_claim_idle(prev_cpu) {
                return (prev_cpu, true);
            }
            let smt_idle = idle.snapshot_idle_smt();
            let mut candidates = allowed.clone();
            if candidates.and(&allowed, &smt_idle) {
                drop(smt_idle);
                if let Some(cpu) = idle.pick_idle_cpu(&candidates, false) {
                    return (cpu, true);
                }
            }
        }

        if task.is_allowed(prev_cpu) && idle.try_claim_idle(prev_cpu) {
            return (prev_cpu, true);
        }

        if let Some(cpu) = idle.pick_idle_cpu(&allowed, false) {
            return (cpu, true);
        }

        if task.is_allowed(prev_cpu) {
            return (prev_cpu, false);
        }
        let cpu = allowed.pick_any().unwrap_or(prev_cpu);
        (cpu, false)
    }

    /// Unloads the policy.
    ///
    /// Every task still held in a dispatch queue is returned, so that the
    /// host's baseline scheduler loses no work.
    pub fn unload(self) -> Unloaded {
        let orphans = self.dsqs.drain_all();
        let exit = self.reporter.finish();
        tracing::info!(
            name = self.config.name().unwrap_or("<unnamed>"),
            kind = ?exit.kind,
            message = %exit.msg,
            orphans = orphans.len(),
            "unloaded scheduling policy"
        );
        Unloaded { exit, orphans }
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("reporter", &self.reporter)
            .field("dsqs", &self.dsqs)
            .field("idle", &self.idle)
            .field("tasks", &self.tasks)
            .field("cgroups", &self.cgroups)
            .finish()
    }
}

// === impl Setup ===

impl<'rt> Setup<'rt> {
    /// Returns the runtime being set up.
    #[must_use]
    pub fn runtime(&self) -> &'rt Runtime {
        self.rt
    }

    /// Creates a user dispatch queue.
    ///
    /// See [`ConfigError`] for the ways this may fail.
    pub fn create_queue(&mut self, id: DsqId, locality: Locality) -> Result<(), ConfigError> {
        self.rt.dsqs.create_queue(id, locality)
    }

    /// Destroys a user dispatch queue.
    ///
    /// Destroying a queue which still holds tasks is a fatal fault.
    pub fn destroy_queue(&mut self, id: DsqId) -> Result<(), QueueError> {
        self.rt.dsqs.destroy_queue(id)
    }

    /// Begins a read-side section.
    ///
    /// The section borrows the setup context, so queues cannot be created or
    /// destroyed until it ends.
    pub fn read_section(&mut self) -> ReadSection<'_> {
        self.rt.read_section()
    }
}

impl fmt::Debug for Setup<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Setup").finish_non_exhaustive()
    }
}
