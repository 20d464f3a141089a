//! Read-side sections.
//!
//! A [`ReadSection`] is the only way to look up tasks and cgroups without
//! touching their reference counts. The references it hands out are
//! [`Borrowed`], and cannot outlive the section. A borrowed reference which
//! needs to be kept must be upgraded to an owned [`Ref`](crate::Ref) with
//! [`Borrowed::acquire`].
//!
//! While a section is live, its thread is in an atomic context: sleepable
//! operations such as [`Runtime::setup`](crate::Runtime::setup) fail with
//! [`ConfigError::AtomicContext`](crate::ConfigError::AtomicContext).
use crate::{
    context::AtomicGuard,
    kobj::{Borrowed, Cgroup, ObjectTable, Task},
};
use core::fmt;

/// A scoped read-side section.
///
/// The section begins when it is created and ends when it is dropped, on
/// every exit path. It is `!Send`, so it always ends on the thread it began
/// on.
///
/// # Examples
///
/// ```
/// use mycosched::{kobj::{Cgroup, Task}, Config, DetachedHost, Runtime};
///
/// let rt = Runtime::load(Config::new(2), DetachedHost::new()).unwrap();
/// let root = Cgroup::root(Task::ROOT_CGROUP);
/// let child = Cgroup::child_of(&root, 7);
/// rt.cgroups().insert(root).unwrap();
/// rt.cgroups().insert(child).unwrap();
/// rt.tasks().insert(Task::new(42, 2).with_cgroup(7)).unwrap();
///
/// let section = rt.read_section();
/// let task = section.task(42).unwrap();
/// let cgroup = section.task_cgroup(&task).unwrap();
/// assert_eq!(cgroup.id(), 7);
/// let parent = section.cgroup_ancestor(&cgroup, 0).unwrap();
/// assert_eq!(parent.id(), Task::ROOT_CGROUP);
///
/// // Keep the task past the end of the section.
/// let owned = task.acquire().unwrap();
/// drop(section);
/// assert_eq!(owned.pid(), 42);
/// ```
pub struct ReadSection<'rt> {
    tasks: &'rt ObjectTable<Task>,
    cgroups: &'rt ObjectTable<Cgroup>,
    _guard: AtomicGuard,
}

impl<'rt> ReadSection<'rt> {
    pub(crate) fn new(tasks: &'rt ObjectTable<Task>, cgroups: &'rt ObjectTable<Cgroup>) -> Self {
        Self {
            tasks,
            cgroups,
            _guard: AtomicGuard::enter(),
        }
    }

    /// Looks up a task by pid.
    #[must_use]
    pub fn task(&self, pid: u64) -> Option<Borrowed<'_, Task>> {
        self.tasks.borrow(pid)
    }

    /// Looks up a cgroup by ID.
    #[must_use]
    pub fn cgroup(&self, id: u64) -> Option<Borrowed<'_, Cgroup>> {
        self.cgroups.borrow(id)
    }

    /// Returns the cgroup `task` belongs to.
    #[must_use]
    pub fn task_cgroup(&self, task: &Task) -> Option<Borrowed<'_, Cgroup>> {
        self.cgroup(task.cgroup_id())
    }

    /// Returns the ancestor of `cgroup` at `level` of the hierarchy.
    ///
    /// Level 0 is the root cgroup, and `cgroup.level()` is `cgroup` itself.
    /// Returns `None` if `level` is deeper than `cgroup`, or the ancestor is
    /// no longer registered.
    #[must_use]
    pub fn cgroup_ancestor(&self, cgroup: &Cgroup, level: usize) -> Option<Borrowed<'_, Cgroup>> {
        self.cgroup(cgroup.ancestor_id(level)?)
    }
}

impl fmt::Debug for ReadSection<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadSection")
            .field("tasks", &self.tasks.len())
            .field("cgroups", &self.cgroups.len())
            .finish_non_exhaustive()
    }
}
