//! Refcounted handles to tasks, cgroups, and cpumasks.
//!
//! Every object owned by the host is wrapped in a [`Ref`], an owned, counted
//! reference. Acquiring a `Ref` increments the object's count, and releasing
//! (or dropping) it decrements the count. The object is released exactly when
//! its count reaches zero; after that, it can no longer be looked up, and
//! [`Borrowed`] references to it can no longer be upgraded.
//!
//! [`Borrowed`] references are obtained inside a
//! [`ReadSection`](crate::ReadSection). They do not touch the object's count,
//! and cannot outlive the section that produced them.
use crate::{
    error::{ConfigError, NotFound},
    loom::sync::{
        atomic::{
            self, AtomicUsize,
            Ordering::{Acquire, Relaxed, Release},
        },
        Arc,
    },
};
use core::{fmt, marker::PhantomData, ops::Deref};
use maitake_sync::blocking::RwLock;
use std::collections::HashMap;

mod cgroup;
mod task;

pub use self::{cgroup::Cgroup, task::Task};

/// An object which can be registered in an [`ObjectTable`].
pub trait Object: Send + Sync + 'static {
    /// A human-readable name for this kind of object, used in errors.
    const KIND: &'static str;

    /// Returns this object's ID.
    fn id(&self) -> u64;
}

/// An owned, counted reference to an object.
///
/// A `Ref` keeps the object alive (and its count above zero) until it is
/// [released](Ref::release) or dropped.
#[must_use = "dropping a `Ref` releases it"]
pub struct Ref<T> {
    obj: Arc<Kobj<T>>,
}

/// An owned, counted reference to a [`Task`].
pub type TaskRef = Ref<Task>;

/// An owned, counted reference to a [`Cgroup`].
pub type CgroupRef = Ref<Cgroup>;

/// An uncounted reference to an object, valid for the duration of a
/// [`ReadSection`](crate::ReadSection).
///
/// A `Borrowed` reference may be upgraded to an owned [`Ref`] with
/// [`Borrowed::acquire`], which fails if the object has already been released.
pub struct Borrowed<'section, T> {
    obj: Arc<Kobj<T>>,
    _section: PhantomData<(&'section (), *const ())>,
}

/// A table of registered objects, indexed by ID.
///
/// The table holds one reference to each registered object.
pub struct ObjectTable<T> {
    objs: RwLock<HashMap<u64, Ref<T>>>,
}

pub(crate) struct Kobj<T> {
    refs: RefCount,
    value: T,
}

struct RefCount(AtomicUsize);

const REF_MAX: usize = isize::MAX as usize;

// === impl RefCount ===

impl RefCount {
    fn new() -> Self {
        Self(AtomicUsize::new(1))
    }

    fn clone_ref(&self) {
        // Knowledge of an existing reference prevents other threads from
        // releasing the object, so a relaxed increment is sufficient.
        let old_refs = test_dbg!(self.0.fetch_add(1, Relaxed));
        if old_refs > REF_MAX {
            panic!("object reference count overflow");
        }
    }

    /// Increments the count, unless it has already reached zero.
    fn try_clone_ref(&self) -> bool {
        let mut refs = self.0.load(Relaxed);
        loop {
            if test_dbg!(refs) == 0 {
                return false;
            }
            if refs > REF_MAX {
                panic!("object reference count overflow");
            }
            match self.0.compare_exchange_weak(refs, refs + 1, Acquire, Relaxed) {
                Ok(_) => return true,
                Err(actual) => refs = actual,
            }
        }
    }

    /// Decrements the count, returning `true` if this was the last reference.
    fn drop_ref(&self) -> bool {
        let old_refs = test_dbg!(self.0.fetch_sub(1, Release));
        if old_refs > 1 {
            return false;
        }

        // Owned references are move-only, so the count cannot be released
        // more times than it was acquired.
        debug_assert_ne!(old_refs, 0, "object reference count underflow");
        atomic::fence(Acquire);
        true
    }

    fn load(&self) -> usize {
        self.0.load(Acquire)
    }
}

// === impl Ref ===

impl<T> Ref<T> {
    /// Wraps `value` in a new object with a count of one.
    pub(crate) fn new(value: T) -> Self {
        Self {
            obj: Arc::new(Kobj {
                refs: RefCount::new(),
                value,
            }),
        }
    }

    /// Acquires another owned reference to the same object.
    ///
    /// # Panics
    ///
    /// If the count would overflow.
    pub fn acquire(&self) -> Self {
        self.obj.refs.clone_ref();
        Self {
            obj: self.obj.clone(),
        }
    }

    /// Releases this reference.
    ///
    /// This is equivalent to dropping it.
    pub fn release(self) {
        drop(self);
    }

    /// Returns the object's current count.
    #[must_use]
    pub fn refs(&self) -> usize {
        self.obj.refs.load()
    }

    /// Returns a mutable reference to the object, if this is the only
    /// reference to it.
    #[must_use]
    pub fn get_mut(&mut self) -> Option<&mut T> {
        Arc::get_mut(&mut self.obj).map(|obj| &mut obj.value)
    }

    /// Returns `true` if `a` and `b` refer to the same object.
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.obj, &b.obj)
    }

    pub(crate) fn borrowed<'section>(&self) -> Borrowed<'section, T> {
        Borrowed::new(self.obj.clone())
    }
}

impl<T> Deref for Ref<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.obj.value
    }
}

impl<T> Drop for Ref<T> {
    fn drop(&mut self) {
        if self.obj.refs.drop_ref() {
            test_trace!("released last reference");
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ref")
            .field("refs", &self.refs())
            .field("value", &self.obj.value)
            .finish()
    }
}

// === impl Borrowed ===

impl<T> Borrowed<'_, T> {
    fn new(obj: Arc<Kobj<T>>) -> Self {
        Self {
            obj,
            _section: PhantomData,
        }
    }

    /// Upgrades this borrowed reference to an owned [`Ref`].
    ///
    /// Returns `None` if the object's count has already reached zero.
    #[must_use]
    pub fn acquire(&self) -> Option<Ref<T>> {
        if !self.obj.refs.try_clone_ref() {
            return None;
        }
        Some(Ref {
            obj: self.obj.clone(),
        })
    }

    /// Returns `true` if the object has been released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.obj.refs.load() == 0
    }
}

impl<T> Deref for Borrowed<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.obj.value
    }
}

impl<T: fmt::Debug> fmt::Debug for Borrowed<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Borrowed")
            .field("refs", &self.obj.refs.load())
            .field("value", &self.obj.value)
            .finish()
    }
}

// === impl ObjectTable ===

impl<T: Object> ObjectTable<T> {
    /// Returns a new, empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            objs: RwLock::new(HashMap::new()),
        }
    }

    /// Registers an object.
    ///
    /// The table holds a reference to the object until it is
    /// [removed](ObjectTable::remove).
    pub fn insert(&self, value: T) -> Result<(), ConfigError> {
        let id = value.id();
        let mut objs = self.objs.write();
        if objs.contains_key(&id) {
            return Err(ConfigError::DuplicateObject { kind: T::KIND, id });
        }
        objs.insert(id, Ref::new(value));
        tracing::debug!(kind = T::KIND, id, "registered object");
        Ok(())
    }

    /// Unregisters an object, releasing the table's reference to it.
    ///
    /// If no other references remain, the object is released.
    pub fn remove(&self, id: u64) -> Result<(), NotFound> {
        let obj = self
            .objs
            .write()
            .remove(&id)
            .ok_or(NotFound { kind: T::KIND, id })?;
        tracing::debug!(kind = T::KIND, id, refs = obj.refs() - 1, "unregistered object");
        drop(obj);
        Ok(())
    }

    /// Looks up an object by ID, acquiring an owned reference to it.
    pub fn lookup(&self, id: u64) -> Result<Ref<T>, NotFound> {
        self.objs
            .read()
            .get(&id)
            .map(Ref::acquire)
            .ok_or(NotFound { kind: T::KIND, id })
    }

    /// Returns `true` if an object with this ID is registered.
    #[must_use]
    pub fn contains(&self, id: u64) -> bool {
        self.objs.read().contains_key(&id)
    }

    /// Returns the number of registered objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objs.read().len()
    }

    /// Returns `true` if no objects are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn borrow<'section>(&self, id: u64) -> Option<Borrowed<'section, T>> {
        self.objs.read().get(&id).map(|obj| obj.borrowed())
    }
}

impl<T: Object> Default for ObjectTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for ObjectTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectTable")
            .field("len", &self.objs.read().len())
            .finish()
    }
}
