use super::Object;

/// A group of tasks in the cgroup hierarchy.
///
/// A cgroup records the IDs of all of its ancestors, so that an ancestor at
/// any level can be found without walking the hierarchy.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Cgroup {
    id: u64,
    /// `ancestors[level]` is the ID of the ancestor at `level`; the last entry
    /// is this cgroup's own ID.
    ancestors: Vec<u64>,
}

impl Cgroup {
    /// Returns the root cgroup, at level 0.
    #[must_use]
    pub fn root(id: u64) -> Self {
        Self {
            id,
            ancestors: vec![id],
        }
    }

    /// Returns a new child of `parent`.
    #[must_use]
    pub fn child_of(parent: &Cgroup, id: u64) -> Self {
        let mut ancestors = parent.ancestors.clone();
        ancestors.push(id);
        Self { id, ancestors }
    }

    /// Returns the cgroup's ID.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the cgroup's depth in the hierarchy. The root is at level 0.
    #[must_use]
    pub fn level(&self) -> usize {
        self.ancestors.len() - 1
    }

    /// Returns the ID of this cgroup's ancestor at `level`.
    ///
    /// A cgroup is its own ancestor at its own level.
    #[must_use]
    pub fn ancestor_id(&self, level: usize) -> Option<u64> {
        self.ancestors.get(level).copied()
    }

    /// Returns the ID of this cgroup's parent, if it is not the root.
    #[must_use]
    pub fn parent_id(&self) -> Option<u64> {
        self.level().checked_sub(1).and_then(|level| self.ancestor_id(level))
    }
}

impl Object for Cgroup {
    const KIND: &'static str = "cgroup";

    fn id(&self) -> u64 {
        self.id
    }
}
