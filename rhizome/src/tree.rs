//! An arena-backed ordered container.
//!
//! See the [`Tree`] type for details.
use crate::{
    arena::{Arena, Node, NodeRef},
    ContainerId, LinkError, UnlinkError,
};
use alloc::vec::Vec;
use core::fmt;
use rand::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro128PlusPlus;

/// An ordered container of nodes stored in an [`Arena`].
///
/// Nodes are kept sorted by a caller-provided strict "less than" function.
/// Nodes which compare equal are kept in insertion order, so a `Tree` whose
/// every node has the same key behaves exactly like a FIFO [`List`].
///
/// The tree is a treap: each node is given a random heap priority when it is
/// inserted, so [`insert`](Tree::insert), [`remove`](Tree::remove) and
/// [`pop_first`](Tree::pop_first) take expected *O*(log *n*) time regardless
/// of insertion order. The priorities come from a small PRNG seeded from the
/// tree's [`ContainerId`], so no entropy source is required.
///
/// As with [`List`], inserting a node transfers ownership of it into the tree,
/// and popping or removing it transfers ownership back.
///
/// [`List`]: crate::List
pub struct Tree<T> {
    id: ContainerId,
    root: Option<u32>,
    len: usize,
    seq: u64,
    rng: Xoshiro128PlusPlus,
    less: fn(&T, &T) -> bool,
}

/// An in-order iterator over the nodes in a [`Tree`].
pub struct Iter<'a, T> {
    arena: &'a Arena<T>,
    stack: Vec<u32>,
    len: usize,
}

const LEFT: usize = 0;
const RIGHT: usize = 1;

// === impl Tree ===

impl<T> Tree<T> {
    /// Returns a new, empty tree which orders its nodes using `less`.
    ///
    /// `less` must be a strict weak ordering. If it is not, removing a node by
    /// reference may fail with [`UnlinkError::Corrupted`].
    #[must_use]
    pub fn new(less: fn(&T, &T) -> bool) -> Self {
        let id = ContainerId::next();
        Self {
            id,
            root: None,
            len: 0,
            seq: 0,
            rng: Xoshiro128PlusPlus::seed_from_u64(id.as_u32() as u64),
            less,
        }
    }

    /// Returns this tree's [`ContainerId`].
    #[must_use]
    #[inline]
    pub fn id(&self) -> ContainerId {
        self.id
    }

    /// Returns the number of nodes in the tree.
    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the tree is empty.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Inserts a node, after any nodes that compare equal to it.
    pub fn insert(&mut self, arena: &mut Arena<T>, node: Node<T>) -> Result<(), LinkError<T>> {
        let idx = arena.link(node, self.id)?;
        {
            let occupied = arena.occupied_mut(idx);
            occupied.priority = self.rng.next_u32();
            occupied.seq = self.seq;
        }
        self.seq += 1;
        test_trace!(tree = ?self.id, idx, seq = self.seq - 1, "Tree::insert");

        let (before, after) = self.split(arena, self.root, idx);
        let left = Self::merge(arena, before, Some(idx));
        self.root = Self::merge(arena, left, after);
        self.len += 1;
        Ok(())
    }

    /// Returns a reference to the first node in order, without removing it.
    #[must_use]
    pub fn first(&self, arena: &Arena<T>) -> Option<NodeRef> {
        let mut curr = self.root?;
        while let Some(left) = arena.link_at(curr, LEFT) {
            curr = left;
        }
        Some(arena.node_ref(curr))
    }

    /// Removes the first node in order, returning ownership of it.
    pub fn pop_first(&mut self, arena: &mut Arena<T>) -> Option<Node<T>> {
        let root = self.root?;
        let first = match arena.link_at(root, LEFT) {
            None => {
                self.root = arena.link_at(root, RIGHT);
                root
            }
            Some(mut curr) => {
                let mut parent = root;
                while let Some(left) = arena.link_at(curr, LEFT) {
                    parent = curr;
                    curr = left;
                }
                let right = arena.link_at(curr, RIGHT);
                arena.set_link(parent, LEFT, right);
                curr
            }
        };
        test_trace!(tree = ?self.id, first, "Tree::pop_first");
        self.len -= 1;
        Some(arena.unlink(first))
    }

    /// Removes an arbitrary node from the tree, returning ownership of it.
    ///
    /// # Returns
    ///
    /// - [`Ok`]`(`[`Node`]`)` if `node` was linked into this tree.
    /// - [`Err`]`(`[`UnlinkError`]`)` if `node` is stale, not linked, or
    ///   linked into a different container. The tree is not modified.
    pub fn remove(&mut self, arena: &mut Arena<T>, node: NodeRef) -> Result<Node<T>, UnlinkError> {
        let idx = arena.linked_index(node, self.id)?;
        test_trace!(tree = ?self.id, idx, "Tree::remove");
        self.root = self.remove_from(arena, self.root, idx)?;
        self.len -= 1;
        Ok(arena.unlink(idx))
    }

    /// Returns an in-order iterator over the tree's nodes.
    pub fn iter<'a>(&self, arena: &'a Arena<T>) -> Iter<'a, T> {
        let mut iter = Iter {
            arena,
            stack: Vec::new(),
            len: self.len,
        };
        iter.push_left(self.root);
        iter
    }

    /// Asserts that the tree is correctly ordered, that its heap priorities
    /// are consistent, and that its length matches its contents.
    ///
    /// # Panics
    ///
    /// If the tree is corrupted.
    #[track_caller]
    pub fn assert_valid(&self, arena: &Arena<T>) {
        let mut prev: Option<u32> = None;
        let mut n = 0;
        let mut stack = Vec::new();
        let mut curr = self.root;
        loop {
            while let Some(idx) = curr {
                let node = arena.occupied(idx);
                assert_eq!(node.owner, Some(self.id), "node {idx} must be owned by this tree");
                for child in node.links.iter().flatten() {
                    assert!(
                        arena.occupied(*child).priority <= node.priority,
                        "child {child} must not have a higher priority than parent {idx}"
                    );
                }
                stack.push(idx);
                curr = node.links[LEFT];
            }
            let Some(idx) = stack.pop() else { break };
            if let Some(prev) = prev {
                assert!(
                    self.precedes(arena, prev, idx),
                    "node {prev} must precede node {idx}"
                );
            }
            n += 1;
            assert!(n <= self.len, "tree must not contain more nodes than its length");
            prev = Some(idx);
            curr = arena.link_at(idx, RIGHT);
        }
        assert_eq!(n, self.len, "tree length must match number of nodes");
    }

    /// Returns `true` if the node at `a` sorts strictly before the node at `b`.
    fn precedes(&self, arena: &Arena<T>, a: u32, b: u32) -> bool {
        let (a, b) = (arena.occupied(a), arena.occupied(b));
        if (self.less)(&a.value, &b.value) {
            return true;
        }
        !(self.less)(&b.value, &a.value) && a.seq < b.seq
    }

    /// Splits the subtree at `t` into the nodes that precede `key` and the
    /// rest.
    fn split(&self, arena: &mut Arena<T>, t: Option<u32>, key: u32) -> (Option<u32>, Option<u32>) {
        let Some(t) = t else {
            return (None, None);
        };
        if self.precedes(arena, t, key) {
            let right = arena.link_at(t, RIGHT);
            let (before, after) = self.split(arena, right, key);
            arena.set_link(t, RIGHT, before);
            (Some(t), after)
        } else {
            let left = arena.link_at(t, LEFT);
            let (before, after) = self.split(arena, left, key);
            arena.set_link(t, LEFT, after);
            (before, Some(t))
        }
    }

    /// Joins two subtrees, where every node in `a` precedes every node in `b`.
    fn merge(arena: &mut Arena<T>, a: Option<u32>, b: Option<u32>) -> Option<u32> {
        let (a, b) = match (a, b) {
            (None, b) => return b,
            (a, None) => return a,
            (Some(a), Some(b)) => (a, b),
        };
        if arena.occupied(a).priority > arena.occupied(b).priority {
            let right = arena.link_at(a, RIGHT);
            let right = Self::merge(arena, right, Some(b));
            arena.set_link(a, RIGHT, right);
            Some(a)
        } else {
            let left = arena.link_at(b, LEFT);
            let left = Self::merge(arena, Some(a), left);
            arena.set_link(b, LEFT, left);
            Some(b)
        }
    }

    fn remove_from(
        &self,
        arena: &mut Arena<T>,
        t: Option<u32>,
        idx: u32,
    ) -> Result<Option<u32>, UnlinkError> {
        let t = t.ok_or(UnlinkError::Corrupted)?;
        if t == idx {
            let (left, right) = (arena.link_at(t, LEFT), arena.link_at(t, RIGHT));
            return Ok(Self::merge(arena, left, right));
        }
        let which = if self.precedes(arena, idx, t) { LEFT } else { RIGHT };
        let child = arena.link_at(t, which);
        let child = self.remove_from(arena, child, idx)?;
        arena.set_link(t, which, child);
        Ok(Some(t))
    }
}

impl<T: Ord> Default for Tree<T> {
    fn default() -> Self {
        fn less<T: Ord>(a: &T, b: &T) -> bool {
            a < b
        }
        Self::new(less::<T>)
    }
}

impl<T> fmt::Debug for Tree<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tree")
            .field("id", &self.id)
            .field("root", &self.root)
            .field("len", &self.len)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

// === impl Iter ===

impl<T> Iter<'_, T> {
    fn push_left(&mut self, mut curr: Option<u32>) {
        while let Some(idx) = curr {
            self.stack.push(idx);
            curr = self.arena.link_at(idx, LEFT);
        }
    }
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (NodeRef, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.stack.pop()?;
        self.push_left(self.arena.link_at(idx, RIGHT));
        self.len -= 1;
        Some((self.arena.node_ref(idx), &self.arena.occupied(idx).value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.len, Some(self.len))
    }
}

impl<T> ExactSizeIterator for Iter<'_, T> {}

impl<T> fmt::Debug for Iter<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iter")
            .field("stack", &self.stack)
            .field("len", &self.len)
            .finish()
    }
}
