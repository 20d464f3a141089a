//! An arena-backed, doubly-linked FIFO list.
//!
//! See the [`List`] type for details.
use crate::{
    arena::{Arena, Node, NodeRef},
    ContainerId, LinkError, UnlinkError,
};
use core::fmt;

/// A doubly-linked list of nodes stored in an [`Arena`].
///
/// The list itself stores only the head and tail indices and its length; all
/// links live in the arena. Every operation therefore takes the arena as an
/// argument. A list may only be used with nodes allocated by a single arena;
/// passing a different arena is detected when a node's generation does not
/// match, but is otherwise unspecified behavior (not undefined behavior).
///
/// Pushing a node transfers ownership of it into the list, and popping or
/// [removing](List::remove) a node transfers ownership back to the caller.
pub struct List<T> {
    id: ContainerId,
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
    _t: core::marker::PhantomData<fn(T)>,
}

/// An iterator over the nodes in a [`List`], front to back.
pub struct Iter<'a, T> {
    arena: &'a Arena<T>,
    curr: Option<u32>,
    len: usize,
}

const PREV: usize = 0;
const NEXT: usize = 1;

// === impl List ===

impl<T> List<T> {
    /// Returns a new, empty list.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: ContainerId::next(),
            head: None,
            tail: None,
            len: 0,
            _t: core::marker::PhantomData,
        }
    }

    /// Returns this list's [`ContainerId`].
    #[must_use]
    #[inline]
    pub fn id(&self) -> ContainerId {
        self.id
    }

    /// Returns the number of nodes in the list.
    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the list is empty.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        debug_assert_eq!(self.head.is_none(), self.len == 0);
        self.head.is_none()
    }

    /// Appends a node to the front of the list.
    pub fn push_front(&mut self, arena: &mut Arena<T>, node: Node<T>) -> Result<(), LinkError<T>> {
        let idx = arena.link(node, self.id)?;
        test_trace!(list = ?self.id, idx, "List::push_front");
        arena.set_link(idx, NEXT, self.head);
        match self.head {
            Some(head) => arena.set_link(head, PREV, Some(idx)),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
        self.len += 1;
        Ok(())
    }

    /// Appends a node to the back of the list.
    pub fn push_back(&mut self, arena: &mut Arena<T>, node: Node<T>) -> Result<(), LinkError<T>> {
        let idx = arena.link(node, self.id)?;
        test_trace!(list = ?self.id, idx, "List::push_back");
        arena.set_link(idx, PREV, self.tail);
        match self.tail {
            Some(tail) => arena.set_link(tail, NEXT, Some(idx)),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.len += 1;
        Ok(())
    }

    /// Removes the node at the front of the list, returning ownership of it.
    pub fn pop_front(&mut self, arena: &mut Arena<T>) -> Option<Node<T>> {
        let head = self.head?;
        test_trace!(list = ?self.id, head, "List::pop_front");
        Some(self.unlink(arena, head))
    }

    /// Removes the node at the back of the list, returning ownership of it.
    pub fn pop_back(&mut self, arena: &mut Arena<T>) -> Option<Node<T>> {
        let tail = self.tail?;
        test_trace!(list = ?self.id, tail, "List::pop_back");
        Some(self.unlink(arena, tail))
    }

    /// Removes an arbitrary node from the list, returning ownership of it.
    ///
    /// # Returns
    ///
    /// - [`Ok`]`(`[`Node`]`)` if `node` was linked into this list.
    /// - [`Err`]`(`[`UnlinkError`]`)` if `node` is stale, not linked, or
    ///   linked into a different container. The list is not modified.
    pub fn remove(&mut self, arena: &mut Arena<T>, node: NodeRef) -> Result<Node<T>, UnlinkError> {
        let idx = arena.linked_index(node, self.id)?;
        test_trace!(list = ?self.id, idx, "List::remove");
        Ok(self.unlink(arena, idx))
    }

    /// Returns a reference to the node at the front of the list.
    #[must_use]
    pub fn front(&self, arena: &Arena<T>) -> Option<NodeRef> {
        self.head.map(|idx| arena.node_ref(idx))
    }

    /// Returns a reference to the node at the back of the list.
    #[must_use]
    pub fn back(&self, arena: &Arena<T>) -> Option<NodeRef> {
        self.tail.map(|idx| arena.node_ref(idx))
    }

    /// Returns an iterator over the list's nodes, front to back.
    pub fn iter<'a>(&self, arena: &'a Arena<T>) -> Iter<'a, T> {
        Iter {
            arena,
            curr: self.head,
            len: self.len,
        }
    }

    /// Asserts that the list's links are consistent.
    ///
    /// # Panics
    ///
    /// If the list is corrupted.
    #[track_caller]
    pub fn assert_valid(&self, arena: &Arena<T>) {
        let Some(head) = self.head else {
            assert!(
                self.tail.is_none(),
                "if the list's head is empty, the tail must also be empty"
            );
            assert_eq!(self.len, 0, "an empty list must have length 0");
            return;
        };
        let tail = self
            .tail
            .expect("if the list has a head, it must also have a tail");
        assert_eq!(arena.link_at(head, PREV), None, "head must not have a prev link");
        assert_eq!(arena.link_at(tail, NEXT), None, "tail must not have a next link");

        let mut prev = None;
        let mut curr = Some(head);
        let mut n = 0;
        while let Some(idx) = curr {
            assert_eq!(
                arena.occupied(idx).owner,
                Some(self.id),
                "node {idx} must be owned by this list"
            );
            assert_eq!(arena.link_at(idx, PREV), prev, "node {idx} has a bad prev link");
            n += 1;
            assert!(n <= self.len, "list must not be linked in a loop");
            prev = curr;
            curr = arena.link_at(idx, NEXT);
        }
        assert_eq!(prev, Some(tail), "last node reached must be the tail");
        assert_eq!(n, self.len, "list length must match number of nodes");
    }

    fn unlink(&mut self, arena: &mut Arena<T>, idx: u32) -> Node<T> {
        let prev = arena.link_at(idx, PREV);
        let next = arena.link_at(idx, NEXT);
        match prev {
            Some(prev) => arena.set_link(prev, NEXT, next),
            None => self.head = next,
        }
        match next {
            Some(next) => arena.set_link(next, PREV, prev),
            None => self.tail = prev,
        }
        self.len -= 1;
        arena.unlink(idx)
    }
}

impl<T> Default for List<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for List<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("List")
            .field("id", &self.id)
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("len", &self.len)
            .finish()
    }
}

// === impl Iter ===

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (NodeRef, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.curr?;
        let occupied = self.arena.occupied(idx);
        self.curr = occupied.links[NEXT];
        self.len -= 1;
        Some((self.arena.node_ref(idx), &occupied.value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.len, Some(self.len))
    }
}

impl<T> ExactSizeIterator for Iter<'_, T> {}

impl<T> fmt::Debug for Iter<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iter")
            .field("curr", &self.curr)
            .field("len", &self.len)
            .finish()
    }
}
