//! A bounded pool of container nodes, addressed by generation-checked
//! indices.
//!
//! See the [`Arena`] type for details.
use crate::{ContainerId, LinkError, PoolExhausted, UnlinkError};
use alloc::vec::Vec;
use core::{
    fmt,
    marker::PhantomData,
    ops,
    sync::atomic::{AtomicU32, Ordering::Relaxed},
};

/// A pool of nodes that may be linked into [`List`]s and [`Tree`]s.
///
/// An `Arena` owns the storage for every node, and the containers store only
/// indices into it. Each slot carries a *generation* counter, which is bumped
/// whenever the slot is returned to the pool. A [`NodeRef`] records the
/// generation it was created with, so a reference that outlives its node is
/// detected as [stale](UnlinkError::Stale) rather than silently aliasing
/// whatever was allocated into the slot afterwards.
///
/// Ownership of a node moves between the caller and the containers:
///
/// - [`Arena::new_instance`] returns an owned [`Node`] handle,
/// - pushing or inserting a node into a container consumes the handle,
/// - popping or removing a node from a container returns a handle again,
/// - [`Arena::drop_instance`] consumes a handle and returns the value.
///
/// Because a [`Node`] handle exists only while the node is *not* linked into a
/// container, a node can never be linked into two containers at once, and it
/// can never be dropped while still linked.
///
/// [`List`]: crate::List
/// [`Tree`]: crate::Tree
pub struct Arena<T> {
    /// Assigned when the first node is allocated, so that `new` can be
    /// `const`. Zero until then.
    id: u32,
    slots: Vec<Slot<T>>,
    free: Option<u32>,
    len: usize,
    capacity: usize,
}

/// An owned handle to an unlinked node in an [`Arena`].
///
/// This type is intentionally neither `Clone` nor `Copy`: holding a `Node` is
/// what it means to own the node. Dropping a `Node` without passing it to
/// [`Arena::drop_instance`] or a container leaks its slot until the arena
/// itself is dropped.
#[must_use = "a `Node` must be linked into a container or returned to its `Arena`"]
pub struct Node<T> {
    /// The ID of the arena that allocated this node.
    arena: u32,
    raw: NodeRef,
    _owns: PhantomData<fn() -> T>,
}

/// A copyable, non-owning reference to a node in an [`Arena`].
///
/// A `NodeRef` may be used to look at a node, or to remove it from the
/// container it is linked into. Every use is checked against the slot's
/// current generation.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct NodeRef {
    index: u32,
    generation: u32,
}

mycelium_bitfield::bitfield! {
    /// Packed form of a [`NodeRef`], so it can be stored in a single atomic
    /// word.
    struct RawNodeRef<u64> {
        const INDEX = 32;
        const GENERATION = 32;
    }
}

struct Slot<T> {
    generation: u32,
    entry: Entry<T>,
}

enum Entry<T> {
    Free { next: Option<u32> },
    Occupied(Occupied<T>),
}

/// An allocated slot.
pub(crate) struct Occupied<T> {
    pub(crate) value: T,
    /// The container this node is linked into, if any.
    pub(crate) owner: Option<ContainerId>,
    /// `[prev, next]` for lists, `[left, right]` for trees.
    pub(crate) links: [Option<u32>; 2],
    /// Heap priority, used by trees only.
    pub(crate) priority: u32,
    /// Insertion sequence number, used by trees only.
    pub(crate) seq: u64,
}

// === impl Arena ===

impl<T> Arena<T> {
    /// The largest number of nodes any arena may hold.
    pub const MAX_CAPACITY: usize = u32::MAX as usize;

    /// Returns a new, empty arena bounded only by [`Arena::MAX_CAPACITY`].
    #[must_use]
    pub const fn new() -> Self {
        Self::with_capacity(Self::MAX_CAPACITY)
    }

    /// Returns a new, empty arena which will hold at most `capacity` nodes.
    ///
    /// Storage is grown on demand, but never beyond `capacity`; once the pool
    /// is full, [`Arena::new_instance`] fails with [`PoolExhausted`].
    #[must_use]
    pub const fn with_capacity(capacity: usize) -> Self {
        let capacity = if capacity > Self::MAX_CAPACITY {
            Self::MAX_CAPACITY
        } else {
            capacity
        };
        Self {
            id: 0,
            slots: Vec::new(),
            free: None,
            len: 0,
            capacity,
        }
    }

    /// Returns the number of live nodes (linked or not).
    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the arena contains no live nodes.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the maximum number of nodes this arena will hold.
    #[must_use]
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Allocates a new node holding `value`.
    ///
    /// # Returns
    ///
    /// - [`Ok`]`(`[`Node`]`)` owning the newly allocated, unlinked node.
    /// - [`Err`]`(`[`PoolExhausted`]`)` containing `value`, if the arena is
    ///   already holding [`capacity`](Arena::capacity) nodes.
    pub fn new_instance(&mut self, value: T) -> Result<Node<T>, PoolExhausted<T>> {
        if self.len >= self.capacity {
            return Err(PoolExhausted(value));
        }
        if self.id == 0 {
            self.id = next_arena_id();
        }

        let occupied = Entry::Occupied(Occupied {
            value,
            owner: None,
            links: [None, None],
            priority: 0,
            seq: 0,
        });

        let index = match self.free {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                let Entry::Free { next } = slot.entry else {
                    unreachable!("free list points at occupied slot {index}");
                };
                self.free = next;
                slot.entry = occupied;
                index
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    entry: occupied,
                });
                index
            }
        };

        self.len += 1;
        let generation = self.slots[index as usize].generation;
        test_trace!(index, generation, len = self.len, "Arena::new_instance");
        Ok(Node::new(self.id, NodeRef { index, generation }))
    }

    /// Returns an unlinked node to the pool, returning its value.
    ///
    /// Linked nodes have no [`Node`] handle, so they must first be popped or
    /// removed from their container. Every outstanding [`NodeRef`] to the node
    /// becomes [stale](UnlinkError::Stale).
    ///
    /// # Panics
    ///
    /// If `node` was allocated by a different arena.
    pub fn drop_instance(&mut self, node: Node<T>) -> T {
        let NodeRef { index, generation } = node.raw;
        let ours = node.arena == self.id;
        let slot = self
            .slots
            .get_mut(index as usize)
            .filter(|slot| ours && slot.generation == generation);
        let Some(slot) = slot else {
            panic!("node {:?} was not allocated by this arena", node.raw);
        };

        let entry = core::mem::replace(&mut slot.entry, Entry::Free { next: self.free });
        let Entry::Occupied(occupied) = entry else {
            panic!("node {:?} was not allocated by this arena", node.raw);
        };
        debug_assert!(
            occupied.owner.is_none(),
            "a `Node` handle existed for a linked node; this is a bug in rhizome"
        );

        slot.generation = slot.generation.wrapping_add(1);
        self.free = Some(index);
        self.len -= 1;
        test_trace!(index, generation, len = self.len, "Arena::drop_instance");
        occupied.value
    }

    /// Returns a reference to the value of the node referenced by `node`, if
    /// it is still live.
    #[must_use]
    pub fn get(&self, node: NodeRef) -> Option<&T> {
        self.live(node).map(|occupied| &occupied.value)
    }

    /// Returns a mutable reference to the value of the node referenced by
    /// `node`, if it is still live.
    ///
    /// Mutating a node that is linked into a [`Tree`](crate::Tree) in a way
    /// that changes its ordering will not move it; remove and re-insert it
    /// instead.
    #[must_use]
    pub fn get_mut(&mut self, node: NodeRef) -> Option<&mut T> {
        let slot = self.slots.get_mut(node.index as usize)?;
        if slot.generation != node.generation {
            return None;
        }
        match &mut slot.entry {
            Entry::Occupied(occupied) => Some(&mut occupied.value),
            Entry::Free { .. } => None,
        }
    }

    /// Returns `true` if `node` is live and currently linked into a container.
    #[must_use]
    pub fn is_linked(&self, node: NodeRef) -> bool {
        self.container_of(node).is_some()
    }

    /// Returns the ID of the container `node` is linked into, if any.
    #[must_use]
    pub fn container_of(&self, node: NodeRef) -> Option<ContainerId> {
        self.live(node).and_then(|occupied| occupied.owner)
    }

    fn live(&self, node: NodeRef) -> Option<&Occupied<T>> {
        let slot = self.slots.get(node.index as usize)?;
        if slot.generation != node.generation {
            return None;
        }
        match &slot.entry {
            Entry::Occupied(occupied) => Some(occupied),
            Entry::Free { .. } => None,
        }
    }

    // === container internals ===

    /// Marks `node` as linked into `owner`, returning its index.
    pub(crate) fn link(&mut self, node: Node<T>, owner: ContainerId) -> Result<u32, LinkError<T>> {
        if node.arena != self.id {
            return Err(LinkError { node });
        }
        let NodeRef { index, generation } = node.raw;
        let slot = match self.slots.get_mut(index as usize) {
            Some(slot) if slot.generation == generation => slot,
            _ => return Err(LinkError { node }),
        };
        match &mut slot.entry {
            Entry::Occupied(occupied) if occupied.owner.is_none() => {
                occupied.owner = Some(owner);
                occupied.links = [None, None];
                Ok(index)
            }
            _ => Err(LinkError { node }),
        }
    }

    /// Marks the node at `index` as unlinked, returning an owned handle.
    ///
    /// The caller must already have removed every link to `index` from its
    /// container.
    pub(crate) fn unlink(&mut self, index: u32) -> Node<T> {
        let generation = self.slots[index as usize].generation;
        let occupied = self.occupied_mut(index);
        occupied.owner = None;
        occupied.links = [None, None];
        Node::new(self.id, NodeRef { index, generation })
    }

    /// Checks that `node` is live and linked into `owner`, returning its index.
    pub(crate) fn linked_index(&self, node: NodeRef, owner: ContainerId) -> Result<u32, UnlinkError> {
        let occupied = self.live(node).ok_or(UnlinkError::Stale)?;
        match occupied.owner {
            Some(id) if id == owner => Ok(node.index),
            Some(id) => Err(UnlinkError::OtherContainer(id)),
            None => Err(UnlinkError::NotLinked),
        }
    }

    pub(crate) fn node_ref(&self, index: u32) -> NodeRef {
        NodeRef {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    pub(crate) fn occupied(&self, index: u32) -> &Occupied<T> {
        match &self.slots[index as usize].entry {
            Entry::Occupied(occupied) => occupied,
            Entry::Free { .. } => unreachable!("linked index {index} refers to a free slot"),
        }
    }

    pub(crate) fn occupied_mut(&mut self, index: u32) -> &mut Occupied<T> {
        match &mut self.slots[index as usize].entry {
            Entry::Occupied(occupied) => occupied,
            Entry::Free { .. } => unreachable!("linked index {index} refers to a free slot"),
        }
    }

    #[inline]
    pub(crate) fn link_at(&self, index: u32, which: usize) -> Option<u32> {
        self.occupied(index).links[which]
    }

    #[inline]
    pub(crate) fn set_link(&mut self, index: u32, which: usize, to: Option<u32>) {
        self.occupied_mut(index).links[which] = to;
    }

    #[track_caller]
    fn owned_index(&self, node: &Node<T>) -> u32 {
        assert_eq!(
            node.arena, self.id,
            "node {:?} was not allocated by this arena",
            node.raw
        );
        node.raw.index
    }
}

fn next_arena_id() -> u32 {
    static NEXT_ID: AtomicU32 = AtomicU32::new(1);
    let id = NEXT_ID.fetch_add(1, Relaxed);
    debug_assert!(id > 0, "arena ID counter should not overflow!");
    id
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ops::Index<&Node<T>> for Arena<T> {
    type Output = T;

    fn index(&self, node: &Node<T>) -> &T {
        &self.occupied(self.owned_index(node)).value
    }
}

impl<T> ops::IndexMut<&Node<T>> for Arena<T> {
    fn index_mut(&mut self, node: &Node<T>) -> &mut T {
        let index = self.owned_index(node);
        &mut self.occupied_mut(index).value
    }
}

impl<T> fmt::Debug for Arena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("id", &self.id)
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("slots", &self.slots.len())
            .field("free", &self.free)
            .finish()
    }
}

// === impl Node ===

impl<T> Node<T> {
    fn new(arena: u32, raw: NodeRef) -> Self {
        Self {
            arena,
            raw,
            _owns: PhantomData,
        }
    }

    /// Returns a non-owning [`NodeRef`] to this node.
    #[must_use]
    #[inline]
    pub fn node_ref(&self) -> NodeRef {
        self.raw
    }
}

impl<T> fmt::Debug for Node<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("arena", &self.arena)
            .field("raw", &self.raw)
            .finish()
    }
}

// === impl NodeRef ===

impl NodeRef {
    /// Packs this reference into a single `u64`.
    #[must_use]
    pub fn into_raw(self) -> u64 {
        RawNodeRef::new()
            .with(RawNodeRef::INDEX, self.index as u64)
            .with(RawNodeRef::GENERATION, self.generation as u64)
            .0
    }

    /// Unpacks a reference produced by [`NodeRef::into_raw`].
    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        let raw = RawNodeRef::from_bits(raw);
        Self {
            index: raw.get(RawNodeRef::INDEX) as u32,
            generation: raw.get(RawNodeRef::GENERATION) as u32,
        }
    }

    /// Returns the slot index this reference points at.
    #[must_use]
    #[inline]
    pub fn index(self) -> u32 {
        self.index
    }

    /// Returns the slot generation this reference was created for.
    #[must_use]
    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeRef({}v{})", self.index, self.generation)
    }
}
