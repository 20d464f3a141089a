#![cfg_attr(docsrs, doc = include_str!("../README.md"))]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![cfg_attr(not(any(feature = "std", test)), no_std)]
#![warn(missing_debug_implementations)]

extern crate alloc;

#[macro_use]
pub(crate) mod util;

pub mod arena;
pub mod list;
pub mod tree;

#[doc(inline)]
pub use self::arena::{Arena, Node, NodeRef};
#[doc(inline)]
pub use self::list::List;
#[doc(inline)]
pub use self::tree::Tree;

use core::{
    fmt,
    sync::atomic::{AtomicU32, Ordering::Relaxed},
};

/// Identifies a single [`List`] or [`Tree`].
///
/// Every container gets a fresh `ContainerId` when it is constructed, and a
/// node that is linked into a container records the container's ID. This is
/// what allows [`List::remove`] and [`Tree::remove`] to reject a [`NodeRef`]
/// that is linked into some *other* container, rather than corrupting both.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct ContainerId(u32);

/// Returned by [`Arena::new_instance`] when the pool is at capacity.
///
/// The value that could not be placed in the pool is handed back.
pub struct PoolExhausted<T>(pub T);

/// Returned when a [`Node`] could not be linked into a container.
///
/// This happens when a node is passed to a container together with an
/// [`Arena`] other than the one that allocated it. The node is handed back.
pub struct LinkError<T> {
    node: Node<T>,
}

/// Errors returned when removing a node from a container by [`NodeRef`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum UnlinkError {
    /// The reference's generation does not match its slot: the node was
    /// dropped, and the slot may since have been reused.
    Stale,
    /// The node is live, but it is not linked into any container.
    NotLinked,
    /// The node is linked into a different container.
    OtherContainer(ContainerId),
    /// The node claims to be linked into this container, but the container
    /// could not find it. This means the ordering function is not a total
    /// order, or the container's links were corrupted.
    Corrupted,
}

// === impl ContainerId ===

impl ContainerId {
    pub(crate) fn next() -> Self {
        // ID 0 is never handed out, so that a zeroed ID is obviously bogus.
        static NEXT_ID: AtomicU32 = AtomicU32::new(1);
        let id = NEXT_ID.fetch_add(1, Relaxed);
        debug_assert!(id > 0, "container ID counter should not overflow!");
        Self(id)
    }

    /// Returns the raw numeric value of this ID.
    #[must_use]
    #[inline]
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContainerId({})", self.0)
    }
}

// === impl PoolExhausted ===

impl<T> PoolExhausted<T> {
    /// Returns the value that could not be allocated.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for PoolExhausted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PoolExhausted").finish_non_exhaustive()
    }
}

impl<T> fmt::Display for PoolExhausted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("node pool is at capacity")
    }
}

#[cfg(feature = "std")]
impl<T> std::error::Error for PoolExhausted<T> {}

// === impl LinkError ===

impl<T> LinkError<T> {
    /// Returns the node that could not be linked.
    pub fn into_node(self) -> Node<T> {
        self.node
    }
}

impl<T> fmt::Debug for LinkError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkError")
            .field("node", &self.node.node_ref())
            .finish()
    }
}

impl<T> fmt::Display for LinkError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "node {:?} was allocated by a different arena",
            self.node.node_ref()
        )
    }
}

#[cfg(feature = "std")]
impl<T> std::error::Error for LinkError<T> {}

// === impl UnlinkError ===

impl fmt::Display for UnlinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stale => f.write_str("node reference is stale"),
            Self::NotLinked => f.write_str("node is not linked into a container"),
            Self::OtherContainer(id) => write!(f, "node is linked into {id:?}"),
            Self::Corrupted => f.write_str("container links are corrupted"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for UnlinkError {}
