//! Error types.
//!
//! Configuration and bounds errors are returned synchronously to the caller.
//! Errors that indicate a broken invariant are additionally reported through
//! the [`ErrorReporter`](crate::ErrorReporter), which disables the policy.
use crate::dsq::DsqId;

/// Errors returned while configuring a [`Runtime`](crate::Runtime) or its
/// dispatch queues.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A dispatch queue with this ID already exists.
    #[error("dispatch queue {0} already exists")]
    DuplicateQueue(DsqId),

    /// The configured maximum number of user dispatch queues already exist.
    #[error("dispatch queue table is full ({max} queues)")]
    QueueTableFull {
        /// The configured maximum.
        max: usize,
    },

    /// The locality hint names a NUMA node that does not exist.
    #[error("NUMA node {node} does not exist (there are {nr_nodes} nodes)")]
    InvalidLocality {
        /// The requested node.
        node: usize,
        /// The number of NUMA nodes.
        nr_nodes: usize,
    },

    /// The ID is reserved for a builtin dispatch queue.
    #[error("{0} is a builtin dispatch queue ID")]
    BuiltinQueue(DsqId),

    /// An object with this ID is already registered.
    #[error("{kind} {id} is already registered")]
    DuplicateObject {
        /// The kind of object.
        kind: &'static str,
        /// The object's ID.
        id: u64,
    },

    /// The CPU topology is not valid.
    #[error("invalid CPU topology: {0}")]
    InvalidTopology(&'static str),

    /// A sleepable operation was attempted while a read-side section or a
    /// decision-point invocation is active on this thread.
    #[error("cannot perform a sleepable operation in an atomic context")]
    AtomicContext,

    /// The policy has been disabled by a fatal fault.
    #[error("the scheduling policy is disabled")]
    Disabled,
}

/// A CPU index or array offset was outside the valid range.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[error("index {index} is out of range (length {len})")]
pub struct BoundsError {
    /// The out-of-range index.
    pub index: usize,
    /// The length of the indexed range.
    pub len: usize,
}

/// Errors returned by dispatch queue operations.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum QueueError {
    /// No dispatch queue with this ID exists.
    #[error("dispatch queue {0} does not exist")]
    Unknown(DsqId),

    /// The queue currently holds tasks with the other ordering.
    #[error("dispatch queue {0} holds tasks with a different ordering")]
    OrderingMismatch(DsqId),

    /// Builtin dispatch queues only support FIFO ordering.
    #[error("builtin dispatch queue {0} does not support virtual-time ordering")]
    VtimeOnBuiltin(DsqId),

    /// A CPU index was out of range.
    #[error(transparent)]
    Bounds(#[from] BoundsError),

    /// The queue's node pool is full.
    #[error("dispatch queue {0} is full")]
    Full(DsqId),

    /// The invocation's speculative dispatch slots are exhausted.
    #[error("no dispatch slots remain in this invocation")]
    SlotsExhausted,

    /// The task is already linked into a dispatch queue.
    #[error("task {pid} is already queued on {dsq}")]
    AlreadyQueued {
        /// The task's pid.
        pid: u64,
        /// The queue the task is linked into.
        dsq: DsqId,
    },

    /// The queue cannot be destroyed while it holds tasks.
    #[error("dispatch queue {0} is not empty")]
    NotEmpty(DsqId),

    /// Builtin dispatch queues cannot be destroyed.
    #[error("builtin dispatch queue {0} cannot be destroyed")]
    Builtin(DsqId),

    /// The policy has been disabled by a fatal fault.
    #[error("the scheduling policy is disabled")]
    Disabled,
}

/// Errors returned when requesting a CPU kick.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum KickError {
    /// The CPU index was out of range.
    #[error(transparent)]
    Bounds(#[from] BoundsError),

    /// The policy has been disabled by a fatal fault.
    #[error("the scheduling policy is disabled")]
    Disabled,
}

/// A task or cgroup lookup found nothing.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[error("{kind} {id} not found")]
pub struct NotFound {
    /// The kind of object that was looked up.
    pub kind: &'static str,
    /// The ID that was looked up.
    pub id: u64,
}

/// Errors returned when parsing a [`Cpumask`](crate::Cpumask) from a string.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum ParseCpumaskError {
    /// The string contained no hex digits.
    #[error("cpumask string is empty")]
    Empty,

    /// The string contained a character which is not a hex digit.
    #[error("invalid hex digit {0:?} in cpumask")]
    InvalidDigit(char),

    /// A bit was set for a CPU beyond the mask's size.
    #[error(transparent)]
    OutOfRange(#[from] BoundsError),
}
