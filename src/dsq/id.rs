use crate::cpu::CpuId;
use core::fmt;

/// Identifies a dispatch queue.
///
/// User queue IDs share a 64-bit namespace with the builtin queues. Bit 63
/// marks an ID as builtin, so user IDs must leave it clear; see
/// [`DsqId::user`].
///
/// The builtin queues are:
///
/// - [`DsqId::GLOBAL`], a FIFO queue shared by every CPU,
/// - [`DsqId::LOCAL`], the invoking CPU's local queue,
/// - [`DsqId::local_on`]`(cpu)`, a specific CPU's local queue.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct DsqId(u64);

/// Where a user dispatch queue's tasks are expected to run.
///
/// The hint is recorded when the queue is created. It never affects ordering.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum Locality {
    /// No preference.
    #[default]
    Any,
    /// Tasks are expected to run on the given NUMA node.
    Node(usize),
}

mycelium_bitfield::bitfield! {
    /// The layout of a raw [`DsqId`].
    struct RawDsqId<u64> {
        /// The builtin queue number, or the CPU of a `LOCAL_ON` ID.
        const VALUE = 32;
        const _RESERVED = 30;
        /// Set for `LOCAL_ON | cpu` IDs.
        const LOCAL_ON: bool;
        /// Set for builtin IDs.
        const BUILTIN: bool;
    }
}

const BUILTIN: u64 = RawDsqId::BUILTIN.set_all(0);
const LOCAL_ON: u64 = RawDsqId::LOCAL_ON.set_all(BUILTIN);

impl DsqId {
    /// An ID which never names a queue.
    pub const INVALID: Self = Self(BUILTIN);

    /// The global FIFO queue.
    pub const GLOBAL: Self = Self(RawDsqId::VALUE.pack_truncating(1, BUILTIN));

    /// The invoking CPU's local queue.
    pub const LOCAL: Self = Self(RawDsqId::VALUE.pack_truncating(2, BUILTIN));

    /// Returns the ID of a user dispatch queue.
    ///
    /// Returns `None` if `id` has the builtin bit (bit 63) set.
    #[must_use]
    pub const fn user(id: u64) -> Option<Self> {
        if RawDsqId::BUILTIN.contained_in_any(id) {
            None
        } else {
            Some(Self(id))
        }
    }

    /// Returns the ID of `cpu`'s local queue.
    ///
    /// CPU IDs wider than 32 bits saturate to a CPU which never exists. Like
    /// any other out-of-range CPU, it is rejected when the ID is used.
    #[must_use]
    pub const fn local_on(cpu: CpuId) -> Self {
        let max = RawDsqId::VALUE.max_value();
        let cpu = if cpu as u64 > max { max } else { cpu as u64 };
        Self(RawDsqId::VALUE.pack_truncating(cpu, LOCAL_ON))
    }

    /// Returns the raw 64-bit representation of this ID.
    #[must_use]
    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// Converts a raw 64-bit value into a `DsqId`.
    #[must_use]
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns `true` if this is a builtin queue ID.
    #[must_use]
    #[inline]
    pub const fn is_builtin(self) -> bool {
        RawDsqId::BUILTIN.contained_in_any(self.0)
    }

    /// Returns `true` if this names a CPU-local queue.
    #[must_use]
    pub const fn is_local(self) -> bool {
        self.0 == Self::LOCAL.0 || self.local_cpu().is_some()
    }

    /// If this is a `LOCAL_ON | cpu` ID, returns the CPU.
    #[must_use]
    pub const fn local_cpu(self) -> Option<CpuId> {
        if self.0 & LOCAL_ON == LOCAL_ON {
            Some(RawDsqId::VALUE.unpack_bits(self.0) as CpuId)
        } else {
            None
        }
    }
}

impl fmt::Display for DsqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(cpu) = self.local_cpu() {
            return write!(f, "LOCAL_ON|{cpu}");
        }
        match *self {
            Self::INVALID => f.write_str("INVALID"),
            Self::GLOBAL => f.write_str("GLOBAL"),
            Self::LOCAL => f.write_str("LOCAL"),
            Self(raw) if self.is_builtin() => write!(f, "BUILTIN|{:#x}", raw & !BUILTIN),
            Self(raw) => write!(f, "{raw}"),
        }
    }
}

impl fmt::Debug for DsqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DsqId({self})")
    }
}
