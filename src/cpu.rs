//! CPU identifiers, topology, and per-CPU storage.
use crate::{config::Config, error::BoundsError};
use core::{fmt, ops::Range};

/// Identifies a CPU.
///
/// CPU IDs are dense, in the range `0..nr_cpus`, where `nr_cpus` is fixed when
/// the [`Runtime`](crate::Runtime) is loaded.
pub type CpuId = usize;

/// The machine's CPU topology, as fixed at load.
///
/// SMT sibling groups ("cores") and NUMA nodes are contiguous ranges of CPU
/// IDs.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Topology {
    nr_cpus: usize,
    threads_per_core: usize,
    nr_nodes: usize,
}

/// A value stored once per CPU.
pub struct PerCpu<T> {
    slots: Box<[T]>,
}

// === impl Topology ===

impl Topology {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            nr_cpus: config.nr_cpus,
            threads_per_core: config.threads_per_core,
            nr_nodes: config.nr_nodes,
        }
    }

    /// Returns the number of CPUs.
    #[must_use]
    #[inline]
    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    /// Returns the number of hardware threads in each SMT sibling group.
    #[must_use]
    #[inline]
    pub fn threads_per_core(&self) -> usize {
        self.threads_per_core
    }

    /// Returns `true` if CPUs have SMT siblings.
    #[must_use]
    #[inline]
    pub fn smt_enabled(&self) -> bool {
        self.threads_per_core > 1
    }

    /// Returns the number of NUMA nodes.
    #[must_use]
    #[inline]
    pub fn nr_nodes(&self) -> usize {
        self.nr_nodes
    }

    /// Returns the CPUs in the SMT sibling group containing `cpu`.
    pub fn siblings(&self, cpu: CpuId) -> Result<Range<CpuId>, BoundsError> {
        self.check(cpu)?;
        let first = cpu - (cpu % self.threads_per_core);
        Ok(first..first + self.threads_per_core)
    }

    /// Returns the NUMA node containing `cpu`.
    pub fn node_of(&self, cpu: CpuId) -> Result<usize, BoundsError> {
        self.check(cpu)?;
        Ok(cpu * self.nr_nodes / self.nr_cpus)
    }

    /// Returns a [`BoundsError`] if `cpu` is not a valid CPU ID.
    #[inline]
    pub fn check(&self, cpu: CpuId) -> Result<(), BoundsError> {
        if cpu < self.nr_cpus {
            Ok(())
        } else {
            Err(BoundsError {
                index: cpu,
                len: self.nr_cpus,
            })
        }
    }
}

// === impl PerCpu ===

impl<T> PerCpu<T> {
    /// Returns a new `PerCpu`, calling `init` once for each CPU.
    pub fn new(nr_cpus: usize, init: impl FnMut(CpuId) -> T) -> Self {
        Self {
            slots: (0..nr_cpus).map(init).collect(),
        }
    }

    /// Returns the value for `cpu`.
    #[inline]
    pub fn get(&self, cpu: CpuId) -> Result<&T, BoundsError> {
        self.slots.get(cpu).ok_or(BoundsError {
            index: cpu,
            len: self.slots.len(),
        })
    }

    /// Returns the number of CPUs.
    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` if there are no CPUs.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Iterates over every CPU's value, in CPU ID order.
    pub fn iter(&self) -> impl Iterator<Item = (CpuId, &T)> + '_ {
        self.slots.iter().enumerate()
    }
}

impl<T: fmt::Debug> fmt::Debug for PerCpu<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}
