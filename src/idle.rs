//! Tracking idle CPUs.
//!
//! The [`IdleTracker`] maintains two bitmaps:
//!
//! - the *idle* mask, with a bit set for every idle CPU, and
//! - the *SMT idle* mask, with every bit of an SMT sibling group set when
//!   every CPU in that group is idle.
//!
//! The host updates both as CPUs go idle and become busy. Policies read
//! snapshots of either mask, and *claim* idle CPUs: claiming atomically
//! clears a CPU's idle bit, so that of any number of callers racing to claim
//! the same CPU, exactly one succeeds.
//!
//! The SMT idle mask is a hint. It may briefly disagree with the idle mask
//! while siblings change state, but claims always test the idle mask itself.
use crate::{
    cpu::{CpuId, Topology},
    cpumask::Cpumask,
    error::BoundsError,
    loom::sync::atomic::{
        AtomicU64,
        Ordering::{AcqRel, Acquire, SeqCst},
    },
};
use core::{fmt, marker::PhantomData, ops::Deref};

/// Tracks which CPUs are idle.
pub struct IdleTracker {
    topology: Topology,
    idle: Box<[AtomicU64]>,
    smt: Box<[AtomicU64]>,
}

/// A read-only snapshot of an idle mask.
///
/// A snapshot is only valid for the scope that produced it, and is released
/// when dropped (or explicitly, with [`IdleSnapshot::put`]).
pub struct IdleSnapshot<'tracker> {
    mask: Cpumask,
    _tracker: PhantomData<&'tracker IdleTracker>,
}

const WORD_BITS: usize = u64::BITS as usize;

#[inline]
fn locate(cpu: CpuId) -> (usize, u64) {
    (cpu / WORD_BITS, 1 << (cpu % WORD_BITS))
}

// === impl IdleTracker ===

impl IdleTracker {
    /// Returns a new tracker in which no CPUs are idle.
    pub(crate) fn new(topology: Topology) -> Self {
        let nr_words = (topology.nr_cpus() + WORD_BITS - 1) / WORD_BITS;
        let words = || -> Box<[AtomicU64]> { (0..nr_words).map(|_| AtomicU64::new(0)).collect() };
        Self {
            idle: words(),
            smt: words(),
            topology,
        }
    }

    /// Returns the topology this tracker was created with.
    #[must_use]
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Records that `cpu` went idle (or became busy).
    ///
    /// This is called by the host.
    pub fn update_idle(&self, cpu: CpuId, idle: bool) -> Result<(), BoundsError> {
        let siblings = self.topology.siblings(cpu)?;
        let (word, bit) = locate(cpu);
        if idle {
            self.idle[word].fetch_or(bit, SeqCst);
            // If this was the last sibling to go idle, the whole core is idle.
            if siblings.clone().all(|sibling| self.is_idle(sibling)) {
                for sibling in siblings {
                    let (word, bit) = locate(sibling);
                    self.smt[word].fetch_or(bit, SeqCst);
                }
            }
        } else {
            self.idle[word].fetch_and(!bit, SeqCst);
            self.clear_smt(cpu);
        }
        test_trace!(cpu, idle, "update_idle");
        Ok(())
    }

    /// Returns `true` if `cpu` is currently idle.
    ///
    /// Out-of-range CPUs are never idle.
    #[must_use]
    pub fn is_idle(&self, cpu: CpuId) -> bool {
        if self.topology.check(cpu).is_err() {
            return false;
        }
        let (word, bit) = locate(cpu);
        self.idle[word].load(SeqCst) & bit != 0
    }

    /// Returns a snapshot of the idle mask.
    #[must_use]
    pub fn snapshot_idle(&self) -> IdleSnapshot<'_> {
        self.snapshot(&self.idle)
    }

    /// Returns a snapshot of the SMT idle mask.
    ///
    /// Without SMT, this is the same as the idle mask.
    #[must_use]
    pub fn snapshot_idle_smt(&self) -> IdleSnapshot<'_> {
        self.snapshot(&self.smt)
    }

    /// Atomically claims `cpu` if it is idle.
    ///
    /// On success, the CPU is no longer idle, and neither is its SMT sibling
    /// group. Returns `false` if the CPU was not idle, or is out of range.
    pub fn try_claim_idle(&self, cpu: CpuId) -> bool {
        if self.topology.check(cpu).is_err() {
            return false;
        }
        let (word, bit) = locate(cpu);
        let prev = test_dbg!(self.idle[word].fetch_and(!bit, AcqRel));
        if prev & bit == 0 {
            return false;
        }
        self.clear_smt(cpu);
        true
    }

    /// Picks and claims an idle CPU in `allowed`.
    ///
    /// If `prefer_smt` is set, CPUs whose whole SMT sibling group is idle are
    /// tried first. Returns `None` if no allowed CPU is idle, or if every
    /// attempt to claim one lost a race.
    pub fn pick_idle_cpu(&self, allowed: &Cpumask, prefer_smt: bool) -> Option<CpuId> {
        let prefer_smt = prefer_smt && self.topology.smt_enabled();
        for _ in 0..2 * self.topology.nr_cpus() {
            let smt = if prefer_smt {
                self.snapshot_idle_smt().pick_any_and(allowed)
            } else {
                None
            };
            let cpu = match smt {
                Some(cpu) => cpu,
                None => self.snapshot_idle().pick_any_and(allowed)?,
            };
            if self.try_claim_idle(cpu) {
                test_trace!(cpu, prefer_smt, "picked idle CPU");
                return Some(cpu);
            }
            test_trace!(cpu, "lost race for idle CPU");
        }
        None
    }

    /// Picks a CPU in `allowed`, preferring an idle one.
    ///
    /// If an idle CPU was found, it has been claimed. Returns `None` only if
    /// `allowed` is empty.
    pub fn pick_any_cpu(&self, allowed: &Cpumask) -> Option<CpuId> {
        self.pick_idle_cpu(allowed, false)
            .or_else(|| allowed.pick_any())
            .filter(|&cpu| self.topology.check(cpu).is_ok())
    }

    fn clear_smt(&self, cpu: CpuId) {
        let Ok(siblings) = self.topology.siblings(cpu) else {
            return;
        };
        for sibling in siblings {
            let (word, bit) = locate(sibling);
            self.smt[word].fetch_and(!bit, SeqCst);
        }
    }

    fn snapshot(&self, words: &[AtomicU64]) -> IdleSnapshot<'_> {
        let mut mask = Cpumask::new(self.topology.nr_cpus());
        for (dst, src) in mask.words_mut().iter_mut().zip(words) {
            *dst = src.load(Acquire);
        }
        IdleSnapshot {
            mask,
            _tracker: PhantomData,
        }
    }
}

impl fmt::Debug for IdleTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdleTracker")
            .field("topology", &self.topology)
            .field("idle", &*self.snapshot_idle())
            .field("smt", &*self.snapshot_idle_smt())
            .finish()
    }
}

// === impl IdleSnapshot ===

impl IdleSnapshot<'_> {
    /// Releases the snapshot.
    ///
    /// This is equivalent to dropping it.
    pub fn put(self) {
        drop(self);
    }
}

impl Deref for IdleSnapshot<'_> {
    type Target = Cpumask;

    #[inline]
    fn deref(&self) -> &Cpumask {
        &self.mask
    }
}

impl fmt::Debug for IdleSnapshot<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("IdleSnapshot").field(&self.mask).finish()
    }
}
