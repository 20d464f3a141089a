//! Flag words passed across the host interface.
//!
//! Each flag word is a [`mycelium_bitfield`] struct whose bit positions match
//! the host's ABI, so flags can be passed through as raw `u64`s.
use mycelium_bitfield::bitfield;

bitfield! {
    /// Flags passed when a task is enqueued or dispatched.
    #[derive(Eq, PartialEq)]
    pub struct EnqFlags<u64> {
        /// The task is being enqueued because it woke up.
        pub const WAKEUP: bool;
        const _RESERVED_0 = 3;
        /// Insert at the head of a FIFO queue, rather than the tail.
        pub const HEAD: bool;
        const _RESERVED_1 = 27;
        /// Preempt the task currently running on the target CPU.
        pub const PREEMPT: bool;
        const _RESERVED_2 = 7;
        /// The task is being re-enqueued after its local queue was drained.
        pub const REENQ: bool;
        /// The task is the last runnable task on its CPU.
        pub const LAST: bool;
    }
}

bitfield! {
    /// Flags describing why a task is waking up.
    #[derive(Eq, PartialEq)]
    pub struct WakeFlags<u64> {
        const _RESERVED = 2;
        /// The task was just forked.
        pub const FORK: bool;
        /// The task is being woken by another task.
        pub const TTWU: bool;
        /// The waker expects to sleep shortly, so the wakee may run on the
        /// waker's CPU.
        pub const SYNC: bool;
    }
}

bitfield! {
    /// Flags passed with a CPU kick.
    #[derive(Eq, PartialEq)]
    pub struct KickFlags<u64> {
        /// Only kick the CPU if it is idle.
        pub const IDLE: bool;
        /// Preempt the task currently running on the CPU.
        pub const PREEMPT: bool;
        /// Wait for the CPU to reschedule before returning.
        pub const WAIT: bool;
    }
}

macro_rules! impl_flags {
    ($($Flags:ident),+) => {
        $(
            impl $Flags {
                /// No flags set.
                pub const NONE: Self = Self::new();

                /// Returns `true` if no flags are set.
                #[must_use]
                #[inline]
                pub fn is_empty(self) -> bool {
                    self.0 == 0
                }
            }

            impl Default for $Flags {
                fn default() -> Self {
                    Self::NONE
                }
            }
        )+
    };
}

impl_flags!(EnqFlags, WakeFlags, KickFlags);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enq_flags_layout() {
        EnqFlags::assert_valid();
        assert_eq!(EnqFlags::new().with(EnqFlags::WAKEUP, true).bits(), 1);
        assert_eq!(EnqFlags::new().with(EnqFlags::HEAD, true).bits(), 1 << 4);
        assert_eq!(EnqFlags::new().with(EnqFlags::PREEMPT, true).bits(), 1 << 32);
        assert_eq!(EnqFlags::new().with(EnqFlags::REENQ, true).bits(), 1 << 40);
        assert_eq!(EnqFlags::new().with(EnqFlags::LAST, true).bits(), 1 << 41);
    }

    #[test]
    fn wake_flags_layout() {
        WakeFlags::assert_valid();
        assert_eq!(WakeFlags::new().with(WakeFlags::FORK, true).bits(), 0x4);
        assert_eq!(WakeFlags::new().with(WakeFlags::TTWU, true).bits(), 0x8);
        assert_eq!(WakeFlags::new().with(WakeFlags::SYNC, true).bits(), 0x10);
    }

    #[test]
    fn kick_flags_layout() {
        KickFlags::assert_valid();
        let flags = KickFlags::from_bits(0b110);
        assert!(!flags.get(KickFlags::IDLE));
        assert!(flags.get(KickFlags::PREEMPT));
        assert!(flags.get(KickFlags::WAIT));
        assert!(KickFlags::NONE.is_empty());
    }
}
