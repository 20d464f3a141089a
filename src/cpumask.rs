//! CPU affinity masks.
//!
//! A [`Cpumask`] is a bitset with one bit per CPU, sized to the number of CPUs
//! fixed when the [`Runtime`](crate::Runtime) is loaded. Masks are either
//! plain owned values, refcounted [`CpumaskRef`]s, or read-only
//! [`IdleSnapshot`](crate::IdleSnapshot)s of the idle state.
use crate::{
    cpu::CpuId,
    error::{BoundsError, ParseCpumaskError},
    kobj::Ref,
};
use core::{
    fmt,
    str::FromStr,
    sync::atomic::{AtomicUsize, Ordering::Relaxed},
};

/// A bitset over CPU IDs.
///
/// Bits at indices `>= nr_cpus` are never set. Single-bit operations on an
/// out-of-range CPU fail with a [`BoundsError`] rather than touching memory
/// outside the mask.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct Cpumask {
    nr_cpus: usize,
    words: Box<[u64]>,
}

/// A refcounted, shareable [`Cpumask`].
///
/// A `CpumaskRef` may only be mutated (with [`Ref::get_mut`]) while it is the
/// only reference to the mask.
pub type CpumaskRef = Ref<Cpumask>;

/// An iterator over the CPUs set in a [`Cpumask`], in ascending order.
#[derive(Debug, Clone)]
pub struct Iter<'a> {
    mask: &'a Cpumask,
    next: usize,
}

const WORD_BITS: usize = u64::BITS as usize;

/// Starting point for distributed picks, shared by every mask.
///
/// This is only a load-spreading hint, so it is not modeled by loom.
static PICK_CURSOR: AtomicUsize = AtomicUsize::new(0);

// === impl Cpumask ===

impl Cpumask {
    /// Returns a new mask over `nr_cpus` CPUs, with no bits set.
    #[must_use]
    pub fn new(nr_cpus: usize) -> Self {
        let nr_words = (nr_cpus + WORD_BITS - 1) / WORD_BITS;
        Self {
            nr_cpus,
            words: vec![0; nr_words].into_boxed_slice(),
        }
    }

    /// Returns a new mask over `nr_cpus` CPUs, with every bit set.
    #[must_use]
    pub fn full(nr_cpus: usize) -> Self {
        let mut mask = Self::new(nr_cpus);
        mask.set_all();
        mask
    }

    /// Parses a hex string, such as `"0xff00_ff00"`, into a mask over
    /// `nr_cpus` CPUs.
    ///
    /// Fails if the string sets a bit for a CPU `>= nr_cpus`.
    pub fn from_hex(s: &str, nr_cpus: usize) -> Result<Self, ParseCpumaskError> {
        let parsed: Self = s.parse()?;
        let mut mask = Self::new(nr_cpus);
        for cpu in parsed.iter() {
            mask.set(cpu)?;
        }
        Ok(mask)
    }

    /// Returns the number of CPUs this mask covers.
    #[must_use]
    #[inline]
    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    /// Sets the bit for `cpu`.
    pub fn set(&mut self, cpu: CpuId) -> Result<(), BoundsError> {
        let (word, bit) = self.locate(cpu)?;
        self.words[word] |= bit;
        Ok(())
    }

    /// Clears the bit for `cpu`.
    pub fn clear(&mut self, cpu: CpuId) -> Result<(), BoundsError> {
        let (word, bit) = self.locate(cpu)?;
        self.words[word] &= !bit;
        Ok(())
    }

    /// Returns whether the bit for `cpu` is set.
    pub fn test(&self, cpu: CpuId) -> Result<bool, BoundsError> {
        let (word, bit) = self.locate(cpu)?;
        Ok(self.words[word] & bit != 0)
    }

    /// Sets the bit for `cpu`, returning its previous value.
    pub fn test_and_set(&mut self, cpu: CpuId) -> Result<bool, BoundsError> {
        let (word, bit) = self.locate(cpu)?;
        let prev = self.words[word] & bit != 0;
        self.words[word] |= bit;
        Ok(prev)
    }

    /// Clears the bit for `cpu`, returning its previous value.
    pub fn test_and_clear(&mut self, cpu: CpuId) -> Result<bool, BoundsError> {
        let (word, bit) = self.locate(cpu)?;
        let prev = self.words[word] & bit != 0;
        self.words[word] &= !bit;
        Ok(prev)
    }

    /// Sets every bit.
    pub fn set_all(&mut self) {
        self.words.fill(!0);
        self.trim();
    }

    /// Clears every bit.
    pub fn clear_all(&mut self) {
        self.words.fill(0);
    }

    /// Sets `self` to `a & b`, returning `true` if the result is non-empty.
    pub fn and(&mut self, a: &Cpumask, b: &Cpumask) -> bool {
        self.combine(a, b, |a, b| a & b);
        !self.is_empty()
    }

    /// Sets `self` to `a | b`.
    pub fn or(&mut self, a: &Cpumask, b: &Cpumask) {
        self.combine(a, b, |a, b| a | b);
    }

    /// Sets `self` to `a ^ b`.
    pub fn xor(&mut self, a: &Cpumask, b: &Cpumask) {
        self.combine(a, b, |a, b| a ^ b);
    }

    /// Copies every bit from `src`.
    pub fn copy_from(&mut self, src: &Cpumask) {
        self.combine(src, src, |a, _| a);
    }

    /// Returns a new mask with every bit of `self` inverted.
    #[must_use]
    pub fn complement(&self) -> Self {
        let mut mask = self.clone();
        for word in mask.words.iter_mut() {
            *word = !*word;
        }
        mask.trim();
        mask
    }

    /// Returns `true` if `self` and `other` have exactly the same bits set.
    #[must_use]
    pub fn equal(&self, other: &Cpumask) -> bool {
        (0..self.words.len().max(other.words.len()))
            .all(|i| word_at(&self.words, i) == word_at(&other.words, i))
    }

    /// Returns `true` if any bit is set in both `self` and `other`.
    #[must_use]
    pub fn intersects(&self, other: &Cpumask) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .any(|(a, b)| a & b != 0)
    }

    /// Returns `true` if every bit set in `self` is also set in `other`.
    #[must_use]
    pub fn is_subset_of(&self, other: &Cpumask) -> bool {
        self.words
            .iter()
            .enumerate()
            .all(|(i, a)| a & !word_at(&other.words, i) == 0)
    }

    /// Returns `true` if no bits are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&word| word == 0)
    }

    /// Returns `true` if every bit is set.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.weight() == self.nr_cpus
    }

    /// Returns the number of bits set.
    #[must_use]
    pub fn weight(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }

    /// Returns the lowest CPU set in the mask.
    #[must_use]
    pub fn first(&self) -> Option<CpuId> {
        self.next_set(0)
    }

    /// Returns the lowest CPU *not* set in the mask.
    #[must_use]
    pub fn first_zero(&self) -> Option<CpuId> {
        find_from(self.words.len(), 0, |i| !self.words[i])
            .filter(|&cpu| cpu < self.nr_cpus)
    }

    /// Returns the lowest CPU set in both `self` and `other`.
    #[must_use]
    pub fn first_and(&self, other: &Cpumask) -> Option<CpuId> {
        find_from(self.words.len(), 0, |i| {
            self.words[i] & word_at(&other.words, i)
        })
    }

    /// Picks a CPU set in the mask.
    ///
    /// Successive picks start from a rotating position, so that callers
    /// racing to pick from the same mask are spread across its CPUs, rather
    /// than all choosing the lowest one.
    #[must_use]
    pub fn pick_any(&self) -> Option<CpuId> {
        let start = self.pick_start()?;
        self.next_set(start).or_else(|| self.first())
    }

    /// Picks a CPU set in both `self` and `other`, as [`Cpumask::pick_any`]
    /// does.
    #[must_use]
    pub fn pick_any_and(&self, other: &Cpumask) -> Option<CpuId> {
        let start = self.pick_start()?;
        let word = |i: usize| self.words[i] & word_at(&other.words, i);
        find_from(self.words.len(), start, word).or_else(|| find_from(self.words.len(), 0, word))
    }

    /// Returns an iterator over the CPUs set in the mask.
    pub fn iter(&self) -> Iter<'_> {
        Iter { mask: self, next: 0 }
    }

    pub(crate) fn words_mut(&mut self) -> &mut [u64] {
        &mut self.words
    }

    fn next_set(&self, from: usize) -> Option<CpuId> {
        find_from(self.words.len(), from, |i| self.words[i])
    }

    fn pick_start(&self) -> Option<usize> {
        if self.nr_cpus == 0 {
            return None;
        }
        Some(PICK_CURSOR.fetch_add(1, Relaxed) % self.nr_cpus)
    }

    #[inline]
    fn locate(&self, cpu: CpuId) -> Result<(usize, u64), BoundsError> {
        if cpu >= self.nr_cpus {
            return Err(BoundsError {
                index: cpu,
                len: self.nr_cpus,
            });
        }
        Ok((cpu / WORD_BITS, 1 << (cpu % WORD_BITS)))
    }

    fn combine(&mut self, a: &Cpumask, b: &Cpumask, f: impl Fn(u64, u64) -> u64) {
        for (i, word) in self.words.iter_mut().enumerate() {
            *word = f(word_at(&a.words, i), word_at(&b.words, i));
        }
        self.trim();
    }

    /// Clears any bits beyond `nr_cpus` in the last word.
    fn trim(&mut self) {
        let tail = self.nr_cpus % WORD_BITS;
        if tail != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1 << tail) - 1;
            }
        }
    }
}

#[inline]
fn word_at(words: &[u64], i: usize) -> u64 {
    words.get(i).copied().unwrap_or(0)
}

/// Finds the lowest set bit at an index `>= from`, given a function returning
/// each word.
fn find_from(nr_words: usize, from: usize, word: impl Fn(usize) -> u64) -> Option<usize> {
    let mut i = from / WORD_BITS;
    if i >= nr_words {
        return None;
    }
    let mut bits = word(i) & (!0 << (from % WORD_BITS));
    loop {
        if bits != 0 {
            return Some(i * WORD_BITS + bits.trailing_zeros() as usize);
        }
        i += 1;
        if i >= nr_words {
            return None;
        }
        bits = word(i);
    }
}

impl FromStr for Cpumask {
    type Err = ParseCpumaskError;

    /// Parses a hex string into a mask sized to four CPUs per hex digit.
    ///
    /// A leading `0x` and `_` separators are accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        let nr_digits = digits.chars().filter(|&c| c != '_').count();
        if nr_digits == 0 {
            return Err(ParseCpumaskError::Empty);
        }

        let mut mask = Self::new(nr_digits * 4);
        let mut bit = 0;
        for c in digits.chars().rev().filter(|&c| c != '_') {
            let nibble = c.to_digit(16).ok_or(ParseCpumaskError::InvalidDigit(c))? as u64;
            mask.words[bit / WORD_BITS] |= nibble << (bit % WORD_BITS);
            bit += 4;
        }
        Ok(mask)
    }
}

impl fmt::Display for Cpumask {
    /// Formats the mask as `<nr_cpus>:0x<bits>`, most significant bits first.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:0x", self.nr_cpus)?;
        let mut words = self.words.iter().rev().skip_while(|&&word| word == 0);
        match words.next() {
            Some(word) => write!(f, "{word:x}")?,
            None => return f.write_str("0"),
        }
        for word in words {
            write!(f, "{word:016x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cpumask({self})")
    }
}

impl<'a> IntoIterator for &'a Cpumask {
    type Item = CpuId;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

// === impl CpumaskRef ===

impl Ref<Cpumask> {
    /// Allocates a new refcounted mask over `nr_cpus` CPUs, with no bits set.
    ///
    /// The returned reference holds the only count. The mask is destroyed
    /// when the last reference is released.
    #[must_use]
    pub fn create(nr_cpus: usize) -> Self {
        Ref::new(Cpumask::new(nr_cpus))
    }
}

// === impl Iter ===

impl Iterator for Iter<'_> {
    type Item = CpuId;

    fn next(&mut self) -> Option<CpuId> {
        let cpu = self.mask.next_set(self.next)?;
        self.next = cpu + 1;
        Some(cpu)
    }
}

#[cfg(all(test, not(loom)))]
mod tests;
