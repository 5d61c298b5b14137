use atomic::{Atomic, Ordering};
use core::fmt;
use memmap2::MmapMut;
use std::mem::size_of;

/// A zero-initialized array of atomic words backed by an anonymous mapping.
///
/// Both the per-arena dartboards and the mark bitmap are large and mostly
/// untouched, so the pages are only committed once a bit in them is set.
#[allow(dead_code)]
pub struct AtomicBitmap {
    mem_map: MmapMut,
    bitmap_begin: *const Atomic<u64>,
    words: usize,
    name: &'static str,
}

unsafe impl Send for AtomicBitmap {}
unsafe impl Sync for AtomicBitmap {}

impl AtomicBitmap {
    pub fn create(name: &'static str, bits: usize) -> Self {
        let words = (bits + 63) / 64;
        let bytes = (words * size_of::<u64>()).max(size_of::<u64>());
        let mut mem_map = MmapMut::map_anon(bytes)
            .unwrap_or_else(|err| panic!("failed to map {} bitmap ({} bytes): {}", name, bytes, err));
        let bitmap_begin = mem_map.as_mut_ptr().cast::<Atomic<u64>>();
        Self {
            mem_map,
            bitmap_begin,
            words,
            name,
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn bits(&self) -> usize {
        self.words * 64
    }

    #[inline]
    pub fn as_words(&self) -> &[Atomic<u64>] {
        // Atomic<u64> has the layout of u64 and the mapping is page aligned.
        unsafe { std::slice::from_raw_parts(self.bitmap_begin, self.words) }
    }

    /// Words covering bits `[first, first + count)`. `first` must be word aligned.
    #[inline]
    pub fn words(&self, first: usize, count: usize) -> &[Atomic<u64>] {
        assert!(
            first % 64 == 0,
            "{}: bit range must start on a word, got {}",
            self.name,
            first
        );
        &self.as_words()[first / 64..(first + count + 63) / 64]
    }

    #[inline]
    pub fn test(&self, bit: usize) -> bool {
        self.as_words()[bit / 64].load(Ordering::Relaxed) & (1 << (bit % 64)) != 0
    }

    /// Sets `bit` and returns whether it was already set.
    #[inline]
    pub fn test_and_set(&self, bit: usize) -> bool {
        let mask = 1 << (bit % 64);
        let entry = &self.as_words()[bit / 64];
        if entry.load(Ordering::Relaxed) & mask != 0 {
            return true;
        }
        entry.fetch_or(mask, Ordering::Relaxed) & mask != 0
    }

    /// Number of set bits in `[first, first + count)`, both word aligned.
    pub fn count_range(&self, first: usize, count: usize) -> usize {
        self.words(first, count)
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    pub fn count(&self) -> usize {
        self.as_words()
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    /// Visit every set bit in ascending order.
    ///
    /// NOTE: Bits may be set concurrently while visiting; each word is loaded once.
    pub fn visit_set(&self, mut visitor: impl FnMut(usize)) {
        for (i, word) in self.as_words().iter().enumerate() {
            let mut w = word.load(Ordering::Relaxed);
            while w != 0 {
                let shift = w.trailing_zeros() as usize;
                visitor(i * 64 + shift);
                w &= w - 1;
            }
        }
    }
}

impl fmt::Debug for AtomicBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}: {} bits, {} set]", self.name, self.bits(), self.count())
    }
}
