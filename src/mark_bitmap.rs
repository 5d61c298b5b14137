use std::fmt;

use atomic::{Atomic, Ordering};

use crate::{bitmap::AtomicBitmap, globals::OBJECT_COUNT_ALIGN, heap::ObjectId};

/// One mark bit per object ID.
///
/// Bits are only ever set during a scan, with atomic OR, so a racy read can
/// at worst cause an object to be marked twice.
pub struct MarkBitmap {
    bits: AtomicBitmap,
    objects: u64,
}

impl MarkBitmap {
    pub fn new(objects: ObjectId) -> Self {
        Self {
            bits: AtomicBitmap::create("mark bitmap", objects as usize),
            objects,
        }
    }

    /// One past the largest object ID covered.
    pub fn objects(&self) -> ObjectId {
        self.objects
    }

    #[inline]
    pub fn is_marked(&self, id: ObjectId) -> bool {
        id < self.objects && self.bits.test(id as usize)
    }

    /// Marks `id` and returns whether it was already marked.
    #[inline]
    pub fn mark(&self, id: ObjectId) -> bool {
        assert!(id < self.objects, "object ID {} out of range", id);
        self.bits.test_and_set(id as usize)
    }

    /// Mark words for `count` objects starting at `first`, which is the first
    /// object of a span and so aligned to a word.
    #[inline]
    pub fn span_words(&self, first: ObjectId, count: usize) -> &[Atomic<u64>] {
        debug_assert!(first % OBJECT_COUNT_ALIGN == 0);
        self.bits.words(first as usize, count)
    }

    /// Sets `grey` bits in `word` and returns the bits that were not yet set.
    #[inline]
    pub fn or_word(word: &Atomic<u64>, grey: u64) -> u64 {
        grey & !word.fetch_or(grey, Ordering::AcqRel)
    }

    pub fn count(&self) -> usize {
        self.bits.count()
    }

    /// All marked object IDs in ascending order.
    pub fn marked(&self) -> Vec<ObjectId> {
        let mut out = Vec::with_capacity(self.count());
        self.bits.visit_set(|bit| out.push(bit as ObjectId));
        out
    }
}

impl fmt::Debug for MarkBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MarkBitmap({} of {} marked)", self.count(), self.objects)
    }
}
