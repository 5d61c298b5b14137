//! Per-arena dartboards and the region queue.
//!
//! Every heap word has one dartboard bit. Setting a dart records that some
//! pointer hit that word; the scanner later folds darts into object marks a
//! region at a time. A region whose darts may need scanning has its queued bit
//! set and sits in the region queue exactly once until a scanner takes it.
use std::collections::VecDeque;
use std::fmt;

use atomic::{Atomic, Ordering};
use modular_bitfield::prelude::*;
use parking_lot::{Mutex, MutexGuard};

use crate::{
    addr::{ArenaId, VAddr},
    bitmap::AtomicBitmap,
    globals::*,
    heap::Heap,
    util::bits,
};

pub const REGION_MASK_WORDS: usize = REGIONS_PER_ARENA / 64;

/// One bit per region of an arena.
pub type RegionMask = [u64; REGION_MASK_WORDS];

/// Identifies a dartboard region by arena and region index within the arena.
///
/// Both fields are range checked on construction; an out of range region
/// index panics.
#[bitfield(bits = 32)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId {
    arena_region: B8,
    arena: B24,
}

impl RegionId {
    pub fn of(arena: ArenaId, region: usize) -> Self {
        assert!(
            region < REGIONS_PER_ARENA,
            "region index {} out of range [0,{})",
            region,
            REGIONS_PER_ARENA
        );
        RegionId::new()
            .with_arena_region(region as u8)
            .with_arena(arena.0)
    }

    #[inline]
    pub fn arena_id(self) -> ArenaId {
        ArenaId(self.arena())
    }

    #[inline]
    pub fn region(self) -> usize {
        self.arena_region() as usize
    }

    /// Dense integer form, ordered by arena and then by region.
    #[inline]
    pub fn key(self) -> u32 {
        u32::from_le_bytes(self.into_bytes())
    }

    pub fn to_vaddr(self, heap: &Heap) -> VAddr {
        heap.arena(self.arena_id())
            .start
            .plus(self.region() * BYTES_PER_REGION)
    }
}

impl fmt::Debug for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RegionId({}/{})", self.arena(), self.region())
    }
}

pub struct ArenaBoard {
    pub id: ArenaId,
    darts: AtomicBitmap,
    region_queued: [Atomic<u64>; REGION_MASK_WORDS],
}

impl ArenaBoard {
    pub fn new(id: ArenaId) -> Self {
        Self {
            id,
            darts: AtomicBitmap::create("dartboard", ARENA_WORDS),
            region_queued: Default::default(),
        }
    }

    /// Sets the dart for each arena word offset in `words` and records the
    /// touched regions in `regions`. Returns the number of darts that were
    /// newly set and the number that were already set.
    pub fn throw_darts(
        &self,
        words: impl Iterator<Item = usize>,
        regions: &mut RegionMask,
    ) -> (usize, usize) {
        let darts = self.darts.as_words();
        let mut new = 0;
        let mut dup = 0;
        for word in words {
            let mask = 1u64 << (word % 64);
            // Pairs with the SeqCst claim in begin_drain: a dart set after a
            // drain clears the queued bit must observe that bit clear.
            let old = darts[word / 64].fetch_or(mask, Ordering::SeqCst);
            if old & mask == 0 {
                new += 1;
            } else {
                dup += 1;
            }
            bits::set_bit(regions, word / DARTBOARD_BITS_PER_REGION);
        }
        (new, dup)
    }

    /// Claims every region in `regions` that is not already queued and appends
    /// one [RegionId] per claimed region to `queue`. Returns how many regions
    /// were claimed.
    pub fn enqueue_regions(&self, regions: &RegionMask, queue: &RegionQueue) -> usize {
        let mut claimed_ids = vec![];
        for (i, &want) in regions.iter().enumerate() {
            let queued = &self.region_queued[i];
            let fresh = want & !queued.load(Ordering::SeqCst);
            if fresh == 0 {
                continue;
            }
            let old = queued.fetch_or(fresh, Ordering::SeqCst);
            let claimed = fresh & !old;
            for bit in bits::set_bits(&[claimed]) {
                let rid = RegionId::of(self.id, i * 64 + bit);
                log::trace!("enqueue region {:?}", rid);
                claimed_ids.push(rid);
            }
        }
        let n = claimed_ids.len();
        if n != 0 {
            queue.push_all(claimed_ids);
        }
        n
    }

    #[inline]
    pub fn is_queued(&self, region: usize) -> bool {
        self.region_queued[region / 64].load(Ordering::Relaxed) & (1 << (region % 64)) != 0
    }

    /// Clears the queued bit of `region` ahead of draining it. Darts thrown
    /// after this point queue the region again.
    pub fn begin_drain(&self, region: usize) {
        let mask = 1u64 << (region % 64);
        let old = self.region_queued[region / 64].fetch_and(!mask, Ordering::SeqCst);
        if old & mask == 0 {
            panic!(
                "region {:?} drained while not queued",
                RegionId::of(self.id, region)
            );
        }
    }

    /// Moves the darts of `region` into `out`, clearing them on the board.
    pub fn take_region(&self, region: usize, out: &mut [u64; DARTBOARD_WORDS_PER_REGION]) {
        let src = self
            .darts
            .words(region * DARTBOARD_BITS_PER_REGION, DARTBOARD_BITS_PER_REGION);
        for (dst, word) in out.iter_mut().zip(src) {
            *dst = word.swap(0, Ordering::SeqCst);
        }
    }

    /// Number of darts currently set in `region`.
    pub fn region_darts(&self, region: usize) -> usize {
        self.darts
            .count_range(region * DARTBOARD_BITS_PER_REGION, DARTBOARD_BITS_PER_REGION)
    }

    pub fn test_dart(&self, word: usize) -> bool {
        self.darts.test(word)
    }

    pub fn darts(&self) -> usize {
        self.darts.count()
    }
}

impl fmt::Debug for ArenaBoard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArenaBoard({}, {:?})", self.id, self.darts)
    }
}

/// Regions with darts waiting to be scanned.
#[derive(Default)]
pub struct RegionQueue {
    queue: Mutex<VecDeque<RegionId>>,
}

impl RegionQueue {
    pub fn push_all(&self, ids: impl IntoIterator<Item = RegionId>) {
        self.queue.lock().extend(ids);
    }

    pub fn lock(&self) -> MutexGuard<'_, VecDeque<RegionId>> {
        self.queue.lock()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

/// The dartboards of every arena plus the shared region queue.
pub struct Dartboard {
    arenas: Vec<ArenaBoard>,
    pub queue: RegionQueue,
}

impl Dartboard {
    pub fn new(heap: &Heap) -> Self {
        Self {
            arenas: heap.arenas().iter().map(|a| ArenaBoard::new(a.id)).collect(),
            queue: RegionQueue::default(),
        }
    }

    #[inline]
    pub fn arena(&self, id: ArenaId) -> &ArenaBoard {
        &self.arenas[id.0 as usize]
    }

    pub fn arenas(&self) -> &[ArenaBoard] {
        &self.arenas
    }

    pub fn region_darts(&self, rid: RegionId) -> usize {
        self.arena(rid.arena_id()).region_darts(rid.region())
    }

    pub fn total_darts(&self) -> usize {
        self.arenas.iter().map(ArenaBoard::darts).sum()
    }
}
