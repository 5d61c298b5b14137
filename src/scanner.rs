//! The drain loop.
//!
//! Workers take dirty regions off the region queue, fold their darts into
//! object marks and scan every newly marked object, pushing what they find
//! into their own top buffer. When no region is queued they scan buffered
//! addresses directly, starting with the sparsest buffer. A scan ends when no
//! worker is busy and there is nothing left anywhere in the network.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    addr::VAddr,
    buffer::{Buffer, BufferKind},
    condenser::{Condenser, CondenserTable},
    dartboard::{Dartboard, RegionId},
    error::ConfigResult,
    flush::{map_to_laddr64, Router},
    gc_info::GcInfo,
    globals::*,
    heap::{Heap, HeapBits, Span},
    kernel::{self, Kernel},
    mark_bitmap::MarkBitmap,
    network::Network,
    statistics::ScanStats,
    util::bits,
    Config, KernelChoice,
};

/// Order in which queued regions are drained.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainPolicy {
    Fifo,
    Lifo,
    /// Fewest darts first.
    Sparsest,
    /// Most darts first.
    Densest,
    Random,
    /// Nearest region at or after the last one drained.
    Address,
}

impl Default for DrainPolicy {
    fn default() -> Self {
        DrainPolicy::Fifo
    }
}

/// Counts busy workers so idle ones know when the whole scan is done.
pub struct Terminator {
    const_nworkers: usize,
    nworkers: AtomicUsize,
}

impl Terminator {
    pub fn new(number_workers: usize) -> Terminator {
        Terminator {
            const_nworkers: number_workers,
            nworkers: AtomicUsize::new(number_workers),
        }
    }

    /// Called by a worker that found nothing to do. Returns true once every
    /// worker is idle and `has_work` confirms nothing is left, or false when
    /// new work showed up and the caller is busy again.
    pub fn try_terminate(&self, has_work: impl Fn() -> bool) -> bool {
        if self.const_nworkers == 1 {
            return !has_work();
        }
        self.nworkers.fetch_sub(1, Ordering::AcqRel);
        loop {
            if has_work() {
                self.nworkers.fetch_add(1, Ordering::AcqRel);
                return false;
            }
            if self.nworkers.load(Ordering::Acquire) == 0 {
                return true;
            }
            thread::sleep(Duration::from_micros(1));
        }
    }
}

struct Worker {
    id: usize,
    /// Darts of the region being drained.
    darts: Vec<u64>,
    /// Overflow space for packed scans when the top buffer is too small.
    ptrs: Vec<VAddr>,
    rng: StdRng,
    last_region: Option<RegionId>,
    stats: ScanStats,
}

impl Worker {
    fn new(id: usize) -> Self {
        Self {
            id,
            darts: vec![0; DARTBOARD_WORDS_PER_REGION],
            ptrs: vec![],
            rng: StdRng::seed_from_u64(0x636e_6574 ^ id as u64),
            last_region: None,
            stats: ScanStats::default(),
        }
    }
}

pub struct Scanner<'a> {
    heap: &'a Heap,
    net: Network,
    board: Dartboard,
    condensers: CondenserTable,
    marks: MarkBitmap,
    kernel: &'static dyn Kernel,
    policy: DrainPolicy,
    dedup: bool,
}

impl<'a> Scanner<'a> {
    pub fn new(heap: &'a Heap, config: &Config, workers: usize) -> ConfigResult<Self> {
        let net = Network::new(&config.network, heap.linear_bytes(), workers)?;
        let kernel = match config.kernel {
            KernelChoice::Auto => kernel::detect(),
            KernelChoice::Portable => kernel::portable(),
        };
        Ok(Self {
            heap,
            net,
            board: Dartboard::new(heap),
            condensers: CondenserTable::new(heap),
            marks: MarkBitmap::new(heap.object_ids()),
            kernel,
            policy: config.drain_policy,
            dedup: config.dedup_addrs,
        })
    }

    pub fn network(&self) -> &Network {
        &self.net
    }

    pub fn dartboard(&self) -> &Dartboard {
        &self.board
    }

    pub fn marks(&self) -> &MarkBitmap {
        &self.marks
    }

    pub fn into_marks(self) -> MarkBitmap {
        self.marks
    }

    pub fn router(&self) -> Router<'_> {
        Router {
            net: &self.net,
            heap: self.heap,
            board: &self.board,
            kernel: self.kernel,
            dedup: self.dedup,
        }
    }

    /// Pushes `addr` into `worker`'s top buffer, flushing it when full.
    pub fn enqueue(&self, stats: &mut ScanStats, worker: usize, top: &mut Buffer, addr: VAddr) {
        if addr.0 < MIN_POINTER {
            return;
        }
        if top.is_full() {
            self.router().flush_locked(stats, 0, worker, top);
        }
        top.push_vaddr(addr);
    }

    /// Marks allocate-black objects, greys the roots and drains to a fixed
    /// point. Returns the merged statistics of all workers.
    pub fn run(&self, info: &GcInfo) -> ScanStats {
        let mut stats = ScanStats::default();
        for &addr in &info.alloc_black {
            if let Some((_, span, id)) = self.heap.find_object(addr) {
                if !self.marks.mark(id) {
                    stats.alloc_black_bytes += span.object_bytes();
                }
            }
        }

        let workers = self.net.workers();
        for (i, &root) in info.roots.iter().chain(&info.wb_roots).enumerate() {
            let worker = i % workers;
            let mut top = self.net.top(worker).lock();
            self.enqueue(&mut stats, worker, &mut top, root);
        }

        let terminator = Terminator::new(workers);
        let mut per_worker: Vec<Worker> = (0..workers).map(Worker::new).collect();
        if workers == 1 {
            self.drain(&mut per_worker[0], &terminator);
        } else {
            let result = crossbeam_utils::thread::scope(|scope| {
                for worker in per_worker.iter_mut() {
                    let terminator = &terminator;
                    scope.spawn(move |_| self.drain(worker, terminator));
                }
            });
            if let Err(panic) = result {
                std::panic::resume_unwind(panic);
            }
        }

        for worker in &per_worker {
            stats.merge(&worker.stats);
        }
        stats.finish();
        stats
    }

    fn has_work(&self) -> bool {
        !self.board.queue.is_empty() || !self.net.is_drained()
    }

    fn drain(&self, w: &mut Worker, terminator: &Terminator) {
        loop {
            if let Some(rid) = self.pop_region(w) {
                self.scan_region(w, rid);
            } else if let Some((layer, index)) = self.net.find_scan_buffer() {
                self.scan_buf(w, layer, index);
            } else if terminator.try_terminate(|| self.has_work()) {
                return;
            }
        }
    }

    fn pop_region(&self, w: &mut Worker) -> Option<RegionId> {
        let mut queue = self.board.queue.lock();
        if queue.is_empty() {
            return None;
        }
        let index = match self.policy {
            DrainPolicy::Fifo => 0,
            DrainPolicy::Lifo => queue.len() - 1,
            DrainPolicy::Sparsest => (0..queue.len())
                .min_by_key(|&i| self.board.region_darts(queue[i]))
                .unwrap_or(0),
            DrainPolicy::Densest => (0..queue.len())
                .max_by_key(|&i| self.board.region_darts(queue[i]))
                .unwrap_or(0),
            DrainPolicy::Random => w.rng.gen_range(0..queue.len()),
            DrainPolicy::Address => {
                let last = w.last_region.map_or(0, RegionId::key);
                (0..queue.len())
                    .min_by_key(|&i| queue[i].key().wrapping_sub(last))
                    .unwrap_or(0)
            }
        };
        let rid = queue.remove(index);
        w.last_region = rid;
        rid
    }

    fn scan_region(&self, w: &mut Worker, rid: RegionId) {
        let board = self.board.arena(rid.arena_id());
        let region = rid.region();

        // Clear the queued bit first so darts thrown while we scan queue the
        // region again instead of being lost.
        board.begin_drain(region);
        let mut darts = std::mem::take(&mut w.darts);
        {
            let darts: &mut [u64; DARTBOARD_WORDS_PER_REGION] = match darts.as_mut_slice().try_into() {
                Ok(darts) => darts,
                Err(_) => unreachable!("worker dart buffer has the wrong size"),
            };
            board.take_region(region, darts);
        }
        let density = bits::count_ones(&darts) as f64 / DARTBOARD_BITS_PER_REGION as f64;
        w.stats.region_scanned(rid, density);

        let start = rid.to_vaddr(self.heap);
        let end = start.plus(BYTES_PER_REGION);
        log::trace!("scan region {:?} [{}, {}) density {:.4}", rid, start, end, density);

        let mut addr = start;
        while addr < end {
            let span = match self.heap.find_span(addr) {
                Some(span) => span,
                None => {
                    w.stats.pages_skipped += 1;
                    addr = addr.plus(PAGE_BYTES);
                    continue;
                }
            };
            let span_end = span.limit();
            let lo = span.start.max(addr);
            let hi = span_end.min(end);
            let first = lo.minus(start) / WORD_BYTES;
            let region_darts = &darts[first / 64..(first + hi.minus(lo) / WORD_BYTES) / 64];
            w.stats.pages_scanned += hi.minus(lo) / PAGE_BYTES;

            if span.start < addr || span_end > end {
                w.stats.partial_spans += 1;
                log::trace!(
                    "  partial span [{}, {}) => [{}, {})",
                    span.start,
                    span_end,
                    lo,
                    hi
                );
                match span.size_class {
                    None => self.scan_large_span(w, span, lo, region_darts),
                    Some(class) if hi == span_end => {
                        let cd = self.condensers.tail(class, lo.minus(span.start) / PAGE_BYTES);
                        self.scan_span(w, span, region_darts, cd);
                    }
                    Some(class) if lo == span.start => {
                        let cd = self.condensers.head(class, hi.minus(span.start) / PAGE_BYTES);
                        self.scan_span(w, span, region_darts, cd);
                    }
                    Some(_) => panic!(
                        "span [{}, {}) extends beyond both ends of region {:?}",
                        span.start, span_end, rid
                    ),
                }
            } else {
                w.stats.full_spans += 1;
                match span.size_class {
                    None => self.scan_large_span(w, span, lo, region_darts),
                    Some(class) => {
                        self.scan_span(w, span, region_darts, self.condensers.full(class))
                    }
                }
            }
            addr = span_end;
        }
        w.darts = darts;
    }

    fn scan_span(&self, w: &mut Worker, span: &Span, darts: &[u64], cd: &Condenser) {
        let marks = self.marks.span_words(span.first_object, span.object_count());
        let mut grey = [0u64; OBJ_MASK_WORDS];
        cd.condense(darts, &mut grey);

        // Drop already marked objects (a racy read, the OR below settles it)
        // and mark the rest. What remains in `grey` is ours to scan.
        let mut any = false;
        for (g, mark) in grey.iter_mut().zip(marks) {
            let want = *g & !mark.load(atomic::Ordering::Relaxed);
            *g = if want != 0 {
                MarkBitmap::or_word(mark, want)
            } else {
                0
            };
            any |= *g != 0;
        }
        if !any {
            return;
        }

        let grey = &grey[..marks.len()];
        let count = bits::count_ones(grey);
        let bytes = count * span.object_bytes();
        w.stats.objects_marked += count;
        match &span.heap_bits {
            HeapBits::None => w.stats.noscan_bytes += bytes,
            HeapBits::Packed(mask) => {
                w.stats.heap_bytes += bytes;
                self.scan_span_packed(w, span, mask, grey, count);
            }
            _ => {
                w.stats.heap_bytes += bytes;
                let mut top = self.net.top(w.id).lock();
                for index in bits::set_bits(grey) {
                    self.scan_object(&mut w.stats, w.id, &mut top, span, index);
                }
            }
        }
    }

    fn scan_span_packed(&self, w: &mut Worker, span: &Span, mask: &[u64], grey: &[u64], count: usize) {
        let obj_words = span.object_bytes() / WORD_BYTES;
        let mem = self.heap.words(span.start, span.pages * PAGE_WORDS);
        w.stats.objects_scanned += count;
        w.stats.words_scanned += count * obj_words;

        // Room for every scanned word plus the kernel's speculative write.
        let need = count * obj_words + 1;
        let mut top = self.net.top(w.id).lock();
        if top.remaining() < need && !top.is_empty() {
            self.router().flush_locked(&mut w.stats, 0, w.id, &mut top);
        }
        if top.remaining() >= need {
            let at = top.len();
            let n = self
                .kernel
                .scan_packed(mem, mask, obj_words, grey, &mut top.as_vaddr_mut()[at..]);
            top.set_len(at + n);
            return;
        }

        let mut ptrs = std::mem::take(&mut w.ptrs);
        ptrs.resize(need, VAddr(0));
        let n = self.kernel.scan_packed(mem, mask, obj_words, grey, &mut ptrs);
        for &ptr in &ptrs[..n] {
            self.enqueue(&mut w.stats, w.id, &mut top, ptr);
        }
        w.ptrs = ptrs;
    }

    /// `darts` cover the span's words from `lo`. Only darts that land inside
    /// the object count, not those in the unused tail of its last page.
    fn scan_large_span(&self, w: &mut Worker, span: &Span, lo: VAddr, darts: &[u64]) {
        w.stats.large_spans += 1;
        if self.marks.is_marked(span.first_object) || span.end <= lo {
            return;
        }
        let live = (span.end.minus(lo) / WORD_BYTES).min(darts.len() * 64);
        let full = live / 64;
        let hit = darts[..full].iter().any(|&d| d != 0)
            || (live % 64 != 0 && darts[full] & bits::low_mask((live % 64) as u32) != 0);
        if !hit {
            return;
        }
        if self.marks.mark(span.first_object) {
            return;
        }
        w.stats.objects_marked += 1;
        if span.is_noscan() {
            w.stats.noscan_bytes += span.object_bytes();
            return;
        }
        w.stats.heap_bytes += span.object_bytes();
        let mut top = self.net.top(w.id).lock();
        self.scan_object(&mut w.stats, w.id, &mut top, span, 0);
    }

    fn scan_object(&self, stats: &mut ScanStats, worker: usize, top: &mut Buffer, span: &Span, index: usize) {
        stats.objects_scanned += 1;
        stats.words_scanned += span.object_bytes() / WORD_BYTES;
        self.heap
            .for_each_pointer(span, index, |ptr| self.enqueue(stats, worker, top, ptr));
    }

    /// Scans the addresses held in a buffer without going through the
    /// dartboard.
    fn scan_buf(&self, w: &mut Worker, layer: usize, index: usize) {
        let mut tmp = self.net.get_scratch();
        {
            // Swap the contents out so nobody flushes them from under us.
            let mut buf = match self.net.layer(layer).buffers[index].try_lock() {
                Some(buf) if !buf.is_empty() => buf,
                _ => {
                    self.net.put_scratch(tmp);
                    return;
                }
            };
            buf.take_into(&mut tmp);
        }
        w.stats.buffers_scanned += 1;
        log::trace!("scan buffer {}/{} ({} addrs)", layer, index, tmp.len());

        if tmp.kind() == BufferKind::VAddr {
            w.stats.dropped_addrs += map_to_laddr64(self.heap, &mut tmp);
        }
        let start = tmp.start();
        let mut top = self.net.top(w.id).lock();
        match tmp.kind() {
            BufferKind::LAddr32 => {
                for a in tmp.laddr32s() {
                    let addr = self.heap.laddr_to_vaddr(a.to_laddr(start));
                    self.mark_addr(&mut w.stats, w.id, &mut top, addr);
                }
            }
            BufferKind::LAddr64 => {
                for a in tmp.laddr64s() {
                    let addr = self.heap.laddr_to_vaddr(a.to_laddr());
                    self.mark_addr(&mut w.stats, w.id, &mut top, addr);
                }
            }
            BufferKind::VAddr => unreachable!("buffer still holds virtual addresses"),
        }
        drop(top);
        tmp.clear();
        self.net.put_scratch(tmp);
    }

    fn mark_addr(&self, stats: &mut ScanStats, worker: usize, top: &mut Buffer, addr: VAddr) {
        let (_, span, id) = match self.heap.find_object(addr) {
            Some(found) => found,
            None => return,
        };
        if self.marks.mark(id) {
            return;
        }
        stats.objects_marked += 1;
        if span.is_noscan() {
            stats.noscan_bytes += span.object_bytes();
            return;
        }
        stats.heap_bytes += span.object_bytes();
        self.scan_object(stats, worker, top, span, (id - span.first_object) as usize);
    }
}
