//! Moving addresses down the network.
//!
//! Flushing a buffer bucket sorts it by the digit the next layer routes on and
//! block copies each digit's run into the matching destination. A destination
//! that fills up is flushed first, recursively, so a flush may cascade all the
//! way to the dartboard. Buffers are locked strictly top-down.
use crate::{
    addr::{LAddr, LAddr32, LAddr64, VAddr},
    buffer::{Buffer, BufferKind},
    dartboard::{Dartboard, RegionMask},
    globals::RADIX_BASE,
    heap::Heap,
    kernel::{Counts, Kernel},
    network::Network,
    statistics::ScanStats,
};

/// An address that can be routed by radix digit.
pub trait RadixKey: Copy {
    fn digit(self, shift: u32) -> usize;
}

impl RadixKey for LAddr32 {
    #[inline(always)]
    fn digit(self, shift: u32) -> usize {
        ((self.0 >> shift) as usize) & (RADIX_BASE - 1)
    }
}

impl RadixKey for LAddr64 {
    #[inline(always)]
    fn digit(self, shift: u32) -> usize {
        ((self.0 >> shift) as usize) & (RADIX_BASE - 1)
    }
}

pub fn histogram<T: RadixKey>(src: &[T], shift: u32) -> Counts {
    let mut counts = [0; RADIX_BASE];
    for &val in src {
        counts[val.digit(shift)] += 1;
    }
    counts
}

/// Scatters `src` into `dst` partitioned by digit in ascending order. `counts`
/// must be the digit histogram of `src`.
pub fn bucket_sort<T: RadixKey>(src: &[T], dst: &mut [T], counts: &Counts, shift: u32) {
    let mut offs = [0usize; RADIX_BASE];
    let mut pos = 0;
    for (off, &count) in offs.iter_mut().zip(counts.iter()) {
        *off = pos;
        pos += count as usize;
    }
    assert_eq!(pos, src.len(), "histogram does not match source");
    for &val in src {
        let digit = val.digit(shift);
        dst[offs[digit]] = val;
        offs[digit] += 1;
    }
}

/// Rewrites a `VAddr` buffer in place as `LAddr64`, dropping values outside
/// the heap. Returns the number dropped.
pub fn map_to_laddr64(heap: &Heap, buf: &mut Buffer) -> usize {
    let n = buf.len();
    buf.set_kind(BufferKind::LAddr64);
    let data = buf.as_laddr64_mut();
    let mut o = 0;
    for i in 0..n {
        let laddr = heap.vaddr_to_laddr(VAddr(data[i].0));
        data[o] = laddr.to_laddr64();
        o += (laddr != LAddr::NONE) as usize;
    }
    buf.set_len(o);
    if o != n {
        log::trace!("mapping to linear addresses dropped {} of {}", n - o, n);
    }
    n - o
}

/// Everything a flush touches.
pub struct Router<'a> {
    pub net: &'a Network,
    pub heap: &'a Heap,
    pub board: &'a Dartboard,
    pub kernel: &'a dyn Kernel,
    /// Sort and deduplicate every buffer before routing it.
    pub dedup: bool,
}

impl<'a> Router<'a> {
    pub fn flush(&self, stats: &mut ScanStats, layer: usize, index: usize) {
        let mut buf = self.net.layer(layer).buffers[index].lock();
        self.flush_locked(stats, layer, index, &mut buf);
    }

    /// Flushes buffer `index` of `layer`, which the caller has locked.
    pub fn flush_locked(&self, stats: &mut ScanStats, layer: usize, index: usize, src: &mut Buffer) {
        stats.flushes += 1;
        stats.flush_addrs.add(src.len() as f64);

        if layer == 0 {
            stats.dropped_addrs += map_to_laddr64(self.heap, src);
        }
        if self.dedup {
            stats.dedup_removed += src.sort_dedup();
        }

        if layer + 1 == self.net.height() {
            self.flush_to_dartboard(stats, layer, index, src);
        } else {
            self.route(stats, layer, index, src);
        }

        if layer == 0 {
            src.set_kind(BufferKind::VAddr);
        }
    }

    fn flush_to_dartboard(&self, stats: &mut ScanStats, layer: usize, index: usize, src: &mut Buffer) {
        let start = src.start();
        let (arena, _) = start.arena();
        let board = self.board.arena(arena);
        log::trace!(
            "flush {}/{} (start {:?}), {} addrs -> dartboard {}",
            layer,
            index,
            start,
            src.len(),
            arena
        );
        let mut regions = RegionMask::default();
        let (new, dup) = match src.kind() {
            BufferKind::LAddr32 => board.throw_darts(
                src.laddr32s().iter().map(|a| {
                    let a = a.widen(start);
                    debug_assert_eq!(a.arena(), arena, "{:?} outside buffer arena", a);
                    a.arena_word()
                }),
                &mut regions,
            ),
            BufferKind::LAddr64 => board.throw_darts(
                src.laddr64s().iter().map(|a| {
                    debug_assert_eq!(a.arena(), arena, "{:?} outside buffer arena", a);
                    a.arena_word()
                }),
                &mut regions,
            ),
            BufferKind::VAddr => panic!("flushing unmapped VAddr buffer to the dartboard"),
        };
        stats.darts_new += new;
        stats.darts_dup += dup;
        src.clear();
        board.enqueue_regions(&regions, &self.board.queue);
    }

    fn route(&self, stats: &mut ScanStats, layer: usize, index: usize, src: &mut Buffer) {
        let n = src.len();
        if n == 0 {
            return;
        }
        let l = self.net.layer(layer);
        let next = self.net.layer(layer + 1);
        let first = l.topo[index];
        // At the end of the heap there may be fewer than fan_out destinations,
        // but no address should route past the last one.
        let fan = l.fan_out.min(next.len() - first);
        let shift = next.shift;
        log::trace!(
            "flush {}/{}, {} addrs -> {}/[{},{})",
            layer,
            index,
            n,
            layer + 1,
            first,
            first + fan
        );

        let mut counts = [0; RADIX_BASE];
        let mut tmp = self.net.get_scratch();
        tmp.set_kind(src.kind());
        tmp.set_start(src.start());
        match src.kind() {
            BufferKind::LAddr32 => {
                stats.laddr32s += n;
                self.kernel.count32(src.laddr32s(), shift, &mut counts);
                bucket_sort(src.laddr32s(), &mut tmp.as_laddr32_mut()[..n], &counts, shift);
            }
            BufferKind::LAddr64 => {
                stats.laddr64s += n;
                self.kernel.count64(src.laddr64s(), shift, &mut counts);
                bucket_sort(src.laddr64s(), &mut tmp.as_laddr64_mut()[..n], &counts, shift);
            }
            BufferKind::VAddr => panic!("routing unmapped VAddr buffer"),
        }
        tmp.set_len(n);

        let copied = self.copy_out(stats, layer + 1, first, fan, &tmp, &counts);
        if copied != n {
            panic!(
                "source buffer not fully drained: {} of {} addresses left in {}/{}",
                n - copied,
                n,
                layer,
                index
            );
        }
        tmp.clear();
        self.net.put_scratch(tmp);
        src.clear();
    }

    /// Copies each digit's run of `sorted` into destinations `first..first +
    /// fan` of `layer`, flushing destinations that fill up. Returns the number
    /// of addresses copied.
    fn copy_out(
        &self,
        stats: &mut ScanStats,
        layer: usize,
        first: usize,
        fan: usize,
        sorted: &Buffer,
        counts: &Counts,
    ) -> usize {
        let dsts = &self.net.layer(layer).buffers;
        let mut pos = 0;
        for (i, &count) in counts.iter().enumerate().take(fan) {
            let mut left = count as usize;
            if left == 0 {
                continue;
            }
            let mut dst = dsts[first + i].lock();
            loop {
                let k = left.min(dst.remaining());
                copy_chunk(sorted, pos, k, &mut dst);
                pos += k;
                left -= k;
                if left == 0 {
                    break;
                }
                log::trace!("  {}/{} full", layer, first + i);
                self.flush_locked(stats, layer, first + i, &mut dst);
            }
        }
        pos
    }

    /// Flushes every buffer in the network, top to bottom, until every address
    /// has reached the dartboard.
    pub fn flush_all(&self, stats: &mut ScanStats) {
        for layer in 0..self.net.height() {
            for index in 0..self.net.layer(layer).len() {
                let mut buf = self.net.layer(layer).buffers[index].lock();
                if !buf.is_empty() {
                    self.flush_locked(stats, layer, index, &mut buf);
                }
            }
        }
    }
}

fn copy_chunk(src: &Buffer, pos: usize, k: usize, dst: &mut Buffer) {
    let at = dst.len();
    match (src.kind(), dst.kind()) {
        (BufferKind::LAddr32, BufferKind::LAddr32) => {
            dst.as_laddr32_mut()[at..at + k].copy_from_slice(&src.laddr32s()[pos..pos + k]);
        }
        (BufferKind::LAddr64, BufferKind::LAddr32) => {
            let start = dst.start();
            for (d, s) in dst.as_laddr32_mut()[at..at + k]
                .iter_mut()
                .zip(&src.laddr64s()[pos..pos + k])
            {
                *d = s.narrow();
                debug_assert_eq!(d.widen(start), *s, "{:?} outside 32-bit window", s);
            }
        }
        (BufferKind::LAddr64, BufferKind::LAddr64) => {
            dst.as_laddr64_mut()[at..at + k].copy_from_slice(&src.laddr64s()[pos..pos + k]);
        }
        (from, to) => panic!("copy from {} into {} buffer not implemented", from, to),
    }
    dst.set_len(at + k);
}
