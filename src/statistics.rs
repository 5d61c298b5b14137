use std::collections::HashMap;

use crate::{dartboard::RegionId, util::formatted_size};

/// Running summary of a sample distribution.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Dist {
    pub count: usize,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl Dist {
    pub fn add(&mut self, value: f64) {
        if self.count == 0 || value < self.min {
            self.min = value;
        }
        if self.count == 0 || value > self.max {
            self.max = value;
        }
        self.count += 1;
        self.sum += value;
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn merge(&mut self, other: &Dist) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.count += other.count;
        self.sum += other.sum;
    }
}

impl std::fmt::Display for Dist {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.count == 0 {
            return write!(f, "no samples");
        }
        write!(
            f,
            "mean {:.4} min {:.4} max {:.4} (n={})",
            self.mean(),
            self.min,
            self.max,
            self.count
        )
    }
}

/// Counters gathered by one scan. Each worker keeps its own and they are
/// merged when the scan finishes. Nothing here affects marking.
#[derive(Clone, Debug, Default)]
pub struct ScanStats {
    pub flushes: usize,
    pub flush_addrs: Dist,
    pub laddr32s: usize,
    pub laddr64s: usize,
    /// Values that did not translate to a heap address.
    pub dropped_addrs: usize,
    pub dedup_removed: usize,

    pub darts_new: usize,
    pub darts_dup: usize,

    pub regions_scanned: usize,
    pub region_bit_density: Dist,
    pub region_rescans: Dist,
    region_scan_counts: HashMap<u32, u32>,

    pub full_spans: usize,
    pub partial_spans: usize,
    pub large_spans: usize,
    pub pages_scanned: usize,
    pub pages_skipped: usize,
    pub objects_scanned: usize,
    pub words_scanned: usize,
    pub buffers_scanned: usize,

    pub heap_bytes: usize,
    pub noscan_bytes: usize,
    pub alloc_black_bytes: usize,
    pub objects_marked: usize,
}

impl ScanStats {
    pub fn region_scanned(&mut self, rid: RegionId, density: f64) {
        self.regions_scanned += 1;
        self.region_bit_density.add(density);
        *self.region_scan_counts.entry(rid.key()).or_insert(0) += 1;
    }

    pub fn dart_dup_fraction(&self) -> f64 {
        let total = self.darts_new + self.darts_dup;
        if total == 0 {
            0.0
        } else {
            self.darts_dup as f64 / total as f64
        }
    }

    pub fn merge(&mut self, other: &ScanStats) {
        self.flushes += other.flushes;
        self.flush_addrs.merge(&other.flush_addrs);
        self.laddr32s += other.laddr32s;
        self.laddr64s += other.laddr64s;
        self.dropped_addrs += other.dropped_addrs;
        self.dedup_removed += other.dedup_removed;
        self.darts_new += other.darts_new;
        self.darts_dup += other.darts_dup;
        self.regions_scanned += other.regions_scanned;
        self.region_bit_density.merge(&other.region_bit_density);
        for (&rid, &n) in &other.region_scan_counts {
            *self.region_scan_counts.entry(rid).or_insert(0) += n;
        }
        self.full_spans += other.full_spans;
        self.partial_spans += other.partial_spans;
        self.large_spans += other.large_spans;
        self.pages_scanned += other.pages_scanned;
        self.pages_skipped += other.pages_skipped;
        self.objects_scanned += other.objects_scanned;
        self.words_scanned += other.words_scanned;
        self.buffers_scanned += other.buffers_scanned;
        self.heap_bytes += other.heap_bytes;
        self.noscan_bytes += other.noscan_bytes;
        self.alloc_black_bytes += other.alloc_black_bytes;
        self.objects_marked += other.objects_marked;
    }

    /// Folds the per-region scan counts into [ScanStats::region_rescans].
    pub fn finish(&mut self) {
        self.region_rescans = Dist::default();
        for &n in self.region_scan_counts.values() {
            self.region_rescans.add(n as f64);
        }
    }

    pub fn region_scan_count(&self, rid: RegionId) -> u32 {
        self.region_scan_counts.get(&rid.key()).copied().unwrap_or(0)
    }
}

impl std::fmt::Display for ScanStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Scan statistics:")?;
        writeln!(f, "  Objects marked: {}", self.objects_marked)?;
        writeln!(
            f,
            "  Heap scanned: {} (noscan {}, allocate-black {})",
            formatted_size(self.heap_bytes),
            formatted_size(self.noscan_bytes),
            formatted_size(self.alloc_black_bytes)
        )?;
        writeln!(
            f,
            "  Objects scanned: {} ({} words)",
            self.objects_scanned, self.words_scanned
        )?;
        writeln!(f, "  Flushes: {}", self.flushes)?;
        writeln!(f, "  Addresses per flush: {}", self.flush_addrs)?;
        writeln!(
            f,
            "  Routed LAddr32/LAddr64: {}/{}",
            self.laddr32s, self.laddr64s
        )?;
        writeln!(
            f,
            "  Dropped non-heap: {}, removed by dedup: {}",
            self.dropped_addrs, self.dedup_removed
        )?;
        writeln!(
            f,
            "  Darts new/duplicate: {}/{} ({:.2}% duplicate)",
            self.darts_new,
            self.darts_dup,
            self.dart_dup_fraction() * 100.0
        )?;
        writeln!(f, "  Regions scanned: {}", self.regions_scanned)?;
        writeln!(f, "  Region bit density: {}", self.region_bit_density)?;
        writeln!(f, "  Region scan count: {}", self.region_rescans)?;
        writeln!(
            f,
            "  Spans full/partial/large: {}/{}/{}",
            self.full_spans, self.partial_spans, self.large_spans
        )?;
        writeln!(
            f,
            "  Pages scanned/skipped: {}/{}",
            self.pages_scanned, self.pages_skipped
        )?;
        writeln!(f, "  Buffers scanned directly: {}", self.buffers_scanned)?;
        Ok(())
    }
}
