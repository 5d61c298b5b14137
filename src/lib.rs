//! A mark scanner built on a concentrator network.
//!
//! Pointers found while scanning are pushed into per-worker buffers, bucket
//! sorted by address and routed through layers of progressively narrower
//! buffers until they land on a dartboard: one bit per heap word. Dirty
//! dartboard regions are queued and drained by folding darts into object
//! mark bits with per-size-class condensers, so that objects are located
//! and marked in bulk rather than one pointer at a time.
//!
//! ```no_run
//! use cnet::{addr::VAddr, gc_info::GcInfo, heap::Heap};
//!
//! let mut heap = Heap::with_default_classes();
//! let span = heap.new_span(VAddr(0xc000_000000), 1, false);
//! let obj = heap.span(span).object_base(0);
//! let info = GcInfo {
//!     roots: vec![obj],
//!     ..Default::default()
//! };
//! let result = cnet::scan(&heap, &info);
//! assert_eq!(result.marks.count(), 1);
//! ```

macro_rules! logln_if {
    ($cond: expr, $($t:tt)*) => {
        if $cond {
            log::info!($($t)*);
        }
    };
}

pub mod addr;
pub mod bitmap;
pub mod buffer;
pub mod condenser;
pub mod dartboard;
pub mod error;
pub mod flush;
pub mod gc_info;
pub mod globals;
pub mod heap;
pub mod kernel;
pub mod mark_bitmap;
pub mod network;
pub mod scanner;
pub mod statistics;
pub mod util;

#[cfg(test)]
mod tests;

use error::{ConfigError, ConfigResult};
use gc_info::{GcInfo, MarkComparison};
use heap::Heap;
use mark_bitmap::MarkBitmap;
use network::NetworkConfig;
use scanner::{DrainPolicy, Scanner};
use statistics::ScanStats;

/// Which implementation of the hot loops to use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelChoice {
    /// The fastest kernel the CPU supports.
    Auto,
    Portable,
}

impl Default for KernelChoice {
    fn default() -> Self {
        KernelChoice::Auto
    }
}

/// Tunables for one scan.
#[derive(Clone, Debug)]
pub struct Config {
    pub network: NetworkConfig,
    pub drain_policy: DrainPolicy,
    /// Sort and deduplicate buffers before routing them.
    pub dedup_addrs: bool,
    /// Check the marks against a plain worklist marker after scanning.
    pub validate_marks: bool,
    pub kernel: KernelChoice,
    /// Log scan statistics when done.
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            drain_policy: DrainPolicy::Fifo,
            dedup_addrs: false,
            validate_marks: false,
            kernel: KernelChoice::Auto,
            verbose: false,
        }
    }
}

pub struct ScanResult {
    pub marks: MarkBitmap,
    pub stats: ScanStats,
    /// Set when [Config::validate_marks] is on.
    pub comparison: Option<MarkComparison>,
}

/// Marks everything reachable from `info`'s roots with the default
/// configuration.
pub fn scan(heap: &Heap, info: &GcInfo) -> ScanResult {
    scan_with_config(heap, info, &Config::default())
}

/// Marks everything reachable from `info`'s roots.
///
/// # Panics
///
/// Panics if `config` does not describe a valid network for `heap` and
/// `info.workers`.
pub fn scan_with_config(heap: &Heap, info: &GcInfo, config: &Config) -> ScanResult {
    if let Err(e) = validate(config, info) {
        panic!("invalid scan configuration: {}", e);
    }
    let (marks, stats) = if heap.arenas().is_empty() {
        log::debug!("empty heap, nothing to scan");
        (MarkBitmap::new(heap.object_ids()), ScanStats::default())
    } else {
        let scanner = match Scanner::new(heap, config, info.workers) {
            Ok(scanner) => scanner,
            Err(e) => panic!("invalid scan configuration: {}", e),
        };
        log::debug!(
            "scanning {} heap with {} workers, {} network layers",
            util::formatted_size(heap.linear_bytes()),
            info.workers,
            scanner.network().height()
        );

        let stats = scanner.run(info);
        let marks = scanner.into_marks();
        log::debug!("marked {} objects", marks.count());
        logln_if!(config.verbose, "{}", stats);
        (marks, stats)
    };

    let comparison = if config.validate_marks {
        Some(info.compare_marks(heap, &marks))
    } else {
        None
    };
    ScanResult {
        marks,
        stats,
        comparison,
    }
}

/// Checks the parts of `config` and `info` that do not depend on the heap.
fn validate(config: &Config, info: &GcInfo) -> ConfigResult<()> {
    config.network.validate()?;
    if info.workers == 0 {
        return Err(ConfigError::ZeroWorkers);
    }
    Ok(())
}
