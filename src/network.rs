//! Concentrator network construction.
//!
//! The top layer has one buffer per worker and the bottom layer one buffer
//! per queue region of the heap. Going down, each layer narrows the heap range
//! covered by a buffer by the fan out while merging the buffers of `fan_in`
//! worker groups, so the network doubles as a distributed radix sort from
//! unordered pointers to per-region batches.
use std::fmt::Write;

use parking_lot::Mutex;

use crate::{
    addr::{LAddr, LADDR32_WINDOW_BYTES},
    buffer::{Buffer, BufferKind},
    error::{ConfigError, ConfigResult},
    globals::{ARENA_BYTES, BYTES_PER_REGION, RADIX_BASE, WORD_BYTES},
    util::{ceil_div, formatted_size, which_power_of_two},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Inverse of the expected dartboard density when a full bottom buffer is
    /// flushed: one set bit per this many bits, ignoring duplicates. This sizes
    /// every buffer in the network.
    pub dartboard_inv_density: usize,
    /// Bytes of heap covered by one bottom buffer. A power of two between the
    /// dartboard region size and the arena size.
    pub queue_region: usize,
    /// Buffers each buffer flushes into. Also the radix of the routing sort.
    pub fan_out: usize,
    /// Buffers that flush into one buffer of the next layer.
    pub fan_in: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            // One bit per 32 bytes, two per cache line on average.
            dartboard_inv_density: 32 * 8,
            queue_region: 32 * 1024 * 1024,
            fan_out: 16,
            fan_in: 4,
        }
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if which_power_of_two(self.fan_out as u64).is_none() {
            return Err(ConfigError::FanOutNotPowerOfTwo(self.fan_out));
        }
        if which_power_of_two(self.queue_region as u64).is_none() {
            return Err(ConfigError::QueueRegionNotPowerOfTwo(self.queue_region));
        }
        if self.fan_out != RADIX_BASE {
            return Err(ConfigError::RadixMismatch {
                fan_out: self.fan_out,
                radix: RADIX_BASE,
            });
        }
        if self.queue_region < BYTES_PER_REGION {
            return Err(ConfigError::QueueRegionTooSmall {
                size: self.queue_region,
                min: BYTES_PER_REGION,
            });
        }
        if self.queue_region > ARENA_BYTES {
            return Err(ConfigError::QueueRegionTooLarge {
                size: self.queue_region,
                max: ARENA_BYTES,
            });
        }
        if self.fan_in < 2 {
            return Err(ConfigError::FanInTooSmall(self.fan_in));
        }
        if self.dartboard_inv_density == 0 {
            return Err(ConfigError::ZeroDensity);
        }
        self.buffer_bytes().map(|_| ())
    }

    /// Size of every buffer in the network: large enough that a full bottom
    /// buffer reaches the configured dartboard density.
    pub fn buffer_bytes(&self) -> ConfigResult<usize> {
        let entries = self.queue_region / (WORD_BYTES * self.dartboard_inv_density);
        let bytes = addr_bytes(self.queue_region) * entries;
        if bytes == 0 {
            return Err(ConfigError::BufferTooSmall(bytes));
        }
        Ok(ceil_div(bytes, 8) * 8)
    }
}

/// Bytes needed for a linear address within a heap range of `span` bytes. We
/// never go below 32 bits.
pub fn addr_bytes(span: usize) -> usize {
    if span as u64 <= LADDR32_WINDOW_BYTES {
        4
    } else {
        8
    }
}

pub struct Layer {
    pub buffers: Vec<Mutex<Buffer>>,
    /// Word shift of the routing digit for buffers of this layer.
    pub shift: u32,
    /// `topo[i]` is the first buffer in the next layer that buffer `i` flushes
    /// into; it flushes into `fan_out` consecutive buffers from there.
    pub topo: Vec<usize>,
    /// May be less than the configured fan out at the end of the heap.
    pub fan_out: usize,
    /// Bytes of heap covered by each buffer.
    pub heap_span: usize,
    /// Workers feeding each buffer.
    pub worker_span: usize,
    pub kind: BufferKind,
}

impl Layer {
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

pub struct Network {
    layers: Vec<Layer>,
    scratch: Mutex<Vec<Buffer>>,
    buffer_bytes: usize,
    heap_bytes: usize,
    workers: usize,
}

impl Network {
    pub fn new(config: &NetworkConfig, heap_bytes: usize, workers: usize) -> ConfigResult<Self> {
        config.validate()?;
        if workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if heap_bytes == 0 {
            return Err(ConfigError::EmptyHeap);
        }
        let buffer_bytes = config.buffer_bytes()?;
        log::debug!("buffer size: {}", formatted_size(buffer_bytes));

        // Top down: workers per buffer.
        let mut worker_spans = vec![1usize];
        while worker_spans[worker_spans.len() - 1] < workers {
            let last = worker_spans[worker_spans.len() - 1];
            worker_spans.push(last * config.fan_in);
        }

        // Bottom up: heap bytes per buffer.
        let mut heap_spans = vec![config.queue_region];
        while heap_spans[heap_spans.len() - 1] < heap_bytes {
            let last = heap_spans[heap_spans.len() - 1];
            heap_spans.push(last * config.fan_out);
        }

        while heap_spans.len() < worker_spans.len() {
            heap_spans.push(heap_spans[heap_spans.len() - 1]);
        }
        while worker_spans.len() < heap_spans.len() {
            worker_spans.push(worker_spans[worker_spans.len() - 1]);
        }
        heap_spans.reverse();

        let buf_index = |layer: usize, worker: usize, laddr: usize| -> usize {
            let segs = ceil_div(heap_bytes, heap_spans[layer]);
            (worker / worker_spans[layer]) * segs + laddr / heap_spans[layer]
        };

        let height = heap_spans.len();
        let mut layers: Vec<Layer> = Vec::with_capacity(height);
        for layer in 0..height {
            let heap_span = heap_spans[layer];
            let worker_span = worker_spans[layer];
            let kind = if layer == 0 {
                BufferKind::VAddr
            } else if addr_bytes(heap_span) == 8 {
                BufferKind::LAddr64
            } else {
                BufferKind::LAddr32
            };

            let mut buffers = vec![];
            let mut topo = vec![];
            for worker in (0..workers).step_by(worker_span) {
                for laddr in (0..heap_bytes).step_by(heap_span) {
                    buffers.push(Mutex::new(Buffer::new(
                        buffer_bytes,
                        kind,
                        LAddr(laddr as u64),
                    )));
                    if layer + 1 < height {
                        topo.push(buf_index(layer + 1, worker, laddr));
                    }
                }
            }

            let shift = match which_power_of_two((heap_span / WORD_BYTES) as u64) {
                Some(shift) => shift,
                None => panic!("heap span {} not a power of two", heap_span),
            };
            if layer > 0 {
                layers[layer - 1].fan_out = ceil_div(heap_bytes, heap_span).min(config.fan_out);
            }
            layers.push(Layer {
                buffers,
                shift,
                topo,
                fan_out: 0,
                heap_span,
                worker_span,
                kind,
            });
        }

        if layers[0].len() != workers {
            panic!(
                "top layer has {} buffers, want {} (one per worker)",
                layers[0].len(),
                workers
            );
        }
        for layer in &layers {
            log::debug!(
                "layer: {} x {} buffers, span {}, shift {}, fan out {}",
                layer.len(),
                layer.kind,
                formatted_size(layer.heap_span),
                layer.shift,
                layer.fan_out
            );
        }

        Ok(Self {
            layers,
            scratch: Mutex::new(vec![]),
            buffer_bytes,
            heap_bytes,
            workers,
        })
    }

    #[inline]
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    #[inline]
    pub fn layer(&self, layer: usize) -> &Layer {
        &self.layers[layer]
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.layers.len()
    }

    #[inline]
    pub fn workers(&self) -> usize {
        self.workers
    }

    #[inline]
    pub fn heap_bytes(&self) -> usize {
        self.heap_bytes
    }

    #[inline]
    pub fn buffer_bytes(&self) -> usize {
        self.buffer_bytes
    }

    /// The top buffer owned by `worker`.
    #[inline]
    pub fn top(&self, worker: usize) -> &Mutex<Buffer> {
        &self.layers[0].buffers[worker]
    }

    pub fn get_scratch(&self) -> Buffer {
        match self.scratch.lock().pop() {
            Some(buf) => buf,
            None => Buffer::new(self.buffer_bytes, BufferKind::LAddr64, LAddr(0)),
        }
    }

    pub fn put_scratch(&self, buf: Buffer) {
        if !buf.is_empty() {
            panic!("scratch buffer returned with {} addresses", buf.len());
        }
        self.scratch.lock().push(buf);
    }

    /// Total addresses held anywhere in the network.
    pub fn pending(&self) -> usize {
        self.layers
            .iter()
            .flat_map(|l| l.buffers.iter())
            .map(|b| b.lock().len())
            .sum()
    }

    pub fn is_drained(&self) -> bool {
        self.layers
            .iter()
            .flat_map(|l| l.buffers.iter())
            .all(|b| b.lock().is_empty())
    }

    /// Picks the non-empty buffer holding the fewest addresses, skipping
    /// buffers another worker holds.
    pub fn find_scan_buffer(&self) -> Option<(usize, usize)> {
        let mut best: Option<(usize, usize, usize)> = None;
        for (li, layer) in self.layers.iter().enumerate() {
            for (bi, buf) in layer.buffers.iter().enumerate() {
                let n = match buf.try_lock() {
                    Some(buf) => buf.len(),
                    None => continue,
                };
                if n != 0 && best.map_or(true, |(_, _, m)| n < m) {
                    best = Some((li, bi, n));
                }
            }
        }
        best.map(|(li, bi, _)| (li, bi))
    }

    /// Renders the topology in Graphviz DOT format.
    pub fn to_dot(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "digraph cnet {{");
        let _ = writeln!(out, "  rankdir=TB;");
        let _ = writeln!(out, "  node [shape=box];");
        for (li, layer) in self.layers.iter().enumerate() {
            let _ = writeln!(out, "  subgraph layer{} {{", li);
            let _ = writeln!(out, "    rank=same;");
            for (bi, buf) in layer.buffers.iter().enumerate() {
                let start = buf.lock().start();
                let _ = writeln!(
                    out,
                    "    l{}_{} [label=\"{}/{}\\n{}\\n{:?} +{}\"];",
                    li,
                    bi,
                    li,
                    bi,
                    layer.kind,
                    start,
                    formatted_size(layer.heap_span)
                );
            }
            let _ = writeln!(out, "  }}");
        }
        for (li, layer) in self.layers.iter().enumerate() {
            for (bi, &dst) in layer.topo.iter().enumerate() {
                for d in dst..dst + layer.fan_out {
                    let _ = writeln!(out, "  l{}_{} -> l{}_{};", li, bi, li + 1, d);
                }
            }
        }
        let _ = writeln!(out, "}}");
        out
    }
}
