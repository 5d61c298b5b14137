use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    addr::{ArenaId, VAddr},
    dartboard::RegionId,
    gc_info::{GcInfo, ReferenceMarker},
    globals::*,
    heap::{Heap, HeapBits, ObjectId, SpanId, TypeId},
    network::NetworkConfig,
    scan, scan_with_config,
    scanner::{DrainPolicy, Scanner},
    statistics::ScanStats,
    Config, KernelChoice,
};

const BASE: VAddr = VAddr(0xc0_0000_0000);
/// Pointer in every other word, after the header word of header spans.
const PAIR: TypeId = 1;

fn new_heap() -> Heap {
    let mut heap = Heap::with_default_classes();
    heap.new_type(PAIR, 16, 1, vec![1]);
    heap
}

/// Buffers of a few addresses each and one dartboard region per bottom
/// buffer, so nearly every pointer goes through the whole network.
fn tiny_config() -> Config {
    Config {
        network: NetworkConfig {
            dartboard_inv_density: 1 << 12,
            queue_region: BYTES_PER_REGION,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Big enough for packed spans to be scanned straight into the top buffer.
fn small_config() -> Config {
    Config {
        network: NetworkConfig {
            dartboard_inv_density: 64,
            queue_region: BYTES_PER_REGION,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Flushes the roots all the way to the dartboard before draining, so every
/// root is found by a region scan rather than a buffer scan.
fn scan_from_dartboard(heap: &Heap, info: &GcInfo, config: &Config) -> (Vec<ObjectId>, ScanStats) {
    let scanner = Scanner::new(heap, config, info.workers).unwrap();
    let mut stats = ScanStats::default();
    {
        let mut top = scanner.network().top(0).lock();
        for &root in &info.roots {
            scanner.enqueue(&mut stats, 0, &mut top, root);
        }
    }
    scanner.router().flush_all(&mut stats);
    assert!(scanner.network().is_drained());

    let rest = GcInfo {
        roots: vec![],
        ..info.clone()
    };
    let mut run = scanner.run(&rest);
    run.merge(&stats);
    (scanner.into_marks().marked(), run)
}

fn id_of(heap: &Heap, addr: VAddr) -> ObjectId {
    match heap.find_object(addr) {
        Some((_, _, id)) => id,
        None => panic!("{} is not an object", addr),
    }
}

/// Stores `to` into the word at `slot`, marking it as a pointer slot for
/// packed spans.
fn link(heap: &mut Heap, slot: VAddr, to: VAddr) {
    if let Some(span) = heap.find_span(slot) {
        if matches!(span.heap_bits, HeapBits::Packed(_)) {
            heap.set_pointer_word(slot);
        }
    }
    heap.write_word(slot, to.0);
}

fn typed_span(heap: &mut Heap, base: VAddr, class: usize) -> SpanId {
    let span = heap.new_span(base, class, false);
    for i in 0..heap.span(span).object_count() {
        heap.set_object_type(span, i, PAIR);
    }
    span
}

fn roots(roots: Vec<VAddr>) -> GcInfo {
    GcInfo {
        roots,
        ..Default::default()
    }
}

fn reference(heap: &Heap, info: &GcInfo) -> Vec<ObjectId> {
    ReferenceMarker::new(heap).run(info).marked()
}

fn configs() -> Vec<Config> {
    let mut dedup = tiny_config();
    dedup.dedup_addrs = true;
    let mut portable = tiny_config();
    portable.kernel = KernelChoice::Portable;
    vec![Config::default(), small_config(), tiny_config(), dedup, portable]
}

#[test]
fn two_objects() {
    let mut heap = new_heap();
    let span = heap.new_span(BASE, 4, false);
    let o = heap.span(span).object_base(3);
    let b = heap.span(span).object_base(7);
    link(&mut heap, o.plus(8), b);

    let info = roots(vec![o.plus(16)]);
    for config in configs() {
        let result = scan_with_config(&heap, &info, &config);
        assert_eq!(result.marks.marked(), vec![id_of(&heap, o), id_of(&heap, b)]);
        assert_eq!(result.stats.objects_marked, 2);
    }
}

#[test]
fn tiny_buffers_go_through_dartboard() {
    let mut heap = new_heap();
    let span = heap.new_span(BASE, 4, false);
    let objects = heap.span(span).object_count();
    // A ternary tree over the span; each object has three pointer words.
    for i in 0..objects {
        for k in 1..=3 {
            if 3 * i + k < objects {
                let from = heap.span(span).object_base(i).plus(8 * k);
                let to = heap.span(span).object_base(3 * i + k);
                link(&mut heap, from, to);
            }
        }
    }
    let info = roots(vec![heap.span(span).object_base(0)]);
    for config in [tiny_config(), small_config()] {
        let result = scan_with_config(&heap, &info, &config);
        assert_eq!(result.marks.count(), objects);
        assert_eq!(result.marks.marked(), reference(&heap, &info));
        assert_eq!(result.stats.objects_marked, objects);
    }

    let stats = scan_with_config(&heap, &info, &tiny_config()).stats;
    assert!(stats.flushes > 0);
    assert!(stats.darts_new > 0);
    assert!(stats.regions_scanned > 0);
    assert!(stats.laddr32s > 0);
}

#[test]
fn span_across_region_boundary() {
    let mut heap = new_heap();
    // Six page span starting three pages before the end of region 0.
    let class = 50;
    assert_eq!(heap.size_classes()[class].span_pages, 6);
    let start = BASE.plus(BYTES_PER_REGION - 3 * PAGE_BYTES);
    let span = typed_span(&mut heap, start, class);
    let small = heap.new_span(BASE.plus(BYTES_PER_REGION + 8 * PAGE_BYTES), 2, false);

    let s = heap.span(span);
    let (first, straddler, last) = (s.object_base(0), s.object_base(3), s.object_base(6));
    let region1 = BASE.plus(BYTES_PER_REGION);
    assert!(straddler < region1 && straddler.plus(s.object_bytes()) > region1);
    let target = heap.span(small).object_base(5);

    link(&mut heap, first.plus(8), last);
    link(&mut heap, last.plus(8), target);
    // Points at the half of the straddling object inside region 1.
    link(&mut heap, last.plus(24), region1.plus(64));

    let info = roots(vec![first]);
    let want = reference(&heap, &info);
    assert_eq!(want.len(), 4);
    for config in configs() {
        let result = scan_with_config(&heap, &info, &config);
        assert_eq!(result.marks.marked(), want);
    }

    // Roots in both halves of the span, found through the dartboard.
    let info = roots(vec![first, region1.plus(64)]);
    let (marks, stats) = scan_from_dartboard(&heap, &info, &tiny_config());
    assert_eq!(marks, want);
    assert!(stats.partial_spans >= 2);
    assert!(stats.regions_scanned >= 2);
    assert!(marks.contains(&id_of(&heap, straddler)));
    for region in 0..2 {
        assert!(stats.region_scan_count(RegionId::of(ArenaId(0), region)) >= 1);
    }
}

#[test]
fn large_object_across_regions() {
    let mut heap = new_heap();
    let start = BASE.plus(BYTES_PER_REGION - 2 * PAGE_BYTES);
    let large = heap.new_span_large(start, 4, false);
    heap.set_object_type(large, 0, PAIR);
    let small = heap.new_span(BASE.plus(2 * BYTES_PER_REGION), 3, false);
    let target = heap.span(small).object_base(10);
    let unreachable = heap.span(small).object_base(11);

    // Pointer slot in the second region.
    link(&mut heap, start.plus(3 * PAGE_BYTES + 16), target);
    // Not a pointer slot: odd words hold data.
    heap.write_word(start.plus(24), unreachable.0);

    // Interior root into the part of the object in region 1.
    let info = roots(vec![start.plus(3 * PAGE_BYTES + 8)]);
    for config in configs() {
        let result = scan_with_config(&heap, &info, &config);
        assert_eq!(
            result.marks.marked(),
            vec![heap.span(large).first_object, id_of(&heap, target)]
        );
    }
    let (marks, stats) = scan_from_dartboard(&heap, &info, &tiny_config());
    assert_eq!(marks, reference(&heap, &info));
    assert!(stats.large_spans > 0);
}

#[test]
fn noscan_objects_are_not_scanned() {
    let mut heap = new_heap();
    let noscan = heap.new_span(BASE, 6, true);
    let other = heap.new_span(BASE.plus(PAGE_BYTES), 6, false);
    let leaf = heap.span(noscan).object_base(2);
    let hidden = heap.span(other).object_base(1);
    heap.write_word(leaf, hidden.0);

    let info = roots(vec![leaf]);
    for config in configs() {
        let result = scan_with_config(&heap, &info, &config);
        assert_eq!(result.marks.marked(), vec![id_of(&heap, leaf)]);
        assert_eq!(result.stats.noscan_bytes, 64);
        assert_eq!(result.stats.heap_bytes, 0);
    }
    let (marks, stats) = scan_from_dartboard(&heap, &info, &tiny_config());
    assert_eq!(marks, vec![id_of(&heap, leaf)]);
    assert_eq!(stats.noscan_bytes, 64);
}

#[test]
fn allocate_black_is_marked_not_scanned() {
    let mut heap = new_heap();
    let span = heap.new_span(BASE, 4, false);
    let black = heap.span(span).object_base(0);
    let child = heap.span(span).object_base(1);
    let root = heap.span(span).object_base(2);
    link(&mut heap, black, child);
    link(&mut heap, root, black);

    let info = GcInfo {
        roots: vec![root],
        alloc_black: vec![black],
        ..Default::default()
    };
    for config in configs() {
        let result = scan_with_config(&heap, &info, &config);
        assert_eq!(
            result.marks.marked(),
            vec![id_of(&heap, black), id_of(&heap, root)]
        );
        assert_eq!(result.stats.alloc_black_bytes, 32);
    }
    assert_eq!(reference(&heap, &info).len(), 2);
}

#[test]
fn non_heap_values_are_dropped() {
    let mut heap = new_heap();
    let span = heap.new_span(BASE, 3, false);
    let obj = heap.span(span).object_base(0);
    // 341 objects of 24 bytes leave one word of tail in the page.
    let tail = heap.span(span).end;
    assert!(heap.find_object(tail).is_none());
    link(&mut heap, obj, tail);
    link(&mut heap, obj.plus(8), VAddr(0x7fff_0000_0000));
    link(&mut heap, obj.plus(16), BASE.plus(5 * PAGE_BYTES));

    let info = GcInfo {
        roots: vec![obj, VAddr(0x10), VAddr(0xdead_0000_0000)],
        wb_roots: vec![VAddr(0)],
        ..Default::default()
    };
    for config in configs() {
        let result = scan_with_config(&heap, &info, &config);
        assert_eq!(result.marks.marked(), vec![id_of(&heap, obj)]);
    }
    let result = scan_with_config(&heap, &info, &tiny_config());
    assert!(result.stats.dropped_addrs >= 2);
    let (marks, _) = scan_from_dartboard(&heap, &info, &tiny_config());
    assert_eq!(marks, vec![id_of(&heap, obj)]);
}

#[test]
fn write_barrier_roots() {
    let mut heap = new_heap();
    let span = heap.new_span(BASE, 2, false);
    let a = heap.span(span).object_base(4);
    let b = heap.span(span).object_base(9);
    let info = GcInfo {
        roots: vec![a],
        wb_roots: vec![b.plus(8)],
        ..Default::default()
    };
    let result = scan(&heap, &info);
    assert_eq!(result.marks.marked(), vec![id_of(&heap, a), id_of(&heap, b)]);
}

#[test]
fn scanning_is_idempotent() {
    let heap = random_heap(7);
    let info = random_roots(&heap, 7, 1);
    let first = scan_with_config(&heap, &info, &tiny_config());
    let second = scan_with_config(&heap, &info, &tiny_config());
    assert_eq!(first.marks.marked(), second.marks.marked());
}

#[test]
fn drain_policies_agree() {
    let heap = random_heap(11);
    let info = random_roots(&heap, 11, 1);
    let want = reference(&heap, &info);
    for policy in [
        DrainPolicy::Fifo,
        DrainPolicy::Lifo,
        DrainPolicy::Sparsest,
        DrainPolicy::Densest,
        DrainPolicy::Random,
        DrainPolicy::Address,
    ] {
        let mut config = tiny_config();
        config.drain_policy = policy;
        let result = scan_with_config(&heap, &info, &config);
        assert_eq!(result.marks.marked(), want, "{:?}", policy);
    }
}

#[test]
fn multiple_workers() {
    let heap = random_heap(3);
    for workers in [2, 4, 7] {
        let info = random_roots(&heap, 3, workers);
        let want = reference(&heap, &info);
        for config in [Config::default(), tiny_config()] {
            let result = scan_with_config(&heap, &info, &config);
            assert_eq!(result.marks.marked(), want, "{} workers", workers);
        }
    }
}

#[test]
fn random_heaps_match_reference() {
    for seed in 0..6 {
        let heap = random_heap(seed);
        let info = random_roots(&heap, seed, 1 + seed as usize % 3);
        let want = reference(&heap, &info);
        for config in configs() {
            let mut config = config;
            config.validate_marks = true;
            let result = scan_with_config(&heap, &info, &config);
            assert_eq!(result.marks.marked(), want, "seed {}", seed);
            assert!(result.comparison.map_or(false, |c| c.is_match()));
        }
        let (marks, _) = scan_from_dartboard(&heap, &info, &tiny_config());
        assert_eq!(marks, want, "seed {} from dartboard", seed);
    }
}

#[test]
fn flush_completeness() {
    let heap = random_heap(5);
    let config = tiny_config();
    let scanner = match Scanner::new(&heap, &config, 1) {
        Ok(scanner) => scanner,
        Err(e) => panic!("{}", e),
    };
    let mut rng = StdRng::seed_from_u64(5);
    let objects: Vec<VAddr> = heap.objects().map(|(addr, _)| addr).collect();
    let mut pushed = vec![];
    let mut junk = 0;
    let mut stats = ScanStats::default();
    {
        let mut top = scanner.network().top(0).lock();
        for _ in 0..5000 {
            let addr = if rng.gen_ratio(1, 10) {
                junk += 1;
                VAddr(0x7000_0000_0000 + rng.gen_range(0..1u64 << 20) * 8)
            } else {
                objects[rng.gen_range(0..objects.len())].plus(8 * rng.gen_range(0..2))
            };
            if addr.0 < 0x7000_0000_0000 {
                pushed.push(addr);
            }
            scanner.enqueue(&mut stats, 0, &mut top, addr);
        }
    }
    scanner.router().flush_all(&mut stats);
    assert!(scanner.network().is_drained());
    assert_eq!(scanner.network().pending(), 0);

    let board = scanner.dartboard();
    for &addr in &pushed {
        let laddr = heap.vaddr_to_laddr(addr).to_laddr64();
        assert!(
            board.arena(laddr.arena()).test_dart(laddr.arena_word()),
            "no dart for {}",
            addr
        );
    }
    pushed.sort_unstable();
    pushed.dedup();
    assert_eq!(board.total_darts(), pushed.len());
    assert_eq!(stats.darts_new, pushed.len());
    assert_eq!(stats.dropped_addrs, junk);

    let queued = board.queue.len();
    let mut regions: Vec<u64> = pushed.iter().map(|a| a.0 / BYTES_PER_REGION as u64).collect();
    regions.dedup();
    assert_eq!(queued, regions.len());
}

#[test]
fn empty_heap() {
    let heap = Heap::with_default_classes();
    let result = scan(&heap, &roots(vec![VAddr(0x1234_0000)]));
    assert_eq!(result.marks.count(), 0);
}

#[test]
#[should_panic(expected = "invalid scan configuration")]
fn invalid_config_panics() {
    let heap = random_heap(1);
    let mut config = Config::default();
    config.network.fan_in = 1;
    scan_with_config(&heap, &GcInfo::default(), &config);
}

#[test]
#[should_panic(expected = "invalid scan configuration")]
fn invalid_config_panics_on_empty_heap() {
    let heap = Heap::with_default_classes();
    let mut config = Config::default();
    config.network.fan_in = 1;
    scan_with_config(&heap, &GcInfo::default(), &config);
}

#[test]
#[should_panic(expected = "invalid scan configuration: ")]
fn zero_workers_panics_on_empty_heap() {
    let heap = Heap::with_default_classes();
    let info = GcInfo {
        workers: 0,
        ..GcInfo::default()
    };
    scan(&heap, &info);
}

#[test]
fn empty_heap_still_compares_marks() {
    let heap = Heap::with_default_classes();
    let config = Config {
        validate_marks: true,
        ..Config::default()
    };
    let result = scan_with_config(&heap, &roots(vec![VAddr(0x1234_0000)]), &config);
    let cmp = result.comparison.expect("comparison requested");
    assert!(cmp.is_match());
    assert_eq!(result.marks.count(), 0);
}

fn random_heap(seed: u64) -> Heap {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut heap = new_heap();
    let mut spans = vec![];

    for arena in [BASE, BASE.plus(3 * ARENA_BYTES)] {
        let mut page = rng.gen_range(0..40);
        for _ in 0..30 {
            let base = arena.plus(page * PAGE_BYTES);
            let noscan = rng.gen_ratio(1, 8);
            let span = if rng.gen_ratio(1, 10) {
                let span = heap.new_span_large(base, rng.gen_range(1..20), noscan);
                if !noscan {
                    heap.set_object_type(span, 0, PAIR);
                }
                span
            } else {
                let class = rng.gen_range(1..NUM_SIZE_CLASSES);
                if noscan || class <= 26 {
                    heap.new_span(base, class, noscan)
                } else {
                    typed_span(&mut heap, base, class)
                }
            };
            spans.push(span);
            page += heap.span(span).pages + rng.gen_range(0..40);
        }
    }

    let objects: Vec<VAddr> = heap.objects().map(|(addr, _)| addr).collect();
    for &span in &spans {
        let (count, words, start) = {
            let s = heap.span(span);
            (s.object_count(), s.object_bytes() / WORD_BYTES, s.start)
        };
        for _ in 0..rng.gen_range(0..24) {
            let obj = start.plus(rng.gen_range(0..count) * words * WORD_BYTES);
            let target = objects[rng.gen_range(0..objects.len())];
            let target = target.plus(8 * rng.gen_range(0..2));
            let slot = match heap.span(span).heap_bits {
                HeapBits::Packed(_) => obj.plus(8 * rng.gen_range(0..words)),
                HeapBits::Header(_) => obj.plus(8 + 16 * rng.gen_range(0..(words - 1) / 2)),
                HeapBits::Oob(_) => obj.plus(16 * rng.gen_range(0..words / 2)),
                // Never read.
                HeapBits::None => obj.plus(8 * rng.gen_range(0..words)),
            };
            link(&mut heap, slot, target);
            // Data words that happen to look like pointers.
            if rng.gen_ratio(1, 4) && words > 1 {
                let data = match heap.span(span).heap_bits {
                    HeapBits::Header(_) | HeapBits::Oob(_) => slot.plus(8),
                    _ => continue,
                };
                heap.write_word(data, objects[rng.gen_range(0..objects.len())].0);
            }
        }
    }
    heap
}

fn random_roots(heap: &Heap, seed: u64, workers: usize) -> GcInfo {
    let mut rng = StdRng::seed_from_u64(seed ^ 0x5eed);
    let objects: Vec<VAddr> = heap.objects().map(|(addr, _)| addr).collect();
    let mut pick = |n: usize| -> Vec<VAddr> {
        (0..n)
            .map(|_| objects[rng.gen_range(0..objects.len())])
            .collect()
    };
    let roots = pick(20);
    let wb_roots = pick(5);
    let alloc_black = pick(5);
    GcInfo {
        workers,
        roots,
        wb_roots,
        alloc_black,
    }
}
