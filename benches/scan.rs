use cnet::{
    addr::{LAddr32, VAddr},
    flush::{bucket_sort, histogram},
    gc_info::GcInfo,
    globals::PAGE_BYTES,
    heap::Heap,
    scan_with_config, Config,
};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::{rngs::StdRng, Rng, SeedableRng};

const BASE: VAddr = VAddr(0xc0_0000_0000);

/// A heap of 64 byte objects, each pointing at `fan` random others.
fn build_heap(spans: usize, fan: usize) -> (Heap, Vec<VAddr>) {
    let mut rng = StdRng::seed_from_u64(42);
    let mut heap = Heap::with_default_classes();
    let mut objects = vec![];
    for i in 0..spans {
        let span = heap.new_span(BASE.plus(i * PAGE_BYTES), 6, false);
        let s = heap.span(span);
        objects.extend((0..s.object_count()).map(|j| s.object_base(j)));
    }
    for &obj in &objects {
        for k in 0..fan {
            let slot = obj.plus(8 * k);
            heap.set_pointer_word(slot);
            heap.write_word(slot, objects[rng.gen_range(0..objects.len())].0);
        }
    }
    (heap, objects)
}

pub fn bench_bucket_sort(c: &mut Criterion) {
    let mut group = c.benchmark_group("bucket sort");
    let mut rng = StdRng::seed_from_u64(1);
    for n in [1 << 10, 1 << 14] {
        let src: Vec<LAddr32> = (0..n).map(|_| LAddr32(rng.gen())).collect();
        let mut dst = vec![LAddr32(0); n];
        group.throughput(Throughput::Elements(n as u64));
        group.bench_function(BenchmarkId::from_parameter(n), |b| {
            b.iter(|| {
                let counts = histogram(&src, 12);
                bucket_sort(&src, &mut dst, &counts, 12);
            })
        });
    }
    group.finish();
}

pub fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan");
    group.sample_size(20);
    let (heap, objects) = build_heap(512, 2);
    for workers in [1, 4] {
        let info = GcInfo {
            workers,
            roots: objects.iter().step_by(1000).copied().collect(),
            ..Default::default()
        };
        group.bench_function(BenchmarkId::new("workers", workers), |b| {
            b.iter(|| scan_with_config(&heap, &info, &Config::default()).marks.count())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_bucket_sort, bench_scan);
criterion_main!(benches);
