//! Page allocation benchmarks.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use tracevault::region::{RegionConfig, TraceRegion};
use tracevault::segment::HeapSegment;

const PAGE_SIZE: usize = 4096;

fn bench_alloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("page_alloc_free");

    for pages in [16, 64, 256, 1024] {
        let segment = Arc::new(HeapSegment::new(pages * PAGE_SIZE).unwrap());
        let config = RegionConfig::new(1, pages, "bench", 0);
        let region = TraceRegion::init(segment, &config).unwrap();

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(pages), &region, |b, region| {
            b.iter(|| {
                let page = region.alloc_page(0).expect("region not exhausted");
                region.free_page(page.offset(), 0);
            });
        });
    }

    group.finish();
}

fn bench_concurrent_producers(c: &mut Criterion) {
    let mut group = c.benchmark_group("page_alloc_concurrent");

    let segment = Arc::new(HeapSegment::new(1024 * PAGE_SIZE).unwrap());
    let config = RegionConfig::new(4, 1024, "bench", 0);
    let region = Arc::new(TraceRegion::init(segment, &config).unwrap());

    group.throughput(Throughput::Elements(400));
    group.bench_function("4_cpus_100_ops_each", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..4)
                .map(|cpu| {
                    let region = Arc::clone(&region);
                    std::thread::spawn(move || {
                        for _ in 0..100 {
                            if let Ok(page) = region.alloc_page(cpu) {
                                region.free_page(page.offset(), cpu);
                            }
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }
        });
    });

    group.finish();
}

fn bench_recovery(c: &mut Criterion) {
    let mut group = c.benchmark_group("recovery");

    // A half-full region: the walk cost recovery actually pays at boot.
    let segment = Arc::new(HeapSegment::new(1024 * PAGE_SIZE).unwrap());
    let config = RegionConfig::new(2, 1024, "bench", 0);
    {
        let region = TraceRegion::init(Arc::clone(&segment), &config).unwrap();
        for i in 0..region.data_page_count() / 2 {
            region.alloc_page(i % 2).unwrap();
        }
    }

    group.bench_function("1024_pages_half_allocated", |b| {
        b.iter(|| {
            let region = TraceRegion::init(Arc::clone(&segment), &config).unwrap();
            assert!(region.persistent_session().is_some());
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_alloc_free,
    bench_concurrent_producers,
    bench_recovery
);
criterion_main!(benches);
