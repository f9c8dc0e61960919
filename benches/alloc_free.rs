//! Allocator benchmarks.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fmem::Fmem;
use std::ptr::NonNull;

/// An allocator over a plain heap buffer; the buffer is leaked so the
/// region stays valid for the benchmark's whole lifetime.
fn heap_allocator(len: usize) -> Fmem {
    let buf: &'static mut [u64] = Vec::leak(vec![0u64; len.div_ceil(8)]);
    let region = NonNull::new(buf.as_mut_ptr() as *mut u8).unwrap();
    unsafe { Fmem::create_new(region, len, 0, None).unwrap() }
}

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_free_cycle");

    for size in [64u32, 1024, 16 * 1024] {
        let fm = heap_allocator(4 * 1024 * 1024);

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let mem = fm.alloc(size).expect("region not exhausted");
                unsafe { fm.free(mem).expect("free succeeds") };
            });
        });
    }

    group.finish();
}

fn bench_alloc_with_long_walk(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_with_long_walk");

    // Free space normally stays right next to the ring head (carves cut from
    // the tail), making the walk O(1). Worst case is a hole at the far end
    // of a full region: size the region so a ladder of busy pages exhausts
    // it, then free the very first allocation, which sits at the region
    // tail. Every alloc now walks the whole ladder.
    let h = Fmem::PAGE_OVERHEAD;
    for busy_pages in [16usize, 128, 1024] {
        let region_len = (2 * h + Fmem::ACCOUNTING_OVERHEAD) + busy_pages * (256 + h) + 128;
        let fm = heap_allocator(region_len);

        let ladder: Vec<_> = (0..busy_pages).map(|_| fm.alloc(256).unwrap()).collect();
        // The first allocation is the tail-most page.
        unsafe { fm.free(ladder[0]).expect("free succeeds") };

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::from_parameter(busy_pages),
            &busy_pages,
            |b, _| {
                b.iter(|| {
                    let mem = fm.alloc(256).expect("tail hole available");
                    unsafe { fm.free(mem).expect("free succeeds") };
                });
            },
        );
    }

    group.finish();
}

fn bench_contended_alloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended_alloc_free");

    let fm = std::sync::Arc::new(heap_allocator(16 * 1024 * 1024));

    group.throughput(Throughput::Elements(400));
    group.bench_function("4_threads_100_cycles_each", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let fm = std::sync::Arc::clone(&fm);
                    std::thread::spawn(move || {
                        for _ in 0..100 {
                            if let Ok(mem) = fm.alloc(1024) {
                                unsafe { fm.free(mem).unwrap() };
                            }
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_alloc_free_cycle,
    bench_alloc_with_long_walk,
    bench_contended_alloc_free
);
criterion_main!(benches);
