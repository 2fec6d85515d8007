use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use segmalloc::SegMalloc;
use std::hint::black_box;

const OPS: u64 = 100_000;
const ARENA: usize = 64 << 20;

/// segmalloc alloc/free throughput.
fn segmalloc_malloc_free(malloc: &SegMalloc, size: usize) {
  for _ in 0..OPS {
    let ptr = malloc.allocate(size).unwrap();
    black_box(ptr);
    unsafe { malloc.free(ptr) };
  }
}

/// libc alloc/free throughput.
fn libc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = libc::malloc(size);
      black_box(ptr);
      libc::free(ptr);
    }
  }
}

/// Batches of live blocks freed in reverse, so splitting and coalescing both run.
fn segmalloc_batch(malloc: &SegMalloc, size: usize, live: &mut Vec<std::ptr::NonNull<u8>>) {
  for _ in 0..OPS / 1000 {
    for _ in 0..1000 {
      live.push(malloc.allocate(size).unwrap());
    }
    while let Some(ptr) = live.pop() {
      unsafe { malloc.free(ptr) };
    }
  }
}

fn benchmark_malloc_throughput(c: &mut Criterion) {
  let malloc = SegMalloc::new(ARENA).unwrap();
  let mut group = c.benchmark_group("malloc_throughput");

  for size in [16, 64, 256, 1024, 4096] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("segmalloc", size), &size, |b, &size| {
      b.iter(|| segmalloc_malloc_free(&malloc, size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
}

fn benchmark_batch(c: &mut Criterion) {
  let malloc = SegMalloc::new(ARENA).unwrap();
  let mut live = Vec::with_capacity(1000);
  let mut group = c.benchmark_group("malloc_batch");

  for size in [24, 200, 2000] {
    group.throughput(Throughput::Elements(OPS));
    group.bench_with_input(BenchmarkId::new("segmalloc", size), &size, |b, &size| {
      b.iter(|| segmalloc_batch(&malloc, size, &mut live))
    });
  }

  group.finish();
}

criterion_group!(benches, benchmark_malloc_throughput, benchmark_batch);
criterion_main!(benches);
