use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use ferrojem::{ArenaParams, Heap, Options};
use std::hint::black_box;

const OPS: u64 = 100_000;
const BATCH: usize = 256;

/// Sizes landing in the tiny, quantum, sub-page, large and huge classes.
const SIZES: [usize; 6] = [8, 96, 1024, 3000, 64 << 10, 2 << 20];

fn global_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = ferrojem::ralloc_malloc(size);
      black_box(ptr);
      ferrojem::ralloc_free(ptr);
    }
  }
}

fn libc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = libc::malloc(size);
      black_box(ptr);
      libc::free(ptr);
    }
  }
}

/// Fills a batch before freeing it, so runs are split and coalesced rather
/// than one region bouncing in and out of the same bin.
fn batched(heap: &Heap, arena: Option<u64>, size: usize) {
  let mut live = [core::ptr::null_mut::<u8>(); BATCH];
  for _ in 0..OPS as usize / BATCH {
    for slot in live.iter_mut() {
      let ptr = match arena {
        Some(id) => heap.arena_malloc(id, size),
        None => heap.malloc(size),
      };
      *slot = ptr.map_or(core::ptr::null_mut(), |p| p.as_ptr());
    }
    for &ptr in live.iter().rev() {
      unsafe {
        match arena {
          Some(id) => heap.arena_free(id, black_box(ptr)),
          None => heap.free(black_box(ptr)),
        }
      }
    }
  }
}

fn benchmark_malloc_throughput(c: &mut Criterion) {
  let mut group = c.benchmark_group("malloc_throughput");
  group.throughput(Throughput::Elements(OPS));

  for size in SIZES {
    group.bench_with_input(BenchmarkId::new("ferrojem", size), &size, |b, &size| {
      b.iter(|| global_malloc_free(size))
    });
    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
}

fn benchmark_batched(c: &mut Criterion) {
  let mut group = c.benchmark_group("malloc_batched");
  group.throughput(Throughput::Elements(OPS));

  let Ok(heap) = Heap::new(Options::default()) else {
    return;
  };
  let private = heap.create_arena(&ArenaParams::default());

  for size in SIZES {
    group.bench_with_input(BenchmarkId::new("default_arena", size), &size, |b, &size| {
      b.iter(|| batched(&heap, None, size))
    });
    group.bench_with_input(BenchmarkId::new("private_arena", size), &size, |b, &size| {
      b.iter(|| batched(&heap, Some(private), size))
    });
  }

  group.finish();
  heap.dispose_arena(private);
}

criterion_group!(benches, benchmark_malloc_throughput, benchmark_batched);
criterion_main!(benches);
