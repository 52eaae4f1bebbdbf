use ferrojem::{ArenaParams, Heap, Options, Poison, PtrInfoTag};
use proptest::prelude::*;

fn heap() -> Heap {
  let mut opts = Options::default();
  opts.poison = Poison::None;
  Heap::new(opts).unwrap()
}

fn fill(ptr: *mut u8, len: usize, seed: u8) {
  for i in 0..len {
    unsafe { *ptr.add(i) = seed.wrapping_add(i as u8) };
  }
}

fn check(ptr: *const u8, len: usize, seed: u8) -> bool {
  (0..len).all(|i| unsafe { *ptr.add(i) } == seed.wrapping_add(i as u8))
}

#[test]
fn sizes_across_every_class_type() {
  let heap = heap();
  for size in [1, 8, 17, 300, 3000, 5000, 100_000, 1 << 20, 5 << 20] {
    let p = heap.malloc(size).unwrap().as_ptr();
    assert!(heap.usable_size(p) >= size);
    fill(p, size, 3);
    assert!(check(p, size, 3));
    let info = heap.ptr_info(p);
    assert_eq!(info.tag, PtrInfoTag::LiveAlloc);
    assert_eq!(info.addr, p);
    unsafe { heap.free(p) };
  }
}

#[test]
fn private_arenas_are_isolated() {
  let heap = heap();
  let id = heap.create_arena(&ArenaParams::default());
  let p = heap.arena_malloc(id, 64).unwrap().as_ptr();
  assert_eq!(heap.ptr_info(p).arena_id, id);
  let q = heap.malloc(64).unwrap().as_ptr();
  assert_ne!(heap.ptr_info(q).arena_id, id);

  let z = heap.arena_calloc(id, 8, 8).unwrap().as_ptr();
  assert!(check_zero(z, 64));
  unsafe {
    heap.arena_free(id, p);
    heap.arena_free(id, z);
    heap.free(q);
  }
  heap.dispose_arena(id);
}

fn check_zero(ptr: *const u8, len: usize) -> bool {
  (0..len).all(|i| unsafe { *ptr.add(i) } == 0)
}

proptest! {
  #![proptest_config(ProptestConfig::with_cases(64))]

  #[test]
  fn realloc_preserves_prefix(first in 1usize..70_000, second in 1usize..70_000, seed: u8) {
    let heap = heap();
    let p = heap.malloc(first).unwrap().as_ptr();
    fill(p, first, seed);
    let q = unsafe { heap.realloc(p, second) }.unwrap().as_ptr();
    prop_assert!(heap.usable_size(q) >= second);
    prop_assert!(check(q, first.min(second), seed));
    unsafe { heap.free(q) };
  }

  #[test]
  fn live_allocations_never_overlap(sizes in proptest::collection::vec(1usize..20_000, 1..40)) {
    let heap = heap();
    let mut live: Vec<(usize, usize)> = sizes
      .iter()
      .map(|&size| {
        let p = heap.malloc(size).unwrap().as_ptr();
        (p as usize, heap.usable_size(p))
      })
      .collect();
    live.sort_unstable();
    for pair in live.windows(2) {
      prop_assert!(pair[0].0 + pair[0].1 <= pair[1].0);
    }
    for (addr, _) in live {
      unsafe { heap.free(addr as *mut u8) };
    }
  }

  #[test]
  fn memalign_honors_alignment(shift in 3u32..16, size in 1usize..10_000) {
    let heap = heap();
    let alignment = 1usize << shift;
    let p = heap.memalign(alignment, size).unwrap().as_ptr();
    prop_assert_eq!(p as usize % alignment, 0);
    prop_assert!(heap.usable_size(p) >= size);
    unsafe { heap.free(p) };
  }
}
