use ferrojem::{Heap, MayPurgeResult, Options, Poison};

fn heap() -> Heap {
  let mut opts = Options::default();
  opts.poison = Poison::None;
  Heap::new(opts).unwrap()
}

fn touch(ptr: *mut u8, len: usize) {
  for i in (0..len).step_by(4096) {
    unsafe { *ptr.add(i) = 1 };
  }
}

#[test]
fn deferred_purge_queues_until_asked() {
  let heap = heap();
  assert!(!heap.enable_deferred_purge(true));

  let blocks: Vec<_> = (0..64).map(|_| heap.malloc(64 << 10).unwrap().as_ptr()).collect();
  for p in blocks {
    unsafe { heap.free(p) };
  }

  let mut guard = 0;
  loop {
    match heap.may_purge_now(false, 0, None) {
      MayPurgeResult::Done => break,
      MayPurgeResult::NeedsMore | MayPurgeResult::WantsLater => {}
    }
    guard += 1;
    assert!(guard < 10_000, "purge never converged");
  }
  assert_eq!(heap.may_purge_now(true, 0, None), MayPurgeResult::Done);
  assert!(heap.enable_deferred_purge(false));
}

#[test]
fn free_dirty_pages_empties_dirty_counts() {
  let heap = heap();
  let p = heap.malloc(256 << 10).unwrap().as_ptr();
  touch(p, 256 << 10);
  unsafe { heap.free(p) };
  heap.free_dirty_pages();
  assert_eq!(heap.stats().pages_dirty, 0);
}

#[test]
fn excess_purge_respects_the_budget() {
  let mut opts = Options::default();
  opts.poison = Poison::None;
  opts.dirty_max = 16;
  let heap = Heap::new(opts).unwrap();

  let blocks: Vec<_> = (0..8).map(|_| heap.malloc(64 << 10).unwrap().as_ptr()).collect();
  for &p in &blocks {
    touch(p, 64 << 10);
  }
  for p in blocks {
    unsafe { heap.free(p) };
  }
  heap.free_excess_dirty_pages();
  assert!(heap.stats().pages_dirty <= 16);
}

#[test]
#[cfg(not(feature = "decommit"))]
fn hard_purge_turns_madvised_pages_fresh() {
  let heap = heap();
  let size = 128 << 10;
  let p = heap.malloc(size).unwrap().as_ptr();
  touch(p, size);
  unsafe { heap.free(p) };
  heap.free_dirty_pages();
  heap.purge_freed_pages();
  let stats = heap.stats();
  assert_eq!(stats.pages_dirty, 0);
  assert_eq!(stats.pages_madvised, 0);
}
