//! Heap statistics and pointer introspection results.

use crate::{options::Options, size_class::NUM_SMALL_CLASSES};

/// Usage of one small size class, summed over all arenas.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct BinStats {
  pub size: usize,
  /// Runs with at least one free region.
  pub num_non_full_runs: usize,
  pub num_runs: usize,
  /// Free regions in non-full runs, in bytes.
  pub bytes_unused: usize,
  /// Region bytes of every run, headers excluded.
  pub bytes_total: usize,
  pub bytes_per_run: usize,
}

/// Heap-wide totals. All sizes are in bytes.
#[derive(Clone, Copy, Debug)]
pub struct HeapStats {
  pub options: Options,
  pub narenas: usize,
  pub mapped: usize,
  pub allocated: usize,
  /// Committed memory that is neither allocated, dirty, bookkeeping nor
  /// unused bin space.
  pub waste: usize,
  pub pages_dirty: usize,
  pub pages_fresh: usize,
  pub pages_madvised: usize,
  pub bookkeeping: usize,
  pub bin_unused: usize,
  pub num_operations: u64,
  pub bins: [BinStats; NUM_SMALL_CLASSES],
}

impl HeapStats {
  pub(crate) fn new(options: Options) -> Self {
    Self {
      options,
      narenas: 0,
      mapped: 0,
      allocated: 0,
      waste: 0,
      pages_dirty: 0,
      pages_fresh: 0,
      pages_madvised: 0,
      bookkeeping: 0,
      bin_unused: 0,
      num_operations: 0,
      bins: [BinStats::default(); NUM_SMALL_CLASSES],
    }
  }
}

/// Cheap subset of [`HeapStats`] that takes no arena lock.
#[repr(C)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct StatsLite {
  pub allocated_bytes: usize,
  pub num_operations: u64,
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PtrInfoTag {
  /// Not a pointer into memory this heap manages.
  Unknown,
  LiveAlloc,
  /// Inside a region that was handed out and freed since.
  FreedAlloc,
  /// Inside a free page.
  FreedPage,
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PtrInfo {
  pub tag: PtrInfoTag,
  /// Start of the allocation or page containing the pointer.
  pub addr: *mut u8,
  pub size: usize,
  pub arena_id: u64,
}

impl PtrInfo {
  pub(crate) const UNKNOWN: Self = Self {
    tag: PtrInfoTag::Unknown,
    addr: core::ptr::null_mut(),
    size: 0,
    arena_id: 0,
  };
}
