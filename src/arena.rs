//! Arenas: chunk and run management, bins, and the small and large paths.
//!
//! Every mutable piece of an arena lives in [`ArenaState`] behind the arena
//! lock. Chunks are never handed back to the chunk allocator while that lock
//! is held: functions that may free a chunk return it to the caller instead.

mod purge;

pub(crate) use purge::{PurgeAction, PurgeCondition, PurgeResult};

use core::{
  cell::UnsafeCell,
  cmp::Ordering,
  ptr::null_mut,
  sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering},
};

use crate::{
  bin::{BIN_SIZES, Bin, RUN_MAGIC, Run},
  chunk::{
    ArenaChunk, CHUNK_DATA_PAGES, CHUNK_GUARD_PAGE, CHUNK_HEADER_NUM_PAGES, DirtyChunks,
    MAX_LARGE_CLASS, MadvisedChunks, OwnedChunks, PageFlags, PageMapEntry, PageState, RunsAvail,
  },
  extent::ChunkType,
  heap::Heap,
  list::{List, ListAdapter, ListLink},
  options::Poison,
  platform::{os_decommit, os_munmap, timestamp_ns},
  prng::Prng,
  rb::{RbAdapter, RbLink, RbTree},
  size_class::{
    CHUNK_SIZE, ClassType, MAX_BIN_CLASS, NUM_SMALL_CLASSES, PAGE_SIZE, PAGE_SIZE_2POW,
    PAGE_SIZE_MASK, SizeClass, page_ceiling,
  },
  stats::{HeapStats, PtrInfo, PtrInfoTag},
  sync::{LockMode, MaybeMutex},
};
#[cfg(feature = "decommit")]
use crate::platform::os_commit;

// =============================================================================
// Parameters
// =============================================================================

/// Small allocation randomization requested for a new arena.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub enum Randomize {
  /// Follow the heap options.
  #[default]
  Default,
  Enabled,
  Disabled,
}

#[derive(Clone, Copy, Default, Debug)]
pub struct ArenaParams {
  /// Dirty page budget before the global modifier applies. Zero picks an
  /// eighth of the heap's `dirty_max`.
  pub max_dirty: usize,
  /// Replaces a positive global modifier when non-zero.
  pub max_dirty_increase_override: i32,
  /// Replaces a negative global modifier when non-zero.
  pub max_dirty_decrease_override: i32,
  pub randomize_small: Randomize,
  /// The arena skips locking and may only be used from the main thread,
  /// which must be the one creating it.
  pub main_thread_only: bool,
}

// =============================================================================
// Arena
// =============================================================================

pub(crate) struct Arena {
  /// Membership in one of the collection's trees. Guarded by the collection
  /// lock.
  link: UnsafeCell<RbLink<Arena>>,
  /// Membership in the outstanding purge list. Guarded by the purge list lock.
  purge_link: UnsafeCell<ListLink<Arena>>,
  /// Zero once the arena is destroyed.
  id: AtomicU64,
  pub(crate) is_private: bool,
  pub(crate) is_main_thread_only: bool,
  randomize_small: AtomicBool,
  pub(crate) last_significant_reuse_ns: AtomicU64,
  // Updated under the arena lock, read without it.
  allocated_small: AtomicUsize,
  allocated_large: AtomicUsize,
  operations: AtomicU64,
  pub(crate) state: MaybeMutex<ArenaState>,
}

unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

pub(crate) struct ArenaState {
  arena: *mut Arena,
  /// Bytes of chunks owned, the spare included.
  mapped: usize,
  /// Committed pages, including dirty ones and chunk headers.
  committed: usize,
  /// Chunks with dirty pages that no purge is working on.
  chunks_dirty: RbTree<DirtyChunks>,
  /// Chunks that had pages `MADV_FREE`d, most recent first.
  chunks_madvised: List<MadvisedChunks>,
  chunks: List<OwnedChunks>,
  /// One empty chunk kept to avoid remapping. Its run is not in `runs_avail`.
  spare: *mut ArenaChunk,
  runs_avail: RbTree<RunsAvail>,
  pub(crate) num_dirty: usize,
  pub(crate) max_dirty: usize,
  max_dirty_base: usize,
  max_dirty_increase_override: i32,
  max_dirty_decrease_override: i32,
  num_madvised: usize,
  num_fresh: usize,
  is_purge_pending: bool,
  pub(crate) is_deferred_purge_enabled: bool,
  /// Disposal raced with a purge; the purge deletes the arena.
  must_delete_after_purge: bool,
  prng: Option<Prng>,
  bins: [Bin; NUM_SMALL_CLASSES],
}

unsafe impl Send for ArenaState {}

/// Arenas ordered by id.
pub(crate) struct ArenasById;

impl RbAdapter for ArenasById {
  type Node = Arena;

  fn link(node: *mut Arena) -> *mut RbLink<Arena> {
    unsafe { (*node).link.get() }
  }

  fn compare(a: *mut Arena, b: *mut Arena) -> Ordering {
    unsafe { (*a).id().cmp(&(*b).id()) }
  }
}

/// Arenas waiting for a deferred purge, oldest request last.
pub(crate) struct PurgeQueue;

impl ListAdapter for PurgeQueue {
  type Node = Arena;

  fn link(node: *mut Arena) -> *mut ListLink<Arena> {
    unsafe { (*node).purge_link.get() }
  }
}

#[inline]
unsafe fn entry<'a>(chunk: *mut ArenaChunk, page: usize) -> &'a mut PageMapEntry {
  unsafe { &mut *ArenaChunk::entry(chunk, page) }
}

/// Size of the live allocation at `page` of an arena chunk.
pub(crate) unsafe fn size_in_chunk(chunk: *mut ArenaChunk, page: usize) -> usize {
  unsafe {
    let e = entry(chunk, page);
    if e.is_large() {
      e.size()
    } else {
      let run: *mut Run = e.run(chunk);
      assert!((*run).magic == RUN_MAGIC, "Pointer is not in a run.");
      (*(*run).bin).size_class
    }
  }
}

impl Arena {
  /// Builds an arena in base memory. Null when out of memory. The id is
  /// assigned by the collection.
  pub(crate) fn create(heap: &Heap, params: Option<&ArenaParams>, is_private: bool) -> *mut Arena {
    let ptr = heap.base.alloc_arena();
    if ptr.is_null() {
      return null_mut();
    }

    let main_thread_only = params.is_some_and(|p| p.main_thread_only);
    let randomize_small = match params.map(|p| p.randomize_small) {
      Some(Randomize::Enabled) => true,
      Some(Randomize::Disabled) => false,
      _ => heap.randomize_small(),
    };
    let max_dirty_base = match params {
      Some(p) if p.max_dirty != 0 => p.max_dirty,
      _ => heap.options.dirty_max / 8,
    };
    let mode = if main_thread_only {
      LockMode::MainThreadOnly
    } else {
      LockMode::MustLock
    };

    unsafe {
      ptr.write(Arena {
        link: UnsafeCell::new(RbLink::new()),
        purge_link: UnsafeCell::new(ListLink::new()),
        id: AtomicU64::new(0),
        is_private,
        is_main_thread_only: main_thread_only,
        randomize_small: AtomicBool::new(randomize_small),
        last_significant_reuse_ns: AtomicU64::new(timestamp_ns()),
        allocated_small: AtomicUsize::new(0),
        allocated_large: AtomicUsize::new(0),
        operations: AtomicU64::new(0),
        state: MaybeMutex::new(
          ArenaState {
            arena: ptr,
            mapped: 0,
            committed: 0,
            chunks_dirty: RbTree::new(),
            chunks_madvised: List::new(),
            chunks: List::new(),
            spare: null_mut(),
            runs_avail: RbTree::new(),
            num_dirty: 0,
            max_dirty: 0,
            max_dirty_base,
            max_dirty_increase_override: params.map_or(0, |p| p.max_dirty_increase_override),
            max_dirty_decrease_override: params.map_or(0, |p| p.max_dirty_decrease_override),
            num_madvised: 0,
            num_fresh: 0,
            is_purge_pending: false,
            is_deferred_purge_enabled: heap.arenas.is_deferred_purge_enabled(),
            must_delete_after_purge: false,
            prng: None,
            bins: core::array::from_fn(|i| Bin::new(BIN_SIZES[i])),
          },
          mode,
        ),
      });
      (*ptr).update_max_dirty(heap.arenas.default_max_dirty_page_modifier());
    }
    ptr
  }

  /// Releases an arena that is out of every collection tree and queue.
  ///
  /// # Panics
  ///
  /// When the arena still holds small or large allocations.
  pub(crate) unsafe fn destroy(arena: *mut Arena, heap: &Heap) {
    let spare = unsafe {
      let this = &*arena;
      let mut st = this.state.lock();
      assert!(
        this.allocated_small.load(AtomicOrdering::Relaxed) == 0
          && this.allocated_large.load(AtomicOrdering::Relaxed) == 0,
        "Arena is not empty"
      );
      assert!(
        st.bins.iter().all(|b| b.non_full_runs.is_empty()),
        "Bin is not empty"
      );
      let spare = st.spare;
      st.spare = null_mut();
      this.id.store(0, AtomicOrdering::Relaxed);
      // A purge still holding the spare releases it itself.
      if !spare.is_null() && st.remove_chunk(spare) {
        spare
      } else {
        null_mut()
      }
    };
    unsafe {
      if !spare.is_null() {
        heap.chunks.dealloc(spare.cast(), CHUNK_SIZE, ChunkType::Arena, &heap.base);
      }
      heap.base.dealloc_arena(arena);
    }
  }

  #[inline]
  pub(crate) fn id(&self) -> u64 {
    self.id.load(AtomicOrdering::Relaxed)
  }

  pub(crate) fn set_id(&self, id: u64) {
    self.id.store(id, AtomicOrdering::Relaxed);
  }

  pub(crate) fn operations(&self) -> u64 {
    self.operations.load(AtomicOrdering::Relaxed)
  }

  pub(crate) fn allocated(&self) -> usize {
    self.allocated_small.load(AtomicOrdering::Relaxed)
      + self.allocated_large.load(AtomicOrdering::Relaxed)
  }

  #[inline]
  fn as_ptr(&self) -> *mut Arena {
    (self as *const Arena).cast_mut()
  }

  #[inline]
  fn count_op(&self) {
    self.operations.fetch_add(1, AtomicOrdering::Relaxed);
  }

  /// Recomputes `max_dirty` from the base budget and the global modifier,
  /// honoring this arena's overrides.
  pub(crate) fn update_max_dirty(&self, modifier: i32) {
    let mut st = self.state.lock();
    let mut modifier = modifier;
    if modifier > 0 && st.max_dirty_increase_override != 0 {
      modifier = st.max_dirty_increase_override;
    } else if modifier < 0 && st.max_dirty_decrease_override != 0 {
      modifier = st.max_dirty_decrease_override;
    }
    let base = st.max_dirty_base;
    let shift = modifier.unsigned_abs();
    st.max_dirty = if modifier >= 0 {
      match base.checked_shl(shift) {
        Some(v) if v >> shift == base => v,
        _ => usize::MAX,
      }
    } else {
      base.checked_shr(shift).unwrap_or(0)
    };
  }

  /// Re-reads the heap's randomization option and reseeds.
  pub(crate) fn reset_small_alloc_randomization(&self, enabled: bool) {
    if enabled {
      self.state.lock().prng = Some(Prng::from_entropy());
    }
    self.randomize_small.store(enabled, AtomicOrdering::Relaxed);
  }

  pub(crate) fn notify_significant_reuse(&self) {
    self
      .last_significant_reuse_ns
      .store(timestamp_ns(), AtomicOrdering::Relaxed);
  }

  // ===========================================================================
  // Allocation
  // ===========================================================================

  /// `size` must not be zero. Null when out of memory.
  pub(crate) unsafe fn malloc(&self, heap: &Heap, size: usize, zero: bool) -> *mut u8 {
    debug_assert!(size != 0);
    if size <= MAX_BIN_CLASS {
      unsafe { self.malloc_small(heap, size, zero) }
    } else if size <= MAX_LARGE_CLASS {
      unsafe { self.malloc_large(heap, size, zero) }
    } else {
      unsafe { self.malloc_huge(heap, size, zero) }
    }
  }

  unsafe fn malloc_small(&self, heap: &Heap, size: usize, zero: bool) -> *mut u8 {
    let class = SizeClass::new(size);
    let size = class.size();
    let bin_index = class.bin_index();
    let randomize = self.randomize_small.load(AtomicOrdering::Relaxed);

    let (ret, dirty_before, dirty_after) = {
      let mut guard = self.state.lock();
      let st = &mut *guard;
      if randomize && st.prng.is_none() {
        st.prng = Some(Prng::from_entropy());
      }
      let dirty_before = st.num_dirty;
      let run = unsafe { st.get_non_full_bin_run(heap, bin_index) };
      let dirty_after = st.num_dirty;
      if run.is_null() {
        return null_mut();
      }
      let prng = if randomize { st.prng.as_mut() } else { None };
      let ret = unsafe {
        debug_assert!((*run).num_free > 0);
        let ret = Run::alloc_region(run, &st.bins[bin_index], prng);
        (*run).num_free -= 1;
        ret
      };
      self.allocated_small.fetch_add(size, AtomicOrdering::Relaxed);
      self.count_op();
      (ret, dirty_before, dirty_after)
    };

    if dirty_after < dirty_before {
      self.notify_significant_reuse();
    }
    unsafe {
      if zero {
        ret.write_bytes(0, size);
      } else {
        heap.options.apply_zero_or_junk(ret, size);
      }
    }
    ret
  }

  unsafe fn malloc_large(&self, heap: &Heap, size: usize, zero: bool) -> *mut u8 {
    let size = page_ceiling(size);
    let (ret, dirty_before, dirty_after) = {
      let mut st = self.state.lock();
      let dirty_before = st.num_dirty;
      let ret = unsafe { st.alloc_run(heap, size, true, zero) };
      if ret.is_null() {
        return null_mut();
      }
      self.allocated_large.fetch_add(size, AtomicOrdering::Relaxed);
      self.count_op();
      (ret, dirty_before, st.num_dirty)
    };
    if dirty_after < dirty_before {
      self.notify_significant_reuse();
    }
    if !zero {
      unsafe { heap.options.apply_zero_or_junk(ret, size) };
    }
    ret
  }

  /// Aligned allocation. `alignment` is a power of two.
  pub(crate) unsafe fn palloc(&self, heap: &Heap, alignment: usize, size: usize) -> *mut u8 {
    let Some(ceil_size) = size.checked_add(alignment - 1).map(|s| s & !(alignment - 1)) else {
      return null_mut();
    };

    if ceil_size <= PAGE_SIZE || (alignment <= PAGE_SIZE && ceil_size <= MAX_LARGE_CLASS) {
      return unsafe { self.malloc(heap, ceil_size, false) };
    }

    // Sub-page alignment is not achievable past this point.
    let alignment = page_ceiling(alignment);
    let Some(ceil_size) = size
      .checked_add(PAGE_SIZE_MASK)
      .map(|_| page_ceiling(size))
      .filter(|c| c.checked_add(alignment).is_some())
    else {
      return null_mut();
    };

    // Over-sized run that is guaranteed to contain an aligned block.
    let run_size = if ceil_size >= alignment {
      ceil_size + alignment - PAGE_SIZE
    } else {
      alignment.checked_mul(2).map_or(usize::MAX, |a| a - PAGE_SIZE)
    };

    if run_size <= MAX_LARGE_CLASS {
      unsafe { self.palloc_large(heap, alignment, ceil_size, run_size) }
    } else if alignment <= CHUNK_SIZE {
      unsafe { self.malloc_huge(heap, ceil_size, false) }
    } else {
      unsafe { self.palloc_huge(heap, ceil_size, alignment, false) }
    }
  }

  /// Large allocation aligned beyond a page.
  unsafe fn palloc_large(&self, heap: &Heap, alignment: usize, size: usize, alloc_size: usize) -> *mut u8 {
    debug_assert!(size & PAGE_SIZE_MASK == 0 && alignment & PAGE_SIZE_MASK == 0);
    let (ret, dirty_before, dirty_after) = {
      let mut st = self.state.lock();
      let dirty_before = st.num_dirty;
      let mut ret = unsafe { st.alloc_run(heap, alloc_size, true, false) };
      if ret.is_null() {
        return null_mut();
      }
      let chunk = ArenaChunk::for_ptr(ret);
      let offset = ret as usize & (alignment - 1);
      debug_assert!(offset & PAGE_SIZE_MASK == 0 && offset < alloc_size);
      unsafe {
        if offset == 0 {
          st.trim_run_tail(chunk, ret, alloc_size, size, false);
        } else {
          let lead = alignment - offset;
          st.trim_run_head(chunk, ret, alloc_size, alloc_size - lead);
          ret = ret.add(lead);
          let trail = alloc_size - lead - size;
          if trail != 0 {
            st.trim_run_tail(chunk, ret, size + trail, size, false);
          }
        }
      }
      self.allocated_large.fetch_add(size, AtomicOrdering::Relaxed);
      self.count_op();
      (ret, dirty_before, st.num_dirty)
    };
    if dirty_after < dirty_before {
      self.notify_significant_reuse();
    }
    unsafe { heap.options.apply_zero_or_junk(ret, size) };
    ret
  }

  // ===========================================================================
  // Reallocation
  // ===========================================================================

  /// Resizes a live allocation of `old_size` bytes owned by this arena.
  pub(crate) unsafe fn ralloc(&self, heap: &Heap, ptr: *mut u8, size: usize, old_size: usize) -> *mut u8 {
    debug_assert!(size != 0);
    if size <= MAX_LARGE_CLASS {
      unsafe { self.ralloc_small_or_large(heap, ptr, size, old_size) }
    } else {
      unsafe { self.ralloc_huge(heap, ptr, size, old_size) }
    }
  }

  unsafe fn ralloc_small_or_large(&self, heap: &Heap, ptr: *mut u8, size: usize, old_size: usize) -> *mut u8 {
    let class = SizeClass::new(size);

    if old_size <= MAX_LARGE_CLASS && class.size() == old_size {
      if size < old_size {
        unsafe { heap.options.poison(ptr.add(size), old_size - size) };
      }
      return ptr;
    }

    if class.kind() == ClassType::Large && old_size > MAX_BIN_CLASS && old_size <= MAX_LARGE_CLASS {
      let chunk = ArenaChunk::for_ptr(ptr);
      if class.size() < old_size {
        // Poison before the tail becomes visible to other threads.
        unsafe {
          heap.options.poison(ptr.add(size), old_size - size);
          self.ralloc_shrink_large(heap, chunk, ptr, class.size(), old_size);
        }
        return ptr;
      }
      if unsafe { self.ralloc_grow_large(heap, chunk, ptr, class.size(), old_size) } {
        unsafe { heap.options.apply_zero_or_junk(ptr.add(old_size), size - old_size) };
        return ptr;
      }
    }

    let target = if self.is_private {
      self.as_ptr()
    } else {
      heap.choose_arena(size)
    };
    let ret = unsafe { (*target).malloc(heap, size, false) };
    if ret.is_null() {
      return null_mut();
    }
    unsafe {
      ret.copy_from_nonoverlapping(ptr, size.min(old_size));
      heap.idalloc(ptr, Some(self.as_ptr()));
    }
    ret
  }

  unsafe fn ralloc_shrink_large(&self, heap: &Heap, chunk: *mut ArenaChunk, ptr: *mut u8, size: usize, old_size: usize) {
    debug_assert!(size < old_size);
    let action = {
      let mut st = self.state.lock();
      unsafe { st.trim_run_tail(chunk, ptr, old_size, size, true) };
      self
        .allocated_large
        .fetch_sub(old_size - size, AtomicOrdering::Relaxed);
      self.count_op();
      st.should_start_purge()
    };
    unsafe { self.may_do_or_queue_purge(heap, action) };
  }

  /// Extends a large run in place into the free run following it.
  unsafe fn ralloc_grow_large(&self, heap: &Heap, chunk: *mut ArenaChunk, ptr: *mut u8, size: usize, old_size: usize) -> bool {
    let pageind = ArenaChunk::page_index(chunk, ptr);
    let npages = old_size >> PAGE_SIZE_2POW;
    let (dirty_before, dirty_after) = {
      let mut st = self.state.lock();
      unsafe {
        debug_assert_eq!(entry(chunk, pageind).size(), old_size);
        let next = pageind + npages;
        if next >= CHUNK_GUARD_PAGE
          || !entry(chunk, next).is_available()
          || entry(chunk, next).size() < size - old_size
        {
          return false;
        }
        let dirty_before = st.num_dirty;
        if !st.split_run(heap, ArenaChunk::page_addr(chunk, next), size - old_size, true, false) {
          return false;
        }
        entry(chunk, pageind).set(size, PageFlags::LARGE | PageFlags::ALLOCATED, PageState::Clean);
        entry(chunk, next).set(0, PageFlags::LARGE | PageFlags::ALLOCATED, PageState::Clean);
        self
          .allocated_large
          .fetch_add(size - old_size, AtomicOrdering::Relaxed);
        self.count_op();
        (dirty_before, st.num_dirty)
      }
    };
    if dirty_after < dirty_before {
      self.notify_significant_reuse();
    }
    true
  }

  // ===========================================================================
  // Statistics
  // ===========================================================================

  /// Adds this arena's numbers to `stats`.
  pub(crate) fn collect_stats(&self, stats: &mut HeapStats) {
    let st = self.state.lock();
    let mapped = st.mapped;
    let committed = st.committed << PAGE_SIZE_2POW;
    let allocated = self.allocated();
    let dirty = st.num_dirty << PAGE_SIZE_2POW;

    let mut unused = 0;
    let mut headers = 0;
    for (bin, out) in st.bins.iter().zip(stats.bins.iter_mut()) {
      let mut non_full = 0;
      let mut bin_unused = 0;
      for run in bin.non_full_runs.iter() {
        non_full += 1;
        bin_unused += unsafe { (*run).num_free } as usize * bin.size_class;
      }
      unused += bin_unused;
      headers += bin.num_runs * bin.run_first_region_offset;

      out.size = bin.size_class;
      out.num_non_full_runs += non_full;
      out.num_runs += bin.num_runs;
      out.bytes_unused += bin_unused;
      out.bytes_total += bin.num_runs * (bin.run_size() - bin.run_first_region_offset);
      out.bytes_per_run = bin.run_size();
    }

    debug_assert!(mapped >= committed);
    stats.mapped += mapped;
    stats.allocated += allocated;
    stats.pages_dirty += dirty;
    stats.pages_fresh += st.num_fresh << PAGE_SIZE_2POW;
    stats.pages_madvised += st.num_madvised << PAGE_SIZE_2POW;
    stats.waste += committed
      .saturating_sub(allocated)
      .saturating_sub(dirty)
      .saturating_sub(unused)
      .saturating_sub(headers);
    stats.bin_unused += unused;
    stats.bookkeeping += headers;
    stats.num_operations += self.operations();
    stats.narenas += 1;
  }

  /// Bytes of chunks this arena owns.
  pub(crate) fn mapped(&self) -> usize {
    self.state.lock().mapped
  }

  /// Unmaps every chunk, the spare included. Only for heap teardown.
  pub(crate) unsafe fn release_chunks(&self) {
    let st = unsafe { &mut *self.state.data_ptr() };
    loop {
      let chunk = unsafe { st.chunks.pop_front() };
      if chunk.is_null() {
        break;
      }
      unsafe { os_munmap(chunk.cast(), CHUNK_SIZE) };
    }
    st.spare = null_mut();
    st.mapped = 0;
  }
}

/// Describes what `ptr` points at inside a registered arena chunk. Reads the
/// page map without the arena lock, so the answer is only a snapshot.
pub(crate) unsafe fn ptr_info_in_chunk(chunk: *mut ArenaChunk, ptr: *const u8) -> PtrInfo {
  let arena_id = unsafe { (*(*chunk).arena).id() };
  let mut pageind = ArenaChunk::page_index(chunk, ptr);
  if pageind < CHUNK_HEADER_NUM_PAGES {
    return PtrInfo::UNKNOWN;
  }

  let e = unsafe { entry(chunk, pageind) };
  if !e.is_allocated() {
    return PtrInfo {
      tag: PtrInfoTag::FreedPage,
      addr: ptr.cast_mut().map_addr(|a| a & !PAGE_SIZE_MASK),
      size: PAGE_SIZE,
      arena_id,
    };
  }

  if e.is_large() {
    // Only the first page of a large run records its size.
    loop {
      let e = unsafe { entry(chunk, pageind) };
      if !e.is_large() {
        return PtrInfo::UNKNOWN;
      }
      if e.size() != 0 {
        return PtrInfo {
          tag: PtrInfoTag::LiveAlloc,
          addr: unsafe { ArenaChunk::page_addr(chunk, pageind) },
          size: e.size(),
          arena_id,
        };
      }
      pageind -= 1;
      if pageind < CHUNK_HEADER_NUM_PAGES {
        return PtrInfo::UNKNOWN;
      }
    }
  }

  let run: *mut Run = e.run(chunk);
  let bin = unsafe { &*(*run).bin };
  let first = run as usize + bin.run_first_region_offset;
  if (ptr as usize) < first {
    return PtrInfo::UNKNOWN;
  }
  let regind = (ptr as usize - first) / bin.size_class;
  if regind >= bin.run_num_regions as usize {
    return PtrInfo::UNKNOWN;
  }
  let tag = if unsafe { Run::region_is_free(run, regind as u32) } {
    PtrInfoTag::FreedAlloc
  } else {
    PtrInfoTag::LiveAlloc
  };
  PtrInfo {
    tag,
    addr: chunk.cast::<u8>().with_addr(first + regind * bin.size_class),
    size: bin.size_class,
    arena_id,
  }
}

// =============================================================================
// Free
// =============================================================================

/// Frees a small or large allocation at `offset` bytes into its chunk.
///
/// # Panics
///
/// On a double free, a pointer into a free page, or when `expected` names
/// another arena.
pub(crate) unsafe fn arena_dalloc(heap: &Heap, ptr: *mut u8, offset: usize, expected: Option<*mut Arena>) {
  debug_assert!(offset != 0);
  let chunk = ArenaChunk::for_ptr(ptr);
  let arena = unsafe { (*chunk).arena };
  assert!(!arena.is_null());
  assert!(expected.is_none_or(|a| a == arena), "Freeing with the wrong arena.");

  let pageind = offset >> PAGE_SIZE_2POW;
  // A bad free is reported under the lock below.
  if heap.options.poison != Poison::None && unsafe { entry(chunk, pageind).is_allocated() } {
    unsafe {
      let size = size_in_chunk(chunk, pageind);
      heap.options.poison(ptr, size);
    }
  }

  let this = unsafe { &*arena };
  let (released, action) = {
    debug_assert!(this.state.safe_on_this_thread());
    let mut st = this.state.lock();
    let released = unsafe {
      let e = entry(chunk, pageind);
      assert!(
        !matches!(
          e.state(),
          PageState::Madvised | PageState::Decommitted | PageState::Fresh
        ) && !e.flags().contains(PageFlags::ZEROED),
        "Freeing in a page with bad bits."
      );
      assert!(e.is_allocated(), "Double-free?");
      if e.is_large() {
        debug_assert!(ptr as usize & PAGE_SIZE_MASK == 0);
        this
          .allocated_large
          .fetch_sub(e.size(), AtomicOrdering::Relaxed);
        st.dalloc_run(ptr, true)
      } else {
        let (size, released) = st.dalloc_small(chunk, ptr, pageind);
        this.allocated_small.fetch_sub(size, AtomicOrdering::Relaxed);
        released
      }
    };
    this.count_op();
    (released, st.should_start_purge())
  };

  unsafe {
    if !released.is_null() {
      heap
        .chunks
        .dealloc(released.cast(), CHUNK_SIZE, ChunkType::Arena, &heap.base);
    }
    this.may_do_or_queue_purge(heap, action);
  }
}

// =============================================================================
// Chunks and runs
// =============================================================================

impl ArenaState {
  unsafe fn init_chunk(&mut self, heap: &Heap, chunk: *mut ArenaChunk, min_pages: usize) {
    debug_assert!(min_pages > 0 && min_pages <= CHUNK_DATA_PAGES);
    #[cfg(not(feature = "decommit"))]
    let _ = (heap, min_pages);
    unsafe {
      self.mapped += CHUNK_SIZE;
      ArenaChunk::reset_links(chunk);
      (*chunk).arena = self.arena;
      (*chunk).ndirty = 0;
      (*chunk).is_purging = false;
      (*chunk).dying = false;

      let mut i = 0;
      while i < CHUNK_HEADER_NUM_PAGES - 1 {
        entry(chunk, i).set(0, PageFlags::empty(), PageState::Clean);
        i += 1;
      }
      self.committed += CHUNK_HEADER_NUM_PAGES - 1;

      // Leading guard page.
      os_decommit(ArenaChunk::page_addr(chunk, i), PAGE_SIZE);
      entry(chunk, i).set(0, PageFlags::empty(), PageState::Decommitted);
      i += 1;

      #[cfg(feature = "decommit")]
      let fresh = min_pages + self.extra_commit_pages(heap, min_pages, CHUNK_DATA_PAGES - min_pages);
      #[cfg(not(feature = "decommit"))]
      let fresh = CHUNK_DATA_PAGES;

      for _ in 0..fresh {
        entry(chunk, i).set(0, PageFlags::ZEROED, PageState::Fresh);
        i += 1;
      }
      self.num_fresh += fresh;

      // Uncommitted data pages, then the trailing guard page.
      os_decommit(
        ArenaChunk::page_addr(chunk, i),
        (CHUNK_GUARD_PAGE + 1 - i) << PAGE_SIZE_2POW,
      );
      while i <= CHUNK_GUARD_PAGE {
        entry(chunk, i).set(0, PageFlags::empty(), PageState::Decommitted);
        i += 1;
      }

      entry(chunk, CHUNK_HEADER_NUM_PAGES).set_size(MAX_LARGE_CLASS);
      entry(chunk, CHUNK_GUARD_PAGE - 1).set_size(MAX_LARGE_CLASS);
      self.runs_avail.insert(ArenaChunk::entry(chunk, CHUNK_HEADER_NUM_PAGES));
      self.chunks.push_back(chunk);
    }
  }

  /// Forgets an empty chunk so the caller can release it. Returns false when
  /// a purge is working on it; the purge then finishes the removal.
  unsafe fn remove_chunk(&mut self, chunk: *mut ArenaChunk) -> bool {
    unsafe {
      (*chunk).dying = true;
      if (*chunk).is_purging {
        return false;
      }

      if (*chunk).ndirty > 0 {
        self.chunks_dirty.remove(chunk);
        self.num_dirty -= (*chunk).ndirty;
        self.committed -= (*chunk).ndirty;
      }

      let mut madvised = 0;
      let mut fresh = 0;
      for i in CHUNK_HEADER_NUM_PAGES..CHUNK_GUARD_PAGE {
        let e = entry(chunk, i);
        debug_assert!(!e.is_busy());
        match e.state() {
          PageState::Madvised => madvised += 1,
          PageState::Fresh => fresh += 1,
          _ => {}
        }
      }
      self.num_madvised -= madvised;
      self.num_fresh -= fresh;

      if self.chunks_madvised.contains(chunk) {
        self.chunks_madvised.remove(chunk);
      }
      self.mapped -= CHUNK_SIZE;
      self.committed -= CHUNK_HEADER_NUM_PAGES - 1;
      self.chunks.remove(chunk);
    }
    true
  }

  /// Makes an empty chunk the spare. Returns the previous spare when it can
  /// be released now, or null.
  unsafe fn demote_chunk_to_spare(&mut self, chunk: *mut ArenaChunk) -> *mut ArenaChunk {
    if !self.spare.is_null() && !unsafe { self.remove_chunk(self.spare) } {
      // The purge holding it will release it.
      self.spare = null_mut();
    }
    core::mem::replace(&mut self.spare, chunk)
  }

  /// Carves a run of `size` bytes from the lowest best fit, the spare, or a
  /// new chunk. Null when out of memory.
  unsafe fn alloc_run(&mut self, heap: &Heap, size: usize, large: bool, zero: bool) -> *mut u8 {
    debug_assert!(size <= MAX_LARGE_CLASS && size & PAGE_SIZE_MASK == 0);
    unsafe {
      let found = self
        .runs_avail
        .search_or_next_by(|n| size.cmp(&(*n).size()).then(Ordering::Less));
      let run = if !found.is_null() {
        let chunk = ArenaChunk::for_ptr(found);
        debug_assert!(!(*found).is_busy());
        ArenaChunk::page_addr(chunk, ArenaChunk::page_of(chunk, found))
      } else if !self.spare.is_null() && !(*self.spare).is_purging {
        let chunk = core::mem::replace(&mut self.spare, null_mut());
        self
          .runs_avail
          .insert(ArenaChunk::entry(chunk, CHUNK_HEADER_NUM_PAGES));
        ArenaChunk::page_addr(chunk, CHUNK_HEADER_NUM_PAGES)
      } else {
        let chunk = heap
          .chunks
          .alloc(CHUNK_SIZE, CHUNK_SIZE, &heap.base)
          .cast::<ArenaChunk>();
        if chunk.is_null() {
          return null_mut();
        }
        self.init_chunk(heap, chunk, size >> PAGE_SIZE_2POW);
        ArenaChunk::page_addr(chunk, CHUNK_HEADER_NUM_PAGES)
      };

      if self.split_run(heap, run, size, large, zero) {
        run
      } else {
        null_mut()
      }
    }
  }

  /// Takes the first `size` bytes of the free run at `run` and marks them
  /// allocated. The remainder stays available.
  unsafe fn split_run(&mut self, heap: &Heap, run: *mut u8, size: usize, large: bool, zero: bool) -> bool {
    unsafe {
      let chunk = ArenaChunk::for_ptr(run);
      let old_ndirty = (*chunk).ndirty;
      let run_ind = ArenaChunk::page_index(chunk, run);
      let total_pages = entry(chunk, run_ind).size() >> PAGE_SIZE_2POW;
      let need_pages = size >> PAGE_SIZE_2POW;
      debug_assert!(need_pages > 0 && need_pages <= total_pages);
      debug_assert!(!entry(chunk, run_ind).is_busy());
      let rem_pages = total_pages - need_pages;

      #[cfg(feature = "decommit")]
      if !self.commit_for_split(heap, chunk, run_ind, need_pages, rem_pages) {
        return false;
      }
      #[cfg(not(feature = "decommit"))]
      let _ = heap;

      self.runs_avail.remove(ArenaChunk::entry(chunk, run_ind));
      if rem_pages > 0 {
        let rem = rem_pages << PAGE_SIZE_2POW;
        entry(chunk, run_ind + need_pages).set_size(rem);
        entry(chunk, run_ind + total_pages - 1).set_size(rem);
        self
          .runs_avail
          .insert(ArenaChunk::entry(chunk, run_ind + need_pages));
      }

      for i in run_ind..run_ind + need_pages {
        let state = entry(chunk, i).state();
        if zero && !entry(chunk, i).flags().contains(PageFlags::ZEROED) {
          ArenaChunk::page_addr(chunk, i).write_bytes(0, PAGE_SIZE);
        }
        match state {
          PageState::Dirty => {
            (*chunk).ndirty -= 1;
            self.num_dirty -= 1;
          }
          PageState::Madvised => {
            self.committed += 1;
            self.num_madvised -= 1;
          }
          PageState::Fresh => {
            self.committed += 1;
            self.num_fresh -= 1;
          }
          PageState::Decommitted => debug_assert!(false, "splitting a decommitted page"),
          PageState::Clean => {}
        }
        if large {
          entry(chunk, i).set(0, PageFlags::LARGE | PageFlags::ALLOCATED, PageState::Clean);
        } else {
          entry(chunk, i).set(run as usize, PageFlags::ALLOCATED, PageState::Clean);
        }
      }
      if large {
        entry(chunk, run_ind).set_size(size);
      }

      if (*chunk).ndirty == 0 && old_ndirty > 0 && !(*chunk).is_purging {
        self.chunks_dirty.remove(chunk);
      }
    }
    true
  }

  /// Commits the decommitted pages a split needs, batching the syscalls.
  #[cfg(feature = "decommit")]
  unsafe fn commit_for_split(
    &mut self,
    heap: &Heap,
    chunk: *mut ArenaChunk,
    run_ind: usize,
    need_pages: usize,
    rem_pages: usize,
  ) -> bool {
    let decommitted = |i: usize| unsafe { entry(chunk, run_ind + i).state() == PageState::Decommitted };
    let mut i = 0;
    while i < need_pages {
      if !decommitted(i) {
        i += 1;
        continue;
      }
      let mut j = 0;
      while i + j < need_pages && decommitted(i + j) {
        j += 1;
      }
      // Only the edge of the run can grow into the remainder.
      if i + j == need_pages {
        let extra = self.extra_commit_pages(heap, j, rem_pages);
        while i + j < need_pages + extra && decommitted(i + j) {
          j += 1;
        }
      }
      unsafe {
        if !os_commit(ArenaChunk::page_addr(chunk, run_ind + i), j << PAGE_SIZE_2POW) {
          return false;
        }
        for k in run_ind + i..run_ind + i + j {
          entry(chunk, k).set_state(PageState::Fresh);
          entry(chunk, k).insert_flags(PageFlags::ZEROED);
        }
      }
      self.num_fresh += j;
      i += j;
    }
    true
  }

  /// Pages worth committing beyond a request, keeping the page cache
  /// between a quarter and three quarters of `max_dirty`.
  #[cfg(feature = "decommit")]
  fn extra_commit_pages(&self, heap: &Heap, req_pages: usize, rem_pages: usize) -> usize {
    let modifier = heap.arenas.default_max_dirty_page_modifier();
    if modifier < 0 {
      return 0;
    }
    let max_cache = self.max_dirty;
    let cache = self.num_dirty + self.num_fresh + self.num_madvised;
    if cache > max_cache {
      return 0;
    }
    if modifier > 0 {
      return rem_pages.min(max_cache - cache);
    }

    let min_target = max_cache / 4;
    let max_target = 3 * max_cache / 4;
    let mut threshold = heap.options.purge_commit_batch;
    let mut extra = threshold.saturating_sub(req_pages);
    if cache + extra < min_target {
      extra = min_target - cache;
    } else if cache + extra > max_target {
      threshold /= 2;
      extra = threshold.saturating_sub(req_pages).min(max_cache - cache);
    }
    extra = extra.min(rem_pages);

    if rem_pages - extra < threshold / 2 && cache + rem_pages < max_cache {
      return rem_pages;
    }
    extra
  }

  /// Returns a run to the free pool, coalescing with free neighbors.
  /// Returns a chunk the caller must release, or null.
  unsafe fn dalloc_run(&mut self, run: *mut u8, dirty: bool) -> *mut ArenaChunk {
    unsafe {
      let chunk = ArenaChunk::for_ptr(run);
      let run_ind = ArenaChunk::page_index(chunk, run);
      debug_assert!(run_ind >= CHUNK_HEADER_NUM_PAGES);
      assert!(run_ind < CHUNK_GUARD_PAGE);

      let size = if entry(chunk, run_ind).is_large() {
        entry(chunk, run_ind).size()
      } else {
        (*(*run.cast::<Run>()).bin).run_size()
      };
      let run_pages = size >> PAGE_SIZE_2POW;

      if dirty {
        for i in run_ind..run_ind + run_pages {
          debug_assert!(entry(chunk, i).state() != PageState::Dirty);
          entry(chunk, i).set(0, PageFlags::empty(), PageState::Dirty);
        }
        if (*chunk).ndirty == 0 && !(*chunk).is_purging {
          self.chunks_dirty.insert(chunk);
        }
        (*chunk).ndirty += run_pages;
        self.num_dirty += run_pages;
      } else {
        for i in run_ind..run_ind + run_pages {
          entry(chunk, i).remove_flags(PageFlags::LARGE | PageFlags::ALLOCATED);
        }
      }
      entry(chunk, run_ind).set_size(size);
      entry(chunk, run_ind + run_pages - 1).set_size(size);

      let run_ind = self.try_coalesce(chunk, run_ind, run_pages, size);

      if ArenaChunk::is_empty(chunk) {
        self.demote_chunk_to_spare(chunk)
      } else {
        self.runs_avail.insert(ArenaChunk::entry(chunk, run_ind));
        null_mut()
      }
    }
  }

  /// Merges the free run at `run_ind` with available neighbors, which are
  /// taken out of `runs_avail`. Returns the first page of the merged run,
  /// which is not inserted.
  unsafe fn try_coalesce(&mut self, chunk: *mut ArenaChunk, mut run_ind: usize, run_pages: usize, mut size: usize) -> usize {
    debug_assert_eq!(size, run_pages << PAGE_SIZE_2POW);
    unsafe {
      let next = run_ind + run_pages;
      if next < CHUNK_GUARD_PAGE && entry(chunk, next).is_available() {
        let next_size = entry(chunk, next).size();
        self.runs_avail.remove(ArenaChunk::entry(chunk, next));
        size += next_size;
        let pages = size >> PAGE_SIZE_2POW;
        debug_assert_eq!(entry(chunk, run_ind + pages - 1).size(), next_size);
        entry(chunk, run_ind).set_size(size);
        entry(chunk, run_ind + pages - 1).set_size(size);
      }

      if run_ind > CHUNK_HEADER_NUM_PAGES && entry(chunk, run_ind - 1).is_available() {
        let prev_size = entry(chunk, run_ind - 1).size();
        run_ind -= prev_size >> PAGE_SIZE_2POW;
        self.runs_avail.remove(ArenaChunk::entry(chunk, run_ind));
        size += prev_size;
        let pages = size >> PAGE_SIZE_2POW;
        debug_assert_eq!(entry(chunk, run_ind).size(), prev_size);
        entry(chunk, run_ind).set_size(size);
        entry(chunk, run_ind + pages - 1).set_size(size);
      }
    }
    run_ind
  }

  /// Frees the first `old_size - new_size` bytes of a large run.
  unsafe fn trim_run_head(&mut self, chunk: *mut ArenaChunk, run: *mut u8, old_size: usize, new_size: usize) {
    debug_assert!(old_size > new_size);
    unsafe {
      let pageind = ArenaChunk::page_index(chunk, run);
      let head_pages = (old_size - new_size) >> PAGE_SIZE_2POW;
      let flags = PageFlags::LARGE | PageFlags::ALLOCATED;
      entry(chunk, pageind).set(old_size - new_size, flags, PageState::Clean);
      entry(chunk, pageind + head_pages).set(new_size, flags, PageState::Clean);
      // Part of the run stays allocated, so no chunk can be released.
      let released = self.dalloc_run(run, false);
      debug_assert!(released.is_null());
    }
  }

  /// Frees the bytes of a large run past `new_size`.
  unsafe fn trim_run_tail(&mut self, chunk: *mut ArenaChunk, run: *mut u8, old_size: usize, new_size: usize, dirty: bool) {
    debug_assert!(old_size > new_size);
    unsafe {
      let pageind = ArenaChunk::page_index(chunk, run);
      let pages = new_size >> PAGE_SIZE_2POW;
      let flags = PageFlags::LARGE | PageFlags::ALLOCATED;
      entry(chunk, pageind).set(new_size, flags, PageState::Clean);
      entry(chunk, pageind + pages).set(old_size - new_size, flags, PageState::Clean);
      let released = self.dalloc_run(run.add(new_size), dirty);
      debug_assert!(released.is_null());
    }
  }

  // ===========================================================================
  // Bins
  // ===========================================================================

  /// A run of the bin with a free region. The run leaves the non-full list
  /// when the caller is about to take its last region.
  unsafe fn get_non_full_bin_run(&mut self, heap: &Heap, bin_index: usize) -> *mut Run {
    let bin: *mut Bin = &raw mut self.bins[bin_index];
    unsafe {
      let head = (*bin).non_full_runs.front();
      if !head.is_null() {
        debug_assert!((*head).magic == RUN_MAGIC);
        if (*head).num_free == 1 {
          (*bin).non_full_runs.remove(head);
        }
        return head;
      }

      let run = self
        .alloc_run(heap, (*bin).run_size(), false, false)
        .cast::<Run>();
      if run.is_null() {
        return null_mut();
      }
      Run::init(run, bin);
      (*bin).non_full_runs.push_front(run);
      (*bin).num_runs += 1;
      run
    }
  }

  /// Frees a small region. Returns its size and a chunk the caller must
  /// release, or null.
  unsafe fn dalloc_small(&mut self, chunk: *mut ArenaChunk, ptr: *mut u8, pageind: usize) -> (usize, *mut ArenaChunk) {
    unsafe {
      let run: *mut Run = entry(chunk, pageind).run(chunk);
      assert!((*run).magic == RUN_MAGIC, "Pointer is not in a run.");
      let bin = (*run).bin;
      let size = (*bin).size_class;
      debug_assert!(ptr as usize >= run as usize + (*bin).run_first_region_offset);

      Run::dalloc_region(run, &*bin, ptr);
      (*run).num_free += 1;

      let mut released = null_mut();
      if (*run).num_free == (*bin).run_num_regions {
        // Entirely free. With more than one region per run it was listed.
        (*run).magic = 0;
        (*bin).non_full_runs.remove(run);
        released = self.dalloc_run(run.cast(), true);
        (*bin).num_runs -= 1;
      } else if (*run).num_free == 1 {
        (*bin).non_full_runs.push_front(run);
      }
      (size, released)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{options::Options, size_class::CHUNK_SIZE_MASK};

  fn heap() -> Heap {
    let mut opts = Options::default();
    opts.poison = Poison::None;
    Heap::new(opts).unwrap()
  }

  fn private(heap: &Heap) -> &Arena {
    let id = heap.create_arena(&ArenaParams::default());
    unsafe { &*heap.arena_by_id(id).unwrap() }
  }

  #[test]
  fn small_regions_share_a_run() {
    let heap = heap();
    let arena = private(&heap);
    unsafe {
      let a = arena.malloc(&heap, 24, false);
      let b = arena.malloc(&heap, 32, false);
      assert_eq!(a as usize & !PAGE_SIZE_MASK, b as usize & !PAGE_SIZE_MASK);
      assert_eq!(arena.allocated(), 64);
      let chunk = ArenaChunk::for_ptr(a);
      assert_eq!((*chunk).arena, arena.as_ptr());
      arena_dalloc(&heap, a, a as usize & CHUNK_SIZE_MASK, Some(arena.as_ptr()));
      arena_dalloc(&heap, b, b as usize & CHUNK_SIZE_MASK, None);
    }
    assert_eq!(arena.allocated(), 0);
  }

  #[test]
  fn freed_run_makes_dirty_pages_and_a_spare() {
    let heap = heap();
    let arena = private(&heap);
    unsafe {
      let p = arena.malloc(&heap, 5 * PAGE_SIZE, false);
      assert_eq!(p as usize & PAGE_SIZE_MASK, 0);
      assert_eq!(arena.state.lock().num_fresh, CHUNK_DATA_PAGES - 5);
      arena_dalloc(&heap, p, p as usize & CHUNK_SIZE_MASK, None);
      let st = arena.state.lock();
      assert_eq!(st.num_dirty, 5);
      assert!(!st.spare.is_null());
      assert!(st.runs_avail.is_empty());
      assert_eq!(st.mapped, CHUNK_SIZE);
    }
  }

  #[test]
  fn free_runs_coalesce() {
    let heap = heap();
    let arena = private(&heap);
    unsafe {
      let a = arena.malloc(&heap, 2 * PAGE_SIZE, false);
      let b = arena.malloc(&heap, 3 * PAGE_SIZE, false);
      let c = arena.malloc(&heap, PAGE_SIZE, false);
      assert_eq!(b, a.add(2 * PAGE_SIZE));
      assert_eq!(c, b.add(3 * PAGE_SIZE));
      arena_dalloc(&heap, a, a as usize & CHUNK_SIZE_MASK, None);
      arena_dalloc(&heap, b, b as usize & CHUNK_SIZE_MASK, None);
      {
        let st = arena.state.lock();
        let chunk = ArenaChunk::for_ptr(a);
        assert_eq!(entry(chunk, CHUNK_HEADER_NUM_PAGES).size(), 5 * PAGE_SIZE);
        assert!(st.runs_avail.contains(ArenaChunk::entry(chunk, CHUNK_HEADER_NUM_PAGES)));
      }
      // Lowest best fit reuses the coalesced hole.
      let d = arena.malloc(&heap, 4 * PAGE_SIZE, false);
      assert_eq!(d, a);
      arena_dalloc(&heap, c, c as usize & CHUNK_SIZE_MASK, None);
      arena_dalloc(&heap, d, d as usize & CHUNK_SIZE_MASK, None);
    }
  }

  #[test]
  fn free_run_merges_into_preceding_neighbor() {
    let heap = heap();
    let arena = private(&heap);
    unsafe {
      let a = arena.malloc(&heap, 2 * PAGE_SIZE, false);
      let b = arena.malloc(&heap, 3 * PAGE_SIZE, false);
      let fence = arena.malloc(&heap, PAGE_SIZE, false);
      assert_eq!(b, a.add(2 * PAGE_SIZE));
      arena_dalloc(&heap, b, b as usize & CHUNK_SIZE_MASK, None);
      arena_dalloc(&heap, a, a as usize & CHUNK_SIZE_MASK, None);
      let st = arena.state.lock();
      let chunk = ArenaChunk::for_ptr(a);
      let head = CHUNK_HEADER_NUM_PAGES;
      assert_eq!(entry(chunk, head).size(), 5 * PAGE_SIZE);
      assert_eq!(entry(chunk, head + 4).size(), 5 * PAGE_SIZE);
      assert!(st.runs_avail.contains(ArenaChunk::entry(chunk, head)));
      assert!(!st.runs_avail.contains(ArenaChunk::entry(chunk, head + 2)));
      drop(st);
      arena_dalloc(&heap, fence, fence as usize & CHUNK_SIZE_MASK, None);
    }
  }

  #[test]
  fn middle_run_joins_both_neighbors() {
    let heap = heap();
    let arena = private(&heap);
    unsafe {
      let a = arena.malloc(&heap, 2 * PAGE_SIZE, false);
      let b = arena.malloc(&heap, 3 * PAGE_SIZE, false);
      let c = arena.malloc(&heap, PAGE_SIZE, false);
      let fence = arena.malloc(&heap, PAGE_SIZE, false);
      assert_eq!(c, b.add(3 * PAGE_SIZE));
      arena_dalloc(&heap, a, a as usize & CHUNK_SIZE_MASK, None);
      arena_dalloc(&heap, c, c as usize & CHUNK_SIZE_MASK, None);
      arena_dalloc(&heap, b, b as usize & CHUNK_SIZE_MASK, None);
      {
        let st = arena.state.lock();
        let chunk = ArenaChunk::for_ptr(a);
        let head = CHUNK_HEADER_NUM_PAGES;
        assert_eq!(entry(chunk, head).size(), 6 * PAGE_SIZE);
        assert_eq!(entry(chunk, head + 5).size(), 6 * PAGE_SIZE);
        assert!(st.runs_avail.contains(ArenaChunk::entry(chunk, head)));
        assert!(!st.runs_avail.contains(ArenaChunk::entry(chunk, head + 2)));
        assert!(!st.runs_avail.contains(ArenaChunk::entry(chunk, head + 5)));
        assert_eq!(st.num_dirty, 6);
      }
      // The merged hole takes a six page run at its start.
      let d = arena.malloc(&heap, 6 * PAGE_SIZE, false);
      assert_eq!(d, a);
      arena_dalloc(&heap, d, d as usize & CHUNK_SIZE_MASK, None);
      arena_dalloc(&heap, fence, fence as usize & CHUNK_SIZE_MASK, None);
    }
  }

  #[test]
  fn aligned_large_allocation() {
    let heap = heap();
    let arena = private(&heap);
    unsafe {
      let p = arena.palloc(&heap, 64 * 1024, 3 * PAGE_SIZE);
      assert!(!p.is_null());
      assert_eq!(p as usize % (64 * 1024), 0);
      assert_eq!(size_in_chunk(ArenaChunk::for_ptr(p), (p as usize & CHUNK_SIZE_MASK) >> PAGE_SIZE_2POW), 3 * PAGE_SIZE);
      assert_eq!(arena.allocated(), 3 * PAGE_SIZE);
      arena_dalloc(&heap, p, p as usize & CHUNK_SIZE_MASK, None);
    }
  }

  #[test]
  fn large_realloc_grows_and_shrinks_in_place() {
    let heap = heap();
    let arena = private(&heap);
    unsafe {
      let p = arena.malloc(&heap, 2 * PAGE_SIZE, false);
      p.write_bytes(7, 2 * PAGE_SIZE);
      let q = arena.ralloc(&heap, p, 6 * PAGE_SIZE, 2 * PAGE_SIZE);
      assert_eq!(p, q);
      assert_eq!(*q.add(2 * PAGE_SIZE - 1), 7);
      assert_eq!(arena.allocated(), 6 * PAGE_SIZE);
      let r = arena.ralloc(&heap, q, PAGE_SIZE + 1, 6 * PAGE_SIZE);
      assert_eq!(r, p);
      assert_eq!(arena.allocated(), 2 * PAGE_SIZE);
      arena_dalloc(&heap, r, r as usize & CHUNK_SIZE_MASK, None);
    }
  }

  #[test]
  fn zeroed_small_allocation_after_reuse() {
    let heap = heap();
    let arena = private(&heap);
    unsafe {
      let p = arena.malloc(&heap, 100, false);
      p.write_bytes(0xff, 100);
      arena_dalloc(&heap, p, p as usize & CHUNK_SIZE_MASK, None);
      let q = arena.malloc(&heap, 100, true);
      assert!((0..112).all(|i| *q.add(i) == 0));
      arena_dalloc(&heap, q, q as usize & CHUNK_SIZE_MASK, None);
    }
  }

  #[test]
  #[should_panic(expected = "Double-free?")]
  fn double_free_of_large_run() {
    let heap = heap();
    let arena = private(&heap);
    unsafe {
      let p = arena.malloc(&heap, 8 * PAGE_SIZE, false);
      let _keep = arena.malloc(&heap, 8 * PAGE_SIZE, false);
      arena_dalloc(&heap, p, p as usize & CHUNK_SIZE_MASK, None);
      arena_dalloc(&heap, p, p as usize & CHUNK_SIZE_MASK, None);
    }
  }

  #[test]
  fn max_dirty_follows_modifier_and_overrides() {
    let heap = heap();
    let id = heap.create_arena(&ArenaParams {
      max_dirty: 64,
      max_dirty_increase_override: 1,
      ..ArenaParams::default()
    });
    let arena = unsafe { &*heap.arena_by_id(id).unwrap() };
    assert_eq!(arena.state.lock().max_dirty, 64);
    arena.update_max_dirty(3);
    assert_eq!(arena.state.lock().max_dirty, 128);
    arena.update_max_dirty(-2);
    assert_eq!(arena.state.lock().max_dirty, 16);
    arena.update_max_dirty(-70);
    assert_eq!(arena.state.lock().max_dirty, 0);
  }
}
