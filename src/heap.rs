//! The heap object tying every allocator component together, and the
//! malloc-style entry points built on it.

use core::{
  cell::Cell,
  ffi::CStr,
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
};
use std::sync::OnceLock;

use crate::{
  arena::{Arena, ArenaParams, PurgeCondition, arena_dalloc, ptr_info_in_chunk, size_in_chunk},
  base::BaseAllocator,
  chunk::{ArenaChunk, CHUNK_HEADER_NUM_PAGES, MAX_LARGE_CLASS},
  collection::{ArenaCollection, MayPurgeResult},
  extent::ChunkAllocator,
  huge::{HugeRegistry, huge_dalloc},
  options::Options,
  platform::{kernel_page_size, malloc_message, os_munmap},
  size_class::{
    CHUNK_SIZE, MAX_QUANTUM_CLASS, PAGE_SIZE, PAGE_SIZE_2POW, SizeClass, chunk_base, chunk_offset,
    page_ceiling,
  },
  stats::{HeapStats, PtrInfo, PtrInfoTag, StatsLite},
};

static NEXT_HEAP_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
  /// Arena pinned by `thread_local_arena`, tagged with its heap's id.
  static THREAD_ARENA: Cell<(u64, *mut Arena)> = const { Cell::new((0, null_mut())) };
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum HeapError {
  #[error("kernel page size {kernel} does not divide the allocator page size {static_page}")]
  PageSize { kernel: usize, static_page: usize },
  #[error("out of memory while building the heap")]
  OutOfMemory,
}

/// Failure of [`Heap::posix_memalign`].
#[derive(Clone, Copy, PartialEq, Eq, Debug, thiserror::Error)]
pub enum AlignError {
  #[error("alignment must be a power of two and at least pointer sized")]
  InvalidAlignment,
  #[error("out of memory")]
  OutOfMemory,
}

impl AlignError {
  /// The matching `errno` value.
  pub fn errno(self) -> i32 {
    match self {
      Self::InvalidAlignment => libc::EINVAL,
      Self::OutOfMemory => libc::ENOMEM,
    }
  }
}

// =============================================================================
// Heap
// =============================================================================

/// Size and owner of a live allocation.
#[derive(Clone, Copy)]
struct AllocInfo {
  size: usize,
  arena: *mut Arena,
}

pub struct Heap {
  id: u64,
  pub(crate) options: Options,
  randomize_small: AtomicBool,
  /// Thread that ran `prefork`, zero outside a fork.
  forking_thread: AtomicU32,
  pub(crate) base: BaseAllocator,
  pub(crate) chunks: ChunkAllocator,
  pub(crate) huge: HugeRegistry,
  pub(crate) arenas: ArenaCollection,
}

// Every component synchronizes internally.
unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

impl Heap {
  /// Builds a heap with its default arena.
  pub fn new(options: Options) -> Result<Self, HeapError> {
    let kernel = kernel_page_size();
    if kernel == 0 || PAGE_SIZE % kernel != 0 {
      return Err(HeapError::PageSize {
        kernel,
        static_page: PAGE_SIZE,
      });
    }

    let base = BaseAllocator::new();
    let chunks = ChunkAllocator::new(options.recycle_limit, &base).ok_or(HeapError::OutOfMemory)?;
    let heap = Self {
      id: NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed),
      options,
      randomize_small: AtomicBool::new(options.randomize_small),
      forking_thread: AtomicU32::new(0),
      base,
      chunks,
      huge: HugeRegistry::new(),
      arenas: ArenaCollection::new(),
    };
    if !heap.arenas.init(&heap) {
      return Err(HeapError::OutOfMemory);
    }
    Ok(heap)
  }

  /// The process-wide heap, built on first use from `MALLOC_OPTIONS`. `None`
  /// when it could not be built.
  pub fn global() -> Option<&'static Heap> {
    static GLOBAL: OnceLock<Option<Heap>> = OnceLock::new();

    extern "C" fn prefork() {
      if let Some(heap) = GLOBAL.get().and_then(Option::as_ref) {
        unsafe { heap.prefork() };
      }
    }
    extern "C" fn postfork_parent() {
      if let Some(heap) = GLOBAL.get().and_then(Option::as_ref) {
        unsafe { heap.postfork_parent() };
      }
    }
    extern "C" fn postfork_child() {
      if let Some(heap) = GLOBAL.get().and_then(Option::as_ref) {
        unsafe { heap.postfork_child() };
      }
    }

    GLOBAL
      .get_or_init(|| {
        // Nothing here may allocate through the global allocator.
        let mut options = Options::default();
        let env = unsafe { libc::getenv(c"MALLOC_OPTIONS".as_ptr()) };
        if !env.is_null() {
          let opts = unsafe { CStr::from_ptr(env) }.to_bytes();
          options.apply(opts, |c| {
            malloc_message(&[
              b"ferrojem: (malloc) Unsupported character in malloc options: '",
              &[c],
              b"'\n",
            ]);
          });
        }
        let heap = Heap::new(options).ok()?;
        unsafe { libc::pthread_atfork(Some(prefork), Some(postfork_parent), Some(postfork_child)) };
        Some(heap)
      })
      .as_ref()
  }

  pub fn options(&self) -> &Options {
    &self.options
  }

  pub(crate) fn randomize_small(&self) -> bool {
    self.randomize_small.load(Ordering::Relaxed)
  }

  /// Arena for a request of `size` bytes from this thread. Only small
  /// requests honor a pinned thread arena.
  pub(crate) fn choose_arena(&self, size: usize) -> *mut Arena {
    if size <= MAX_QUANTUM_CLASS {
      let pinned = THREAD_ARENA
        .try_with(|slot| slot.get())
        .ok()
        .filter(|&(heap, arena)| heap == self.id && !arena.is_null());
      if let Some((_, arena)) = pinned {
        return arena;
      }
    }
    self.arenas.default_arena()
  }

  /// Pins this thread to a new public arena, or back to the default one.
  pub fn thread_local_arena(&self, enabled: bool) {
    let arena = if enabled {
      self.arenas.create_arena(self, None, false)
    } else {
      self.arenas.default_arena()
    };
    let _ = THREAD_ARENA.try_with(|slot| slot.set((self.id, arena)));
  }

  /// Frees `ptr`, checking it belongs to `arena` when given.
  pub(crate) unsafe fn idalloc(&self, ptr: *mut u8, arena: Option<*mut Arena>) {
    debug_assert!(!ptr.is_null());
    let offset = chunk_offset(ptr);
    if offset != 0 {
      unsafe { arena_dalloc(self, ptr, offset, arena) };
    } else {
      unsafe { huge_dalloc(self, ptr, arena) };
    }
  }

  /// Size and arena of the allocation starting at `ptr`, or `None` when the
  /// pointer is not in memory this heap handed out.
  fn alloc_info(&self, ptr: *const u8) -> Option<AllocInfo> {
    if chunk_base(ptr) == 0 || !self.chunks.is_registered(ArenaChunk::for_ptr(ptr).cast()) {
      return None;
    }
    let offset = chunk_offset(ptr);
    if offset != 0 {
      let chunk = ArenaChunk::for_ptr(ptr);
      let page = offset >> PAGE_SIZE_2POW;
      if page < CHUNK_HEADER_NUM_PAGES {
        return None;
      }
      unsafe {
        if !(*ArenaChunk::entry(chunk, page)).is_allocated() {
          return None;
        }
        return Some(AllocInfo {
          size: size_in_chunk(chunk, page),
          arena: (*chunk).arena,
        });
      }
    }

    let huge = self.huge.get(ptr)?;
    assert!(
      huge.arena_id == unsafe { (*huge.arena).id() },
      "Allocation belongs to a destroyed arena."
    );
    Some(AllocInfo {
      size: huge.size,
      arena: huge.arena,
    })
  }

  // ===========================================================================
  // malloc(3) family
  // ===========================================================================

  pub fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
    self.malloc_in(None, size, false)
  }

  /// Zeroed allocation of `num * size` bytes. `None` on overflow.
  pub fn calloc(&self, num: usize, size: usize) -> Option<NonNull<u8>> {
    self.malloc_in(None, num.checked_mul(size)?, true)
  }

  /// Resizes `ptr`, which may be null. On failure `ptr` stays valid.
  ///
  /// # Safety
  ///
  /// `ptr` is null or a live allocation of this heap.
  pub unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> Option<NonNull<u8>> {
    unsafe { self.realloc_in(None, ptr, size) }
  }

  /// # Safety
  ///
  /// `ptr` is null or a live allocation of this heap.
  ///
  /// # Panics
  ///
  /// On a double free or a pointer into free memory.
  pub unsafe fn free(&self, ptr: *mut u8) {
    if !ptr.is_null() {
      unsafe { self.idalloc(ptr, None) };
    }
  }

  /// `alignment` must be a power of two.
  pub fn memalign(&self, alignment: usize, size: usize) -> Option<NonNull<u8>> {
    self.memalign_in(None, alignment, size)
  }

  pub fn posix_memalign(&self, alignment: usize, size: usize) -> Result<NonNull<u8>, AlignError> {
    if !alignment.is_power_of_two() || alignment < size_of::<*mut u8>() {
      return Err(AlignError::InvalidAlignment);
    }
    self.memalign(alignment, size).ok_or(AlignError::OutOfMemory)
  }

  /// `None` unless `size` is a multiple of a power-of-two `alignment`.
  pub fn aligned_alloc(&self, alignment: usize, size: usize) -> Option<NonNull<u8>> {
    if !alignment.is_power_of_two() || size % alignment != 0 {
      return None;
    }
    self.memalign(alignment, size)
  }

  pub fn valloc(&self, size: usize) -> Option<NonNull<u8>> {
    self.memalign(kernel_page_size(), size)
  }

  /// Usable size of the allocation at `ptr`, or 0 for pointers this heap
  /// does not know.
  pub fn usable_size(&self, ptr: *const u8) -> usize {
    self.alloc_info(ptr).map_or(0, |info| info.size)
  }

  /// Size a request of `size` bytes is rounded up to.
  pub fn good_size(size: usize) -> usize {
    if size <= MAX_LARGE_CLASS {
      SizeClass::new(size).size()
    } else {
      page_ceiling(size)
    }
  }

  fn malloc_in(&self, arena: Option<*mut Arena>, size: usize, zero: bool) -> Option<NonNull<u8>> {
    let size = size.max(1);
    let arena = arena.unwrap_or_else(|| self.choose_arena(size));
    NonNull::new(unsafe { (*arena).malloc(self, size, zero) })
  }

  fn memalign_in(&self, arena: Option<*mut Arena>, alignment: usize, size: usize) -> Option<NonNull<u8>> {
    debug_assert!(alignment.is_power_of_two());
    let size = size.max(1);
    let alignment = alignment.max(size_of::<*mut u8>());
    let arena = arena.unwrap_or_else(|| self.choose_arena(size));
    NonNull::new(unsafe { (*arena).palloc(self, alignment, size) })
  }

  unsafe fn realloc_in(&self, arena: Option<*mut Arena>, ptr: *mut u8, size: usize) -> Option<NonNull<u8>> {
    let size = size.max(1);
    if ptr.is_null() {
      return self.malloc_in(arena, size, false);
    }
    let Some(info) = self.alloc_info(ptr) else {
      panic!("Reallocating a pointer this heap does not own.");
    };
    assert!(
      arena.is_none_or(|a| a == info.arena),
      "Reallocating with the wrong arena."
    );
    NonNull::new(unsafe { (*info.arena).ralloc(self, ptr, size, info.size) })
  }

  // ===========================================================================
  // Private arenas
  // ===========================================================================

  /// Creates a private arena and returns its id.
  pub fn create_arena(&self, params: &ArenaParams) -> u64 {
    let arena = self.arenas.create_arena(self, Some(params), true);
    unsafe { (*arena).id() }
  }

  /// Destroys a private arena.
  ///
  /// # Panics
  ///
  /// When `id` names no private arena or the arena still holds allocations.
  pub fn dispose_arena(&self, id: u64) {
    let arena = self.private_arena(id);
    unsafe { self.arenas.dispose_arena(self, arena) };
  }

  pub(crate) fn arena_by_id(&self, id: u64) -> Option<*mut Arena> {
    self.arenas.get_by_id(id, true)
  }

  fn private_arena(&self, id: u64) -> *mut Arena {
    let Some(arena) = self.arena_by_id(id) else {
      panic!("No private arena with id {id:#x}.");
    };
    arena
  }

  pub fn arena_malloc(&self, id: u64, size: usize) -> Option<NonNull<u8>> {
    self.malloc_in(Some(self.private_arena(id)), size, false)
  }

  pub fn arena_calloc(&self, id: u64, num: usize, size: usize) -> Option<NonNull<u8>> {
    self.malloc_in(Some(self.private_arena(id)), num.checked_mul(size)?, true)
  }

  /// # Safety
  ///
  /// `ptr` is null or a live allocation of arena `id`.
  pub unsafe fn arena_realloc(&self, id: u64, ptr: *mut u8, size: usize) -> Option<NonNull<u8>> {
    unsafe { self.realloc_in(Some(self.private_arena(id)), ptr, size) }
  }

  /// # Safety
  ///
  /// `ptr` is null or a live allocation of arena `id`.
  pub unsafe fn arena_free(&self, id: u64, ptr: *mut u8) {
    let arena = self.private_arena(id);
    if !ptr.is_null() {
      unsafe { self.idalloc(ptr, Some(arena)) };
    }
  }

  pub fn arena_memalign(&self, id: u64, alignment: usize, size: usize) -> Option<NonNull<u8>> {
    self.memalign_in(Some(self.private_arena(id)), alignment, size)
  }

  // ===========================================================================
  // Introspection
  // ===========================================================================

  /// Describes what `ptr` points at.
  pub fn ptr_info(&self, ptr: *const u8) -> PtrInfo {
    if chunk_base(ptr) == 0 {
      return PtrInfo::UNKNOWN;
    }
    // Huge allocations only register their first chunk.
    if let Some(huge) = self.huge.find_containing(ptr) {
      return PtrInfo {
        tag: PtrInfoTag::LiveAlloc,
        addr: huge.addr,
        size: huge.size,
        arena_id: huge.arena_id,
      };
    }
    let chunk = ArenaChunk::for_ptr(ptr);
    if !self.chunks.is_registered(chunk.cast()) || self.huge.get(chunk.cast()).is_some() {
      return PtrInfo::UNKNOWN;
    }
    unsafe { ptr_info_in_chunk(chunk, ptr) }
  }

  pub fn stats(&self) -> HeapStats {
    let mut stats = HeapStats::new(self.options);
    let mut non_arena_mapped = self.huge.mapped();
    stats.allocated += self.huge.allocated();
    stats.num_operations += self.huge.operations();

    let base = self.base.stats();
    non_arena_mapped += base.mapped;
    stats.bookkeeping += base.committed;

    self.arenas.for_each_accessible(|arena| {
      debug_assert!(arena.state.safe_on_this_thread());
      arena.collect_stats(&mut stats);
    });

    // Chunk headers are bookkeeping, not waste.
    let headers = ((stats.mapped / CHUNK_SIZE) * (CHUNK_HEADER_NUM_PAGES - 1)) << PAGE_SIZE_2POW;
    stats.mapped += non_arena_mapped;
    stats.bookkeeping += headers;
    stats.waste = stats.waste.saturating_sub(headers);
    stats
  }

  /// Allocated bytes and operation count without taking arena locks.
  pub fn stats_lite(&self) -> StatsLite {
    StatsLite {
      allocated_bytes: self.huge.allocated() + self.arenas.allocated(),
      num_operations: self.huge.operations() + self.arenas.operations(),
    }
  }

  // ===========================================================================
  // Purging and tuning
  // ===========================================================================

  /// Purges every dirty page of every arena.
  pub fn free_dirty_pages(&self) {
    self.arenas.may_purge_all(self, PurgeCondition::Unconditional);
  }

  /// Purges arenas over their dirty page budget.
  pub fn free_excess_dirty_pages(&self) {
    self.arenas.may_purge_all(self, PurgeCondition::IfThreshold);
  }

  /// Forces `MADV_FREE`d pages out of memory. They read as zero afterwards.
  pub fn purge_freed_pages(&self) {
    self.arenas.for_each_accessible(Arena::hard_purge);
  }

  /// Declares the calling thread the main thread.
  pub fn set_main_thread(&self) {
    self.arenas.set_main_thread();
  }

  pub fn reset_small_alloc_randomization(&self, enabled: bool) {
    self.randomize_small.store(enabled, Ordering::Relaxed);
    self
      .arenas
      .for_each_accessible(|arena| arena.reset_small_alloc_randomization(enabled));
  }

  /// Queues purges instead of running them on free. Returns the previous
  /// setting.
  pub fn enable_deferred_purge(&self, enable: bool) -> bool {
    self.arenas.set_deferred_purge(self, enable)
  }

  /// Scales every arena's dirty page budget by `2^modifier`.
  pub fn set_max_dirty_page_modifier(&self, modifier: i32) {
    self.arenas.set_default_max_dirty_page_modifier(modifier);
  }

  /// Runs queued purges. See [`MayPurgeResult`].
  pub fn may_purge_now(
    &self,
    peek_only: bool,
    reuse_grace_ms: u32,
    keep_going: Option<&mut dyn FnMut() -> bool>,
  ) -> MayPurgeResult {
    self
      .arenas
      .may_purge_steps(self, peek_only, reuse_grace_ms, keep_going)
  }

  // ===========================================================================
  // Fork
  // ===========================================================================

  /// Takes every lock before `fork`.
  pub unsafe fn prefork(&self) {
    unsafe {
      let forking = self.arenas.prefork();
      self.forking_thread.store(forking, Ordering::Relaxed);
      self.base.prefork();
      self.huge.prefork();
      self.chunks.prefork();
    }
  }

  pub unsafe fn postfork_parent(&self) {
    unsafe {
      self.chunks.postfork_parent();
      self.huge.postfork_parent();
      self.base.postfork_parent();
      self.arenas.postfork_parent();
    }
  }

  pub unsafe fn postfork_child(&self) {
    let forking = self.forking_thread.load(Ordering::Relaxed);
    unsafe {
      self.chunks.postfork_child();
      self.huge.postfork_child();
      self.base.postfork_child();
      self.arenas.postfork_child(forking);
    }
  }
}

impl Drop for Heap {
  fn drop(&mut self) {
    self
      .arenas
      .for_each_owned(|arena| unsafe { (*arena).release_chunks() });
    self
      .huge
      .for_each_mapping(|addr, size| unsafe { os_munmap(addr, size) });
    unsafe { self.chunks.release_all() };
    // The base allocator unmaps its own chunks when dropped.
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    options::Poison,
    size_class::{MAX_BIN_CLASS, QUANTUM},
  };

  fn heap() -> Heap {
    let mut opts = Options::default();
    opts.poison = Poison::None;
    Heap::new(opts).unwrap()
  }

  #[test]
  fn zero_size_requests_get_one_byte() {
    let heap = heap();
    let p = heap.malloc(0).unwrap();
    assert_eq!(heap.usable_size(p.as_ptr()), 8);
    unsafe { heap.free(p.as_ptr()) };
  }

  #[test]
  fn calloc_overflow_fails() {
    let heap = heap();
    assert!(heap.calloc(usize::MAX / 2, 3).is_none());
    let p = heap.calloc(10, 10).unwrap();
    assert!((0..100).all(|i| unsafe { *p.as_ptr().add(i) } == 0));
    unsafe { heap.free(p.as_ptr()) };
  }

  #[test]
  fn foreign_pointers_have_no_size() {
    let heap = heap();
    let local = 5u64;
    assert_eq!(heap.usable_size((&raw const local).cast()), 0);
    assert_eq!(heap.usable_size(core::ptr::null()), 0);
    assert_eq!(heap.ptr_info((&raw const local).cast()).tag, PtrInfoTag::Unknown);
  }

  #[test]
  fn good_size_matches_usable_size() {
    let heap = heap();
    for size in [1, 9, QUANTUM * 3 + 1, MAX_BIN_CLASS, 5000, MAX_LARGE_CLASS, 3 << 20] {
      let p = heap.malloc(size).unwrap();
      assert_eq!(heap.usable_size(p.as_ptr()), Heap::good_size(size));
      unsafe { heap.free(p.as_ptr()) };
    }
  }

  #[test]
  fn posix_memalign_rejects_bad_alignment() {
    let heap = heap();
    assert_eq!(heap.posix_memalign(3, 8), Err(AlignError::InvalidAlignment));
    assert_eq!(heap.posix_memalign(4, 8), Err(AlignError::InvalidAlignment));
    assert_eq!(AlignError::InvalidAlignment.errno(), libc::EINVAL);
    let p = heap.posix_memalign(64, 100).unwrap();
    assert_eq!(p.as_ptr() as usize % 64, 0);
    unsafe { heap.free(p.as_ptr()) };
    assert!(heap.aligned_alloc(64, 100).is_none());
  }

  #[test]
  fn thread_arena_serves_small_requests_only() {
    let heap = heap();
    heap.thread_local_arena(true);
    let pinned = heap.choose_arena(16);
    assert_ne!(pinned, heap.arenas.default_arena());
    assert_eq!(heap.choose_arena(MAX_QUANTUM_CLASS + 1), heap.arenas.default_arena());
    // Another heap on the same thread ignores the pin.
    let other = self::heap();
    assert_eq!(other.choose_arena(16), other.arenas.default_arena());
    heap.thread_local_arena(false);
    assert_eq!(heap.choose_arena(16), heap.arenas.default_arena());
  }

  #[test]
  fn ptr_info_tags() {
    let heap = heap();
    let small = heap.malloc(48).unwrap().as_ptr();
    let info = heap.ptr_info(unsafe { small.add(10) });
    assert_eq!(info.tag, PtrInfoTag::LiveAlloc);
    assert_eq!(info.addr, small);
    assert_eq!(info.size, 48);

    let large = heap.malloc(3 * PAGE_SIZE).unwrap().as_ptr();
    let info = heap.ptr_info(unsafe { large.add(2 * PAGE_SIZE + 5) });
    assert_eq!((info.tag, info.addr, info.size), (PtrInfoTag::LiveAlloc, large, 3 * PAGE_SIZE));

    let header = ArenaChunk::for_ptr(small).cast::<u8>();
    assert_eq!(heap.ptr_info(header).tag, PtrInfoTag::Unknown);

    let keep = heap.malloc(48).unwrap().as_ptr();
    unsafe { heap.free(small) };
    assert_eq!(heap.ptr_info(small).tag, PtrInfoTag::FreedAlloc);
    unsafe { heap.free(large) };
    assert_eq!(heap.ptr_info(large).tag, PtrInfoTag::FreedPage);
    unsafe { heap.free(keep) };
  }

  #[test]
  fn stats_account_for_allocations() {
    let heap = heap();
    let before = heap.stats();
    let p = heap.malloc(100).unwrap();
    let h = heap.malloc(2 << 20).unwrap();
    let after = heap.stats();
    assert_eq!(after.allocated, before.allocated + 112 + (2 << 20));
    assert_eq!(after.narenas, 1);
    assert!(after.mapped >= after.allocated + after.waste + after.pages_dirty + after.bookkeeping);
    let lite = heap.stats_lite();
    assert_eq!(lite.allocated_bytes, after.allocated);
    unsafe {
      heap.free(p.as_ptr());
      heap.free(h.as_ptr());
    }
    assert_eq!(heap.stats_lite().allocated_bytes, before.allocated);
  }

  #[test]
  #[should_panic(expected = "No private arena")]
  fn unknown_private_arena_panics() {
    let heap = heap();
    heap.arena_malloc(12345, 8);
  }
}
