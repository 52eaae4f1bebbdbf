#![allow(clippy::missing_safety_doc)]

//! A multi-arena allocator with size-class bins, red-black free-run indices
//! and deferred dirty page purging, plus a single-pass WebAssembly validator.

mod arena;
mod base;
mod bin;
mod chunk;
mod collection;
mod extent;
mod heap;
mod huge;
mod list;
mod options;
mod platform;
mod prng;
mod radix;
mod rb;
pub mod size_class;
mod stats;
mod sync;
pub mod wasm;

use core::{
  alloc::{GlobalAlloc, Layout},
  ptr::{self, NonNull, null_mut},
};

pub use arena::{ArenaParams, Randomize};
pub use chunk::MAX_LARGE_CLASS;
pub use collection::MayPurgeResult;
pub use heap::{AlignError, Heap, HeapError};
pub use options::{ALLOC_JUNK, ALLOC_POISON, DIRTY_MAX_DEFAULT, Options, Poison};
pub use stats::{BinStats, HeapStats, PtrInfo, PtrInfoTag, StatsLite};

use size_class::{MAX_TINY_CLASS, QUANTUM};

// =============================================================================
// GlobalAlloc
// =============================================================================

/// Routes Rust allocations to [`Heap::global`].
pub struct Allocator;

/// True when the size class serving `layout.size()` is aligned enough.
#[inline(always)]
fn malloc_is_aligned(layout: Layout) -> bool {
  layout.align() <= MAX_TINY_CLASS || (layout.align() <= QUANTUM && layout.size() > MAX_TINY_CLASS)
}

#[inline(always)]
fn into_raw(ptr: Option<NonNull<u8>>) -> *mut u8 {
  ptr.map_or(null_mut(), NonNull::as_ptr)
}

unsafe impl GlobalAlloc for Allocator {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    let Some(heap) = Heap::global() else {
      return null_mut();
    };
    if malloc_is_aligned(layout) {
      into_raw(heap.malloc(layout.size()))
    } else {
      into_raw(heap.memalign(layout.align(), layout.size()))
    }
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    if let Some(heap) = Heap::global() {
      unsafe { heap.free(ptr) };
    }
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    let Some(heap) = Heap::global() else {
      return null_mut();
    };
    let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
    if malloc_is_aligned(layout) && malloc_is_aligned(new_layout) {
      return into_raw(unsafe { heap.realloc(ptr, new_size) });
    }

    let new_ptr = into_raw(heap.memalign(layout.align(), new_size));
    if !new_ptr.is_null() {
      unsafe {
        ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
        heap.free(ptr);
      }
    }
    new_ptr
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    let Some(heap) = Heap::global() else {
      return null_mut();
    };
    if malloc_is_aligned(layout) {
      return into_raw(heap.calloc(1, layout.size()));
    }
    let ptr = into_raw(heap.memalign(layout.align(), layout.size()));
    if !ptr.is_null() {
      unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
    }
    ptr
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
mod c_api {
  use core::ptr::null_mut;

  use super::{Heap, PtrInfo, StatsLite, into_raw};
  use crate::{arena::ArenaParams, collection::MayPurgeResult};

  #[cfg(target_os = "linux")]
  fn set_errno(code: i32) {
    unsafe { *libc::__errno_location() = code };
  }

  #[cfg(not(target_os = "linux"))]
  fn set_errno(_code: i32) {}

  /// Sets `ENOMEM` when the allocation failed.
  fn or_enomem(ptr: *mut u8) -> *mut u8 {
    if ptr.is_null() {
      set_errno(libc::ENOMEM);
    }
    ptr
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
    or_enomem(Heap::global().map_or(null_mut(), |h| into_raw(h.malloc(size))))
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn free(ptr: *mut u8) {
    if let Some(heap) = Heap::global() {
      unsafe { heap.free(ptr) };
    }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
    or_enomem(Heap::global().map_or(null_mut(), |h| into_raw(h.calloc(nmemb, size))))
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    or_enomem(Heap::global().map_or(null_mut(), |h| into_raw(unsafe { h.realloc(ptr, size) })))
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn posix_memalign(memptr: *mut *mut u8, alignment: usize, size: usize) -> i32 {
    let Some(heap) = Heap::global() else {
      return libc::ENOMEM;
    };
    match heap.posix_memalign(alignment, size) {
      Ok(ptr) => {
        unsafe { *memptr = ptr.as_ptr() };
        0
      }
      Err(e) => e.errno(),
    }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut u8 {
    or_enomem(Heap::global().map_or(null_mut(), |h| into_raw(h.aligned_alloc(alignment, size))))
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut u8 {
    if !alignment.is_power_of_two() {
      set_errno(libc::EINVAL);
      return null_mut();
    }
    or_enomem(Heap::global().map_or(null_mut(), |h| into_raw(h.memalign(alignment, size))))
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn valloc(size: usize) -> *mut u8 {
    or_enomem(Heap::global().map_or(null_mut(), |h| into_raw(h.valloc(size))))
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn malloc_usable_size(ptr: *const u8) -> usize {
    Heap::global().map_or(0, |h| h.usable_size(ptr))
  }

  #[unsafe(no_mangle)]
  pub extern "C" fn malloc_good_size(size: usize) -> usize {
    Heap::good_size(size)
  }

  // ===========================================================================
  // Extensions
  // ===========================================================================

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn jemalloc_ptr_info(ptr: *const u8, info: *mut PtrInfo) {
    let ret = Heap::global().map_or(PtrInfo::UNKNOWN, |h| h.ptr_info(ptr));
    unsafe { info.write(ret) };
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn jemalloc_stats_lite(stats: *mut StatsLite) {
    let ret = Heap::global().map_or(StatsLite::default(), Heap::stats_lite);
    unsafe { stats.write(ret) };
  }

  #[unsafe(no_mangle)]
  pub extern "C" fn jemalloc_free_dirty_pages() {
    if let Some(heap) = Heap::global() {
      heap.free_dirty_pages();
    }
  }

  #[unsafe(no_mangle)]
  pub extern "C" fn jemalloc_free_excess_dirty_pages() {
    if let Some(heap) = Heap::global() {
      heap.free_excess_dirty_pages();
    }
  }

  #[unsafe(no_mangle)]
  pub extern "C" fn jemalloc_purge_freed_pages() {
    if let Some(heap) = Heap::global() {
      heap.purge_freed_pages();
    }
  }

  #[unsafe(no_mangle)]
  pub extern "C" fn jemalloc_set_main_thread() {
    if let Some(heap) = Heap::global() {
      heap.set_main_thread();
    }
  }

  #[unsafe(no_mangle)]
  pub extern "C" fn jemalloc_thread_local_arena(enabled: bool) {
    if let Some(heap) = Heap::global() {
      heap.thread_local_arena(enabled);
    }
  }

  #[unsafe(no_mangle)]
  pub extern "C" fn jemalloc_reset_small_alloc_randomization(enabled: bool) {
    if let Some(heap) = Heap::global() {
      heap.reset_small_alloc_randomization(enabled);
    }
  }

  #[unsafe(no_mangle)]
  pub extern "C" fn moz_enable_deferred_purge(enable: bool) -> bool {
    Heap::global().is_some_and(|h| h.enable_deferred_purge(enable))
  }

  #[unsafe(no_mangle)]
  pub extern "C" fn moz_set_max_dirty_page_modifier(modifier: i32) {
    if let Some(heap) = Heap::global() {
      heap.set_max_dirty_page_modifier(modifier);
    }
  }

  /// 0 when done, 1 when more work is waiting, 2 when purging should wait
  /// for the reuse grace period.
  #[unsafe(no_mangle)]
  pub extern "C" fn moz_may_purge_now(peek_only: bool, reuse_grace_ms: u32) -> i32 {
    match Heap::global().map(|h| h.may_purge_now(peek_only, reuse_grace_ms, None)) {
      None | Some(MayPurgeResult::Done) => 0,
      Some(MayPurgeResult::NeedsMore) => 1,
      Some(MayPurgeResult::WantsLater) => 2,
    }
  }

  #[unsafe(no_mangle)]
  pub extern "C" fn moz_create_arena() -> u64 {
    Heap::global().map_or(0, |h| h.create_arena(&ArenaParams::default()))
  }

  #[unsafe(no_mangle)]
  pub extern "C" fn moz_dispose_arena(id: u64) {
    if let Some(heap) = Heap::global() {
      heap.dispose_arena(id);
    }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn moz_arena_malloc(id: u64, size: usize) -> *mut u8 {
    or_enomem(Heap::global().map_or(null_mut(), |h| into_raw(h.arena_malloc(id, size))))
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn moz_arena_calloc(id: u64, nmemb: usize, size: usize) -> *mut u8 {
    or_enomem(Heap::global().map_or(null_mut(), |h| into_raw(h.arena_calloc(id, nmemb, size))))
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn moz_arena_realloc(id: u64, ptr: *mut u8, size: usize) -> *mut u8 {
    or_enomem(Heap::global().map_or(null_mut(), |h| {
      into_raw(unsafe { h.arena_realloc(id, ptr, size) })
    }))
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn moz_arena_free(id: u64, ptr: *mut u8) {
    if let Some(heap) = Heap::global() {
      unsafe { heap.arena_free(id, ptr) };
    }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn moz_arena_memalign(id: u64, alignment: usize, size: usize) -> *mut u8 {
    or_enomem(Heap::global().map_or(null_mut(), |h| {
      into_raw(h.arena_memalign(id, alignment, size))
    }))
  }
}

// =============================================================================
// Bench helpers
// =============================================================================

#[cfg(feature = "bench")]
pub unsafe fn ralloc_malloc(size: usize) -> *mut u8 {
  Heap::global().map_or(null_mut(), |h| into_raw(h.malloc(size)))
}

#[cfg(feature = "bench")]
pub unsafe fn ralloc_free(ptr: *mut u8) {
  if let Some(heap) = Heap::global() {
    unsafe { heap.free(ptr) };
  }
}
