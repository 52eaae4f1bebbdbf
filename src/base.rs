//! Internal metadata allocator.
//!
//! Extent nodes, arenas and radix tree nodes live in memory carved from
//! dedicated mappings that are never handed to the chunk recycler. Memory is
//! bump allocated in cacheline units and only returned when the heap is torn
//! down. Extent nodes and arenas are pooled in typed free lists.

use core::ptr::null_mut;

use crate::{
  arena::Arena,
  extent::ExtentNode,
  platform::{os_map_aligned, os_munmap},
  size_class::{CHUNK_SIZE, cacheline_ceiling, chunk_ceiling, page_ceiling},
  sync::Mutex,
};
#[cfg(feature = "decommit")]
use crate::platform::{os_commit, os_decommit};

/// Links base mappings together for teardown. Sits at the start of each one.
#[repr(C)]
struct BaseChunk {
  next: *mut BaseChunk,
  size: usize,
}

const BASE_CHUNK_HEADER: usize = cacheline_ceiling(size_of::<BaseChunk>());

#[repr(C)]
struct FreeBlock {
  next: *mut FreeBlock,
}

struct BaseState {
  next_addr: usize,
  past_addr: usize,
  next_decommitted: usize,
  /// Provenance source for the current mapping.
  current: *mut u8,
  chunks: *mut BaseChunk,
  mapped: usize,
  committed: usize,
  free_extents: *mut FreeBlock,
  free_arenas: *mut FreeBlock,
}

#[derive(Clone, Copy, Default, Debug)]
pub(crate) struct BaseStats {
  pub(crate) mapped: usize,
  pub(crate) committed: usize,
}

pub(crate) struct BaseAllocator {
  state: Mutex<BaseState>,
}

unsafe impl Send for BaseState {}

impl BaseState {
  /// Starts a new mapping big enough for `min_size` bytes.
  unsafe fn pages_alloc(&mut self, min_size: usize) -> bool {
    let Some(csize) = min_size
      .checked_add(BASE_CHUNK_HEADER)
      .map(chunk_ceiling)
      .filter(|&c| c != 0)
    else {
      return false;
    };
    let pages = unsafe { os_map_aligned(csize, CHUNK_SIZE) };
    if pages.is_null() {
      return false;
    }
    unsafe {
      pages.cast::<BaseChunk>().write(BaseChunk {
        next: self.chunks,
        size: csize,
      });
    }
    self.chunks = pages.cast();

    let start = pages as usize;
    self.current = pages;
    self.next_addr = start + BASE_CHUNK_HEADER;
    self.past_addr = start + csize;
    let committed = page_ceiling(BASE_CHUNK_HEADER + min_size);
    self.next_decommitted = start + committed;
    #[cfg(feature = "decommit")]
    unsafe {
      os_decommit(pages.add(committed), csize - committed);
    }
    self.mapped += csize;
    self.committed += committed;
    true
  }

  unsafe fn alloc(&mut self, size: usize) -> *mut u8 {
    let csize = cacheline_ceiling(size);
    if self.next_addr + csize > self.past_addr && !unsafe { self.pages_alloc(csize) } {
      return null_mut();
    }
    let ret = self.current.with_addr(self.next_addr);
    self.next_addr += csize;

    if self.next_addr > self.next_decommitted {
      let pbase = page_ceiling(self.next_addr);
      #[cfg(feature = "decommit")]
      {
        let from = self.current.with_addr(self.next_decommitted);
        if !unsafe { os_commit(from, pbase - self.next_decommitted) } {
          return null_mut();
        }
      }
      self.committed += pbase - self.next_decommitted;
      self.next_decommitted = pbase;
    }
    ret
  }
}

impl BaseAllocator {
  pub(crate) const fn new() -> Self {
    Self {
      state: Mutex::new(BaseState {
        next_addr: 0,
        past_addr: 0,
        next_decommitted: 0,
        current: null_mut(),
        chunks: null_mut(),
        mapped: 0,
        committed: 0,
        free_extents: null_mut(),
        free_arenas: null_mut(),
      }),
    }
  }

  /// Cacheline aligned, uninitialized memory. Null when out of memory.
  pub(crate) fn alloc(&self, size: usize) -> *mut u8 {
    unsafe { self.state.lock().alloc(size) }
  }

  pub(crate) fn alloc_zeroed(&self, size: usize) -> *mut u8 {
    let ret = self.alloc(size);
    if !ret.is_null() {
      unsafe { ret.write_bytes(0, size) };
    }
    ret
  }

  fn pool_alloc(&self, size: usize, pick: fn(&mut BaseState) -> &mut *mut FreeBlock) -> *mut u8 {
    let mut state = self.state.lock();
    let head = pick(&mut state);
    let block = *head;
    if !block.is_null() {
      *head = unsafe { (*block).next };
      return block.cast();
    }
    unsafe { state.alloc(size) }
  }

  unsafe fn pool_dealloc(&self, ptr: *mut u8, pick: fn(&mut BaseState) -> &mut *mut FreeBlock) {
    let mut state = self.state.lock();
    let head = pick(&mut state);
    let block = ptr.cast::<FreeBlock>();
    unsafe { (*block).next = *head };
    *head = block;
  }

  pub(crate) fn alloc_extent(&self) -> *mut ExtentNode {
    self
      .pool_alloc(size_of::<ExtentNode>(), |s| &mut s.free_extents)
      .cast()
  }

  pub(crate) unsafe fn dealloc_extent(&self, node: *mut ExtentNode) {
    unsafe { self.pool_dealloc(node.cast(), |s| &mut s.free_extents) }
  }

  pub(crate) fn alloc_arena(&self) -> *mut Arena {
    self
      .pool_alloc(size_of::<Arena>(), |s| &mut s.free_arenas)
      .cast()
  }

  pub(crate) unsafe fn dealloc_arena(&self, arena: *mut Arena) {
    unsafe { self.pool_dealloc(arena.cast(), |s| &mut s.free_arenas) }
  }

  pub(crate) fn stats(&self) -> BaseStats {
    let state = self.state.lock();
    BaseStats {
      mapped: state.mapped,
      committed: state.committed,
    }
  }

  pub(crate) unsafe fn prefork(&self) {
    unsafe { self.state.force_lock() };
  }

  pub(crate) unsafe fn postfork_parent(&self) {
    unsafe { self.state.force_unlock() };
  }

  pub(crate) unsafe fn postfork_child(&self) {
    unsafe { self.state.reinit() };
  }
}

impl Drop for BaseAllocator {
  fn drop(&mut self) {
    let state = self.state.get_mut();
    let mut chunk = state.chunks;
    while !chunk.is_null() {
      unsafe {
        let BaseChunk { next, size } = chunk.read();
        os_munmap(chunk.cast(), size);
        chunk = next;
      }
    }
    state.chunks = null_mut();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::size_class::{CACHELINE_SIZE, PAGE_SIZE};

  #[test]
  fn allocations_are_cacheline_aligned_and_disjoint() {
    let base = BaseAllocator::new();
    let a = base.alloc(10);
    let b = base.alloc(100);
    assert_eq!(a as usize % CACHELINE_SIZE, 0);
    assert_eq!(b as usize - a as usize, CACHELINE_SIZE);
    unsafe {
      a.write_bytes(1, 10);
      b.write_bytes(2, 100);
      assert_eq!(*a, 1);
    }
    let stats = base.stats();
    assert_eq!(stats.mapped, CHUNK_SIZE);
    assert_eq!(stats.committed, PAGE_SIZE);
  }

  #[test]
  fn oversized_requests_get_their_own_mapping() {
    let base = BaseAllocator::new();
    base.alloc(16);
    let big = base.alloc(CHUNK_SIZE);
    assert!(!big.is_null());
    unsafe { big.add(CHUNK_SIZE - 1).write(7) };
    assert_eq!(base.stats().mapped, 3 * CHUNK_SIZE);
  }

  #[test]
  fn pools_reuse_freed_blocks() {
    let base = BaseAllocator::new();
    let a = base.alloc_extent();
    let b = base.alloc_extent();
    assert_ne!(a, b);
    unsafe { base.dealloc_extent(a) };
    assert_eq!(base.alloc_extent(), a);
    // Pools are separate.
    unsafe { base.dealloc_extent(b) };
    assert_ne!(base.alloc_arena().cast::<ExtentNode>(), b);
  }
}
