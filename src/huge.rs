//! Huge allocations: whole chunk ranges tracked by extent nodes.
//!
//! A huge allocation of `size` bytes maps `chunk_ceiling(size + PAGE_SIZE)`
//! bytes, so at least one decommitted page always trails the usable part.

use core::ptr::null_mut;

use crate::{
  arena::Arena,
  extent::{ChunkType, ExtentByAddr, ExtentNode},
  heap::Heap,
  platform::{os_commit, os_decommit},
  rb::RbTree,
  size_class::{CHUNK_SIZE, PAGE_SIZE, chunk_ceiling, page_ceiling},
  sync::Mutex,
};

struct HugeState {
  tree: RbTree<ExtentByAddr>,
  /// Usable bytes of every huge allocation.
  allocated: usize,
  /// Mapped bytes, trailing guard pages included.
  mapped: usize,
  operations: u64,
}

unsafe impl Send for HugeState {}

pub(crate) struct HugeRegistry {
  state: Mutex<HugeState>,
}

/// Lookup result for a live huge allocation.
#[derive(Clone, Copy, Debug)]
pub(crate) struct HugeInfo {
  pub(crate) addr: *mut u8,
  pub(crate) size: usize,
  pub(crate) arena: *mut Arena,
  pub(crate) arena_id: u64,
}

/// Mapping size backing a huge allocation of `size` bytes, or `None` on
/// overflow.
#[inline]
fn mapped_size(size: usize) -> Option<usize> {
  size
    .checked_add(PAGE_SIZE + CHUNK_SIZE - 1)
    .map(|_| chunk_ceiling(size + PAGE_SIZE))
}

impl HugeRegistry {
  pub(crate) const fn new() -> Self {
    Self {
      state: Mutex::new(HugeState {
        tree: RbTree::new(),
        allocated: 0,
        mapped: 0,
        operations: 0,
      }),
    }
  }

  /// The allocation starting exactly at `ptr`.
  pub(crate) fn get(&self, ptr: *const u8) -> Option<HugeInfo> {
    let state = self.state.lock();
    let node = state
      .tree
      .search_by(|n| unsafe { (ptr as usize).cmp(&((*n).addr as usize)) });
    (!node.is_null()).then(|| unsafe { info(node) })
  }

  /// The allocation whose usable bytes contain `ptr`.
  pub(crate) fn find_containing(&self, ptr: *const u8) -> Option<HugeInfo> {
    let state = self.state.lock();
    let addr = ptr as usize;
    let next = state
      .tree
      .search_or_next_by(|n| unsafe { addr.cmp(&((*n).addr as usize)) });
    let node = if !next.is_null() && unsafe { (*next).addr } as usize == addr {
      next
    } else if next.is_null() {
      state.tree.last()
    } else {
      state.tree.prev(next)
    };
    if node.is_null() {
      return None;
    }
    let found = unsafe { info(node) };
    (addr >= found.addr as usize && addr < found.addr as usize + found.size).then_some(found)
  }

  pub(crate) fn allocated(&self) -> usize {
    self.state.lock().allocated
  }

  pub(crate) fn mapped(&self) -> usize {
    self.state.lock().mapped
  }

  pub(crate) fn operations(&self) -> u64 {
    self.state.lock().operations
  }

  /// Calls `f` with the start and mapped size of every huge allocation.
  /// Only for heap teardown.
  pub(crate) fn for_each_mapping(&mut self, mut f: impl FnMut(*mut u8, usize)) {
    let state = self.state.get_mut();
    for node in state.tree.iter() {
      unsafe {
        if let Some(mapped) = mapped_size((*node).size) {
          f((*node).addr, mapped);
        }
      }
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

  /// Updates the recorded size of the allocation at `ptr` after an in-place
  /// resize by `arena`.
  fn resize(&self, ptr: *mut u8, arena: *mut Arena, old_size: usize, new_size: usize) {
    let mut state = self.state.lock();
    let node = state
      .tree
      .search_by(|n| unsafe { (ptr as usize).cmp(&((*n).addr as usize)) });
    assert!(!node.is_null(), "Resizing an unknown huge allocation.");
    unsafe {
      debug_assert_eq!((*node).size, old_size);
      assert!((*node).arena == arena, "Resizing with the wrong arena.");
      (*node).size = new_size;
    }
    state.allocated = state.allocated + new_size - old_size;
    state.operations += 1;
  }
}

unsafe fn info(node: *mut ExtentNode) -> HugeInfo {
  unsafe {
    HugeInfo {
      addr: (*node).addr,
      size: (*node).size,
      arena: (*node).arena,
      arena_id: (*node).arena_id,
    }
  }
}

impl Arena {
  pub(crate) unsafe fn malloc_huge(&self, heap: &Heap, size: usize, zero: bool) -> *mut u8 {
    unsafe { self.palloc_huge(heap, size, CHUNK_SIZE, zero) }
  }

  /// Maps a huge allocation aligned to `alignment`, a multiple of
  /// `CHUNK_SIZE`. Null when out of memory.
  pub(crate) unsafe fn palloc_huge(&self, heap: &Heap, size: usize, alignment: usize, zero: bool) -> *mut u8 {
    let Some(csize) = mapped_size(size) else {
      return null_mut();
    };
    let alignment = alignment.max(CHUNK_SIZE);

    let node = heap.base.alloc_extent();
    if node.is_null() {
      return null_mut();
    }
    let ret = unsafe { heap.chunks.alloc(csize, alignment, &heap.base) };
    if ret.is_null() {
      unsafe { heap.base.dealloc_extent(node) };
      return null_mut();
    }

    let psize = page_ceiling(size);
    unsafe {
      ExtentNode::init(node, ret, psize, ChunkType::Huge);
      (*node).arena = (self as *const Arena).cast_mut();
      (*node).arena_id = self.id();
    }
    {
      let mut state = heap.huge.state.lock();
      unsafe { state.tree.insert(node) };
      state.allocated += psize;
      state.mapped += csize;
      state.operations += 1;
    }

    unsafe {
      os_decommit(ret.add(psize), csize - psize);
      if !zero {
        heap.options.apply_zero_or_junk(ret, psize);
      }
    }
    ret
  }

  /// Resizes a huge allocation, in place when the mapping size would not
  /// change. `old_size` may also be a small or large size when growing into
  /// the huge range.
  pub(crate) unsafe fn ralloc_huge(&self, heap: &Heap, ptr: *mut u8, size: usize, old_size: usize) -> *mut u8 {
    let same_mapping = old_size > crate::chunk::MAX_LARGE_CLASS
      && mapped_size(size).is_some()
      && mapped_size(size) == mapped_size(old_size);

    if same_mapping {
      let psize = page_ceiling(size);
      let this = (self as *const Arena).cast_mut();
      unsafe {
        if size < old_size {
          heap.options.poison(ptr.add(size), old_size - size);
        }
        if psize < old_size {
          os_decommit(ptr.add(psize), old_size - psize);
          heap.huge.resize(ptr, this, old_size, psize);
        } else if psize > old_size {
          if !os_commit(ptr.add(old_size), psize - old_size) {
            return null_mut();
          }
          heap.huge.resize(ptr, this, old_size, psize);
        }
        if size > old_size {
          heap.options.apply_zero_or_junk(ptr.add(old_size), size - old_size);
        }
      }
      return ptr;
    }

    let target = if self.is_private {
      (self as *const Arena).cast_mut()
    } else {
      heap.choose_arena(size)
    };
    let ret = unsafe { (*target).malloc_huge(heap, size, false) };
    if ret.is_null() {
      return null_mut();
    }
    unsafe {
      ret.copy_from_nonoverlapping(ptr, size.min(old_size));
      heap.idalloc(ptr, Some((self as *const Arena).cast_mut()));
    }
    ret
  }
}

/// Unmaps a huge allocation.
///
/// # Panics
///
/// When `ptr` is not a live huge allocation, or belongs to another arena than
/// `arena`, or its arena was destroyed.
pub(crate) unsafe fn huge_dalloc(heap: &Heap, ptr: *mut u8, arena: Option<*mut Arena>) {
  let (node, mapped) = {
    let mut state = heap.huge.state.lock();
    let node = state
      .tree
      .search_by(|n| unsafe { (ptr as usize).cmp(&((*n).addr as usize)) });
    assert!(!node.is_null(), "Double-free?");
    unsafe {
      debug_assert_eq!((*node).addr, ptr);
      assert!(arena.is_none_or(|a| a == (*node).arena), "Freeing with the wrong arena.");
      assert!((*node).arena_id == (*(*node).arena).id(), "Freeing into a destroyed arena.");
      state.tree.remove(node);
    }
    let size = unsafe { (*node).size };
    let mapped = chunk_ceiling(size + PAGE_SIZE);
    state.allocated -= size;
    state.mapped -= mapped;
    state.operations += 1;
    (node, mapped)
  };

  unsafe {
    heap.chunks.dealloc((*node).addr, mapped, ChunkType::Huge, &heap.base);
    heap.base.dealloc_extent(node);
  }
}
