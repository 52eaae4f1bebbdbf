//! Chunk acquisition and recycling.
//!
//! Chunks come from the OS aligned to `CHUNK_SIZE`. Released chunks are kept,
//! decommitted, in a pair of trees (by size and by address) up to a byte limit
//! so later requests can reuse the address space without a new mapping.

use core::{
  cmp::Ordering,
  ptr::null_mut,
  sync::atomic::{AtomicUsize, Ordering as AtomicOrdering},
};

use crate::{
  arena::Arena,
  base::BaseAllocator,
  platform::{os_commit, os_decommit, os_map_aligned, os_munmap, os_trim},
  radix::AddressRadixTree,
  rb::{RbAdapter, RbLink, RbTree},
  size_class::{CHUNK_SIZE, align_up},
  sync::Mutex,
};

/// What a chunk was last used for.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ChunkType {
  Unknown,
  /// Known to read as zero.
  Zeroed,
  Arena,
  Huge,
  /// Coalesced from ranges of different types.
  Recycled,
}

/// Describes either a recyclable range of address space or a huge allocation.
#[repr(C)]
pub(crate) struct ExtentNode {
  by_size: RbLink<ExtentNode>,
  by_addr: RbLink<ExtentNode>,
  pub(crate) addr: *mut u8,
  pub(crate) size: usize,
  pub(crate) chunk_type: ChunkType,
  /// Owning arena of a huge allocation.
  pub(crate) arena: *mut Arena,
  pub(crate) arena_id: u64,
}

impl ExtentNode {
  pub(crate) unsafe fn init(node: *mut ExtentNode, addr: *mut u8, size: usize, chunk_type: ChunkType) {
    unsafe {
      node.write(ExtentNode {
        by_size: RbLink::new(),
        by_addr: RbLink::new(),
        addr,
        size,
        chunk_type,
        arena: null_mut(),
        arena_id: 0,
      });
    }
  }
}

pub(crate) struct ExtentBySize;

impl RbAdapter for ExtentBySize {
  type Node = ExtentNode;

  fn link(node: *mut ExtentNode) -> *mut RbLink<ExtentNode> {
    unsafe { &raw mut (*node).by_size }
  }

  fn compare(a: *mut ExtentNode, b: *mut ExtentNode) -> Ordering {
    unsafe { (*a).size.cmp(&(*b).size).then(((*a).addr as usize).cmp(&((*b).addr as usize))) }
  }
}

pub(crate) struct ExtentByAddr;

impl RbAdapter for ExtentByAddr {
  type Node = ExtentNode;

  fn link(node: *mut ExtentNode) -> *mut RbLink<ExtentNode> {
    unsafe { &raw mut (*node).by_addr }
  }

  fn compare(a: *mut ExtentNode, b: *mut ExtentNode) -> Ordering {
    unsafe { ((*a).addr as usize).cmp(&((*b).addr as usize)) }
  }
}

struct Recycled {
  by_size: RbTree<ExtentBySize>,
  by_addr: RbTree<ExtentByAddr>,
}

unsafe impl Send for Recycled {}

// =============================================================================
// Chunk allocator
// =============================================================================

pub(crate) struct ChunkAllocator {
  recycled: Mutex<Recycled>,
  /// Bytes currently held for recycling.
  recycled_size: AtomicUsize,
  recycle_limit: usize,
  rtree: AddressRadixTree,
}

impl ChunkAllocator {
  pub(crate) fn new(recycle_limit: usize, base: &BaseAllocator) -> Option<Self> {
    Some(Self {
      recycled: Mutex::new(Recycled {
        by_size: RbTree::new(),
        by_addr: RbTree::new(),
      }),
      recycled_size: AtomicUsize::new(0),
      recycle_limit,
      rtree: AddressRadixTree::new(base)?,
    })
  }

  pub(crate) fn recycled_size(&self) -> usize {
    self.recycled_size.load(AtomicOrdering::Relaxed)
  }

  /// True when `ptr` lies in a chunk this allocator handed out.
  #[inline]
  pub(crate) fn is_registered(&self, chunk: *const u8) -> bool {
    !self.rtree.get(chunk).is_null()
  }

  /// Maps `size` bytes aligned to `alignment`, both multiples of
  /// `CHUNK_SIZE`. The memory reads as zero. Null on failure.
  pub(crate) unsafe fn alloc(&self, size: usize, alignment: usize, base: &BaseAllocator) -> *mut u8 {
    debug_assert!(size != 0 && size % CHUNK_SIZE == 0);
    debug_assert!(alignment != 0 && alignment % CHUNK_SIZE == 0);

    let mut ret = unsafe { self.recycle(size, alignment, base) };
    if ret.is_null() {
      ret = unsafe { os_map_aligned(size, alignment) };
    }
    if ret.is_null() {
      return null_mut();
    }
    if !self.rtree.set(ret, ret, base) {
      unsafe { self.dealloc(ret, size, ChunkType::Unknown, base) };
      return null_mut();
    }
    ret
  }

  unsafe fn recycle(&self, size: usize, alignment: usize, base: &BaseAllocator) -> *mut u8 {
    let Some(alloc_size) = size.checked_add(alignment - CHUNK_SIZE) else {
      return null_mut();
    };

    let mut recycled = self.recycled.lock();
    let node = recycled
      .by_size
      .search_or_next_by(|n| unsafe { alloc_size.cmp(&(*n).size).then(Ordering::Less) });
    if node.is_null() {
      return null_mut();
    }
    let (node_addr, node_size) = unsafe { ((*node).addr, (*node).size) };
    let lead = align_up(node_addr as usize, alignment) - node_addr as usize;
    debug_assert!(node_size >= lead + size);
    let trail = node_size - lead - size;
    let ret = unsafe { node_addr.add(lead) };

    unsafe {
      recycled.by_size.remove(node);
      recycled.by_addr.remove(node);
    }
    let mut spare = node;
    if lead != 0 {
      unsafe {
        (*node).size = lead;
        recycled.by_size.insert(node);
        recycled.by_addr.insert(node);
      }
      spare = null_mut();
    }
    if trail != 0 {
      let trail_node = if spare.is_null() {
        drop(recycled);
        let fresh = base.alloc_extent();
        if fresh.is_null() {
          // The lead stays recorded. Put the rest back as well.
          self
            .recycled_size
            .fetch_sub(size + trail, AtomicOrdering::Relaxed);
          unsafe { self.record(ret, size + trail, ChunkType::Zeroed, base) };
          return null_mut();
        }
        recycled = self.recycled.lock();
        fresh
      } else {
        spare = null_mut();
        node
      };
      unsafe {
        ExtentNode::init(trail_node, ret.add(size), trail, ChunkType::Zeroed);
        recycled.by_size.insert(trail_node);
        recycled.by_addr.insert(trail_node);
      }
    }
    self.recycled_size.fetch_sub(size, AtomicOrdering::Relaxed);
    drop(recycled);

    if !spare.is_null() {
      unsafe { base.dealloc_extent(spare) };
    }
    if !unsafe { os_commit(ret, size) } {
      unsafe { self.record(ret, size, ChunkType::Zeroed, base) };
      return null_mut();
    }
    ret
  }

  /// Hands back a chunk range. Keeps it for recycling while under the limit,
  /// unmaps the rest.
  pub(crate) unsafe fn dealloc(&self, chunk: *mut u8, size: usize, chunk_type: ChunkType, base: &BaseAllocator) {
    debug_assert!(!chunk.is_null());
    debug_assert!(chunk as usize % CHUNK_SIZE == 0);
    debug_assert!(size != 0 && size % CHUNK_SIZE == 0);

    self.rtree.unset(chunk, base);

    let recycled = self.recycled_size();
    if recycled < self.recycle_limit {
      let remaining = self.recycle_limit - recycled;
      let mut to_recycle = size;
      if size > remaining {
        to_recycle = remaining - remaining % CHUNK_SIZE;
        if to_recycle == 0 {
          unsafe { os_munmap(chunk, size) };
          return;
        }
        unsafe { os_trim(chunk, size, 0, to_recycle) };
      }
      unsafe { self.record(chunk, to_recycle, chunk_type, base) };
      return;
    }
    unsafe { os_munmap(chunk, size) };
  }

  unsafe fn record(&self, chunk: *mut u8, size: usize, mut chunk_type: ChunkType, base: &BaseAllocator) {
    if chunk_type != ChunkType::Zeroed {
      unsafe { os_decommit(chunk, size) };
      chunk_type = ChunkType::Zeroed;
    }

    // Allocated before locking, since the base allocator has its own lock.
    let mut xnode = base.alloc_extent();
    let mut xprev: *mut ExtentNode = null_mut();

    let mut recycled = self.recycled.lock();
    let end = unsafe { chunk.add(size) } as usize;
    let next = recycled
      .by_addr
      .search_or_next_by(|n| unsafe { end.cmp(&((*n).addr as usize)) });

    let node = if !next.is_null() && unsafe { (*next).addr } as usize == end {
      // Coalesce forward.
      unsafe {
        recycled.by_size.remove(next);
        (*next).addr = chunk;
        (*next).size += size;
        if (*next).chunk_type != chunk_type {
          (*next).chunk_type = ChunkType::Recycled;
        }
        recycled.by_size.insert(next);
      }
      next
    } else {
      if xnode.is_null() {
        // Leak the range rather than lose track of it under the lock.
        drop(recycled);
        tracing_leak(size);
        return;
      }
      let node = xnode;
      xnode = null_mut();
      unsafe {
        ExtentNode::init(node, chunk, size, chunk_type);
        recycled.by_addr.insert(node);
        recycled.by_size.insert(node);
      }
      node
    };

    // Coalesce backward.
    let prev = recycled.by_addr.prev(node);
    if !prev.is_null() && unsafe { (*prev).addr.add((*prev).size) } as usize == chunk as usize {
      unsafe {
        recycled.by_size.remove(prev);
        recycled.by_addr.remove(prev);
        recycled.by_size.remove(node);
        (*node).addr = (*prev).addr;
        (*node).size += (*prev).size;
        if (*node).chunk_type != (*prev).chunk_type {
          (*node).chunk_type = ChunkType::Recycled;
        }
        recycled.by_size.insert(node);
      }
      xprev = prev;
    }

    self.recycled_size.fetch_add(size, AtomicOrdering::Relaxed);
    drop(recycled);

    unsafe {
      if !xnode.is_null() {
        base.dealloc_extent(xnode);
      }
      if !xprev.is_null() {
        base.dealloc_extent(xprev);
      }
    }
  }

  /// Unmaps every recycled range. Only for heap teardown.
  pub(crate) unsafe fn release_all(&mut self) {
    let recycled = self.recycled.get_mut();
    while !recycled.by_addr.is_empty() {
      let node = recycled.by_addr.first();
      unsafe {
        recycled.by_addr.remove(node);
        recycled.by_size.remove(node);
        os_munmap((*node).addr, (*node).size);
      }
    }
    self.recycled_size.store(0, AtomicOrdering::Relaxed);
  }

  pub(crate) unsafe fn prefork(&self) {
    unsafe {
      self.recycled.force_lock();
      self.rtree.prefork();
    }
  }

  pub(crate) unsafe fn postfork_parent(&self) {
    unsafe {
      self.rtree.postfork_parent();
      self.recycled.force_unlock();
    }
  }

  pub(crate) unsafe fn postfork_child(&self) {
    unsafe {
      self.rtree.postfork_child();
      self.recycled.reinit();
    }
  }
}

#[cold]
fn tracing_leak(size: usize) {
  tracing::warn!(size, "no memory for an extent node, leaking recycled chunk");
}

#[cfg(test)]
mod tests {
  use super::*;

  fn ranges(chunks: &ChunkAllocator) -> Vec<(usize, usize)> {
    let recycled = chunks.recycled.lock();
    let out = recycled
      .by_addr
      .iter()
      .map(|n| unsafe { ((*n).addr as usize, (*n).size) })
      .collect();
    assert_eq!(recycled.by_size.iter().count(), recycled.by_addr.iter().count());
    out
  }

  #[test]
  fn freed_chunks_coalesce_and_are_reused() {
    let base = BaseAllocator::new();
    let mut chunks = ChunkAllocator::new(64 * CHUNK_SIZE, &base).unwrap();
    unsafe {
      let big = chunks.alloc(3 * CHUNK_SIZE, CHUNK_SIZE, &base);
      assert!(!big.is_null());
      assert!(chunks.is_registered(big));
      big.write(1);

      // Free the three chunks out of order; they merge into one range.
      let (a, b, c) = (big, big.add(CHUNK_SIZE), big.add(2 * CHUNK_SIZE));
      chunks.dealloc(a, CHUNK_SIZE, ChunkType::Arena, &base);
      chunks.dealloc(c, CHUNK_SIZE, ChunkType::Arena, &base);
      assert_eq!(ranges(&chunks).len(), 2);
      chunks.dealloc(b, CHUNK_SIZE, ChunkType::Arena, &base);
      assert_eq!(ranges(&chunks), [(a as usize, 3 * CHUNK_SIZE)]);
      assert_eq!(chunks.recycled_size(), 3 * CHUNK_SIZE);
      assert!(!chunks.is_registered(a));

      // Reuse splits off a trail and the memory reads as zero.
      let again = chunks.alloc(CHUNK_SIZE, CHUNK_SIZE, &base);
      assert_eq!(again, a);
      assert_eq!(*again, 0);
      assert_eq!(ranges(&chunks), [(b as usize, 2 * CHUNK_SIZE)]);
      assert_eq!(chunks.recycled_size(), 2 * CHUNK_SIZE);

      chunks.dealloc(again, CHUNK_SIZE, ChunkType::Arena, &base);
      chunks.release_all();
    }
  }

  #[test]
  fn recycling_is_capped() {
    let base = BaseAllocator::new();
    let mut chunks = ChunkAllocator::new(2 * CHUNK_SIZE, &base).unwrap();
    unsafe {
      let big = chunks.alloc(4 * CHUNK_SIZE, CHUNK_SIZE, &base);
      assert!(!big.is_null());
      chunks.dealloc(big, 4 * CHUNK_SIZE, ChunkType::Huge, &base);
      assert_eq!(chunks.recycled_size(), 2 * CHUNK_SIZE);
      assert_eq!(ranges(&chunks), [(big as usize, 2 * CHUNK_SIZE)]);
      chunks.release_all();
    }
  }

  #[test]
  fn aligned_requests_leave_a_lead() {
    let base = BaseAllocator::new();
    let mut chunks = ChunkAllocator::new(64 * CHUNK_SIZE, &base).unwrap();
    unsafe {
      let big = chunks.alloc(8 * CHUNK_SIZE, 4 * CHUNK_SIZE, &base);
      assert!(!big.is_null());
      chunks.dealloc(big, 8 * CHUNK_SIZE, ChunkType::Huge, &base);
      let aligned = chunks.alloc(2 * CHUNK_SIZE, 2 * CHUNK_SIZE, &base);
      assert!(!aligned.is_null());
      assert_eq!(aligned as usize % (2 * CHUNK_SIZE), 0);
      assert_eq!(chunks.recycled_size(), 6 * CHUNK_SIZE);
      chunks.dealloc(aligned, 2 * CHUNK_SIZE, ChunkType::Huge, &base);
      assert_eq!(ranges(&chunks), [(big as usize, 8 * CHUNK_SIZE)]);
      chunks.release_all();
    }
  }
}
