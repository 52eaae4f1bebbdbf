//! Arena chunk headers and the per-page map.
//!
//! A chunk is a `CHUNK_SIZE`-aligned mapping. Its first pages hold the header
//! (this struct and the page map), followed by a decommitted guard page. The
//! last page of the chunk is a second guard page. Everything between is
//! carved into runs.

use core::cmp::Ordering;

use bitflags::bitflags;

use crate::{
  arena::Arena,
  list::{ListAdapter, ListLink},
  rb::{RbAdapter, RbLink},
  size_class::{CHUNK_NUM_PAGES, CHUNK_SIZE, PAGE_SIZE, PAGE_SIZE_2POW, PAGE_SIZE_MASK, page_ceiling},
};

// =============================================================================
// Page map entries
// =============================================================================

bitflags! {
  /// Low flag bits of a page map entry.
  #[derive(Clone, Copy, PartialEq, Eq, Debug)]
  pub(crate) struct PageFlags: usize {
    const ALLOCATED = 0x01;
    /// Only meaningful together with `ALLOCATED`.
    const LARGE = 0x02;
    /// The page is known to read as zero.
    const ZEROED = 0x04;
    /// A purge owns the free run this page bounds. Nobody else may touch it.
    const BUSY = 0x80;
  }
}

/// Backing state of an unallocated page. The states exclude each other.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(usize)]
pub(crate) enum PageState {
  /// Allocated, or free and committed without being counted as dirty.
  Clean = 0,
  /// Freed; may still hold old contents.
  Dirty = 1,
  /// Handed back with `MADV_FREE`; usable without a syscall.
  Madvised = 2,
  /// Inaccessible until committed again.
  Decommitted = 3,
  /// Committed and never used, or hard purged.
  Fresh = 4,
}

const STATE_SHIFT: u32 = 3;
const STATE_MASK: usize = 0x7 << STATE_SHIFT;
const FLAG_MASK: usize = PageFlags::all().bits();

const _: () = assert!(STATE_MASK & FLAG_MASK == 0);
const _: () = assert!((STATE_MASK | FLAG_MASK) <= PAGE_SIZE_MASK);

/// One page worth of metadata.
///
/// The bits above `PAGE_SIZE_MASK` hold, depending on the page:
/// - free run, first and last page: the run size (interior pages are stale)
/// - large run, first page: the allocation size (other pages hold zero)
/// - small run, every page: the run address
#[repr(C)]
pub(crate) struct PageMapEntry {
  link: RbLink<PageMapEntry>,
  bits: usize,
}

impl PageMapEntry {
  #[inline]
  pub(crate) fn size(&self) -> usize {
    self.bits & !PAGE_SIZE_MASK
  }

  /// Address of the small run owning this page, carrying `chunk`'s provenance.
  #[inline]
  pub(crate) fn run<T>(&self, chunk: *mut ArenaChunk) -> *mut T {
    chunk.cast::<u8>().with_addr(self.size()).cast()
  }

  #[inline]
  pub(crate) fn flags(&self) -> PageFlags {
    PageFlags::from_bits_truncate(self.bits)
  }

  #[inline]
  pub(crate) fn state(&self) -> PageState {
    match (self.bits & STATE_MASK) >> STATE_SHIFT {
      0 => PageState::Clean,
      1 => PageState::Dirty,
      2 => PageState::Madvised,
      3 => PageState::Decommitted,
      _ => PageState::Fresh,
    }
  }

  #[inline]
  pub(crate) fn is_allocated(&self) -> bool {
    self.flags().contains(PageFlags::ALLOCATED)
  }

  #[inline]
  pub(crate) fn is_large(&self) -> bool {
    self.flags().contains(PageFlags::LARGE)
  }

  #[inline]
  pub(crate) fn is_busy(&self) -> bool {
    self.flags().contains(PageFlags::BUSY)
  }

  /// Neither allocated nor claimed by a purge.
  #[inline]
  pub(crate) fn is_available(&self) -> bool {
    !self.flags().intersects(PageFlags::ALLOCATED | PageFlags::BUSY)
  }

  #[inline]
  pub(crate) fn set(&mut self, high: usize, flags: PageFlags, state: PageState) {
    debug_assert!(high & PAGE_SIZE_MASK == 0);
    self.bits = high | flags.bits() | ((state as usize) << STATE_SHIFT);
  }

  /// Replaces the high bits, keeping flags and state.
  #[inline]
  pub(crate) fn set_size(&mut self, size: usize) {
    debug_assert!(size & PAGE_SIZE_MASK == 0);
    self.bits = size | (self.bits & PAGE_SIZE_MASK);
  }

  #[inline]
  pub(crate) fn set_state(&mut self, state: PageState) {
    self.bits = (self.bits & !STATE_MASK) | ((state as usize) << STATE_SHIFT);
  }

  #[inline]
  pub(crate) fn insert_flags(&mut self, flags: PageFlags) {
    self.bits |= flags.bits();
  }

  #[inline]
  pub(crate) fn remove_flags(&mut self, flags: PageFlags) {
    self.bits &= !flags.bits();
  }
}

/// Free runs ordered by (size, address), for lowest best fit.
pub(crate) struct RunsAvail;

impl RbAdapter for RunsAvail {
  type Node = PageMapEntry;

  fn link(node: *mut PageMapEntry) -> *mut RbLink<PageMapEntry> {
    unsafe { &raw mut (*node).link }
  }

  fn compare(a: *mut PageMapEntry, b: *mut PageMapEntry) -> Ordering {
    let (sa, sb) = unsafe { ((*a).size(), (*b).size()) };
    sa.cmp(&sb).then((a as usize).cmp(&(b as usize)))
  }
}

// =============================================================================
// Chunk header
// =============================================================================

#[repr(C)]
pub(crate) struct ArenaChunk {
  pub(crate) arena: *mut Arena,
  dirty_link: RbLink<ArenaChunk>,
  madvised_link: ListLink<ArenaChunk>,
  owned_link: ListLink<ArenaChunk>,
  /// Dirty pages in this chunk.
  pub(crate) ndirty: usize,
  /// A purge is working on this chunk without the arena lock.
  pub(crate) is_purging: bool,
  /// Removal was requested while purging; the purge finishes it.
  pub(crate) dying: bool,
  pub(crate) map: [PageMapEntry; CHUNK_NUM_PAGES],
}

/// Header pages, including the leading guard page.
pub(crate) const CHUNK_HEADER_NUM_PAGES: usize =
  1 + (page_ceiling(size_of::<ArenaChunk>()) >> PAGE_SIZE_2POW);

/// Index of the trailing guard page.
pub(crate) const CHUNK_GUARD_PAGE: usize = CHUNK_NUM_PAGES - 1;

/// One chunk, minus the header and the trailing guard page.
pub const MAX_LARGE_CLASS: usize = CHUNK_SIZE - PAGE_SIZE - (CHUNK_HEADER_NUM_PAGES << PAGE_SIZE_2POW);

/// Data pages in a chunk.
pub(crate) const CHUNK_DATA_PAGES: usize = CHUNK_NUM_PAGES - CHUNK_HEADER_NUM_PAGES - 1;

const _: () = assert!(CHUNK_HEADER_NUM_PAGES < CHUNK_NUM_PAGES / 2);
const _: () = assert!(CHUNK_DATA_PAGES << PAGE_SIZE_2POW == MAX_LARGE_CLASS);

impl ArenaChunk {
  /// Chunk containing `ptr`, keeping `ptr`'s provenance.
  #[inline]
  pub(crate) fn for_ptr<T>(ptr: *const T) -> *mut ArenaChunk {
    ptr
      .cast_mut()
      .cast::<u8>()
      .map_addr(|a| a & !(CHUNK_SIZE - 1))
      .cast()
  }

  #[inline]
  pub(crate) unsafe fn entry(chunk: *mut ArenaChunk, page: usize) -> *mut PageMapEntry {
    unsafe { &raw mut (*chunk).map[page] }
  }

  /// Page index of a map entry of this chunk.
  #[inline]
  pub(crate) unsafe fn page_of(chunk: *mut ArenaChunk, entry: *const PageMapEntry) -> usize {
    let base = unsafe { &raw const (*chunk).map } as usize;
    (entry as usize - base) / size_of::<PageMapEntry>()
  }

  #[inline]
  pub(crate) unsafe fn page_addr(chunk: *mut ArenaChunk, page: usize) -> *mut u8 {
    unsafe { chunk.cast::<u8>().add(page << PAGE_SIZE_2POW) }
  }

  /// Page index of an address inside this chunk.
  #[inline]
  pub(crate) fn page_index(chunk: *mut ArenaChunk, ptr: *const u8) -> usize {
    (ptr as usize - chunk as usize) >> PAGE_SIZE_2POW
  }

  /// True when the chunk holds a single free run spanning every data page.
  pub(crate) unsafe fn is_empty(chunk: *mut ArenaChunk) -> bool {
    let first = unsafe { &*Self::entry(chunk, CHUNK_HEADER_NUM_PAGES) };
    !first.is_allocated() && first.size() == MAX_LARGE_CLASS
  }
}

/// Chunks with dirty pages, by address.
pub(crate) struct DirtyChunks;

impl RbAdapter for DirtyChunks {
  type Node = ArenaChunk;

  fn link(node: *mut ArenaChunk) -> *mut RbLink<ArenaChunk> {
    unsafe { &raw mut (*node).dirty_link }
  }

  fn compare(a: *mut ArenaChunk, b: *mut ArenaChunk) -> Ordering {
    (a as usize).cmp(&(b as usize))
  }
}

/// Chunks holding `MADV_FREE`d pages that a hard purge should visit.
pub(crate) struct MadvisedChunks;

impl ListAdapter for MadvisedChunks {
  type Node = ArenaChunk;

  fn link(node: *mut ArenaChunk) -> *mut ListLink<ArenaChunk> {
    unsafe { &raw mut (*node).madvised_link }
  }
}

/// Every chunk an arena owns, the spare included.
pub(crate) struct OwnedChunks;

impl ListAdapter for OwnedChunks {
  type Node = ArenaChunk;

  fn link(node: *mut ArenaChunk) -> *mut ListLink<ArenaChunk> {
    unsafe { &raw mut (*node).owned_link }
  }
}

impl ArenaChunk {
  /// Resets the links of a chunk header before first use.
  pub(crate) unsafe fn reset_links(chunk: *mut ArenaChunk) {
    unsafe {
      (&raw mut (*chunk).dirty_link).write(RbLink::new());
      (&raw mut (*chunk).madvised_link).write(ListLink::new());
      (&raw mut (*chunk).owned_link).write(ListLink::new());
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn entry() -> PageMapEntry {
    PageMapEntry {
      link: RbLink::new(),
      bits: 0,
    }
  }

  #[test]
  fn geometry() {
    assert_eq!(MAX_LARGE_CLASS % PAGE_SIZE, 0);
    assert!(MAX_LARGE_CLASS > CHUNK_SIZE / 2);
    assert_eq!(
      CHUNK_HEADER_NUM_PAGES + CHUNK_DATA_PAGES + 1,
      CHUNK_NUM_PAGES
    );
  }

  #[test]
  fn fields_do_not_overlap() {
    let mut e = entry();
    e.set(7 * PAGE_SIZE, PageFlags::ZEROED, PageState::Fresh);
    assert_eq!(e.size(), 7 * PAGE_SIZE);
    assert_eq!(e.state(), PageState::Fresh);
    assert!(e.flags().contains(PageFlags::ZEROED));
    assert!(!e.is_allocated());

    e.set_size(3 * PAGE_SIZE);
    assert_eq!(e.state(), PageState::Fresh);
    e.insert_flags(PageFlags::BUSY);
    assert!(!e.is_available());
    e.remove_flags(PageFlags::BUSY);
    assert!(e.is_available());

    e.set_state(PageState::Decommitted);
    assert_eq!(e.size(), 3 * PAGE_SIZE);
    assert_eq!(e.state(), PageState::Decommitted);
    assert!(e.flags().contains(PageFlags::ZEROED));
  }

  #[test]
  fn avail_order_is_size_then_address() {
    let mut a = entry();
    let mut b = entry();
    a.set(2 * PAGE_SIZE, PageFlags::empty(), PageState::Dirty);
    b.set(PAGE_SIZE, PageFlags::empty(), PageState::Dirty);
    assert_eq!(RunsAvail::compare(&mut a, &mut b), Ordering::Greater);
    b.set_size(2 * PAGE_SIZE);
    let expected = (&raw mut a as usize).cmp(&(&raw mut b as usize));
    assert_eq!(RunsAvail::compare(&mut a, &mut b), expected);
  }
}
