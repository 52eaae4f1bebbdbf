//! Address-keyed radix tree of live chunks.
//!
//! Lookups are lock-free. Inserts take a lock and allocate interior nodes from
//! the base allocator; nodes are never freed while the heap lives.

use core::{
  ptr::null_mut,
  sync::atomic::{AtomicPtr, Ordering},
};

use crate::{base::BaseAllocator, size_class::CHUNK_SIZE, sync::Mutex};

const KEY_BITS: usize = (usize::BITS - CHUNK_SIZE.trailing_zeros()) as usize;
const LEVEL_BITS: usize = 11;
const LEVELS: usize = KEY_BITS.div_ceil(LEVEL_BITS);
const FANOUT: usize = 1 << LEVEL_BITS;

const _: () = assert!(LEVELS * LEVEL_BITS >= KEY_BITS);
const _: () = assert!(LEVELS >= 2);

type Node = [AtomicPtr<u8>; FANOUT];

pub(crate) struct AddressRadixTree {
  root: *mut Node,
  lock: Mutex<()>,
}

unsafe impl Send for AddressRadixTree {}
unsafe impl Sync for AddressRadixTree {}

#[inline]
fn subkey(key: usize, level: usize) -> usize {
  let shift = (LEVELS - 1 - level) * LEVEL_BITS;
  (key >> shift) & (FANOUT - 1)
}

impl AddressRadixTree {
  pub(crate) fn new(base: &BaseAllocator) -> Option<Self> {
    let root = base.alloc_zeroed(size_of::<Node>()).cast::<Node>();
    (!root.is_null()).then_some(Self {
      root,
      lock: Mutex::new(()),
    })
  }

  /// Value registered for the chunk at `addr`, or null.
  pub(crate) fn get(&self, addr: *const u8) -> *mut u8 {
    let key = addr as usize >> CHUNK_SIZE.trailing_zeros();
    let mut node = self.root;
    for level in 0..LEVELS - 1 {
      let child = unsafe { (*node)[subkey(key, level)].load(Ordering::Acquire) };
      if child.is_null() {
        return null_mut();
      }
      node = child.cast();
    }
    unsafe { (*node)[subkey(key, LEVELS - 1)].load(Ordering::Acquire) }
  }

  /// Registers `value` for the chunk at `addr`. Fails only when an interior
  /// node cannot be allocated.
  pub(crate) fn set(&self, addr: *const u8, value: *mut u8, base: &BaseAllocator) -> bool {
    let key = addr as usize >> CHUNK_SIZE.trailing_zeros();
    let _guard = self.lock.lock();
    let mut node = self.root;
    for level in 0..LEVELS - 1 {
      let slot = unsafe { &(*node)[subkey(key, level)] };
      let mut child = slot.load(Ordering::Acquire);
      if child.is_null() {
        child = base.alloc_zeroed(size_of::<Node>());
        if child.is_null() {
          return false;
        }
        slot.store(child, Ordering::Release);
      }
      node = child.cast();
    }
    unsafe { (*node)[subkey(key, LEVELS - 1)].store(value, Ordering::Release) };
    true
  }

  pub(crate) fn unset(&self, addr: *const u8, base: &BaseAllocator) {
    // The path exists since the chunk was registered, so this cannot fail.
    let ok = self.set(addr, null_mut(), base);
    debug_assert!(ok);
  }

  pub(crate) unsafe fn prefork(&self) {
    unsafe { self.lock.force_lock() };
  }

  pub(crate) unsafe fn postfork_parent(&self) {
    unsafe { self.lock.force_unlock() };
  }

  pub(crate) unsafe fn postfork_child(&self) {
    unsafe { self.lock.reinit() };
  }
}
