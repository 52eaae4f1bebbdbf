//! Returning dirty pages to the kernel.
//!
//! A purge claims one dirty chunk, then alternates between marking a span of
//! dirty pages busy under the arena lock and releasing it with the lock
//! dropped. Allocation and free keep running on the rest of the arena.

use core::ptr::null_mut;

use super::{Arena, ArenaState, entry};
use crate::{
  chunk::{ArenaChunk, CHUNK_GUARD_PAGE, CHUNK_HEADER_NUM_PAGES, PageFlags, PageState},
  extent::ChunkType,
  heap::Heap,
  size_class::{CHUNK_SIZE, PAGE_SIZE_2POW},
};
#[cfg(not(feature = "decommit"))]
use crate::platform::{os_commit, os_decommit, os_madvise_free};
#[cfg(feature = "decommit")]
use crate::platform::os_decommit;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum PurgeCondition {
  /// Stop once dirty pages are back under the hysteresis threshold.
  IfThreshold,
  /// Purge every dirty page.
  Unconditional,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum PurgeResult {
  /// Nothing left to do under the condition.
  Done,
  /// One chunk was purged and more work remains.
  Continue,
  /// Every dirty chunk is being purged by another thread.
  Busy,
  /// The arena was disposed during the purge and must now be destroyed.
  Dying,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum PurgeAction {
  None,
  PurgeNow,
  Queue,
}

impl ArenaState {
  /// Decides what a thread that just freed memory should do about purging.
  /// Queuing marks the purge pending so the arena is queued once.
  pub(crate) fn should_start_purge(&mut self) -> PurgeAction {
    if self.num_dirty <= self.max_dirty {
      return PurgeAction::None;
    }
    if !self.is_deferred_purge_enabled {
      return PurgeAction::PurgeNow;
    }
    if self.is_purge_pending {
      return PurgeAction::None;
    }
    self.is_purge_pending = true;
    PurgeAction::Queue
  }

  fn should_continue_purge(&self, heap: &Heap, cond: PurgeCondition) -> bool {
    let threshold = match cond {
      PurgeCondition::Unconditional => 0,
      PurgeCondition::IfThreshold => self
        .max_dirty
        .checked_shr(heap.options.purge_hysteresis_shift)
        .unwrap_or(0),
    };
    self.num_dirty > threshold
  }

  #[cfg(test)]
  pub(crate) fn is_purge_pending(&self) -> bool {
    self.is_purge_pending
  }

  /// Settles who destroys a disposed arena. `dequeued` tells whether the
  /// caller took the arena off the purge queue. Returns true when the caller
  /// must destroy it; otherwise the purge in flight will.
  pub(crate) fn claim_disposal(&mut self, dequeued: bool) -> bool {
    if !self.is_purge_pending {
      return true;
    }
    if !dequeued {
      self.must_delete_after_purge = true;
    }
    dequeued
  }
}

unsafe fn release_chunk(heap: &Heap, chunk: *mut ArenaChunk) {
  if !chunk.is_null() {
    unsafe {
      heap
        .chunks
        .dealloc(chunk.cast(), CHUNK_SIZE, ChunkType::Arena, &heap.base);
    }
  }
}

/// The span of a chunk one purge step works on.
struct PurgeInfo {
  chunk: *mut ArenaChunk,
  free_run_ind: usize,
  free_run_len: usize,
  dirty_ind: usize,
  dirty_npages: usize,
}

impl PurgeInfo {
  fn new(chunk: *mut ArenaChunk) -> Self {
    Self {
      chunk,
      free_run_ind: 0,
      free_run_len: 0,
      dirty_ind: 0,
      dirty_npages: 0,
    }
  }

  fn free_run_last_ind(&self) -> usize {
    self.free_run_ind + self.free_run_len - 1
  }

  /// Finds the first span of dirty pages and claims the free run holding it.
  /// The pages are uncounted as dirty right away.
  unsafe fn find_dirty_pages(&mut self, st: &mut ArenaState) -> bool {
    let chunk = self.chunk;
    self.dirty_ind = 0;
    unsafe {
      if (*chunk).dying || (*chunk).ndirty == 0 {
        return false;
      }

      let mut previous_allocated = true;
      for i in CHUNK_HEADER_NUM_PAGES..CHUNK_GUARD_PAGE {
        let e = entry(chunk, i);
        debug_assert!(!e.is_busy());
        // The first page of a free run follows an allocated one and carries
        // the run size. The last page of the run carries it too.
        if !e.is_allocated() && e.size() != 0 && previous_allocated {
          self.free_run_ind = i;
          self.free_run_len = e.size() >> PAGE_SIZE_2POW;
        }
        if e.state() == PageState::Dirty {
          self.dirty_ind = i;
          break;
        }
        previous_allocated = e.is_allocated();
      }
      if self.dirty_ind == 0 {
        return false;
      }

      self.dirty_npages = 0;
      while self.dirty_ind + self.dirty_npages < CHUNK_GUARD_PAGE
        && entry(chunk, self.dirty_ind + self.dirty_npages).state() == PageState::Dirty
      {
        entry(chunk, self.dirty_ind + self.dirty_npages).set_state(PageState::Clean);
        self.dirty_npages += 1;
      }
      debug_assert!(self.dirty_ind + self.dirty_npages <= self.free_run_ind + self.free_run_len);
      (*chunk).ndirty -= self.dirty_npages;
      st.num_dirty -= self.dirty_npages;

      entry(chunk, self.free_run_ind).insert_flags(PageFlags::BUSY);
      entry(chunk, self.free_run_last_ind()).insert_flags(PageFlags::BUSY);
      if st.spare != chunk {
        st.runs_avail.remove(ArenaChunk::entry(chunk, self.free_run_ind));
      }
    }
    true
  }

  /// Releases the claimed pages. Runs without the arena lock. Returns false
  /// when the kernel kept them.
  unsafe fn release_pages(&self) -> bool {
    unsafe {
      let addr = ArenaChunk::page_addr(self.chunk, self.dirty_ind);
      let size = self.dirty_npages << PAGE_SIZE_2POW;
      #[cfg(feature = "decommit")]
      let released = {
        os_decommit(addr, size);
        true
      };
      #[cfg(not(feature = "decommit"))]
      let released = os_madvise_free(addr, size);
      released
    }
  }

  /// Records the released pages and gives the free run back. Pages the kernel
  /// kept go back to dirty. Returns whether the chunk still has dirty pages,
  /// and a chunk to release.
  unsafe fn update_pages_and_counts(&mut self, st: &mut ArenaState, released: bool) -> (bool, *mut ArenaChunk) {
    let chunk = self.chunk;
    #[cfg(feature = "decommit")]
    let released_state = PageState::Decommitted;
    #[cfg(not(feature = "decommit"))]
    let released_state = PageState::Madvised;

    unsafe {
      for i in self.dirty_ind..self.dirty_ind + self.dirty_npages {
        debug_assert_eq!(entry(chunk, i).state(), PageState::Clean);
        if released {
          entry(chunk, i).set_state(released_state);
          entry(chunk, i).remove_flags(PageFlags::ZEROED);
        } else {
          entry(chunk, i).set_state(PageState::Dirty);
        }
      }
      entry(chunk, self.free_run_ind).remove_flags(PageFlags::BUSY);
      entry(chunk, self.free_run_last_ind()).remove_flags(PageFlags::BUSY);
      if released {
        #[cfg(not(feature = "decommit"))]
        {
          st.num_madvised += self.dirty_npages;
        }
        st.committed -= self.dirty_npages;
      } else {
        (*chunk).ndirty += self.dirty_npages;
        st.num_dirty += self.dirty_npages;
      }

      if (*chunk).dying {
        // Dying chunks hold a single free run already.
        return (false, chunk);
      }

      let was_empty = ArenaChunk::is_empty(chunk);
      self.free_run_ind = st.try_coalesce(
        chunk,
        self.free_run_ind,
        self.free_run_len,
        self.free_run_len << PAGE_SIZE_2POW,
      );
      let mut release = null_mut();
      if !was_empty && ArenaChunk::is_empty(chunk) {
        release = st.demote_chunk_to_spare(chunk);
      }
      if st.spare != chunk {
        st.runs_avail.insert(ArenaChunk::entry(chunk, self.free_run_ind));
      }
      ((*chunk).ndirty != 0, release)
    }
  }

  /// Hands the chunk back to the arena. A dying chunk is removed, and
  /// returned for release.
  unsafe fn finish_purging_in_chunk(&self, st: &mut ArenaState, add_madvised: bool) -> *mut ArenaChunk {
    let chunk = self.chunk;
    unsafe {
      debug_assert!((*chunk).is_purging);
      (*chunk).is_purging = false;
      if (*chunk).dying {
        // The chunk left `chunks_dirty` when its purge started.
        st.num_dirty -= (*chunk).ndirty;
        st.committed -= (*chunk).ndirty;
        (*chunk).ndirty = 0;
        let removed = st.remove_chunk(chunk);
        debug_assert!(removed);
        return chunk;
      }
      if (*chunk).ndirty != 0 {
        st.chunks_dirty.insert(chunk);
      }
      if cfg!(not(feature = "decommit")) && add_madvised {
        if st.chunks_madvised.contains(chunk) {
          st.chunks_madvised.remove(chunk);
        }
        st.chunks_madvised.push_front(chunk);
      }
    }
    null_mut()
  }
}

impl Arena {
  /// Purges dirty pages from one chunk.
  pub(crate) unsafe fn purge(&self, heap: &Heap, cond: PurgeCondition) -> PurgeResult {
    let chunk = {
      let mut st = self.state.lock();
      if st.must_delete_after_purge {
        st.is_purge_pending = false;
        return PurgeResult::Dying;
      }
      if !st.should_continue_purge(heap, cond) {
        st.is_purge_pending = false;
        return PurgeResult::Done;
      }
      let chunk = st.chunks_dirty.last();
      if chunk.is_null() {
        // The remaining dirty pages sit in chunks other threads are purging.
        st.is_purge_pending = false;
        return PurgeResult::Busy;
      }
      unsafe {
        st.chunks_dirty.remove(chunk);
        (*chunk).is_purging = true;
      }
      chunk
    };

    let mut info = PurgeInfo::new(chunk);
    let mut purged_once = false;
    let mut continue_chunk = true;
    let mut continue_arena = true;
    while continue_chunk && continue_arena {
      let (found, dying) = {
        let mut st = self.state.lock();
        if st.must_delete_after_purge {
          // A chunk that died while unlocked is no longer the spare, so
          // disposal would not find it.
          let dying = unsafe { info.finish_purging_in_chunk(&mut st, purged_once) };
          st.is_purge_pending = false;
          drop(st);
          unsafe { release_chunk(heap, dying) };
          return PurgeResult::Dying;
        }
        let found = unsafe { info.find_dirty_pages(&mut st) };
        continue_arena = st.should_continue_purge(heap, cond);
        let mut dying = null_mut();
        if !found {
          // Allocations took the dirty pages, or the chunk is being removed.
          dying = unsafe { info.finish_purging_in_chunk(&mut st, purged_once) };
          if !continue_arena {
            st.is_purge_pending = false;
          }
        }
        (found, dying)
      };
      if !found {
        unsafe { release_chunk(heap, dying) };
        return if continue_arena {
          PurgeResult::Continue
        } else {
          PurgeResult::Done
        };
      }

      let released = unsafe { info.release_pages() };

      let (release, is_dying) = {
        let mut st = self.state.lock();
        // The purge must still restore the pages of a dying arena.
        let is_dying = st.must_delete_after_purge;
        let (more, release) = unsafe { info.update_pages_and_counts(&mut st, released) };
        // Retrying pages the kernel kept would spin, so the purge stops here.
        continue_chunk = more && released;
        continue_arena = released && st.should_continue_purge(heap, cond);
        if !continue_chunk || !continue_arena || is_dying {
          let removed = unsafe { info.finish_purging_in_chunk(&mut st, purged_once || released) };
          debug_assert!(removed.is_null() || removed == release);
          st.is_purge_pending = false;
        }
        (release, is_dying)
      };
      if !released {
        tracing::warn!(pages = info.dirty_npages, "madvise refused, pages stay dirty");
      }
      // Either the old spare or this chunk, if it died.
      unsafe { release_chunk(heap, release) };
      if is_dying {
        return PurgeResult::Dying;
      }
      purged_once = true;
    }

    if continue_arena {
      PurgeResult::Continue
    } else {
      PurgeResult::Done
    }
  }

  /// Acts on the decision of [`ArenaState::should_start_purge`], with the
  /// arena lock released.
  pub(crate) unsafe fn may_do_or_queue_purge(&self, heap: &Heap, action: PurgeAction) {
    match action {
      PurgeAction::None => {}
      PurgeAction::Queue => heap.arenas.add_to_outstanding_purges(self.as_ptr()),
      PurgeAction::PurgeNow => loop {
        match unsafe { self.purge(heap, PurgeCondition::IfThreshold) } {
          PurgeResult::Continue => {}
          // The caller still uses the arena, so it cannot have been disposed.
          result => {
            assert!(result != PurgeResult::Dying);
            break;
          }
        }
      },
    }
  }

  /// Forces `MADV_FREE`d pages out of memory by decommitting and recommitting
  /// them. They come back as fresh pages.
  #[cfg(not(feature = "decommit"))]
  pub(crate) fn hard_purge(&self) {
    let mut guard = self.state.lock();
    let st = &mut *guard;
    let mut failed = 0;
    loop {
      let chunk = unsafe { st.chunks_madvised.pop_front() };
      if chunk.is_null() {
        break;
      }
      let mut i = CHUNK_HEADER_NUM_PAGES;
      while i < CHUNK_GUARD_PAGE {
        let mut npages = 0;
        unsafe {
          while i + npages < CHUNK_GUARD_PAGE && entry(chunk, i + npages).state() == PageState::Madvised {
            entry(chunk, i + npages).set_state(PageState::Fresh);
            npages += 1;
          }
          if npages > 0 {
            let addr = ArenaChunk::page_addr(chunk, i);
            let size = npages << PAGE_SIZE_2POW;
            os_decommit(addr, size);
            if !os_commit(addr, size) {
              failed += npages;
            }
          }
        }
        st.num_madvised -= npages;
        st.num_fresh += npages;
        i += npages.max(1);
      }
    }
    drop(guard);
    if failed != 0 {
      tracing::warn!(pages = failed, "recommit after hard purge failed");
    }
  }

  /// Nothing is ever left `MADV_FREE`d when purging decommits.
  #[cfg(feature = "decommit")]
  pub(crate) fn hard_purge(&self) {}
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    arena::{ArenaParams, arena_dalloc},
    options::{Options, Poison},
    size_class::{CHUNK_SIZE_MASK, PAGE_SIZE},
  };

  fn heap() -> Heap {
    let mut opts = Options::default();
    opts.poison = Poison::None;
    Heap::new(opts).unwrap()
  }

  fn arena_with_budget(heap: &Heap, max_dirty: usize) -> &Arena {
    let id = heap.create_arena(&ArenaParams {
      max_dirty,
      ..ArenaParams::default()
    });
    unsafe { &*heap.arena_by_id(id).unwrap() }
  }

  unsafe fn free(heap: &Heap, p: *mut u8) {
    unsafe { arena_dalloc(heap, p, p as usize & CHUNK_SIZE_MASK, None) };
  }

  #[test]
  fn threshold_triggers_immediate_purge() {
    let heap = heap();
    let arena = arena_with_budget(&heap, 4);
    unsafe {
      let keep = arena.malloc(&heap, PAGE_SIZE, false);
      let a = arena.malloc(&heap, 3 * PAGE_SIZE, false);
      let b = arena.malloc(&heap, 3 * PAGE_SIZE, false);
      let _fence = arena.malloc(&heap, PAGE_SIZE, false);
      free(&heap, a);
      assert_eq!(arena.state.lock().num_dirty, 3);
      // Six dirty pages exceed the budget; purging stops at or below two.
      free(&heap, b);
      let st = arena.state.lock();
      assert!(st.num_dirty <= 2);
      assert_eq!(st.num_madvised + st.num_dirty, 6);
      drop(st);
      free(&heap, keep);
    }
  }

  #[test]
  fn small_runs_purge_down_to_hysteresis() {
    let heap = heap();
    heap.enable_deferred_purge(true);
    let arena = arena_with_budget(&heap, 256);
    unsafe {
      let ptrs: Vec<_> = (0..2000).map(|_| arena.malloc(&heap, 1024, false)).collect();
      // The last region of each chunk stays live so no chunk becomes the spare.
      let mut fences: Vec<*mut u8> = Vec::new();
      for &p in ptrs.iter().rev() {
        let chunk = ArenaChunk::for_ptr(p);
        if fences.iter().any(|&f| ArenaChunk::for_ptr(f) == chunk) {
          free(&heap, p);
        } else {
          fences.push(p);
        }
      }

      let mut st = arena.state.lock();
      let dirty = st.num_dirty;
      assert!(dirty > 256);
      assert_eq!(st.num_madvised, 0);
      st.is_deferred_purge_enabled = false;
      st.is_purge_pending = false;
      let action = st.should_start_purge();
      drop(st);
      assert_eq!(action, PurgeAction::PurgeNow);

      arena.may_do_or_queue_purge(&heap, action);
      let st = arena.state.lock();
      assert!(st.num_dirty <= 128);
      if cfg!(not(feature = "decommit")) {
        assert_eq!(st.num_madvised + st.num_dirty, dirty);
      }
    }
  }

  #[test]
  fn refused_release_keeps_pages_dirty() {
    let heap = heap();
    let arena = arena_with_budget(&heap, 1024);
    unsafe {
      let a = arena.malloc(&heap, 4 * PAGE_SIZE, false);
      let _b = arena.malloc(&heap, PAGE_SIZE, false);
      free(&heap, a);
      let chunk = ArenaChunk::for_ptr(a);
      let mut guard = arena.state.lock();
      let st = &mut *guard;
      let committed = st.committed;
      st.chunks_dirty.remove(chunk);
      (*chunk).is_purging = true;

      let mut info = PurgeInfo::new(chunk);
      assert!(info.find_dirty_pages(st));
      assert_eq!(st.num_dirty, 0);
      let (more, release) = info.update_pages_and_counts(st, false);
      assert!(more);
      assert!(release.is_null());
      assert!(info.finish_purging_in_chunk(st, false).is_null());

      assert_eq!(st.num_dirty, 4);
      assert_eq!((*chunk).ndirty, 4);
      assert_eq!(st.num_madvised, 0);
      assert_eq!(st.committed, committed);
      assert!(st.chunks_dirty.contains(chunk));
      let first = ArenaChunk::page_index(chunk, a);
      assert!((first..first + 4).all(|i| entry(chunk, i).state() == PageState::Dirty));
      assert!(st.runs_avail.contains(ArenaChunk::entry(chunk, first)));
    }
  }

  #[test]
  fn spare_dying_mid_purge_is_released() {
    let heap = heap();
    let arena = arena_with_budget(&heap, 1024);
    unsafe {
      let a = arena.malloc(&heap, 2 * PAGE_SIZE, false);
      let m = arena.malloc(&heap, 2 * PAGE_SIZE, false);
      let b = arena.malloc(&heap, 2 * PAGE_SIZE, false);
      let fence = arena.malloc(&heap, PAGE_SIZE, false);
      free(&heap, m);
      while arena.purge(&heap, PurgeCondition::Unconditional) == PurgeResult::Continue {}
      // Two dirty spans split by the madvised pages of `m`.
      free(&heap, a);
      free(&heap, b);
      free(&heap, fence);

      let chunk = ArenaChunk::for_ptr(a);
      let release = {
        let mut guard = arena.state.lock();
        let st = &mut *guard;
        assert_eq!(st.spare, chunk);
        assert_eq!(st.num_dirty, 5);
        let mapped = st.mapped;
        st.chunks_dirty.remove(chunk);
        (*chunk).is_purging = true;

        let mut info = PurgeInfo::new(chunk);
        assert!(info.find_dirty_pages(st));
        assert_eq!(info.dirty_npages, 2);
        // Disposal drops the spare while its purge is in flight.
        st.spare = null_mut();
        assert!(!st.remove_chunk(chunk));

        let (more, release) = info.update_pages_and_counts(st, true);
        assert!(!more);
        assert_eq!(release, chunk);
        assert_eq!(info.finish_purging_in_chunk(st, true), chunk);
        assert_eq!(st.num_dirty, 0);
        assert_eq!(st.num_madvised, 0);
        assert_eq!(st.mapped, mapped - CHUNK_SIZE);
        assert!(st.chunks_dirty.is_empty());
        assert!(st.chunks_madvised.is_empty());
        release
      };
      release_chunk(&heap, release);
    }
  }

  #[test]
  fn unconditional_purge_clears_every_dirty_page() {
    let heap = heap();
    let arena = arena_with_budget(&heap, 1024);
    unsafe {
      let ptrs: Vec<_> = (0..8).map(|_| arena.malloc(&heap, 2 * PAGE_SIZE, false)).collect();
      for &p in ptrs.iter().step_by(2) {
        free(&heap, p);
      }
      assert_eq!(arena.state.lock().num_dirty, 8);
      while arena.purge(&heap, PurgeCondition::Unconditional) == PurgeResult::Continue {}
      let st = arena.state.lock();
      assert_eq!(st.num_dirty, 0);
      assert_eq!(st.num_madvised, 8);
      assert!(st.chunks_dirty.is_empty());
    }
  }

  #[test]
  fn madvised_pages_are_reused() {
    let heap = heap();
    let arena = arena_with_budget(&heap, 1024);
    unsafe {
      let a = arena.malloc(&heap, 4 * PAGE_SIZE, false);
      let _b = arena.malloc(&heap, PAGE_SIZE, false);
      free(&heap, a);
      while arena.purge(&heap, PurgeCondition::Unconditional) == PurgeResult::Continue {}
      let committed = arena.state.lock().committed;
      let c = arena.malloc(&heap, 4 * PAGE_SIZE, true);
      assert_eq!(c, a);
      assert!((0..4 * PAGE_SIZE).all(|i| *c.add(i) == 0));
      let st = arena.state.lock();
      assert_eq!(st.num_madvised, 0);
      assert_eq!(st.committed, committed + 4);
    }
  }

  #[test]
  fn hard_purge_turns_madvised_into_fresh() {
    let heap = heap();
    let arena = arena_with_budget(&heap, 1024);
    unsafe {
      let a = arena.malloc(&heap, 4 * PAGE_SIZE, false);
      let _b = arena.malloc(&heap, PAGE_SIZE, false);
      free(&heap, a);
      while arena.purge(&heap, PurgeCondition::Unconditional) == PurgeResult::Continue {}
      let fresh = arena.state.lock().num_fresh;
      arena.hard_purge();
      let st = arena.state.lock();
      if cfg!(not(feature = "decommit")) {
        assert_eq!(st.num_madvised, 0);
        assert_eq!(st.num_fresh, fresh + 4);
        assert!(st.chunks_madvised.is_empty());
      }
    }
  }

  #[test]
  fn deferred_purge_queues_once() {
    let heap = heap();
    heap.enable_deferred_purge(true);
    let arena = arena_with_budget(&heap, 2);
    unsafe {
      let a = arena.malloc(&heap, 3 * PAGE_SIZE, false);
      let b = arena.malloc(&heap, 3 * PAGE_SIZE, false);
      let _fence = arena.malloc(&heap, PAGE_SIZE, false);
      free(&heap, a);
      assert!(arena.state.lock().is_purge_pending());
      free(&heap, b);
      assert_eq!(arena.state.lock().num_dirty, 6);
      assert_eq!(heap.arenas.outstanding_purges(), 1);
    }
  }
}
