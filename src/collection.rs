//! The set of live arenas, their ids, and the deferred purge queue.
//!
//! Lock order: the collection lock, then an arena lock. The purge queue lock
//! may be taken under the collection lock but never under an arena lock.

use core::{
  ptr::null_mut,
  sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU32, Ordering},
};

use crate::{
  arena::{Arena, ArenaParams, ArenasById, PurgeCondition, PurgeQueue, PurgeResult},
  heap::Heap,
  list::List,
  platform::{malloc_message, thread_id_u32, timestamp_ns},
  prng::random_u64,
  rb::RbTree,
  sync::Mutex,
};

/// Low bit of a private arena id, set for main-thread-only arenas.
pub(crate) const MAIN_THREAD_ARENA_BIT: u64 = 1;

/// Outcome of one [`ArenaCollection::may_purge_steps`] call.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MayPurgeResult {
  /// No arena has an outstanding purge request.
  Done,
  /// Some arena may need purging now; call again.
  NeedsMore,
  /// Every queued arena saw a significant reuse within the grace period.
  WantsLater,
}

struct Trees {
  public: RbTree<ArenasById>,
  private: RbTree<ArenasById>,
  main_thread: RbTree<ArenasById>,
  last_public_id: u64,
  /// Operations performed by arenas since disposed.
  ops_disposed: u64,
}

unsafe impl Send for Trees {}

impl Trees {
  fn iter(&self) -> impl Iterator<Item = *mut Arena> + '_ {
    self
      .public
      .iter()
      .chain(self.private.iter())
      .chain(self.main_thread.iter())
  }

  fn tree_for(&mut self, arena: &Arena) -> &mut RbTree<ArenasById> {
    if !arena.is_private {
      &mut self.public
    } else if arena.is_main_thread_only {
      &mut self.main_thread
    } else {
      &mut self.private
    }
  }
}

struct PurgeList(List<PurgeQueue>);

unsafe impl Send for PurgeList {}

fn find(tree: &RbTree<ArenasById>, id: u64) -> *mut Arena {
  tree.search_by(|n| unsafe { id.cmp(&(*n).id()) })
}

pub(crate) struct ArenaCollection {
  trees: Mutex<Trees>,
  purges: Mutex<PurgeList>,
  default_arena: AtomicPtr<Arena>,
  is_deferred_purge_enabled: AtomicBool,
  default_max_dirty_page_modifier: AtomicI32,
  /// Thread id of the main thread, zero until set.
  main_thread: AtomicU32,
}

impl ArenaCollection {
  pub(crate) const fn new() -> Self {
    Self {
      trees: Mutex::new(Trees {
        public: RbTree::new(),
        private: RbTree::new(),
        main_thread: RbTree::new(),
        last_public_id: 0,
        ops_disposed: 0,
      }),
      purges: Mutex::new(PurgeList(List::new())),
      default_arena: AtomicPtr::new(null_mut()),
      is_deferred_purge_enabled: AtomicBool::new(false),
      default_max_dirty_page_modifier: AtomicI32::new(0),
      main_thread: AtomicU32::new(0),
    }
  }

  /// Creates the default arena. False when out of memory.
  pub(crate) fn init(&self, heap: &Heap) -> bool {
    let params = ArenaParams {
      max_dirty: heap.options.dirty_max,
      ..ArenaParams::default()
    };
    let arena = Arena::create(heap, Some(&params), false);
    if arena.is_null() {
      return false;
    }
    self.register(arena);
    self.default_arena.store(arena, Ordering::Release);
    true
  }

  #[inline]
  pub(crate) fn default_arena(&self) -> *mut Arena {
    self.default_arena.load(Ordering::Acquire)
  }

  /// Creates an arena and gives it an id. Falls back to the default arena
  /// when out of memory.
  pub(crate) fn create_arena(&self, heap: &Heap, params: Option<&ArenaParams>, is_private: bool) -> *mut Arena {
    if params.is_some_and(|p| p.main_thread_only) {
      assert!(is_private, "Only private arenas can be main-thread-only.");
      assert!(
        self.is_on_main_thread(),
        "Main-thread-only arenas must be created on the main thread."
      );
    }
    let arena = Arena::create(heap, params, is_private);
    if arena.is_null() {
      malloc_message(&[b"ferrojem: (malloc) Error initializing arena\n"]);
      return self.default_arena();
    }
    let arena = self.register(arena);
    let this = unsafe { &*arena };
    tracing::debug!(
      id = this.id(),
      is_private,
      main_thread_only = this.is_main_thread_only,
      "created arena"
    );
    arena
  }

  fn register(&self, arena: *mut Arena) -> *mut Arena {
    let this = unsafe { &*arena };
    let mut trees = self.trees.lock();
    if !this.is_private {
      this.set_id(trees.last_public_id);
      trees.last_public_id += 1;
      unsafe { trees.public.insert(arena) };
      return arena;
    }

    let main_thread_only = this.is_main_thread_only;
    let tree = trees.tree_for(this);
    // Retry until the id is unused.
    let id = loop {
      let id = make_rand_arena_id(main_thread_only);
      if find(tree, id).is_null() {
        break id;
      }
    };
    this.set_id(id);
    unsafe { tree.insert(arena) };
    arena
  }

  /// Looks up a live arena.
  pub(crate) fn get_by_id(&self, id: u64, is_private: bool) -> Option<*mut Arena> {
    let trees = self.trees.lock();
    let tree = match (is_private, id & MAIN_THREAD_ARENA_BIT != 0) {
      (false, _) => &trees.public,
      (true, true) => &trees.main_thread,
      (true, false) => &trees.private,
    };
    let arena = find(tree, id);
    (!arena.is_null()).then_some(arena)
  }

  /// Removes a private arena and destroys it, now or once the purge holding
  /// it finishes.
  ///
  /// # Panics
  ///
  /// When the arena is not in the collection or still holds allocations.
  pub(crate) unsafe fn dispose_arena(&self, heap: &Heap, arena: *mut Arena) {
    let dequeued = self.remove_from_outstanding_purges(arena);
    let this = unsafe { &*arena };
    {
      let mut trees = self.trees.lock();
      let tree = trees.tree_for(this);
      assert!(tree.contains(arena), "Arena not in tree");
      unsafe { tree.remove(arena) };
      trees.ops_disposed += this.operations();
    }
    let id = this.id();
    let delete_now = this.state.lock().claim_disposal(dequeued);
    if delete_now {
      unsafe { Arena::destroy(arena, heap) };
    }
    tracing::debug!(id, deferred = !delete_now, "disposed arena");
  }

  /// Operations of every arena, disposed ones included.
  pub(crate) fn operations(&self) -> u64 {
    let trees = self.trees.lock();
    trees.ops_disposed + trees.iter().map(|a| unsafe { (*a).operations() }).sum::<u64>()
  }

  /// Allocated bytes of every live arena. Takes no arena lock.
  pub(crate) fn allocated(&self) -> usize {
    let trees = self.trees.lock();
    trees.iter().map(|a| unsafe { (*a).allocated() }).sum()
  }

  /// Calls `f` on every arena this thread may touch, with the collection
  /// locked.
  pub(crate) fn for_each_accessible(&self, mut f: impl FnMut(&Arena)) {
    let trees = self.trees.lock();
    for arena in trees.iter() {
      let arena = unsafe { &*arena };
      if !arena.is_main_thread_only || self.is_on_main_thread_weak() {
        f(arena);
      }
    }
  }

  /// Calls `f` on every arena. Only for heap teardown.
  pub(crate) fn for_each_owned(&mut self, mut f: impl FnMut(*mut Arena)) {
    for arena in self.trees.get_mut().iter() {
      f(arena);
    }
  }

  // ===========================================================================
  // Dirty page limits
  // ===========================================================================

  pub(crate) fn default_max_dirty_page_modifier(&self) -> i32 {
    self.default_max_dirty_page_modifier.load(Ordering::Relaxed)
  }

  pub(crate) fn set_default_max_dirty_page_modifier(&self, modifier: i32) {
    let trees = self.trees.lock();
    self
      .default_max_dirty_page_modifier
      .store(modifier, Ordering::Relaxed);
    for arena in trees.iter() {
      let arena = unsafe { &*arena };
      if !arena.is_main_thread_only || self.is_on_main_thread_weak() {
        arena.update_max_dirty(modifier);
      }
    }
  }

  // ===========================================================================
  // Deferred purging
  // ===========================================================================

  pub(crate) fn is_deferred_purge_enabled(&self) -> bool {
    self.is_deferred_purge_enabled.load(Ordering::Relaxed)
  }

  /// Switches deferred purging for every arena. Returns the previous
  /// setting. Turning it either way purges arenas over their threshold.
  pub(crate) fn set_deferred_purge(&self, heap: &Heap, enable: bool) -> bool {
    debug_assert!(self.is_on_main_thread_weak());
    let old = {
      let trees = self.trees.lock();
      let old = self.is_deferred_purge_enabled.swap(enable, Ordering::Relaxed);
      for arena in trees.iter() {
        unsafe { (*arena).state.lock().is_deferred_purge_enabled = enable };
      }
      old
    };
    if old != enable {
      self.may_purge_all(heap, PurgeCondition::IfThreshold);
    }
    old
  }

  pub(crate) fn add_to_outstanding_purges(&self, arena: *mut Arena) {
    let mut purges = self.purges.lock();
    unsafe {
      if !purges.0.contains(arena) {
        purges.0.push_back(arena);
      }
    }
  }

  /// True if the arena was queued.
  pub(crate) fn remove_from_outstanding_purges(&self, arena: *mut Arena) -> bool {
    let mut purges = self.purges.lock();
    unsafe {
      if purges.0.contains(arena) {
        purges.0.remove(arena);
        return true;
      }
    }
    false
  }

  #[cfg(test)]
  pub(crate) fn outstanding_purges(&self) -> usize {
    self.purges.lock().0.iter().count()
  }

  /// Purges the first queued arena that saw no significant reuse in the last
  /// `reuse_grace_ms`, while `keep_going` agrees. With `peek_only`, reports
  /// whether there is work without doing it.
  pub(crate) fn may_purge_steps(
    &self,
    heap: &Heap,
    peek_only: bool,
    reuse_grace_ms: u32,
    mut keep_going: Option<&mut dyn FnMut() -> bool>,
  ) -> MayPurgeResult {
    debug_assert!(self.is_on_main_thread_weak());
    let grace_ns = u64::from(reuse_grace_ms) * 1_000_000;
    let expired = |arena: &Arena, now: u64| {
      now.saturating_sub(arena.last_significant_reuse_ns.load(Ordering::Relaxed)) >= grace_ns
    };

    let found = {
      let mut purges = self.purges.lock();
      if purges.0.is_empty() {
        return MayPurgeResult::Done;
      }
      let now = timestamp_ns();
      let Some(found) = purges.0.iter().find(|&a| expired(unsafe { &*a }, now)) else {
        return MayPurgeResult::WantsLater;
      };
      if peek_only {
        return MayPurgeResult::NeedsMore;
      }
      // Dequeue before purging so a pending arena is always either queued
      // or being purged.
      unsafe { purges.0.remove(found) };
      found
    };

    let arena = unsafe { &*found };
    let result = loop {
      let result = unsafe { arena.purge(heap, PurgeCondition::IfThreshold) };
      if result != PurgeResult::Continue
        || !expired(arena, timestamp_ns())
        || !keep_going.as_mut().is_some_and(|f| f())
      {
        break result;
      }
    };

    match result {
      PurgeResult::Continue => {
        let mut purges = self.purges.lock();
        unsafe {
          if !purges.0.contains(found) {
            purges.0.push_front(found);
          }
        }
      }
      PurgeResult::Dying => unsafe { Arena::destroy(found, heap) },
      PurgeResult::Done | PurgeResult::Busy => {}
    }
    MayPurgeResult::NeedsMore
  }

  /// Purges every accessible arena under `cond`, queued or not.
  pub(crate) fn may_purge_all(&self, heap: &Heap, cond: PurgeCondition) {
    self.for_each_accessible(|arena| {
      let ptr = (arena as *const Arena).cast_mut();
      self.remove_from_outstanding_purges(ptr);
      let result = loop {
        let result = unsafe { arena.purge(heap, cond) };
        if result != PurgeResult::Continue {
          break result;
        }
      };
      // Disposal takes arenas out of the collection before marking them.
      assert!(result != PurgeResult::Dying);
    });
  }

  // ===========================================================================
  // Main thread
  // ===========================================================================

  pub(crate) fn set_main_thread(&self) {
    let _trees = self.trees.lock();
    debug_assert_eq!(self.main_thread.load(Ordering::Relaxed), 0);
    self.main_thread.store(thread_id_u32(), Ordering::Relaxed);
  }

  pub(crate) fn is_on_main_thread(&self) -> bool {
    let main = self.main_thread.load(Ordering::Relaxed);
    main != 0 && main == thread_id_u32()
  }

  /// On the main thread, or no main thread was declared.
  pub(crate) fn is_on_main_thread_weak(&self) -> bool {
    let main = self.main_thread.load(Ordering::Relaxed);
    main == 0 || main == thread_id_u32()
  }

  // ===========================================================================
  // Fork
  // ===========================================================================

  /// Takes the collection lock, every arena lock, then the purge queue lock.
  /// Returns the forking thread's id.
  pub(crate) unsafe fn prefork(&self) -> u32 {
    unsafe {
      self.trees.force_lock();
      for arena in (*self.trees.data_ptr()).iter() {
        (*arena).state.force_lock();
      }
      self.purges.force_lock();
    }
    thread_id_u32()
  }

  pub(crate) unsafe fn postfork_parent(&self) {
    unsafe {
      self.purges.force_unlock();
      for arena in (*self.trees.data_ptr()).iter() {
        (*arena).state.force_unlock();
      }
      self.trees.force_unlock();
    }
  }

  /// Resets every lock in the child. Main-thread-only arenas stay usable only
  /// when the fork came from their thread.
  pub(crate) unsafe fn postfork_child(&self, forking_thread: u32) {
    // The child's surviving thread may not be the main thread.
    self.main_thread.store(0, Ordering::Relaxed);
    unsafe {
      self.purges.reinit();
      for arena in (*self.trees.data_ptr()).iter() {
        (*arena).state.reinit(forking_thread);
      }
      self.trees.reinit();
    }
  }
}

/// A random non-zero id whose low bit marks main-thread-only arenas.
fn make_rand_arena_id(main_thread_only: bool) -> u64 {
  loop {
    // Without OS entropy, fall back to the clock-seeded generator.
    let rand = random_u64().unwrap_or_else(|| crate::prng::Prng::from_entropy().next());
    let id = if main_thread_only {
      rand | MAIN_THREAD_ARENA_BIT
    } else {
      rand & !MAIN_THREAD_ARENA_BIT
    };
    if id != 0 {
      return id;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::options::Options;

  #[test]
  fn rand_ids_carry_the_main_thread_bit() {
    for _ in 0..32 {
      let id = make_rand_arena_id(true);
      assert_eq!(id & MAIN_THREAD_ARENA_BIT, 1);
      let id = make_rand_arena_id(false);
      assert_eq!(id & MAIN_THREAD_ARENA_BIT, 0);
      assert_ne!(id, 0);
    }
  }

  #[test]
  fn public_ids_are_sequential() {
    let heap = Heap::new(Options::default()).unwrap();
    let arenas = &heap.arenas;
    assert_eq!(unsafe { (*arenas.default_arena()).id() }, 0);
    let a = arenas.create_arena(&heap, None, false);
    let b = arenas.create_arena(&heap, None, false);
    unsafe {
      assert_eq!((*a).id(), 1);
      assert_eq!((*b).id(), 2);
    }
    assert_eq!(arenas.get_by_id(2, false), Some(b));
    assert_eq!(arenas.get_by_id(3, false), None);
  }

  #[test]
  fn disposed_private_arena_is_gone() {
    let heap = Heap::new(Options::default()).unwrap();
    let arena = heap.arenas.create_arena(&heap, Some(&ArenaParams::default()), true);
    let id = unsafe { (*arena).id() };
    assert_ne!(id, 0);
    assert_eq!(heap.arenas.get_by_id(id, true), Some(arena));
    unsafe { heap.arenas.dispose_arena(&heap, arena) };
    assert_eq!(heap.arenas.get_by_id(id, true), None);
  }

  #[test]
  fn main_thread_detection() {
    let arenas = ArenaCollection::new();
    assert!(arenas.is_on_main_thread_weak());
    assert!(!arenas.is_on_main_thread());
    arenas.set_main_thread();
    assert!(arenas.is_on_main_thread());
    let other = std::thread::scope(|s| s.spawn(|| arenas.is_on_main_thread_weak()).join().unwrap());
    assert!(!other);
  }

  #[test]
  fn grace_period_postpones_queued_purges() {
    let heap = Heap::new(Options::default()).unwrap();
    assert_eq!(heap.arenas.may_purge_steps(&heap, true, 0, None), MayPurgeResult::Done);
    let arena = heap.arenas.default_arena();
    unsafe { (*arena).notify_significant_reuse() };
    heap.arenas.add_to_outstanding_purges(arena);
    assert_eq!(
      heap.arenas.may_purge_steps(&heap, true, 60_000, None),
      MayPurgeResult::WantsLater
    );
    assert_eq!(heap.arenas.may_purge_steps(&heap, true, 0, None), MayPurgeResult::NeedsMore);
    assert_eq!(heap.arenas.may_purge_steps(&heap, false, 0, None), MayPurgeResult::NeedsMore);
    assert_eq!(heap.arenas.may_purge_steps(&heap, false, 0, None), MayPurgeResult::Done);
  }
}
