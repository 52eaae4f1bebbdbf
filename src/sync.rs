//! Locks guarding allocator metadata.
//!
//! These never allocate, so they can be used from inside the allocator itself,
//! and they can be forcibly taken and reset around `fork()`.

use core::{
  cell::UnsafeCell,
  hint,
  ops::{Deref, DerefMut},
  sync::atomic::{AtomicBool, AtomicU32, Ordering},
};

use crate::platform::thread_id_u32;

/// Spins before falling back to `sched_yield`.
const SPINS_BEFORE_YIELD: u32 = 64;

// =============================================================================
// Raw spin lock
// =============================================================================

pub(crate) struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  pub(crate) const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  #[inline]
  pub(crate) fn lock(&self) {
    let mut spins = 0;
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        if spins < SPINS_BEFORE_YIELD {
          hint::spin_loop();
          spins += 1;
        } else {
          std::thread::yield_now();
        }
      }
    }
  }

  #[inline]
  pub(crate) fn try_lock(&self) -> bool {
    self
      .locked
      .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_ok()
  }

  /// Caller must hold the lock.
  #[inline]
  pub(crate) unsafe fn unlock(&self) {
    debug_assert!(self.locked.load(Ordering::Relaxed), "unlock of a free lock");
    self.locked.store(false, Ordering::Release);
  }

  /// Forgets whoever held the lock. Only sound in a freshly forked child,
  /// where the holder no longer exists.
  #[inline]
  pub(crate) unsafe fn reinit(&self) {
    self.locked.store(false, Ordering::Relaxed);
  }
}

// =============================================================================
// Mutex
// =============================================================================

pub(crate) struct Mutex<T> {
  raw: SpinLock,
  data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
  pub(crate) const fn new(value: T) -> Self {
    Self {
      raw: SpinLock::new(),
      data: UnsafeCell::new(value),
    }
  }

  #[inline]
  pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
    self.raw.lock();
    MutexGuard { mutex: self }
  }

  pub(crate) fn get_mut(&mut self) -> &mut T {
    self.data.get_mut()
  }

  /// Takes the lock without a guard, for the pre-fork handler.
  pub(crate) unsafe fn force_lock(&self) {
    self.raw.lock();
  }

  /// Releases a lock taken by [`Mutex::force_lock`].
  pub(crate) unsafe fn force_unlock(&self) {
    unsafe { self.raw.unlock() };
  }

  pub(crate) unsafe fn reinit(&self) {
    unsafe { self.raw.reinit() };
  }

  /// Raw access for a holder of [`Mutex::force_lock`].
  pub(crate) fn data_ptr(&self) -> *mut T {
    self.data.get()
  }
}

pub(crate) struct MutexGuard<'a, T> {
  mutex: &'a Mutex<T>,
}

impl<T> Deref for MutexGuard<'_, T> {
  type Target = T;

  #[inline]
  fn deref(&self) -> &T {
    unsafe { &*self.mutex.data.get() }
  }
}

impl<T> DerefMut for MutexGuard<'_, T> {
  #[inline]
  fn deref_mut(&mut self) -> &mut T {
    unsafe { &mut *self.mutex.data.get() }
  }
}

impl<T> Drop for MutexGuard<'_, T> {
  #[inline]
  fn drop(&mut self) {
    unsafe { self.mutex.raw.unlock() };
  }
}

// =============================================================================
// MaybeMutex
// =============================================================================

/// Whether a [`MaybeMutex`] really locks.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum LockMode {
  MustLock,
  /// Only the creating thread may touch the data; locking is skipped.
  MainThreadOnly,
}

/// A mutex whose locking can be elided for data owned by a single thread.
///
/// Elision is not enforced by the type system: every access from an elided
/// lock asserts that it happens on the owning thread.
pub(crate) struct MaybeMutex<T> {
  raw: SpinLock,
  mode: LockMode,
  owner: AtomicU32,
  denied_after_fork: AtomicBool,
  data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for MaybeMutex<T> {}
unsafe impl<T: Send> Sync for MaybeMutex<T> {}

impl<T> MaybeMutex<T> {
  pub(crate) fn new(value: T, mode: LockMode) -> Self {
    Self {
      raw: SpinLock::new(),
      mode,
      owner: AtomicU32::new(thread_id_u32()),
      denied_after_fork: AtomicBool::new(false),
      data: UnsafeCell::new(value),
    }
  }

  #[inline]
  pub(crate) fn lock(&self) -> MaybeMutexGuard<'_, T> {
    if self.should_lock() {
      self.raw.lock();
    }
    MaybeMutexGuard { mutex: self }
  }

  #[inline]
  pub(crate) fn lock_is_enabled(&self) -> bool {
    self.mode == LockMode::MustLock
  }

  /// True when this thread may use the protected data, either through the
  /// lock or because it owns the data.
  #[inline]
  pub(crate) fn safe_on_this_thread(&self) -> bool {
    self.mode == LockMode::MustLock || self.owner.load(Ordering::Relaxed) == thread_id_u32()
  }

  /// Re-initializes the lock in a forked child. An elided lock survives only
  /// when the fork came from its owning thread.
  pub(crate) unsafe fn reinit(&self, forking_thread: u32) {
    match self.mode {
      LockMode::MustLock => unsafe { self.raw.reinit() },
      LockMode::MainThreadOnly => {
        if self.owner.load(Ordering::Relaxed) != forking_thread {
          self.denied_after_fork.store(true, Ordering::Relaxed);
        }
      }
    }
  }

  pub(crate) unsafe fn force_lock(&self) {
    if self.lock_is_enabled() {
      self.raw.lock();
    }
  }

  pub(crate) unsafe fn force_unlock(&self) {
    if self.lock_is_enabled() {
      unsafe { self.raw.unlock() };
    }
  }

  /// Raw access without locking. Used by teardown and single-owner paths.
  pub(crate) fn data_ptr(&self) -> *mut T {
    self.data.get()
  }

  #[inline]
  fn should_lock(&self) -> bool {
    assert!(
      !self.denied_after_fork.load(Ordering::Relaxed),
      "main-thread-only arena used after fork from another thread"
    );
    if self.mode == LockMode::MustLock {
      return true;
    }
    debug_assert!(
      self.safe_on_this_thread(),
      "main-thread-only arena used off its thread"
    );
    false
  }
}

pub(crate) struct MaybeMutexGuard<'a, T> {
  mutex: &'a MaybeMutex<T>,
}

impl<T> Deref for MaybeMutexGuard<'_, T> {
  type Target = T;

  #[inline]
  fn deref(&self) -> &T {
    unsafe { &*self.mutex.data.get() }
  }
}

impl<T> DerefMut for MaybeMutexGuard<'_, T> {
  #[inline]
  fn deref_mut(&mut self) -> &mut T {
    unsafe { &mut *self.mutex.data.get() }
  }
}

impl<T> Drop for MaybeMutexGuard<'_, T> {
  #[inline]
  fn drop(&mut self) {
    if self.mutex.lock_is_enabled() {
      unsafe { self.mutex.raw.unlock() };
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  #[test]
  fn mutex_serializes_increments() {
    let counter = Arc::new(Mutex::new(0usize));
    let handles: Vec<_> = (0..4)
      .map(|_| {
        let counter = Arc::clone(&counter);
        std::thread::spawn(move || {
          for _ in 0..10_000 {
            *counter.lock() += 1;
          }
        })
      })
      .collect();
    for h in handles {
      h.join().unwrap();
    }
    assert_eq!(*counter.lock(), 40_000);
  }

  #[test]
  fn reinit_releases_forgotten_holder() {
    let m = Mutex::new(1u32);
    unsafe {
      m.force_lock();
      m.reinit();
    }
    assert_eq!(*m.lock(), 1);
  }

  #[test]
  fn elided_lock_skips_locking_on_owner() {
    let m = MaybeMutex::new(5u32, LockMode::MainThreadOnly);
    assert!(!m.lock_is_enabled());
    assert!(m.safe_on_this_thread());
    *m.lock() += 1;
    // The raw lock was never taken.
    assert!(m.raw.try_lock());
    assert_eq!(*m.lock(), 6);
  }

  #[test]
  fn elided_lock_denied_after_foreign_fork() {
    let m = MaybeMutex::new(0u32, LockMode::MainThreadOnly);
    unsafe { m.reinit(thread_id_u32().wrapping_add(1)) };
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
      let _g = m.lock();
    }));
    assert!(result.is_err());
  }
}
