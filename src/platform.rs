//! Operating system primitives: virtual memory, page size, time, thread ids.

use core::{
  ptr::null_mut,
  sync::atomic::{AtomicU32, Ordering},
};

unsafe fn pages_map(addr: *mut u8, size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      addr.cast(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

pub(crate) unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  if size != 0 {
    unsafe { libc::munmap(ptr.cast(), size) };
  }
}

/// Maps `size` bytes aligned to `alignment`. Tries an exact mapping first and
/// only over-maps and trims when the kernel hands back a misaligned address.
pub(crate) unsafe fn os_map_aligned(size: usize, alignment: usize) -> *mut u8 {
  debug_assert!(alignment.is_power_of_two());
  let ret = unsafe { pages_map(null_mut(), size) };
  if ret.is_null() {
    return null_mut();
  }
  if (ret as usize) & (alignment - 1) == 0 {
    return ret;
  }
  unsafe {
    os_munmap(ret, size);
    os_map_aligned_slow(size, alignment)
  }
}

unsafe fn os_map_aligned_slow(size: usize, alignment: usize) -> *mut u8 {
  let Some(alloc_size) = size
    .checked_add(alignment)
    .and_then(|s| s.checked_sub(kernel_page_size()))
  else {
    return null_mut();
  };
  let pages = unsafe { pages_map(null_mut(), alloc_size) };
  if pages.is_null() {
    return null_mut();
  }
  let lead = crate::size_class::align_up(pages as usize, alignment) - pages as usize;
  let ret = unsafe { pages.add(lead) };
  unsafe {
    os_trim(pages, alloc_size, lead, size);
  }
  ret
}

/// Unmaps the `lead` bytes before and whatever follows `size` bytes after the
/// kept range of a mapping of `total` bytes.
pub(crate) unsafe fn os_trim(addr: *mut u8, total: usize, lead: usize, size: usize) {
  debug_assert!(total >= lead + size);
  let trail = total - lead - size;
  unsafe {
    os_munmap(addr, lead);
    os_munmap(addr.add(lead + size), trail);
  }
}

/// Makes a range inaccessible and releases its physical pages.
pub(crate) unsafe fn os_decommit(addr: *mut u8, size: usize) {
  if size == 0 {
    return;
  }
  let ret = unsafe {
    libc::mmap(
      addr.cast(),
      size,
      libc::PROT_NONE,
      libc::MAP_FIXED | libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };
  assert!(ret != libc::MAP_FAILED, "failed to decommit pages");
}

/// Makes a decommitted range usable again. The contents read as zero.
#[must_use]
pub(crate) unsafe fn os_commit(addr: *mut u8, size: usize) -> bool {
  if size == 0 {
    return true;
  }
  let ret = unsafe {
    libc::mmap(
      addr.cast(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_FIXED | libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };
  ret != libc::MAP_FAILED
}

/// Tells the kernel it may lazily reclaim the pages. Returns false when the
/// kernel refused, in which case the pages keep their contents.
#[must_use]
pub(crate) unsafe fn os_madvise_free(addr: *mut u8, size: usize) -> bool {
  size == 0 || unsafe { libc::madvise(addr.cast(), size, libc::MADV_FREE) } == 0
}

pub(crate) fn kernel_page_size() -> usize {
  let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
  if ret <= 0 { 4096 } else { ret as usize }
}

/// Monotonic nanoseconds.
pub(crate) fn timestamp_ns() -> u64 {
  let mut ts = libc::timespec {
    tv_sec: 0,
    tv_nsec: 0,
  };
  unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
  (ts.tv_sec as u64)
    .wrapping_mul(1_000_000_000)
    .wrapping_add(ts.tv_nsec as u64)
}

// Each thread gets a different ID
pub(crate) fn thread_id_u32() -> u32 {
  thread_local! {
    static TID: u32 = {
      static CTR: AtomicU32 = AtomicU32::new(1); // Start at 1; 0 = no thread
      CTR.fetch_add(1, Ordering::Relaxed) // We only need uniqueness, not synchronization
    };
  }
  TID.with(|&id| id)
}

/// Writes straight to stderr without allocating.
pub(crate) fn malloc_message(parts: &[&[u8]]) {
  for part in parts {
    unsafe { libc::write(libc::STDERR_FILENO, part.as_ptr().cast(), part.len()) };
  }
}
