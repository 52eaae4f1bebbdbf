//! Small allocation bins and the runs they carve into regions.

use core::mem::offset_of;

use crate::{
  chunk::MAX_LARGE_CLASS,
  list::{List, ListAdapter, ListLink},
  prng::Prng,
  size_class::{MAX_BIN_CLASS, NUM_SMALL_CLASSES, PAGE_SIZE, SizeClass},
};

pub(crate) const RUN_MAGIC: u32 = 0x384a_df93;

/// Header of a small run. The region bitmap follows it, then padding, then
/// the regions. A set bit marks a free region.
#[repr(C)]
pub(crate) struct Run {
  link: ListLink<Run>,
  pub(crate) bin: *mut Bin,
  pub(crate) magic: u32,
  /// First bitmap word that may have a free bit.
  pub(crate) min_element: u32,
  pub(crate) num_free: u32,
  regions_mask: [u32; 0],
}

const RUN_HEADER_SIZE: usize = offset_of!(Run, regions_mask);

/// Runs with at least one free region, most recently refilled first.
pub(crate) struct NonFullRuns;

impl ListAdapter for NonFullRuns {
  type Node = Run;

  fn link(node: *mut Run) -> *mut ListLink<Run> {
    unsafe { &raw mut (*node).link }
  }
}

/// Multiplicative inverse for dividing region offsets by the region size.
/// Exact for every multiple of the divisor up to the run size.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FastDivisor {
  m: u32,
}

impl FastDivisor {
  const SHIFT: u32 = 17;

  const fn new(div: u32) -> Self {
    let p = 1u32 << Self::SHIFT;
    Self {
      m: (p + div - 1 - ((p - 1) % div)) / div,
    }
  }

  #[inline]
  pub(crate) fn divide(self, num: u32) -> u32 {
    ((u64::from(num) * u64::from(self.m)) >> Self::SHIFT) as u32
  }
}

pub(crate) struct Bin {
  pub(crate) non_full_runs: List<NonFullRuns>,
  pub(crate) size_class: usize,
  pub(crate) run_size_pages: usize,
  pub(crate) run_first_region_offset: usize,
  pub(crate) run_num_regions: u32,
  pub(crate) run_num_regions_mask: u32,
  /// Runs owned by this bin, full ones included.
  pub(crate) num_runs: usize,
  pub(crate) size_divisor: FastDivisor,
}

/// Picks a run size keeping the header and bitmap overhead low.
/// Returns (run size, regions, bitmap words, offset of the first region).
const fn run_geometry(size: usize) -> (usize, usize, usize, usize) {
  let mut try_run_size = PAGE_SIZE;
  let mut nregs: usize;
  let mut mask_nelms: usize;
  let mut reg0_offset: usize;
  loop {
    // Counter the first decrement below.
    nregs = (try_run_size - RUN_HEADER_SIZE) / size + 1;
    loop {
      nregs -= 1;
      mask_nelms = nregs.div_ceil(32);
      reg0_offset = try_run_size - nregs * size;
      if RUN_HEADER_SIZE + 4 * mask_nelms <= reg0_offset {
        break;
      }
    }

    // 1.6% overhead.
    if reg0_offset * 1000 <= try_run_size * 16 {
      break;
    }
    // Classes smaller than the overhead align badly with the header; allow
    // 2.4% to keep their runs small.
    if reg0_offset > size && reg0_offset * 1000 <= try_run_size * 24 {
      break;
    }
    // The bitmap outgrew the header: bigger runs will not help.
    if mask_nelms * 4 >= RUN_HEADER_SIZE {
      break;
    }
    if try_run_size + PAGE_SIZE > MAX_LARGE_CLASS {
      break;
    }
    try_run_size += PAGE_SIZE;
  }
  assert!(nregs > 1);
  assert!(mask_nelms * 32 >= nregs);
  (try_run_size, nregs, mask_nelms, reg0_offset)
}

impl Bin {
  pub(crate) const fn new(size_class: usize) -> Self {
    let (run_size, nregs, mask_nelms, reg0_offset) = run_geometry(size_class);
    Self {
      non_full_runs: List::new(),
      size_class,
      run_size_pages: run_size / PAGE_SIZE,
      run_first_region_offset: reg0_offset,
      run_num_regions: nregs as u32,
      run_num_regions_mask: mask_nelms as u32,
      num_runs: 0,
      size_divisor: FastDivisor::new(size_class as u32),
    }
  }

  #[inline]
  pub(crate) fn run_size(&self) -> usize {
    self.run_size_pages * PAGE_SIZE
  }
}

const fn small_classes() -> [usize; NUM_SMALL_CLASSES] {
  let mut out = [0; NUM_SMALL_CLASSES];
  let mut class = SizeClass::new(1);
  let mut i = 0;
  while i < NUM_SMALL_CLASSES {
    out[i] = class.size();
    if class.size() < MAX_BIN_CLASS {
      class = class.next();
    }
    i += 1;
  }
  out
}

/// Size of every bin, in bin index order.
pub(crate) const BIN_SIZES: [usize; NUM_SMALL_CLASSES] = small_classes();

const _: () = assert!(BIN_SIZES[NUM_SMALL_CLASSES - 1] == MAX_BIN_CLASS);

// =============================================================================
// Region bitmap
// =============================================================================

#[inline]
fn find_free_bit(mask: u32, rotation: u32) -> u32 {
  let bit = mask.rotate_right(rotation).trailing_zeros();
  (bit + rotation) % 32
}

impl Run {
  #[inline]
  unsafe fn mask(run: *mut Run) -> *mut u32 {
    unsafe { (&raw mut (*run).regions_mask).cast() }
  }

  /// Formats a fresh run with every region free.
  pub(crate) unsafe fn init(run: *mut Run, bin: *mut Bin) {
    unsafe {
      let words = (*bin).run_num_regions_mask as usize;
      let mask = Self::mask(run);
      for i in 0..words - 1 {
        mask.add(i).write(u32::MAX);
      }
      let rem = (*bin).run_num_regions % 32;
      mask
        .add(words - 1)
        .write(if rem == 0 { u32::MAX } else { (1 << rem) - 1 });

      (&raw mut (*run).link).write(ListLink::new());
      (*run).bin = bin;
      (*run).min_element = 0;
      (*run).num_free = (*bin).run_num_regions;
      (*run).magic = RUN_MAGIC;
    }
  }

  /// Takes a free region. The run must have one.
  pub(crate) unsafe fn alloc_region(run: *mut Run, bin: &Bin, prng: Option<&mut Prng>) -> *mut u8 {
    debug_assert!(unsafe { (*run).magic } == RUN_MAGIC);
    let rotation = prng.map_or(0, |p| (p.next() % 32) as u32);
    unsafe {
      let mask = Self::mask(run);
      let first = (*run).min_element;
      for i in first..bin.run_num_regions_mask {
        let word = mask.add(i as usize).read();
        if word == 0 {
          continue;
        }
        let bit = find_free_bit(word, rotation);
        mask.add(i as usize).write(word & !(1 << bit));
        if i != first {
          (*run).min_element = i;
        }
        let regind = (i * 32 + bit) as usize;
        debug_assert!(regind < bin.run_num_regions as usize);
        return run
          .cast::<u8>()
          .add(bin.run_first_region_offset + bin.size_class * regind);
      }
    }
    unreachable!("run has no free region");
  }

  /// Index of the region containing `ptr`.
  #[inline]
  pub(crate) unsafe fn region_index(run: *mut Run, bin: &Bin, ptr: *const u8) -> u32 {
    let diff = ptr as usize - run as usize - bin.run_first_region_offset;
    let regind = bin.size_divisor.divide(diff as u32);
    debug_assert!(diff == regind as usize * bin.size_class, "pointer inside a region");
    regind
  }

  pub(crate) unsafe fn region_is_free(run: *mut Run, regind: u32) -> bool {
    let word = unsafe { Self::mask(run).add((regind / 32) as usize).read() };
    word & (1 << (regind % 32)) != 0
  }

  /// Returns a region to the run.
  ///
  /// # Panics
  ///
  /// When the region is already free.
  pub(crate) unsafe fn dalloc_region(run: *mut Run, bin: &Bin, ptr: *const u8) {
    unsafe {
      let regind = Self::region_index(run, bin, ptr);
      assert!(regind < bin.run_num_regions, "Freeing a pointer past the run.");
      let elm = regind / 32;
      if elm < (*run).min_element {
        (*run).min_element = elm;
      }
      let bit = 1 << (regind % 32);
      let slot = Self::mask(run).add(elm as usize);
      assert!(slot.read() & bit == 0, "Double-free?");
      slot.write(slot.read() | bit);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn geometry_fits_header_and_bitmap() {
    for &size in &BIN_SIZES {
      let bin = Bin::new(size);
      let nregs = bin.run_num_regions as usize;
      assert!(nregs > 1, "{size}");
      assert!(RUN_HEADER_SIZE + 4 * bin.run_num_regions_mask as usize <= bin.run_first_region_offset);
      assert_eq!(bin.run_first_region_offset + nregs * size, bin.run_size());
      assert!(bin.run_size() <= MAX_LARGE_CLASS);
    }
  }

  #[test]
  fn known_run_sizes() {
    assert_eq!(Bin::new(8).run_size(), PAGE_SIZE);
    assert_eq!(Bin::new(16).run_size(), PAGE_SIZE);
    assert_eq!(Bin::new(2048).run_size(), 32 * PAGE_SIZE);
    assert_eq!(Bin::new(3840).run_size(), 16 * PAGE_SIZE);
  }

  #[test]
  fn divisor_is_exact_for_every_region() {
    for &size in &BIN_SIZES {
      let bin = Bin::new(size);
      for k in 0..bin.run_num_regions {
        assert_eq!(bin.size_divisor.divide(k * size as u32), k, "size {size}");
      }
    }
  }

  #[test]
  fn free_bit_search_honors_rotation() {
    assert_eq!(find_free_bit(0b1000_0001, 0), 0);
    assert_eq!(find_free_bit(0b1000_0001, 1), 7);
    assert_eq!(find_free_bit(0b1000_0001, 8), 0);
    assert_eq!(find_free_bit(1 << 31, 5), 31);
  }

  #[repr(C, align(4096))]
  struct Page([u8; 4096]);

  fn with_run(size: usize, f: impl FnOnce(*mut Run, &mut Bin)) {
    let mut bin = Bin::new(size);
    assert_eq!(bin.run_size_pages, 1);
    let mut page = Box::new(Page([0; 4096]));
    let run = page.0.as_mut_ptr().cast::<Run>();
    unsafe { Run::init(run, &mut bin) };
    f(run, &mut bin);
  }

  #[test]
  fn regions_are_handed_out_once() {
    with_run(64, |run, bin| unsafe {
      let mut seen = Vec::new();
      let mut prng = Prng::new(3, 4);
      for _ in 0..bin.run_num_regions {
        let p = Run::alloc_region(run, bin, Some(&mut prng));
        let regind = Run::region_index(run, bin, p);
        assert!(!Run::region_is_free(run, regind));
        seen.push(regind);
      }
      seen.sort_unstable();
      seen.dedup();
      assert_eq!(seen.len(), bin.run_num_regions as usize);

      let p = run.cast::<u8>().add(bin.run_first_region_offset + 64 * 5);
      Run::dalloc_region(run, bin, p);
      assert!(Run::region_is_free(run, 5));
      assert_eq!(Run::alloc_region(run, bin, None), p);
    });
  }

  #[test]
  #[should_panic(expected = "Double-free?")]
  fn double_free_panics() {
    with_run(32, |run, bin| unsafe {
      let p = Run::alloc_region(run, bin, None);
      Run::dalloc_region(run, bin, p);
      Run::dalloc_region(run, bin, p);
    });
  }
}
