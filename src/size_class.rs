//! Size classes and static heap geometry.

use crate::chunk::MAX_LARGE_CLASS;

// =============================================================================
// Constants
// =============================================================================

pub const PAGE_SIZE_2POW: usize = 12;
/// Page size used by all bookkeeping. Must be a multiple of the kernel's.
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_2POW; // 4KB
pub const PAGE_SIZE_MASK: usize = PAGE_SIZE - 1;

pub const CHUNK_SIZE: usize = 1 << 20; // 1MB
pub const CHUNK_SIZE_MASK: usize = CHUNK_SIZE - 1;
pub const CHUNK_NUM_PAGES: usize = CHUNK_SIZE >> PAGE_SIZE_2POW;

pub const CACHELINE_SIZE: usize = 64;

/// Smallest size class. Even a 1-byte request reserves a pointer's worth.
pub const MIN_TINY_CLASS: usize = size_of::<*mut u8>();
pub const MAX_TINY_CLASS: usize = 8;

pub const QUANTUM: usize = 16;
pub const QUANTUM_MASK: usize = QUANTUM - 1;
pub const QUANTUM_WIDE: usize = 256;
pub const QUANTUM_WIDE_MASK: usize = QUANTUM_WIDE - 1;

pub const MIN_QUANTUM_CLASS: usize = MAX_TINY_CLASS * 2;
pub const MIN_QUANTUM_WIDE_CLASS: usize = 512;
pub const MIN_SUB_PAGE_CLASS: usize = 4096;

pub const MAX_QUANTUM_CLASS: usize = MIN_QUANTUM_WIDE_CLASS - QUANTUM;
pub const MAX_QUANTUM_WIDE_CLASS: usize = MIN_SUB_PAGE_CLASS - QUANTUM_WIDE;

/// Largest sub-page class, or zero when pages are too small to have any.
pub const MAX_SUB_PAGE_CLASS: usize = if PAGE_SIZE / 2 >= MIN_SUB_PAGE_CLASS {
  PAGE_SIZE / 2
} else {
  0
};

/// Largest size served from bins.
pub const MAX_BIN_CLASS: usize = if MAX_SUB_PAGE_CLASS != 0 {
  MAX_SUB_PAGE_CLASS
} else {
  MAX_QUANTUM_WIDE_CLASS
};

pub const NUM_TINY_CLASSES: usize = log2(MAX_TINY_CLASS) - log2(MIN_TINY_CLASS) + 1;
pub const NUM_QUANTUM_CLASSES: usize = (MAX_QUANTUM_CLASS + QUANTUM - MIN_QUANTUM_CLASS) / QUANTUM;
pub const NUM_QUANTUM_WIDE_CLASSES: usize =
  (MAX_QUANTUM_WIDE_CLASS + QUANTUM_WIDE - MIN_QUANTUM_WIDE_CLASS) / QUANTUM_WIDE;
pub const NUM_SUB_PAGE_CLASSES: usize = if MAX_SUB_PAGE_CLASS != 0 {
  log2(MAX_SUB_PAGE_CLASS) - log2(MIN_SUB_PAGE_CLASS) + 1
} else {
  0
};

/// Number of bins per arena.
pub const NUM_SMALL_CLASSES: usize =
  NUM_TINY_CLASSES + NUM_QUANTUM_CLASSES + NUM_QUANTUM_WIDE_CLASSES + NUM_SUB_PAGE_CLASSES;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(CHUNK_SIZE.is_power_of_two());
const _: () = assert!(QUANTUM.is_power_of_two());
const _: () = assert!(QUANTUM_WIDE.is_power_of_two());
const _: () = assert!(MIN_SUB_PAGE_CLASS.is_power_of_two());
const _: () = assert!(MAX_QUANTUM_CLASS % QUANTUM == 0);
const _: () = assert!(MAX_QUANTUM_WIDE_CLASS % QUANTUM_WIDE == 0);
const _: () = assert!(QUANTUM >= size_of::<*mut u8>());
const _: () = assert!(QUANTUM < QUANTUM_WIDE);
const _: () = assert!(QUANTUM_WIDE <= MAX_QUANTUM_CLASS);
const _: () = assert!(MAX_SUB_PAGE_CLASS >= MIN_SUB_PAGE_CLASS || MAX_SUB_PAGE_CLASS == 0);
const _: () = assert!(QUANTUM * 4 <= CHUNK_SIZE);
const _: () = assert!(CHUNK_SIZE >= PAGE_SIZE);

// =============================================================================
// Size classes
// =============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ClassType {
  Tiny,
  Quantum,
  QuantumWide,
  SubPage,
  Large,
}

/// The class a request is rounded up to. Only sizes up to the largest large
/// class are classified; anything bigger goes to the huge path.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SizeClass {
  kind: ClassType,
  size: usize,
}

impl SizeClass {
  pub const fn new(size: usize) -> Self {
    if size <= MAX_TINY_CLASS {
      let rounded = round_up_pow2(size);
      Self {
        kind: ClassType::Tiny,
        size: if rounded < MIN_TINY_CLASS { MIN_TINY_CLASS } else { rounded },
      }
    } else if size <= MAX_QUANTUM_CLASS {
      Self {
        kind: ClassType::Quantum,
        size: align_up(size, QUANTUM),
      }
    } else if size <= MAX_QUANTUM_WIDE_CLASS {
      Self {
        kind: ClassType::QuantumWide,
        size: align_up(size, QUANTUM_WIDE),
      }
    } else if size <= MAX_SUB_PAGE_CLASS {
      Self {
        kind: ClassType::SubPage,
        size: round_up_pow2(size),
      }
    } else if size <= MAX_LARGE_CLASS {
      Self {
        kind: ClassType::Large,
        size: page_ceiling(size),
      }
    } else {
      panic!("size is beyond the largest large class")
    }
  }

  #[inline]
  pub const fn size(self) -> usize {
    self.size
  }

  #[inline]
  pub const fn kind(self) -> ClassType {
    self.kind
  }

  /// The smallest class strictly greater than this one.
  #[inline]
  pub const fn next(self) -> Self {
    Self::new(self.size + 1)
  }

  /// Index of the bin serving this class. Only meaningful for small classes.
  pub const fn bin_index(self) -> usize {
    match self.kind {
      ClassType::Tiny => log2(self.size / MIN_TINY_CLASS),
      ClassType::Quantum => NUM_TINY_CLASSES + self.size / QUANTUM - MIN_QUANTUM_CLASS / QUANTUM,
      ClassType::QuantumWide => {
        NUM_TINY_CLASSES + NUM_QUANTUM_CLASSES + self.size / QUANTUM_WIDE
          - MIN_QUANTUM_WIDE_CLASS / QUANTUM_WIDE
      }
      ClassType::SubPage => {
        NUM_TINY_CLASSES + NUM_QUANTUM_CLASSES + NUM_QUANTUM_WIDE_CLASSES + log2(self.size)
          - log2(MIN_SUB_PAGE_CLASS)
      }
      ClassType::Large => panic!("large classes have no bin"),
    }
  }
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

#[inline(always)]
pub const fn page_ceiling(x: usize) -> usize {
  align_up(x, PAGE_SIZE)
}

#[inline(always)]
pub const fn chunk_ceiling(x: usize) -> usize {
  align_up(x, CHUNK_SIZE)
}

#[inline(always)]
pub const fn cacheline_ceiling(x: usize) -> usize {
  align_up(x, CACHELINE_SIZE)
}

/// Offset of `ptr` within its chunk.
#[inline(always)]
pub fn chunk_offset(ptr: *const u8) -> usize {
  ptr as usize & CHUNK_SIZE_MASK
}

/// Base address of the chunk containing `ptr`.
#[inline(always)]
pub fn chunk_base(ptr: *const u8) -> usize {
  ptr as usize & !CHUNK_SIZE_MASK
}

/// 1 for 0, otherwise the next power of two.
#[inline(always)]
pub const fn round_up_pow2(x: usize) -> usize {
  if x <= 1 { 1 } else { x.next_power_of_two() }
}

#[inline(always)]
pub const fn log2(x: usize) -> usize {
  (usize::BITS - 1 - x.leading_zeros()) as usize
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;

  fn all_classes() -> Vec<usize> {
    let mut out = Vec::new();
    let mut class = SizeClass::new(1);
    loop {
      out.push(class.size());
      if class.size() == MAX_LARGE_CLASS {
        return out;
      }
      class = class.next();
    }
  }

  #[test]
  fn small_class_table() {
    assert_eq!(MIN_TINY_CLASS, 8);
    assert_eq!(NUM_TINY_CLASSES, 1);
    assert_eq!(NUM_QUANTUM_CLASSES, 31);
    assert_eq!(NUM_QUANTUM_WIDE_CLASSES, 14);
    assert_eq!(NUM_SUB_PAGE_CLASSES, 0);
    assert_eq!(NUM_SMALL_CLASSES, 46);
    assert_eq!(MAX_BIN_CLASS, 3840);
  }

  #[test]
  fn class_boundaries() {
    assert_eq!(SizeClass::new(0).size(), 8);
    assert_eq!(SizeClass::new(1).size(), 8);
    assert_eq!(SizeClass::new(9).size(), 16);
    assert_eq!(SizeClass::new(17).kind(), ClassType::Quantum);
    assert_eq!(SizeClass::new(496).size(), 496);
    assert_eq!(SizeClass::new(497).size(), 512);
    assert_eq!(SizeClass::new(497).kind(), ClassType::QuantumWide);
    assert_eq!(SizeClass::new(3841).kind(), ClassType::Large);
    assert_eq!(SizeClass::new(3841).size(), 4096);
  }

  #[test]
  fn bin_indices_are_dense() {
    let mut class = SizeClass::new(1);
    let mut expected = 0;
    loop {
      assert_eq!(class.bin_index(), expected, "class {}", class.size());
      if class.size() == MAX_BIN_CLASS {
        break;
      }
      expected += 1;
      class = class.next();
    }
    assert_eq!(expected + 1, NUM_SMALL_CLASSES);
  }

  #[test]
  #[should_panic(expected = "largest large class")]
  fn huge_sizes_are_not_classified() {
    SizeClass::new(MAX_LARGE_CLASS + 1);
  }

  proptest! {
    #[test]
    fn class_is_smallest_boundary(size in 1usize..=MAX_LARGE_CLASS) {
      let classes = all_classes();
      let class = SizeClass::new(size).size();
      prop_assert!(class >= size);
      let pos = classes.binary_search(&class);
      prop_assert!(pos.is_ok());
      let pos = pos.unwrap();
      if pos > 0 {
        prop_assert!(classes[pos - 1] < size);
      }
    }

    #[test]
    fn size_is_monotonic(a in 1usize..=MAX_LARGE_CLASS, b in 1usize..=MAX_LARGE_CLASS) {
      let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
      prop_assert!(SizeClass::new(lo).size() <= SizeClass::new(hi).size());
    }
  }
}
