//! Runtime tunables and `MALLOC_OPTIONS` parsing.

use crate::size_class::CACHELINE_SIZE;

/// Byte written over fresh allocations when junk filling is on.
pub const ALLOC_JUNK: u8 = 0xe4;
/// Byte written over freed allocations.
pub const ALLOC_POISON: u8 = 0xe5;

pub const DIRTY_MAX_DEFAULT: usize = 1 << 8;

/// How much of a freed allocation gets poisoned.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Poison {
  None,
  /// Only the first `n` bytes.
  Some(usize),
  All,
}

#[derive(Clone, Copy, Debug)]
pub struct Options {
  /// Dirty page budget of the default arena. Other arenas get an eighth.
  pub dirty_max: usize,
  pub junk: bool,
  pub zero: bool,
  pub poison: Poison,
  pub randomize_small: bool,
  /// Bytes of unused chunks kept for reuse instead of being unmapped.
  pub recycle_limit: usize,
  /// Pages committed at once when reusing decommitted memory.
  pub purge_commit_batch: usize,
  /// A purge stops once dirty pages drop to `max_dirty >> purge_hysteresis_shift`.
  pub purge_hysteresis_shift: u32,
}

impl Default for Options {
  fn default() -> Self {
    Self {
      dirty_max: DIRTY_MAX_DEFAULT,
      junk: false,
      zero: false,
      poison: Poison::Some(256),
      randomize_small: true,
      recycle_limit: 128 << 20,
      purge_commit_batch: 32,
      purge_hysteresis_shift: 1,
    }
  }
}

impl Options {
  /// Parses a `MALLOC_OPTIONS` string on top of the defaults, logging
  /// unsupported characters.
  pub fn parse(opts: &str) -> Self {
    let mut ret = Self::default();
    ret.apply(opts.as_bytes(), |c| {
      tracing::warn!(option = %char::from(c), "unsupported character in malloc options");
    });
    ret
  }

  /// Applies single-letter options, each optionally preceded by a decimal
  /// argument. Unknown letters are handed to `unsupported` and skipped.
  pub fn apply(&mut self, opts: &[u8], mut unsupported: impl FnMut(u8)) {
    let mut i = 0;
    while i < opts.len() {
      let mut prefix: u32 = 0;
      while i < opts.len() && opts[i].is_ascii_digit() {
        prefix = prefix.saturating_mul(10).saturating_add(u32::from(opts[i] - b'0'));
        i += 1;
      }
      let Some(&c) = opts.get(i) else {
        break;
      };

      match c {
        b'f' => {
          let shift = if prefix == 0 { 1 } else { prefix };
          self.dirty_max = self.dirty_max.checked_shr(shift).unwrap_or(0);
        }
        b'F' => {
          let mut shift = if prefix == 0 { 1 } else { prefix };
          if self.dirty_max == 0 {
            self.dirty_max = 1;
            shift -= 1;
          }
          self.dirty_max = match self.dirty_max.checked_shl(shift) {
            Some(v) if v >> shift == self.dirty_max => v,
            // Shifted bits off the top: clamp to the largest power of two.
            _ => 1 << (usize::BITS - 1),
          };
        }
        b'j' => self.junk = false,
        b'J' => self.junk = true,
        b'q' => self.poison = Poison::None,
        b'Q' => {
          if opts.get(i + 1) == Some(&b'Q') {
            i += 1;
            self.poison = Poison::All;
          } else {
            self.poison = Poison::Some(CACHELINE_SIZE * prefix as usize);
          }
        }
        b'z' => self.zero = false,
        b'Z' => self.zero = true,
        b'r' => self.randomize_small = false,
        b'R' => self.randomize_small = true,
        other => unsupported(other),
      }
      i += 1;
    }
  }

  /// Number of poisoned bytes for a freed allocation of `size` bytes.
  #[inline]
  pub(crate) fn poison_len(&self, size: usize) -> usize {
    match self.poison {
      Poison::None => 0,
      Poison::Some(n) => n.min(size),
      Poison::All => size,
    }
  }

  /// Overwrites the start of a freed allocation.
  #[inline]
  pub(crate) unsafe fn poison(&self, ptr: *mut u8, size: usize) {
    let len = self.poison_len(size);
    if len != 0 {
      unsafe { ptr.write_bytes(ALLOC_POISON, len) };
    }
  }

  /// Fills fresh memory the caller did not ask to be zeroed.
  #[inline]
  pub(crate) unsafe fn apply_zero_or_junk(&self, ptr: *mut u8, size: usize) {
    if self.junk {
      unsafe { ptr.write_bytes(ALLOC_JUNK, size) };
    } else if self.zero {
      unsafe { ptr.write_bytes(0, size) };
    }
  }
}
