//! Xorshift128+ generator used to randomize small allocation placement and
//! private arena ids.

use crate::platform::timestamp_ns;

#[derive(Clone, Debug)]
pub(crate) struct Prng {
  state: [u64; 2],
}

/// 64 random bits from the OS. Does not allocate.
pub(crate) fn random_u64() -> Option<u64> {
  let mut buf = [0u8; 8];
  getrandom::getrandom(&mut buf).ok()?;
  Some(u64::from_ne_bytes(buf))
}

impl Prng {
  pub(crate) const fn new(a: u64, b: u64) -> Self {
    // An all-zero state only ever yields zero.
    if a == 0 && b == 0 {
      Self {
        state: [0x9e37_79b9_7f4a_7c15, 1],
      }
    } else {
      Self { state: [a, b] }
    }
  }

  /// Seeds from the OS, falling back to the clock.
  pub(crate) fn from_entropy() -> Self {
    match (random_u64(), random_u64()) {
      (Some(a), Some(b)) => Self::new(a, b),
      _ => {
        let t = timestamp_ns();
        Self::new(t, t.rotate_left(32) ^ 0xda94_2042_e4dd_58b5)
      }
    }
  }

  #[inline]
  pub(crate) fn next(&mut self) -> u64 {
    let mut s1 = self.state[0];
    let s0 = self.state[1];
    self.state[0] = s0;
    s1 ^= s1 << 23;
    self.state[1] = s1 ^ s0 ^ (s1 >> 17) ^ (s0 >> 26);
    self.state[1].wrapping_add(s0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn deterministic_for_a_seed() {
    let mut a = Prng::new(1, 2);
    let mut b = Prng::new(1, 2);
    let xs: Vec<u64> = (0..8).map(|_| a.next()).collect();
    let ys: Vec<u64> = (0..8).map(|_| b.next()).collect();
    assert_eq!(xs, ys);
    assert!(xs.windows(2).all(|w| w[0] != w[1]));
  }

  #[test]
  fn zero_seed_is_replaced() {
    let mut p = Prng::new(0, 0);
    assert!((0..4).any(|_| p.next() != 0));
  }
}
