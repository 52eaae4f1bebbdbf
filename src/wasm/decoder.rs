//! Cursor over a byte buffer with LEB128 and type readers.

use super::{
  env::Features,
  error::{Result, ValidationError},
  types::{HeapType, RefType, StorageType, ValType},
};

// =============================================================================
// Type codes
// =============================================================================

pub(crate) mod code {
  pub const I32: u8 = 0x7f;
  pub const I64: u8 = 0x7e;
  pub const F32: u8 = 0x7d;
  pub const F64: u8 = 0x7c;
  pub const V128: u8 = 0x7b;
  pub const I8: u8 = 0x78;
  pub const I16: u8 = 0x77;

  pub const NO_EXN: u8 = 0x74;
  pub const NO_FUNC: u8 = 0x73;
  pub const NO_EXTERN: u8 = 0x72;
  pub const NONE: u8 = 0x71;
  pub const FUNC: u8 = 0x70;
  pub const EXTERN: u8 = 0x6f;
  pub const ANY: u8 = 0x6e;
  pub const EQ: u8 = 0x6d;
  pub const I31: u8 = 0x6c;
  pub const STRUCT: u8 = 0x6b;
  pub const ARRAY: u8 = 0x6a;
  pub const EXN: u8 = 0x69;
  pub const SHARED: u8 = 0x65;
  pub const REF: u8 = 0x64;
  pub const REF_NULL: u8 = 0x63;

  pub const FUNC_TYPE: u8 = 0x60;
  pub const STRUCT_TYPE: u8 = 0x5f;
  pub const ARRAY_TYPE: u8 = 0x5e;
  pub const SUB_FINAL: u8 = 0x4f;
  pub const SUB: u8 = 0x50;
  pub const REC_GROUP: u8 = 0x4e;

  pub const BLOCK_VOID: u8 = 0x40;
}

fn abstract_heap_type(byte: u8) -> Option<HeapType> {
  Some(match byte {
    code::FUNC => HeapType::Func,
    code::EXTERN => HeapType::Extern,
    code::ANY => HeapType::Any,
    code::EQ => HeapType::Eq,
    code::I31 => HeapType::I31,
    code::STRUCT => HeapType::Struct,
    code::ARRAY => HeapType::Array,
    code::EXN => HeapType::Exn,
    code::NO_FUNC => HeapType::NoFunc,
    code::NO_EXTERN => HeapType::NoExtern,
    code::NONE => HeapType::None,
    code::NO_EXN => HeapType::NoExn,
    _ => return None,
  })
}

// =============================================================================
// Decoder
// =============================================================================

/// Reads a WebAssembly byte stream. `base` is the absolute offset of
/// `bytes[0]` within the module, so errors from a section or body decoder
/// still point into the whole module.
#[derive(Clone, Debug)]
pub struct Decoder<'a> {
  bytes: &'a [u8],
  pos: usize,
  base: usize,
}

impl<'a> Decoder<'a> {
  pub fn new(bytes: &'a [u8]) -> Self {
    Self::with_base(bytes, 0)
  }

  pub fn with_base(bytes: &'a [u8], base: usize) -> Self {
    Self { bytes, pos: 0, base }
  }

  /// Absolute offset of the next byte.
  #[inline]
  pub fn offset(&self) -> usize {
    self.base + self.pos
  }

  #[inline]
  pub fn done(&self) -> bool {
    self.pos == self.bytes.len()
  }

  #[inline]
  pub fn bytes_remaining(&self) -> usize {
    self.bytes.len() - self.pos
  }

  pub fn error(&self, message: impl Into<String>) -> ValidationError {
    ValidationError::new(self.offset(), message)
  }

  pub fn fail<T>(&self, message: impl Into<String>) -> Result<T> {
    Err(self.error(message))
  }

  // ===========================================================================
  // Raw reads
  // ===========================================================================

  #[inline]
  pub fn peek_u8(&self) -> Option<u8> {
    self.bytes.get(self.pos).copied()
  }

  #[inline]
  pub fn read_u8(&mut self) -> Option<u8> {
    let b = self.peek_u8()?;
    self.pos += 1;
    Some(b)
  }

  pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
    if len > self.bytes_remaining() {
      return None;
    }
    let ret = &self.bytes[self.pos..self.pos + len];
    self.pos += len;
    Some(ret)
  }

  pub fn read_fixed_u32(&mut self) -> Option<u32> {
    let b = self.read_bytes(4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
  }

  pub fn read_fixed_u64(&mut self) -> Option<u64> {
    let b = self.read_bytes(8)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(b);
    Some(u64::from_le_bytes(buf))
  }

  /// Splits off the next `len` bytes as their own decoder.
  pub fn sub(&mut self, len: usize) -> Option<Decoder<'a>> {
    let base = self.offset();
    Some(Decoder::with_base(self.read_bytes(len)?, base))
  }

  /// A length-prefixed UTF-8 string.
  pub fn read_name(&mut self) -> Option<&'a str> {
    let len = self.read_var_u32()?;
    core::str::from_utf8(self.read_bytes(len as usize)?).ok()
  }

  // ===========================================================================
  // LEB128
  // ===========================================================================

  /// Unsigned LEB128 of at most `bits` significant bits. Overlong encodings
  /// and set bits past `bits` are rejected.
  fn read_var_unsigned(&mut self, bits: u32) -> Option<u64> {
    let mut result = 0u64;
    let mut shift = 0u32;
    loop {
      let byte = self.read_u8()?;
      let low = u64::from(byte & 0x7f);
      if shift + 7 >= bits {
        let remaining = bits - shift;
        if byte & 0x80 != 0 || (remaining < 7 && low >> remaining != 0) {
          return None;
        }
        return Some(result | (low << shift));
      }
      result |= low << shift;
      if byte & 0x80 == 0 {
        return Some(result);
      }
      shift += 7;
    }
  }

  /// Signed LEB128 of at most `bits` bits. The unused bits of the last byte
  /// must repeat the sign bit.
  fn read_var_signed(&mut self, bits: u32) -> Option<i64> {
    let mut result = 0i64;
    let mut shift = 0u32;
    loop {
      let byte = self.read_u8()?;
      let low = i64::from(byte & 0x7f);
      if shift + 7 >= bits {
        if byte & 0x80 != 0 {
          return None;
        }
        let remaining = bits - shift;
        let top = (byte & 0x7f) >> (remaining - 1);
        if top != 0 && top != 0x7f >> (remaining - 1) {
          return None;
        }
        result |= low << shift;
        let unused = 64 - bits;
        return Some((result << unused) >> unused);
      }
      result |= low << shift;
      shift += 7;
      if byte & 0x80 == 0 {
        let unused = 64 - shift;
        return Some((result << unused) >> unused);
      }
    }
  }

  pub fn read_var_u32(&mut self) -> Option<u32> {
    self.read_var_unsigned(32).map(|v| v as u32)
  }

  pub fn read_var_u64(&mut self) -> Option<u64> {
    self.read_var_unsigned(64)
  }

  pub fn read_var_s32(&mut self) -> Option<i32> {
    self.read_var_signed(32).map(|v| v as i32)
  }

  /// Block types and heap type indices are encoded as 33-bit signed values.
  pub fn read_var_s33(&mut self) -> Option<i64> {
    self.read_var_signed(33)
  }

  pub fn read_var_s64(&mut self) -> Option<i64> {
    self.read_var_signed(64)
  }

  // ===========================================================================
  // Types
  // ===========================================================================

  /// Reads a heap type. `num_types` bounds concrete type indices.
  pub fn read_heap_type(&mut self, num_types: u32, features: Features) -> Result<HeapType> {
    let Some(byte) = self.peek_u8() else {
      return self.fail("unable to read heap type");
    };
    if byte == code::SHARED {
      return self.fail("shared heap types are not supported");
    }
    if let Some(heap) = abstract_heap_type(byte) {
      self.pos += 1;
      return self.check_heap_type(heap, features);
    }

    if !features.gc {
      return self.fail("invalid heap type");
    }
    match self.read_var_s33() {
      Some(index) if index >= 0 => {
        if index >= i64::from(num_types) {
          return self.fail("type index out of range");
        }
        Ok(HeapType::Concrete(index as u32))
      }
      _ => self.fail("invalid heap type"),
    }
  }

  fn check_heap_type(&self, heap: HeapType, features: Features) -> Result<HeapType> {
    match heap {
      HeapType::Func | HeapType::Extern => Ok(heap),
      HeapType::Exn | HeapType::NoExn if !features.exceptions => self.fail("exceptions not enabled"),
      HeapType::Exn | HeapType::NoExn => Ok(heap),
      _ if !features.gc => self.fail("gc types not enabled"),
      _ => Ok(heap),
    }
  }

  /// Reads a reference type, either a one-byte shorthand or `ref null? ht`.
  pub fn read_ref_type(&mut self, num_types: u32, features: Features) -> Result<RefType> {
    match self.peek_u8() {
      Some(code::REF | code::REF_NULL) => {
        let nullable = self.read_u8() == Some(code::REF_NULL);
        if !nullable && !features.gc {
          return self.fail("non-nullable references not enabled");
        }
        let heap = self.read_heap_type(num_types, features)?;
        Ok(RefType::new(nullable, heap))
      }
      Some(byte) if abstract_heap_type(byte).is_some() => {
        let heap = self.read_heap_type(num_types, features)?;
        Ok(RefType::new(true, heap))
      }
      _ => self.fail("bad type"),
    }
  }

  pub fn read_val_type(&mut self, num_types: u32, features: Features) -> Result<ValType> {
    let ty = match self.peek_u8() {
      Some(code::I32) => ValType::I32,
      Some(code::I64) => ValType::I64,
      Some(code::F32) => ValType::F32,
      Some(code::F64) => ValType::F64,
      Some(code::V128) => return self.fail("SIMD types are not supported"),
      _ => return self.read_ref_type(num_types, features).map(ValType::Ref),
    };
    self.pos += 1;
    Ok(ty)
  }

  pub fn read_storage_type(&mut self, num_types: u32, features: Features) -> Result<StorageType> {
    match self.peek_u8() {
      Some(code::I8) => {
        self.pos += 1;
        Ok(StorageType::I8)
      }
      Some(code::I16) => {
        self.pos += 1;
        Ok(StorageType::I16)
      }
      _ => self.read_val_type(num_types, features).map(StorageType::Val),
    }
  }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn unsigned_leb() {
    assert_eq!(Decoder::new(&[0x00]).read_var_u32(), Some(0));
    assert_eq!(Decoder::new(&[0xe5, 0x8e, 0x26]).read_var_u32(), Some(624_485));
    assert_eq!(Decoder::new(&[0xff, 0xff, 0xff, 0xff, 0x0f]).read_var_u32(), Some(u32::MAX));
    // Bits past 32.
    assert_eq!(Decoder::new(&[0xff, 0xff, 0xff, 0xff, 0x1f]).read_var_u32(), None);
    // Continuation on the fifth byte.
    assert_eq!(Decoder::new(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x00]).read_var_u32(), None);
    // Truncated.
    assert_eq!(Decoder::new(&[0x80]).read_var_u32(), None);
    // Padded but within five bytes.
    assert_eq!(Decoder::new(&[0x81, 0x80, 0x00]).read_var_u32(), Some(1));
  }

  #[test]
  fn signed_leb() {
    assert_eq!(Decoder::new(&[0x7f]).read_var_s32(), Some(-1));
    assert_eq!(Decoder::new(&[0x3f]).read_var_s32(), Some(63));
    assert_eq!(Decoder::new(&[0x40]).read_var_s32(), Some(-64));
    assert_eq!(Decoder::new(&[0xc0, 0xbb, 0x78]).read_var_s32(), Some(-123_456));
    assert_eq!(Decoder::new(&[0x80, 0x80, 0x80, 0x80, 0x78]).read_var_s32(), Some(i32::MIN));
    assert_eq!(Decoder::new(&[0xff, 0xff, 0xff, 0xff, 0x07]).read_var_s32(), Some(i32::MAX));
    // Unused bits disagree with the sign.
    assert_eq!(Decoder::new(&[0xff, 0xff, 0xff, 0xff, 0x4f]).read_var_s32(), None);
    assert_eq!(
      Decoder::new(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x7f]).read_var_s64(),
      Some(i64::MIN)
    );
    assert_eq!(Decoder::new(&[0x40]).read_var_s33(), Some(-64));
  }

  #[test]
  fn names_must_be_utf8() {
    assert_eq!(Decoder::new(&[0x02, b'o', b'k']).read_name(), Some("ok"));
    assert_eq!(Decoder::new(&[0x02, 0xff, 0xfe]).read_name(), None);
    assert_eq!(Decoder::new(&[0x05, b'a']).read_name(), None);
  }

  #[test]
  fn sub_decoders_keep_absolute_offsets() {
    let bytes = [0x01, 0x02, 0x03, 0x04];
    let mut d = Decoder::with_base(&bytes, 100);
    d.read_u8();
    let mut sub = d.sub(2).unwrap();
    assert_eq!(sub.offset(), 101);
    sub.read_u8();
    assert_eq!(sub.error("x").offset, 102);
    assert_eq!(d.offset(), 103);
  }

  #[test]
  fn value_types() {
    let f = Features::ALL;
    assert_eq!(Decoder::new(&[0x7f]).read_val_type(0, f), Ok(ValType::I32));
    assert_eq!(Decoder::new(&[0x70]).read_val_type(0, f), Ok(ValType::Ref(RefType::FUNC)));
    assert_eq!(
      Decoder::new(&[0x64, 0x00]).read_val_type(1, f),
      Ok(ValType::Ref(RefType::new(false, HeapType::Concrete(0))))
    );
    assert!(Decoder::new(&[0x64, 0x01]).read_val_type(1, f).is_err());
    assert!(Decoder::new(&[0x6e]).read_val_type(0, Features::MVP).is_err());
    assert!(Decoder::new(&[0x7b]).read_val_type(0, f).is_err());
    assert!(Decoder::new(&[0x01]).read_val_type(0, f).is_err());
  }
}
