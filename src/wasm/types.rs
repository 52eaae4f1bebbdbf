//! Value, reference and composite types, and the subtyping relation between
//! them.

use core::fmt;

// =============================================================================
// Value types
// =============================================================================

/// The heap a reference points into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HeapType {
  Func,
  Extern,
  Any,
  Eq,
  I31,
  Struct,
  Array,
  Exn,
  NoFunc,
  NoExtern,
  None,
  NoExn,
  /// A type defined in the module's type section.
  Concrete(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RefType {
  pub nullable: bool,
  pub heap: HeapType,
}

impl RefType {
  pub const FUNC: Self = Self::new(true, HeapType::Func);
  pub const EXTERN: Self = Self::new(true, HeapType::Extern);
  pub const ANY: Self = Self::new(true, HeapType::Any);
  pub const EQ: Self = Self::new(true, HeapType::Eq);
  pub const I31: Self = Self::new(true, HeapType::I31);
  pub const ARRAY: Self = Self::new(true, HeapType::Array);
  pub const EXN: Self = Self::new(true, HeapType::Exn);

  pub const fn new(nullable: bool, heap: HeapType) -> Self {
    Self { nullable, heap }
  }

  pub const fn with_nullable(self, nullable: bool) -> Self {
    Self::new(nullable, self.heap)
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValType {
  I32,
  I64,
  F32,
  F64,
  Ref(RefType),
}

impl ValType {
  pub const fn is_ref(self) -> bool {
    matches!(self, Self::Ref(_))
  }

  pub const fn as_ref(self) -> Option<RefType> {
    match self {
      Self::Ref(r) => Some(r),
      _ => None,
    }
  }

  /// Whether a local of this type starts out with a usable zero value.
  pub const fn is_defaultable(self) -> bool {
    match self {
      Self::Ref(r) => r.nullable,
      _ => true,
    }
  }
}

impl From<RefType> for ValType {
  fn from(r: RefType) -> Self {
    Self::Ref(r)
  }
}

// =============================================================================
// Composite types
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StorageType {
  I8,
  I16,
  Val(ValType),
}

impl StorageType {
  /// The type a read of this storage produces. Packed storage widens to i32.
  pub const fn unpack(self) -> ValType {
    match self {
      Self::I8 | Self::I16 => ValType::I32,
      Self::Val(v) => v,
    }
  }

  pub const fn is_packed(self) -> bool {
    matches!(self, Self::I8 | Self::I16)
  }

  pub const fn is_defaultable(self) -> bool {
    match self {
      Self::I8 | Self::I16 => true,
      Self::Val(v) => v.is_defaultable(),
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FieldType {
  pub storage: StorageType,
  pub mutable: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct FuncType {
  pub params: Vec<ValType>,
  pub results: Vec<ValType>,
}

impl FuncType {
  pub fn new(params: &[ValType], results: &[ValType]) -> Self {
    Self {
      params: params.to_vec(),
      results: results.to_vec(),
    }
  }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StructType {
  pub fields: Vec<FieldType>,
}

impl StructType {
  pub fn is_defaultable(&self) -> bool {
    self.fields.iter().all(|f| f.storage.is_defaultable())
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ArrayType {
  pub element: FieldType,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CompositeType {
  Func(FuncType),
  Struct(StructType),
  Array(ArrayType),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeDef {
  pub composite: CompositeType,
  pub supertype: Option<u32>,
  pub is_final: bool,
  /// Index of the first type in this definition's recursion group.
  pub rec_group: u32,
}

impl TypeDef {
  /// A final, standalone function type.
  pub fn func(ty: FuncType, index: u32) -> Self {
    Self {
      composite: CompositeType::Func(ty),
      supertype: None,
      is_final: true,
      rec_group: index,
    }
  }

  pub fn as_func(&self) -> Option<&FuncType> {
    match &self.composite {
      CompositeType::Func(f) => Some(f),
      _ => None,
    }
  }

  pub fn as_struct(&self) -> Option<&StructType> {
    match &self.composite {
      CompositeType::Struct(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_array(&self) -> Option<&ArrayType> {
    match &self.composite {
      CompositeType::Array(a) => Some(a),
      _ => None,
    }
  }
}

// =============================================================================
// TypeContext
// =============================================================================

/// The module's type section, with the subtyping queries validation needs.
#[derive(Clone, Debug, Default)]
pub struct TypeContext {
  defs: Vec<TypeDef>,
}

impl TypeContext {
  pub fn len(&self) -> u32 {
    self.defs.len() as u32
  }

  pub fn is_empty(&self) -> bool {
    self.defs.is_empty()
  }

  pub fn get(&self, index: u32) -> Option<&TypeDef> {
    self.defs.get(index as usize)
  }

  pub fn push(&mut self, def: TypeDef) -> u32 {
    self.defs.push(def);
    self.len() - 1
  }

  /// Root of the hierarchy `heap` belongs to: func, extern, any or exn.
  pub fn top(&self, heap: HeapType) -> HeapType {
    match heap {
      HeapType::Func | HeapType::NoFunc => HeapType::Func,
      HeapType::Extern | HeapType::NoExtern => HeapType::Extern,
      HeapType::Exn | HeapType::NoExn => HeapType::Exn,
      HeapType::Any
      | HeapType::Eq
      | HeapType::I31
      | HeapType::Struct
      | HeapType::Array
      | HeapType::None => HeapType::Any,
      HeapType::Concrete(i) => match self.get(i).map(|d| &d.composite) {
        Some(CompositeType::Func(_)) => HeapType::Func,
        _ => HeapType::Any,
      },
    }
  }

  /// Walks the declared supertype chain of `sub`.
  pub fn index_is_subtype(&self, sub: u32, sup: u32) -> bool {
    let mut cur = Some(sub);
    while let Some(i) = cur {
      if i == sup {
        return true;
      }
      cur = self.get(i).and_then(|d| d.supertype);
    }
    false
  }

  pub fn heap_is_subtype(&self, sub: HeapType, sup: HeapType) -> bool {
    if sub == sup {
      return true;
    }
    match (sub, sup) {
      (HeapType::Concrete(a), HeapType::Concrete(b)) => self.index_is_subtype(a, b),
      (HeapType::Concrete(a), _) => match self.get(a).map(|d| &d.composite) {
        Some(CompositeType::Func(_)) => sup == HeapType::Func,
        Some(CompositeType::Struct(_)) => {
          matches!(sup, HeapType::Struct | HeapType::Eq | HeapType::Any)
        }
        Some(CompositeType::Array(_)) => {
          matches!(sup, HeapType::Array | HeapType::Eq | HeapType::Any)
        }
        None => false,
      },
      (HeapType::None, _) => self.top(sup) == HeapType::Any,
      (HeapType::NoFunc, _) => self.top(sup) == HeapType::Func,
      (HeapType::NoExtern, _) => sup == HeapType::Extern,
      (HeapType::NoExn, _) => sup == HeapType::Exn,
      (HeapType::I31 | HeapType::Struct | HeapType::Array, HeapType::Eq | HeapType::Any) => true,
      (HeapType::Eq, HeapType::Any) => true,
      _ => false,
    }
  }

  pub fn ref_is_subtype(&self, sub: RefType, sup: RefType) -> bool {
    (!sub.nullable || sup.nullable) && self.heap_is_subtype(sub.heap, sup.heap)
  }

  pub fn val_is_subtype(&self, sub: ValType, sup: ValType) -> bool {
    match (sub, sup) {
      (ValType::Ref(a), ValType::Ref(b)) => self.ref_is_subtype(a, b),
      _ => sub == sup,
    }
  }

  pub fn storage_is_subtype(&self, sub: StorageType, sup: StorageType) -> bool {
    match (sub, sup) {
      (StorageType::Val(a), StorageType::Val(b)) => self.val_is_subtype(a, b),
      _ => sub == sup,
    }
  }

  /// Mutable fields are invariant, immutable ones covariant.
  pub fn field_is_subtype(&self, sub: FieldType, sup: FieldType) -> bool {
    if sub.mutable != sup.mutable {
      return false;
    }
    if sub.mutable {
      self.storage_is_subtype(sub.storage, sup.storage) && self.storage_is_subtype(sup.storage, sub.storage)
    } else {
      self.storage_is_subtype(sub.storage, sup.storage)
    }
  }

  /// Structural check run when a definition declares a supertype.
  pub fn can_be_subtype_of(&self, sub: &CompositeType, sup: &CompositeType) -> bool {
    match (sub, sup) {
      (CompositeType::Func(a), CompositeType::Func(b)) => {
        a.params.len() == b.params.len()
          && a.results.len() == b.results.len()
          && a.params.iter().zip(&b.params).all(|(x, y)| self.val_is_subtype(*y, *x))
          && a.results.iter().zip(&b.results).all(|(x, y)| self.val_is_subtype(*x, *y))
      }
      (CompositeType::Struct(a), CompositeType::Struct(b)) => {
        a.fields.len() >= b.fields.len()
          && a.fields.iter().zip(&b.fields).all(|(x, y)| self.field_is_subtype(*x, *y))
      }
      (CompositeType::Array(a), CompositeType::Array(b)) => self.field_is_subtype(a.element, b.element),
      _ => false,
    }
  }
}

// =============================================================================
// Display
// =============================================================================

impl fmt::Display for HeapType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Func => "func",
      Self::Extern => "extern",
      Self::Any => "any",
      Self::Eq => "eq",
      Self::I31 => "i31",
      Self::Struct => "struct",
      Self::Array => "array",
      Self::Exn => "exn",
      Self::NoFunc => "nofunc",
      Self::NoExtern => "noextern",
      Self::None => "none",
      Self::NoExn => "noexn",
      Self::Concrete(i) => return write!(f, "{i}"),
    };
    f.write_str(name)
  }
}

impl fmt::Display for RefType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.nullable {
      let short = match self.heap {
        HeapType::Func => Some("funcref"),
        HeapType::Extern => Some("externref"),
        HeapType::Any => Some("anyref"),
        HeapType::Eq => Some("eqref"),
        HeapType::I31 => Some("i31ref"),
        HeapType::Struct => Some("structref"),
        HeapType::Array => Some("arrayref"),
        HeapType::Exn => Some("exnref"),
        HeapType::NoFunc => Some("nullfuncref"),
        HeapType::NoExtern => Some("nullexternref"),
        HeapType::None => Some("nullref"),
        HeapType::NoExn => Some("nullexnref"),
        HeapType::Concrete(_) => None,
      };
      match short {
        Some(s) => f.write_str(s),
        None => write!(f, "(ref null {})", self.heap),
      }
    } else {
      write!(f, "(ref {})", self.heap)
    }
  }
}

impl fmt::Display for ValType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::I32 => f.write_str("i32"),
      Self::I64 => f.write_str("i64"),
      Self::F32 => f.write_str("f32"),
      Self::F64 => f.write_str("f64"),
      Self::Ref(r) => r.fmt(f),
    }
  }
}

impl fmt::Display for StorageType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::I8 => f.write_str("i8"),
      Self::I16 => f.write_str("i16"),
      Self::Val(v) => v.fmt(f),
    }
  }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
  use super::*;

  fn ctx() -> TypeContext {
    let mut types = TypeContext::default();
    // 0: struct { i32 }
    types.push(TypeDef {
      composite: CompositeType::Struct(StructType {
        fields: vec![FieldType {
          storage: StorageType::Val(ValType::I32),
          mutable: false,
        }],
      }),
      supertype: None,
      is_final: false,
      rec_group: 0,
    });
    // 1: struct { i32, i64 } <: 0
    types.push(TypeDef {
      composite: CompositeType::Struct(StructType {
        fields: vec![
          FieldType {
            storage: StorageType::Val(ValType::I32),
            mutable: false,
          },
          FieldType {
            storage: StorageType::Val(ValType::I64),
            mutable: true,
          },
        ],
      }),
      supertype: Some(0),
      is_final: true,
      rec_group: 1,
    });
    // 2: func
    types.push(TypeDef::func(FuncType::new(&[ValType::I32], &[]), 2));
    types
  }

  #[test]
  fn abstract_hierarchy() {
    let types = ctx();
    assert!(types.heap_is_subtype(HeapType::I31, HeapType::Any));
    assert!(types.heap_is_subtype(HeapType::Struct, HeapType::Eq));
    assert!(types.heap_is_subtype(HeapType::None, HeapType::Array));
    assert!(types.heap_is_subtype(HeapType::NoFunc, HeapType::Concrete(2)));
    assert!(!types.heap_is_subtype(HeapType::NoFunc, HeapType::Concrete(0)));
    assert!(!types.heap_is_subtype(HeapType::Any, HeapType::Eq));
    assert!(!types.heap_is_subtype(HeapType::Func, HeapType::Any));
    assert!(!types.heap_is_subtype(HeapType::NoExtern, HeapType::Func));
  }

  #[test]
  fn concrete_types_follow_declared_supertypes() {
    let types = ctx();
    assert!(types.heap_is_subtype(HeapType::Concrete(1), HeapType::Concrete(0)));
    assert!(!types.heap_is_subtype(HeapType::Concrete(0), HeapType::Concrete(1)));
    assert!(types.heap_is_subtype(HeapType::Concrete(1), HeapType::Struct));
    assert!(types.heap_is_subtype(HeapType::Concrete(2), HeapType::Func));
    assert!(!types.heap_is_subtype(HeapType::Concrete(2), HeapType::Any));
  }

  #[test]
  fn nullability_is_covariant() {
    let types = ctx();
    let non_null = RefType::new(false, HeapType::Func);
    assert!(types.ref_is_subtype(non_null, RefType::FUNC));
    assert!(!types.ref_is_subtype(RefType::FUNC, non_null));
    assert!(!types.val_is_subtype(ValType::I32, ValType::I64));
  }

  #[test]
  fn struct_width_subtyping() {
    let types = ctx();
    let a = types.get(0).unwrap().composite.clone();
    let b = types.get(1).unwrap().composite.clone();
    assert!(types.can_be_subtype_of(&b, &a));
    assert!(!types.can_be_subtype_of(&a, &b));
  }

  #[test]
  fn display_names() {
    assert_eq!(ValType::Ref(RefType::FUNC).to_string(), "funcref");
    assert_eq!(ValType::Ref(RefType::new(false, HeapType::Any)).to_string(), "(ref any)");
    assert_eq!(ValType::Ref(RefType::new(true, HeapType::Concrete(3))).to_string(), "(ref null 3)");
    assert_eq!(StorageType::I16.to_string(), "i16");
  }
}
