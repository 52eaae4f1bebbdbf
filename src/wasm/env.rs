//! The module environment function bodies are validated against.

use super::types::{FuncType, RefType, TypeContext, ValType};

// =============================================================================
// Limits
// =============================================================================

pub const MAX_TYPES: u32 = 100_000;
pub const MAX_FUNCS: u32 = 1_000_000;
pub const MAX_IMPORTS: u32 = 100_000;
pub const MAX_EXPORTS: u32 = 100_000;
pub const MAX_GLOBALS: u32 = 1_000_000;
pub const MAX_TAGS: u32 = 1_000_000;
pub const MAX_TABLES: u32 = 100_000;
pub const MAX_TABLE_LENGTH: u64 = 10_000_000;
pub const MAX_ELEM_SEGMENTS: u32 = 10_000_000;
pub const MAX_DATA_SEGMENTS: u32 = 100_000;
pub const MAX_DATA_SEGMENT_LENGTH: u32 = 1 << 30;
pub const MAX_LOCALS: u32 = 50_000;
pub const MAX_PARAMS: u32 = 1_000;
pub const MAX_RESULTS: u32 = 1_000;
pub const MAX_STRUCT_FIELDS: u32 = 10_000;
pub const MAX_BR_TABLE_ELEMS: u32 = 1_000_000;
pub const MAX_FUNCTION_BODY_SIZE: u32 = 7_654_321;
pub const MAX_MODULE_BYTES: usize = 1 << 30;

pub const MAX_MEMORY32_PAGES: u64 = 1 << 16;
pub const MAX_MEMORY64_PAGES: u64 = 1 << 48;

// =============================================================================
// Features
// =============================================================================

/// Proposals beyond the MVP that the decoder accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Features {
  /// GC types and instructions, plus typed function references.
  pub gc: bool,
  pub exceptions: bool,
  /// Shared memories and atomic instructions.
  pub threads: bool,
}

impl Features {
  pub const ALL: Self = Self {
    gc: true,
    exceptions: true,
    threads: true,
  };

  pub const MVP: Self = Self {
    gc: false,
    exceptions: false,
    threads: false,
  };
}

impl Default for Features {
  fn default() -> Self {
    Self::ALL
  }
}

// =============================================================================
// Descriptors
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExternKind {
  Func,
  Table,
  Memory,
  Global,
  Tag,
}

#[derive(Clone, Copy, Debug)]
pub struct FuncDesc {
  pub type_index: u32,
  pub imported: bool,
  /// Set once the function is exported or referenced from a segment or
  /// global initializer, which makes `ref.func` legal in bodies.
  pub declared: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct TableDesc {
  pub elem: RefType,
  pub initial: u64,
  pub maximum: Option<u64>,
  pub imported: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct MemoryDesc {
  pub initial: u64,
  pub maximum: Option<u64>,
  pub shared: bool,
  pub index64: bool,
  pub imported: bool,
}

impl MemoryDesc {
  /// Type of addresses, lengths and `memory.size` results.
  pub fn index_type(&self) -> ValType {
    if self.index64 { ValType::I64 } else { ValType::I32 }
  }
}

#[derive(Clone, Copy, Debug)]
pub struct GlobalDesc {
  pub ty: ValType,
  pub mutable: bool,
  pub imported: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct TagDesc {
  pub type_index: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElemMode {
  Active { table: u32 },
  Passive,
  Declared,
}

#[derive(Clone, Copy, Debug)]
pub struct ElemSegment {
  pub mode: ElemMode,
  pub elem_type: RefType,
  pub len: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct DataSegment {
  pub active: bool,
  pub len: u32,
}

#[derive(Clone, Debug)]
pub struct Import {
  pub module: String,
  pub field: String,
  pub kind: ExternKind,
}

#[derive(Clone, Debug)]
pub struct Export {
  pub name: String,
  pub kind: ExternKind,
  pub index: u32,
}

// =============================================================================
// ModuleEnv
// =============================================================================

/// Everything the sections before the code section declare. Built once by
/// the module decoder, then shared read-only by every body validation.
#[derive(Clone, Debug, Default)]
pub struct ModuleEnv {
  pub features: Features,
  pub types: TypeContext,
  pub funcs: Vec<FuncDesc>,
  pub num_func_imports: u32,
  pub tables: Vec<TableDesc>,
  pub memory: Option<MemoryDesc>,
  pub globals: Vec<GlobalDesc>,
  pub tags: Vec<TagDesc>,
  pub imports: Vec<Import>,
  pub exports: Vec<Export>,
  pub start: Option<u32>,
  pub elem_segments: Vec<ElemSegment>,
  pub data_count: Option<u32>,
  pub data_segments: Vec<DataSegment>,
}

impl ModuleEnv {
  pub fn new(features: Features) -> Self {
    Self {
      features,
      ..Self::default()
    }
  }

  pub fn func_type(&self, func_index: u32) -> Option<&FuncType> {
    let desc = self.funcs.get(func_index as usize)?;
    self.types.get(desc.type_index)?.as_func()
  }

  /// Payload types carried by exceptions with this tag.
  pub fn tag_params(&self, tag_index: u32) -> Option<&[ValType]> {
    let desc = self.tags.get(tag_index as usize)?;
    Some(&self.types.get(desc.type_index)?.as_func()?.params)
  }

  pub fn num_defined_funcs(&self) -> u32 {
    self.funcs.len() as u32 - self.num_func_imports
  }
}
