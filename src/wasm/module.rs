//! Module decoding: the preamble, the section loop and one decoder per
//! section. Function bodies are validated as the code section is read.

use std::collections::HashSet;

use super::{
  decoder::{Decoder, code},
  env::{
    DataSegment, ElemMode, ElemSegment, Export, ExternKind, Features, FuncDesc, GlobalDesc, Import, MAX_DATA_SEGMENT_LENGTH,
    MAX_DATA_SEGMENTS, MAX_ELEM_SEGMENTS, MAX_EXPORTS, MAX_FUNCS, MAX_FUNCTION_BODY_SIZE, MAX_GLOBALS, MAX_IMPORTS,
    MAX_MEMORY32_PAGES, MAX_MEMORY64_PAGES, MAX_MODULE_BYTES, MAX_PARAMS, MAX_RESULTS, MAX_STRUCT_FIELDS,
    MAX_TABLE_LENGTH, MAX_TABLES, MAX_TAGS, MAX_TYPES, MemoryDesc, ModuleEnv, TableDesc, TagDesc,
  },
  error::{Result, ValidationError},
  types::{ArrayType, CompositeType, FieldType, FuncType, HeapType, RefType, StructType, TypeDef, ValType},
  validate::{validate_function_body, validate_init_expr},
};

/// `\0asm`, little-endian.
const MAGIC: u32 = 0x6d73_6100;
const VERSION: u32 = 1;

// =============================================================================
// Sections
// =============================================================================

mod section {
  pub const CUSTOM: u8 = 0;
  pub const TYPE: u8 = 1;
  pub const IMPORT: u8 = 2;
  pub const FUNCTION: u8 = 3;
  pub const TABLE: u8 = 4;
  pub const MEMORY: u8 = 5;
  pub const GLOBAL: u8 = 6;
  pub const EXPORT: u8 = 7;
  pub const START: u8 = 8;
  pub const ELEM: u8 = 9;
  pub const CODE: u8 = 10;
  pub const DATA: u8 = 11;
  pub const DATA_COUNT: u8 = 12;
  pub const TAG: u8 = 13;
}

/// Name and position in the required order. Tags sit between memories and
/// globals, the data count between elements and code.
fn section_info(id: u8, features: Features) -> Option<(&'static str, u8)> {
  Some(match id {
    section::TYPE => ("type", 1),
    section::IMPORT => ("import", 2),
    section::FUNCTION => ("function", 3),
    section::TABLE => ("table", 4),
    section::MEMORY => ("memory", 5),
    section::TAG if features.exceptions => ("tag", 6),
    section::GLOBAL => ("global", 7),
    section::EXPORT => ("export", 8),
    section::START => ("start", 9),
    section::ELEM => ("elem", 10),
    section::DATA_COUNT => ("datacount", 11),
    section::CODE => ("code", 12),
    section::DATA => ("data", 13),
    _ => return None,
  })
}

// =============================================================================
// Entry points
// =============================================================================

/// Decodes and validates a whole module, returning its environment.
pub fn decode_module(bytes: &[u8], features: Features) -> Result<ModuleEnv> {
  if bytes.len() > MAX_MODULE_BYTES {
    return Err(ValidationError::new(0, "module too big"));
  }
  let mut d = Decoder::new(bytes);
  decode_preamble(&mut d)?;

  let mut env = ModuleEnv::new(features);
  let mut last_rank = 0;
  let mut num_bodies = None;
  let mut num_data_segments = None;

  while let Some(id) = d.read_u8() {
    let start = d.offset() - 1;
    if id == section::CUSTOM {
      skip_custom_section(&mut d, start)?;
      continue;
    }

    let Some((name, rank)) = section_info(id, features) else {
      return Err(ValidationError::new(start, format!("unknown section id {id}")));
    };
    if rank <= last_rank {
      return Err(ValidationError::new(start, format!("{name} section out of order")));
    }
    last_rank = rank;

    let Some(mut s) = d.read_var_u32().and_then(|size| d.sub(size as usize)) else {
      return Err(ValidationError::new(start, format!("failed to start {name} section")));
    };
    match id {
      section::TYPE => decode_type_section(&mut s, &mut env)?,
      section::IMPORT => decode_import_section(&mut s, &mut env)?,
      section::FUNCTION => decode_function_section(&mut s, &mut env)?,
      section::TABLE => decode_table_section(&mut s, &mut env)?,
      section::MEMORY => decode_memory_section(&mut s, &mut env)?,
      section::TAG => decode_tag_section(&mut s, &mut env)?,
      section::GLOBAL => decode_global_section(&mut s, &mut env)?,
      section::EXPORT => decode_export_section(&mut s, &mut env)?,
      section::START => decode_start_section(&mut s, &mut env)?,
      section::ELEM => decode_elem_section(&mut s, &mut env)?,
      section::DATA_COUNT => decode_data_count_section(&mut s, &mut env)?,
      section::CODE => num_bodies = Some(decode_code_section(&mut s, &env)?),
      section::DATA => num_data_segments = Some(decode_data_section(&mut s, &mut env)?),
      _ => unreachable!("section_info admitted id {id}"),
    }
    if !s.done() {
      return s.fail(format!("{name} section size mismatch"));
    }
  }

  if num_bodies.is_none() && env.num_defined_funcs() != 0 {
    return d.fail("function body count does not match function signature count");
  }
  if let Some(declared) = env.data_count
    && num_data_segments.unwrap_or(0) != declared
  {
    return d.fail("number of data segments does not match declared count");
  }
  Ok(env)
}

/// Decodes and validates a module, logging the first failure.
pub fn validate(bytes: &[u8], features: Features) -> Result<()> {
  match decode_module(bytes, features) {
    Ok(env) => {
      tracing::trace!(funcs = env.funcs.len(), types = env.types.len(), "validated wasm module");
      Ok(())
    }
    Err(e) => {
      tracing::debug!(offset = e.offset, message = %e.message, "wasm validation failed");
      Err(e)
    }
  }
}

fn decode_preamble(d: &mut Decoder<'_>) -> Result<()> {
  if d.read_fixed_u32() != Some(MAGIC) {
    return Err(ValidationError::new(0, "failed to match magic number"));
  }
  match d.read_fixed_u32() {
    Some(VERSION) => Ok(()),
    Some(v) => d.fail(format!("binary version 0x{v:x} does not match expected version 0x{VERSION:x}")),
    None => d.fail("failed to match binary version"),
  }
}

/// Custom sections, the name section included, are skipped after their name.
fn skip_custom_section(d: &mut Decoder<'_>, start: usize) -> Result<()> {
  let Some(mut s) = d.read_var_u32().and_then(|size| d.sub(size as usize)) else {
    return Err(ValidationError::new(start, "failed to start custom section"));
  };
  if s.read_name().is_none() {
    return s.fail("failed to read custom section name");
  }
  Ok(())
}

fn read_count(d: &mut Decoder<'_>, what: &str) -> Result<u32> {
  match d.read_var_u32() {
    Some(n) => Ok(n),
    None => d.fail(format!("expected number of {what}")),
  }
}

fn check_total(d: &Decoder<'_>, existing: usize, added: u32, limit: u32, what: &str) -> Result<()> {
  if existing as u64 + u64::from(added) > u64::from(limit) {
    return d.fail(format!("too many {what}"));
  }
  Ok(())
}

fn read_val_type(d: &mut Decoder<'_>, env: &ModuleEnv) -> Result<ValType> {
  d.read_val_type(env.types.len(), env.features)
}

fn read_mutability(d: &mut Decoder<'_>) -> Result<bool> {
  match d.read_u8() {
    Some(0) => Ok(false),
    Some(1) => Ok(true),
    Some(_) => d.fail("bad mutability"),
    None => d.fail("expected mutability"),
  }
}

fn declare_funcs(env: &mut ModuleEnv, funcs: Vec<u32>) {
  for f in funcs {
    if let Some(desc) = env.funcs.get_mut(f as usize) {
      desc.declared = true;
    }
  }
}

// =============================================================================
// Types
// =============================================================================

fn decode_type_section(d: &mut Decoder<'_>, env: &mut ModuleEnv) -> Result<()> {
  let groups = read_count(d, "types")?;
  check_total(d, 0, groups, MAX_TYPES, "types")?;
  for _ in 0..groups {
    let group_start = env.types.len();
    if d.peek_u8() == Some(code::REC_GROUP) && env.features.gc {
      d.read_u8();
      let n = read_count(d, "types in recursion group")?;
      check_total(d, group_start as usize, n, MAX_TYPES, "types")?;
      for _ in 0..n {
        decode_sub_type(d, env, group_start, group_start + n)?;
      }
    } else {
      decode_sub_type(d, env, group_start, group_start + 1)?;
    }
  }
  Ok(())
}

/// `bound` is one past the last index visible from this definition: the end
/// of its recursion group.
fn decode_sub_type(d: &mut Decoder<'_>, env: &mut ModuleEnv, group_start: u32, bound: u32) -> Result<()> {
  let index = env.types.len();
  let features = env.features;

  let (supertype, is_final) = match d.peek_u8() {
    Some(form @ (code::SUB | code::SUB_FINAL)) if features.gc => {
      d.read_u8();
      let n = read_count(d, "super types")?;
      if n > 1 {
        return d.fail("too many super types");
      }
      let supertype = if n == 1 {
        match d.read_var_u32() {
          Some(s) if s < index => Some(s),
          Some(_) => return d.fail("invalid super type index"),
          None => return d.fail("expected super type index"),
        }
      } else {
        None
      };
      (supertype, form == code::SUB_FINAL)
    }
    _ => (None, true),
  };

  let composite = match d.read_u8() {
    Some(code::FUNC_TYPE) => CompositeType::Func(decode_func_type(d, env, bound)?),
    Some(code::STRUCT_TYPE) if features.gc => CompositeType::Struct(decode_struct_type(d, env, bound)?),
    Some(code::ARRAY_TYPE) if features.gc => CompositeType::Array(ArrayType {
      element: decode_field_type(d, env, bound)?,
    }),
    _ => return d.fail("expected type form"),
  };

  if let Some(s) = supertype {
    let compatible = env
      .types
      .get(s)
      .is_some_and(|sup| !sup.is_final && env.types.can_be_subtype_of(&composite, &sup.composite));
    if !compatible {
      return d.fail("incompatible super type");
    }
  }

  env.types.push(TypeDef {
    composite,
    supertype,
    is_final,
    rec_group: group_start,
  });
  Ok(())
}

fn decode_func_type(d: &mut Decoder<'_>, env: &ModuleEnv, bound: u32) -> Result<FuncType> {
  let num_params = read_count(d, "function args")?;
  if num_params > MAX_PARAMS {
    return d.fail("too many arguments in signature");
  }
  let params = (0..num_params)
    .map(|_| d.read_val_type(bound, env.features))
    .collect::<Result<Vec<_>>>()?;

  let num_results = read_count(d, "function returns")?;
  if num_results > MAX_RESULTS {
    return d.fail("too many returns in signature");
  }
  let results = (0..num_results)
    .map(|_| d.read_val_type(bound, env.features))
    .collect::<Result<Vec<_>>>()?;

  Ok(FuncType { params, results })
}

fn decode_field_type(d: &mut Decoder<'_>, env: &ModuleEnv, bound: u32) -> Result<FieldType> {
  let storage = d.read_storage_type(bound, env.features)?;
  let mutable = read_mutability(d)?;
  Ok(FieldType { storage, mutable })
}

fn decode_struct_type(d: &mut Decoder<'_>, env: &ModuleEnv, bound: u32) -> Result<StructType> {
  let n = read_count(d, "struct fields")?;
  if n > MAX_STRUCT_FIELDS {
    return d.fail("too many fields in struct");
  }
  let fields = (0..n)
    .map(|_| decode_field_type(d, env, bound))
    .collect::<Result<Vec<_>>>()?;
  Ok(StructType { fields })
}

fn read_func_type_index(d: &mut Decoder<'_>, env: &ModuleEnv) -> Result<u32> {
  let Some(index) = d.read_var_u32() else {
    return d.fail("expected signature index");
  };
  match env.types.get(index) {
    Some(def) if def.as_func().is_some() => Ok(index),
    Some(_) => d.fail("signature index references non-signature"),
    None => d.fail("signature index out of range"),
  }
}

// =============================================================================
// Imports, functions, tables, memories, tags
// =============================================================================

#[derive(Clone, Copy, PartialEq, Eq)]
enum LimitsKind {
  Table,
  Memory,
}

struct Limits {
  initial: u64,
  maximum: Option<u64>,
  shared: bool,
  index64: bool,
}

fn read_length(d: &mut Decoder<'_>, index64: bool) -> Option<u64> {
  if index64 { d.read_var_u64() } else { d.read_var_u32().map(u64::from) }
}

fn decode_limits(d: &mut Decoder<'_>, kind: LimitsKind) -> Result<Limits> {
  let Some(flags) = d.read_u8() else {
    return d.fail("expected flags");
  };
  let allowed = if kind == LimitsKind::Table { 0x1 } else { 0x7 };
  if flags & !allowed != 0 {
    return d.fail(format!("unexpected bits set in flags: {flags}"));
  }
  let has_max = flags & 0x1 != 0;
  let shared = flags & 0x2 != 0;
  let index64 = flags & 0x4 != 0;

  let Some(initial) = read_length(d, index64) else {
    return d.fail("expected initial length");
  };
  let maximum = if has_max {
    match read_length(d, index64) {
      Some(max) if max < initial => return d.fail("maximum length less than initial length"),
      Some(max) => Some(max),
      None => return d.fail("expected maximum length"),
    }
  } else {
    None
  };
  Ok(Limits {
    initial,
    maximum,
    shared,
    index64,
  })
}

fn decode_table_type(d: &mut Decoder<'_>, env: &ModuleEnv, imported: bool) -> Result<TableDesc> {
  let elem = d.read_ref_type(env.types.len(), env.features)?;
  let limits = decode_limits(d, LimitsKind::Table)?;
  if limits.initial > MAX_TABLE_LENGTH {
    return d.fail("too many table elements");
  }
  Ok(TableDesc {
    elem,
    initial: limits.initial,
    maximum: limits.maximum,
    imported,
  })
}

fn decode_memory_type(d: &mut Decoder<'_>, env: &ModuleEnv, imported: bool) -> Result<MemoryDesc> {
  if env.memory.is_some() {
    return d.fail("already have default memory");
  }
  let limits = decode_limits(d, LimitsKind::Memory)?;
  let max_pages = if limits.index64 { MAX_MEMORY64_PAGES } else { MAX_MEMORY32_PAGES };
  if limits.initial > max_pages {
    return d.fail("initial memory size too big");
  }
  if limits.maximum.is_some_and(|max| max > max_pages) {
    return d.fail("maximum memory size too big");
  }
  if limits.shared {
    if !env.features.threads {
      return d.fail("shared memory is disabled");
    }
    if limits.maximum.is_none() {
      return d.fail("maximum length required for shared memory");
    }
  }
  Ok(MemoryDesc {
    initial: limits.initial,
    maximum: limits.maximum,
    shared: limits.shared,
    index64: limits.index64,
    imported,
  })
}

fn decode_tag_type(d: &mut Decoder<'_>, env: &ModuleEnv) -> Result<TagDesc> {
  match d.read_u8() {
    Some(0) => {}
    Some(_) => return d.fail("illegal tag kind"),
    None => return d.fail("expected tag kind"),
  }
  let type_index = read_func_type_index(d, env)?;
  if env.types.get(type_index).and_then(TypeDef::as_func).is_some_and(|f| !f.results.is_empty()) {
    return d.fail("tag function types must not return anything");
  }
  Ok(TagDesc { type_index })
}

fn decode_import_section(d: &mut Decoder<'_>, env: &mut ModuleEnv) -> Result<()> {
  let n = read_count(d, "imports")?;
  check_total(d, 0, n, MAX_IMPORTS, "imports")?;
  for _ in 0..n {
    let Some(module) = d.read_name() else {
      return d.fail("expected valid import module name");
    };
    let Some(field) = d.read_name() else {
      return d.fail("expected valid import field name");
    };
    let kind = match d.read_u8() {
      Some(0) => {
        check_total(d, env.funcs.len(), 1, MAX_FUNCS, "functions")?;
        let type_index = read_func_type_index(d, env)?;
        env.funcs.push(FuncDesc {
          type_index,
          imported: true,
          declared: false,
        });
        env.num_func_imports += 1;
        ExternKind::Func
      }
      Some(1) => {
        check_total(d, env.tables.len(), 1, MAX_TABLES, "tables")?;
        let table = decode_table_type(d, env, true)?;
        env.tables.push(table);
        ExternKind::Table
      }
      Some(2) => {
        env.memory = Some(decode_memory_type(d, env, true)?);
        ExternKind::Memory
      }
      Some(3) => {
        check_total(d, env.globals.len(), 1, MAX_GLOBALS, "globals")?;
        let ty = read_val_type(d, env)?;
        let mutable = read_mutability(d)?;
        env.globals.push(GlobalDesc {
          ty,
          mutable,
          imported: true,
        });
        ExternKind::Global
      }
      Some(4) if env.features.exceptions => {
        check_total(d, env.tags.len(), 1, MAX_TAGS, "tags")?;
        let tag = decode_tag_type(d, env)?;
        env.tags.push(tag);
        ExternKind::Tag
      }
      Some(_) => return d.fail("unsupported import kind"),
      None => return d.fail("failed to read import kind"),
    };
    env.imports.push(Import {
      module: module.to_owned(),
      field: field.to_owned(),
      kind,
    });
  }
  Ok(())
}

fn decode_function_section(d: &mut Decoder<'_>, env: &mut ModuleEnv) -> Result<()> {
  let n = read_count(d, "function definitions")?;
  check_total(d, env.funcs.len(), n, MAX_FUNCS, "functions")?;
  for _ in 0..n {
    let type_index = read_func_type_index(d, env)?;
    env.funcs.push(FuncDesc {
      type_index,
      imported: false,
      declared: false,
    });
  }
  Ok(())
}

fn decode_table_section(d: &mut Decoder<'_>, env: &mut ModuleEnv) -> Result<()> {
  let n = read_count(d, "tables")?;
  check_total(d, env.tables.len(), n, MAX_TABLES, "tables")?;
  for _ in 0..n {
    // 0x40 0x00 announces an initializer expression after the type.
    let has_init = d.peek_u8() == Some(0x40);
    if has_init {
      if !env.features.gc {
        return d.fail("table initializers not enabled");
      }
      d.read_u8();
      if d.read_u8() != Some(0x00) {
        return d.fail("expected zero byte for table initializer");
      }
    }
    let table = decode_table_type(d, env, false)?;
    if has_init {
      let funcs = validate_init_expr(env, d, table.elem.into(), env.globals.len() as u32)?;
      declare_funcs(env, funcs);
    } else if !table.elem.nullable {
      return d.fail("table with non-nullable references requires initializer");
    }
    env.tables.push(table);
  }
  Ok(())
}

fn decode_memory_section(d: &mut Decoder<'_>, env: &mut ModuleEnv) -> Result<()> {
  let n = read_count(d, "memories")?;
  if n > 1 || (n == 1 && env.memory.is_some()) {
    return d.fail("the number of memories must be at most one");
  }
  if n == 1 {
    env.memory = Some(decode_memory_type(d, env, false)?);
  }
  Ok(())
}

fn decode_tag_section(d: &mut Decoder<'_>, env: &mut ModuleEnv) -> Result<()> {
  let n = read_count(d, "tags")?;
  check_total(d, env.tags.len(), n, MAX_TAGS, "tags")?;
  for _ in 0..n {
    let tag = decode_tag_type(d, env)?;
    env.tags.push(tag);
  }
  Ok(())
}

// =============================================================================
// Globals, exports, start
// =============================================================================

fn decode_global_section(d: &mut Decoder<'_>, env: &mut ModuleEnv) -> Result<()> {
  let n = read_count(d, "globals")?;
  check_total(d, env.globals.len(), n, MAX_GLOBALS, "globals")?;
  for _ in 0..n {
    let ty = read_val_type(d, env)?;
    let mutable = read_mutability(d)?;
    let funcs = validate_init_expr(env, d, ty, env.globals.len() as u32)?;
    declare_funcs(env, funcs);
    env.globals.push(GlobalDesc {
      ty,
      mutable,
      imported: false,
    });
  }
  Ok(())
}

fn decode_export_section(d: &mut Decoder<'_>, env: &mut ModuleEnv) -> Result<()> {
  let n = read_count(d, "exports")?;
  check_total(d, 0, n, MAX_EXPORTS, "exports")?;
  let mut names = HashSet::new();
  for _ in 0..n {
    let Some(name) = d.read_name() else {
      return d.fail("expected valid export name");
    };
    if !names.insert(name) {
      return d.fail("duplicate export");
    }
    let Some(kind) = d.read_u8() else {
      return d.fail("failed to read export kind");
    };
    let Some(index) = d.read_var_u32() else {
      return d.fail("expected export internal index");
    };
    let i = index as usize;
    let kind = match kind {
      0 if i < env.funcs.len() => {
        env.funcs[i].declared = true;
        ExternKind::Func
      }
      0 => return d.fail("exported function index out of bounds"),
      1 if i < env.tables.len() => ExternKind::Table,
      1 => return d.fail("exported table index out of bounds"),
      2 if i == 0 && env.memory.is_some() => ExternKind::Memory,
      2 => return d.fail("exported memory index out of bounds"),
      3 if i < env.globals.len() => ExternKind::Global,
      3 => return d.fail("exported global index out of bounds"),
      4 if env.features.exceptions && i < env.tags.len() => ExternKind::Tag,
      4 if env.features.exceptions => return d.fail("exported tag index out of bounds"),
      _ => return d.fail("unexpected export kind"),
    };
    env.exports.push(Export {
      name: name.to_owned(),
      kind,
      index,
    });
  }
  Ok(())
}

fn decode_start_section(d: &mut Decoder<'_>, env: &mut ModuleEnv) -> Result<()> {
  let Some(func) = d.read_var_u32() else {
    return d.fail("failed to read start func index");
  };
  let Some(ty) = env.func_type(func) else {
    return d.fail("unknown start function");
  };
  if !ty.params.is_empty() {
    return d.fail("start function must be nullary");
  }
  if !ty.results.is_empty() {
    return d.fail("start function must not return anything");
  }
  env.start = Some(func);
  Ok(())
}

// =============================================================================
// Element and data segments
// =============================================================================

mod elem_flags {
  /// Passive or declared rather than active.
  pub const PASSIVE_OR_DECLARED: u32 = 0x1;
  /// Explicit table index when active, declared when not.
  pub const TABLE_INDEX_OR_DECLARED: u32 = 0x2;
  /// Initializer expressions instead of function indices.
  pub const EXPRESSIONS: u32 = 0x4;
  pub const ALL: u32 = 0x7;
}

fn decode_elem_section(d: &mut Decoder<'_>, env: &mut ModuleEnv) -> Result<()> {
  let n = read_count(d, "segments")?;
  check_total(d, 0, n, MAX_ELEM_SEGMENTS, "segments")?;
  for _ in 0..n {
    let segment = decode_elem_segment(d, env)?;
    env.elem_segments.push(segment);
  }
  Ok(())
}

fn decode_elem_segment(d: &mut Decoder<'_>, env: &mut ModuleEnv) -> Result<ElemSegment> {
  let Some(flags) = d.read_var_u32() else {
    return d.fail("expected elem segment flags field");
  };
  if flags & !elem_flags::ALL != 0 {
    return d.fail("invalid elem segment flags field");
  }
  let expressions = flags & elem_flags::EXPRESSIONS != 0;

  let mode = if flags & elem_flags::PASSIVE_OR_DECLARED != 0 {
    if flags & elem_flags::TABLE_INDEX_OR_DECLARED != 0 {
      ElemMode::Declared
    } else {
      ElemMode::Passive
    }
  } else {
    let table = if flags & elem_flags::TABLE_INDEX_OR_DECLARED != 0 {
      match d.read_var_u32() {
        Some(t) => t,
        None => return d.fail("expected table index"),
      }
    } else {
      0
    };
    if table as usize >= env.tables.len() {
      return d.fail("table index out of range for element segment");
    }
    let funcs = validate_init_expr(env, d, ValType::I32, env.globals.len() as u32)?;
    declare_funcs(env, funcs);
    ElemMode::Active { table }
  };

  // Flags 0 and 4 leave the element type implicit.
  let explicit_type = flags & (elem_flags::PASSIVE_OR_DECLARED | elem_flags::TABLE_INDEX_OR_DECLARED) != 0;
  let elem_type = match (expressions, explicit_type) {
    (true, true) => d.read_ref_type(env.types.len(), env.features)?,
    (true, false) => RefType::FUNC,
    (false, true) => match d.read_u8() {
      Some(0) => RefType::new(false, HeapType::Func),
      Some(_) => return d.fail("invalid elem kind"),
      None => return d.fail("expected elem kind"),
    },
    (false, false) => RefType::new(false, HeapType::Func),
  };

  if let ElemMode::Active { table } = mode
    && !env.types.ref_is_subtype(elem_type, env.tables[table as usize].elem)
  {
    return d.fail("segment's element type must be subtype of table's element type");
  }

  let Some(len) = d.read_var_u32() else {
    return d.fail("expected segment size");
  };
  if u64::from(len) > MAX_TABLE_LENGTH {
    return d.fail("too many table elements");
  }
  for _ in 0..len {
    if expressions {
      let funcs = validate_init_expr(env, d, elem_type.into(), env.globals.len() as u32)?;
      declare_funcs(env, funcs);
      continue;
    }
    match d.read_var_u32() {
      Some(f) if (f as usize) < env.funcs.len() => env.funcs[f as usize].declared = true,
      Some(_) => return d.fail("element function index out of range"),
      None => return d.fail("failed to read element function index"),
    }
  }

  Ok(ElemSegment { mode, elem_type, len })
}

fn decode_data_count_section(d: &mut Decoder<'_>, env: &mut ModuleEnv) -> Result<()> {
  let Some(count) = d.read_var_u32() else {
    return d.fail("expected data segment count");
  };
  if count > MAX_DATA_SEGMENTS {
    return d.fail("too many data segments");
  }
  env.data_count = Some(count);
  Ok(())
}

fn decode_data_section(d: &mut Decoder<'_>, env: &mut ModuleEnv) -> Result<u32> {
  let n = read_count(d, "data segments")?;
  check_total(d, 0, n, MAX_DATA_SEGMENTS, "data segments")?;
  if env.data_count.is_some_and(|declared| declared != n) {
    return d.fail("number of data segments does not match declared count");
  }

  for _ in 0..n {
    let active = match d.read_var_u32() {
      Some(0) => true,
      Some(1) => false,
      Some(2) => {
        if d.read_var_u32() != Some(0) {
          return d.fail("memory index must be zero");
        }
        true
      }
      Some(_) => return d.fail("invalid data segment flags"),
      None => return d.fail("failed to read data segment flags"),
    };
    if active {
      let Some(memory) = env.memory else {
        return d.fail("data segment requires a memory section");
      };
      validate_init_expr(env, d, memory.index_type(), env.globals.len() as u32)?;
    }

    let Some(len) = d.read_var_u32() else {
      return d.fail("expected segment size");
    };
    if len > MAX_DATA_SEGMENT_LENGTH {
      return d.fail("segment size too big");
    }
    if d.read_bytes(len as usize).is_none() {
      return d.fail("data segment shorter than declared");
    }
    env.data_segments.push(DataSegment { active, len });
  }
  Ok(n)
}

// =============================================================================
// Code
// =============================================================================

fn decode_code_section(d: &mut Decoder<'_>, env: &ModuleEnv) -> Result<u32> {
  let n = read_count(d, "function bodies")?;
  if n != env.num_defined_funcs() {
    return d.fail("function body count does not match function signature count");
  }
  for i in 0..n {
    let Some(size) = d.read_var_u32() else {
      return d.fail("expected body size");
    };
    if size > MAX_FUNCTION_BODY_SIZE {
      return d.fail("function body too big");
    }
    let Some(body) = d.sub(size as usize) else {
      return d.fail("function body length too big");
    };
    validate_function_body(env, env.num_func_imports + i, body)?;
  }
  Ok(n)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
  use super::*;

  const HEADER: [u8; 8] = [0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00];

  fn module(sections: &[(u8, &[u8])]) -> Vec<u8> {
    let mut bytes = HEADER.to_vec();
    for (id, payload) in sections {
      bytes.push(*id);
      bytes.push(payload.len() as u8);
      bytes.extend_from_slice(payload);
    }
    bytes
  }

  #[test]
  fn empty_module() {
    let env = decode_module(&HEADER, Features::ALL).unwrap();
    assert!(env.funcs.is_empty());
    assert!(env.memory.is_none());
  }

  #[test]
  fn bad_preamble() {
    let err = decode_module(b"\0asn\x01\0\0\0", Features::ALL).unwrap_err();
    assert_eq!(err.message, "failed to match magic number");
    let err = decode_module(b"\0asm\x02\0\0\0", Features::ALL).unwrap_err();
    assert_eq!(err.message, "binary version 0x2 does not match expected version 0x1");
  }

  #[test]
  fn sections_must_be_ordered() {
    // memory section before a function section
    let bytes = module(&[(section::MEMORY, &[0x01, 0x00, 0x01]), (section::FUNCTION, &[0x00])]);
    let err = decode_module(&bytes, Features::ALL).unwrap_err();
    assert_eq!(err.message, "function section out of order");
    assert_eq!(err.offset, 13);
  }

  #[test]
  fn custom_sections_are_skipped_anywhere() {
    let bytes = module(&[
      (section::CUSTOM, &[0x04, b'n', b'a', b'm', b'e', 0xff]),
      (section::MEMORY, &[0x01, 0x00, 0x01]),
      (section::CUSTOM, &[0x01, b'x']),
    ]);
    let env = decode_module(&bytes, Features::ALL).unwrap();
    assert_eq!(env.memory.map(|m| m.initial), Some(1));
  }

  #[test]
  fn section_size_mismatch() {
    // one memory, but two trailing bytes
    let bytes = module(&[(section::MEMORY, &[0x01, 0x00, 0x01, 0x00, 0x00])]);
    let err = decode_module(&bytes, Features::ALL).unwrap_err();
    assert_eq!(err.message, "memory section size mismatch");
  }

  #[test]
  fn tag_section_needs_exceptions() {
    let bytes = module(&[(section::TAG, &[0x00])]);
    decode_module(&bytes, Features::ALL).unwrap();
    let err = decode_module(&bytes, Features::MVP).unwrap_err();
    assert_eq!(err.message, "unknown section id 13");
  }

  #[test]
  fn shared_memory_limits() {
    let bytes = module(&[(section::MEMORY, &[0x01, 0x02, 0x01])]);
    let err = decode_module(&bytes, Features::ALL).unwrap_err();
    assert_eq!(err.message, "maximum length required for shared memory");

    let bytes = module(&[(section::MEMORY, &[0x01, 0x03, 0x01, 0x02])]);
    assert!(decode_module(&bytes, Features::ALL).unwrap().memory.unwrap().shared);
    let err = decode_module(&bytes, Features::MVP).unwrap_err();
    assert_eq!(err.message, "shared memory is disabled");
  }

  #[test]
  fn missing_code_section() {
    let bytes = module(&[(section::TYPE, &[0x01, 0x60, 0x00, 0x00]), (section::FUNCTION, &[0x01, 0x00])]);
    let err = decode_module(&bytes, Features::ALL).unwrap_err();
    assert_eq!(err.message, "function body count does not match function signature count");
  }

  #[test]
  fn supertype_must_precede_and_be_open() {
    // rec group of two structs, the second declaring the first (final) as super
    let payload = [
      0x01, 0x4e, 0x02, // one rec group of two
      0x5f, 0x00, // struct {}
      0x50, 0x01, 0x00, 0x5f, 0x00, // sub 0 struct {}
    ];
    let bytes = module(&[(section::TYPE, &payload)]);
    let err = decode_module(&bytes, Features::ALL).unwrap_err();
    assert_eq!(err.message, "incompatible super type");

    let payload = [0x02, 0x50, 0x00, 0x5f, 0x00, 0x50, 0x01, 0x00, 0x5f, 0x00];
    let env = decode_module(&module(&[(section::TYPE, &payload)]), Features::ALL).unwrap();
    assert_eq!(env.types.get(1).and_then(|t| t.supertype), Some(0));

    let payload = [0x01, 0x50, 0x01, 0x00, 0x5f, 0x00];
    let err = decode_module(&module(&[(section::TYPE, &payload)]), Features::ALL).unwrap_err();
    assert_eq!(err.message, "invalid super type index");
  }
}
