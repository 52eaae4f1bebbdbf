//! Opcode dispatch for function bodies and constant expressions.

use super::{
  decoder::Decoder,
  env::{MAX_LOCALS, ModuleEnv},
  error::Result,
  op_iter::{FieldWideningOp, Op, OpIter},
  types::{RefType, ValType},
};

use super::types::ValType::{F32, F64, I32, I64};

/// Access size and operand type of the seven atomic widths, in encoding order.
const ATOMIC_WIDTHS: [(ValType, u32); 7] = [(I32, 4), (I64, 8), (I32, 1), (I32, 2), (I64, 1), (I64, 2), (I64, 4)];

// =============================================================================
// Function bodies
// =============================================================================

/// Validates the body of the defined function `func_index`. `body` spans the
/// local declarations and the instructions, without the size prefix.
pub fn validate_function_body(env: &ModuleEnv, func_index: u32, mut body: Decoder<'_>) -> Result<()> {
  let Some(ty) = env.func_type(func_index) else {
    return body.fail("function index out of range");
  };
  let mut locals = ty.params.clone();
  decode_locals(env, &mut body, &mut locals)?;

  let mut iter: OpIter<'_> = OpIter::for_function(env, body);
  iter.start_function(func_index, &locals)?;
  validate_ops(&mut iter, &locals)?;
  iter.end_function()
}

fn decode_locals(env: &ModuleEnv, d: &mut Decoder<'_>, locals: &mut Vec<ValType>) -> Result<()> {
  let Some(entries) = d.read_var_u32() else {
    return d.fail("failed to read number of local entries");
  };
  for _ in 0..entries {
    let Some(count) = d.read_var_u32() else {
      return d.fail("failed to read local entry count");
    };
    if locals.len() as u64 + u64::from(count) > u64::from(MAX_LOCALS) {
      return d.fail("too many locals");
    }
    let ty = d.read_val_type(env.types.len(), env.features)?;
    locals.extend(core::iter::repeat_n(ty, count as usize));
  }
  Ok(())
}

fn validate_ops(iter: &mut OpIter<'_>, locals: &[ValType]) -> Result<()> {
  let features = iter.env().features;
  loop {
    let op = iter.read_op()?;
    match op.b0 {
      // Control
      0x00 => iter.read_unreachable(),
      0x01 => iter.read_nop(),
      0x02 => {
        iter.read_block()?;
      }
      0x03 => {
        iter.read_loop()?;
      }
      0x04 => {
        iter.read_if()?;
      }
      0x05 => {
        iter.read_else()?;
      }
      0x06 if features.exceptions => {
        iter.read_try()?;
      }
      0x07 if features.exceptions => {
        iter.read_catch()?;
      }
      0x08 if features.exceptions => {
        iter.read_throw()?;
      }
      0x09 if features.exceptions => {
        iter.read_rethrow()?;
      }
      0x0b => {
        iter.read_end()?;
        iter.pop_end();
        if iter.control_depth() == 0 {
          return Ok(());
        }
      }
      0x0c => {
        iter.read_br()?;
      }
      0x0d => {
        iter.read_br_if()?;
      }
      0x0e => {
        iter.read_br_table()?;
      }
      0x0f => {
        iter.read_return()?;
      }
      0x10 => {
        iter.read_call()?;
      }
      0x11 => {
        iter.read_call_indirect()?;
      }
      0x14 if features.gc => {
        iter.read_call_ref()?;
      }
      0x18 if features.exceptions => {
        iter.read_delegate()?;
        iter.pop_delegate();
      }
      0x19 if features.exceptions => {
        iter.read_catch_all()?;
      }

      // Parametric and variables
      0x1a => {
        iter.read_drop()?;
      }
      0x1b => {
        iter.read_select(false)?;
      }
      0x1c => {
        iter.read_select(true)?;
      }
      0x20 => {
        iter.read_get_local(locals)?;
      }
      0x21 => {
        iter.read_set_local(locals)?;
      }
      0x22 => {
        iter.read_tee_local(locals)?;
      }
      0x23 => {
        iter.read_get_global()?;
      }
      0x24 => {
        iter.read_set_global()?;
      }
      0x25 => {
        iter.read_table_get()?;
      }
      0x26 => {
        iter.read_table_set()?;
      }

      // Memory
      0x28..=0x35 => {
        let (ty, size) = load_shape(op.b0);
        iter.read_load(ty, size)?;
      }
      0x36..=0x3e => {
        let (ty, size) = store_shape(op.b0);
        iter.read_store(ty, size)?;
      }
      0x3f => iter.read_memory_size()?,
      0x40 => {
        iter.read_memory_grow()?;
      }

      // Numeric
      0x41 => {
        iter.read_i32_const()?;
      }
      0x42 => {
        iter.read_i64_const()?;
      }
      0x43 => {
        iter.read_f32_const()?;
      }
      0x44 => {
        iter.read_f64_const()?;
      }
      0x45 => {
        iter.read_conversion(I32, I32)?;
      }
      0x46..=0x4f => {
        iter.read_comparison(I32)?;
      }
      0x50 => {
        iter.read_conversion(I64, I32)?;
      }
      0x51..=0x5a => {
        iter.read_comparison(I64)?;
      }
      0x5b..=0x60 => {
        iter.read_comparison(F32)?;
      }
      0x61..=0x66 => {
        iter.read_comparison(F64)?;
      }
      0x67..=0x69 => {
        iter.read_unary(I32)?;
      }
      0x6a..=0x78 => {
        iter.read_binary(I32)?;
      }
      0x79..=0x7b => {
        iter.read_unary(I64)?;
      }
      0x7c..=0x8a => {
        iter.read_binary(I64)?;
      }
      0x8b..=0x91 => {
        iter.read_unary(F32)?;
      }
      0x92..=0x98 => {
        iter.read_binary(F32)?;
      }
      0x99..=0x9f => {
        iter.read_unary(F64)?;
      }
      0xa0..=0xa6 => {
        iter.read_binary(F64)?;
      }
      0xa7..=0xbf => {
        let (from, to) = conversion_shape(op.b0);
        iter.read_conversion(from, to)?;
      }
      0xc0 | 0xc1 => {
        iter.read_unary(I32)?;
      }
      0xc2..=0xc4 => {
        iter.read_unary(I64)?;
      }

      // References
      0xd0 => {
        iter.read_ref_null()?;
      }
      0xd1 => {
        iter.read_ref_is_null()?;
      }
      0xd2 => {
        iter.read_ref_func()?;
      }
      0xd3 if features.gc => {
        iter.read_comparison(RefType::EQ.into())?;
      }
      0xd4 if features.gc => {
        iter.read_ref_as_non_null()?;
      }
      0xd5 if features.gc => {
        iter.read_br_on_null()?;
      }
      0xd6 if features.gc => {
        iter.read_br_on_non_null()?;
      }

      // Prefixed
      0xfb if features.gc => validate_gc_op(iter, op)?,
      0xfc => validate_misc_op(iter, op)?,
      0xfe if features.threads => validate_thread_op(iter, op)?,

      _ => return iter.unrecognized_opcode(op),
    }
  }
}

fn load_shape(b0: u8) -> (ValType, u32) {
  match b0 {
    0x28 => (I32, 4),
    0x29 => (I64, 8),
    0x2a => (F32, 4),
    0x2b => (F64, 8),
    0x2c | 0x2d => (I32, 1),
    0x2e | 0x2f => (I32, 2),
    0x30 | 0x31 => (I64, 1),
    0x32 | 0x33 => (I64, 2),
    _ => (I64, 4),
  }
}

fn store_shape(b0: u8) -> (ValType, u32) {
  match b0 {
    0x36 => (I32, 4),
    0x37 => (I64, 8),
    0x38 => (F32, 4),
    0x39 => (F64, 8),
    0x3a => (I32, 1),
    0x3b => (I32, 2),
    0x3c => (I64, 1),
    0x3d => (I64, 2),
    _ => (I64, 4),
  }
}

fn conversion_shape(b0: u8) -> (ValType, ValType) {
  match b0 {
    0xa7 => (I64, I32),
    0xa8 | 0xa9 => (F32, I32),
    0xaa | 0xab => (F64, I32),
    0xac | 0xad => (I32, I64),
    0xae | 0xaf => (F32, I64),
    0xb0 | 0xb1 => (F64, I64),
    0xb2 | 0xb3 => (I32, F32),
    0xb4 | 0xb5 => (I64, F32),
    0xb6 => (F64, F32),
    0xb7 | 0xb8 => (I32, F64),
    0xb9 | 0xba => (I64, F64),
    0xbb => (F32, F64),
    0xbc => (F32, I32),
    0xbd => (F64, I64),
    0xbe => (I32, F32),
    _ => (I64, F64),
  }
}

fn validate_gc_op(iter: &mut OpIter<'_>, op: Op) -> Result<()> {
  match op.b1 {
    0 => {
      iter.read_struct_new()?;
    }
    1 => {
      iter.read_struct_new_default()?;
    }
    2 => {
      iter.read_struct_get(FieldWideningOp::None)?;
    }
    3 => {
      iter.read_struct_get(FieldWideningOp::Signed)?;
    }
    4 => {
      iter.read_struct_get(FieldWideningOp::Unsigned)?;
    }
    5 => {
      iter.read_struct_set()?;
    }
    6 => {
      iter.read_array_new()?;
    }
    7 => {
      iter.read_array_new_default()?;
    }
    8 => {
      iter.read_array_new_fixed()?;
    }
    9 => {
      iter.read_array_new_segment(true)?;
    }
    10 => {
      iter.read_array_new_segment(false)?;
    }
    11 => {
      iter.read_array_get(FieldWideningOp::None)?;
    }
    12 => {
      iter.read_array_get(FieldWideningOp::Signed)?;
    }
    13 => {
      iter.read_array_get(FieldWideningOp::Unsigned)?;
    }
    14 => {
      iter.read_array_set()?;
    }
    15 => {
      iter.read_array_len()?;
    }
    16 => {
      iter.read_array_fill()?;
    }
    17 => {
      iter.read_array_copy()?;
    }
    18 => {
      iter.read_array_init_segment(true)?;
    }
    19 => {
      iter.read_array_init_segment(false)?;
    }
    20 | 21 => {
      iter.read_ref_test(op.b1 == 21)?;
    }
    22 | 23 => {
      iter.read_ref_cast(op.b1 == 23)?;
    }
    24 | 25 => {
      iter.read_br_on_cast(op.b1 == 25)?;
    }
    26 => {
      iter.read_ref_conversion(RefType::EXTERN, RefType::ANY)?;
    }
    27 => {
      iter.read_ref_conversion(RefType::ANY, RefType::EXTERN)?;
    }
    28 => {
      iter.read_ref_i31()?;
    }
    29 | 30 => {
      iter.read_i31_get()?;
    }
    _ => return iter.unrecognized_opcode(op),
  }
  Ok(())
}

fn validate_misc_op(iter: &mut OpIter<'_>, op: Op) -> Result<()> {
  match op.b1 {
    0..=7 => {
      let from = if op.b1 & 2 == 0 { F32 } else { F64 };
      let to = if op.b1 < 4 { I32 } else { I64 };
      iter.read_conversion(from, to)?;
    }
    8 => {
      iter.read_mem_or_table_init(true)?;
    }
    9 => {
      iter.read_data_or_elem_drop(true)?;
    }
    10 => {
      iter.read_mem_or_table_copy(true)?;
    }
    11 => iter.read_mem_fill()?,
    12 => {
      iter.read_mem_or_table_init(false)?;
    }
    13 => {
      iter.read_data_or_elem_drop(false)?;
    }
    14 => {
      iter.read_mem_or_table_copy(false)?;
    }
    15 => {
      iter.read_table_grow()?;
    }
    16 => {
      iter.read_table_size()?;
    }
    17 => {
      iter.read_table_fill()?;
    }
    _ => return iter.unrecognized_opcode(op),
  }
  Ok(())
}

fn validate_thread_op(iter: &mut OpIter<'_>, op: Op) -> Result<()> {
  match op.b1 {
    0x00 => {
      iter.read_notify()?;
    }
    0x01 => {
      iter.read_wait(I32, 4)?;
    }
    0x02 => {
      iter.read_wait(I64, 8)?;
    }
    0x03 => iter.read_fence()?,
    0x10..=0x16 => {
      let (ty, size) = ATOMIC_WIDTHS[(op.b1 - 0x10) as usize];
      iter.read_atomic_load(ty, size)?;
    }
    0x17..=0x1d => {
      let (ty, size) = ATOMIC_WIDTHS[(op.b1 - 0x17) as usize];
      iter.read_atomic_store(ty, size)?;
    }
    // add, sub, and, or, xor and xchg, seven widths each.
    0x1e..=0x47 => {
      let (ty, size) = ATOMIC_WIDTHS[((op.b1 - 0x1e) % 7) as usize];
      iter.read_atomic_rmw(ty, size)?;
    }
    0x48..=0x4e => {
      let (ty, size) = ATOMIC_WIDTHS[(op.b1 - 0x48) as usize];
      iter.read_atomic_cmpxchg(ty, size)?;
    }
    _ => return iter.unrecognized_opcode(op),
  }
  Ok(())
}

// =============================================================================
// Constant expressions
// =============================================================================

/// Validates a constant expression at `d`'s cursor producing `expected`, and
/// advances `d` past its `end`. Returns the functions it references with
/// `ref.func`.
pub fn validate_init_expr(
  env: &ModuleEnv,
  d: &mut Decoder<'_>,
  expected: ValType,
  max_initialized_globals: u32,
) -> Result<Vec<u32>> {
  let start = d.offset();
  let mut iter: OpIter<'_> = OpIter::for_init_expr(env, d.clone());
  iter.start_init_expr(expected, max_initialized_globals)?;
  let gc = env.features.gc;
  let mut funcs = Vec::new();

  loop {
    let op = iter.read_op()?;
    match (op.b0, op.b1) {
      (0x0b, _) => {
        iter.read_end()?;
        iter.pop_end();
        break;
      }
      (0x23, _) => {
        iter.read_get_global()?;
      }
      (0x41, _) => {
        iter.read_i32_const()?;
      }
      (0x42, _) => {
        iter.read_i64_const()?;
      }
      (0x43, _) => {
        iter.read_f32_const()?;
      }
      (0x44, _) => {
        iter.read_f64_const()?;
      }
      (0x6a..=0x6c, _) => {
        iter.read_binary(I32)?;
      }
      (0x7c..=0x7e, _) => {
        iter.read_binary(I64)?;
      }
      (0xd0, _) => {
        iter.read_ref_null()?;
      }
      (0xd2, _) => funcs.push(iter.read_ref_func()?),
      (0xfb, 0) if gc => {
        iter.read_struct_new()?;
      }
      (0xfb, 1) if gc => {
        iter.read_struct_new_default()?;
      }
      (0xfb, 6) if gc => {
        iter.read_array_new()?;
      }
      (0xfb, 7) if gc => {
        iter.read_array_new_default()?;
      }
      (0xfb, 8) if gc => {
        iter.read_array_new_fixed()?;
      }
      (0xfb, 26) if gc => {
        iter.read_ref_conversion(RefType::EXTERN, RefType::ANY)?;
      }
      (0xfb, 27) if gc => {
        iter.read_ref_conversion(RefType::ANY, RefType::EXTERN)?;
      }
      (0xfb, 28) if gc => {
        iter.read_ref_i31()?;
      }
      _ => return iter.fail("unrecognized opcode in initializer expression"),
    }
  }

  iter.end_init_expr()?;
  let end = iter.into_decoder().offset();
  d.read_bytes(end - start);
  Ok(funcs)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
  use super::*;
  use crate::wasm::{
    env::{Features, FuncDesc, GlobalDesc, MemoryDesc},
    types::{FuncType, HeapType, TypeDef},
  };

  fn env(params: &[ValType], results: &[ValType]) -> ModuleEnv {
    let mut env = ModuleEnv::new(Features::ALL);
    env.types.push(TypeDef::func(FuncType::new(params, results), 0));
    env.funcs.push(FuncDesc {
      type_index: 0,
      imported: false,
      declared: true,
    });
    env
  }

  fn check(env: &ModuleEnv, body: &[u8]) -> Result<()> {
    validate_function_body(env, 0, Decoder::new(body))
  }

  #[test]
  fn adds_two_constants() {
    let env = env(&[], &[I32]);
    check(&env, &[0x00, 0x41, 0x01, 0x41, 0x02, 0x6a, 0x0b]).unwrap();
  }

  #[test]
  fn unreachable_code_is_polymorphic() {
    let env = env(&[], &[]);
    // unreachable; i64.const 1; i64.add; drop; end
    check(&env, &[0x00, 0x00, 0x42, 0x01, 0x7c, 0x1a, 0x0b]).unwrap();
  }

  #[test]
  fn concrete_operand_still_checked_after_unreachable() {
    let env = env(&[], &[]);
    // unreachable; i32.const 1; i64.add
    let err = check(&env, &[0x00, 0x00, 0x41, 0x01, 0x7c, 0x1a, 0x0b]).unwrap_err();
    assert_eq!(err.message, "type mismatch: expression has type i32 but expected i64");
    assert_eq!(err.offset, 4);
  }

  #[test]
  fn mismatch_reports_opcode_offset() {
    let env = env(&[], &[F64]);
    // i32.const 0; end
    let err = check(&env, &[0x00, 0x41, 0x00, 0x0b]).unwrap_err();
    assert_eq!(err.message, "type mismatch: expression has type i32 but expected f64");
    assert_eq!(err.offset, 3);
  }

  #[test]
  fn branch_arity_is_checked() {
    let mut env = env(&[], &[]);
    env.types.push(TypeDef::func(FuncType::new(&[], &[I32, I32]), 1));
    // block (type 1); block; i32.const 0; br 1; end; unreachable; end; drop; drop; end
    let body = [
      0x00, 0x02, 0x01, 0x02, 0x40, 0x41, 0x00, 0x0c, 0x01, 0x0b, 0x00, 0x0b, 0x1a, 0x1a, 0x0b,
    ];
    let err = check(&env, &body).unwrap_err();
    assert!(err.message.starts_with("popping value from"), "{}", err.message);
    assert_eq!(err.offset, 7);
  }

  #[test]
  fn unused_values_fail_at_end() {
    let env = env(&[], &[]);
    let err = check(&env, &[0x00, 0x41, 0x00, 0x0b]).unwrap_err();
    assert_eq!(err.message, "unused values not explicitly dropped by end of block");
  }

  #[test]
  fn if_without_else_must_not_produce_values() {
    let env = env(&[I32], &[I32]);
    // local.get 0; if (result i32); i32.const 1; end; end
    let err = check(&env, &[0x00, 0x20, 0x00, 0x04, 0x7f, 0x41, 0x01, 0x0b, 0x0b]).unwrap_err();
    assert_eq!(err.message, "if without else with a result value");
  }

  #[test]
  fn br_table_arity_must_agree() {
    let mut env = env(&[], &[]);
    env.types.push(TypeDef::func(FuncType::new(&[], &[I32]), 1));
    // block; block (result i32); i32.const 0; i32.const 0; br_table 0 1 ...
    let body = [
      0x00, 0x02, 0x40, 0x02, 0x7f, 0x41, 0x00, 0x41, 0x00, 0x0e, 0x01, 0x00, 0x01, 0x0b, 0x1a, 0x0b, 0x0b,
    ];
    let err = check(&env, &body).unwrap_err();
    assert_eq!(err.message, "br_table targets must all have the same arity");
  }

  #[test]
  fn non_nullable_local_needs_assignment_in_scope() {
    let env = env(&[], &[]);
    // local (ref 0); block; ref.func 0; local.set 0; end; local.get 0; drop; end
    let body = [
      0x01, 0x01, 0x64, 0x00, 0x02, 0x40, 0xd2, 0x00, 0x21, 0x00, 0x0b, 0x20, 0x00, 0x1a, 0x0b,
    ];
    let err = check(&env, &body).unwrap_err();
    assert_eq!(err.message, "local.get read from unset local");

    // Assigned at function level, the read is fine.
    let body = [0x01, 0x01, 0x64, 0x00, 0xd2, 0x00, 0x21, 0x00, 0x20, 0x00, 0x1a, 0x0b];
    check(&env, &body).unwrap();
  }

  #[test]
  fn memory_ops_need_memory_and_alignment() {
    let mut env = env(&[], &[]);
    // i32.const 0; i32.load align=2^2 offset=0; drop; end
    let body = [0x00, 0x41, 0x00, 0x28, 0x02, 0x00, 0x1a, 0x0b];
    assert_eq!(check(&env, &body).unwrap_err().message, "can't touch memory without memory");

    env.memory = Some(MemoryDesc {
      initial: 1,
      maximum: None,
      shared: false,
      index64: false,
      imported: false,
    });
    check(&env, &body).unwrap();

    let over_aligned = [0x00, 0x41, 0x00, 0x28, 0x03, 0x00, 0x1a, 0x0b];
    assert_eq!(check(&env, &over_aligned).unwrap_err().message, "greater than natural alignment");

    // i32.const 0; i32.atomic.load align=2^1
    let atomic = [0x00, 0x41, 0x00, 0xfe, 0x10, 0x01, 0x00, 0x1a, 0x0b];
    assert_eq!(check(&env, &atomic).unwrap_err().message, "not natural alignment");
  }

  #[test]
  fn disabled_features_are_unrecognized() {
    let mut env = env(&[], &[]);
    env.features = Features::MVP;
    // ref.null any; ref.as_non_null
    let err = check(&env, &[0x00, 0xd0, 0x70, 0xd4, 0x1a, 0x0b]).unwrap_err();
    assert_eq!(err.message, "unrecognized opcode: d4 0");
    let err = check(&env, &[0x00, 0xfd, 0x0c, 0x0b]).unwrap_err();
    assert_eq!(err.message, "unrecognized opcode: fd c");
  }

  #[test]
  fn trailing_bytes_after_final_end() {
    let env = env(&[], &[]);
    let err = check(&env, &[0x00, 0x0b, 0x01]).unwrap_err();
    assert_eq!(err.message, "function body length mismatch");
  }

  #[test]
  fn init_expr_advances_and_collects_funcs() {
    let env = env(&[], &[]);
    let bytes = [0xd2, 0x00, 0x0b, 0xaa];
    let mut d = Decoder::new(&bytes);
    let funcs = validate_init_expr(&env, &mut d, RefType::FUNC.into(), 0).unwrap();
    assert_eq!(funcs, [0]);
    assert_eq!(d.offset(), 3);
    assert_eq!(d.peek_u8(), Some(0xaa));
  }

  #[test]
  fn init_expr_rejects_non_constant_ops() {
    let env = env(&[], &[]);
    let bytes = [0x41, 0x01, 0x45, 0x0b];
    let err = validate_init_expr(&env, &mut Decoder::new(&bytes), I32, 0).unwrap_err();
    assert_eq!(err.message, "unrecognized opcode in initializer expression");
    assert_eq!(err.offset, 2);
  }

  #[test]
  fn init_expr_globals_must_be_immutable_imports() {
    let mut env = env(&[], &[]);
    env.features.gc = false;
    env.globals.push(GlobalDesc {
      ty: I32,
      mutable: false,
      imported: true,
    });
    env.globals.push(GlobalDesc {
      ty: I32,
      mutable: false,
      imported: false,
    });
    validate_init_expr(&env, &mut Decoder::new(&[0x23, 0x00, 0x0b]), I32, 0).unwrap();
    let err = validate_init_expr(&env, &mut Decoder::new(&[0x23, 0x01, 0x0b]), I32, 1).unwrap_err();
    assert_eq!(
      err.message,
      "global.get in initializer expression must reference a global immutable import"
    );

    // With GC, earlier defined globals are fine.
    env.features.gc = true;
    validate_init_expr(&env, &mut Decoder::new(&[0x23, 0x01, 0x0b]), I32, 2).unwrap();
  }

  #[test]
  fn ref_func_in_gc_mode_is_typed_and_non_null() {
    let env = env(&[], &[]);
    let mut iter: OpIter<'_> = OpIter::for_init_expr(&env, Decoder::new(&[0xd2, 0x00, 0x0b]));
    let expected = RefType::new(false, HeapType::Concrete(0)).into();
    iter.start_init_expr(expected, 0).unwrap();
    iter.read_op().unwrap();
    iter.read_ref_func().unwrap();
    iter.read_op().unwrap();
    iter.read_end().unwrap();
  }
}
