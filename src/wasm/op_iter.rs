//! Operand and control stack state machine for a single function body or
//! constant expression.
//!
//! [`OpIter`] decodes one instruction at a time. The caller reads an opcode
//! with [`OpIter::read_op`] and then calls the `read_*` method for that
//! opcode's family, which consumes immediates, pops and type checks operands
//! and pushes results. Each value slot carries a policy supplied payload so a
//! compiler can ride on the same iterator; [`ValidatingPolicy`] carries none.

use core::marker::PhantomData;

use super::{
  decoder::{Decoder, code},
  env::{MAX_BR_TABLE_ELEMS, ModuleEnv},
  error::{Result, ValidationError},
  types::{ArrayType, FieldType, FuncType, HeapType, RefType, StorageType, StructType, TypeDef, ValType},
};

/// Upper bound on `array.new_fixed` operands.
pub const MAX_ARRAY_NEW_FIXED_ELEMS: u32 = 10_000;

// =============================================================================
// Policy
// =============================================================================

/// Payload types carried alongside the validator's own state.
pub trait OpIterPolicy {
  /// Attached to every operand stack slot.
  type Value: Copy + Default;
  /// Attached to every control stack entry.
  type ControlItem: Default;
}

/// Pure validation, no payloads.
#[derive(Clone, Copy, Debug, Default)]
pub struct ValidatingPolicy;

impl OpIterPolicy for ValidatingPolicy {
  type Value = ();
  type ControlItem = ();
}

// =============================================================================
// Stack types
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LabelKind {
  Body,
  Block,
  Loop,
  Then,
  Else,
  Try,
  Catch,
  CatchAll,
}

/// Type of an operand stack slot. `Bottom` stands for a value produced in
/// unreachable code and matches any expected type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StackType {
  Bottom,
  Val(ValType),
}

impl StackType {
  pub fn is_bottom(self) -> bool {
    self == Self::Bottom
  }

  /// Bottom counts as non-nullable, the most permissive reading.
  pub fn is_nullable_as_operand(self) -> bool {
    matches!(self, Self::Val(ValType::Ref(r)) if r.nullable)
  }

  fn is_valid_for_untyped_select(self) -> bool {
    match self {
      Self::Bottom => true,
      Self::Val(v) => !v.is_ref(),
    }
  }

  fn as_non_nullable(self) -> Self {
    match self {
      Self::Val(ValType::Ref(r)) => Self::Val(ValType::Ref(r.with_nullable(false))),
      other => other,
    }
  }
}

#[derive(Clone, Copy, Debug)]
pub struct TypeAndValue<V> {
  pub ty: StackType,
  pub value: V,
}

impl<V: Default> TypeAndValue<V> {
  fn new(ty: StackType) -> Self {
    Self {
      ty,
      value: V::default(),
    }
  }
}

/// A sequence of value types, borrowed from the module or held inline.
#[derive(Clone, Copy, Debug)]
pub enum ResultType<'a> {
  Empty,
  Single(ValType),
  Vector(&'a [ValType]),
}

impl ResultType<'_> {
  pub fn len(&self) -> usize {
    match self {
      Self::Empty => 0,
      Self::Single(_) => 1,
      Self::Vector(v) => v.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Panics when `i` is out of range.
  pub fn get(&self, i: usize) -> ValType {
    match self {
      Self::Single(v) if i == 0 => *v,
      Self::Vector(v) => v[i],
      _ => panic!("result type index {i} out of range"),
    }
  }

  pub fn iter(&self) -> impl Iterator<Item = ValType> + '_ {
    (0..self.len()).map(|i| self.get(i))
  }
}

impl PartialEq for ResultType<'_> {
  fn eq(&self, other: &Self) -> bool {
    self.len() == other.len() && self.iter().zip(other.iter()).all(|(a, b)| a == b)
  }
}

#[derive(Clone, Copy, Debug)]
pub struct BlockType<'a> {
  pub params: ResultType<'a>,
  pub results: ResultType<'a>,
}

impl<'a> BlockType<'a> {
  pub fn void() -> Self {
    Self {
      params: ResultType::Empty,
      results: ResultType::Empty,
    }
  }

  pub fn single(result: ValType) -> Self {
    Self {
      params: ResultType::Empty,
      results: ResultType::Single(result),
    }
  }

  pub fn func(ty: &'a FuncType) -> Self {
    Self {
      params: ResultType::Vector(&ty.params),
      results: ResultType::Vector(&ty.results),
    }
  }

  /// A function body: parameters live in locals, not on the stack.
  pub fn func_results(ty: &'a FuncType) -> Self {
    Self {
      params: ResultType::Empty,
      results: ResultType::Vector(&ty.results),
    }
  }
}

// =============================================================================
// Control stack
// =============================================================================

#[derive(Debug)]
pub struct ControlEntry<'a, C> {
  kind: LabelKind,
  ty: BlockType<'a>,
  /// Operand stack length below this block's parameters.
  base: usize,
  /// Set once the rest of the block is unreachable.
  polymorphic_base: bool,
  pub item: C,
}

impl<'a, C> ControlEntry<'a, C> {
  pub fn kind(&self) -> LabelKind {
    self.kind
  }

  pub fn block_type(&self) -> BlockType<'a> {
    self.ty
  }

  /// What a branch to this label carries: a loop is re-entered at the top.
  pub fn branch_target_type(&self) -> ResultType<'a> {
    if self.kind == LabelKind::Loop {
      self.ty.params
    } else {
      self.ty.results
    }
  }

  pub fn value_stack_base(&self) -> usize {
    self.base
  }

  pub fn polymorphic_base(&self) -> bool {
    self.polymorphic_base
  }

  fn switch_to(&mut self, kind: LabelKind) {
    self.kind = kind;
    self.polymorphic_base = false;
  }
}

// =============================================================================
// Unset locals
// =============================================================================

const WORD_BITS: usize = u32::BITS as usize;

/// Non-defaultable locals that have not been assigned on every path to the
/// current point. Assignments are logged with the control depth they happened
/// at and rolled back when that block ends.
#[derive(Debug, Default)]
struct UnsetLocals {
  /// One bit per local from `first_non_default` on.
  bits: Vec<u32>,
  /// `(depth, local - first_non_default)` per assignment.
  set_stack: Vec<(u32, u32)>,
  first_non_default: u32,
}

impl UnsetLocals {
  fn init(&mut self, locals: &[ValType], num_params: usize) {
    self.bits.clear();
    self.set_stack.clear();
    self.first_non_default = u32::MAX;

    let declared = locals.get(num_params..).unwrap_or_default();
    let Some(pos) = declared.iter().position(|t| !t.is_defaultable()) else {
      return;
    };
    let tracked = &declared[pos..];
    self.bits = vec![0; tracked.len().div_ceil(WORD_BITS)];
    for (i, ty) in tracked.iter().enumerate() {
      if !ty.is_defaultable() {
        self.bits[i / WORD_BITS] |= 1 << (i % WORD_BITS);
      }
    }
    self.set_stack.reserve(tracked.len());
    self.first_non_default = (num_params + pos) as u32;
  }

  #[inline]
  fn is_unset(&self, id: u32) -> bool {
    if id < self.first_non_default {
      return false;
    }
    let i = (id - self.first_non_default) as usize;
    self.bits[i / WORD_BITS] & (1 << (i % WORD_BITS)) != 0
  }

  fn set(&mut self, id: u32, depth: u32) {
    debug_assert!(self.is_unset(id));
    let i = (id - self.first_non_default) as usize;
    self.bits[i / WORD_BITS] ^= 1 << (i % WORD_BITS);
    self.set_stack.push((depth, i as u32));
  }

  fn reset_to_block(&mut self, depth: u32) {
    while let Some(&(d, i)) = self.set_stack.last() {
      if d <= depth {
        break;
      }
      let i = i as usize;
      debug_assert!(self.bits[i / WORD_BITS] & (1 << (i % WORD_BITS)) == 0);
      self.bits[i / WORD_BITS] |= 1 << (i % WORD_BITS);
      self.set_stack.pop();
    }
  }

  fn is_empty(&self) -> bool {
    self.set_stack.is_empty()
  }
}

// =============================================================================
// Immediates
// =============================================================================

/// An opcode, with the secondary opcode of prefixed instructions in `b1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Op {
  pub b0: u8,
  pub b1: u32,
}

pub const fn is_prefix_byte(b: u8) -> bool {
  b >= 0xfb
}

#[derive(Clone, Copy, Debug)]
pub struct LinearMemoryAddress<V> {
  pub base: V,
  pub offset: u64,
  pub align: u32,
}

/// How a packed field or element is widened on read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldWideningOp {
  None,
  Signed,
  Unsigned,
}

/// What `end` closed.
#[derive(Debug)]
pub struct BlockEnd<V> {
  pub kind: LabelKind,
  pub results: Vec<V>,
  /// For an `if` without `else`, the parameters the implicit else passes on.
  pub empty_else_results: Vec<V>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum IterKind {
  Func,
  InitExpr,
}

// =============================================================================
// OpIter
// =============================================================================

pub struct OpIter<'a, P: OpIterPolicy = ValidatingPolicy> {
  kind: IterKind,
  env: &'a ModuleEnv,
  d: Decoder<'a>,
  value_stack: Vec<TypeAndValue<P::Value>>,
  /// Parameters of open `if` blocks, restored when `else` starts.
  else_param_stack: Vec<TypeAndValue<P::Value>>,
  control_stack: Vec<ControlEntry<'a, P::ControlItem>>,
  unset_locals: UnsetLocals,
  /// In constant expressions, globals below this index may be read.
  max_initialized_globals: u32,
  last_op_offset: usize,
  _policy: PhantomData<P>,
}

impl<'a, P: OpIterPolicy> OpIter<'a, P> {
  fn new(kind: IterKind, env: &'a ModuleEnv, d: Decoder<'a>) -> Self {
    let last_op_offset = d.offset();
    Self {
      kind,
      env,
      d,
      value_stack: Vec::new(),
      else_param_stack: Vec::new(),
      control_stack: Vec::new(),
      unset_locals: UnsetLocals::default(),
      max_initialized_globals: 0,
      last_op_offset,
      _policy: PhantomData,
    }
  }

  /// Iterator over a function body spanning all of `d`.
  pub fn for_function(env: &'a ModuleEnv, d: Decoder<'a>) -> Self {
    Self::new(IterKind::Func, env, d)
  }

  /// Iterator over a constant expression starting at `d`'s cursor.
  pub fn for_init_expr(env: &'a ModuleEnv, d: Decoder<'a>) -> Self {
    Self::new(IterKind::InitExpr, env, d)
  }

  /// Hands back the decoder, positioned after whatever was consumed.
  pub fn into_decoder(self) -> Decoder<'a> {
    self.d
  }

  pub fn env(&self) -> &'a ModuleEnv {
    self.env
  }

  pub fn last_opcode_offset(&self) -> usize {
    self.last_op_offset
  }

  pub fn control_depth(&self) -> u32 {
    self.control_stack.len() as u32
  }

  /// The label `relative_depth` blocks out from the innermost one.
  pub fn control(&self, relative_depth: u32) -> &ControlEntry<'a, P::ControlItem> {
    &self.control_stack[self.control_stack.len() - 1 - relative_depth as usize]
  }

  pub fn control_kind(&self, relative_depth: u32) -> LabelKind {
    self.control(relative_depth).kind
  }

  pub fn control_item(&mut self, relative_depth: u32) -> &mut P::ControlItem {
    let len = self.control_stack.len();
    &mut self.control_stack[len - 1 - relative_depth as usize].item
  }

  /// Replaces the payload of the value on top of the stack.
  pub fn set_result(&mut self, value: P::Value) {
    if let Some(top) = self.value_stack.last_mut() {
      top.value = value;
    }
  }

  // ===========================================================================
  // Failure
  // ===========================================================================

  /// Fails at the offset of the last opcode read.
  pub fn fail<T>(&self, message: impl Into<String>) -> Result<T> {
    Err(ValidationError::new(self.last_op_offset, message))
  }

  fn at_op(&self, e: ValidationError) -> ValidationError {
    ValidationError::new(self.last_op_offset, e.message)
  }

  fn fail_empty_stack<T>(&self) -> Result<T> {
    if self.value_stack.is_empty() {
      self.fail("popping value from empty stack")
    } else {
      self.fail("popping value from outside block")
    }
  }

  pub fn unrecognized_opcode<T>(&self, op: Op) -> Result<T> {
    let b1 = if is_prefix_byte(op.b0) { op.b1 } else { 0 };
    self.fail(format!("unrecognized opcode: {:x} {:x}", op.b0, b1))
  }

  fn check_is_subtype_of(&self, actual: ValType, expected: ValType) -> Result<()> {
    if self.env.types.val_is_subtype(actual, expected) {
      return Ok(());
    }
    self.fail(format!("type mismatch: expression has type {actual} but expected {expected}"))
  }

  // ===========================================================================
  // Immediates
  // ===========================================================================

  fn read_var_u32(&mut self, message: &str) -> Result<u32> {
    match self.d.read_var_u32() {
      Some(v) => Ok(v),
      None => self.fail(message),
    }
  }

  fn read_fixed_u8(&mut self, message: &str) -> Result<u8> {
    match self.d.read_u8() {
      Some(v) => Ok(v),
      None => self.fail(message),
    }
  }

  fn read_val_type(&mut self) -> Result<ValType> {
    let env = self.env;
    self.d.read_val_type(env.types.len(), env.features).map_err(|e| self.at_op(e))
  }

  fn read_heap_type(&mut self) -> Result<HeapType> {
    let env = self.env;
    self.d.read_heap_type(env.types.len(), env.features).map_err(|e| self.at_op(e))
  }

  fn read_block_type(&mut self) -> Result<BlockType<'a>> {
    let Some(byte) = self.d.peek_u8() else {
      return self.fail("unable to read block type");
    };
    if byte == code::BLOCK_VOID {
      self.d.read_u8();
      return Ok(BlockType::void());
    }
    // Single-byte negative values are value types.
    if byte & 0xc0 == 0x40 {
      return Ok(BlockType::single(self.read_val_type()?));
    }

    let env = self.env;
    match self.d.read_var_s33() {
      Some(x) if x >= 0 && x < i64::from(env.types.len()) => {
        match env.types.get(x as u32).and_then(TypeDef::as_func) {
          Some(f) => Ok(BlockType::func(f)),
          None => self.fail("block type type index must be func type"),
        }
      }
      _ => self.fail("invalid block type type index"),
    }
  }

  fn read_type_index(&mut self) -> Result<(u32, &'a TypeDef)> {
    let index = self.read_var_u32("unable to read type index")?;
    let env = self.env;
    match env.types.get(index) {
      Some(def) => Ok((index, def)),
      None => self.fail("type index out of range"),
    }
  }

  fn read_struct_type_index(&mut self) -> Result<(u32, &'a StructType)> {
    let (index, def) = self.read_type_index()?;
    match def.as_struct() {
      Some(s) => Ok((index, s)),
      None => self.fail("not a struct type"),
    }
  }

  fn read_array_type_index(&mut self) -> Result<(u32, &'a ArrayType)> {
    let (index, def) = self.read_type_index()?;
    match def.as_array() {
      Some(a) => Ok((index, a)),
      None => self.fail("not an array type"),
    }
  }

  fn read_func_type_index(&mut self) -> Result<(u32, &'a FuncType)> {
    let (index, def) = self.read_type_index()?;
    match def.as_func() {
      Some(f) => Ok((index, f)),
      None => self.fail("not a func type"),
    }
  }

  fn read_field_index(&mut self, ty: &StructType) -> Result<u32> {
    let index = self.read_var_u32("unable to read field index")?;
    if index as usize >= ty.fields.len() {
      return self.fail("field index out of range");
    }
    Ok(index)
  }

  // ===========================================================================
  // Operand stack
  // ===========================================================================

  fn innermost(&self) -> &ControlEntry<'a, P::ControlItem> {
    &self.control_stack[self.control_stack.len() - 1]
  }

  fn push(&mut self, ty: ValType) {
    self.value_stack.push(TypeAndValue::new(StackType::Val(ty)));
  }

  fn push_with_value(&mut self, ty: StackType, value: P::Value) {
    self.value_stack.push(TypeAndValue { ty, value });
  }

  fn push_results(&mut self, results: ResultType<'_>) {
    for ty in results.iter() {
      self.push(ty);
    }
  }

  /// Pops one value of any type. At the base of a polymorphic block this
  /// yields Bottom instead of failing.
  fn pop_stack_type(&mut self) -> Result<(StackType, P::Value)> {
    let block = self.innermost();
    let (base, polymorphic) = (block.base, block.polymorphic_base);
    debug_assert!(self.value_stack.len() >= base);
    if self.value_stack.len() == base {
      if polymorphic {
        return Ok((StackType::Bottom, P::Value::default()));
      }
      return self.fail_empty_stack();
    }
    match self.value_stack.pop() {
      Some(tv) => Ok((tv.ty, tv.value)),
      None => self.fail_empty_stack(),
    }
  }

  fn pop_with_type_and_stack_type(&mut self, expected: ValType) -> Result<(StackType, P::Value)> {
    let (ty, value) = self.pop_stack_type()?;
    if let StackType::Val(actual) = ty {
      self.check_is_subtype_of(actual, expected)?;
    }
    Ok((ty, value))
  }

  fn pop_with_type(&mut self, expected: ValType) -> Result<P::Value> {
    self.pop_with_type_and_stack_type(expected).map(|(_, v)| v)
  }

  /// Pops `expected` in reverse order, returning payloads in declaration order.
  fn pop_with_types(&mut self, expected: ResultType<'_>) -> Result<Vec<P::Value>> {
    let mut values = vec![P::Value::default(); expected.len()];
    for i in (0..expected.len()).rev() {
      values[i] = self.pop_with_type(expected.get(i))?;
    }
    Ok(values)
  }

  fn pop_with_ref_type(&mut self) -> Result<(StackType, P::Value)> {
    let (ty, value) = self.pop_stack_type()?;
    match ty {
      StackType::Bottom => Ok((ty, value)),
      StackType::Val(v) if v.is_ref() => Ok((ty, value)),
      StackType::Val(v) => self.fail(format!("type mismatch: expression has type {v} but expected a reference type")),
    }
  }

  /// Checks that the top of the stack matches `expected` without popping.
  /// Missing values under a polymorphic base are materialized; with
  /// `retype_polymorphics` they (and any Bottom slots) take the expected type.
  fn check_top_type_matches(&mut self, expected: ResultType<'_>, retype_polymorphics: bool) -> Result<Vec<P::Value>> {
    let n = expected.len();
    let mut values = vec![P::Value::default(); n];
    if n == 0 {
      return Ok(values);
    }

    let block = self.innermost();
    let (base, polymorphic) = (block.base, block.polymorphic_base);
    for i in 0..n {
      let rev = n - i - 1;
      let expected_ty = expected.get(rev);
      // Stack length as if `i` values had been popped.
      let cur = self.value_stack.len() - i;
      debug_assert!(cur >= base);

      if cur == base {
        if !polymorphic {
          return self.fail_empty_stack();
        }
        let ty = if retype_polymorphics {
          StackType::Val(expected_ty)
        } else {
          StackType::Bottom
        };
        self.value_stack.insert(cur, TypeAndValue::new(ty));
        continue;
      }

      let observed = self.value_stack[cur - 1];
      match observed.ty {
        StackType::Bottom => {
          if retype_polymorphics {
            self.value_stack[cur - 1].ty = StackType::Val(expected_ty);
          }
        }
        StackType::Val(actual) => {
          self.check_is_subtype_of(actual, expected_ty)?;
          values[rev] = observed.value;
        }
      }
    }
    Ok(values)
  }

  fn push_control(&mut self, kind: LabelKind, ty: BlockType<'a>) -> Result<()> {
    self.check_top_type_matches(ty.params, true)?;
    debug_assert!(self.value_stack.len() >= ty.params.len());
    let base = self.value_stack.len() - ty.params.len();
    self.control_stack.push(ControlEntry {
      kind,
      ty,
      base,
      polymorphic_base: false,
      item: P::ControlItem::default(),
    });
    Ok(())
  }

  fn check_stack_at_end_of_block(&mut self) -> Result<(ResultType<'a>, Vec<P::Value>)> {
    let block = self.innermost();
    let results = block.ty.results;
    debug_assert!(self.value_stack.len() >= block.base);
    if results.len() < self.value_stack.len() - block.base {
      return self.fail("unused values not explicitly dropped by end of block");
    }
    let values = self.check_top_type_matches(results, true)?;
    Ok((results, values))
  }

  fn control_index(&self, relative_depth: u32) -> Result<usize> {
    let len = self.control_stack.len();
    if relative_depth as usize >= len {
      return self.fail("branch depth exceeds current nesting level");
    }
    Ok(len - 1 - relative_depth as usize)
  }

  fn check_branch_value_and_push(&mut self, relative_depth: u32) -> Result<(ResultType<'a>, Vec<P::Value>)> {
    let index = self.control_index(relative_depth)?;
    let ty = self.control_stack[index].branch_target_type();
    let values = self.check_top_type_matches(ty, false)?;
    Ok((ty, values))
  }

  /// Everything up to the end of the enclosing block is unreachable.
  fn after_unconditional_branch(&mut self) {
    let len = self.control_stack.len();
    let block = &mut self.control_stack[len - 1];
    self.value_stack.truncate(block.base);
    block.polymorphic_base = true;
  }

  // ===========================================================================
  // Entry and exit
  // ===========================================================================

  /// Reads the next opcode, recording its offset for error reports.
  pub fn read_op(&mut self) -> Result<Op> {
    self.last_op_offset = self.d.offset();
    if self.control_stack.is_empty() {
      return self.fail("operator after the end of the function body");
    }
    let Some(b0) = self.d.read_u8() else {
      return self.fail("unable to read opcode");
    };
    let b1 = if is_prefix_byte(b0) {
      self.read_var_u32("unable to read opcode")?
    } else {
      0
    };
    Ok(Op { b0, b1 })
  }

  pub fn start_function(&mut self, func_index: u32, locals: &[ValType]) -> Result<()> {
    debug_assert_eq!(self.kind, IterKind::Func);
    debug_assert!(self.value_stack.is_empty() && self.control_stack.is_empty());
    let env = self.env;
    let Some(ty) = env.func_type(func_index) else {
      return self.fail("function index out of range");
    };
    self.unset_locals.init(locals, ty.params.len());
    self.push_control(LabelKind::Body, BlockType::func_results(ty))
  }

  pub fn end_function(&mut self) -> Result<()> {
    if !self.d.done() {
      return self.fail("function body length mismatch");
    }
    if !self.control_stack.is_empty() {
      return self.fail("unbalanced function body control flow");
    }
    debug_assert!(self.else_param_stack.is_empty());
    debug_assert!(self.unset_locals.is_empty());
    self.value_stack.clear();
    Ok(())
  }

  pub fn start_init_expr(&mut self, expected: ValType, max_initialized_globals: u32) -> Result<()> {
    debug_assert_eq!(self.kind, IterKind::InitExpr);
    // With GC any previously defined global is readable.
    if self.env.features.gc {
      self.max_initialized_globals = max_initialized_globals;
    }
    self.push_control(LabelKind::Body, BlockType::single(expected))
  }

  pub fn end_init_expr(&mut self) -> Result<()> {
    if !self.control_stack.is_empty() {
      return self.fail("unbalanced initializer expression");
    }
    self.value_stack.clear();
    Ok(())
  }

  // ===========================================================================
  // Control
  // ===========================================================================

  pub fn read_block(&mut self) -> Result<ResultType<'a>> {
    let ty = self.read_block_type()?;
    self.push_control(LabelKind::Block, ty)?;
    Ok(ty.params)
  }

  pub fn read_loop(&mut self) -> Result<ResultType<'a>> {
    let ty = self.read_block_type()?;
    self.push_control(LabelKind::Loop, ty)?;
    Ok(ty.params)
  }

  pub fn read_if(&mut self) -> Result<(ResultType<'a>, P::Value)> {
    let ty = self.read_block_type()?;
    let condition = self.pop_with_type(ValType::I32)?;
    self.push_control(LabelKind::Then, ty)?;
    let n = ty.params.len();
    let start = self.value_stack.len() - n;
    self.else_param_stack.extend_from_slice(&self.value_stack[start..]);
    Ok((ty.params, condition))
  }

  /// Returns the payloads the `then` arm produced.
  pub fn read_else(&mut self) -> Result<Vec<P::Value>> {
    let index = self.control_stack.len() - 1;
    if self.control_stack[index].kind != LabelKind::Then {
      return self.fail("else can only be used within an if");
    }
    let (_, then_results) = self.check_stack_at_end_of_block()?;

    let block = &self.control_stack[index];
    let n = block.ty.params.len();
    self.value_stack.truncate(block.base);
    debug_assert!(self.else_param_stack.len() >= n);
    let split = self.else_param_stack.len() - n;
    self.value_stack.extend(self.else_param_stack.drain(split..));

    // Assignments in the `then` arm don't reach the `else` arm.
    self.unset_locals.reset_to_block(index as u32);
    self.control_stack[index].switch_to(LabelKind::Else);
    Ok(then_results)
  }

  /// Checks the block's results. The entry stays on the control stack until
  /// [`pop_end`](Self::pop_end).
  pub fn read_end(&mut self) -> Result<BlockEnd<P::Value>> {
    let (results_ty, results) = self.check_stack_at_end_of_block()?;
    let block = self.innermost();
    let kind = block.kind;
    let mut empty_else_results = Vec::new();

    if kind == LabelKind::Then {
      // The implicit else passes the parameters through as results.
      let params = block.ty.params;
      if params != results_ty {
        return self.fail("if without else with a result value");
      }
      let n = params.len();
      debug_assert!(self.else_param_stack.len() >= n);
      let split = self.else_param_stack.len() - n;
      empty_else_results.extend(self.else_param_stack.drain(split..).map(|tv| tv.value));
    }

    Ok(BlockEnd {
      kind,
      results,
      empty_else_results,
    })
  }

  pub fn pop_end(&mut self) {
    self.control_stack.pop();
    self.unset_locals.reset_to_block(self.control_depth());
  }

  pub fn read_br(&mut self) -> Result<(u32, Vec<P::Value>)> {
    let depth = self.read_var_u32("unable to read br depth")?;
    let (_, values) = self.check_branch_value_and_push(depth)?;
    self.after_unconditional_branch();
    Ok((depth, values))
  }

  pub fn read_br_if(&mut self) -> Result<(u32, Vec<P::Value>, P::Value)> {
    let depth = self.read_var_u32("unable to read br_if depth")?;
    let condition = self.pop_with_type(ValType::I32)?;
    let (_, values) = self.check_branch_value_and_push(depth)?;
    Ok((depth, values, condition))
  }

  fn check_br_table_entry(
    &mut self,
    prev: Option<ResultType<'a>>,
  ) -> Result<(u32, ResultType<'a>, Vec<P::Value>)> {
    let depth = self.read_var_u32("unable to read br_table depth")?;
    let index = self.control_index(depth)?;
    let ty = self.control_stack[index].branch_target_type();
    if let Some(prev) = prev
      && prev.len() != ty.len()
    {
      return self.fail("br_table targets must all have the same arity");
    }
    let values = self.check_top_type_matches(ty, false)?;
    Ok((depth, ty, values))
  }

  /// Returns the table depths, the default depth, the branch payloads and
  /// the index operand.
  pub fn read_br_table(&mut self) -> Result<(Vec<u32>, u32, Vec<P::Value>, P::Value)> {
    let len = self.read_var_u32("unable to read br_table table length")?;
    if len > MAX_BR_TABLE_ELEMS {
      return self.fail("br_table too big");
    }
    let index = self.pop_with_type(ValType::I32)?;

    let mut depths = Vec::new();
    let mut prev = None;
    let mut values = Vec::new();
    for _ in 0..len {
      let (depth, ty, v) = self.check_br_table_entry(prev)?;
      if prev.is_none() {
        values = v;
      }
      prev = Some(ty);
      depths.push(depth);
    }
    let (default_depth, _, v) = self.check_br_table_entry(prev)?;
    if prev.is_none() {
      values = v;
    }

    self.after_unconditional_branch();
    Ok((depths, default_depth, values, index))
  }

  pub fn read_return(&mut self) -> Result<Vec<P::Value>> {
    let results = self.control_stack[0].ty.results;
    let values = self.pop_with_types(results)?;
    self.after_unconditional_branch();
    Ok(values)
  }

  pub fn read_unreachable(&mut self) {
    self.after_unconditional_branch();
  }

  pub fn read_nop(&mut self) {}

  pub fn read_drop(&mut self) -> Result<P::Value> {
    self.pop_stack_type().map(|(_, v)| v)
  }

  pub fn read_select(&mut self, typed: bool) -> Result<(StackType, P::Value, P::Value, P::Value)> {
    if typed {
      let len = self.read_var_u32("unable to read select result length")?;
      if len != 1 {
        return self.fail("bad number of results");
      }
      let Ok(ty) = self.read_val_type() else {
        return self.fail("invalid result type for select");
      };
      let condition = self.pop_with_type(ValType::I32)?;
      let false_value = self.pop_with_type(ty)?;
      let true_value = self.pop_with_type(ty)?;
      self.push(ty);
      return Ok((StackType::Val(ty), true_value, false_value, condition));
    }

    let condition = self.pop_with_type(ValType::I32)?;
    let (false_ty, false_value) = self.pop_stack_type()?;
    let (true_ty, true_value) = self.pop_stack_type()?;
    if !false_ty.is_valid_for_untyped_select() || !true_ty.is_valid_for_untyped_select() {
      return self.fail("invalid types for untyped select");
    }
    let ty = if false_ty.is_bottom() {
      true_ty
    } else if true_ty.is_bottom() || false_ty == true_ty {
      false_ty
    } else {
      return self.fail("select operand types must match");
    };
    self.push_with_value(ty, P::Value::default());
    Ok((ty, true_value, false_value, condition))
  }

  // ===========================================================================
  // Exceptions
  // ===========================================================================

  pub fn read_try(&mut self) -> Result<ResultType<'a>> {
    let ty = self.read_block_type()?;
    self.push_control(LabelKind::Try, ty)?;
    Ok(ty.params)
  }

  fn read_tag_index(&mut self) -> Result<(u32, &'a [ValType])> {
    let tag = self.read_var_u32("expected tag index")?;
    let env = self.env;
    match env.tag_params(tag) {
      Some(params) => Ok((tag, params)),
      None => self.fail("tag index out of range"),
    }
  }

  /// Returns the kind being closed, the tag and the payloads of the arm
  /// that just ended.
  pub fn read_catch(&mut self) -> Result<(LabelKind, u32, Vec<P::Value>)> {
    let (tag, params) = self.read_tag_index()?;
    let kind = self.innermost().kind;
    if kind == LabelKind::CatchAll {
      return self.fail("catch cannot follow a catch_all");
    }
    if kind != LabelKind::Try && kind != LabelKind::Catch {
      return self.fail("catch can only be used within a try-catch");
    }
    let (_, results) = self.check_stack_at_end_of_block()?;

    let index = self.control_stack.len() - 1;
    self.value_stack.truncate(self.control_stack[index].base);
    self.unset_locals.reset_to_block(index as u32);
    self.control_stack[index].switch_to(LabelKind::Catch);
    self.push_results(ResultType::Vector(params));
    Ok((kind, tag, results))
  }

  pub fn read_catch_all(&mut self) -> Result<(LabelKind, Vec<P::Value>)> {
    let kind = self.innermost().kind;
    if kind != LabelKind::Try && kind != LabelKind::Catch {
      return self.fail("catch_all can only be used within a try-catch");
    }
    let (_, results) = self.check_stack_at_end_of_block()?;

    let index = self.control_stack.len() - 1;
    self.value_stack.truncate(self.control_stack[index].base);
    self.unset_locals.reset_to_block(index as u32);
    self.control_stack[index].switch_to(LabelKind::CatchAll);
    Ok((kind, results))
  }

  /// Returns the depth relative to the `try` itself. The entry stays on the
  /// control stack until [`pop_delegate`](Self::pop_delegate).
  pub fn read_delegate(&mut self) -> Result<(u32, Vec<P::Value>)> {
    if self.innermost().kind != LabelKind::Try {
      return self.fail("delegate can only be used within a try");
    }
    let depth = self.read_var_u32("unable to read delegate depth")?;
    // Counted from the block surrounding the try.
    if depth as usize >= self.control_stack.len() - 1 {
      return self.fail("delegate depth exceeds current nesting level");
    }
    let (_, results) = self.check_stack_at_end_of_block()?;
    Ok((depth + 1, results))
  }

  pub fn pop_delegate(&mut self) {
    self.pop_end();
  }

  pub fn read_throw(&mut self) -> Result<(u32, Vec<P::Value>)> {
    let (tag, params) = self.read_tag_index()?;
    let values = self.pop_with_types(ResultType::Vector(params))?;
    self.after_unconditional_branch();
    Ok((tag, values))
  }

  pub fn read_rethrow(&mut self) -> Result<u32> {
    let depth = self.read_var_u32("unable to read rethrow depth")?;
    if depth as usize >= self.control_stack.len() {
      return self.fail("rethrow depth exceeds current nesting level");
    }
    let kind = self.control_kind(depth);
    if kind != LabelKind::Catch && kind != LabelKind::CatchAll {
      return self.fail("rethrow target was not a catch block");
    }
    self.after_unconditional_branch();
    Ok(depth)
  }

  // ===========================================================================
  // Numeric
  // ===========================================================================

  pub fn read_unary(&mut self, ty: ValType) -> Result<P::Value> {
    let input = self.pop_with_type(ty)?;
    self.push(ty);
    Ok(input)
  }

  pub fn read_conversion(&mut self, operand: ValType, result: ValType) -> Result<P::Value> {
    let input = self.pop_with_type(operand)?;
    self.push(result);
    Ok(input)
  }

  pub fn read_binary(&mut self, ty: ValType) -> Result<(P::Value, P::Value)> {
    let rhs = self.pop_with_type(ty)?;
    let lhs = self.pop_with_type(ty)?;
    self.push(ty);
    Ok((lhs, rhs))
  }

  pub fn read_comparison(&mut self, ty: ValType) -> Result<(P::Value, P::Value)> {
    let rhs = self.pop_with_type(ty)?;
    let lhs = self.pop_with_type(ty)?;
    self.push(ValType::I32);
    Ok((lhs, rhs))
  }

  pub fn read_i32_const(&mut self) -> Result<i32> {
    let Some(v) = self.d.read_var_s32() else {
      return self.fail("failed to read I32 constant");
    };
    self.push(ValType::I32);
    Ok(v)
  }

  pub fn read_i64_const(&mut self) -> Result<i64> {
    let Some(v) = self.d.read_var_s64() else {
      return self.fail("failed to read I64 constant");
    };
    self.push(ValType::I64);
    Ok(v)
  }

  /// Returns the raw bits.
  pub fn read_f32_const(&mut self) -> Result<u32> {
    let Some(v) = self.d.read_fixed_u32() else {
      return self.fail("failed to read F32 constant");
    };
    self.push(ValType::F32);
    Ok(v)
  }

  /// Returns the raw bits.
  pub fn read_f64_const(&mut self) -> Result<u64> {
    let Some(v) = self.d.read_fixed_u64() else {
      return self.fail("failed to read F64 constant");
    };
    self.push(ValType::F64);
    Ok(v)
  }

  // ===========================================================================
  // Variables
  // ===========================================================================

  pub fn read_get_local(&mut self, locals: &[ValType]) -> Result<u32> {
    let id = self.read_var_u32("unable to read local index")?;
    let Some(&ty) = locals.get(id as usize) else {
      return self.fail("local.get index out of range");
    };
    if self.unset_locals.is_unset(id) {
      return self.fail("local.get read from unset local");
    }
    self.push(ty);
    Ok(id)
  }

  pub fn read_set_local(&mut self, locals: &[ValType]) -> Result<(u32, P::Value)> {
    let id = self.read_var_u32("unable to read local index")?;
    let Some(&ty) = locals.get(id as usize) else {
      return self.fail("local.set index out of range");
    };
    if self.unset_locals.is_unset(id) {
      self.unset_locals.set(id, self.control_depth());
    }
    let value = self.pop_with_type(ty)?;
    Ok((id, value))
  }

  pub fn read_tee_local(&mut self, locals: &[ValType]) -> Result<(u32, P::Value)> {
    let id = self.read_var_u32("unable to read local index")?;
    let Some(&ty) = locals.get(id as usize) else {
      return self.fail("local.tee index out of range");
    };
    if self.unset_locals.is_unset(id) {
      self.unset_locals.set(id, self.control_depth());
    }
    let values = self.check_top_type_matches(ResultType::Single(ty), true)?;
    Ok((id, values[0]))
  }

  pub fn read_get_global(&mut self) -> Result<u32> {
    let id = self.read_var_u32("unable to read global index")?;
    let Some(&global) = self.env.globals.get(id as usize) else {
      return self.fail("global.get index out of range");
    };
    if self.kind == IterKind::InitExpr
      && (global.mutable || (id >= self.max_initialized_globals && !global.imported))
    {
      return self.fail("global.get in initializer expression must reference a global immutable import");
    }
    self.push(global.ty);
    Ok(id)
  }

  pub fn read_set_global(&mut self) -> Result<(u32, P::Value)> {
    let id = self.read_var_u32("unable to read global index")?;
    let Some(&global) = self.env.globals.get(id as usize) else {
      return self.fail("global.set index out of range");
    };
    if !global.mutable {
      return self.fail("can't write an immutable global");
    }
    let value = self.pop_with_type(global.ty)?;
    Ok((id, value))
  }

  // ===========================================================================
  // Memory
  // ===========================================================================

  fn memory_index_type(&self) -> Result<ValType> {
    match &self.env.memory {
      Some(memory) => Ok(memory.index_type()),
      None => self.fail("can't touch memory without memory"),
    }
  }

  fn read_linear_memory_address(&mut self, byte_size: u32) -> Result<LinearMemoryAddress<P::Value>> {
    let index_type = self.memory_index_type()?;
    let mut align_log2 = self.read_var_u32("unable to read load alignment")?;
    // Bit 6 announces an explicit memory index.
    if align_log2 & 0x40 != 0 {
      align_log2 &= !0x40;
      if self.read_var_u32("unable to read memory index")? != 0 {
        return self.fail("memory index must be zero");
      }
    }
    let Some(offset) = self.d.read_var_u64() else {
      return self.fail("unable to read load offset");
    };
    if index_type == ValType::I32 && offset > u64::from(u32::MAX) {
      return self.fail("offset too large for memory type");
    }
    if align_log2 >= 32 || (1u32 << align_log2) > byte_size {
      return self.fail("greater than natural alignment");
    }
    let base = self.pop_with_type(index_type)?;
    Ok(LinearMemoryAddress {
      base,
      offset,
      align: 1 << align_log2,
    })
  }

  fn read_linear_memory_address_aligned(&mut self, byte_size: u32) -> Result<LinearMemoryAddress<P::Value>> {
    let addr = self.read_linear_memory_address(byte_size)?;
    if addr.align != byte_size {
      return self.fail("not natural alignment");
    }
    Ok(addr)
  }

  pub fn read_load(&mut self, result: ValType, byte_size: u32) -> Result<LinearMemoryAddress<P::Value>> {
    let addr = self.read_linear_memory_address(byte_size)?;
    self.push(result);
    Ok(addr)
  }

  pub fn read_store(&mut self, ty: ValType, byte_size: u32) -> Result<(LinearMemoryAddress<P::Value>, P::Value)> {
    let value = self.pop_with_type(ty)?;
    let addr = self.read_linear_memory_address(byte_size)?;
    Ok((addr, value))
  }

  fn read_memory_flags(&mut self) -> Result<ValType> {
    let index_type = self.memory_index_type()?;
    if self.read_fixed_u8("failed to read memory flags")? != 0 {
      return self.fail("unexpected flags");
    }
    Ok(index_type)
  }

  pub fn read_memory_size(&mut self) -> Result<()> {
    let index_type = self.read_memory_flags()?;
    self.push(index_type);
    Ok(())
  }

  pub fn read_memory_grow(&mut self) -> Result<P::Value> {
    let index_type = self.read_memory_flags()?;
    let delta = self.pop_with_type(index_type)?;
    self.push(index_type);
    Ok(delta)
  }

  // ===========================================================================
  // Atomics
  // ===========================================================================

  pub fn read_notify(&mut self) -> Result<(LinearMemoryAddress<P::Value>, P::Value)> {
    let count = self.pop_with_type(ValType::I32)?;
    let addr = self.read_linear_memory_address_aligned(4)?;
    self.push(ValType::I32);
    Ok((addr, count))
  }

  pub fn read_wait(
    &mut self,
    ty: ValType,
    byte_size: u32,
  ) -> Result<(LinearMemoryAddress<P::Value>, P::Value, P::Value)> {
    let timeout = self.pop_with_type(ValType::I64)?;
    let expected = self.pop_with_type(ty)?;
    let addr = self.read_linear_memory_address_aligned(byte_size)?;
    self.push(ValType::I32);
    Ok((addr, expected, timeout))
  }

  pub fn read_fence(&mut self) -> Result<()> {
    if self.read_fixed_u8("expected memory order after fence")? != 0 {
      return self.fail("non-zero memory order not supported yet");
    }
    Ok(())
  }

  pub fn read_atomic_load(&mut self, result: ValType, byte_size: u32) -> Result<LinearMemoryAddress<P::Value>> {
    let addr = self.read_linear_memory_address_aligned(byte_size)?;
    self.push(result);
    Ok(addr)
  }

  pub fn read_atomic_store(
    &mut self,
    ty: ValType,
    byte_size: u32,
  ) -> Result<(LinearMemoryAddress<P::Value>, P::Value)> {
    let value = self.pop_with_type(ty)?;
    let addr = self.read_linear_memory_address_aligned(byte_size)?;
    Ok((addr, value))
  }

  pub fn read_atomic_rmw(&mut self, ty: ValType, byte_size: u32) -> Result<(LinearMemoryAddress<P::Value>, P::Value)> {
    let value = self.pop_with_type(ty)?;
    let addr = self.read_linear_memory_address_aligned(byte_size)?;
    self.push(ty);
    Ok((addr, value))
  }

  pub fn read_atomic_cmpxchg(
    &mut self,
    ty: ValType,
    byte_size: u32,
  ) -> Result<(LinearMemoryAddress<P::Value>, P::Value, P::Value)> {
    let replacement = self.pop_with_type(ty)?;
    let expected = self.pop_with_type(ty)?;
    let addr = self.read_linear_memory_address_aligned(byte_size)?;
    self.push(ty);
    Ok((addr, expected, replacement))
  }

  // ===========================================================================
  // Bulk memory and tables
  // ===========================================================================

  fn read_table_index(&mut self, op_name: &str) -> Result<(u32, RefType)> {
    let index = self.read_var_u32("unable to read table index")?;
    match self.env.tables.get(index as usize) {
      Some(table) => Ok((index, table.elem)),
      None => self.fail(format!("table index out of range for {op_name}")),
    }
  }

  /// `memory.copy` or `table.copy`. Returns the destination and source
  /// indices.
  pub fn read_mem_or_table_copy(&mut self, is_mem: bool) -> Result<(u32, u32)> {
    if is_mem {
      let index_type = self.memory_index_type()?;
      let dst = self.read_var_u32("unable to read memory or table index")?;
      let src = self.read_var_u32("unable to read memory or table index")?;
      if dst != 0 || src != 0 {
        return self.fail("memory index out of range for memory.copy");
      }
      for _ in 0..3 {
        self.pop_with_type(index_type)?;
      }
      return Ok((dst, src));
    }

    let (dst, dst_elem) = self.read_table_index("table.copy")?;
    let (src, src_elem) = self.read_table_index("table.copy")?;
    self.check_is_subtype_of(src_elem.into(), dst_elem.into())?;
    for _ in 0..3 {
      self.pop_with_type(ValType::I32)?;
    }
    Ok((dst, src))
  }

  /// `data.drop` or `elem.drop`.
  pub fn read_data_or_elem_drop(&mut self, is_data: bool) -> Result<u32> {
    let seg = self.read_var_u32("unable to read segment index")?;
    let env = self.env;
    if is_data {
      let Some(count) = env.data_count else {
        return self.fail("data.drop requires a DataCount section");
      };
      if seg >= count {
        return self.fail("data.drop segment index out of range");
      }
    } else if seg as usize >= env.elem_segments.len() {
      return self.fail("element segment index out of range for elem.drop");
    }
    Ok(seg)
  }

  pub fn read_mem_fill(&mut self) -> Result<()> {
    let index_type = self.memory_index_type()?;
    if self.read_fixed_u8("failed to read memory index")? != 0 {
      return self.fail("memory index must be zero");
    }
    self.pop_with_type(index_type)?;
    self.pop_with_type(ValType::I32)?;
    self.pop_with_type(index_type)?;
    Ok(())
  }

  /// `memory.init` or `table.init`. Returns the segment and target indices.
  pub fn read_mem_or_table_init(&mut self, is_mem: bool) -> Result<(u32, u32)> {
    let seg = self.read_var_u32("unable to read segment index")?;
    let env = self.env;
    if is_mem {
      let index_type = self.memory_index_type()?;
      if self.read_var_u32("unable to read memory or table index")? != 0 {
        return self.fail("memory index must be zero");
      }
      let Some(count) = env.data_count else {
        return self.fail("memory.init requires a DataCount section");
      };
      if seg >= count {
        return self.fail("memory.init segment index out of range");
      }
      self.pop_with_type(ValType::I32)?;
      self.pop_with_type(ValType::I32)?;
      self.pop_with_type(index_type)?;
      return Ok((seg, 0));
    }

    let (table, table_elem) = self.read_table_index("table.init")?;
    let Some(segment) = env.elem_segments.get(seg as usize) else {
      return self.fail("table.init segment index out of range");
    };
    self.check_is_subtype_of(segment.elem_type.into(), table_elem.into())?;
    for _ in 0..3 {
      self.pop_with_type(ValType::I32)?;
    }
    Ok((seg, table))
  }

  pub fn read_table_fill(&mut self) -> Result<u32> {
    let (table, elem) = self.read_table_index("table.fill")?;
    self.pop_with_type(ValType::I32)?;
    self.pop_with_type(elem.into())?;
    self.pop_with_type(ValType::I32)?;
    Ok(table)
  }

  pub fn read_table_get(&mut self) -> Result<(u32, P::Value)> {
    let (table, elem) = self.read_table_index("table.get")?;
    let index = self.pop_with_type(ValType::I32)?;
    self.push(elem.into());
    Ok((table, index))
  }

  pub fn read_table_grow(&mut self) -> Result<(u32, P::Value, P::Value)> {
    let (table, elem) = self.read_table_index("table.grow")?;
    let delta = self.pop_with_type(ValType::I32)?;
    let init = self.pop_with_type(elem.into())?;
    self.push(ValType::I32);
    Ok((table, init, delta))
  }

  pub fn read_table_set(&mut self) -> Result<(u32, P::Value, P::Value)> {
    let (table, elem) = self.read_table_index("table.set")?;
    let value = self.pop_with_type(elem.into())?;
    let index = self.pop_with_type(ValType::I32)?;
    Ok((table, index, value))
  }

  pub fn read_table_size(&mut self) -> Result<u32> {
    let (table, _) = self.read_table_index("table.size")?;
    self.push(ValType::I32);
    Ok(table)
  }

  // ===========================================================================
  // Calls and references
  // ===========================================================================

  pub fn read_call(&mut self) -> Result<(u32, Vec<P::Value>)> {
    let func = self.read_var_u32("unable to read call function index")?;
    let env = self.env;
    let Some(ty) = env.func_type(func) else {
      return self.fail("callee index out of range");
    };
    let args = self.pop_with_types(ResultType::Vector(&ty.params))?;
    self.push_results(ResultType::Vector(&ty.results));
    Ok((func, args))
  }

  /// Returns the signature index, the table, the callee index operand and
  /// the arguments.
  pub fn read_call_indirect(&mut self) -> Result<(u32, u32, P::Value, Vec<P::Value>)> {
    let env = self.env;
    let type_index = self.read_var_u32("unable to read call_indirect signature index")?;
    if type_index >= env.types.len() {
      return self.fail("signature index out of range");
    }
    let table = self.read_var_u32("unable to read call_indirect table index")?;
    let Some(desc) = env.tables.get(table as usize) else {
      if env.tables.is_empty() {
        return self.fail("can't call_indirect without a table");
      }
      return self.fail("table index out of range for call_indirect");
    };
    if !env.types.ref_is_subtype(desc.elem, RefType::FUNC) {
      return self.fail("indirect calls must go through a table of 'funcref'");
    }
    let callee = self.pop_with_type(ValType::I32)?;
    let Some(ty) = env.types.get(type_index).and_then(TypeDef::as_func) else {
      return self.fail("expected signature type");
    };
    let args = self.pop_with_types(ResultType::Vector(&ty.params))?;
    self.push_results(ResultType::Vector(&ty.results));
    Ok((type_index, table, callee, args))
  }

  pub fn read_call_ref(&mut self) -> Result<(u32, P::Value, Vec<P::Value>)> {
    let (type_index, ty) = self.read_func_type_index()?;
    let callee = self.pop_with_type(RefType::new(true, HeapType::Concrete(type_index)).into())?;
    let args = self.pop_with_types(ResultType::Vector(&ty.params))?;
    self.push_results(ResultType::Vector(&ty.results));
    Ok((type_index, callee, args))
  }

  pub fn read_ref_func(&mut self) -> Result<u32> {
    let func = self.read_var_u32("unable to read function index")?;
    let env = self.env;
    let Some(desc) = env.funcs.get(func as usize) else {
      return self.fail("function index out of range");
    };
    if self.kind == IterKind::Func && !desc.declared {
      return self.fail("function index is not declared in a section before the code section");
    }
    if env.features.gc {
      self.push(RefType::new(false, HeapType::Concrete(desc.type_index)).into());
    } else {
      self.push(RefType::FUNC.into());
    }
    Ok(func)
  }

  pub fn read_ref_null(&mut self) -> Result<RefType> {
    let ty = RefType::new(true, self.read_heap_type()?);
    self.push(ty.into());
    Ok(ty)
  }

  pub fn read_ref_is_null(&mut self) -> Result<P::Value> {
    let (_, input) = self.pop_with_ref_type()?;
    self.push(ValType::I32);
    Ok(input)
  }

  pub fn read_ref_as_non_null(&mut self) -> Result<P::Value> {
    let (ty, input) = self.pop_with_ref_type()?;
    self.push_with_value(ty.as_non_nullable(), input);
    Ok(input)
  }

  pub fn read_br_on_null(&mut self) -> Result<(u32, Vec<P::Value>, P::Value)> {
    let depth = self.read_var_u32("unable to read br_on_null depth")?;
    let (ty, condition) = self.pop_with_ref_type()?;
    let (_, values) = self.check_branch_value_and_push(depth)?;
    self.push_with_value(ty.as_non_nullable(), condition);
    Ok((depth, values, condition))
  }

  pub fn read_br_on_non_null(&mut self) -> Result<(u32, Vec<P::Value>, P::Value)> {
    let depth = self.read_var_u32("unable to read br_on_non_null depth")?;
    let index = self.control_index(depth)?;
    let target = self.control_stack[index].branch_target_type();
    if target.is_empty() {
      return self.fail("type mismatch: target block type expected to be [_, ref]");
    }
    let (ty, condition) = self.pop_with_ref_type()?;
    // The branch carries the non-null reference, the fallthrough doesn't.
    self.push_with_value(ty.as_non_nullable(), condition);
    let values = self.check_top_type_matches(target, false)?;
    self.pop_stack_type()?;
    Ok((depth, values, condition))
  }

  // ===========================================================================
  // GC
  // ===========================================================================

  fn concrete_ref(index: u32, nullable: bool) -> ValType {
    RefType::new(nullable, HeapType::Concrete(index)).into()
  }

  fn check_widening(&self, field: FieldType, widening: FieldWideningOp, what: &str) -> Result<()> {
    let packed = field.storage.is_packed();
    if !packed && widening != FieldWideningOp::None {
      return self.fail(format!("must not specify signedness for unpacked {what} type"));
    }
    if packed && widening == FieldWideningOp::None {
      return self.fail(format!("must specify signedness for packed {what} type"));
    }
    Ok(())
  }

  pub fn read_struct_new(&mut self) -> Result<(u32, Vec<P::Value>)> {
    let (index, ty) = self.read_struct_type_index()?;
    let mut args = vec![P::Value::default(); ty.fields.len()];
    for (i, field) in ty.fields.iter().enumerate().rev() {
      args[i] = self.pop_with_type(field.storage.unpack())?;
    }
    self.push(Self::concrete_ref(index, false));
    Ok((index, args))
  }

  pub fn read_struct_new_default(&mut self) -> Result<u32> {
    let (index, ty) = self.read_struct_type_index()?;
    if !ty.is_defaultable() {
      return self.fail("struct must be defaultable");
    }
    self.push(Self::concrete_ref(index, false));
    Ok(index)
  }

  pub fn read_struct_get(&mut self, widening: FieldWideningOp) -> Result<(u32, u32, P::Value)> {
    let (index, ty) = self.read_struct_type_index()?;
    let field_index = self.read_field_index(ty)?;
    let ptr = self.pop_with_type(Self::concrete_ref(index, true))?;
    let field = ty.fields[field_index as usize];
    self.check_widening(field, widening, "field")?;
    self.push(field.storage.unpack());
    Ok((index, field_index, ptr))
  }

  pub fn read_struct_set(&mut self) -> Result<(u32, u32, P::Value, P::Value)> {
    let (index, ty) = self.read_struct_type_index()?;
    let field_index = self.read_field_index(ty)?;
    let field = ty.fields[field_index as usize];
    let value = self.pop_with_type(field.storage.unpack())?;
    if !field.mutable {
      return self.fail("field is not mutable");
    }
    let ptr = self.pop_with_type(Self::concrete_ref(index, true))?;
    Ok((index, field_index, ptr, value))
  }

  pub fn read_array_new(&mut self) -> Result<(u32, P::Value, P::Value)> {
    let (index, ty) = self.read_array_type_index()?;
    let len = self.pop_with_type(ValType::I32)?;
    let init = self.pop_with_type(ty.element.storage.unpack())?;
    self.push(Self::concrete_ref(index, false));
    Ok((index, len, init))
  }

  pub fn read_array_new_fixed(&mut self) -> Result<(u32, Vec<P::Value>)> {
    let (index, ty) = self.read_array_type_index()?;
    let n = self.read_var_u32("unable to read array.new_fixed length")?;
    if n > MAX_ARRAY_NEW_FIXED_ELEMS {
      return self.fail("too many array.new_fixed elements");
    }
    let elem = ty.element.storage.unpack();
    let mut values = vec![P::Value::default(); n as usize];
    for slot in values.iter_mut().rev() {
      *slot = self.pop_with_type(elem)?;
    }
    self.push(Self::concrete_ref(index, false));
    Ok((index, values))
  }

  pub fn read_array_new_default(&mut self) -> Result<(u32, P::Value)> {
    let (index, ty) = self.read_array_type_index()?;
    let len = self.pop_with_type(ValType::I32)?;
    if !ty.element.storage.is_defaultable() {
      return self.fail("array must be defaultable");
    }
    self.push(Self::concrete_ref(index, false));
    Ok((index, len))
  }

  fn check_data_segment_for(&self, ty: &ArrayType, seg: u32) -> Result<()> {
    if ty.element.storage.unpack().is_ref() {
      return self.fail("element type must be i8/i16/i32/i64/f32/f64");
    }
    let Some(count) = self.env.data_count else {
      return self.fail("datacount section missing");
    };
    if seg >= count {
      return self.fail("segment index is out of range");
    }
    Ok(())
  }

  fn check_elem_segment_for(&self, ty: &ArrayType, seg: u32) -> Result<()> {
    let StorageType::Val(ValType::Ref(dst)) = ty.element.storage else {
      return self.fail("element type is not a reftype");
    };
    let Some(segment) = self.env.elem_segments.get(seg as usize) else {
      return self.fail("segment index is out of range");
    };
    if !self.env.types.ref_is_subtype(segment.elem_type, dst) {
      return self.fail("incompatible element types");
    }
    Ok(())
  }

  /// `array.new_data` or `array.new_elem`.
  pub fn read_array_new_segment(&mut self, is_data: bool) -> Result<(u32, u32, P::Value, P::Value)> {
    let (index, ty) = self.read_array_type_index()?;
    let seg = self.read_var_u32("unable to read segment index")?;
    if is_data {
      self.check_data_segment_for(ty, seg)?;
    } else {
      self.check_elem_segment_for(ty, seg)?;
    }
    let len = self.pop_with_type(ValType::I32)?;
    let offset = self.pop_with_type(ValType::I32)?;
    self.push(Self::concrete_ref(index, false));
    Ok((index, seg, offset, len))
  }

  /// `array.init_data` or `array.init_elem`.
  pub fn read_array_init_segment(&mut self, is_data: bool) -> Result<(u32, u32)> {
    let (index, ty) = self.read_array_type_index()?;
    let seg = self.read_var_u32("unable to read segment index")?;
    if !ty.element.mutable {
      return self.fail("array is not mutable");
    }
    if is_data {
      self.check_data_segment_for(ty, seg)?;
    } else {
      self.check_elem_segment_for(ty, seg)?;
    }
    for _ in 0..3 {
      self.pop_with_type(ValType::I32)?;
    }
    self.pop_with_type(Self::concrete_ref(index, true))?;
    Ok((index, seg))
  }

  pub fn read_array_get(&mut self, widening: FieldWideningOp) -> Result<(u32, P::Value, P::Value)> {
    let (index, ty) = self.read_array_type_index()?;
    let elem_index = self.pop_with_type(ValType::I32)?;
    let ptr = self.pop_with_type(Self::concrete_ref(index, true))?;
    self.check_widening(ty.element, widening, "element")?;
    self.push(ty.element.storage.unpack());
    Ok((index, elem_index, ptr))
  }

  pub fn read_array_set(&mut self) -> Result<(u32, P::Value, P::Value, P::Value)> {
    let (index, ty) = self.read_array_type_index()?;
    if !ty.element.mutable {
      return self.fail("array is not mutable");
    }
    let value = self.pop_with_type(ty.element.storage.unpack())?;
    let elem_index = self.pop_with_type(ValType::I32)?;
    let ptr = self.pop_with_type(Self::concrete_ref(index, true))?;
    Ok((index, ptr, elem_index, value))
  }

  pub fn read_array_len(&mut self) -> Result<P::Value> {
    let ptr = self.pop_with_type(RefType::ARRAY.into())?;
    self.push(ValType::I32);
    Ok(ptr)
  }

  pub fn read_array_copy(&mut self) -> Result<(u32, u32)> {
    let (dst_index, dst) = self.read_array_type_index()?;
    let (src_index, src) = self.read_array_type_index()?;
    if !dst.element.mutable {
      return self.fail("destination array is not mutable");
    }
    if !self.env.types.storage_is_subtype(src.element.storage, dst.element.storage) {
      return self.fail("incompatible element types");
    }
    self.pop_with_type(ValType::I32)?;
    self.pop_with_type(ValType::I32)?;
    self.pop_with_type(Self::concrete_ref(src_index, true))?;
    self.pop_with_type(ValType::I32)?;
    self.pop_with_type(Self::concrete_ref(dst_index, true))?;
    Ok((dst_index, src_index))
  }

  pub fn read_array_fill(&mut self) -> Result<u32> {
    let (index, ty) = self.read_array_type_index()?;
    if !ty.element.mutable {
      return self.fail("array is not mutable");
    }
    self.pop_with_type(ValType::I32)?;
    self.pop_with_type(ty.element.storage.unpack())?;
    self.pop_with_type(ValType::I32)?;
    self.pop_with_type(Self::concrete_ref(index, true))?;
    Ok(index)
  }

  /// Reads a cast target and pops an operand from the same hierarchy.
  fn read_cast_operand(&mut self, nullable: bool) -> Result<(RefType, P::Value)> {
    let target = RefType::new(nullable, self.read_heap_type()?);
    let top = self.env.types.top(target.heap);
    let operand = self.pop_with_type(RefType::new(true, top).into())?;
    Ok((target, operand))
  }

  pub fn read_ref_test(&mut self, nullable: bool) -> Result<(RefType, P::Value)> {
    let (target, operand) = self.read_cast_operand(nullable)?;
    self.push(ValType::I32);
    Ok((target, operand))
  }

  pub fn read_ref_cast(&mut self, nullable: bool) -> Result<(RefType, P::Value)> {
    let (target, operand) = self.read_cast_operand(nullable)?;
    self.push(target.into());
    Ok((target, operand))
  }

  /// `br_on_cast` (`on_fail == false`) or `br_on_cast_fail`. Returns the
  /// label depth, the source and target types and the branch payloads.
  pub fn read_br_on_cast(&mut self, on_fail: bool) -> Result<(u32, RefType, RefType, Vec<P::Value>)> {
    let flags = self.read_fixed_u8("unable to read br_on_cast flags")?;
    if flags > 3 {
      return self.fail("invalid br_on_cast flags");
    }
    let depth = self.read_var_u32("unable to read br_on_cast depth")?;
    let source = RefType::new(flags & 1 != 0, self.read_heap_type()?);
    let target = RefType::new(flags & 2 != 0, self.read_heap_type()?);
    if !self.env.types.ref_is_subtype(target, source) {
      return self.fail("type mismatch: cast type must be a subtype of the input type");
    }

    let index = self.control_index(depth)?;
    let label = self.control_stack[index].branch_target_type();
    if label.is_empty() {
      return self.fail("type mismatch: branch target type has no value slots");
    }

    // What's left of the source type once the cast has failed.
    let diff = RefType::new(source.nullable && !target.nullable, source.heap);
    let (branch, fallthrough) = if on_fail { (diff, target) } else { (target, diff) };
    self.check_is_subtype_of(branch.into(), label.get(label.len() - 1))?;

    let (_, operand) = self.pop_with_type_and_stack_type(source.into())?;
    self.push_with_value(StackType::Val(branch.into()), operand);
    let values = self.check_top_type_matches(label, false)?;
    self.pop_stack_type()?;
    self.push_with_value(StackType::Val(fallthrough.into()), operand);
    Ok((depth, source, target, values))
  }

  /// `any.convert_extern` and `extern.convert_any`. Nullability carries over.
  pub fn read_ref_conversion(&mut self, operand: RefType, result: RefType) -> Result<P::Value> {
    let (ty, value) = self.pop_with_type_and_stack_type(operand.into())?;
    let nullable = ty.is_nullable_as_operand();
    self.push(result.with_nullable(nullable).into());
    Ok(value)
  }

  pub fn read_ref_i31(&mut self) -> Result<P::Value> {
    let input = self.pop_with_type(ValType::I32)?;
    self.push(RefType::new(false, HeapType::I31).into());
    Ok(input)
  }

  pub fn read_i31_get(&mut self) -> Result<P::Value> {
    let input = self.pop_with_type(RefType::I31.into())?;
    self.push(ValType::I32);
    Ok(input)
  }
}

// =============================================================================
// Tests
// =============================================================================
