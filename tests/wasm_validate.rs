use ferrojem::wasm::{self, Features, ValidationError};
use proptest::prelude::*;
use wasm_encoder::{
  AbstractHeapType, BlockType, CodeSection, DataCountSection, DataSection, ExportKind, ExportSection, Function,
  FunctionSection, HeapType, Instruction, MemArg, MemorySection, MemoryType, Module, RefType, TagKind, TagSection,
  TagType, TypeSection, ValType,
};

/// One exported function plus whatever module state its body needs. Extra
/// function types follow the function's own at index 0.
#[derive(Default)]
struct TestModule {
  params: Vec<ValType>,
  results: Vec<ValType>,
  extra_types: Vec<(Vec<ValType>, Vec<ValType>)>,
  memory: Option<MemoryType>,
  tag_type: Option<u32>,
  passive_data: bool,
  data_count: bool,
  locals: Vec<(u32, ValType)>,
}

impl TestModule {
  fn new(params: &[ValType], results: &[ValType]) -> Self {
    Self {
      params: params.to_vec(),
      results: results.to_vec(),
      ..Self::default()
    }
  }

  fn with_type(mut self, params: &[ValType], results: &[ValType]) -> Self {
    self.extra_types.push((params.to_vec(), results.to_vec()));
    self
  }

  fn with_memory(mut self, memory64: bool, shared: bool) -> Self {
    self.memory = Some(MemoryType {
      minimum: 1,
      maximum: Some(2),
      memory64,
      shared,
      page_size_log2: None,
    });
    self
  }

  fn with_tag(mut self, type_index: u32) -> Self {
    self.tag_type = Some(type_index);
    self
  }

  fn with_passive_data(mut self, data_count: bool) -> Self {
    self.passive_data = true;
    self.data_count = data_count;
    self
  }

  fn with_locals(mut self, locals: &[(u32, ValType)]) -> Self {
    self.locals = locals.to_vec();
    self
  }

  fn encode(&self, body: &[Instruction<'_>]) -> Vec<u8> {
    let mut module = Module::new();

    let mut types = TypeSection::new();
    types.ty().function(self.params.iter().copied(), self.results.iter().copied());
    for (params, results) in &self.extra_types {
      types.ty().function(params.iter().copied(), results.iter().copied());
    }
    module.section(&types);

    let mut funcs = FunctionSection::new();
    funcs.function(0);
    module.section(&funcs);

    if let Some(memory) = self.memory {
      let mut memories = MemorySection::new();
      memories.memory(memory);
      module.section(&memories);
    }

    if let Some(func_type_idx) = self.tag_type {
      let mut tags = TagSection::new();
      tags.tag(TagType {
        kind: TagKind::Exception,
        func_type_idx,
      });
      module.section(&tags);
    }

    let mut exports = ExportSection::new();
    exports.export("f", ExportKind::Func, 0);
    module.section(&exports);

    if self.data_count {
      module.section(&DataCountSection { count: 1 });
    }

    let mut code = CodeSection::new();
    let mut func = Function::new(self.locals.iter().copied());
    for instruction in body {
      func.instruction(instruction);
    }
    code.function(&func);
    module.section(&code);

    if self.passive_data {
      let mut data = DataSection::new();
      data.passive([1u8, 2, 3]);
      module.section(&data);
    }

    module.finish()
  }

  fn validate(&self, body: &[Instruction<'_>]) -> Result<(), ValidationError> {
    wasm::validate(&self.encode(body), Features::ALL)
  }
}

fn message(result: Result<(), ValidationError>) -> String {
  result.unwrap_err().message
}

const FUNCREF_NULL: HeapType = HeapType::Abstract {
  shared: false,
  ty: AbstractHeapType::Func,
};

fn memarg(align: u32) -> MemArg {
  MemArg {
    offset: 0,
    align,
    memory_index: 0,
  }
}

// =============================================================================
// Operand stack
// =============================================================================

#[test]
fn adds_constants() {
  let m = TestModule::new(&[], &[ValType::I32]);
  m.validate(&[Instruction::I32Const(1), Instruction::I32Const(2), Instruction::I32Add, Instruction::End])
    .unwrap();
}

#[test]
fn unreachable_makes_the_stack_polymorphic() {
  let m = TestModule::new(&[], &[ValType::F64]);
  m.validate(&[Instruction::Unreachable, Instruction::I64Const(1), Instruction::I64Add, Instruction::Drop, Instruction::End])
    .unwrap();
}

#[test]
fn type_mismatch_points_at_the_instruction() {
  let m = TestModule::new(&[], &[ValType::F64]);
  let bytes = m.encode(&[Instruction::I32Const(0), Instruction::End]);
  let err = wasm::validate(&bytes, Features::ALL).unwrap_err();
  assert_eq!(err.message, "type mismatch: expression has type i32 but expected f64");
  assert_eq!(err.offset, bytes.len() - 1);
}

#[test]
fn leftover_values_fail_at_end() {
  let m = TestModule::new(&[], &[]);
  assert_eq!(
    message(m.validate(&[Instruction::I32Const(0), Instruction::End])),
    "unused values not explicitly dropped by end of block"
  );
}

#[test]
fn untyped_select_rejects_references() {
  let m = TestModule::new(&[], &[]);
  let refs = [
    Instruction::RefNull(FUNCREF_NULL),
    Instruction::RefNull(FUNCREF_NULL),
    Instruction::I32Const(0),
  ];
  let mut body = refs.to_vec();
  body.extend([Instruction::Select, Instruction::Drop, Instruction::End]);
  assert_eq!(message(m.validate(&body)), "invalid types for untyped select");

  let mut body = refs.to_vec();
  body.extend([Instruction::TypedSelect(ValType::FUNCREF), Instruction::Drop, Instruction::End]);
  m.validate(&body).unwrap();
}

// =============================================================================
// Control flow
// =============================================================================

#[test]
fn branch_arity_is_checked() {
  let m = TestModule::new(&[], &[]);
  let body = [
    Instruction::Block(BlockType::Result(ValType::I32)),
    Instruction::Br(0),
    Instruction::End,
    Instruction::Drop,
    Instruction::End,
  ];
  assert_eq!(message(m.validate(&body)), "popping value from empty stack");
}

#[test]
fn loop_branches_carry_params() {
  let m = TestModule::new(&[], &[]).with_type(&[ValType::I32], &[]);
  m.validate(&[
    Instruction::I32Const(0),
    Instruction::Loop(BlockType::FunctionType(1)),
    Instruction::Br(0),
    Instruction::End,
    Instruction::End,
  ])
  .unwrap();

  let err = m.validate(&[
    Instruction::I32Const(0),
    Instruction::Loop(BlockType::FunctionType(1)),
    Instruction::Drop,
    Instruction::Br(0),
    Instruction::End,
    Instruction::End,
  ]);
  assert_eq!(message(err), "popping value from empty stack");
}

#[test]
fn else_restores_if_params() {
  let m = TestModule::new(&[ValType::I32], &[ValType::I32]).with_type(&[ValType::I32], &[ValType::I32]);
  m.validate(&[
    Instruction::I32Const(5),
    Instruction::LocalGet(0),
    Instruction::If(BlockType::FunctionType(1)),
    Instruction::I32Const(1),
    Instruction::I32Add,
    Instruction::Else,
    Instruction::I32Const(2),
    Instruction::I32Sub,
    Instruction::End,
    Instruction::End,
  ])
  .unwrap();
}

#[test]
fn if_without_else_passes_params_through() {
  let m = TestModule::new(&[], &[ValType::I32]).with_type(&[ValType::I32], &[ValType::I32]);
  m.validate(&[
    Instruction::I32Const(1),
    Instruction::I32Const(1),
    Instruction::If(BlockType::FunctionType(1)),
    Instruction::End,
    Instruction::End,
  ])
  .unwrap();

  let m = TestModule::new(&[], &[ValType::I32]);
  let err = m.validate(&[
    Instruction::I32Const(1),
    Instruction::If(BlockType::Result(ValType::I32)),
    Instruction::I32Const(1),
    Instruction::End,
    Instruction::End,
  ]);
  assert_eq!(message(err), "if without else with a result value");
}

#[test]
fn br_table_targets_share_arity() {
  let m = TestModule::new(&[], &[]);
  let body = |inner: BlockType| {
    vec![
      Instruction::Block(BlockType::Empty),
      Instruction::Block(inner),
      Instruction::I32Const(5),
      Instruction::I32Const(0),
      Instruction::BrTable(vec![0].into(), 1),
      Instruction::End,
      Instruction::Drop,
      Instruction::End,
      Instruction::End,
    ]
  };
  assert_eq!(
    message(m.validate(&body(BlockType::Result(ValType::I32)))),
    "br_table targets must all have the same arity"
  );
}

#[test]
fn bytes_after_the_final_end_are_rejected() {
  let m = TestModule::new(&[], &[]);
  assert_eq!(
    message(m.validate(&[Instruction::End, Instruction::Nop])),
    "function body length mismatch"
  );
}

// =============================================================================
// Locals and references
// =============================================================================

#[test]
fn non_nullable_locals_reset_at_block_end() {
  let func_ref = ValType::Ref(RefType {
    nullable: false,
    heap_type: HeapType::Concrete(0),
  });
  let m = TestModule::new(&[], &[]).with_locals(&[(1, func_ref)]);

  m.validate(&[Instruction::RefFunc(0), Instruction::LocalSet(0), Instruction::LocalGet(0), Instruction::Drop, Instruction::End])
    .unwrap();

  let err = m.validate(&[
    Instruction::I32Const(1),
    Instruction::If(BlockType::Empty),
    Instruction::RefFunc(0),
    Instruction::LocalSet(0),
    Instruction::Else,
    Instruction::RefFunc(0),
    Instruction::LocalSet(0),
    Instruction::End,
    Instruction::LocalGet(0),
    Instruction::Drop,
    Instruction::End,
  ]);
  assert_eq!(message(err), "local.get read from unset local");
}

#[test]
fn call_ref_through_a_declared_function() {
  let m = TestModule::new(&[], &[]);
  m.validate(&[Instruction::RefFunc(0), Instruction::CallRef(0), Instruction::End]).unwrap();
}

#[test]
fn br_on_null_leaves_a_non_null_reference() {
  let m = TestModule::new(&[], &[]);
  m.validate(&[
    Instruction::Block(BlockType::Empty),
    Instruction::RefNull(FUNCREF_NULL),
    Instruction::BrOnNull(0),
    Instruction::Drop,
    Instruction::End,
    Instruction::End,
  ])
  .unwrap();
}

// =============================================================================
// Memory
// =============================================================================

#[test]
fn loads_need_a_memory() {
  let body = [Instruction::I32Const(0), Instruction::I32Load(memarg(2)), Instruction::Drop, Instruction::End];
  let m = TestModule::new(&[], &[]);
  assert_eq!(message(m.validate(&body)), "can't touch memory without memory");

  let m = TestModule::new(&[], &[]).with_memory(false, false);
  m.validate(&body).unwrap();

  let body = [Instruction::I32Const(0), Instruction::I32Load(memarg(3)), Instruction::Drop, Instruction::End];
  assert_eq!(message(m.validate(&body)), "greater than natural alignment");
}

#[test]
fn memory64_addresses_are_i64() {
  let m = TestModule::new(&[], &[]).with_memory(true, false);
  let err = m.validate(&[Instruction::I32Const(0), Instruction::I32Load(memarg(2)), Instruction::Drop, Instruction::End]);
  assert_eq!(message(err), "type mismatch: expression has type i32 but expected i64");
  m.validate(&[Instruction::I64Const(0), Instruction::I32Load(memarg(2)), Instruction::Drop, Instruction::End])
    .unwrap();
  m.validate(&[Instruction::MemorySize(0), Instruction::I64Const(1), Instruction::I64Add, Instruction::Drop, Instruction::End])
    .unwrap();
}

#[test]
fn atomics_need_natural_alignment() {
  let m = TestModule::new(&[], &[]).with_memory(false, true);
  m.validate(&[Instruction::I32Const(0), Instruction::I32AtomicLoad(memarg(2)), Instruction::Drop, Instruction::End])
    .unwrap();
  let err = m.validate(&[Instruction::I32Const(0), Instruction::I32AtomicLoad(memarg(1)), Instruction::Drop, Instruction::End]);
  assert_eq!(message(err), "not natural alignment");
}

#[test]
fn memory_init_needs_a_data_count_section() {
  let body = [
    Instruction::I32Const(0),
    Instruction::I32Const(0),
    Instruction::I32Const(3),
    Instruction::MemoryInit { mem: 0, data_index: 0 },
    Instruction::End,
  ];
  let m = TestModule::new(&[], &[]).with_memory(false, false).with_passive_data(true);
  m.validate(&body).unwrap();

  let m = TestModule::new(&[], &[]).with_memory(false, false).with_passive_data(false);
  assert_eq!(message(m.validate(&body)), "memory.init requires a DataCount section");
}

// =============================================================================
// Exceptions
// =============================================================================

#[test]
fn try_catch_receives_the_tag_payload() {
  let m = TestModule::new(&[], &[]).with_type(&[ValType::I32], &[]).with_tag(1);
  m.validate(&[
    Instruction::Try(BlockType::Empty),
    Instruction::I32Const(1),
    Instruction::Throw(0),
    Instruction::Catch(0),
    Instruction::Drop,
    Instruction::CatchAll,
    Instruction::End,
    Instruction::End,
  ])
  .unwrap();

  let err = m.validate(&[
    Instruction::Try(BlockType::Empty),
    Instruction::CatchAll,
    Instruction::Catch(0),
    Instruction::Drop,
    Instruction::End,
    Instruction::End,
  ]);
  assert_eq!(message(err), "catch cannot follow a catch_all");
}

#[test]
fn rethrow_must_target_a_catch() {
  let m = TestModule::new(&[], &[]);
  let err = m.validate(&[Instruction::Try(BlockType::Empty), Instruction::Rethrow(0), Instruction::End, Instruction::End]);
  assert_eq!(message(err), "rethrow target was not a catch block");

  m.validate(&[
    Instruction::Try(BlockType::Empty),
    Instruction::CatchAll,
    Instruction::Rethrow(0),
    Instruction::End,
    Instruction::End,
  ])
  .unwrap();
}

#[test]
fn delegate_closes_the_try() {
  let m = TestModule::new(&[], &[]);
  m.validate(&[
    Instruction::Block(BlockType::Empty),
    Instruction::Try(BlockType::Empty),
    Instruction::Delegate(0),
    Instruction::End,
    Instruction::End,
  ])
  .unwrap();
}

#[test]
fn disabled_proposals_are_unknown_opcodes() {
  let m = TestModule::new(&[], &[]);
  let bytes = m.encode(&[Instruction::Try(BlockType::Empty), Instruction::End, Instruction::End]);
  let err = wasm::validate(&bytes, Features::MVP).unwrap_err();
  assert_eq!(err.message, "unrecognized opcode: 6 0");
}

// =============================================================================
// Properties
// =============================================================================

/// Turns arbitrary choices into a body that is well typed by construction,
/// dropping whatever is left on the stack before the final `end`.
fn well_typed_body(choices: &[u8]) -> Vec<Instruction<'static>> {
  let mut stack: Vec<ValType> = Vec::new();
  let mut body = Vec::new();
  for &c in choices {
    let top = stack.last().copied();
    let under = stack.len().checked_sub(2).map(|i| stack[i]);
    match c % 6 {
      0 => {
        body.push(Instruction::I32Const(i32::from(c)));
        stack.push(ValType::I32);
      }
      1 => {
        body.push(Instruction::I64Const(i64::from(c)));
        stack.push(ValType::I64);
      }
      2 if top.is_some() && top == under => {
        body.push(if top == Some(ValType::I32) { Instruction::I32Add } else { Instruction::I64Sub });
        stack.pop();
      }
      3 if top == Some(ValType::I32) => {
        body.push(Instruction::I64ExtendI32S);
        stack.pop();
        stack.push(ValType::I64);
      }
      3 if top == Some(ValType::I64) => {
        body.push(Instruction::I32WrapI64);
        stack.pop();
        stack.push(ValType::I32);
      }
      4 if top.is_some() => {
        body.push(Instruction::Drop);
        stack.pop();
      }
      5 => {
        body.extend([
          Instruction::Block(BlockType::Result(ValType::I32)),
          Instruction::I32Const(7),
          Instruction::End,
        ]);
        stack.push(ValType::I32);
      }
      _ => body.push(Instruction::Nop),
    }
  }
  body.extend(stack.iter().map(|_| Instruction::Drop));
  body.push(Instruction::End);
  body
}

proptest! {
  #[test]
  fn well_typed_bodies_validate(choices in proptest::collection::vec(any::<u8>(), 0..200)) {
    let m = TestModule::new(&[], &[]);
    prop_assert!(m.validate(&well_typed_body(&choices)).is_ok());
  }

  #[test]
  fn a_misplaced_operand_is_caught(choices in proptest::collection::vec(any::<u8>(), 0..100)) {
    let m = TestModule::new(&[], &[]);
    let mut body = well_typed_body(&choices);
    body.pop();
    body.extend([Instruction::I32Const(0), Instruction::F64Neg, Instruction::End]);
    let bytes = m.encode(&body);
    let err = wasm::validate(&bytes, Features::ALL).unwrap_err();
    prop_assert_eq!(err.message, "type mismatch: expression has type i32 but expected f64");
    prop_assert_eq!(err.offset, bytes.len() - 2);
  }
}
