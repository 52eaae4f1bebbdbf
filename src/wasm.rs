//! A single-pass WebAssembly validator.
//!
//! [`decode_module`] reads a binary module section by section into a
//! [`ModuleEnv`] and validates every function body against it with an
//! [`OpIter`], the operand and control stack state machine. Validation stops
//! at the first failure, reported as a [`ValidationError`] carrying the byte
//! offset of the offending construct.
//!
//! ```
//! use ferrojem::wasm::{self, Features};
//!
//! let empty = b"\0asm\x01\0\0\0";
//! assert!(wasm::validate(empty, Features::default()).is_ok());
//! ```

mod decoder;
mod env;
mod error;
mod module;
mod op_iter;
pub mod types;
mod validate;

pub use decoder::Decoder;
pub use env::{
  DataSegment, ElemMode, ElemSegment, Export, ExternKind, Features, FuncDesc, GlobalDesc, Import, MAX_BR_TABLE_ELEMS,
  MAX_FUNCS, MAX_LOCALS, MAX_PARAMS, MAX_RESULTS, MAX_TYPES, MemoryDesc, ModuleEnv, TableDesc, TagDesc,
};
pub use error::{Result, ValidationError};
pub use module::{decode_module, validate};
pub use op_iter::{
  BlockEnd, BlockType, ControlEntry, FieldWideningOp, LabelKind, LinearMemoryAddress, Op, OpIter, OpIterPolicy,
  ResultType, StackType, TypeAndValue, ValidatingPolicy,
};
pub use validate::{validate_function_body, validate_init_expr};
