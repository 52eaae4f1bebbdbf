/// A validation failure, reported at the byte offset of the construct that
/// broke the rules (for function bodies, the offending opcode).
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("at offset {offset}: {message}")]
pub struct ValidationError {
  pub offset: usize,
  pub message: String,
}

impl ValidationError {
  pub fn new(offset: usize, message: impl Into<String>) -> Self {
    Self {
      offset,
      message: message.into(),
    }
  }
}

pub type Result<T> = core::result::Result<T, ValidationError>;
