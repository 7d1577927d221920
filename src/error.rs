use std::fmt;

/// What went wrong, independent of where.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    #[error("unknown opcode")]
    UnknownOpcode,
    #[error("unreachable executed")]
    UnreachableExecuted,
    #[error("segmentation fault")]
    SegmentationFault,
    #[error("stack overflow")]
    StackOverflow,
    #[error("stack underflow")]
    StackUnderflow,
    #[error("frame overflow")]
    FrameOverflow,
    #[error("frame underflow")]
    FrameUnderflow,
    #[error("type mismatch")]
    TypeMismatch,
    #[error("divide by zero")]
    DivideByZero,
    #[error("invalid jump")]
    InvalidJump,
    #[error("native function failed: {0}")]
    Native(String),
}

impl ErrorKind {
    /// Stable code used by the diagnostic registry.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::UnknownOpcode => "VM0001",
            ErrorKind::UnreachableExecuted => "VM0002",
            ErrorKind::SegmentationFault => "VM0003",
            ErrorKind::StackOverflow => "VM0004",
            ErrorKind::StackUnderflow => "VM0005",
            ErrorKind::FrameOverflow => "VM0006",
            ErrorKind::FrameUnderflow => "VM0007",
            ErrorKind::TypeMismatch => "VM0008",
            ErrorKind::DivideByZero => "VM0009",
            ErrorKind::InvalidJump => "VM0010",
            ErrorKind::Native(_) => "VM0011",
        }
    }
}

/// An [`ErrorKind`] annotated with the bytecode offset (and, from the
/// verifier, the basic block) where it was raised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub struct Error {
    pub kind: ErrorKind,
    pub offset: Option<usize>,
    pub block: Option<usize>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error { kind, offset: None, block: None }
    }

    /// Records `offset` unless an inner frame already did.
    pub fn at(mut self, offset: usize) -> Self {
        self.offset.get_or_insert(offset);
        self
    }

    pub fn in_block(mut self, block: usize) -> Self {
        self.block.get_or_insert(block);
        self
    }

    pub fn native(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Native(message.into()))
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(offset) = self.offset {
            write!(f, " at offset {offset}")?;
        }
        if let Some(block) = self.block {
            write!(f, " (block {block})")?;
        }
        Ok(())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_with_location() {
        let e = Error::new(ErrorKind::TypeMismatch).at(12).in_block(2);
        assert_eq!(e.to_string(), "type mismatch at offset 12 (block 2)");
    }

    #[test]
    fn display_without_location() {
        let e = Error::from(ErrorKind::DivideByZero);
        assert_eq!(e.to_string(), "divide by zero");
    }

    #[test]
    fn first_annotation_wins() {
        let e = Error::new(ErrorKind::StackUnderflow).at(3).at(9);
        assert_eq!(e.offset, Some(3));
    }

    #[test]
    fn native_message_in_display() {
        let e = Error::native("disk on fire");
        assert!(e.to_string().contains("disk on fire"));
        assert_eq!(e.kind.code(), "VM0011");
    }
}
