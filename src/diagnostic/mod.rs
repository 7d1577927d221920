pub mod ansi;
pub mod json;
pub mod registry;

use crate::error::{Error, ErrorKind};

/// Points at the instruction starting at `offset`.
#[derive(Debug, Clone)]
pub struct Label {
    pub offset: usize,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<&'static str>,
    pub message: String,
    pub labels: Vec<Label>,
    pub notes: Vec<String>,
    pub suggestion: Option<String>,
    /// Bytecode the labels index into.
    pub code_bytes: Option<Vec<u8>>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Diagnostic {
            code: None,
            message: message.into(),
            labels: Vec::new(),
            notes: Vec::new(),
            suggestion: None,
            code_bytes: None,
        }
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_offset(mut self, offset: usize, label: impl Into<String>) -> Self {
        self.labels.push(Label { offset, message: label.into() });
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_bytecode(mut self, code: &[u8]) -> Self {
        self.code_bytes = Some(code.to_vec());
        self
    }
}

fn hint(kind: &ErrorKind) -> Option<&'static str> {
    match kind {
        ErrorKind::StackUnderflow => Some("check that every path pushes the operands this instruction pops"),
        ErrorKind::SegmentationFault => Some("check the index against the table it reads from"),
        ErrorKind::InvalidJump => Some("displacements are relative to the instruction after the branch"),
        ErrorKind::DivideByZero => Some("test the divisor with i32.eqz or i64.eqz before dividing"),
        _ => None,
    }
}

impl From<&Error> for Diagnostic {
    fn from(e: &Error) -> Self {
        let mut d = Diagnostic::error(e.kind.to_string()).with_code(e.kind.code());
        if let Some(offset) = e.offset {
            d = d.with_offset(offset, "here");
        }
        if let Some(block) = e.block {
            d = d.with_note(format!("in basic block {block}"));
        }
        if let Some(h) = hint(&e.kind) {
            d = d.with_suggestion(h);
        }
        d
    }
}
