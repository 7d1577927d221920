//! A stack bytecode virtual machine over NaN-boxed values.
//!
//! Bytecode is partitioned into basic blocks ([`cfg`]), type-checked by
//! abstract interpretation ([`verify`]) and executed by the [`Interpreter`]
//! against a reference-counted [`Heap`].

pub mod bytecode;
pub mod cfg;
pub mod diagnostic;
pub mod error;
pub mod heap;
pub mod interpreter;
pub mod program;
pub mod value;
pub mod verify;

pub use bytecode::{disassemble, marshal, unmarshal, Instruction, Opcode};
pub use error::{Error, ErrorKind, Result};
pub use heap::Heap;
pub use interpreter::{Interpreter, Options};
pub use program::{Program, Value};
pub use value::{Boxed, Kind, Type};
pub use verify::Verifier;
