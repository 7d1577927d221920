use std::fmt;
use std::rc::Rc;

use crate::bytecode::disassemble;
use crate::value::{Function, FunctionType, NativeFunction, Type};

/// A host-side constant. Scalars load straight onto the stack; everything
/// else is materialised on the heap once per interpreter.
#[derive(Debug, Clone)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    String(String),
    I32Array(Vec<i32>),
    I64Array(Vec<i64>),
    F32Array(Vec<f32>),
    F64Array(Vec<f64>),
    Function(Rc<Function>),
    NativeFunction(Rc<NativeFunction>),
}

impl Value {
    pub fn typ(&self) -> Type {
        match self {
            Value::I32(_) => Type::I32,
            Value::I64(_) => Type::I64,
            Value::F32(_) => Type::F32,
            Value::F64(_) => Type::F64,
            Value::String(_) => Type::String,
            Value::I32Array(_) => Type::I32Array,
            Value::I64Array(_) => Type::I64Array,
            Value::F32Array(_) => Type::F32Array,
            Value::F64Array(_) => Type::F64Array,
            Value::Function(f) => Type::Function(Rc::clone(&f.typ)),
            Value::NativeFunction(n) => Type::Function(Rc::clone(&n.typ)),
        }
    }
}

impl From<Function> for Value {
    fn from(f: Function) -> Self {
        Value::Function(Rc::new(f))
    }
}

impl From<NativeFunction> for Value {
    fn from(n: NativeFunction) -> Self {
        Value::NativeFunction(Rc::new(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

/// Entry code plus the constant pool and type table it indexes.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub code: Vec<u8>,
    pub constants: Vec<Value>,
    pub types: Vec<Type>,
}

impl Program {
    pub fn new(code: Vec<u8>) -> Self {
        Program { code, constants: Vec::new(), types: Vec::new() }
    }

    pub fn with_constants(mut self, constants: Vec<Value>) -> Self {
        self.constants = constants;
        self
    }

    pub fn with_types(mut self, types: Vec<Type>) -> Self {
        self.types = types;
        self
    }

    /// The entry code as a parameterless, returnless function.
    pub fn entry(&self) -> Function {
        Function::new(FunctionType::default(), 0, self.code.clone())
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", disassemble(&self.code))?;
        for (i, c) in self.constants.iter().enumerate() {
            if let Value::Function(func) = c {
                writeln!(f, "\nconst {i}: {} locals={}", func.typ, func.locals)?;
                write!(f, "{}", disassemble(&func.code))?;
            }
        }
        Ok(())
    }
}
