use std::fmt;
use std::rc::Rc;

use super::{Boxed, FunctionType, Kind, StructType, Type};
use crate::error::Result;
use crate::interpreter::Interpreter;

/// Objects that own references report them so a release can cascade.
pub trait Traceable {
    /// Pushes the heap address of every owned, non-null reference.
    fn trace(&self, out: &mut Vec<usize>);
}

/// A heap slot's contents.
pub enum HeapObject {
    /// A 64-bit integer too wide for a boxed payload.
    I64(i64),
    String(String),
    I32Array(Vec<i32>),
    I64Array(Vec<i64>),
    F32Array(Vec<f32>),
    F64Array(Vec<f64>),
    Array(Array),
    Struct(Struct),
    Function(Rc<Function>),
    Closure(Closure),
    NativeFunction(Rc<NativeFunction>),
}

impl HeapObject {
    /// Static type of the object, as the verifier would name it.
    pub fn typ(&self) -> Type {
        match self {
            HeapObject::I64(_) => Type::I64,
            HeapObject::String(_) => Type::String,
            HeapObject::I32Array(_) => Type::I32Array,
            HeapObject::I64Array(_) => Type::I64Array,
            HeapObject::F32Array(_) => Type::F32Array,
            HeapObject::F64Array(_) => Type::F64Array,
            HeapObject::Array(a) => Type::Array(Rc::clone(&a.elem)),
            HeapObject::Struct(s) => Type::Struct(Rc::clone(&s.typ)),
            HeapObject::Function(f) => Type::Function(Rc::clone(&f.typ)),
            HeapObject::Closure(c) => Type::Function(Rc::clone(&c.function.typ)),
            HeapObject::NativeFunction(n) => Type::Function(Rc::clone(&n.typ)),
        }
    }
}

impl Traceable for HeapObject {
    fn trace(&self, out: &mut Vec<usize>) {
        match self {
            HeapObject::Array(a) => a.trace(out),
            HeapObject::Struct(s) => s.trace(out),
            HeapObject::Closure(c) => c.trace(out),
            _ => {}
        }
    }
}

impl fmt::Debug for HeapObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapObject::I64(v) => write!(f, "I64({v})"),
            HeapObject::String(s) => write!(f, "String({s:?})"),
            HeapObject::I32Array(a) => write!(f, "I32Array({a:?})"),
            HeapObject::I64Array(a) => write!(f, "I64Array({a:?})"),
            HeapObject::F32Array(a) => write!(f, "F32Array({a:?})"),
            HeapObject::F64Array(a) => write!(f, "F64Array({a:?})"),
            HeapObject::Array(a) => write!(f, "Array({:?})", a.elems),
            HeapObject::Struct(s) => write!(f, "Struct({})", s.typ),
            HeapObject::Function(func) => write!(f, "Function({})", func.typ),
            HeapObject::Closure(c) => write!(f, "Closure({}, {:?})", c.function.typ, c.captures),
            HeapObject::NativeFunction(n) => write!(f, "NativeFunction({})", n.typ),
        }
    }
}

fn trace_boxed(values: &[Boxed], out: &mut Vec<usize>) {
    for v in values {
        if v.is_ref() && !v.is_null() {
            out.push(v.addr());
        }
    }
}

/// Generic array: every element is a boxed value with its own refcount.
#[derive(Debug, Clone)]
pub struct Array {
    pub elem: Rc<Type>,
    pub elems: Vec<Boxed>,
}

impl Array {
    pub fn new(elem: Rc<Type>, elems: Vec<Boxed>) -> Self {
        Array { elem, elems }
    }
}

impl Traceable for Array {
    fn trace(&self, out: &mut Vec<usize>) {
        trace_boxed(&self.elems, out);
    }
}

/// One decoded struct field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Field {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Ref(usize),
}

impl From<Boxed> for Field {
    fn from(v: Boxed) -> Self {
        match v.kind() {
            Kind::I32 => Field::I32(v.i32()),
            Kind::I64 => Field::I64(v.i64()),
            Kind::F32 => Field::F32(v.f32()),
            Kind::F64 => Field::F64(v.f64()),
            Kind::Ref => Field::Ref(v.addr()),
        }
    }
}

/// Struct instance: a raw byte buffer laid out by its [`StructType`].
#[derive(Debug, Clone)]
pub struct Struct {
    pub typ: Rc<StructType>,
    data: Vec<u8>,
}

impl Struct {
    /// All-zero instance; reference fields start out null.
    pub fn new(typ: Rc<StructType>) -> Self {
        let data = vec![0; typ.size()];
        Struct { typ, data }
    }

    fn bytes<const N: usize>(&self, i: usize) -> [u8; N] {
        let at = self.typ.offset(i);
        let mut buf = [0u8; N];
        buf.copy_from_slice(&self.data[at..at + N]);
        buf
    }

    /// Caller guarantees `i < typ.len()`.
    pub fn get(&self, i: usize) -> Field {
        match self.typ.fields[i].kind() {
            Kind::I32 => Field::I32(i32::from_le_bytes(self.bytes(i))),
            Kind::I64 => Field::I64(i64::from_le_bytes(self.bytes(i))),
            Kind::F32 => Field::F32(f32::from_le_bytes(self.bytes(i))),
            Kind::F64 => Field::F64(f64::from_le_bytes(self.bytes(i))),
            Kind::Ref => Field::Ref(u64::from_le_bytes(self.bytes(i)) as usize),
        }
    }

    /// Caller guarantees `i < typ.len()` and that `value` matches the
    /// field's kind.
    pub fn set(&mut self, i: usize, value: Field) {
        let at = self.typ.offset(i);
        match value {
            Field::I32(v) => self.data[at..at + 4].copy_from_slice(&v.to_le_bytes()),
            Field::I64(v) => self.data[at..at + 8].copy_from_slice(&v.to_le_bytes()),
            Field::F32(v) => self.data[at..at + 4].copy_from_slice(&v.to_le_bytes()),
            Field::F64(v) => self.data[at..at + 8].copy_from_slice(&v.to_le_bytes()),
            Field::Ref(addr) => self.data[at..at + 8].copy_from_slice(&(addr as u64).to_le_bytes()),
        }
    }
}

impl Traceable for Struct {
    fn trace(&self, out: &mut Vec<usize>) {
        for i in 0..self.typ.len() {
            if let Field::Ref(addr) = self.get(i)
                && addr != 0
            {
                out.push(addr);
            }
        }
    }
}

/// Bytecode function: signature, extra local count and code.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub typ: Rc<FunctionType>,
    /// Locals beyond the parameters, zero-initialised as null refs.
    pub locals: usize,
    pub code: Vec<u8>,
}

impl Function {
    pub fn new(typ: FunctionType, locals: usize, code: Vec<u8>) -> Self {
        Function { typ: Rc::new(typ), locals, code }
    }
}

/// A function paired with captured values. Captures occupy the local
/// slots right after the parameters.
#[derive(Debug, Clone)]
pub struct Closure {
    pub function: Rc<Function>,
    pub captures: Vec<Boxed>,
}

impl Traceable for Closure {
    fn trace(&self, out: &mut Vec<usize>) {
        trace_boxed(&self.captures, out);
    }
}

pub type NativeCallback = dyn Fn(&mut Interpreter, &[Boxed]) -> Result<Vec<Boxed>>;

/// Host capability callable from bytecode.
///
/// The callback owns its parameters: any reference parameter it does not
/// hand back among its results is released by the caller.
pub struct NativeFunction {
    pub typ: Rc<FunctionType>,
    pub callback: Box<NativeCallback>,
}

impl NativeFunction {
    pub fn new(
        typ: FunctionType,
        callback: impl Fn(&mut Interpreter, &[Boxed]) -> Result<Vec<Boxed>> + 'static,
    ) -> Self {
        NativeFunction { typ: Rc::new(typ), callback: Box::new(callback) }
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction").field("typ", &self.typ).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point() -> Rc<StructType> {
        Rc::new(StructType::new(vec![Type::I32, Type::F64, Type::String, Type::I64]))
    }

    #[test]
    fn struct_fields_roundtrip() {
        let mut s = Struct::new(point());
        s.set(0, Field::I32(-7));
        s.set(1, Field::F64(2.5));
        s.set(2, Field::Ref(9));
        s.set(3, Field::I64(i64::MIN));
        assert_eq!(s.get(0), Field::I32(-7));
        assert_eq!(s.get(1), Field::F64(2.5));
        assert_eq!(s.get(2), Field::Ref(9));
        assert_eq!(s.get(3), Field::I64(i64::MIN));
    }

    #[test]
    fn default_struct_is_zeroed() {
        let s = Struct::new(point());
        assert_eq!(s.get(0), Field::I32(0));
        assert_eq!(s.get(2), Field::Ref(0));
    }

    #[test]
    fn struct_traces_non_null_refs() {
        let mut s = Struct::new(point());
        let mut out = Vec::new();
        s.trace(&mut out);
        assert!(out.is_empty());
        s.set(2, Field::Ref(4));
        s.trace(&mut out);
        assert_eq!(out, vec![4]);
    }

    #[test]
    fn array_traces_refs_only() {
        let a = Array::new(
            Rc::new(Type::Ref),
            vec![Boxed::from_ref(3), Boxed::NULL, Boxed::from_i32(5), Boxed::from_ref(8)],
        );
        let mut out = Vec::new();
        a.trace(&mut out);
        assert_eq!(out, vec![3, 8]);
    }

    #[test]
    fn closure_traces_captures() {
        let f = Rc::new(Function::new(FunctionType::default(), 1, vec![]));
        let c = Closure { function: f, captures: vec![Boxed::from_ref(2)] };
        let mut out = Vec::new();
        HeapObject::Closure(c).trace(&mut out);
        assert_eq!(out, vec![2]);
    }

    #[test]
    fn object_types() {
        assert_eq!(HeapObject::String("x".into()).typ(), Type::String);
        assert_eq!(HeapObject::I64(1 << 60).typ(), Type::I64);
        let f = Rc::new(Function::new(FunctionType::new(vec![Type::I32], vec![]), 0, vec![]));
        assert!(matches!(HeapObject::Function(f).typ(), Type::Function(_)));
    }
}
