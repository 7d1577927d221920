use std::fmt;
use std::rc::Rc;

use super::Kind;

/// Static type of a value, as seen by the verifier and by heap layouts.
///
/// `Ref` is the unknown (or null) reference; it is compatible with every
/// other reference type in both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    I32,
    I64,
    F32,
    F64,
    Ref,
    String,
    I32Array,
    I64Array,
    F32Array,
    F64Array,
    Array(Rc<Type>),
    Struct(Rc<StructType>),
    Function(Rc<FunctionType>),
}

impl Type {
    pub fn kind(&self) -> Kind {
        match self {
            Type::I32 => Kind::I32,
            Type::I64 => Kind::I64,
            Type::F32 => Kind::F32,
            Type::F64 => Kind::F64,
            _ => Kind::Ref,
        }
    }

    pub fn is_ref(&self) -> bool {
        self.kind() == Kind::Ref
    }

    /// Whether a value of type `actual` may flow where `self` is expected.
    pub fn accepts(&self, actual: &Type) -> bool {
        match (self, actual) {
            (Type::Ref, other) | (other, Type::Ref) => other.is_ref(),
            (expected, actual) => expected == actual,
        }
    }

    /// Element type of an array type, `None` for anything else.
    pub fn elem(&self) -> Option<Type> {
        match self {
            Type::I32Array => Some(Type::I32),
            Type::I64Array => Some(Type::I64),
            Type::F32Array => Some(Type::F32),
            Type::F64Array => Some(Type::F64),
            Type::Array(elem) => Some(Type::clone(elem)),
            _ => None,
        }
    }
}

impl From<Kind> for Type {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::I32 => Type::I32,
            Kind::I64 => Type::I64,
            Kind::F32 => Type::F32,
            Kind::F64 => Type::F64,
            Kind::Ref => Type::Ref,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::I32 => write!(f, "i32"),
            Type::I64 => write!(f, "i64"),
            Type::F32 => write!(f, "f32"),
            Type::F64 => write!(f, "f64"),
            Type::Ref => write!(f, "ref"),
            Type::String => write!(f, "string"),
            Type::I32Array => write!(f, "i32[]"),
            Type::I64Array => write!(f, "i64[]"),
            Type::F32Array => write!(f, "f32[]"),
            Type::F64Array => write!(f, "f64[]"),
            Type::Array(elem) => write!(f, "array<{elem}>"),
            Type::Struct(st) => write!(f, "{st}"),
            Type::Function(ft) => write!(f, "{ft}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FunctionType {
    pub params: Vec<Type>,
    pub returns: Vec<Type>,
}

impl FunctionType {
    pub fn new(params: Vec<Type>, returns: Vec<Type>) -> Self {
        FunctionType { params, returns }
    }
}

impl fmt::Display for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn(")?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 { write!(f, ", ")?; }
            write!(f, "{p}")?;
        }
        write!(f, ")")?;
        if !self.returns.is_empty() {
            write!(f, " -> ")?;
            for (i, r) in self.returns.iter().enumerate() {
                if i > 0 { write!(f, ", ")?; }
                write!(f, "{r}")?;
            }
        }
        Ok(())
    }
}

/// Field layout of a struct, computed once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructType {
    pub fields: Vec<Type>,
    offsets: Vec<usize>,
    size: usize,
}

impl StructType {
    pub fn new(fields: Vec<Type>) -> Self {
        let mut offsets = Vec::with_capacity(fields.len());
        let mut offset: usize = 0;
        for field in &fields {
            let width = field_size(field);
            offset = offset.next_multiple_of(width);
            offsets.push(offset);
            offset += width;
        }
        let size = offset.next_multiple_of(8);
        StructType { fields, offsets, size }
    }

    pub fn field(&self, i: usize) -> Option<&Type> {
        self.fields.get(i)
    }

    pub fn offset(&self, i: usize) -> usize {
        self.offsets[i]
    }

    pub fn field_size(&self, i: usize) -> usize {
        field_size(&self.fields[i])
    }

    /// Total byte size of the backing buffer.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

fn field_size(ty: &Type) -> usize {
    match ty.kind() {
        Kind::I32 | Kind::F32 => 4,
        Kind::I64 | Kind::F64 | Kind::Ref => 8,
    }
}

impl fmt::Display for StructType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "struct {{")?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 { write!(f, ", ")?; }
            write!(f, "{field}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_layout_aligns_fields() {
        let st = StructType::new(vec![Type::I32, Type::I64, Type::F32, Type::String]);
        assert_eq!(st.offset(0), 0);
        assert_eq!(st.offset(1), 8);
        assert_eq!(st.offset(2), 16);
        assert_eq!(st.offset(3), 24);
        assert_eq!(st.size(), 32);
    }

    #[test]
    fn struct_size_rounds_to_eight() {
        let st = StructType::new(vec![Type::I32]);
        assert_eq!(st.size(), 8);
        assert_eq!(StructType::new(vec![]).size(), 0);
    }

    #[test]
    fn ref_accepts_any_reference() {
        assert!(Type::Ref.accepts(&Type::String));
        assert!(Type::String.accepts(&Type::Ref));
        assert!(!Type::Ref.accepts(&Type::I32));
        assert!(!Type::I32.accepts(&Type::Ref));
        assert!(!Type::String.accepts(&Type::I32Array));
        assert!(Type::I64.accepts(&Type::I64));
    }

    #[test]
    fn array_elements() {
        assert_eq!(Type::I32Array.elem(), Some(Type::I32));
        assert_eq!(Type::Array(Rc::new(Type::String)).elem(), Some(Type::String));
        assert_eq!(Type::String.elem(), None);
    }

    #[test]
    fn display_function_type() {
        let ft = FunctionType::new(vec![Type::I32, Type::Ref], vec![Type::I64]);
        assert_eq!(ft.to_string(), "fn(i32, ref) -> i64");
        assert_eq!(Type::Array(Rc::new(Type::F64)).to_string(), "array<f64>");
    }
}
