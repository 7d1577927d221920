pub mod object;
pub mod types;

use std::fmt;

pub use object::{Array, Closure, Field, Function, HeapObject, NativeCallback, NativeFunction, Struct, Traceable};
pub use types::{FunctionType, StructType, Type};

/// Runtime tag of a [`Boxed`] value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    I32,
    I64,
    F32,
    F64,
    Ref,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Kind::I32 => "i32",
            Kind::I64 => "i64",
            Kind::F32 => "f32",
            Kind::F64 => "f64",
            Kind::Ref => "ref",
        })
    }
}

// ── NaN-boxed value ──────────────────────────────────────────────────
//
// A positive quiet-NaN exponent (top 12 bits 0x7FF) with a non-zero
// mantissa carries a 3-bit tag in bits 51..49 and a 49-bit signed payload
// in bits 48..0. Everything else is a literal f64. NaN doubles are stored
// as the negative quiet NaN, which sits outside the tag space.

const EXP_MASK: u64       = 0xFFF0_0000_0000_0000;
const QNAN_EXP: u64       = 0x7FF0_0000_0000_0000;
const MANTISSA_MASK: u64  = 0x000F_FFFF_FFFF_FFFF;
const CANONICAL_NAN: u64  = 0xFFF8_0000_0000_0000;
const TAG_SHIFT: u32      = 49;
const TAG_BITS: u64       = 0x7;
const PAYLOAD_BITS: u32   = 49;
const PAYLOAD_MASK: u64   = (1 << PAYLOAD_BITS) - 1;

const TAG_I32: u64 = 1;
const TAG_I64: u64 = 2;
const TAG_F32: u64 = 3;
const TAG_REF: u64 = 4;

const BOXED_MIN: i64 = -(1 << (PAYLOAD_BITS - 1));
const BOXED_MAX: i64 = (1 << (PAYLOAD_BITS - 1)) - 1;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Boxed(u64);

impl Boxed {
    /// The null reference. Heap slot 0 is never allocated.
    pub const NULL: Boxed = Boxed::tagged(TAG_REF, 0);

    #[inline(always)]
    const fn tagged(tag: u64, payload: u64) -> Self {
        Boxed(QNAN_EXP | (tag << TAG_SHIFT) | (payload & PAYLOAD_MASK))
    }

    #[inline]
    pub fn from_i32(v: i32) -> Self {
        Boxed::tagged(TAG_I32, v as i64 as u64)
    }

    /// Caller must check [`Boxed::is_boxable`] first; wider values are
    /// truncated to the payload.
    #[inline]
    pub fn from_i64(v: i64) -> Self {
        debug_assert!(Boxed::is_boxable(v), "i64 {v} does not fit a boxed payload");
        Boxed::tagged(TAG_I64, v as u64)
    }

    #[inline]
    pub fn from_f32(v: f32) -> Self {
        Boxed::tagged(TAG_F32, v.to_bits() as u64)
    }

    #[inline]
    pub fn from_f64(v: f64) -> Self {
        if v.is_nan() {
            Boxed(CANONICAL_NAN)
        } else {
            Boxed(v.to_bits())
        }
    }

    #[inline]
    pub fn from_ref(addr: usize) -> Self {
        Boxed::tagged(TAG_REF, addr as u64)
    }

    /// Whether `v` fits the 49-bit payload. Values that don't must live on
    /// the heap.
    #[inline]
    pub fn is_boxable(v: i64) -> bool {
        (BOXED_MIN..=BOXED_MAX).contains(&v)
    }

    #[inline(always)]
    fn is_tagged(self) -> bool {
        (self.0 & EXP_MASK) == QNAN_EXP && (self.0 & MANTISSA_MASK) != 0
    }

    #[inline(always)]
    fn tag(self) -> u64 {
        (self.0 >> TAG_SHIFT) & TAG_BITS
    }

    #[inline(always)]
    fn payload(self) -> i64 {
        let shift = 64 - PAYLOAD_BITS;
        (((self.0 & PAYLOAD_MASK) << shift) as i64) >> shift
    }

    #[inline]
    pub fn kind(self) -> Kind {
        if !self.is_tagged() {
            return Kind::F64;
        }
        match self.tag() {
            TAG_I32 => Kind::I32,
            TAG_I64 => Kind::I64,
            TAG_F32 => Kind::F32,
            TAG_REF => Kind::Ref,
            _ => Kind::F64,
        }
    }

    #[inline]
    pub fn i32(self) -> i32 {
        self.payload() as i32
    }

    #[inline]
    pub fn i64(self) -> i64 {
        self.payload()
    }

    #[inline]
    pub fn f32(self) -> f32 {
        f32::from_bits(self.payload() as u32)
    }

    #[inline]
    pub fn f64(self) -> f64 {
        f64::from_bits(self.0)
    }

    /// Heap address of a `Ref`.
    #[inline]
    pub fn addr(self) -> usize {
        (self.0 & PAYLOAD_MASK) as usize
    }

    #[inline]
    pub fn is_ref(self) -> bool {
        self.kind() == Kind::Ref
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self == Boxed::NULL
    }

    /// Zero value of a kind: what fresh locals, array slots and struct
    /// fields start as.
    pub fn zero(kind: Kind) -> Self {
        match kind {
            Kind::I32 => Boxed::from_i32(0),
            Kind::I64 => Boxed::from_i64(0),
            Kind::F32 => Boxed::from_f32(0.0),
            Kind::F64 => Boxed::from_f64(0.0),
            Kind::Ref => Boxed::NULL,
        }
    }
}

impl Default for Boxed {
    fn default() -> Self {
        Boxed::NULL
    }
}

impl fmt::Debug for Boxed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Kind::I32 => write!(f, "I32({})", self.i32()),
            Kind::I64 => write!(f, "I64({})", self.i64()),
            Kind::F32 => write!(f, "F32({:?})", self.f32()),
            Kind::F64 => write!(f, "F64({:?})", self.f64()),
            Kind::Ref => write!(f, "Ref({})", self.addr()),
        }
    }
}

impl fmt::Display for Boxed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Kind::I32 => write!(f, "i32 {}", self.i32()),
            Kind::I64 => write!(f, "i64 {}", self.i64()),
            Kind::F32 => write!(f, "f32 {}", self.f32()),
            Kind::F64 => write!(f, "f64 {}", self.f64()),
            Kind::Ref if self.is_null() => write!(f, "ref null"),
            Kind::Ref => write!(f, "ref {}", self.addr()),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn i32_roundtrip() {
        for v in [0, 1, -1, i32::MIN, i32::MAX, 42] {
            let b = Boxed::from_i32(v);
            assert_eq!(b.kind(), Kind::I32);
            assert_eq!(b.i32(), v);
        }
    }

    #[test]
    fn i64_payload_edges() {
        assert!(Boxed::is_boxable(BOXED_MAX));
        assert!(Boxed::is_boxable(BOXED_MIN));
        assert!(!Boxed::is_boxable(BOXED_MAX + 1));
        assert!(!Boxed::is_boxable(BOXED_MIN - 1));
        assert!(!Boxed::is_boxable(i64::MAX));

        for v in [0, -1, 3_628_800, BOXED_MAX, BOXED_MIN] {
            let b = Boxed::from_i64(v);
            assert_eq!(b.kind(), Kind::I64);
            assert_eq!(b.i64(), v);
        }
    }

    #[test]
    fn f32_keeps_bits() {
        for v in [0.0f32, -0.0, 1.5, f32::INFINITY, f32::MIN_POSITIVE] {
            let b = Boxed::from_f32(v);
            assert_eq!(b.kind(), Kind::F32);
            assert_eq!(b.f32().to_bits(), v.to_bits());
        }
        assert!(Boxed::from_f32(f32::NAN).f32().is_nan());
    }

    #[test]
    fn f64_is_never_tagged() {
        for v in [0.0, -0.0, 1.0, f64::INFINITY, f64::NEG_INFINITY, f64::MAX, f64::MIN_POSITIVE] {
            let b = Boxed::from_f64(v);
            assert_eq!(b.kind(), Kind::F64);
            assert_eq!(b.f64().to_bits(), v.to_bits());
        }
    }

    #[test]
    fn nan_canonicalised_outside_tag_space() {
        let positive_nan = f64::from_bits(0x7FF8_0000_0000_0001);
        let b = Boxed::from_f64(positive_nan);
        assert_eq!(b.kind(), Kind::F64);
        assert!(b.f64().is_nan());
    }

    #[test]
    fn refs_and_null() {
        let b = Boxed::from_ref(17);
        assert_eq!(b.kind(), Kind::Ref);
        assert_eq!(b.addr(), 17);
        assert!(!b.is_null());
        assert!(Boxed::NULL.is_null());
        assert_eq!(Boxed::NULL.kind(), Kind::Ref);
        assert_eq!(Boxed::NULL.addr(), 0);
    }

    #[test]
    fn zero_values() {
        assert_eq!(Boxed::zero(Kind::I32).i32(), 0);
        assert_eq!(Boxed::zero(Kind::I64).kind(), Kind::I64);
        assert_eq!(Boxed::zero(Kind::F64).f64(), 0.0);
        assert!(Boxed::zero(Kind::Ref).is_null());
    }

    #[test]
    fn display_and_debug() {
        assert_eq!(Boxed::from_i32(3).to_string(), "i32 3");
        assert_eq!(format!("{:?}", Boxed::from_i64(-2)), "I64(-2)");
        assert_eq!(Boxed::NULL.to_string(), "ref null");
    }
}
