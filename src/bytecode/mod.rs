pub mod disasm;

use std::fmt;

use crate::error::{Error, ErrorKind, Result};

pub use disasm::disassemble;

// ── Opcodes ──────────────────────────────────────────────────────────
//
// One opcode byte followed by fixed-width little-endian operands. The one
// exception is BR_TABLE: [count:u16][case:i32 × count][default:i32].
// Branch displacements are relative to the next instruction.

macro_rules! opcodes {
    ($( $variant:ident = $byte:literal, $mnemonic:literal, [$($width:literal),*]; )*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $( $variant = $byte, )*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$( Opcode::$variant, )*];

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $( Opcode::$variant => $mnemonic, )*
                }
            }

            /// Byte widths of the fixed operand fields.
            pub fn widths(self) -> &'static [usize] {
                match self {
                    $( Opcode::$variant => &[$($width),*], )*
                }
            }
        }
    };
}

opcodes! {
    Nop              = 0x00, "nop", [];
    Unreachable      = 0x01, "unreachable", [];
    Drop             = 0x02, "drop", [];
    Dup              = 0x03, "dup", [];
    Swap             = 0x04, "swap", [];
    Select           = 0x05, "select", [];
    Br               = 0x06, "br", [4];
    BrIf             = 0x07, "br_if", [4];
    BrTable          = 0x08, "br_table", [2];
    Call             = 0x09, "call", [];
    Return           = 0x0A, "return", [];
    GlobalGet        = 0x0B, "global.get", [2];
    GlobalSet        = 0x0C, "global.set", [2];
    GlobalTee        = 0x0D, "global.tee", [2];
    LocalGet         = 0x0E, "local.get", [2];
    LocalSet         = 0x0F, "local.set", [2];
    LocalTee         = 0x10, "local.tee", [2];
    ConstGet         = 0x11, "const.get", [2];
    RefNull          = 0x12, "ref.null", [];
    RefIsNull        = 0x13, "ref.is_null", [];
    RefEq            = 0x14, "ref.eq", [];
    RefNe            = 0x15, "ref.ne", [];

    I32Const         = 0x20, "i32.const", [4];
    I32Eqz           = 0x21, "i32.eqz", [];
    I32Eq            = 0x22, "i32.eq", [];
    I32Ne            = 0x23, "i32.ne", [];
    I32LtS           = 0x24, "i32.lt_s", [];
    I32LtU           = 0x25, "i32.lt_u", [];
    I32GtS           = 0x26, "i32.gt_s", [];
    I32GtU           = 0x27, "i32.gt_u", [];
    I32LeS           = 0x28, "i32.le_s", [];
    I32LeU           = 0x29, "i32.le_u", [];
    I32GeS           = 0x2A, "i32.ge_s", [];
    I32GeU           = 0x2B, "i32.ge_u", [];
    I32Add           = 0x2C, "i32.add", [];
    I32Sub           = 0x2D, "i32.sub", [];
    I32Mul           = 0x2E, "i32.mul", [];
    I32DivS          = 0x2F, "i32.div_s", [];
    I32DivU          = 0x30, "i32.div_u", [];
    I32RemS          = 0x31, "i32.rem_s", [];
    I32RemU          = 0x32, "i32.rem_u", [];
    I32Shl           = 0x33, "i32.shl", [];
    I32ShrS          = 0x34, "i32.shr_s", [];
    I32ShrU          = 0x35, "i32.shr_u", [];
    I32Xor           = 0x36, "i32.xor", [];
    I32And           = 0x37, "i32.and", [];
    I32Or            = 0x38, "i32.or", [];
    I32ToI64S        = 0x39, "i32.to_i64_s", [];
    I32ToI64U        = 0x3A, "i32.to_i64_u", [];
    I32ToF32S        = 0x3B, "i32.to_f32_s", [];
    I32ToF32U        = 0x3C, "i32.to_f32_u", [];
    I32ToF64S        = 0x3D, "i32.to_f64_s", [];
    I32ToF64U        = 0x3E, "i32.to_f64_u", [];

    I64Const         = 0x40, "i64.const", [8];
    I64Eqz           = 0x41, "i64.eqz", [];
    I64Eq            = 0x42, "i64.eq", [];
    I64Ne            = 0x43, "i64.ne", [];
    I64LtS           = 0x44, "i64.lt_s", [];
    I64LtU           = 0x45, "i64.lt_u", [];
    I64GtS           = 0x46, "i64.gt_s", [];
    I64GtU           = 0x47, "i64.gt_u", [];
    I64LeS           = 0x48, "i64.le_s", [];
    I64LeU           = 0x49, "i64.le_u", [];
    I64GeS           = 0x4A, "i64.ge_s", [];
    I64GeU           = 0x4B, "i64.ge_u", [];
    I64Add           = 0x4C, "i64.add", [];
    I64Sub           = 0x4D, "i64.sub", [];
    I64Mul           = 0x4E, "i64.mul", [];
    I64DivS          = 0x4F, "i64.div_s", [];
    I64DivU          = 0x50, "i64.div_u", [];
    I64RemS          = 0x51, "i64.rem_s", [];
    I64RemU          = 0x52, "i64.rem_u", [];
    I64Shl           = 0x53, "i64.shl", [];
    I64ShrS          = 0x54, "i64.shr_s", [];
    I64ShrU          = 0x55, "i64.shr_u", [];
    I64Xor           = 0x56, "i64.xor", [];
    I64And           = 0x57, "i64.and", [];
    I64Or            = 0x58, "i64.or", [];
    I64ToI32         = 0x59, "i64.to_i32", [];
    I64ToF32S        = 0x5A, "i64.to_f32_s", [];
    I64ToF32U        = 0x5B, "i64.to_f32_u", [];
    I64ToF64S        = 0x5C, "i64.to_f64_s", [];
    I64ToF64U        = 0x5D, "i64.to_f64_u", [];

    F32Const         = 0x60, "f32.const", [4];
    F32Eq            = 0x61, "f32.eq", [];
    F32Ne            = 0x62, "f32.ne", [];
    F32Lt            = 0x63, "f32.lt", [];
    F32Gt            = 0x64, "f32.gt", [];
    F32Le            = 0x65, "f32.le", [];
    F32Ge            = 0x66, "f32.ge", [];
    F32Add           = 0x67, "f32.add", [];
    F32Sub           = 0x68, "f32.sub", [];
    F32Mul           = 0x69, "f32.mul", [];
    F32Div           = 0x6A, "f32.div", [];
    F32ToI32S        = 0x6B, "f32.to_i32_s", [];
    F32ToI32U        = 0x6C, "f32.to_i32_u", [];
    F32ToI64S        = 0x6D, "f32.to_i64_s", [];
    F32ToI64U        = 0x6E, "f32.to_i64_u", [];
    F32ToF64         = 0x6F, "f32.to_f64", [];

    F64Const         = 0x70, "f64.const", [8];
    F64Eq            = 0x71, "f64.eq", [];
    F64Ne            = 0x72, "f64.ne", [];
    F64Lt            = 0x73, "f64.lt", [];
    F64Gt            = 0x74, "f64.gt", [];
    F64Le            = 0x75, "f64.le", [];
    F64Ge            = 0x76, "f64.ge", [];
    F64Add           = 0x77, "f64.add", [];
    F64Sub           = 0x78, "f64.sub", [];
    F64Mul           = 0x79, "f64.mul", [];
    F64Div           = 0x7A, "f64.div", [];
    F64ToI32S        = 0x7B, "f64.to_i32_s", [];
    F64ToI32U        = 0x7C, "f64.to_i32_u", [];
    F64ToI64S        = 0x7D, "f64.to_i64_s", [];
    F64ToI64U        = 0x7E, "f64.to_i64_u", [];
    F64ToF32         = 0x7F, "f64.to_f32", [];

    StringLen        = 0x80, "string.len", [];
    StringConcat     = 0x81, "string.concat", [];
    StringEq         = 0x82, "string.eq", [];
    StringNe         = 0x83, "string.ne", [];

    ArrayNew         = 0x90, "array.new", [2, 2];
    ArrayNewDefault  = 0x91, "array.new_default", [2];
    ArrayLen         = 0x92, "array.len", [];
    ArrayGet         = 0x93, "array.get", [];
    ArraySet         = 0x94, "array.set", [];

    StructNew        = 0xA0, "struct.new", [2];
    StructNewDefault = 0xA1, "struct.new_default", [2];
    StructGet        = 0xA2, "struct.get", [2];
    StructSet        = 0xA3, "struct.set", [2];
}

static OPCODES: [Option<Opcode>; 256] = {
    let mut table = [None; 256];
    let mut i = 0;
    while i < Opcode::ALL.len() {
        let op = Opcode::ALL[i];
        table[op as usize] = Some(op);
        i += 1;
    }
    table
};

impl Opcode {
    #[inline(always)]
    pub fn from_u8(byte: u8) -> Option<Opcode> {
        OPCODES[byte as usize]
    }

    /// Total encoded width for every opcode except `BR_TABLE`, whose width
    /// depends on its case count.
    #[inline]
    pub fn width(self) -> usize {
        1 + self.widths().iter().sum::<usize>()
    }

    /// Ends a basic block.
    pub fn is_terminator(self) -> bool {
        matches!(self, Opcode::Br | Opcode::BrIf | Opcode::BrTable | Opcode::Return | Opcode::Unreachable)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

// ── Operand readers ──────────────────────────────────────────────────

#[inline(always)]
pub fn read_u16(code: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_le_bytes(code.get(at..at + 2)?.try_into().ok()?))
}

#[inline(always)]
pub fn read_i32(code: &[u8], at: usize) -> Option<i32> {
    Some(i32::from_le_bytes(code.get(at..at + 4)?.try_into().ok()?))
}

#[inline(always)]
pub fn read_u64(code: &[u8], at: usize) -> Option<u64> {
    Some(u64::from_le_bytes(code.get(at..at + 8)?.try_into().ok()?))
}

/// Encoded width of the instruction at `ip`, or `None` when the opcode is
/// unknown or the instruction runs past the end of `code`.
pub fn width_at(code: &[u8], ip: usize) -> Option<usize> {
    let op = Opcode::from_u8(*code.get(ip)?)?;
    let width = match op {
        Opcode::BrTable => {
            let count = read_u16(code, ip + 1)? as usize;
            1 + 2 + 4 * count + 4
        }
        _ => op.width(),
    };
    if ip + width > code.len() {
        return None;
    }
    Some(width)
}

/// Resolves `displacement` against the instruction that follows a branch.
pub fn jump_target(next: usize, displacement: i32) -> Option<usize> {
    next.checked_add_signed(displacement as isize)
}

/// Every jump target of the branch at `ip` (`BR_TABLE` cases then default).
/// Empty for non-branches.
pub fn branch_targets(code: &[u8], ip: usize, op: Opcode, width: usize) -> Result<Vec<usize>> {
    let next = ip + width;
    let invalid = || Error::new(ErrorKind::InvalidJump).at(ip);
    let displacements: Vec<i32> = match op {
        Opcode::Br | Opcode::BrIf => vec![read_i32(code, ip + 1).ok_or_else(invalid)?],
        Opcode::BrTable => {
            let count = read_u16(code, ip + 1).ok_or_else(invalid)? as usize;
            (0..=count)
                .map(|i| read_i32(code, ip + 3 + 4 * i).ok_or_else(invalid))
                .collect::<Result<_>>()?
        }
        _ => return Ok(Vec::new()),
    };
    displacements
        .into_iter()
        .map(|d| jump_target(next, d).ok_or_else(invalid))
        .collect()
}

// ── Instructions ─────────────────────────────────────────────────────

/// A decoded instruction. Operands are stored zero-extended; encoding
/// keeps only the low bytes of each field, so negative values can be
/// passed as `(-n) as u64`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operands: Vec<u64>,
}

impl Instruction {
    pub fn new(opcode: Opcode, operands: &[u64]) -> Self {
        Instruction { opcode, operands: operands.to_vec() }
    }

    /// Field widths in encoding order.
    fn field_widths(&self) -> Vec<usize> {
        match self.opcode {
            Opcode::BrTable => {
                let count = self.operands.first().copied().unwrap_or(0) as usize;
                let mut widths = vec![2];
                widths.extend(std::iter::repeat_n(4, count + 1));
                widths
            }
            op => op.widths().to_vec(),
        }
    }

    pub fn width(&self) -> usize {
        1 + self.field_widths().iter().sum::<usize>()
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.opcode as u8);
        for (i, w) in self.field_widths().into_iter().enumerate() {
            let v = self.operands.get(i).copied().unwrap_or(0);
            out.extend_from_slice(&v.to_le_bytes()[..w]);
        }
    }

    /// Decodes the instruction at `ip`.
    pub fn decode(code: &[u8], ip: usize) -> Result<Instruction> {
        let byte = *code.get(ip).ok_or_else(|| Error::new(ErrorKind::SegmentationFault).at(ip))?;
        let opcode = Opcode::from_u8(byte).ok_or_else(|| Error::new(ErrorKind::UnknownOpcode).at(ip))?;
        if width_at(code, ip).is_none() {
            return Err(Error::new(ErrorKind::SegmentationFault).at(ip));
        }
        let mut operands = Vec::new();
        let mut at = ip + 1;
        let mut widths = opcode.widths().to_vec();
        if opcode == Opcode::BrTable {
            let count = read_u16(code, at).unwrap_or(0) as usize;
            widths.extend(std::iter::repeat_n(4, count + 1));
        }
        for w in widths {
            let mut buf = [0u8; 8];
            buf[..w].copy_from_slice(&code[at..at + w]);
            operands.push(u64::from_le_bytes(buf));
            at += w;
        }
        Ok(Instruction { opcode, operands })
    }

    /// A missing operand reads as zero, as it encodes.
    fn operand(&self, i: usize) -> u64 {
        self.operands.get(i).copied().unwrap_or(0)
    }

    fn signed(&self, i: usize) -> i64 {
        self.operand(i) as u32 as i32 as i64
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode)?;
        match self.opcode {
            Opcode::I32Const | Opcode::Br | Opcode::BrIf => write!(f, " {}", self.signed(0)),
            Opcode::I64Const => write!(f, " {}", self.operand(0) as i64),
            Opcode::F32Const => write!(f, " {:?}", f32::from_bits(self.operand(0) as u32)),
            Opcode::F64Const => write!(f, " {:?}", f64::from_bits(self.operand(0))),
            Opcode::BrTable => {
                write!(f, " {}", self.operand(0))?;
                for i in 1..self.operands.len() {
                    write!(f, " {}", self.signed(i))?;
                }
                Ok(())
            }
            _ => {
                for v in &self.operands {
                    write!(f, " {v}")?;
                }
                Ok(())
            }
        }
    }
}

pub fn marshal(instructions: &[Instruction]) -> Vec<u8> {
    let mut out = Vec::with_capacity(instructions.iter().map(Instruction::width).sum());
    for inst in instructions {
        inst.encode_into(&mut out);
    }
    out
}

/// Decodes a whole stream. Unknown opcodes and truncated trailing
/// instructions are errors.
pub fn unmarshal(code: &[u8]) -> Result<Vec<Instruction>> {
    let mut out = Vec::new();
    let mut ip = 0;
    while ip < code.len() {
        let inst = Instruction::decode(code, ip)?;
        ip += inst.width();
        out.push(inst);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn opcode_table_matches_bytes() {
        for &op in Opcode::ALL {
            assert_eq!(Opcode::from_u8(op as u8), Some(op));
        }
        assert_eq!(Opcode::from_u8(0xFF), None);
        assert_eq!(Opcode::from_u8(0x19), None);
    }

    #[test]
    fn mnemonics_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for &op in Opcode::ALL {
            assert!(seen.insert(op.mnemonic()), "duplicate mnemonic {}", op.mnemonic());
        }
    }

    #[test]
    fn fixed_widths() {
        assert_eq!(Opcode::Nop.width(), 1);
        assert_eq!(Opcode::Br.width(), 5);
        assert_eq!(Opcode::LocalGet.width(), 3);
        assert_eq!(Opcode::I64Const.width(), 9);
        assert_eq!(Opcode::ArrayNew.width(), 5);
    }

    #[test]
    fn encode_negative_displacement() {
        let code = marshal(&[Instruction::new(Opcode::Br, &[(-5i64) as u64])]);
        assert_eq!(code, vec![Opcode::Br as u8, 0xFB, 0xFF, 0xFF, 0xFF]);
        assert_eq!(read_i32(&code, 1), Some(-5));
    }

    #[test]
    fn br_table_width_and_targets() {
        let inst = Instruction::new(Opcode::BrTable, &[2, 0, 1, (-1i64) as u64]);
        assert_eq!(inst.width(), 1 + 2 + 4 * 3);
        let mut code = marshal(&[inst]);
        code.extend_from_slice(&[Opcode::Nop as u8, Opcode::Nop as u8]);
        assert_eq!(width_at(&code, 0), Some(15));
        assert_eq!(branch_targets(&code, 0, Opcode::BrTable, 15).unwrap(), vec![15, 16, 14]);
    }

    #[test]
    fn truncated_instruction_is_rejected() {
        let mut code = marshal(&[Instruction::new(Opcode::I32Const, &[7])]);
        code.pop();
        assert_eq!(width_at(&code, 0), None);
        assert_eq!(unmarshal(&code).unwrap_err().kind, ErrorKind::SegmentationFault);
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let err = unmarshal(&[Opcode::Nop as u8, 0xEE]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownOpcode);
        assert_eq!(err.offset, Some(1));
    }

    #[test]
    fn negative_target_is_invalid() {
        let code = marshal(&[Instruction::new(Opcode::Br, &[(-100i64) as u64])]);
        let err = branch_targets(&code, 0, Opcode::Br, 5).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidJump);
    }

    #[test]
    fn display_signed_operands() {
        assert_eq!(Instruction::new(Opcode::I32Const, &[(-3i64) as u64]).to_string(), "i32.const -3");
        assert_eq!(Instruction::new(Opcode::F64Const, &[1.5f64.to_bits()]).to_string(), "f64.const 1.5");
        assert_eq!(Instruction::new(Opcode::LocalGet, &[2]).to_string(), "local.get 2");
    }

    #[test]
    fn display_missing_operands_as_zero() {
        assert_eq!(Instruction::new(Opcode::I32Const, &[]).to_string(), "i32.const 0");
        assert_eq!(Instruction::new(Opcode::F64Const, &[]).to_string(), "f64.const 0.0");
        assert_eq!(Instruction::new(Opcode::BrTable, &[]).to_string(), "br_table 0");
        assert_eq!(marshal(&[Instruction::new(Opcode::I32Const, &[])]), marshal(&[Instruction::new(Opcode::I32Const, &[0])]));
    }

    fn instruction() -> impl Strategy<Value = Instruction> {
        (0..Opcode::ALL.len(), any::<u64>(), 0u64..4, any::<u64>()).prop_map(|(i, a, count, b)| {
            let opcode = Opcode::ALL[i];
            let operands = match opcode {
                Opcode::BrTable => {
                    let mut ops = vec![count];
                    ops.extend((0..=count).map(|k| a.rotate_left(k as u32) & 0xFFFF_FFFF));
                    ops
                }
                _ => opcode
                    .widths()
                    .iter()
                    .enumerate()
                    .map(|(k, &w)| {
                        let v = if k == 0 { a } else { b };
                        if w == 8 { v } else { v & ((1u64 << (8 * w)) - 1) }
                    })
                    .collect(),
            };
            Instruction { opcode, operands }
        })
    }

    proptest! {
        #[test]
        fn marshal_unmarshal_roundtrip(insts in proptest::collection::vec(instruction(), 0..32)) {
            let code = marshal(&insts);
            let decoded = unmarshal(&code).unwrap();
            prop_assert_eq!(&decoded, &insts);
            prop_assert_eq!(marshal(&decoded), code);
        }
    }
}
