use std::fmt::Write;

use super::{width_at, Instruction};

/// Renders `offset:\tmnemonic operand…`, one instruction per line. An
/// undecodable instruction renders as `<invalid>` and ends the listing.
pub fn disassemble(code: &[u8]) -> String {
    let mut out = String::new();
    let mut ip = 0;
    while ip < code.len() {
        match Instruction::decode(code, ip) {
            Ok(inst) => {
                let _ = writeln!(out, "{ip}:\t{inst}");
                ip += inst.width();
            }
            Err(_) => {
                let _ = writeln!(out, "{ip}:\t<invalid>");
                break;
            }
        }
    }
    out
}

/// The single rendered instruction at `offset`, if an instruction starts
/// there and decodes.
pub fn line_at(code: &[u8], offset: usize) -> Option<String> {
    let mut ip = 0;
    while ip < offset {
        ip += width_at(code, ip)?;
    }
    if ip != offset {
        return None;
    }
    Instruction::decode(code, offset).ok().map(|inst| inst.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{marshal, Opcode};

    #[test]
    fn listing_has_offsets() {
        let code = marshal(&[
            Instruction::new(Opcode::I32Const, &[1]),
            Instruction::new(Opcode::I32Const, &[2]),
            Instruction::new(Opcode::I32Add, &[]),
        ]);
        assert_eq!(disassemble(&code), "0:\ti32.const 1\n5:\ti32.const 2\n10:\ti32.add\n");
    }

    #[test]
    fn invalid_opcode_halts() {
        let code = vec![Opcode::Nop as u8, 0xEE, Opcode::Nop as u8];
        assert_eq!(disassemble(&code), "0:\tnop\n1:\t<invalid>\n");
    }

    #[test]
    fn truncated_tail_is_invalid() {
        let code = vec![Opcode::Drop as u8, Opcode::LocalGet as u8, 0];
        assert_eq!(disassemble(&code), "0:\tdrop\n1:\t<invalid>\n");
    }

    #[test]
    fn br_table_listing() {
        let code = marshal(&[Instruction::new(Opcode::BrTable, &[1, 0, 0])]);
        assert_eq!(disassemble(&code), "0:\tbr_table 1 0 0\n");
    }

    #[test]
    fn single_line_lookup() {
        let code = marshal(&[Instruction::new(Opcode::Nop, &[]), Instruction::new(Opcode::LocalGet, &[3])]);
        assert_eq!(line_at(&code, 1).as_deref(), Some("local.get 3"));
        assert_eq!(line_at(&code, 2), None);
        assert_eq!(line_at(&code, 4), None);
    }

    #[test]
    fn operand_bytes_are_not_instructions() {
        // The operand of `local.get 3` is also the byte for another opcode.
        let code = marshal(&[Instruction::new(Opcode::LocalGet, &[3]), Instruction::new(Opcode::Drop, &[])]);
        assert_eq!(line_at(&code, 0).as_deref(), Some("local.get 3"));
        assert_eq!(line_at(&code, 1), None);
        assert_eq!(line_at(&code, 3).as_deref(), Some("drop"));
    }
}
