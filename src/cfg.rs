//! Control-flow graph over a function's bytecode.
//!
//! Blocks start at offset 0, at every branch target, and after every
//! terminator that has code following it. Edges are sorted and
//! de-duplicated so two graphs of the same code compare equal.

use std::fmt;

use crate::bytecode::{branch_targets, width_at, Opcode};
use crate::error::{Error, ErrorKind, Result};

/// Instruction range `[start, end)` with its edges as block indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    pub start: usize,
    pub end: usize,
    pub succs: Vec<usize>,
    pub preds: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Graph {
    blocks: Vec<BasicBlock>,
}

struct Scanned {
    op: Opcode,
    offset: usize,
    width: usize,
    targets: Vec<usize>,
}

fn scan(code: &[u8]) -> Result<Vec<Scanned>> {
    let mut out = Vec::new();
    let mut ip = 0;
    while ip < code.len() {
        let op = Opcode::from_u8(code[ip]).ok_or_else(|| Error::new(ErrorKind::UnknownOpcode).at(ip))?;
        let width = width_at(code, ip).ok_or_else(|| Error::new(ErrorKind::SegmentationFault).at(ip))?;
        let targets = branch_targets(code, ip, op, width)?;
        out.push(Scanned { op, offset: ip, width, targets });
        ip += width;
    }
    Ok(out)
}

impl Graph {
    pub fn build(code: &[u8]) -> Result<Graph> {
        let insts = scan(code)?;
        if insts.is_empty() {
            return Ok(Graph::default());
        }

        let boundaries: Vec<usize> = insts.iter().map(|i| i.offset).collect();
        let mut starts = vec![0];
        for inst in &insts {
            for &target in &inst.targets {
                if boundaries.binary_search(&target).is_err() {
                    return Err(Error::new(ErrorKind::InvalidJump).at(inst.offset));
                }
                starts.push(target);
            }
            let next = inst.offset + inst.width;
            if inst.op.is_terminator() && next < code.len() {
                starts.push(next);
            }
        }
        starts.sort_unstable();
        starts.dedup();

        let mut blocks: Vec<BasicBlock> = starts
            .iter()
            .enumerate()
            .map(|(i, &start)| BasicBlock {
                start,
                end: starts.get(i + 1).copied().unwrap_or(code.len()),
                succs: Vec::new(),
                preds: Vec::new(),
            })
            .collect();

        let index_of = |offset: usize| starts.binary_search(&offset).ok();
        let count = blocks.len();
        for (i, block) in blocks.iter_mut().enumerate() {
            // Last instruction is the one with the greatest offset below `end`.
            let last = boundaries.partition_point(|&o| o < block.end) - 1;
            let inst = &insts[last];
            for &target in &inst.targets {
                if let Some(b) = index_of(target) {
                    block.succs.push(b);
                }
            }
            let falls_through = match inst.op {
                Opcode::Br | Opcode::BrTable | Opcode::Return | Opcode::Unreachable => false,
                _ => true,
            };
            if falls_through && i + 1 < count {
                block.succs.push(i + 1);
            }
            block.succs.sort_unstable();
            block.succs.dedup();
        }

        for i in 0..count {
            for s in blocks[i].succs.clone() {
                blocks[s].preds.push(i);
            }
        }
        for block in &mut blocks {
            block.preds.sort_unstable();
            block.preds.dedup();
        }

        Ok(Graph { blocks })
    }

    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    pub fn block(&self, i: usize) -> Option<&BasicBlock> {
        self.blocks.get(i)
    }

    /// Index of the block containing `offset`.
    pub fn block_at(&self, offset: usize) -> Option<usize> {
        let i = self.blocks.partition_point(|b| b.start <= offset).checked_sub(1)?;
        (offset < self.blocks[i].end).then_some(i)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.blocks.iter().enumerate() {
            writeln!(f, "block {i} [{}, {}) succs={:?} preds={:?}", b.start, b.end, b.succs, b.preds)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{marshal, Instruction};

    fn inst(op: Opcode, operands: &[u64]) -> Instruction {
        Instruction::new(op, operands)
    }

    #[test]
    fn straight_line_is_one_block() {
        let code = marshal(&[
            inst(Opcode::I32Const, &[1]),
            inst(Opcode::I32Const, &[2]),
            inst(Opcode::I32Add, &[]),
        ]);
        let g = Graph::build(&code).unwrap();
        assert_eq!(g.len(), 1);
        assert_eq!(g.blocks()[0], BasicBlock { start: 0, end: 11, succs: vec![], preds: vec![] });
    }

    #[test]
    fn br_skips_dead_block() {
        // br 5 jumps over the first i32.const to the second.
        let code = marshal(&[
            inst(Opcode::Br, &[5]),
            inst(Opcode::I32Const, &[1]),
            inst(Opcode::I32Const, &[2]),
        ]);
        let g = Graph::build(&code).unwrap();
        assert_eq!(g.len(), 3);
        assert_eq!(g.blocks()[0].succs, vec![2]);
        assert!(g.blocks()[1].preds.is_empty());
        assert_eq!(g.blocks()[1].succs, vec![2]);
        assert_eq!(g.blocks()[2].preds, vec![0, 1]);
    }

    #[test]
    fn br_if_has_both_edges() {
        let code = marshal(&[
            inst(Opcode::I32Const, &[0]),
            inst(Opcode::BrIf, &[1]),
            inst(Opcode::Nop, &[]),
            inst(Opcode::Nop, &[]),
        ]);
        let g = Graph::build(&code).unwrap();
        let starts: Vec<usize> = g.blocks().iter().map(|b| b.start).collect();
        assert_eq!(starts, vec![0, 10, 11]);
        assert_eq!(g.blocks()[0].succs, vec![1, 2]);
        assert_eq!(g.blocks()[1].succs, vec![2]);
    }

    #[test]
    fn back_edge_loop() {
        // 0: nop; 1: i32.const 1; 6: br_if -10 (to 1)
        let code = marshal(&[
            inst(Opcode::Nop, &[]),
            inst(Opcode::I32Const, &[1]),
            inst(Opcode::BrIf, &[(-10i64) as u64]),
        ]);
        let g = Graph::build(&code).unwrap();
        assert_eq!(g.len(), 2);
        assert_eq!(g.blocks()[1].start, 1);
        assert_eq!(g.blocks()[1].succs, vec![1]);
        assert_eq!(g.blocks()[1].preds, vec![0, 1]);
    }

    #[test]
    fn br_table_edges_deduplicated() {
        let code = marshal(&[
            inst(Opcode::I32Const, &[0]),
            inst(Opcode::BrTable, &[2, 0, 1, 0]),
            inst(Opcode::Nop, &[]),
            inst(Opcode::Return, &[]),
        ]);
        let g = Graph::build(&code).unwrap();
        assert_eq!(g.len(), 3);
        assert_eq!(g.blocks()[0].succs, vec![1, 2]);
        assert!(g.blocks()[2].succs.is_empty());
    }

    #[test]
    fn code_after_return_starts_block() {
        let code = marshal(&[inst(Opcode::Return, &[]), inst(Opcode::Nop, &[])]);
        let g = Graph::build(&code).unwrap();
        assert_eq!(g.len(), 2);
        assert!(g.blocks()[0].succs.is_empty());
        assert!(g.blocks()[1].preds.is_empty());
    }

    #[test]
    fn unreachable_at_end_adds_nothing() {
        let code = marshal(&[inst(Opcode::Nop, &[]), inst(Opcode::Unreachable, &[])]);
        assert_eq!(Graph::build(&code).unwrap().len(), 1);
    }

    #[test]
    fn out_of_range_jump_fails() {
        let code = marshal(&[inst(Opcode::Nop, &[]), inst(Opcode::Br, &[100])]);
        let err = Graph::build(&code).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidJump);
        assert_eq!(err.offset, Some(1));
    }

    #[test]
    fn jump_into_instruction_fails() {
        let code = marshal(&[inst(Opcode::Br, &[1]), inst(Opcode::I32Const, &[1])]);
        assert_eq!(Graph::build(&code).unwrap_err().kind, ErrorKind::InvalidJump);
    }

    #[test]
    fn jump_to_end_fails() {
        let code = marshal(&[inst(Opcode::Br, &[0])]);
        assert_eq!(Graph::build(&code).unwrap_err().kind, ErrorKind::InvalidJump);
    }

    #[test]
    fn unknown_opcode_fails() {
        let err = Graph::build(&[0xEE]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownOpcode);
    }

    #[test]
    fn empty_code_has_no_blocks() {
        assert!(Graph::build(&[]).unwrap().is_empty());
    }

    #[test]
    fn rebuild_is_idempotent() {
        let code = marshal(&[
            inst(Opcode::I32Const, &[3]),
            inst(Opcode::BrIf, &[1]),
            inst(Opcode::Nop, &[]),
            inst(Opcode::I32Const, &[1]),
            inst(Opcode::Drop, &[]),
            inst(Opcode::Return, &[]),
        ]);
        let first = Graph::build(&code).unwrap();
        assert_eq!(first, Graph::build(&code).unwrap());

        // The suffix from block 2 has no jumps into it from the prefix that
        // it would lose, so its boundaries are the original ones shifted.
        let split = first.blocks()[2].start;
        let suffix = Graph::build(&code[split..]).unwrap();
        let shifted: Vec<(usize, usize)> = first.blocks()[2..].iter().map(|b| (b.start - split, b.end - split)).collect();
        let rebuilt: Vec<(usize, usize)> = suffix.blocks().iter().map(|b| (b.start, b.end)).collect();
        assert_eq!(rebuilt, shifted);
    }

    #[test]
    fn block_lookup() {
        let code = marshal(&[inst(Opcode::Br, &[5]), inst(Opcode::I32Const, &[1]), inst(Opcode::I32Const, &[2])]);
        let g = Graph::build(&code).unwrap();
        assert_eq!(g.block_at(0), Some(0));
        assert_eq!(g.block_at(4), Some(0));
        assert_eq!(g.block_at(5), Some(1));
        assert_eq!(g.block_at(12), Some(2));
        assert_eq!(g.block_at(15), None);
    }
}
