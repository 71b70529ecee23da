//! Basic blocks, micro-blocks, and block keys.

use crate::psr::{Condition, Mode, Psr};

use super::opcode::Op;
use super::var::Var;

/// Uniquely identifies a compilable guest code region: the pipeline
/// PC of its first instruction, the processor mode it was compiled
/// for, and the instruction set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockKey {
    /// Pipeline PC: first instruction address + 2 x instruction size.
    pub address: u32,
    pub mode: Mode,
    pub thumb: bool,
}

impl BlockKey {
    pub fn from_state(r15: u32, cpsr: Psr) -> BlockKey {
        BlockKey {
            address: r15,
            mode: cpsr.mode().unwrap_or(Mode::System),
            thumb: cpsr.thumb(),
        }
    }

    /// Size in bytes of one instruction in this block's set.
    pub const fn instruction_size(&self) -> u32 {
        if self.thumb {
            2
        } else {
            4
        }
    }

    /// Address of the first guest instruction (the key address minus
    /// the pipeline fetch offset).
    pub const fn first_instruction(&self) -> u32 {
        self.address.wrapping_sub(2 * self.instruction_size())
    }
}

/// A maximal run of IR opcodes guarded by one ARM condition code.
/// Control enters a micro-block all-or-nothing at its head.
#[derive(Debug, Clone, Copy)]
pub struct MicroBlock {
    pub condition: Condition,
    /// Half-open range into the block's flattened op list.
    pub start: usize,
    pub end: usize,
}

/// Where control goes when the block ends: the successor's key and
/// the condition under which it is taken. A conditional target
/// implies the fall-through successor at the block's sequential end.
#[derive(Debug, Clone, Copy)]
pub struct BranchTarget {
    pub key: BlockKey,
    pub condition: Condition,
}

/// A translated basic block: flattened IR over per-block arenas,
/// micro-block boundaries, and the successor descriptor.
#[derive(Debug)]
pub struct BasicBlock {
    pub key: BlockKey,
    /// Guest instructions translated into this block.
    pub length: u32,
    pub vars: Vec<Var>,
    pub code: Vec<Op>,
    pub micro_blocks: Vec<MicroBlock>,
    pub branch_target: Option<BranchTarget>,
    /// Start of the micro-block currently being filled.
    open_start: usize,
    open_condition: Condition,
}

impl BasicBlock {
    pub fn new(key: BlockKey) -> BasicBlock {
        BasicBlock {
            key,
            length: 0,
            vars: Vec::new(),
            code: Vec::new(),
            micro_blocks: Vec::new(),
            branch_target: None,
            open_start: 0,
            open_condition: Condition::AL,
        }
    }

    /// Close the open micro-block (if non-empty) and start a new one
    /// under `condition`.
    pub fn begin_micro_block(&mut self, condition: Condition) {
        self.seal_open();
        self.open_start = self.code.len();
        self.open_condition = condition;
    }

    /// Condition of the micro-block currently being filled.
    pub fn open_condition(&self) -> Condition {
        self.open_condition
    }

    /// Close the final micro-block. Must be called once, after the
    /// last opcode is appended.
    pub fn finish(&mut self) {
        self.seal_open();
    }

    fn seal_open(&mut self) {
        if self.code.len() > self.open_start {
            self.micro_blocks.push(MicroBlock {
                condition: self.open_condition,
                start: self.open_start,
                end: self.code.len(),
            });
        }
        self.open_start = self.code.len();
    }

    pub(super) fn push_op(&mut self, op: Op) {
        self.code.push(op);
    }

    /// Footprint of the guest code this block was translated from,
    /// as a half-open byte range. Used for range invalidation.
    pub fn guest_range(&self) -> (u32, u32) {
        let first = self.key.first_instruction();
        (
            first,
            first.wrapping_add(self.length * self.key.instruction_size()),
        )
    }

    /// Variables violating single assignment (written by zero ops is
    /// fine — dead label — but more than one write is a bug).
    /// Test support; translated blocks must return an empty list.
    pub fn ssa_violations(&self) -> Vec<super::var::VarIdx> {
        let mut writes = vec![0u32; self.vars.len()];
        for op in &self.code {
            op.visit_writes(&mut |v| writes[v.0 as usize] += 1);
        }
        writes
            .iter()
            .enumerate()
            .filter(|(_, &n)| n > 1)
            .map(|(i, _)| super::var::VarIdx(i as u32))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_pipeline_geometry() {
        let arm = BlockKey {
            address: 0x108,
            mode: Mode::System,
            thumb: false,
        };
        assert_eq!(arm.instruction_size(), 4);
        assert_eq!(arm.first_instruction(), 0x100);

        let thumb = BlockKey {
            address: 0x104,
            mode: Mode::System,
            thumb: true,
        };
        assert_eq!(thumb.instruction_size(), 2);
        assert_eq!(thumb.first_instruction(), 0x100);
    }

    #[test]
    fn micro_blocks_partition_code() {
        let key = BlockKey {
            address: 8,
            mode: Mode::System,
            thumb: false,
        };
        let mut bb = BasicBlock::new(key);
        bb.begin_micro_block(Condition::AL);
        let a = bb.create_var(crate::ir::DataType::U32, "a");
        bb.gen_store_gpr(
            crate::state::GuestReg::new(crate::state::GPR::R0, Mode::System),
            a,
        );
        bb.begin_micro_block(Condition::NE);
        bb.gen_store_gpr(
            crate::state::GuestReg::new(crate::state::GPR::R1, Mode::System),
            1u32,
        );
        bb.finish();

        assert_eq!(bb.micro_blocks.len(), 2);
        assert_eq!(bb.micro_blocks[0].condition, Condition::AL);
        assert_eq!(bb.micro_blocks[1].condition, Condition::NE);
        assert_eq!(bb.micro_blocks[0].end, bb.micro_blocks[1].start);
        assert_eq!(bb.micro_blocks[1].end, bb.code.len());
    }
}
