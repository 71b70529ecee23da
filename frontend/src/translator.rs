//! Basic-block assembly: fetch, predicate grouping, and the lifter
//! driving loop. One `Translator` compiles one block.

use rearm_core::bus::{Bus, Coprocessor, Memory};
use rearm_core::config::Model;
use rearm_core::ir::block::{BasicBlock, BlockKey, BranchTarget};
use rearm_core::ir::var::Operand;
use rearm_core::psr::{Condition, Mode};
use rearm_core::state::{GuestReg, GPR};
use rearm_core::Error;

use crate::{arm, thumb};

/// Outcome of lifting one guest instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Keep translating sequentially.
    Continue,
    /// Keep translating, but re-evaluate the predicate first: the
    /// instruction may have changed the flags it is guarded by.
    BreakMicroBlock,
    /// The instruction ended the block (PC write, exception,
    /// code-mapping change).
    BreakBasicBlock,
    /// Reserved encoding. Fatal to the compile.
    Unimplemented,
}

/// Lifts the guest basic block identified by one `BlockKey`.
pub struct Translator<'a> {
    pub(crate) memory: &'a mut dyn Memory,
    pub(crate) coprocessors: &'a [Option<Box<dyn Coprocessor>>],
    pub(crate) armv5te: bool,
    block_size: usize,

    pub(crate) mode: Mode,
    pub(crate) thumb_mode: bool,
    pub(crate) opcode_size: u32,
    /// Address of the instruction currently being lifted.
    pub(crate) code_address: u32,
    pub(crate) block: BasicBlock,
    /// Set by the Thumb BL/BLX prefix lifter when it consumed the
    /// following halfword as well.
    pub(crate) extra_halfword: bool,
}

impl<'a> Translator<'a> {
    pub fn new(
        memory: &'a mut dyn Memory,
        coprocessors: &'a [Option<Box<dyn Coprocessor>>],
        model: Model,
        block_size: usize,
        key: BlockKey,
    ) -> Translator<'a> {
        let opcode_size = key.instruction_size();
        Translator {
            memory,
            coprocessors,
            armv5te: model.is_armv5te(),
            block_size,
            mode: key.mode,
            thumb_mode: key.thumb,
            opcode_size,
            code_address: key.first_instruction(),
            block: BasicBlock::new(key),
            extra_halfword: false,
        }
    }

    pub fn translate(mut self) -> Result<BasicBlock, Error> {
        let status = if self.thumb_mode {
            self.translate_thumb()?
        } else {
            self.translate_arm()?
        };

        match status {
            Status::BreakBasicBlock => {
                // A conditional block end leaves the not-taken path
                // without a PC update; store the fall-through address
                // under the inverse predicate.
                let cond = self.block.open_condition();
                if cond != Condition::AL {
                    let fall = self.code_address + 3 * self.opcode_size;
                    self.block.begin_micro_block(cond.invert());
                    let reg = self.guest_reg(15);
                    self.block.gen_store_gpr(reg, fall);
                }
            }
            _ => {
                // Fall through to the sequentially next instruction.
                debug_assert!(self.block.branch_target.is_none());
                let fall = self.code_address + 2 * self.opcode_size;
                self.block.begin_micro_block(Condition::AL);
                let reg = self.guest_reg(15);
                self.block.gen_store_gpr(reg, fall);
                self.block.branch_target = Some(BranchTarget {
                    key: BlockKey {
                        address: fall,
                        mode: self.mode,
                        thumb: self.thumb_mode,
                    },
                    condition: Condition::AL,
                });
            }
        }

        self.block.finish();
        tracing::trace!(
            address = self.block.key.address,
            thumb = self.block.key.thumb,
            length = self.block.length,
            micro_blocks = self.block.micro_blocks.len(),
            "translated block"
        );
        Ok(self.block)
    }

    fn translate_arm(&mut self) -> Result<Status, Error> {
        let mut status = Status::Continue;

        for i in 0..self.block_size {
            let instruction = self.memory.read_word(self.code_address, Bus::Code);
            let mut condition = Condition::from_bits(instruction >> 28);

            // ARMv5TE+ treats NV as a separate encoding space for
            // unpredicated instructions.
            if self.armv5te && condition == Condition::NV {
                condition = Condition::AL;
            }

            if i == 0 || condition != self.block.open_condition() {
                self.block.begin_micro_block(condition);
            }

            status = arm::decode_arm(instruction, self);
            if status == Status::Unimplemented {
                return Err(Error::UnknownOpcode {
                    opcode: instruction,
                    address: self.code_address,
                    thumb: false,
                });
            }

            self.block.length += 1;

            if status == Status::BreakMicroBlock && condition != Condition::AL {
                self.block.begin_micro_block(condition);
            }
            if status == Status::BreakBasicBlock {
                break;
            }

            self.code_address += 4;
        }

        Ok(status)
    }

    fn translate_thumb(&mut self) -> Result<Status, Error> {
        let mut status = Status::Continue;

        for i in 0..self.block_size {
            // Fetch 32 bits so the halfword after the current one is
            // visible (Thumb long branches span two halfwords).
            let instruction = if self.code_address & 2 != 0 {
                let lo = self.memory.read_half(self.code_address, Bus::Code) as u32;
                let hi = self.memory.read_half(self.code_address + 2, Bus::Code) as u32;
                lo | (hi << 16)
            } else {
                self.memory.read_word(self.code_address, Bus::Code)
            };

            // The conditional branch is Thumb's only predicated form;
            // give it its own micro-block.
            if (instruction & 0xF000) == 0xD000 && (instruction & 0x0F00) < 0x0E00 {
                let condition = Condition::from_bits((instruction >> 8) & 0xF);
                if i == 0 || condition != self.block.open_condition() {
                    self.block.begin_micro_block(condition);
                }
            } else if i == 0 || self.block.open_condition() != Condition::AL {
                self.block.begin_micro_block(Condition::AL);
            }

            self.extra_halfword = false;
            status = thumb::decode_thumb(instruction, self);
            if status == Status::Unimplemented {
                return Err(Error::UnknownOpcode {
                    opcode: instruction & 0xFFFF,
                    address: self.code_address,
                    thumb: true,
                });
            }

            self.block.length += 1;
            if self.extra_halfword {
                self.block.length += 1;
                self.code_address += 2;
            }

            if status == Status::BreakBasicBlock {
                break;
            }

            self.code_address += 2;
        }

        Ok(status)
    }

    // -- shared lifter helpers --

    /// The value architectural reads of r15 observe at the current
    /// instruction: two fetches ahead.
    pub(crate) fn pipeline_pc(&self) -> u32 {
        self.code_address + 2 * self.opcode_size
    }

    pub(crate) fn guest_reg(&self, index: u32) -> GuestReg {
        GuestReg::new(GPR::from_index(index), self.mode)
    }

    /// Read a guest register as an operand. PC reads materialize the
    /// pipeline constant.
    pub(crate) fn read_reg(&mut self, index: u32) -> Operand {
        if index == 15 {
            Operand::Const(self.pipeline_pc())
        } else {
            let reg = self.guest_reg(index);
            Operand::Var(self.block.gen_load_gpr(reg))
        }
    }

    /// Read a guest register where the register-specified-shift quirk
    /// applies: r15 reads one instruction further ahead.
    pub(crate) fn read_reg_shift_quirk(&mut self, index: u32) -> Operand {
        if index == 15 {
            Operand::Const(self.pipeline_pc() + self.opcode_size)
        } else {
            self.read_reg(index)
        }
    }

    /// Store the pipeline PC of the *next* instruction, so a block
    /// break resumes sequentially.
    pub(crate) fn emit_store_next_pc(&mut self) {
        let next = self.code_address + 3 * self.opcode_size;
        let reg = self.guest_reg(15);
        self.block.gen_store_gpr(reg, next);
    }

    /// Static branch: store the successor key address into r15 and
    /// record the successor descriptor under the current predicate.
    pub(crate) fn emit_static_branch(&mut self, target_address: u32, thumb: bool) {
        let r15 = target_address + if thumb { 4 } else { 8 };
        let reg = self.guest_reg(15);
        self.block.gen_store_gpr(reg, r15);
        self.block.branch_target = Some(BranchTarget {
            key: BlockKey {
                address: r15,
                mode: self.mode,
                thumb,
            },
            condition: self.block.open_condition(),
        });
    }

    /// Computed branch without a state exchange: align the target and
    /// apply the pipeline offset for the current instruction set.
    pub(crate) fn emit_flush(&mut self, target: Operand) {
        let cpsr = self.block.gen_load_cpsr();
        let pc = self.block.gen_flush(target, cpsr);
        let reg = self.guest_reg(15);
        self.block.gen_store_gpr(reg, pc);
    }

    /// Computed branch with interworking: bit 0 of the target selects
    /// the instruction set.
    pub(crate) fn emit_flush_exchange(&mut self, target: Operand) {
        let cpsr = self.block.gen_load_cpsr();
        let (pc, cpsr_out) = self.block.gen_flush_exchange(target, cpsr);
        let reg = self.guest_reg(15);
        self.block.gen_store_gpr(reg, pc);
        self.block.gen_store_cpsr(cpsr_out);
    }

    /// PC write from a load or ALU result: v5 cores interwork on
    /// loads, v4 cores never do.
    pub(crate) fn emit_load_to_pc(&mut self, target: Operand) {
        if self.armv5te {
            self.emit_flush_exchange(target);
        } else {
            self.emit_flush(target);
        }
    }

    /// Exception return: restore CPSR from the current mode's SPSR,
    /// then branch to `target` under the restored state.
    pub(crate) fn emit_exception_return(&mut self, target: Operand) {
        let spsr = self.block.gen_load_spsr(self.mode);
        self.block.gen_write_cpsr_control(spsr);
        let cpsr = self.block.gen_load_cpsr();
        let pc = self.block.gen_flush(target, cpsr);
        let reg = self.guest_reg(15);
        self.block.gen_store_gpr(reg, pc);
    }

    // -- flag folding helpers --

    pub(crate) fn emit_update_nz(&mut self) {
        let cpsr = self.block.gen_load_cpsr();
        let out = self.block.gen_update_nz(cpsr);
        self.block.gen_store_cpsr(out);
    }

    pub(crate) fn emit_update_nzc(&mut self) {
        let cpsr = self.block.gen_load_cpsr();
        let out = self.block.gen_update_nzc(cpsr);
        self.block.gen_store_cpsr(out);
    }

    pub(crate) fn emit_update_nzcv(&mut self) {
        let cpsr = self.block.gen_load_cpsr();
        let out = self.block.gen_update_nzcv(cpsr);
        self.block.gen_store_cpsr(out);
    }

    pub(crate) fn emit_update_q(&mut self) {
        let cpsr = self.block.gen_load_cpsr();
        let out = self.block.gen_update_q(cpsr);
        self.block.gen_store_cpsr(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rearm_core::ir::opcode::Op;

    struct TestMem {
        data: Vec<u8>,
    }

    impl TestMem {
        fn from_words(words: &[u32]) -> TestMem {
            let mut data = Vec::new();
            for w in words {
                data.extend_from_slice(&w.to_le_bytes());
            }
            data.resize(data.len().max(256), 0);
            TestMem { data }
        }

        fn from_halves(halves: &[u16]) -> TestMem {
            let mut data = Vec::new();
            for h in halves {
                data.extend_from_slice(&h.to_le_bytes());
            }
            data.resize(data.len().max(256), 0);
            TestMem { data }
        }
    }

    impl Memory for TestMem {
        fn read_byte(&mut self, address: u32, _bus: Bus) -> u8 {
            self.data[address as usize]
        }
        fn read_half(&mut self, address: u32, _bus: Bus) -> u16 {
            let a = address as usize & !1;
            u16::from_le_bytes([self.data[a], self.data[a + 1]])
        }
        fn read_word(&mut self, address: u32, _bus: Bus) -> u32 {
            let a = address as usize & !3;
            u32::from_le_bytes([
                self.data[a],
                self.data[a + 1],
                self.data[a + 2],
                self.data[a + 3],
            ])
        }
        fn write_byte(&mut self, address: u32, value: u8, _bus: Bus) {
            self.data[address as usize] = value;
        }
        fn write_half(&mut self, address: u32, value: u16, _bus: Bus) {
            let a = address as usize & !1;
            self.data[a..a + 2].copy_from_slice(&value.to_le_bytes());
        }
        fn write_word(&mut self, address: u32, value: u32, _bus: Bus) {
            let a = address as usize & !3;
            self.data[a..a + 4].copy_from_slice(&value.to_le_bytes());
        }
    }

    const NO_COPS: &[Option<Box<dyn Coprocessor>>] = &[];

    fn arm_key(address: u32) -> BlockKey {
        BlockKey {
            address,
            mode: Mode::Supervisor,
            thumb: false,
        }
    }

    fn thumb_key(address: u32) -> BlockKey {
        BlockKey {
            address,
            mode: Mode::Supervisor,
            thumb: true,
        }
    }

    fn translate_arm(words: &[u32], model: Model, block_size: usize) -> BasicBlock {
        let mut mem = TestMem::from_words(words);
        Translator::new(&mut mem, NO_COPS, model, block_size, arm_key(8))
            .translate()
            .unwrap()
    }

    fn translate_thumb(halves: &[u16], model: Model, block_size: usize) -> BasicBlock {
        let mut mem = TestMem::from_halves(halves);
        Translator::new(&mut mem, NO_COPS, model, block_size, thumb_key(4))
            .translate()
            .unwrap()
    }

    #[test]
    fn micro_blocks_group_by_condition() {
        // MOVEQ r0,#1; MOVEQ r1,#2; MOVNE r2,#3; B .
        let bb = translate_arm(
            &[0x03A0_0001, 0x03A0_1002, 0x13A0_2003, 0xEAFF_FFFC],
            Model::Arm9,
            32,
        );
        let conds: Vec<_> = bb.micro_blocks.iter().map(|m| m.condition).collect();
        assert_eq!(
            conds,
            vec![Condition::EQ, Condition::NE, Condition::AL]
        );
        assert_eq!(bb.length, 4);
        assert!(bb.ssa_violations().is_empty());
    }

    #[test]
    fn block_size_ceiling_and_fall_through() {
        // Four MOVs, budget of two.
        let bb = translate_arm(
            &[0xE3A0_0001, 0xE3A0_1002, 0xE3A0_2003, 0xE3A0_3004],
            Model::Arm9,
            2,
        );
        assert_eq!(bb.length, 2);
        let bt = bb.branch_target.unwrap();
        assert_eq!(bt.condition, Condition::AL);
        // Fall-through key: next instruction (8) plus the pipeline offset.
        assert_eq!(bt.key.address, 8 + 8);
        assert!(!bt.key.thumb);

        // The fall-through PC store must be present.
        let stores_fall = bb.code.iter().any(|op| {
            matches!(op, Op::StoreGpr { reg, src: rearm_core::ir::var::Operand::Const(v) }
                if reg.reg == rearm_core::state::GPR::PC && *v == 16)
        });
        assert!(stores_fall);
    }

    #[test]
    fn unconditional_branch_sets_static_target() {
        // B . at address 0 (key 8): target r15 = 8.
        let bb = translate_arm(&[0xEAFF_FFFE], Model::Arm9, 32);
        let bt = bb.branch_target.unwrap();
        assert_eq!(bt.condition, Condition::AL);
        assert_eq!(bt.key.address, 8);
        assert_eq!(bb.length, 1);
    }

    #[test]
    fn conditional_branch_adds_inverse_fall_through() {
        // BEQ +0 → taken target key 8... plus inverse NE micro-block
        // storing the fall-through (12).
        let bb = translate_arm(&[0x0AFF_FFFE], Model::Arm9, 32);
        let bt = bb.branch_target.unwrap();
        assert_eq!(bt.condition, Condition::EQ);
        let last = bb.micro_blocks.last().unwrap();
        assert_eq!(last.condition, Condition::NE);
        let fall_store = &bb.code[last.start..last.end];
        assert!(fall_store.iter().any(|op| {
            matches!(op, Op::StoreGpr { src: rearm_core::ir::var::Operand::Const(12), .. })
        }));
    }

    #[test]
    fn pc_reads_see_pipeline_value() {
        // MOV r0, pc at address 0: r0 := 8.
        let bb = translate_arm(&[0xE1A0_000F], Model::Arm9, 1);
        let has_const = bb.code.iter().any(|op| {
            matches!(op, Op::Mov { src: rearm_core::ir::var::Operand::Const(8), .. })
        });
        assert!(has_const);
    }

    #[test]
    fn unknown_opcode_is_fatal() {
        // The architecturally undefined space (bits 27:25 = 011, bit 4 set).
        let mut mem = TestMem::from_words(&[0xE7F0_00F0]);
        let err = Translator::new(&mut mem, NO_COPS, Model::Arm9, 32, arm_key(8))
            .translate()
            .unwrap_err();
        assert_eq!(
            err,
            Error::UnknownOpcode {
                opcode: 0xE7F0_00F0,
                address: 0,
                thumb: false
            }
        );
    }

    #[test]
    fn flag_setting_breaks_micro_block_under_condition() {
        // ADDEQS r0, r0, #1; MOVEQ r1, #0 — the MOVEQ must re-test EQ.
        let bb = translate_arm(&[0x0290_0001, 0x03A0_1000, 0xEAFF_FFFC], Model::Arm9, 32);
        let eq_blocks = bb
            .micro_blocks
            .iter()
            .filter(|m| m.condition == Condition::EQ)
            .count();
        assert_eq!(eq_blocks, 2);
    }

    #[test]
    fn thumb_conditional_branch_gets_own_micro_block() {
        // MOV r0,#5; BEQ +0; B .
        let bb = translate_thumb(&[0x2005, 0xD000, 0xE7FE], Model::Arm9, 32);
        let conds: Vec<_> = bb.micro_blocks.iter().map(|m| m.condition).collect();
        assert!(conds.contains(&Condition::EQ));
        assert!(bb.ssa_violations().is_empty());
    }

    #[test]
    fn thumb_bl_pair_folds_into_one_lift() {
        // BL with zero offset: prefix F000, suffix F802 → target = pc+4.
        let bb = translate_thumb(&[0xF000, 0xF802], Model::Arm9, 32);
        assert_eq!(bb.length, 2);
        let bt = bb.branch_target.unwrap();
        assert!(bt.key.thumb);
        // target = pipeline (4) + 4 → r15 = 8 + 4.
        assert_eq!(bt.key.address, 12);
    }

    #[test]
    fn thumb_blx_suffix_recognised_on_arm9() {
        // BLX pair: prefix F000, suffix E800 → exchange to ARM.
        let bb = translate_thumb(&[0xF000, 0xE800], Model::Arm9, 32);
        assert_eq!(bb.length, 2);
        let bt = bb.branch_target.unwrap();
        assert!(!bt.key.thumb);
    }

    #[test]
    fn thumb_blx_suffix_ignored_on_arm7() {
        // Same bytes on ARMv4T: the prefix stands alone (no BLX).
        let bb = translate_thumb(&[0xF000, 0xE800], Model::Arm7, 1);
        assert_eq!(bb.length, 1);
        let bt = bb.branch_target.unwrap();
        assert_eq!(bt.condition, Condition::AL);
        assert!(bt.key.thumb);
    }

    #[test]
    fn nv_predicate_rewritten_on_arm9() {
        // PLD is in the NV space and must decode on ARMv5TE.
        let bb = translate_arm(&[0xF5D0_F000, 0xEAFF_FFFD], Model::Arm9, 32);
        assert_eq!(bb.length, 2);
        assert!(bb
            .micro_blocks
            .iter()
            .all(|m| m.condition != Condition::NV));
    }

    #[test]
    fn nv_predicate_is_never_executed_on_arm7() {
        // On ARMv4 an NV instruction decodes normally but its
        // micro-block can never be entered.
        let bb = translate_arm(&[0xF3A0_0001, 0xEAFF_FFFD], Model::Arm7, 32);
        assert_eq!(bb.micro_blocks[0].condition, Condition::NV);
    }

    #[test]
    fn ldm_exception_return_uses_spsr() {
        // LDMFD sp!, {pc}^
        let bb = translate_arm(&[0xE8FD_8000], Model::Arm7, 32);
        assert!(bb
            .code
            .iter()
            .any(|op| matches!(op, Op::WriteCpsrControl { .. })));
        assert!(bb.branch_target.is_none());
    }

    #[test]
    fn swi_raises_exception_and_breaks() {
        let bb = translate_arm(&[0xEF00_0042], Model::Arm9, 32);
        assert!(bb
            .code
            .iter()
            .any(|op| matches!(op, Op::RaiseException { .. })));
        assert!(bb.branch_target.is_none());
        assert_eq!(bb.length, 1);
    }
}
