//! Linear-scan register allocation over the flattened IR of one
//! basic block.
//!
//! Three host registers are statically assigned (scratch, guest state
//! pointer, spill frame pointer); the remaining twelve form the free
//! pool. Each variable's live range ends at its last referencing
//! opcode; expired variables return their register — and, if spilled,
//! their slot — to the pools. When the pool runs dry, the first
//! variable not referenced by the current opcode is evicted to a
//! spill slot in the frame.

use rearm_core::ir::block::BasicBlock;
use rearm_core::ir::opcode::Op;
use rearm_core::ir::var::VarIdx;
use rearm_core::Error;

use crate::code_buffer::CodeBuffer;
use crate::x86_64::emitter;
use crate::x86_64::regs::{self, Reg, ALLOCATABLE, SPILL_SLOTS};

pub struct RegisterAllocator {
    /// Flattened op index of each variable's final reference, or -1.
    last_use: Vec<i32>,
    var_to_reg: Vec<Option<Reg>>,
    var_to_slot: Vec<Option<usize>>,
    free_regs: Vec<Reg>,
    free_slots: [bool; SPILL_SLOTS],
}

impl RegisterAllocator {
    pub fn new(block: &BasicBlock) -> RegisterAllocator {
        let n = block.vars.len();
        let mut last_use = vec![-1i32; n];
        for (location, op) in block.code.iter().enumerate() {
            let mut touch = |v: VarIdx| last_use[v.0 as usize] = location as i32;
            op.visit_reads(&mut touch);
            op.visit_writes(&mut touch);
        }

        RegisterAllocator {
            last_use,
            var_to_reg: vec![None; n],
            var_to_slot: vec![None; n],
            free_regs: ALLOCATABLE.to_vec(),
            free_slots: [true; SPILL_SLOTS],
        }
    }

    pub fn last_use(&self, var: VarIdx) -> i32 {
        self.last_use[var.0 as usize]
    }

    /// Ensure `var` is resident in a host register at `location`,
    /// emitting a reload if it was spilled. `op` is the opcode being
    /// lowered (its operands are ineligible for eviction).
    pub fn reg_for(
        &mut self,
        var: VarIdx,
        location: usize,
        op: &Op,
        buf: &mut CodeBuffer,
    ) -> Result<Reg, Error> {
        if let Some(reg) = self.var_to_reg[var.0 as usize] {
            return Ok(reg);
        }

        self.release_dead(location);
        let reg = self.find_free(location, op, buf)?;

        if let Some(slot) = self.var_to_slot[var.0 as usize].take() {
            emitter::mov_rm(buf, false, reg, regs::FRAME, regs::spill_slot_offset(slot));
            self.free_slots[slot] = true;
        }

        self.var_to_reg[var.0 as usize] = Some(reg);
        Ok(reg)
    }

    /// Return every expired variable's register (and spill slot) to
    /// the pools.
    fn release_dead(&mut self, location: usize) {
        for id in 0..self.var_to_reg.len() {
            if self.last_use[id] >= location as i32 {
                continue;
            }
            if let Some(reg) = self.var_to_reg[id].take() {
                self.free_regs.push(reg);
            }
            if let Some(slot) = self.var_to_slot[id].take() {
                self.free_slots[slot] = true;
            }
        }
    }

    fn find_free(&mut self, location: usize, op: &Op, buf: &mut CodeBuffer) -> Result<Reg, Error> {
        if let Some(reg) = self.free_regs.pop() {
            return Ok(reg);
        }

        // Evict the first variable the current opcode does not touch.
        for id in 0..self.var_to_reg.len() {
            let var = VarIdx(id as u32);
            if op.reads(var) || op.writes(var) {
                continue;
            }
            let Some(reg) = self.var_to_reg[id] else {
                continue;
            };

            let slot = match self.free_slots.iter().position(|&f| f) {
                Some(slot) => slot,
                None => return Err(Error::OutOfRegisters { location }),
            };
            self.free_slots[slot] = false;
            self.var_to_slot[id] = Some(slot);
            self.var_to_reg[id] = None;
            emitter::mov_mr(buf, false, regs::FRAME, regs::spill_slot_offset(slot), reg);
            return Ok(reg);
        }

        Err(Error::OutOfRegisters { location })
    }

    /// Allocatable caller-saved registers currently holding live
    /// variables; these must survive a helper call.
    pub fn live_caller_saved(&self) -> Vec<Reg> {
        regs::CALLER_SAVED_ALLOCATABLE
            .iter()
            .copied()
            .filter(|r| self.var_to_reg.contains(&Some(*r)))
            .collect()
    }

    /// Debug invariant: no variable's live range crosses a
    /// micro-block boundary (predicated regions may be skipped at
    /// run time, so values must not flow across them in registers).
    #[cfg(debug_assertions)]
    pub fn assert_no_live_across(&self, boundary: usize) {
        for (id, reg) in self.var_to_reg.iter().enumerate() {
            if reg.is_some() {
                debug_assert!(
                    self.last_use[id] < boundary as i32,
                    "variable {id} live across micro-block boundary {boundary}"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rearm_core::ir::block::BlockKey;
    use rearm_core::ir::opcode::AluKind;
    use rearm_core::ir::var::Operand;
    use rearm_core::psr::{Condition, Mode};
    use rearm_core::state::{GuestReg, GPR};

    fn block_with_pressure(live: usize) -> BasicBlock {
        // `live` loads followed by a chain of adds referencing all of
        // them at the end keeps every variable live simultaneously.
        let key = BlockKey {
            address: 8,
            mode: Mode::System,
            thumb: false,
        };
        let mut bb = BasicBlock::new(key);
        bb.begin_micro_block(Condition::AL);
        let vars: Vec<_> = (0..live)
            .map(|i| bb.gen_load_gpr(GuestReg::new(GPR::from_index(i as u32 % 8), Mode::System)))
            .collect();
        let mut acc = Operand::Var(vars[0]);
        for v in &vars[1..] {
            acc = Operand::Var(bb.gen_alu(AluKind::Add, acc, *v, false));
        }
        bb.gen_store_gpr(GuestReg::new(GPR::R0, Mode::System), acc);
        bb.finish();
        bb
    }

    #[test]
    fn last_use_pre_pass() {
        let bb = block_with_pressure(3);
        let alloc = RegisterAllocator::new(&bb);
        // First loaded var is last read by the first add (op index 3).
        assert_eq!(alloc.last_use(VarIdx(0)), 3);
        // Final accumulator is read by the trailing store.
        let final_var = VarIdx(bb.vars.len() as u32 - 1);
        assert_eq!(alloc.last_use(final_var), bb.code.len() as i32 - 1);
    }

    #[test]
    fn registers_released_after_last_use() {
        // a dies at op 1; b, allocated at op 2, must get a's register
        // back.
        let key = BlockKey {
            address: 8,
            mode: Mode::System,
            thumb: false,
        };
        let mut bb = BasicBlock::new(key);
        bb.begin_micro_block(Condition::AL);
        let a = bb.gen_load_gpr(GuestReg::new(GPR::R0, Mode::System));
        bb.gen_store_gpr(GuestReg::new(GPR::R1, Mode::System), a);
        let b = bb.gen_load_gpr(GuestReg::new(GPR::R2, Mode::System));
        bb.gen_store_gpr(GuestReg::new(GPR::R3, Mode::System), b);
        bb.finish();

        let mut alloc = RegisterAllocator::new(&bb);
        let mut buf = CodeBuffer::new(4096).unwrap();
        let ra = alloc.reg_for(a, 0, &bb.code[0].clone(), &mut buf).unwrap();
        let rb = alloc.reg_for(b, 2, &bb.code[2].clone(), &mut buf).unwrap();
        assert_eq!(ra, rb);
        // No spill or reload traffic was needed.
        assert_eq!(buf.offset(), 0);
    }

    #[test]
    fn spill_when_pool_exhausted() {
        // 14 simultaneously-live variables exceed the 12-register pool.
        let bb = block_with_pressure(14);
        let mut alloc = RegisterAllocator::new(&bb);
        let mut buf = CodeBuffer::new(16 * 1024).unwrap();

        let mut seen = Vec::new();
        for (loc, op) in bb.code.iter().enumerate() {
            let mut operands = Vec::new();
            op.visit_reads(&mut |v| operands.push(v));
            op.visit_writes(&mut |v| operands.push(v));
            for v in operands {
                let r = alloc.reg_for(v, loc, op, &mut buf).unwrap();
                seen.push(r);
            }
        }
        // A spill store must have been emitted at some point.
        assert!(buf.offset() > 0);
    }

    #[test]
    fn out_of_registers_when_slots_also_exhausted() {
        // More live vars than registers + slots.
        let bb = block_with_pressure(12 + SPILL_SLOTS + 2);
        let mut alloc = RegisterAllocator::new(&bb);
        let mut buf = CodeBuffer::new(64 * 1024).unwrap();

        let mut failed = None;
        'outer: for (loc, op) in bb.code.iter().enumerate() {
            let mut operands = Vec::new();
            op.visit_reads(&mut |v| operands.push(v));
            op.visit_writes(&mut |v| operands.push(v));
            for v in operands {
                if let Err(e) = alloc.reg_for(v, loc, op, &mut buf) {
                    failed = Some(e);
                    break 'outer;
                }
            }
        }
        assert!(matches!(failed, Some(Error::OutOfRegisters { .. })));
    }

    #[test]
    fn register_and_slot_sets_disjoint() {
        let bb = block_with_pressure(16);
        let mut alloc = RegisterAllocator::new(&bb);
        let mut buf = CodeBuffer::new(64 * 1024).unwrap();

        for (loc, op) in bb.code.iter().enumerate() {
            let mut operands = Vec::new();
            op.visit_reads(&mut |v| operands.push(v));
            op.visit_writes(&mut |v| operands.push(v));
            for v in operands {
                alloc.reg_for(v, loc, op, &mut buf).unwrap();
            }
            for id in 0..bb.vars.len() {
                let in_reg = alloc.var_to_reg[id].is_some();
                let in_slot = alloc.var_to_slot[id].is_some();
                assert!(!(in_reg && in_slot), "var {id} in both places");
            }
        }
    }
}
