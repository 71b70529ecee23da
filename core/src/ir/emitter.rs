//! IR builder surface: one method per opcode family, appending to
//! the open micro-block of a `BasicBlock`. The builders allocate
//! destination variables, wire operands, and do nothing else — this
//! is a faithful transcription surface, not an optimizer.

use crate::psr::Mode;
use crate::state::GuestReg;

use super::block::BasicBlock;
use super::opcode::{AluKind, Exception, MemAccess, Op, SatKind, ShiftKind};
use super::var::{DataType, Operand, Var, VarIdx};

impl BasicBlock {
    /// Allocate a fresh single-assignment variable.
    pub fn create_var(&mut self, ty: DataType, label: &'static str) -> VarIdx {
        let idx = VarIdx(self.vars.len() as u32);
        self.vars.push(Var {
            idx,
            ty,
            label: Some(label),
        });
        idx
    }

    fn var(&mut self, label: &'static str) -> VarIdx {
        self.create_var(DataType::U32, label)
    }

    // -- guest state --

    pub fn gen_load_gpr(&mut self, reg: GuestReg) -> VarIdx {
        let dst = self.var("gpr");
        self.push_op(Op::LoadGpr { dst, reg });
        dst
    }

    pub fn gen_store_gpr(&mut self, reg: GuestReg, src: impl Into<Operand>) {
        let src = src.into();
        self.push_op(Op::StoreGpr { reg, src });
    }

    pub fn gen_load_spsr(&mut self, mode: Mode) -> VarIdx {
        let dst = self.var("spsr");
        self.push_op(Op::LoadSpsr { dst, mode });
        dst
    }

    pub fn gen_store_spsr(&mut self, mode: Mode, src: impl Into<Operand>) {
        let src = src.into();
        self.push_op(Op::StoreSpsr { mode, src });
    }

    pub fn gen_load_cpsr(&mut self) -> VarIdx {
        let dst = self.var("cpsr_in");
        self.push_op(Op::LoadCpsr { dst });
        dst
    }

    pub fn gen_store_cpsr(&mut self, src: impl Into<Operand>) {
        let src = src.into();
        self.push_op(Op::StoreCpsr { src });
    }

    pub fn gen_write_cpsr_control(&mut self, src: impl Into<Operand>) {
        let src = src.into();
        self.push_op(Op::WriteCpsrControl { src });
    }

    // -- data processing --

    pub fn gen_alu(
        &mut self,
        kind: AluKind,
        lhs: impl Into<Operand>,
        rhs: impl Into<Operand>,
        set_flags: bool,
    ) -> VarIdx {
        let dst = self.var("alu");
        self.push_op(Op::Alu {
            kind,
            dst: Some(dst),
            lhs: lhs.into(),
            rhs: rhs.into(),
            set_flags,
        });
        dst
    }

    /// Comparison form: flags only, no destination.
    pub fn gen_alu_compare(
        &mut self,
        kind: AluKind,
        lhs: impl Into<Operand>,
        rhs: impl Into<Operand>,
    ) {
        self.push_op(Op::Alu {
            kind,
            dst: None,
            lhs: lhs.into(),
            rhs: rhs.into(),
            set_flags: true,
        });
    }

    pub fn gen_mov(&mut self, src: impl Into<Operand>, set_flags: bool) -> VarIdx {
        let dst = self.var("mov");
        self.push_op(Op::Mov {
            dst,
            src: src.into(),
            negate: false,
            set_flags,
        });
        dst
    }

    pub fn gen_mvn(&mut self, src: impl Into<Operand>, set_flags: bool) -> VarIdx {
        let dst = self.var("mvn");
        self.push_op(Op::Mov {
            dst,
            src: src.into(),
            negate: true,
            set_flags,
        });
        dst
    }

    pub fn gen_shift(
        &mut self,
        kind: ShiftKind,
        value: impl Into<Operand>,
        amount: impl Into<Operand>,
        set_carry: bool,
    ) -> VarIdx {
        let dst = self.var("shift");
        self.push_op(Op::Shift {
            kind,
            dst,
            value: value.into(),
            amount: amount.into(),
            set_carry,
        });
        dst
    }

    pub fn gen_set_carry(&mut self, value: bool) {
        self.push_op(Op::SetCarry { value });
    }

    pub fn gen_clz(&mut self, src: impl Into<Operand>) -> VarIdx {
        let dst = self.var("clz");
        self.push_op(Op::Clz {
            dst,
            src: src.into(),
        });
        dst
    }

    pub fn gen_saturating(
        &mut self,
        kind: SatKind,
        lhs: impl Into<Operand>,
        rhs: impl Into<Operand>,
    ) -> VarIdx {
        let dst = self.var("sat");
        self.push_op(Op::Saturating {
            kind,
            dst,
            lhs: lhs.into(),
            rhs: rhs.into(),
        });
        dst
    }

    // -- multiply --

    pub fn gen_mul(
        &mut self,
        lhs: impl Into<Operand>,
        rhs: impl Into<Operand>,
        acc: Option<Operand>,
        set_flags: bool,
    ) -> VarIdx {
        let dst = self.var("mul");
        self.push_op(Op::Mul {
            dst,
            lhs: lhs.into(),
            rhs: rhs.into(),
            acc,
            set_flags,
        });
        dst
    }

    pub fn gen_mul_long(
        &mut self,
        lhs: impl Into<Operand>,
        rhs: impl Into<Operand>,
        acc: Option<(Operand, Operand)>,
        signed: bool,
        set_flags: bool,
    ) -> (VarIdx, VarIdx) {
        let dst_lo = self.var("mul_lo");
        let dst_hi = self.var("mul_hi");
        self.push_op(Op::MulLong {
            dst_lo,
            dst_hi,
            lhs: lhs.into(),
            rhs: rhs.into(),
            acc,
            signed,
            set_flags,
        });
        (dst_lo, dst_hi)
    }

    pub fn gen_mul_half(
        &mut self,
        lhs: impl Into<Operand>,
        rhs: impl Into<Operand>,
        lhs_top: bool,
        rhs_top: bool,
        acc: Option<Operand>,
    ) -> VarIdx {
        let dst = self.var("mul16");
        self.push_op(Op::MulHalf {
            dst,
            lhs: lhs.into(),
            rhs: rhs.into(),
            lhs_top,
            rhs_top,
            acc,
        });
        dst
    }

    pub fn gen_mul_word_half(
        &mut self,
        lhs: impl Into<Operand>,
        rhs: impl Into<Operand>,
        rhs_top: bool,
        acc: Option<Operand>,
    ) -> VarIdx {
        let dst = self.var("mulw16");
        self.push_op(Op::MulWordHalf {
            dst,
            lhs: lhs.into(),
            rhs: rhs.into(),
            rhs_top,
            acc,
        });
        dst
    }

    #[allow(clippy::too_many_arguments)]
    pub fn gen_mul_half_long(
        &mut self,
        acc_lo: impl Into<Operand>,
        acc_hi: impl Into<Operand>,
        lhs: impl Into<Operand>,
        rhs: impl Into<Operand>,
        lhs_top: bool,
        rhs_top: bool,
    ) -> (VarIdx, VarIdx) {
        let dst_lo = self.var("mlal_lo");
        let dst_hi = self.var("mlal_hi");
        self.push_op(Op::MulHalfLong {
            dst_lo,
            dst_hi,
            acc_lo: acc_lo.into(),
            acc_hi: acc_hi.into(),
            lhs: lhs.into(),
            rhs: rhs.into(),
            lhs_top,
            rhs_top,
        });
        (dst_lo, dst_hi)
    }

    // -- flag folding --

    pub fn gen_update_nz(&mut self, cpsr: impl Into<Operand>) -> VarIdx {
        let dst = self.var("cpsr_out");
        self.push_op(Op::UpdateNz {
            dst,
            cpsr: cpsr.into(),
        });
        dst
    }

    pub fn gen_update_nzc(&mut self, cpsr: impl Into<Operand>) -> VarIdx {
        let dst = self.var("cpsr_out");
        self.push_op(Op::UpdateNzc {
            dst,
            cpsr: cpsr.into(),
        });
        dst
    }

    pub fn gen_update_nzcv(&mut self, cpsr: impl Into<Operand>) -> VarIdx {
        let dst = self.var("cpsr_out");
        self.push_op(Op::UpdateNzcv {
            dst,
            cpsr: cpsr.into(),
        });
        dst
    }

    pub fn gen_update_q(&mut self, cpsr: impl Into<Operand>) -> VarIdx {
        let dst = self.var("cpsr_out");
        self.push_op(Op::UpdateQ {
            dst,
            cpsr: cpsr.into(),
        });
        dst
    }

    // -- guest memory --

    pub fn gen_mem_read(&mut self, addr: impl Into<Operand>, access: MemAccess) -> VarIdx {
        let dst = self.var("data");
        self.push_op(Op::MemRead {
            dst,
            addr: addr.into(),
            access,
        });
        dst
    }

    pub fn gen_mem_write(
        &mut self,
        addr: impl Into<Operand>,
        src: impl Into<Operand>,
        access: MemAccess,
    ) {
        self.push_op(Op::MemWrite {
            addr: addr.into(),
            src: src.into(),
            access,
        });
    }

    // -- control flow --

    pub fn gen_flush(&mut self, pc: impl Into<Operand>, cpsr: impl Into<Operand>) -> VarIdx {
        let dst_pc = self.var("address_out");
        self.push_op(Op::Flush {
            dst_pc,
            pc: pc.into(),
            cpsr: cpsr.into(),
        });
        dst_pc
    }

    pub fn gen_flush_exchange(
        &mut self,
        addr: impl Into<Operand>,
        cpsr: impl Into<Operand>,
    ) -> (VarIdx, VarIdx) {
        let dst_pc = self.var("address_out");
        let dst_cpsr = self.var("cpsr_out");
        self.push_op(Op::FlushExchange {
            dst_pc,
            dst_cpsr,
            addr: addr.into(),
            cpsr: cpsr.into(),
        });
        (dst_pc, dst_cpsr)
    }

    pub fn gen_flush_no_switch(&mut self, pc: impl Into<Operand>, opcode_size: u32) -> VarIdx {
        let dst_pc = self.var("address_out");
        self.push_op(Op::FlushNoSwitch {
            dst_pc,
            pc: pc.into(),
            opcode_size,
        });
        dst_pc
    }

    pub fn gen_raise_exception(&mut self, exception: Exception, ret: impl Into<Operand>) {
        self.push_op(Op::RaiseException {
            exception,
            ret: ret.into(),
        });
    }

    // -- coprocessor --

    pub fn gen_cop_read(&mut self, cp: u8, opcode1: u8, cn: u8, cm: u8, opcode2: u8) -> VarIdx {
        let dst = self.var("cop");
        self.push_op(Op::CopRead {
            dst,
            cp,
            opcode1,
            cn,
            cm,
            opcode2,
        });
        dst
    }

    #[allow(clippy::too_many_arguments)]
    pub fn gen_cop_write(
        &mut self,
        src: impl Into<Operand>,
        cp: u8,
        opcode1: u8,
        cn: u8,
        cm: u8,
        opcode2: u8,
    ) {
        self.push_op(Op::CopWrite {
            src: src.into(),
            cp,
            opcode1,
            cn,
            cm,
            opcode2,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::block::BlockKey;
    use crate::state::GPR;

    fn block() -> BasicBlock {
        BasicBlock::new(BlockKey {
            address: 8,
            mode: Mode::System,
            thumb: false,
        })
    }

    #[test]
    fn builders_single_assign() {
        let mut bb = block();
        bb.begin_micro_block(crate::psr::Condition::AL);
        let a = bb.gen_load_gpr(GuestReg::new(GPR::R0, Mode::System));
        let b = bb.gen_alu(AluKind::Add, a, 3u32, true);
        let cpsr = bb.gen_load_cpsr();
        let cpsr2 = bb.gen_update_nzcv(cpsr);
        bb.gen_store_cpsr(cpsr2);
        bb.gen_store_gpr(GuestReg::new(GPR::R0, Mode::System), b);
        bb.finish();

        assert!(bb.ssa_violations().is_empty());
        assert_eq!(bb.vars.len(), 4);
        assert_eq!(bb.code.len(), 6);
    }

    #[test]
    fn reads_writes_queries() {
        let mut bb = block();
        bb.begin_micro_block(crate::psr::Condition::AL);
        let a = bb.gen_load_gpr(GuestReg::new(GPR::R1, Mode::System));
        let d = bb.gen_alu(AluKind::Sub, a, 1u32, false);
        bb.finish();

        let load = &bb.code[0];
        let sub = &bb.code[1];
        assert!(load.writes(a));
        assert!(!load.reads(a));
        assert!(sub.reads(a));
        assert!(sub.writes(d));
        assert!(!sub.writes(a));
    }

    #[test]
    fn call_ops_flagged() {
        let mut bb = block();
        bb.begin_micro_block(crate::psr::Condition::AL);
        let addr = bb.gen_load_gpr(GuestReg::new(GPR::R2, Mode::System));
        let v = bb.gen_mem_read(addr, MemAccess::word().with_rotate(true));
        bb.gen_store_gpr(GuestReg::new(GPR::R3, Mode::System), v);
        bb.finish();

        assert!(bb.code[1].is_call());
        assert!(!bb.code[0].is_call());
    }
}
