//! SWI, BKPT, CLZ, the saturating arithmetic family, and PLD.

use rearm_core::ir::opcode::{Exception, SatKind};
use rearm_core::ir::var::Operand;

use crate::translator::{Status, Translator};

pub(crate) fn arm_swi(t: &mut Translator, _insn: u32) -> Status {
    let ret = t.code_address + 4;
    t.block
        .gen_raise_exception(Exception::SoftwareInterrupt, Operand::Const(ret));
    Status::BreakBasicBlock
}

/// BKPT (ARMv5TE) enters the prefetch-abort vector.
pub(crate) fn arm_bkpt(t: &mut Translator, _insn: u32) -> Status {
    let ret = t.code_address + 4;
    t.block
        .gen_raise_exception(Exception::PrefetchAbort, Operand::Const(ret));
    Status::BreakBasicBlock
}

pub(crate) fn arm_clz(t: &mut Translator, insn: u32) -> Status {
    let rd = (insn >> 12) & 0xF;
    let rm = insn & 0xF;
    let src = t.read_reg(rm);
    let result = t.block.gen_clz(src);
    let reg = t.guest_reg(rd);
    t.block.gen_store_gpr(reg, result);
    Status::Continue
}

/// QADD / QSUB / QDADD / QDSUB (ARMv5TE).
pub(crate) fn arm_saturating(t: &mut Translator, insn: u32) -> Status {
    let kind = match (insn >> 21) & 0x3 {
        0 => SatKind::Add,
        1 => SatKind::Sub,
        2 => SatKind::DoubleAdd,
        _ => SatKind::DoubleSub,
    };
    let rn = (insn >> 16) & 0xF;
    let rd = (insn >> 12) & 0xF;
    let rm = insn & 0xF;

    let lhs = t.read_reg(rm);
    let rhs = t.read_reg(rn);
    let result = t.block.gen_saturating(kind, lhs, rhs);
    let reg = t.guest_reg(rd);
    t.block.gen_store_gpr(reg, result);
    t.emit_update_q();
    Status::Continue
}

/// PLD is an architectural hint; nothing to do.
pub(crate) fn arm_pld(_t: &mut Translator, _insn: u32) -> Status {
    Status::Continue
}
