//! Coprocessor register transfer lifters (MRC / MCR).

use rearm_core::ir::opcode::{AluKind, Exception};
use rearm_core::ir::var::Operand;
use rearm_core::psr::Psr;

use crate::translator::{Status, Translator};

pub(crate) fn arm_cop_transfer(t: &mut Translator, insn: u32) -> Status {
    let opcode1 = ((insn >> 21) & 0x7) as u8;
    let load = insn & (1 << 20) != 0;
    let cn = ((insn >> 16) & 0xF) as u8;
    let rd = (insn >> 12) & 0xF;
    let cp = ((insn >> 8) & 0xF) as usize;
    let opcode2 = ((insn >> 5) & 0x7) as u8;
    let cm = (insn & 0xF) as u8;

    let present = t
        .coprocessors
        .get(cp)
        .map(|slot| slot.is_some())
        .unwrap_or(false);
    if !present {
        // An absent coprocessor raises the undefined exception, as
        // the hardware would.
        let ret = t.code_address + 4;
        t.block
            .gen_raise_exception(Exception::Undefined, Operand::Const(ret));
        return Status::BreakBasicBlock;
    }

    if load {
        let value = t.block.gen_cop_read(cp as u8, opcode1, cn, cm, opcode2);
        if rd == 15 {
            // MRC to r15 moves the top nibble into the flags.
            let cpsr = t.block.gen_load_cpsr();
            let kept = t
                .block
                .gen_alu(AluKind::Bic, cpsr, Operand::Const(Psr::NZCV), false);
            let flags = t
                .block
                .gen_alu(AluKind::And, value, Operand::Const(Psr::NZCV), false);
            let merged = t.block.gen_alu(AluKind::Orr, kept, flags, false);
            t.block.gen_store_cpsr(merged);
            return Status::BreakMicroBlock;
        }
        let reg = t.guest_reg(rd);
        t.block.gen_store_gpr(reg, value);
        return Status::Continue;
    }

    let value = t.read_reg(rd);
    t.block
        .gen_cop_write(value, cp as u8, opcode1, cn, cm, opcode2);

    let breaks = t.coprocessors[cp]
        .as_ref()
        .map(|c| c.should_break_basic_block(opcode1, cn, cm, opcode2))
        .unwrap_or(false);
    if breaks {
        // The write may have remapped code; resume sequentially
        // through the dispatcher.
        t.emit_store_next_pc();
        return Status::BreakBasicBlock;
    }
    Status::Continue
}
