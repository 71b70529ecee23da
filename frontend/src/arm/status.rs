//! MRS / MSR lifters.

use rearm_core::ir::opcode::AluKind;
use rearm_core::ir::var::Operand;
use rearm_core::psr::{Mode, Psr};

use crate::translator::{Status, Translator};

/// Byte-granular field mask from MSR bits 19:16 (f, s, x, c).
fn field_mask(insn: u32) -> u32 {
    let mut mask = 0u32;
    if insn & (1 << 19) != 0 {
        mask |= 0xFF00_0000;
    }
    if insn & (1 << 18) != 0 {
        mask |= 0x00FF_0000;
    }
    if insn & (1 << 17) != 0 {
        mask |= 0x0000_FF00;
    }
    if insn & (1 << 16) != 0 {
        mask |= 0x0000_00FF;
    }
    mask
}

pub(crate) fn arm_mrs(t: &mut Translator, insn: u32) -> Status {
    let spsr = insn & (1 << 22) != 0;
    let rd = (insn >> 12) & 0xF;

    let value = if spsr {
        t.block.gen_load_spsr(t.mode)
    } else {
        t.block.gen_load_cpsr()
    };
    let reg = t.guest_reg(rd);
    t.block.gen_store_gpr(reg, value);
    Status::Continue
}

fn msr_common(t: &mut Translator, insn: u32, value: Operand) -> Status {
    let spsr = insn & (1 << 22) != 0;
    let mut mask = field_mask(insn);

    if spsr {
        let old = t.block.gen_load_spsr(t.mode);
        let kept = t.block.gen_alu(AluKind::Bic, old, Operand::Const(mask), false);
        let new_bits = t.block.gen_alu(AluKind::And, value, Operand::Const(mask), false);
        let merged = t.block.gen_alu(AluKind::Orr, kept, new_bits, false);
        t.block.gen_store_spsr(t.mode, merged);
        return Status::Continue;
    }

    // CPSR: the T bit is untouchable, and User mode can only write
    // the flag byte.
    mask &= !Psr::THUMB;
    if t.mode == Mode::User {
        mask &= 0xFF00_0000;
    }
    if mask == 0 {
        return Status::Continue;
    }

    let old = t.block.gen_load_cpsr();
    let kept = t.block.gen_alu(AluKind::Bic, old, Operand::Const(mask), false);
    let new_bits = t.block.gen_alu(AluKind::And, value, Operand::Const(mask), false);
    let merged = t.block.gen_alu(AluKind::Orr, kept, new_bits, false);

    if mask & 0xFF != 0 {
        // Control byte writes may change mode or interrupt masks;
        // the bank swap happens in a runtime helper and the block
        // ends so the dispatcher re-keys.
        t.block.gen_write_cpsr_control(merged);
        t.emit_store_next_pc();
        return Status::BreakBasicBlock;
    }

    t.block.gen_store_cpsr(merged);
    Status::BreakMicroBlock
}

pub(crate) fn arm_msr_reg(t: &mut Translator, insn: u32) -> Status {
    let rm = insn & 0xF;
    let value = t.read_reg(rm);
    msr_common(t, insn, value)
}

pub(crate) fn arm_msr_imm(t: &mut Translator, insn: u32) -> Status {
    let imm = insn & 0xFF;
    let rot = (insn >> 8) & 0xF;
    msr_common(t, insn, Operand::Const(imm.rotate_right(rot * 2)))
}
