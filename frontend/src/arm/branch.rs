//! Branch lifters: B, BL, BX, and the ARMv5TE BLX forms.

use rearm_core::ir::var::Operand;

use crate::translator::{Status, Translator};

fn sign_extend_24(value: u32) -> i32 {
    ((value << 8) as i32) >> 8
}

/// B / BL.
pub(crate) fn arm_branch(t: &mut Translator, insn: u32) -> Status {
    let link = insn & (1 << 24) != 0;
    let offset = sign_extend_24(insn & 0x00FF_FFFF) << 2;
    let target = t.pipeline_pc().wrapping_add(offset as u32);

    if link {
        let lr = t.code_address + 4;
        let reg = t.guest_reg(14);
        t.block.gen_store_gpr(reg, lr);
    }

    t.emit_static_branch(target, false);
    Status::BreakBasicBlock
}

/// BX: exchange-capable register branch.
pub(crate) fn arm_bx(t: &mut Translator, insn: u32) -> Status {
    let rm = insn & 0xF;
    let target = t.read_reg(rm);
    t.emit_flush_exchange(target);
    Status::BreakBasicBlock
}

/// BLX (register), ARMv5TE.
pub(crate) fn arm_blx_reg(t: &mut Translator, insn: u32) -> Status {
    let rm = insn & 0xF;
    let target = t.read_reg(rm);
    let lr = t.code_address + 4;
    let reg = t.guest_reg(14);
    t.block.gen_store_gpr(reg, lr);
    t.emit_flush_exchange(target);
    Status::BreakBasicBlock
}

/// BLX (immediate), ARMv5TE: always switches to Thumb. Lives in the
/// NV-condition space; the H bit supplies a halfword offset.
pub(crate) fn arm_blx_imm(t: &mut Translator, insn: u32) -> Status {
    let h = (insn >> 24) & 1;
    let offset = (sign_extend_24(insn & 0x00FF_FFFF) << 2) as u32 | (h << 1);
    let target = t.pipeline_pc().wrapping_add(offset);

    let lr = t.code_address + 4;
    let reg = t.guest_reg(14);
    t.block.gen_store_gpr(reg, lr);

    // Set the Thumb bit statically; the successor key is known.
    let cpsr = t.block.gen_load_cpsr();
    let new_cpsr = t.block.gen_alu(
        rearm_core::ir::opcode::AluKind::Orr,
        cpsr,
        Operand::Const(rearm_core::psr::Psr::THUMB),
        false,
    );
    t.block.gen_store_cpsr(new_cpsr);

    t.emit_static_branch(target, true);
    Status::BreakBasicBlock
}
