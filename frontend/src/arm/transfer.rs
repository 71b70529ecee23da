//! Single data transfer, halfword/signed transfer, doubleword
//! transfer (ARMv5TE), and SWP.

use rearm_core::ir::opcode::{AluKind, MemAccess, ShiftKind};
use rearm_core::ir::var::Operand;

use crate::translator::{Status, Translator};

/// The scaled-register offset of a single data transfer (shift by
/// immediate only; no carry semantics).
fn transfer_offset(t: &mut Translator, insn: u32) -> Operand {
    if insn & (1 << 25) == 0 {
        return Operand::Const(insn & 0xFFF);
    }

    let rm = insn & 0xF;
    let amount = (insn >> 7) & 0x1F;
    let shift_type = (insn >> 5) & 0x3;
    let value = t.read_reg(rm);

    let (kind, amount) = match (shift_type, amount) {
        (0, 0) => return value,
        (0, n) => (ShiftKind::Lsl, n),
        (1, 0) => (ShiftKind::Lsr, 32),
        (1, n) => (ShiftKind::Lsr, n),
        (2, 0) => (ShiftKind::Asr, 32),
        (2, n) => (ShiftKind::Asr, n),
        (_, 0) => (ShiftKind::Rrx, 0),
        (_, n) => (ShiftKind::Ror, n),
    };
    Operand::Var(t.block.gen_shift(kind, value, Operand::Const(amount), false))
}

/// Common addressing-mode plumbing. Returns (access address,
/// writeback value if any).
struct Addressing {
    address: Operand,
    writeback: Option<Operand>,
}

fn addressing(t: &mut Translator, insn: u32, base: Operand, offset: Operand) -> Addressing {
    let pre = insn & (1 << 24) != 0;
    let up = insn & (1 << 23) != 0;
    let writeback_bit = insn & (1 << 21) != 0;

    let kind = if up { AluKind::Add } else { AluKind::Sub };
    if pre {
        let address = Operand::Var(t.block.gen_alu(kind, base, offset, false));
        let writeback = writeback_bit.then_some(address);
        Addressing { address, writeback }
    } else {
        // Post-indexed forms always write back.
        let writeback = Operand::Var(t.block.gen_alu(kind, base, offset, false));
        Addressing {
            address: base,
            writeback: Some(writeback),
        }
    }
}

/// LDR / STR / LDRB / STRB with all addressing modes.
pub(crate) fn arm_single_transfer(t: &mut Translator, insn: u32) -> Status {
    let byte = insn & (1 << 22) != 0;
    let load = insn & (1 << 20) != 0;
    let rn = (insn >> 16) & 0xF;
    let rd = (insn >> 12) & 0xF;

    let offset = transfer_offset(t, insn);
    let base = t.read_reg(rn);
    let mode = addressing(t, insn, base, offset);

    let access = if byte {
        MemAccess::byte()
    } else {
        MemAccess::word().with_rotate(true)
    };

    if load {
        let value = t.block.gen_mem_read(mode.address, access);
        if let Some(wb) = mode.writeback {
            let reg = t.guest_reg(rn);
            t.block.gen_store_gpr(reg, wb);
        }
        if rd == 15 {
            // The loaded value wins over any writeback to r15.
            t.emit_load_to_pc(Operand::Var(value));
            return Status::BreakBasicBlock;
        }
        let reg = t.guest_reg(rd);
        t.block.gen_store_gpr(reg, value);
        Status::Continue
    } else {
        // STR of r15 stores three fetches ahead.
        let value = if rd == 15 {
            Operand::Const(t.pipeline_pc() + 4)
        } else {
            t.read_reg(rd)
        };
        t.block.gen_mem_write(mode.address, value, access);
        if let Some(wb) = mode.writeback {
            let reg = t.guest_reg(rn);
            t.block.gen_store_gpr(reg, wb);
        }
        Status::Continue
    }
}

/// LDRH / STRH / LDRSB / LDRSH, plus LDRD / STRD on ARMv5TE.
pub(crate) fn arm_halfword_transfer(t: &mut Translator, insn: u32) -> Status {
    let immediate = insn & (1 << 22) != 0;
    let load = insn & (1 << 20) != 0;
    let rn = (insn >> 16) & 0xF;
    let rd = (insn >> 12) & 0xF;
    let sh = (insn >> 5) & 0x3;

    let offset = if immediate {
        Operand::Const((insn & 0xF) | ((insn >> 4) & 0xF0))
    } else {
        t.read_reg(insn & 0xF)
    };
    let base = t.read_reg(rn);
    let mode = addressing(t, insn, base, offset);

    // Unaligned halfword loads rotate on ARM7 and force-align on ARM9.
    let rotate = !t.armv5te;

    if load {
        let access = match sh {
            1 => MemAccess::half().with_rotate(rotate),
            2 => MemAccess::signed_byte(),
            _ => MemAccess::half().with_signed(true).with_rotate(rotate),
        };
        let value = t.block.gen_mem_read(mode.address, access);
        if let Some(wb) = mode.writeback {
            let reg = t.guest_reg(rn);
            t.block.gen_store_gpr(reg, wb);
        }
        if rd == 15 {
            t.emit_load_to_pc(Operand::Var(value));
            return Status::BreakBasicBlock;
        }
        let reg = t.guest_reg(rd);
        t.block.gen_store_gpr(reg, value);
        return Status::Continue;
    }

    match sh {
        1 => {
            // STRH
            let value = if rd == 15 {
                Operand::Const(t.pipeline_pc() + 4)
            } else {
                t.read_reg(rd)
            };
            t.block.gen_mem_write(mode.address, value, MemAccess::half());
            if let Some(wb) = mode.writeback {
                let reg = t.guest_reg(rn);
                t.block.gen_store_gpr(reg, wb);
            }
            Status::Continue
        }
        2 | 3 if t.armv5te && rd % 2 == 0 && rd < 14 => {
            // LDRD / STRD: two word transfers at addr, addr+4.
            let second = Operand::Var(t.block.gen_alu(
                AluKind::Add,
                mode.address,
                Operand::Const(4),
                false,
            ));
            if sh == 2 {
                let lo = t.block.gen_mem_read(mode.address, MemAccess::word());
                let hi = t.block.gen_mem_read(second, MemAccess::word());
                if let Some(wb) = mode.writeback {
                    let reg = t.guest_reg(rn);
                    t.block.gen_store_gpr(reg, wb);
                }
                let reg_lo = t.guest_reg(rd);
                t.block.gen_store_gpr(reg_lo, lo);
                let reg_hi = t.guest_reg(rd + 1);
                t.block.gen_store_gpr(reg_hi, hi);
            } else {
                let lo = t.read_reg(rd);
                let hi = t.read_reg(rd + 1);
                t.block.gen_mem_write(mode.address, lo, MemAccess::word());
                t.block.gen_mem_write(second, hi, MemAccess::word());
                if let Some(wb) = mode.writeback {
                    let reg = t.guest_reg(rn);
                    t.block.gen_store_gpr(reg, wb);
                }
            }
            Status::Continue
        }
        _ => Status::Unimplemented,
    }
}

/// SWP / SWPB: load old value, store new, move old into Rd.
pub(crate) fn arm_swap(t: &mut Translator, insn: u32) -> Status {
    let byte = insn & (1 << 22) != 0;
    let rn = (insn >> 16) & 0xF;
    let rd = (insn >> 12) & 0xF;
    let rm = insn & 0xF;

    let access = if byte {
        MemAccess::byte()
    } else {
        MemAccess::word().with_rotate(true)
    };

    let address = t.read_reg(rn);
    let old = t.block.gen_mem_read(address, access);
    let new = t.read_reg(rm);
    t.block.gen_mem_write(address, new, access);

    if rd == 15 {
        t.emit_load_to_pc(Operand::Var(old));
        return Status::BreakBasicBlock;
    }
    let reg = t.guest_reg(rd);
    t.block.gen_store_gpr(reg, old);
    Status::Continue
}
