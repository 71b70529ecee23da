//! Thumb lifters, one per instruction format. Thumb instructions
//! nearly all set flags, so these lean on the same flag-staging ops
//! as the ARM data-processing lifter.

use rearm_core::ir::opcode::{AluKind, Exception, MemAccess, ShiftKind};
use rearm_core::ir::var::Operand;

use crate::translator::{Status, Translator};

fn sign_extend(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

/// Format 1: LSL/LSR/ASR by immediate. Flags: N, Z, and C from the
/// shifter.
pub(crate) fn thumb_shift_imm(t: &mut Translator, op: u32) -> Status {
    let kind = (op >> 11) & 0x3;
    let amount = (op >> 6) & 0x1F;
    let rm = (op >> 3) & 0x7;
    let rd = op & 0x7;

    let value = t.read_reg(rm);
    let reg = t.guest_reg(rd);

    if kind == 0 && amount == 0 {
        // LSL #0 is a plain move; carry survives.
        let result = t.block.gen_mov(value, true);
        t.block.gen_store_gpr(reg, result);
        t.emit_update_nz();
        return Status::Continue;
    }

    let (kind, amount) = match (kind, amount) {
        (0, n) => (ShiftKind::Lsl, n),
        (1, 0) => (ShiftKind::Lsr, 32),
        (1, n) => (ShiftKind::Lsr, n),
        (2, 0) => (ShiftKind::Asr, 32),
        (_, n) => (ShiftKind::Asr, n),
    };
    let result = t.block.gen_shift(kind, value, Operand::Const(amount), true);
    t.block.gen_store_gpr(reg, result);
    t.emit_update_nzc();
    Status::Continue
}

/// Format 2: ADD/SUB with a register or 3-bit immediate.
pub(crate) fn thumb_add_sub(t: &mut Translator, op: u32) -> Status {
    let immediate = op & (1 << 10) != 0;
    let sub = op & (1 << 9) != 0;
    let rn_or_imm = (op >> 6) & 0x7;
    let rs = (op >> 3) & 0x7;
    let rd = op & 0x7;

    let lhs = t.read_reg(rs);
    let rhs = if immediate {
        Operand::Const(rn_or_imm)
    } else {
        t.read_reg(rn_or_imm)
    };
    let kind = if sub { AluKind::Sub } else { AluKind::Add };
    let result = t.block.gen_alu(kind, lhs, rhs, true);
    let reg = t.guest_reg(rd);
    t.block.gen_store_gpr(reg, result);
    t.emit_update_nzcv();
    Status::Continue
}

/// Format 3: MOV/CMP/ADD/SUB with an 8-bit immediate.
pub(crate) fn thumb_mov_cmp_add_sub_imm(t: &mut Translator, op: u32) -> Status {
    let kind = (op >> 11) & 0x3;
    let rd = (op >> 8) & 0x7;
    let imm = Operand::Const(op & 0xFF);
    let reg = t.guest_reg(rd);

    match kind {
        0 => {
            let result = t.block.gen_mov(imm, true);
            t.block.gen_store_gpr(reg, result);
            t.emit_update_nz();
        }
        1 => {
            let lhs = t.read_reg(rd);
            t.block.gen_alu_compare(AluKind::Sub, lhs, imm);
            t.emit_update_nzcv();
        }
        2 => {
            let lhs = t.read_reg(rd);
            let result = t.block.gen_alu(AluKind::Add, lhs, imm, true);
            t.block.gen_store_gpr(reg, result);
            t.emit_update_nzcv();
        }
        _ => {
            let lhs = t.read_reg(rd);
            let result = t.block.gen_alu(AluKind::Sub, lhs, imm, true);
            t.block.gen_store_gpr(reg, result);
            t.emit_update_nzcv();
        }
    }
    Status::Continue
}

/// Format 4: the register-to-register ALU group.
pub(crate) fn thumb_alu(t: &mut Translator, op: u32) -> Status {
    let opcode = (op >> 6) & 0xF;
    let rs = (op >> 3) & 0x7;
    let rd = op & 0x7;
    let reg = t.guest_reg(rd);

    match opcode {
        0x0 | 0x1 | 0xC | 0xE => {
            // AND / EOR / ORR / BIC: N and Z only.
            let kind = match opcode {
                0x0 => AluKind::And,
                0x1 => AluKind::Eor,
                0xC => AluKind::Orr,
                _ => AluKind::Bic,
            };
            let lhs = t.read_reg(rd);
            let rhs = t.read_reg(rs);
            let result = t.block.gen_alu(kind, lhs, rhs, true);
            t.block.gen_store_gpr(reg, result);
            t.emit_update_nz();
        }
        0x2 | 0x3 | 0x4 | 0x7 => {
            // LSL / LSR / ASR / ROR by register.
            let kind = match opcode {
                0x2 => ShiftKind::Lsl,
                0x3 => ShiftKind::Lsr,
                0x4 => ShiftKind::Asr,
                _ => ShiftKind::Ror,
            };
            let value = t.read_reg(rd);
            let amount = t.read_reg(rs);
            let result = t.block.gen_shift(kind, value, amount, true);
            t.block.gen_store_gpr(reg, result);
            t.emit_update_nzc();
        }
        0x5 | 0x6 => {
            // ADC / SBC.
            let kind = if opcode == 0x5 {
                AluKind::Adc
            } else {
                AluKind::Sbc
            };
            let lhs = t.read_reg(rd);
            let rhs = t.read_reg(rs);
            let result = t.block.gen_alu(kind, lhs, rhs, true);
            t.block.gen_store_gpr(reg, result);
            t.emit_update_nzcv();
        }
        0x8 => {
            let lhs = t.read_reg(rd);
            let rhs = t.read_reg(rs);
            t.block.gen_alu_compare(AluKind::And, lhs, rhs);
            t.emit_update_nz();
        }
        0x9 => {
            // NEG: 0 - Rs.
            let rhs = t.read_reg(rs);
            let result = t.block.gen_alu(AluKind::Sub, Operand::Const(0), rhs, true);
            t.block.gen_store_gpr(reg, result);
            t.emit_update_nzcv();
        }
        0xA | 0xB => {
            let kind = if opcode == 0xA {
                AluKind::Sub
            } else {
                AluKind::Add
            };
            let lhs = t.read_reg(rd);
            let rhs = t.read_reg(rs);
            t.block.gen_alu_compare(kind, lhs, rhs);
            t.emit_update_nzcv();
        }
        0xD => {
            let lhs = t.read_reg(rd);
            let rhs = t.read_reg(rs);
            let result = t.block.gen_mul(lhs, rhs, None, true);
            t.block.gen_store_gpr(reg, result);
            t.emit_update_nz();
        }
        _ => {
            let src = t.read_reg(rs);
            let result = t.block.gen_mvn(src, true);
            t.block.gen_store_gpr(reg, result);
            t.emit_update_nz();
        }
    }
    Status::Continue
}

/// Format 5: high-register operations and BX/BLX.
pub(crate) fn thumb_hi_reg(t: &mut Translator, op: u32) -> Status {
    let opcode = (op >> 8) & 0x3;
    let rd = (op & 0x7) | ((op >> 4) & 0x8);
    let rm = (op >> 3) & 0xF;

    match opcode {
        0 => {
            let lhs = t.read_reg(rd);
            let rhs = t.read_reg(rm);
            let result = t.block.gen_alu(AluKind::Add, lhs, rhs, false);
            if rd == 15 {
                t.emit_flush(Operand::Var(result));
                return Status::BreakBasicBlock;
            }
            let reg = t.guest_reg(rd);
            t.block.gen_store_gpr(reg, result);
            Status::Continue
        }
        1 => {
            let lhs = t.read_reg(rd);
            let rhs = t.read_reg(rm);
            t.block.gen_alu_compare(AluKind::Sub, lhs, rhs);
            t.emit_update_nzcv();
            Status::Continue
        }
        2 => {
            let value = t.read_reg(rm);
            if rd == 15 {
                t.emit_flush(value);
                return Status::BreakBasicBlock;
            }
            let reg = t.guest_reg(rd);
            t.block.gen_store_gpr(reg, value);
            Status::Continue
        }
        _ => {
            let link = op & (1 << 7) != 0;
            if link && !t.armv5te {
                return Status::Unimplemented;
            }
            let target = t.read_reg(rm);
            if link {
                let lr = (t.code_address + 2) | 1;
                let reg = t.guest_reg(14);
                t.block.gen_store_gpr(reg, lr);
            }
            t.emit_flush_exchange(target);
            Status::BreakBasicBlock
        }
    }
}

/// Format 6: PC-relative load.
pub(crate) fn thumb_ldr_pc_relative(t: &mut Translator, op: u32) -> Status {
    let rd = (op >> 8) & 0x7;
    let address = (t.pipeline_pc() & !3) + (op & 0xFF) * 4;
    let value = t
        .block
        .gen_mem_read(Operand::Const(address), MemAccess::word());
    let reg = t.guest_reg(rd);
    t.block.gen_store_gpr(reg, value);
    Status::Continue
}

/// Formats 7: load/store with register offset.
pub(crate) fn thumb_load_store_reg(t: &mut Translator, op: u32) -> Status {
    let load = op & (1 << 11) != 0;
    let byte = op & (1 << 10) != 0;
    let ro = (op >> 6) & 0x7;
    let rb = (op >> 3) & 0x7;
    let rd = op & 0x7;

    let base = t.read_reg(rb);
    let offset = t.read_reg(ro);
    let address = t.block.gen_alu(AluKind::Add, base, offset, false);

    let access = if byte {
        MemAccess::byte()
    } else {
        MemAccess::word().with_rotate(true)
    };
    let reg = t.guest_reg(rd);
    if load {
        let value = t.block.gen_mem_read(address, access);
        t.block.gen_store_gpr(reg, value);
    } else {
        let value = t.read_reg(rd);
        t.block.gen_mem_write(address, value, access);
    }
    Status::Continue
}

/// Format 8: load/store sign-extended byte/halfword.
pub(crate) fn thumb_load_store_sign_ext(t: &mut Translator, op: u32) -> Status {
    let h = op & (1 << 11) != 0;
    let s = op & (1 << 10) != 0;
    let ro = (op >> 6) & 0x7;
    let rb = (op >> 3) & 0x7;
    let rd = op & 0x7;

    let base = t.read_reg(rb);
    let offset = t.read_reg(ro);
    let address = t.block.gen_alu(AluKind::Add, base, offset, false);
    let rotate = !t.armv5te;
    let reg = t.guest_reg(rd);

    match (s, h) {
        (false, false) => {
            let value = t.read_reg(rd);
            t.block.gen_mem_write(address, value, MemAccess::half());
        }
        (false, true) => {
            let value = t
                .block
                .gen_mem_read(address, MemAccess::half().with_rotate(rotate));
            t.block.gen_store_gpr(reg, value);
        }
        (true, false) => {
            let value = t.block.gen_mem_read(address, MemAccess::signed_byte());
            t.block.gen_store_gpr(reg, value);
        }
        (true, true) => {
            let value = t.block.gen_mem_read(
                address,
                MemAccess::half().with_signed(true).with_rotate(rotate),
            );
            t.block.gen_store_gpr(reg, value);
        }
    }
    Status::Continue
}

/// Format 9: load/store with 5-bit immediate offset (word or byte).
pub(crate) fn thumb_load_store_imm(t: &mut Translator, op: u32) -> Status {
    let byte = op & (1 << 12) != 0;
    let load = op & (1 << 11) != 0;
    let imm = (op >> 6) & 0x1F;
    let rb = (op >> 3) & 0x7;
    let rd = op & 0x7;

    let scaled = if byte { imm } else { imm * 4 };
    let base = t.read_reg(rb);
    let address = t
        .block
        .gen_alu(AluKind::Add, base, Operand::Const(scaled), false);

    let access = if byte {
        MemAccess::byte()
    } else {
        MemAccess::word().with_rotate(true)
    };
    let reg = t.guest_reg(rd);
    if load {
        let value = t.block.gen_mem_read(address, access);
        t.block.gen_store_gpr(reg, value);
    } else {
        let value = t.read_reg(rd);
        t.block.gen_mem_write(address, value, access);
    }
    Status::Continue
}

/// Format 10: load/store halfword with immediate offset.
pub(crate) fn thumb_load_store_half(t: &mut Translator, op: u32) -> Status {
    let load = op & (1 << 11) != 0;
    let imm = ((op >> 6) & 0x1F) * 2;
    let rb = (op >> 3) & 0x7;
    let rd = op & 0x7;

    let base = t.read_reg(rb);
    let address = t
        .block
        .gen_alu(AluKind::Add, base, Operand::Const(imm), false);
    let reg = t.guest_reg(rd);
    if load {
        let rotate = !t.armv5te;
        let value = t
            .block
            .gen_mem_read(address, MemAccess::half().with_rotate(rotate));
        t.block.gen_store_gpr(reg, value);
    } else {
        let value = t.read_reg(rd);
        t.block.gen_mem_write(address, value, MemAccess::half());
    }
    Status::Continue
}

/// Format 11: SP-relative load/store.
pub(crate) fn thumb_load_store_sp(t: &mut Translator, op: u32) -> Status {
    let load = op & (1 << 11) != 0;
    let rd = (op >> 8) & 0x7;
    let imm = (op & 0xFF) * 4;

    let base = t.read_reg(13);
    let address = t
        .block
        .gen_alu(AluKind::Add, base, Operand::Const(imm), false);
    let reg = t.guest_reg(rd);
    if load {
        let value = t
            .block
            .gen_mem_read(address, MemAccess::word().with_rotate(true));
        t.block.gen_store_gpr(reg, value);
    } else {
        let value = t.read_reg(rd);
        t.block.gen_mem_write(address, value, MemAccess::word());
    }
    Status::Continue
}

/// Format 12: ADD Rd, PC/SP, #imm.
pub(crate) fn thumb_load_address(t: &mut Translator, op: u32) -> Status {
    let sp = op & (1 << 11) != 0;
    let rd = (op >> 8) & 0x7;
    let imm = (op & 0xFF) * 4;
    let reg = t.guest_reg(rd);

    if sp {
        let base = t.read_reg(13);
        let result = t
            .block
            .gen_alu(AluKind::Add, base, Operand::Const(imm), false);
        t.block.gen_store_gpr(reg, result);
    } else {
        let value = (t.pipeline_pc() & !3) + imm;
        t.block.gen_store_gpr(reg, value);
    }
    Status::Continue
}

/// Format 13: ADD SP, #±imm.
pub(crate) fn thumb_adjust_sp(t: &mut Translator, op: u32) -> Status {
    let sub = op & (1 << 7) != 0;
    let imm = (op & 0x7F) * 4;
    let kind = if sub { AluKind::Sub } else { AluKind::Add };

    let base = t.read_reg(13);
    let result = t.block.gen_alu(kind, base, Operand::Const(imm), false);
    let reg = t.guest_reg(13);
    t.block.gen_store_gpr(reg, result);
    Status::Continue
}

/// Format 14: PUSH / POP.
pub(crate) fn thumb_push_pop(t: &mut Translator, op: u32) -> Status {
    let load = op & (1 << 11) != 0;
    let extra = op & (1 << 8) != 0; // LR on push, PC on pop
    let rlist = op & 0xFF;

    let mut regs: Vec<u32> = (0..8).filter(|r| rlist & (1 << r) != 0).collect();
    if extra {
        regs.push(if load { 15 } else { 14 });
    }
    if regs.is_empty() {
        return Status::Unimplemented;
    }
    let span = 4 * regs.len() as u32;

    let sp = t.read_reg(13);
    let sp_reg = t.guest_reg(13);

    if load {
        // POP: ascending from SP, then SP += span.
        let mut pc_value = None;
        for (i, &r) in regs.iter().enumerate() {
            let address = if i == 0 {
                sp
            } else {
                Operand::Var(t.block.gen_alu(
                    AluKind::Add,
                    sp,
                    Operand::Const(4 * i as u32),
                    false,
                ))
            };
            let value = t.block.gen_mem_read(address, MemAccess::word());
            if r == 15 {
                pc_value = Some(value);
            } else {
                let reg = t.guest_reg(r);
                t.block.gen_store_gpr(reg, value);
            }
        }
        let wb = t
            .block
            .gen_alu(AluKind::Add, sp, Operand::Const(span), false);
        t.block.gen_store_gpr(sp_reg, wb);
        if let Some(value) = pc_value {
            t.emit_load_to_pc(Operand::Var(value));
            return Status::BreakBasicBlock;
        }
        return Status::Continue;
    }

    // PUSH: descending; stores ascending from SP - span.
    let start = t
        .block
        .gen_alu(AluKind::Sub, sp, Operand::Const(span), false);
    for (i, &r) in regs.iter().enumerate() {
        let address = if i == 0 {
            Operand::Var(start)
        } else {
            Operand::Var(t.block.gen_alu(
                AluKind::Add,
                start,
                Operand::Const(4 * i as u32),
                false,
            ))
        };
        let value = t.read_reg(r);
        t.block.gen_mem_write(address, value, MemAccess::word());
    }
    t.block.gen_store_gpr(sp_reg, start);
    Status::Continue
}

/// Format 15: LDMIA / STMIA with writeback.
pub(crate) fn thumb_ldm_stm(t: &mut Translator, op: u32) -> Status {
    let load = op & (1 << 11) != 0;
    let rb = (op >> 8) & 0x7;
    let rlist = op & 0xFF;

    let mut regs: Vec<u32> = (0..8).filter(|r| rlist & (1 << r) != 0).collect();
    let empty = regs.is_empty();
    if empty {
        regs.push(15);
    }
    let span = if empty { 0x40 } else { 4 * regs.len() as u32 };

    let base = t.read_reg(rb);
    let wb = t
        .block
        .gen_alu(AluKind::Add, base, Operand::Const(span), false);
    let base_reg = t.guest_reg(rb);

    if load {
        let mut loaded = Vec::with_capacity(regs.len());
        for (i, &r) in regs.iter().enumerate() {
            let address = if i == 0 {
                base
            } else {
                Operand::Var(t.block.gen_alu(
                    AluKind::Add,
                    base,
                    Operand::Const(4 * i as u32),
                    false,
                ))
            };
            let value = t.block.gen_mem_read(address, MemAccess::word());
            loaded.push((r, value));
        }
        // Loaded base wins over writeback.
        if !regs.contains(&rb) {
            t.block.gen_store_gpr(base_reg, wb);
        }
        let mut pc_value = None;
        for (r, value) in loaded {
            if r == 15 {
                pc_value = Some(value);
            } else {
                let reg = t.guest_reg(r);
                t.block.gen_store_gpr(reg, value);
            }
        }
        if let Some(value) = pc_value {
            t.emit_load_to_pc(Operand::Var(value));
            return Status::BreakBasicBlock;
        }
        return Status::Continue;
    }

    let lowest = regs[0];
    for (i, &r) in regs.iter().enumerate() {
        let value = if r == 15 {
            Operand::Const(t.pipeline_pc() + 2)
        } else if r == rb && r != lowest {
            Operand::Var(wb)
        } else {
            t.read_reg(r)
        };
        let address = if i == 0 {
            base
        } else {
            Operand::Var(t.block.gen_alu(
                AluKind::Add,
                base,
                Operand::Const(4 * i as u32),
                false,
            ))
        };
        t.block.gen_mem_write(address, value, MemAccess::word());
    }
    t.block.gen_store_gpr(base_reg, wb);
    Status::Continue
}

/// Format 16: conditional branch. The translate loop already opened
/// a micro-block under this condition.
pub(crate) fn thumb_cond_branch(t: &mut Translator, op: u32) -> Status {
    let offset = sign_extend(op & 0xFF, 8) << 1;
    let target = t.pipeline_pc().wrapping_add(offset as u32);
    t.emit_static_branch(target, true);
    Status::BreakBasicBlock
}

/// Format 17: SWI.
pub(crate) fn thumb_swi(t: &mut Translator, _op: u32) -> Status {
    let ret = t.code_address + 2;
    t.block
        .gen_raise_exception(Exception::SoftwareInterrupt, Operand::Const(ret));
    Status::BreakBasicBlock
}

/// BKPT (ARMv5TE).
pub(crate) fn thumb_bkpt(t: &mut Translator, _op: u32) -> Status {
    let ret = t.code_address + 4;
    t.block
        .gen_raise_exception(Exception::PrefetchAbort, Operand::Const(ret));
    Status::BreakBasicBlock
}

/// Format 18: unconditional branch.
pub(crate) fn thumb_branch(t: &mut Translator, op: u32) -> Status {
    let offset = sign_extend(op & 0x7FF, 11) << 1;
    let target = t.pipeline_pc().wrapping_add(offset as u32);
    t.emit_static_branch(target, true);
    Status::BreakBasicBlock
}

/// Format 19: BL/BLX prefix (and the standalone-prefix fallback).
/// The suffix halfword rides in the upper half of the fetched word.
pub(crate) fn thumb_long_branch(t: &mut Translator, insn: u32) -> Status {
    let op = insn & 0xFFFF;
    if op & (1 << 11) != 0 {
        // Standalone BL suffix: only reachable by jumping at it.
        return thumb_bl_suffix_standalone(t, op);
    }

    let high = (sign_extend(op & 0x7FF, 11) << 12) as u32;
    let suffix = insn >> 16;

    let pair = match suffix >> 11 {
        0b11111 => Some(false),               // BL
        0b11101 if t.armv5te => Some(true),   // BLX
        _ => None,
    };

    let Some(exchange) = pair else {
        // No recognisable suffix: the prefix alone just loads LR.
        let lr = t.pipeline_pc().wrapping_add(high);
        let reg = t.guest_reg(14);
        t.block.gen_store_gpr(reg, lr);
        return Status::Continue;
    };

    t.extra_halfword = true;
    let offset = high.wrapping_add((suffix & 0x7FF) << 1);
    let target = t.pipeline_pc().wrapping_add(offset);
    let lr = (t.code_address + 4) | 1;
    let reg = t.guest_reg(14);
    t.block.gen_store_gpr(reg, lr);

    if exchange {
        // BLX: clear the Thumb bit and land on a word boundary.
        let cpsr = t.block.gen_load_cpsr();
        let new_cpsr = t.block.gen_alu(
            AluKind::Bic,
            cpsr,
            Operand::Const(rearm_core::psr::Psr::THUMB),
            false,
        );
        t.block.gen_store_cpsr(new_cpsr);
        t.emit_static_branch(target & !3, false);
    } else {
        t.emit_static_branch(target, true);
    }
    Status::BreakBasicBlock
}

fn thumb_bl_suffix_standalone(t: &mut Translator, op: u32) -> Status {
    let lr = t.read_reg(14);
    let target = t.block.gen_alu(
        AluKind::Add,
        lr,
        Operand::Const((op & 0x7FF) << 1),
        false,
    );
    let new_lr = (t.code_address + 2) | 1;
    let reg = t.guest_reg(14);
    t.block.gen_store_gpr(reg, new_lr);
    t.emit_flush(Operand::Var(target));
    Status::BreakBasicBlock
}

/// Standalone BLX suffix (ARMv5TE).
pub(crate) fn thumb_blx_suffix_standalone(t: &mut Translator, op: u32) -> Status {
    let lr = t.read_reg(14);
    let raw = t.block.gen_alu(
        AluKind::Add,
        lr,
        Operand::Const((op & 0x7FF) << 1),
        false,
    );
    let aligned = t
        .block
        .gen_alu(AluKind::Bic, raw, Operand::Const(3), false);
    let new_lr = (t.code_address + 2) | 1;
    let reg = t.guest_reg(14);
    t.block.gen_store_gpr(reg, new_lr);
    // Bit 0 is clear, so the exchange lands in ARM state.
    t.emit_flush_exchange(Operand::Var(aligned));
    Status::BreakBasicBlock
}
