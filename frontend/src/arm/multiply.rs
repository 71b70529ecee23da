//! Multiply and multiply-accumulate lifters, including the ARMv5TE
//! signed halfword forms.

use crate::translator::{Status, Translator};

/// MUL / MLA.
pub(crate) fn arm_multiply(t: &mut Translator, insn: u32) -> Status {
    let accumulate = insn & (1 << 21) != 0;
    let set_flags = insn & (1 << 20) != 0;
    let rd = (insn >> 16) & 0xF;
    let rn = (insn >> 12) & 0xF;
    let rs = (insn >> 8) & 0xF;
    let rm = insn & 0xF;

    let lhs = t.read_reg(rm);
    let rhs = t.read_reg(rs);
    let acc = if accumulate {
        Some(t.read_reg(rn))
    } else {
        None
    };

    let result = t.block.gen_mul(lhs, rhs, acc, set_flags);
    let reg = t.guest_reg(rd);
    t.block.gen_store_gpr(reg, result);

    if set_flags {
        t.emit_update_nz();
        return Status::BreakMicroBlock;
    }
    Status::Continue
}

/// UMULL / UMLAL / SMULL / SMLAL.
pub(crate) fn arm_multiply_long(t: &mut Translator, insn: u32) -> Status {
    let signed = insn & (1 << 22) != 0;
    let accumulate = insn & (1 << 21) != 0;
    let set_flags = insn & (1 << 20) != 0;
    let rd_hi = (insn >> 16) & 0xF;
    let rd_lo = (insn >> 12) & 0xF;
    let rs = (insn >> 8) & 0xF;
    let rm = insn & 0xF;

    let lhs = t.read_reg(rm);
    let rhs = t.read_reg(rs);
    let acc = if accumulate {
        let lo = t.read_reg(rd_lo);
        let hi = t.read_reg(rd_hi);
        Some((lo, hi))
    } else {
        None
    };

    let (lo, hi) = t.block.gen_mul_long(lhs, rhs, acc, signed, set_flags);
    let reg_lo = t.guest_reg(rd_lo);
    t.block.gen_store_gpr(reg_lo, lo);
    let reg_hi = t.guest_reg(rd_hi);
    t.block.gen_store_gpr(reg_hi, hi);

    if set_flags {
        t.emit_update_nz();
        return Status::BreakMicroBlock;
    }
    Status::Continue
}

/// SMLAxy / SMULWy / SMLAWy / SMLALxy / SMULxy (ARMv5TE).
pub(crate) fn arm_multiply_half(t: &mut Translator, insn: u32) -> Status {
    let op = (insn >> 21) & 0x3;
    let rd = (insn >> 16) & 0xF;
    let rn = (insn >> 12) & 0xF;
    let rs = (insn >> 8) & 0xF;
    let rm = insn & 0xF;
    let x = insn & (1 << 5) != 0;
    let y = insn & (1 << 6) != 0;

    match op {
        0b00 => {
            // SMLAxy: accumulate, Q on overflow.
            let lhs = t.read_reg(rm);
            let rhs = t.read_reg(rs);
            let acc = t.read_reg(rn);
            let result = t.block.gen_mul_half(lhs, rhs, x, y, Some(acc));
            let reg = t.guest_reg(rd);
            t.block.gen_store_gpr(reg, result);
            t.emit_update_q();
        }
        0b01 => {
            let lhs = t.read_reg(rm);
            let rhs = t.read_reg(rs);
            if x {
                // SMULWy
                let result = t.block.gen_mul_word_half(lhs, rhs, y, None);
                let reg = t.guest_reg(rd);
                t.block.gen_store_gpr(reg, result);
            } else {
                // SMLAWy: accumulate, Q on overflow.
                let acc = t.read_reg(rn);
                let result = t.block.gen_mul_word_half(lhs, rhs, y, Some(acc));
                let reg = t.guest_reg(rd);
                t.block.gen_store_gpr(reg, result);
                t.emit_update_q();
            }
        }
        0b10 => {
            // SMLALxy: 64-bit accumulate, no Q.
            let acc_lo = t.read_reg(rn);
            let acc_hi = t.read_reg(rd);
            let lhs = t.read_reg(rm);
            let rhs = t.read_reg(rs);
            let (lo, hi) = t.block.gen_mul_half_long(acc_lo, acc_hi, lhs, rhs, x, y);
            let reg_lo = t.guest_reg(rn);
            t.block.gen_store_gpr(reg_lo, lo);
            let reg_hi = t.guest_reg(rd);
            t.block.gen_store_gpr(reg_hi, hi);
        }
        _ => {
            // SMULxy
            let lhs = t.read_reg(rm);
            let rhs = t.read_reg(rs);
            let result = t.block.gen_mul_half(lhs, rhs, x, y, None);
            let reg = t.guest_reg(rd);
            t.block.gen_store_gpr(reg, result);
        }
    }

    Status::Continue
}
