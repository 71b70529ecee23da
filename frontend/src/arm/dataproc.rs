//! Data-processing lifter: the sixteen ALU opcodes with immediate,
//! register, and register-shifted operands.

use rearm_core::ir::opcode::{AluKind, ShiftKind};
use rearm_core::ir::var::Operand;

use crate::translator::{Status, Translator};

/// Decoded operand 2, plus whether the barrel shifter staged a carry
/// (deciding between `UpdateNZC` and plain `UpdateNZ`).
pub(crate) struct ShiftedOperand {
    pub value: Operand,
    pub reg_shift: bool,
    pub carry_staged: bool,
}

/// Lift the barrel-shifter operand of a data-processing instruction.
/// `want_carry` requests the shifter carry-out in the flag stage.
pub(crate) fn shift_operand(t: &mut Translator, insn: u32, want_carry: bool) -> ShiftedOperand {
    if insn & (1 << 25) != 0 {
        let imm = insn & 0xFF;
        let rot = (insn >> 8) & 0xF;
        let value = imm.rotate_right(rot * 2);
        let mut carry_staged = false;
        if want_carry && rot != 0 {
            t.block.gen_set_carry(value >> 31 != 0);
            carry_staged = true;
        }
        return ShiftedOperand {
            value: Operand::Const(value),
            reg_shift: false,
            carry_staged,
        };
    }

    let rm = insn & 0xF;
    let shift_type = (insn >> 5) & 0x3;
    let kind = match shift_type {
        0 => ShiftKind::Lsl,
        1 => ShiftKind::Lsr,
        2 => ShiftKind::Asr,
        _ => ShiftKind::Ror,
    };

    if insn & 0x10 != 0 {
        // Register-specified amount; r15 reads skew by one fetch.
        let rs = (insn >> 8) & 0xF;
        let value = t.read_reg_shift_quirk(rm);
        let amount = t.read_reg(rs);
        let dst = t.block.gen_shift(kind, value, amount, want_carry);
        return ShiftedOperand {
            value: Operand::Var(dst),
            reg_shift: true,
            carry_staged: want_carry,
        };
    }

    let amount = (insn >> 7) & 0x1F;
    let value = t.read_reg(rm);

    // Amount zero encodes the 32-bit forms (and RRX for ROR).
    let (kind, amount) = match (kind, amount) {
        (ShiftKind::Lsl, 0) => {
            // Identity: value and carry pass through untouched.
            return ShiftedOperand {
                value,
                reg_shift: false,
                carry_staged: false,
            };
        }
        (ShiftKind::Lsr, 0) | (ShiftKind::Asr, 0) => (kind, 32),
        (ShiftKind::Ror, 0) => (ShiftKind::Rrx, 0),
        _ => (kind, amount),
    };

    let dst = t
        .block
        .gen_shift(kind, value, Operand::Const(amount), want_carry);
    ShiftedOperand {
        value: Operand::Var(dst),
        reg_shift: false,
        carry_staged: want_carry,
    }
}

pub(crate) fn arm_data_processing(t: &mut Translator, insn: u32) -> Status {
    let opcode = (insn >> 21) & 0xF;
    let set_flags = insn & (1 << 20) != 0;
    let rn = (insn >> 16) & 0xF;
    let rd = (insn >> 12) & 0xF;

    let is_compare = (8..=11).contains(&opcode);
    // Logical opcodes take C from the shifter and leave V alone.
    let logical = matches!(opcode, 0 | 1 | 8 | 9 | 12 | 13 | 14 | 15);
    let exception_return = set_flags && rd == 15 && !is_compare;

    let want_carry = set_flags && logical && !exception_return;
    let op2 = shift_operand(t, insn, want_carry);

    let result: Operand = match opcode {
        13 => Operand::Var(t.block.gen_mov(op2.value, set_flags && !exception_return)),
        15 => Operand::Var(t.block.gen_mvn(op2.value, set_flags && !exception_return)),
        _ => {
            let lhs = if op2.reg_shift {
                t.read_reg_shift_quirk(rn)
            } else {
                t.read_reg(rn)
            };
            let kind = match opcode {
                0 | 8 => AluKind::And,
                1 | 9 => AluKind::Eor,
                2 | 10 => AluKind::Sub,
                3 => AluKind::Rsb,
                4 | 11 => AluKind::Add,
                5 => AluKind::Adc,
                6 => AluKind::Sbc,
                7 => AluKind::Rsc,
                12 => AluKind::Orr,
                _ => AluKind::Bic,
            };
            if is_compare {
                t.block.gen_alu_compare(kind, lhs, op2.value);
                Operand::Const(0) // unused
            } else {
                let flags = set_flags && !exception_return;
                Operand::Var(t.block.gen_alu(kind, lhs, op2.value, flags))
            }
        }
    };

    if is_compare {
        if logical {
            // TST/TEQ: C only changes when the shifter produced one.
            if op2.carry_staged {
                t.emit_update_nzc();
            } else {
                t.emit_update_nz();
            }
        } else {
            t.emit_update_nzcv();
        }
        return Status::BreakMicroBlock;
    }

    if rd == 15 {
        if exception_return {
            t.emit_exception_return(result);
        } else {
            t.emit_flush(result);
        }
        return Status::BreakBasicBlock;
    }

    let reg = t.guest_reg(rd);
    t.block.gen_store_gpr(reg, result);

    if set_flags {
        if logical {
            if op2.carry_staged {
                t.emit_update_nzc();
            } else {
                t.emit_update_nz();
            }
        } else {
            t.emit_update_nzcv();
        }
        return Status::BreakMicroBlock;
    }

    Status::Continue
}
