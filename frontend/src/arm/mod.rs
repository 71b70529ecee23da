//! ARM (32-bit) decode dispatch. One arm per opcode family; the
//! lifters decode their own fields.

mod block_transfer;
mod branch;
mod cop;
mod dataproc;
mod misc;
mod multiply;
mod status;
mod transfer;

use crate::translator::{Status, Translator};

pub fn decode_arm(insn: u32, t: &mut Translator) -> Status {
    // ARMv5TE unpredicated space (condition field = NV).
    if insn >> 28 == 0xF && t.armv5te {
        if insn & 0x0E00_0000 == 0x0A00_0000 {
            return branch::arm_blx_imm(t, insn);
        }
        if insn & 0x0D70_F000 == 0x0550_F000 {
            return misc::arm_pld(t, insn);
        }
        return Status::Unimplemented;
    }

    match (insn >> 25) & 0x7 {
        0b000 => {
            if insn & 0x0FC0_00F0 == 0x0000_0090 {
                return multiply::arm_multiply(t, insn);
            }
            if insn & 0x0F80_00F0 == 0x0080_0090 {
                return multiply::arm_multiply_long(t, insn);
            }
            if insn & 0x0FB0_0FF0 == 0x0100_0090 {
                return transfer::arm_swap(t, insn);
            }
            if insn & 0x90 == 0x90 && insn & 0x60 != 0 {
                return transfer::arm_halfword_transfer(t, insn);
            }
            if insn & 0x0190_0000 == 0x0100_0000 {
                // Comparison opcodes without S: the miscellaneous zone.
                if insn & 0x0FBF_0000 == 0x010F_0000 {
                    return status::arm_mrs(t, insn);
                }
                if insn & 0x0FB0_00F0 == 0x0120_0000 {
                    return status::arm_msr_reg(t, insn);
                }
                if insn & 0x0FF0_00F0 == 0x0120_0010 {
                    return branch::arm_bx(t, insn);
                }
                if t.armv5te {
                    if insn & 0x0FF0_00F0 == 0x0120_0030 {
                        return branch::arm_blx_reg(t, insn);
                    }
                    if insn & 0x0FF0_00F0 == 0x0120_0070 {
                        return misc::arm_bkpt(t, insn);
                    }
                    if insn & 0x0FF0_00F0 == 0x0160_0010 {
                        return misc::arm_clz(t, insn);
                    }
                    if insn & 0x0F90_00F0 == 0x0100_0050 {
                        return misc::arm_saturating(t, insn);
                    }
                    if insn & 0x0F90_0090 == 0x0100_0080 {
                        return multiply::arm_multiply_half(t, insn);
                    }
                }
                return Status::Unimplemented;
            }
            dataproc::arm_data_processing(t, insn)
        }
        0b001 => {
            if insn & 0x0190_0000 == 0x0100_0000 {
                if insn & 0x0FB0_0000 == 0x0320_0000 {
                    return status::arm_msr_imm(t, insn);
                }
                return Status::Unimplemented;
            }
            dataproc::arm_data_processing(t, insn)
        }
        0b010 => transfer::arm_single_transfer(t, insn),
        0b011 => {
            if insn & 0x10 != 0 {
                // The architecturally undefined space.
                return Status::Unimplemented;
            }
            transfer::arm_single_transfer(t, insn)
        }
        0b100 => block_transfer::arm_block_transfer(t, insn),
        0b101 => branch::arm_branch(t, insn),
        0b110 => Status::Unimplemented, // LDC/STC not supported
        _ => {
            if insn & 0x0100_0000 != 0 {
                return misc::arm_swi(t, insn);
            }
            if insn & 0x10 != 0 {
                return cop::arm_cop_transfer(t, insn);
            }
            Status::Unimplemented // CDP not supported
        }
    }
}
