//! Thumb (16-bit) decode dispatch. The fetched word carries the
//! following halfword in its upper half so the long-branch lifter can
//! see its suffix.

mod lifters;

use crate::translator::{Status, Translator};

pub fn decode_thumb(insn: u32, t: &mut Translator) -> Status {
    let op = insn & 0xFFFF;

    match op >> 12 {
        0x0 | 0x1 => {
            if (op >> 11) & 0x3 == 0b11 {
                lifters::thumb_add_sub(t, op)
            } else {
                lifters::thumb_shift_imm(t, op)
            }
        }
        0x2 | 0x3 => lifters::thumb_mov_cmp_add_sub_imm(t, op),
        0x4 => match (op >> 10) & 0x3 {
            0 => lifters::thumb_alu(t, op),
            1 => lifters::thumb_hi_reg(t, op),
            _ => lifters::thumb_ldr_pc_relative(t, op),
        },
        0x5 => {
            if op & (1 << 9) == 0 {
                lifters::thumb_load_store_reg(t, op)
            } else {
                lifters::thumb_load_store_sign_ext(t, op)
            }
        }
        0x6 | 0x7 => lifters::thumb_load_store_imm(t, op),
        0x8 => lifters::thumb_load_store_half(t, op),
        0x9 => lifters::thumb_load_store_sp(t, op),
        0xA => lifters::thumb_load_address(t, op),
        0xB => match (op >> 8) & 0xF {
            0x0 => lifters::thumb_adjust_sp(t, op),
            0x4 | 0x5 | 0xC | 0xD => lifters::thumb_push_pop(t, op),
            0xE if t.armv5te => lifters::thumb_bkpt(t, op),
            _ => Status::Unimplemented,
        },
        0xC => lifters::thumb_ldm_stm(t, op),
        0xD => match (op >> 8) & 0xF {
            0xF => lifters::thumb_swi(t, op),
            0xE => Status::Unimplemented,
            _ => lifters::thumb_cond_branch(t, op),
        },
        0xE => {
            if op & (1 << 11) == 0 {
                lifters::thumb_branch(t, op)
            } else if t.armv5te {
                lifters::thumb_blx_suffix_standalone(t, op)
            } else {
                Status::Unimplemented
            }
        }
        _ => lifters::thumb_long_branch(t, insn),
    }
}
