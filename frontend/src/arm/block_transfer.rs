//! LDM / STM with all addressing modes, the S-bit user-bank and
//! exception-return forms, and the ARMv4 base-in-list and empty-list
//! behaviors.

use rearm_core::ir::opcode::{AluKind, MemAccess};
use rearm_core::ir::var::Operand;
use rearm_core::psr::Mode;
use rearm_core::state::{GuestReg, GPR};

use crate::translator::{Status, Translator};

pub(crate) fn arm_block_transfer(t: &mut Translator, insn: u32) -> Status {
    let pre = insn & (1 << 24) != 0;
    let up = insn & (1 << 23) != 0;
    let s_bit = insn & (1 << 22) != 0;
    let writeback = insn & (1 << 21) != 0;
    let load = insn & (1 << 20) != 0;
    let rn = (insn >> 16) & 0xF;
    let rlist = insn & 0xFFFF;

    let mut regs: Vec<u32> = (0..16).filter(|r| rlist & (1 << r) != 0).collect();
    let empty = regs.is_empty();
    if empty {
        // ARMv4 quirk: an empty list transfers r15 and steps the base
        // by 0x40.
        regs.push(15);
    }
    let span: u32 = if empty { 0x40 } else { 4 * regs.len() as u32 };

    let has_pc = regs.contains(&15);
    let exception_return = s_bit && load && has_pc;
    let user_bank = s_bit && !exception_return;
    let transfer_mode = if user_bank { Mode::User } else { t.mode };

    let base = t.read_reg(rn);

    // Lowest transfer address; successive registers go upward from it.
    let start = match (pre, up) {
        (false, true) => base,
        (true, true) => Operand::Var(t.block.gen_alu(AluKind::Add, base, 4u32, false)),
        (false, false) => {
            let v = t
                .block
                .gen_alu(AluKind::Sub, base, Operand::Const(span - 4), false);
            Operand::Var(v)
        }
        (true, false) => Operand::Var(t.block.gen_alu(AluKind::Sub, base, span, false)),
    };

    let wb_kind = if up { AluKind::Add } else { AluKind::Sub };
    let wb_value = Operand::Var(t.block.gen_alu(wb_kind, base, span, false));

    let address_of = |t: &mut Translator, i: usize| -> Operand {
        if i == 0 {
            start
        } else {
            Operand::Var(
                t.block
                    .gen_alu(AluKind::Add, start, Operand::Const(4 * i as u32), false),
            )
        }
    };

    if load {
        let mut loaded = Vec::with_capacity(regs.len());
        for (i, &r) in regs.iter().enumerate() {
            let address = address_of(t, i);
            let value = t.block.gen_mem_read(address, MemAccess::word());
            loaded.push((r, value));
        }

        // A loaded base wins over writeback.
        if writeback && !regs.contains(&rn) {
            let reg = t.guest_reg(rn);
            t.block.gen_store_gpr(reg, wb_value);
        }

        let mut pc_value = None;
        for (r, value) in loaded {
            if r == 15 {
                pc_value = Some(value);
                continue;
            }
            let reg = GuestReg::new(GPR::from_index(r), transfer_mode);
            t.block.gen_store_gpr(reg, value);
        }

        if let Some(value) = pc_value {
            // The CPSR switch must come after every banked store above.
            if exception_return {
                t.emit_exception_return(Operand::Var(value));
            } else {
                t.emit_load_to_pc(Operand::Var(value));
            }
            return Status::BreakBasicBlock;
        }
        return Status::Continue;
    }

    // STM. The lowest-numbered register sees the original base; any
    // later occurrence of the base stores the written-back value.
    let lowest = regs[0];
    for (i, &r) in regs.iter().enumerate() {
        let value = if r == 15 {
            Operand::Const(t.pipeline_pc() + 4)
        } else if r == rn && writeback && r != lowest {
            wb_value
        } else if r == rn {
            base
        } else {
            let reg = GuestReg::new(GPR::from_index(r), transfer_mode);
            Operand::Var(t.block.gen_load_gpr(reg))
        };
        let address = address_of(t, i);
        t.block.gen_mem_write(address, value, MemAccess::word());
    }

    if writeback {
        let reg = t.guest_reg(rn);
        t.block.gen_store_gpr(reg, wb_value);
    }
    Status::Continue
}
