//! Per-IR-opcode lowering to x86-64, plus the shared prologue and
//! epilogue and the patchable successor-link slots.
//!
//! Register conventions inside generated code:
//!   rax — scratch: `lahf`/`seto` staging and lowering workspace
//!   rcx — guest `State` pointer
//!   rbp — spill frame pointer
//! Everything else is handed out by the register allocator.
//!
//! ARM condition flags are staged in `State::flag_stage` as a packed
//! `lahf`/`seto` image ({SF@15, ZF@14, CF@8, OF@0}); the `UpdateNZ*`
//! opcodes fold the stage into a CPSR value. Staging in memory keeps
//! the flags safe from allocator spill traffic.

use rearm_core::ir::block::BasicBlock;
use rearm_core::ir::opcode::{AluKind, MemAccess, MemSize, Op, SatKind, ShiftKind};
use rearm_core::ir::var::{Operand, VarIdx};
use rearm_core::psr::{Condition, Psr};
use rearm_core::state::State;
use rearm_core::Error;

use crate::code_buffer::CodeBuffer;
use crate::exit_code;
use crate::regalloc::RegisterAllocator;

use super::emitter::*;
use super::regs::{
    Reg, ARG_REGS, CALLEE_SAVED, CALL_SHADOW_SPACE, FRAME, FRAME_SIZE, SCRATCH, SCRATCH0_OFFSET,
    SCRATCH1_OFFSET, STATE,
};

/// Addresses of the runtime helpers compiled code calls out to, plus
/// the context pointer passed as their first argument.
#[derive(Debug, Clone, Copy)]
pub struct Helpers {
    pub ctx: u64,
    pub read_byte: u64,
    pub read_byte_signed: u64,
    pub read_half: u64,
    pub read_half_rotate: u64,
    pub read_half_signed: u64,
    pub read_half_signed_rotate: u64,
    pub read_word: u64,
    pub read_word_rotate: u64,
    pub write_byte: u64,
    pub write_half: u64,
    pub write_word: u64,
    pub cop_read: u64,
    pub cop_write: u64,
    pub set_cpsr: u64,
    pub raise_exception: u64,
}

/// A patchable direct-jump slot at a block exit.
#[derive(Debug, Clone, Copy)]
pub struct JumpSlot {
    /// Offset of the 5-byte `jmp rel32` instruction.
    pub jmp_offset: u32,
    /// Offset the jump targets when unlinked (its own exit stub).
    pub reset_offset: u32,
}

/// Result of compiling one basic block.
#[derive(Debug, Clone, Copy)]
pub struct CompiledBlock {
    pub offset: usize,
    pub size: usize,
    /// Slot 0: taken successor. Slot 1: fall-through successor.
    pub jmp_slots: [Option<JumpSlot>; 2],
}

/// Emit the shared entry prologue at the current buffer position.
///
/// Entry contract: `fn(state: *mut State, entry: *const u8) -> u64`.
pub fn emit_prologue(buf: &mut CodeBuffer) {
    for &reg in CALLEE_SAVED {
        push(buf, reg);
    }
    if STATE != ARG_REGS[0] {
        mov_rr(buf, true, STATE, ARG_REGS[0]);
    }
    arith_ri(buf, Arith::Sub, true, Reg::Rsp, FRAME_SIZE as u32);
    mov_rr(buf, true, FRAME, Reg::Rsp);
    jmp_reg(buf, ARG_REGS[1]);
}

/// Emit the shared epilogue; returns its entry offset. Blocks jump
/// here with the exit value already in rax.
pub fn emit_epilogue(buf: &mut CodeBuffer) -> usize {
    let at = buf.offset();
    arith_ri(buf, Arith::Add, true, Reg::Rsp, FRAME_SIZE as u32);
    for &reg in CALLEE_SAVED.iter().rev() {
        pop(buf, reg);
    }
    ret(buf);
    at
}

/// Worst-case bytes per IR opcode (LDM-heavy blocks are call-dense),
/// plus fixed overhead, used for the buffer-full check.
const BYTES_PER_OP: usize = 192;
const BYTES_FIXED: usize = 512;

pub fn compile_block(
    block: &BasicBlock,
    entry_id: u32,
    buf: &mut CodeBuffer,
    helpers: &Helpers,
    epilogue_offset: usize,
) -> Result<CompiledBlock, Error> {
    let estimate = BYTES_FIXED + block.code.len() * BYTES_PER_OP;
    if buf.remaining() < estimate {
        return Err(Error::OutOfCodeMemory);
    }

    let start = buf.offset();
    let mut alloc = RegisterAllocator::new(block);

    // Cycle gate: bail to the dispatcher when the budget is spent,
    // otherwise charge this block up front.
    cmp_mi8(buf, false, STATE, State::CYCLES_OFFSET, 0);
    let run = jcc_forward(buf, Cc::G);
    mov_ri64(buf, SCRATCH, exit_code::encode(entry_id, exit_code::SLOT_BUDGET));
    jmp_to(buf, epilogue_offset);
    patch_forward(buf, run);
    arith_mi(buf, Arith::Sub, STATE, State::CYCLES_OFFSET, block.length);

    for mb in &block.micro_blocks {
        #[cfg(debug_assertions)]
        alloc.assert_no_live_across(mb.start);

        if mb.condition == Condition::NV {
            // Never executed; emit nothing.
            continue;
        }
        let skips = if mb.condition != Condition::AL {
            emit_condition_fence(buf, mb.condition)
        } else {
            Vec::new()
        };

        for location in mb.start..mb.end {
            lower_op(&block.code[location], location, block, &mut alloc, buf, helpers)?;
        }

        for s in skips {
            patch_forward(buf, s);
        }
    }

    // Successor linking.
    let mut jmp_slots = [None, None];
    match block.branch_target {
        Some(bt) if bt.condition == Condition::AL => {
            jmp_slots[0] = Some(emit_goto_slot(buf, entry_id, 0, epilogue_offset));
        }
        Some(bt) => {
            let not_taken = emit_condition_fence(buf, bt.condition);
            jmp_slots[0] = Some(emit_goto_slot(buf, entry_id, 0, epilogue_offset));
            for s in not_taken {
                patch_forward(buf, s);
            }
            jmp_slots[1] = Some(emit_goto_slot(buf, entry_id, 1, epilogue_offset));
        }
        None => {
            mov_ri64(
                buf,
                SCRATCH,
                exit_code::encode(entry_id, exit_code::SLOT_NO_CHAIN),
            );
            jmp_to(buf, epilogue_offset);
        }
    }

    tracing::debug!(
        entry_id,
        ops = block.code.len(),
        bytes = buf.offset() - start,
        "block compiled"
    );
    Ok(CompiledBlock {
        offset: start,
        size: buf.offset() - start,
        jmp_slots,
    })
}

/// A patchable `jmp rel32` followed by its unlinked exit stub. The
/// displacement is 4-byte aligned so chain patching is a single
/// aligned store.
fn emit_goto_slot(buf: &mut CodeBuffer, entry_id: u32, slot: u64, epilogue_offset: usize) -> JumpSlot {
    while (buf.offset() + 1) % 4 != 0 {
        nop(buf);
    }
    let jmp_offset = buf.offset();
    buf.emit_u8(0xE9);
    buf.emit_u32(0); // falls through to the stub below
    let reset_offset = buf.offset();
    mov_ri64(buf, SCRATCH, exit_code::encode(entry_id, slot));
    jmp_to(buf, epilogue_offset);
    JumpSlot {
        jmp_offset: jmp_offset as u32,
        reset_offset: reset_offset as u32,
    }
}

/// Patch the slot's jump to land on `target_offset` (a block head),
/// or back on its own reset stub to unlink.
pub fn patch_jump(buf: &mut CodeBuffer, slot: JumpSlot, target_offset: usize) {
    let disp = target_offset as i64 - (slot.jmp_offset as i64 + 5);
    assert!(
        (i32::MIN as i64..=i32::MAX as i64).contains(&disp),
        "jump displacement out of range"
    );
    buf.patch_u32(slot.jmp_offset as usize + 1, disp as u32);
}

/// Emit a test of `cond` against the in-memory CPSR. Returns forward
/// rel32 patch offsets that jump when the predicate FAILS.
fn emit_condition_fence(buf: &mut CodeBuffer, cond: Condition) -> Vec<usize> {
    let flag_test = |buf: &mut CodeBuffer, flag: u32, skip_when_clear: bool| -> Vec<usize> {
        test_mi(buf, STATE, State::CPSR_OFFSET, flag);
        let cc = if skip_when_clear { Cc::E } else { Cc::Ne };
        vec![jcc_forward(buf, cc)]
    };

    match cond {
        Condition::EQ => flag_test(buf, Psr::Z, true),
        Condition::NE => flag_test(buf, Psr::Z, false),
        Condition::CS => flag_test(buf, Psr::C, true),
        Condition::CC => flag_test(buf, Psr::C, false),
        Condition::MI => flag_test(buf, Psr::N, true),
        Condition::PL => flag_test(buf, Psr::N, false),
        Condition::VS => flag_test(buf, Psr::V, true),
        Condition::VC => flag_test(buf, Psr::V, false),
        Condition::HI | Condition::LS => {
            mov_rm(buf, false, SCRATCH, STATE, State::CPSR_OFFSET);
            arith_ri(buf, Arith::And, false, SCRATCH, Psr::C | Psr::Z);
            arith_ri(buf, Arith::Cmp, false, SCRATCH, Psr::C);
            let cc = if cond == Condition::HI { Cc::Ne } else { Cc::E };
            vec![jcc_forward(buf, cc)]
        }
        Condition::GE | Condition::LT => {
            // After shifting NZCV into the low nibble, N==V holds
            // exactly when the (N|V) projection has even parity.
            mov_rm(buf, false, SCRATCH, STATE, State::CPSR_OFFSET);
            shift_ri(buf, ShiftOp::Shr, false, SCRATCH, 28);
            arith_ri(buf, Arith::And, false, SCRATCH, 0x9);
            let cc = if cond == Condition::GE { Cc::Np } else { Cc::P };
            vec![jcc_forward(buf, cc)]
        }
        Condition::GT => {
            // Pass iff Z==0 && N==V, i.e. the N/Z/V projection is
            // 0b0000 or 0b1001.
            mov_rm(buf, false, SCRATCH, STATE, State::CPSR_OFFSET);
            shift_ri(buf, ShiftOp::Shr, false, SCRATCH, 28);
            arith_ri(buf, Arith::And, false, SCRATCH, 0xD);
            let enter = jcc_short(buf, Cc::E);
            arith_ri(buf, Arith::Cmp, false, SCRATCH, 0x9);
            let skip = jcc_forward(buf, Cc::Ne);
            patch_short(buf, enter);
            vec![skip]
        }
        Condition::LE => {
            mov_rm(buf, false, SCRATCH, STATE, State::CPSR_OFFSET);
            shift_ri(buf, ShiftOp::Shr, false, SCRATCH, 28);
            arith_ri(buf, Arith::And, false, SCRATCH, 0xD);
            let s1 = jcc_forward(buf, Cc::E);
            arith_ri(buf, Arith::Cmp, false, SCRATCH, 0x9);
            let s2 = jcc_forward(buf, Cc::E);
            vec![s1, s2]
        }
        Condition::AL | Condition::NV => unreachable!("fence on {cond:?}"),
    }
}

// -- operand plumbing --

#[derive(Debug, Clone, Copy)]
enum Src {
    Reg(Reg),
    Imm(u32),
}

fn src_of(
    operand: Operand,
    location: usize,
    op: &Op,
    alloc: &mut RegisterAllocator,
    buf: &mut CodeBuffer,
) -> Result<Src, Error> {
    match operand {
        Operand::Const(v) => Ok(Src::Imm(v)),
        Operand::Var(v) => Ok(Src::Reg(alloc.reg_for(v, location, op, buf)?)),
    }
}

fn load_eax(buf: &mut CodeBuffer, src: Src) {
    match src {
        Src::Reg(r) => mov_rr(buf, false, SCRATCH, r),
        Src::Imm(v) => mov_ri32(buf, SCRATCH, v),
    }
}

fn arith_eax(buf: &mut CodeBuffer, op: Arith, src: Src) {
    match src {
        Src::Reg(r) => arith_rr(buf, op, false, SCRATCH, r),
        Src::Imm(v) => arith_ri(buf, op, false, SCRATCH, v),
    }
}

fn mov_reg_src(buf: &mut CodeBuffer, dst: Reg, src: Src) {
    match src {
        Src::Reg(r) => {
            if r != dst {
                mov_rr(buf, false, dst, r);
            }
        }
        Src::Imm(v) => mov_ri32(buf, dst, v),
    }
}

// -- flag staging --

const STG: i32 = State::FLAG_STAGE_OFFSET;
const CPSR: i32 = State::CPSR_OFFSET;
const STAGE_C: u32 = 1 << 8;
const STAGE_V: u32 = 1 << 0;

/// Capture all host flags into the stage (`cmc` first for the
/// subtraction borrow/carry polarity flip).
fn stage_all(buf: &mut CodeBuffer, subtraction: bool) {
    if subtraction {
        cmc(buf);
    }
    lahf(buf);
    setcc(buf, Cc::O, SCRATCH);
    mov_mr(buf, false, STATE, STG, SCRATCH);
}

/// Stage SF/ZF from the current host flags, preserving the staged
/// carry (logical ops: C belongs to the barrel shifter).
fn stage_nz_keep_c(buf: &mut CodeBuffer) {
    lahf(buf);
    arith_ri(buf, Arith::And, false, SCRATCH, 0xC000);
    arith_mi(buf, Arith::And, STATE, STG, STAGE_C);
    arith_mr(buf, Arith::Or, false, STATE, STG, SCRATCH);
}

/// Stage SF/ZF from a fresh `test eax, eax`.
fn stage_nz_from_eax(buf: &mut CodeBuffer) {
    test_rr(buf, false, SCRATCH, SCRATCH);
    stage_nz_keep_c(buf);
}

/// Stage the carry bit from the live CF.
fn stage_carry_cf(buf: &mut CodeBuffer) {
    let set = jcc_short(buf, Cc::B);
    arith_mi(buf, Arith::And, STATE, STG, !STAGE_C);
    let done = jmp_short(buf);
    patch_short(buf, set);
    arith_mi(buf, Arith::Or, STATE, STG, STAGE_C);
    patch_short(buf, done);
}

fn stage_carry_bool(buf: &mut CodeBuffer, carry: bool) {
    if carry {
        arith_mi(buf, Arith::Or, STATE, STG, STAGE_C);
    } else {
        arith_mi(buf, Arith::And, STATE, STG, !STAGE_C);
    }
}

/// Seed the staged carry from the guest CPSR (register-amount shifts
/// leave C untouched when the amount is zero).
fn stage_carry_from_guest(buf: &mut CodeBuffer) {
    bt_mi(buf, STATE, CPSR, 29);
    stage_carry_cf(buf);
}

// -- helper calls --

fn emit_helper_call(
    buf: &mut CodeBuffer,
    alloc: &RegisterAllocator,
    helpers: &Helpers,
    helper: u64,
    arg1: Src,
    arg2: Option<Src>,
) {
    let mut saved = vec![STATE];
    saved.extend(alloc.live_caller_saved());

    for &r in &saved {
        push(buf, r);
    }
    let adjust = (saved.len() % 2) * 8 + CALL_SHADOW_SPACE;
    if adjust != 0 {
        arith_ri(buf, Arith::Sub, true, Reg::Rsp, adjust as u32);
    }

    // Stage arguments through rax/r10 (never argument registers on
    // either ABI) so operand registers are not clobbered mid-setup.
    if let Some(a2) = arg2 {
        load_eax(buf, a2);
    }
    mov_reg_src(buf, Reg::R10, arg1);
    if arg2.is_some() {
        mov_rr(buf, false, ARG_REGS[2], SCRATCH);
    }
    mov_rr(buf, false, ARG_REGS[1], Reg::R10);
    mov_ri64(buf, ARG_REGS[0], helpers.ctx);

    mov_ri64(buf, SCRATCH, helper);
    call_reg(buf, SCRATCH);

    if adjust != 0 {
        arith_ri(buf, Arith::Add, true, Reg::Rsp, adjust as u32);
    }
    for &r in saved.iter().rev() {
        pop(buf, r);
    }
}

fn read_helper(helpers: &Helpers, access: MemAccess) -> u64 {
    match (access.size, access.signed, access.rotate) {
        (MemSize::Byte, false, _) => helpers.read_byte,
        (MemSize::Byte, true, _) => helpers.read_byte_signed,
        (MemSize::Half, false, false) => helpers.read_half,
        (MemSize::Half, false, true) => helpers.read_half_rotate,
        (MemSize::Half, true, false) => helpers.read_half_signed,
        (MemSize::Half, true, true) => helpers.read_half_signed_rotate,
        (MemSize::Word, _, false) => helpers.read_word,
        (MemSize::Word, _, true) => helpers.read_word_rotate,
    }
}

fn write_helper(helpers: &Helpers, access: MemAccess) -> u64 {
    match access.size {
        MemSize::Byte => helpers.write_byte,
        MemSize::Half => helpers.write_half,
        MemSize::Word => helpers.write_word,
    }
}

fn pack_cop(cp: u8, opcode1: u8, cn: u8, cm: u8, opcode2: u8) -> u32 {
    cp as u32 | (opcode1 as u32) << 4 | (cn as u32) << 8 | (cm as u32) << 12 | (opcode2 as u32) << 16
}

// -- per-op lowering --

fn lower_op(
    op: &Op,
    location: usize,
    block: &BasicBlock,
    alloc: &mut RegisterAllocator,
    buf: &mut CodeBuffer,
    helpers: &Helpers,
) -> Result<(), Error> {
    let mode = block.key.mode;
    let define =
        |v: VarIdx, alloc: &mut RegisterAllocator, buf: &mut CodeBuffer| -> Result<Reg, Error> {
            alloc.reg_for(v, location, op, buf)
        };

    match op {
        // -- guest state --
        Op::LoadGpr { dst, reg } => {
            let d = define(*dst, alloc, buf)?;
            mov_rm(buf, false, d, STATE, State::guest_reg_offset(mode, *reg));
        }
        Op::StoreGpr { reg, src } => {
            let offset = State::guest_reg_offset(mode, *reg);
            match src_of(*src, location, op, alloc, buf)? {
                Src::Reg(r) => mov_mr(buf, false, STATE, offset, r),
                Src::Imm(v) => mov_mi32(buf, STATE, offset, v),
            }
        }
        Op::LoadSpsr { dst, mode: m } => {
            let d = define(*dst, alloc, buf)?;
            mov_rm(buf, false, d, STATE, State::spsr_offset(m.bank()));
        }
        Op::StoreSpsr { mode: m, src } => {
            let offset = State::spsr_offset(m.bank());
            match src_of(*src, location, op, alloc, buf)? {
                Src::Reg(r) => mov_mr(buf, false, STATE, offset, r),
                Src::Imm(v) => mov_mi32(buf, STATE, offset, v),
            }
        }
        Op::LoadCpsr { dst } => {
            let d = define(*dst, alloc, buf)?;
            mov_rm(buf, false, d, STATE, CPSR);
        }
        Op::StoreCpsr { src } => match src_of(*src, location, op, alloc, buf)? {
            Src::Reg(r) => mov_mr(buf, false, STATE, CPSR, r),
            Src::Imm(v) => mov_mi32(buf, STATE, CPSR, v),
        },
        Op::WriteCpsrControl { src } => {
            let value = src_of(*src, location, op, alloc, buf)?;
            emit_helper_call(buf, alloc, helpers, helpers.set_cpsr, value, None);
        }

        // -- data processing --
        Op::Alu {
            kind,
            dst,
            lhs,
            rhs,
            set_flags,
        } => {
            let lhs_s = src_of(*lhs, location, op, alloc, buf)?;
            let rhs_s = src_of(*rhs, location, op, alloc, buf)?;

            match kind {
                AluKind::Bic => {
                    load_eax(buf, rhs_s);
                    not(buf, false, SCRATCH);
                    arith_eax(buf, Arith::And, lhs_s);
                }
                AluKind::Rsb => {
                    load_eax(buf, rhs_s);
                    arith_eax(buf, Arith::Sub, lhs_s);
                }
                AluKind::Rsc => {
                    load_eax(buf, rhs_s);
                    bt_mi(buf, STATE, CPSR, 29);
                    cmc(buf);
                    arith_eax(buf, Arith::Sbb, lhs_s);
                }
                AluKind::Adc => {
                    load_eax(buf, lhs_s);
                    bt_mi(buf, STATE, CPSR, 29);
                    arith_eax(buf, Arith::Adc, rhs_s);
                }
                AluKind::Sbc => {
                    load_eax(buf, lhs_s);
                    bt_mi(buf, STATE, CPSR, 29);
                    cmc(buf);
                    arith_eax(buf, Arith::Sbb, rhs_s);
                }
                _ => {
                    let host = match kind {
                        AluKind::And => Arith::And,
                        AluKind::Orr => Arith::Or,
                        AluKind::Eor => Arith::Xor,
                        AluKind::Add => Arith::Add,
                        AluKind::Sub => Arith::Sub,
                        _ => unreachable!(),
                    };
                    load_eax(buf, lhs_s);
                    arith_eax(buf, host, rhs_s);
                }
            }

            if *set_flags {
                if kind.is_arithmetic() {
                    stage_all(buf, kind.is_subtraction());
                } else {
                    stage_nz_keep_c(buf);
                }
            }
            if let Some(d) = dst {
                let d = define(*d, alloc, buf)?;
                mov_rr(buf, false, d, SCRATCH);
            }
        }

        Op::Mov {
            dst,
            src,
            negate,
            set_flags,
        } => {
            let s = src_of(*src, location, op, alloc, buf)?;
            load_eax(buf, s);
            if *negate {
                not(buf, false, SCRATCH);
            }
            if *set_flags {
                stage_nz_from_eax(buf);
            }
            let d = define(*dst, alloc, buf)?;
            mov_rr(buf, false, d, SCRATCH);
        }

        Op::Shift {
            kind,
            dst,
            value,
            amount,
            set_carry,
        } => {
            lower_shift(op, location, *kind, *dst, *value, *amount, *set_carry, alloc, buf)?;
        }

        Op::SetCarry { value } => stage_carry_bool(buf, *value),

        Op::Clz { dst, src } => {
            let s = src_of(*src, location, op, alloc, buf)?;
            load_eax(buf, s);
            bsr(buf, SCRATCH, SCRATCH);
            let found = jcc_short(buf, Cc::Ne);
            // Zero input: bsr leaves eax undefined; force 31-(-1)=32.
            mov_ri32(buf, SCRATCH, 0xFFFF_FFFF);
            patch_short(buf, found);
            let d = define(*dst, alloc, buf)?;
            mov_ri32(buf, d, 31);
            arith_rr(buf, Arith::Sub, false, d, SCRATCH);
        }

        Op::Saturating { kind, dst, lhs, rhs } => {
            let lhs_s = src_of(*lhs, location, op, alloc, buf)?;
            let rhs_s = src_of(*rhs, location, op, alloc, buf)?;
            arith_mi(buf, Arith::And, STATE, STG, !STAGE_V);

            let doubled = matches!(kind, SatKind::DoubleAdd | SatKind::DoubleSub);
            if doubled {
                load_eax(buf, rhs_s);
                arith_rr(buf, Arith::Add, false, SCRATCH, SCRATCH);
                emit_saturate_on_overflow(buf);
                mov_mr(buf, false, FRAME, SCRATCH0_OFFSET, SCRATCH);
                load_eax(buf, lhs_s);
                let host = if matches!(kind, SatKind::DoubleAdd) {
                    Arith::Add
                } else {
                    Arith::Sub
                };
                arith_rm(buf, host, false, SCRATCH, FRAME, SCRATCH0_OFFSET);
            } else {
                load_eax(buf, lhs_s);
                let host = if matches!(kind, SatKind::Add) {
                    Arith::Add
                } else {
                    Arith::Sub
                };
                arith_eax(buf, host, rhs_s);
            }
            emit_saturate_on_overflow(buf);
            let d = define(*dst, alloc, buf)?;
            mov_rr(buf, false, d, SCRATCH);
        }

        // -- multiply --
        Op::Mul {
            dst,
            lhs,
            rhs,
            acc,
            set_flags,
        } => {
            let lhs_s = src_of(*lhs, location, op, alloc, buf)?;
            let rhs_s = src_of(*rhs, location, op, alloc, buf)?;
            let acc_s = match acc {
                Some(a) => Some(src_of(*a, location, op, alloc, buf)?),
                None => None,
            };
            load_eax(buf, lhs_s);
            match rhs_s {
                Src::Reg(r) => imul_rr(buf, false, SCRATCH, r),
                Src::Imm(v) => imul_rri(buf, false, SCRATCH, SCRATCH, v),
            }
            if let Some(a) = acc_s {
                arith_eax(buf, Arith::Add, a);
            }
            if *set_flags {
                stage_nz_from_eax(buf);
            }
            let d = define(*dst, alloc, buf)?;
            mov_rr(buf, false, d, SCRATCH);
        }

        Op::MulLong {
            dst_lo,
            dst_hi,
            lhs,
            rhs,
            acc,
            signed,
            set_flags,
        } => {
            let lhs_s = src_of(*lhs, location, op, alloc, buf)?;
            let rhs_s = src_of(*rhs, location, op, alloc, buf)?;
            let acc_s = match acc {
                Some((lo, hi)) => Some((
                    src_of(*lo, location, op, alloc, buf)?,
                    src_of(*hi, location, op, alloc, buf)?,
                )),
                None => None,
            };

            load_eax(buf, rhs_s);
            if *signed {
                movsxd(buf, SCRATCH, SCRATCH);
            }
            mov_mr(buf, true, FRAME, SCRATCH0_OFFSET, SCRATCH);
            load_eax(buf, lhs_s);
            if *signed {
                movsxd(buf, SCRATCH, SCRATCH);
            }
            imul_rm(buf, true, SCRATCH, FRAME, SCRATCH0_OFFSET);

            if let Some((lo, hi)) = acc_s {
                mov_mr(buf, true, FRAME, SCRATCH0_OFFSET, SCRATCH);
                load_eax(buf, hi);
                shift_ri(buf, ShiftOp::Shl, true, SCRATCH, 32);
                mov_mr(buf, true, FRAME, SCRATCH1_OFFSET, SCRATCH);
                load_eax(buf, lo);
                arith_rm(buf, Arith::Or, true, SCRATCH, FRAME, SCRATCH1_OFFSET);
                arith_rm(buf, Arith::Add, true, SCRATCH, FRAME, SCRATCH0_OFFSET);
            }

            emit_split_u64(buf, *dst_lo, *dst_hi, *set_flags, location, op, alloc)?;
        }

        Op::MulHalf {
            dst,
            lhs,
            rhs,
            lhs_top,
            rhs_top,
            acc,
        } => {
            let lhs_s = src_of(*lhs, location, op, alloc, buf)?;
            let rhs_s = src_of(*rhs, location, op, alloc, buf)?;
            let acc_s = match acc {
                Some(a) => Some(src_of(*a, location, op, alloc, buf)?),
                None => None,
            };
            load_eax(buf, lhs_s);
            extract_half(buf, *lhs_top);
            mov_mr(buf, false, FRAME, SCRATCH0_OFFSET, SCRATCH);
            load_eax(buf, rhs_s);
            extract_half(buf, *rhs_top);
            imul_rm(buf, false, SCRATCH, FRAME, SCRATCH0_OFFSET);
            if let Some(a) = acc_s {
                arith_mi(buf, Arith::And, STATE, STG, !STAGE_V);
                arith_eax(buf, Arith::Add, a);
                let no = jcc_short(buf, Cc::No);
                arith_mi(buf, Arith::Or, STATE, STG, STAGE_V);
                patch_short(buf, no);
            }
            let d = define(*dst, alloc, buf)?;
            mov_rr(buf, false, d, SCRATCH);
        }

        Op::MulWordHalf {
            dst,
            lhs,
            rhs,
            rhs_top,
            acc,
        } => {
            let lhs_s = src_of(*lhs, location, op, alloc, buf)?;
            let rhs_s = src_of(*rhs, location, op, alloc, buf)?;
            let acc_s = match acc {
                Some(a) => Some(src_of(*a, location, op, alloc, buf)?),
                None => None,
            };
            load_eax(buf, rhs_s);
            extract_half(buf, *rhs_top);
            movsxd(buf, SCRATCH, SCRATCH);
            mov_mr(buf, true, FRAME, SCRATCH0_OFFSET, SCRATCH);
            load_eax(buf, lhs_s);
            movsxd(buf, SCRATCH, SCRATCH);
            imul_rm(buf, true, SCRATCH, FRAME, SCRATCH0_OFFSET);
            shift_ri(buf, ShiftOp::Sar, true, SCRATCH, 16);
            if let Some(a) = acc_s {
                arith_mi(buf, Arith::And, STATE, STG, !STAGE_V);
                arith_eax(buf, Arith::Add, a);
                let no = jcc_short(buf, Cc::No);
                arith_mi(buf, Arith::Or, STATE, STG, STAGE_V);
                patch_short(buf, no);
            }
            let d = define(*dst, alloc, buf)?;
            mov_rr(buf, false, d, SCRATCH);
        }

        Op::MulHalfLong {
            dst_lo,
            dst_hi,
            acc_lo,
            acc_hi,
            lhs,
            rhs,
            lhs_top,
            rhs_top,
        } => {
            let lhs_s = src_of(*lhs, location, op, alloc, buf)?;
            let rhs_s = src_of(*rhs, location, op, alloc, buf)?;
            let alo = src_of(*acc_lo, location, op, alloc, buf)?;
            let ahi = src_of(*acc_hi, location, op, alloc, buf)?;

            load_eax(buf, lhs_s);
            extract_half(buf, *lhs_top);
            mov_mr(buf, false, FRAME, SCRATCH0_OFFSET, SCRATCH);
            load_eax(buf, rhs_s);
            extract_half(buf, *rhs_top);
            imul_rm(buf, false, SCRATCH, FRAME, SCRATCH0_OFFSET);
            movsxd(buf, SCRATCH, SCRATCH);
            mov_mr(buf, true, FRAME, SCRATCH0_OFFSET, SCRATCH);

            load_eax(buf, ahi);
            shift_ri(buf, ShiftOp::Shl, true, SCRATCH, 32);
            mov_mr(buf, true, FRAME, SCRATCH1_OFFSET, SCRATCH);
            load_eax(buf, alo);
            arith_rm(buf, Arith::Or, true, SCRATCH, FRAME, SCRATCH1_OFFSET);
            arith_rm(buf, Arith::Add, true, SCRATCH, FRAME, SCRATCH0_OFFSET);

            emit_split_u64(buf, *dst_lo, *dst_hi, false, location, op, alloc)?;
        }

        // -- flag folding --
        Op::UpdateNz { dst, cpsr } => lower_update(buf, op, location, *dst, *cpsr, 0x3FFF_FFFF, false, false, alloc)?,
        Op::UpdateNzc { dst, cpsr } => lower_update(buf, op, location, *dst, *cpsr, 0x1FFF_FFFF, true, false, alloc)?,
        Op::UpdateNzcv { dst, cpsr } => lower_update(buf, op, location, *dst, *cpsr, 0x0FFF_FFFF, true, true, alloc)?,
        Op::UpdateQ { dst, cpsr } => {
            let c = src_of(*cpsr, location, op, alloc, buf)?;
            let d = alloc.reg_for(*dst, location, op, buf)?;
            mov_reg_src(buf, d, c);
            bt_mi(buf, STATE, STG, 0);
            let skip = jcc_short(buf, Cc::Ae);
            arith_ri(buf, Arith::Or, false, d, Psr::Q);
            patch_short(buf, skip);
        }

        // -- guest memory --
        Op::MemRead { dst, addr, access } => {
            let a = src_of(*addr, location, op, alloc, buf)?;
            emit_helper_call(buf, alloc, helpers, read_helper(helpers, *access), a, None);
            let d = define(*dst, alloc, buf)?;
            mov_rr(buf, false, d, SCRATCH);
        }
        Op::MemWrite { addr, src, access } => {
            let a = src_of(*addr, location, op, alloc, buf)?;
            let v = src_of(*src, location, op, alloc, buf)?;
            emit_helper_call(buf, alloc, helpers, write_helper(helpers, *access), a, Some(v));
        }

        // -- control flow --
        Op::Flush { dst_pc, pc, cpsr } => {
            let pc_s = src_of(*pc, location, op, alloc, buf)?;
            let cpsr_s = src_of(*cpsr, location, op, alloc, buf)?;
            load_eax(buf, pc_s);
            let Src::Reg(cpsr_reg) = cpsr_s else {
                unreachable!("flush reads the cpsr through a variable");
            };
            bt_ri(buf, false, cpsr_reg, 5);
            let thumb = jcc_short(buf, Cc::B);
            arith_ri(buf, Arith::And, false, SCRATCH, !3u32);
            arith_ri(buf, Arith::Add, false, SCRATCH, 8);
            let done = jmp_short(buf);
            patch_short(buf, thumb);
            arith_ri(buf, Arith::And, false, SCRATCH, !1u32);
            arith_ri(buf, Arith::Add, false, SCRATCH, 4);
            patch_short(buf, done);
            let d = define(*dst_pc, alloc, buf)?;
            mov_rr(buf, false, d, SCRATCH);
        }

        Op::FlushExchange {
            dst_pc,
            dst_cpsr,
            addr,
            cpsr,
        } => {
            let addr_s = src_of(*addr, location, op, alloc, buf)?;
            let cpsr_s = src_of(*cpsr, location, op, alloc, buf)?;
            let d_cpsr = define(*dst_cpsr, alloc, buf)?;
            mov_reg_src(buf, d_cpsr, cpsr_s);

            load_eax(buf, addr_s);
            bt_ri(buf, false, SCRATCH, 0);
            let thumb = jcc_short(buf, Cc::B);
            arith_ri(buf, Arith::And, false, d_cpsr, !Psr::THUMB);
            arith_ri(buf, Arith::And, false, SCRATCH, !3u32);
            arith_ri(buf, Arith::Add, false, SCRATCH, 8);
            let done = jmp_short(buf);
            patch_short(buf, thumb);
            arith_ri(buf, Arith::Or, false, d_cpsr, Psr::THUMB);
            arith_ri(buf, Arith::And, false, SCRATCH, !1u32);
            arith_ri(buf, Arith::Add, false, SCRATCH, 4);
            patch_short(buf, done);
            let d_pc = define(*dst_pc, alloc, buf)?;
            mov_rr(buf, false, d_pc, SCRATCH);
        }

        Op::FlushNoSwitch {
            dst_pc,
            pc,
            opcode_size,
        } => {
            let pc_s = src_of(*pc, location, op, alloc, buf)?;
            load_eax(buf, pc_s);
            arith_ri(buf, Arith::Add, false, SCRATCH, 2 * opcode_size);
            let d = define(*dst_pc, alloc, buf)?;
            mov_rr(buf, false, d, SCRATCH);
        }

        Op::RaiseException { exception, ret } => {
            let r = src_of(*ret, location, op, alloc, buf)?;
            emit_helper_call(
                buf,
                alloc,
                helpers,
                helpers.raise_exception,
                Src::Imm(exception.vector_offset()),
                Some(r),
            );
        }

        // -- coprocessor --
        Op::CopRead {
            dst,
            cp,
            opcode1,
            cn,
            cm,
            opcode2,
        } => {
            let packed = pack_cop(*cp, *opcode1, *cn, *cm, *opcode2);
            emit_helper_call(buf, alloc, helpers, helpers.cop_read, Src::Imm(packed), None);
            let d = define(*dst, alloc, buf)?;
            mov_rr(buf, false, d, SCRATCH);
        }
        Op::CopWrite {
            src,
            cp,
            opcode1,
            cn,
            cm,
            opcode2,
        } => {
            let packed = pack_cop(*cp, *opcode1, *cn, *cm, *opcode2);
            let v = src_of(*src, location, op, alloc, buf)?;
            emit_helper_call(buf, alloc, helpers, helpers.cop_write, Src::Imm(packed), Some(v));
        }
    }

    Ok(())
}

/// eax := sign-extended half of eax (top or bottom).
fn extract_half(buf: &mut CodeBuffer, top: bool) {
    if top {
        shift_ri(buf, ShiftOp::Sar, false, SCRATCH, 16);
    } else {
        movsx_r16(buf, SCRATCH, SCRATCH);
    }
}

/// Saturate eax after a signed add/sub whose OF is still live, and
/// record the event in the stage's V/Q bit.
fn emit_saturate_on_overflow(buf: &mut CodeBuffer) {
    let no = jcc_short(buf, Cc::No);
    // Overflow: SF of the wrapped sum picks the rail (negative wrap
    // means positive saturation).
    mov_ri32(buf, SCRATCH, 0x7FFF_FFFF);
    let done = jcc_short(buf, Cc::S);
    mov_ri32(buf, SCRATCH, 0x8000_0000);
    patch_short(buf, done);
    arith_mi(buf, Arith::Or, STATE, STG, STAGE_V);
    patch_short(buf, no);
}

/// Split the 64-bit value in rax into two destination registers,
/// optionally staging NZ from the full value first.
fn emit_split_u64(
    buf: &mut CodeBuffer,
    dst_lo: VarIdx,
    dst_hi: VarIdx,
    set_flags: bool,
    location: usize,
    op: &Op,
    alloc: &mut RegisterAllocator,
) -> Result<(), Error> {
    mov_mr(buf, true, FRAME, SCRATCH0_OFFSET, SCRATCH);
    if set_flags {
        cmp_mi8(buf, true, FRAME, SCRATCH0_OFFSET, 0);
        stage_nz_keep_c(buf);
        mov_rm(buf, true, SCRATCH, FRAME, SCRATCH0_OFFSET);
    }
    let lo = alloc.reg_for(dst_lo, location, op, buf)?;
    mov_rr(buf, false, lo, SCRATCH);
    shift_ri(buf, ShiftOp::Shr, true, SCRATCH, 32);
    let hi = alloc.reg_for(dst_hi, location, op, buf)?;
    mov_rr(buf, false, hi, SCRATCH);
    Ok(())
}

/// Shared lowering for the UpdateNZ / UpdateNZC / UpdateNZCV family.
#[allow(clippy::too_many_arguments)]
fn lower_update(
    buf: &mut CodeBuffer,
    op: &Op,
    location: usize,
    dst: VarIdx,
    cpsr: Operand,
    keep_mask: u32,
    carry: bool,
    overflow: bool,
    alloc: &mut RegisterAllocator,
) -> Result<(), Error> {
    let c = match cpsr {
        Operand::Var(v) => Src::Reg(alloc.reg_for(v, location, op, buf)?),
        Operand::Const(v) => Src::Imm(v),
    };
    let d = alloc.reg_for(dst, location, op, buf)?;
    mov_reg_src(buf, d, c);
    arith_ri(buf, Arith::And, false, d, keep_mask);

    // N and Z land on bits 31/30 after shifting the stage image left.
    mov_rm(buf, false, SCRATCH, STATE, STG);
    shift_ri(buf, ShiftOp::Shl, false, SCRATCH, 16);
    arith_ri(buf, Arith::And, false, SCRATCH, Psr::N | Psr::Z);
    arith_rr(buf, Arith::Or, false, d, SCRATCH);

    if carry {
        bt_mi(buf, STATE, STG, 8);
        let skip = jcc_short(buf, Cc::Ae);
        arith_ri(buf, Arith::Or, false, d, Psr::C);
        patch_short(buf, skip);
    }
    if overflow {
        bt_mi(buf, STATE, STG, 0);
        let skip = jcc_short(buf, Cc::Ae);
        arith_ri(buf, Arith::Or, false, d, Psr::V);
        patch_short(buf, skip);
    }
    Ok(())
}

/// Barrel-shifter lowering. Immediate amounts come pre-normalised
/// from the decoder (1..=32, or RRX); register amounts get the full
/// ARM range handling, including the amount-zero carry passthrough.
#[allow(clippy::too_many_arguments)]
fn lower_shift(
    op: &Op,
    location: usize,
    kind: ShiftKind,
    dst: VarIdx,
    value: Operand,
    amount: Operand,
    set_carry: bool,
    alloc: &mut RegisterAllocator,
    buf: &mut CodeBuffer,
) -> Result<(), Error> {
    let value_s = src_of(value, location, op, alloc, buf)?;

    match amount {
        Operand::Const(n) => {
            load_eax(buf, value_s);
            match (kind, n) {
                (ShiftKind::Lsl, 1..=31) => {
                    shift_ri(buf, ShiftOp::Shl, false, SCRATCH, n as u8);
                    if set_carry {
                        stage_carry_cf(buf);
                    }
                }
                (ShiftKind::Lsl, _) => {
                    // LSL #32: result 0, carry = bit 0.
                    if set_carry {
                        bt_ri(buf, false, SCRATCH, 0);
                        stage_carry_cf(buf);
                    }
                    arith_rr(buf, Arith::Xor, false, SCRATCH, SCRATCH);
                }
                (ShiftKind::Lsr, 1..=31) => {
                    shift_ri(buf, ShiftOp::Shr, false, SCRATCH, n as u8);
                    if set_carry {
                        stage_carry_cf(buf);
                    }
                }
                (ShiftKind::Lsr, _) => {
                    if set_carry {
                        bt_ri(buf, false, SCRATCH, 31);
                        stage_carry_cf(buf);
                    }
                    arith_rr(buf, Arith::Xor, false, SCRATCH, SCRATCH);
                }
                (ShiftKind::Asr, 1..=31) => {
                    shift_ri(buf, ShiftOp::Sar, false, SCRATCH, n as u8);
                    if set_carry {
                        stage_carry_cf(buf);
                    }
                }
                (ShiftKind::Asr, _) => {
                    // ASR #32: sign fill; carry = bit 31.
                    if set_carry {
                        bt_ri(buf, false, SCRATCH, 31);
                        stage_carry_cf(buf);
                    }
                    shift_ri(buf, ShiftOp::Sar, false, SCRATCH, 31);
                }
                (ShiftKind::Ror, _) => {
                    shift_ri(buf, ShiftOp::Ror, false, SCRATCH, (n & 31) as u8);
                    if set_carry {
                        // ROR leaves CF = msb of the result.
                        stage_carry_cf(buf);
                    }
                }
                (ShiftKind::Rrx, _) => {
                    bt_mi(buf, STATE, CPSR, 29);
                    shift_ri(buf, ShiftOp::Rcr, false, SCRATCH, 1);
                    if set_carry {
                        stage_carry_cf(buf);
                    }
                }
            }
            if set_carry {
                stage_nz_from_eax(buf);
            }
            let d = alloc.reg_for(dst, location, op, buf)?;
            mov_rr(buf, false, d, SCRATCH);
        }

        Operand::Var(amount_var) => {
            let amount_reg = alloc.reg_for(amount_var, location, op, buf)?;
            if set_carry {
                stage_carry_from_guest(buf);
            }
            load_eax(buf, value_s);
            if kind == ShiftKind::Asr {
                movsxd(buf, SCRATCH, SCRATCH);
            }

            push(buf, Reg::Rcx);
            mov_rr(buf, false, Reg::Rcx, amount_reg);
            arith_ri(buf, Arith::And, false, Reg::Rcx, 0xFF);
            test_rr(buf, false, Reg::Rcx, Reg::Rcx);
            let zero = jcc_short(buf, Cc::E);

            // Non-zero amount: compute the result and leave CF as the
            // carry-out, then rejoin.
            match kind {
                ShiftKind::Lsl => {
                    // Clamp to 33: the 64-bit shift then yields both a
                    // zero result and a zero bit 32 for any amount > 32.
                    arith_ri(buf, Arith::Cmp, false, Reg::Rcx, 33);
                    let ok = jcc_short(buf, Cc::Be);
                    mov_ri32(buf, Reg::Rcx, 33);
                    patch_short(buf, ok);
                    shift_cl(buf, ShiftOp::Shl, true, SCRATCH);
                    bt_ri(buf, true, SCRATCH, 32);
                }
                ShiftKind::Lsr => {
                    arith_ri(buf, Arith::Cmp, false, Reg::Rcx, 33);
                    let ok = jcc_short(buf, Cc::Be);
                    mov_ri32(buf, Reg::Rcx, 33);
                    patch_short(buf, ok);
                    shift_cl(buf, ShiftOp::Shr, true, SCRATCH);
                }
                ShiftKind::Asr => {
                    arith_ri(buf, Arith::Cmp, false, Reg::Rcx, 32);
                    let ok = jcc_short(buf, Cc::Be);
                    mov_ri32(buf, Reg::Rcx, 32);
                    patch_short(buf, ok);
                    shift_cl(buf, ShiftOp::Sar, true, SCRATCH);
                }
                ShiftKind::Ror => {
                    arith_ri(buf, Arith::And, false, Reg::Rcx, 31);
                    let rot = jcc_short(buf, Cc::Ne);
                    // Whole multiples of 32: value unchanged, carry
                    // is bit 31.
                    bt_ri(buf, false, SCRATCH, 31);
                    let after = jmp_short(buf);
                    patch_short(buf, rot);
                    shift_cl(buf, ShiftOp::Ror, false, SCRATCH);
                    patch_short(buf, after);
                }
                ShiftKind::Rrx => unreachable!("rrx has no register amount"),
            }

            pop(buf, Reg::Rcx);
            if set_carry {
                stage_carry_cf(buf);
            }
            let done = jmp_short(buf);

            // Zero amount: result and carry pass through.
            patch_short(buf, zero);
            pop(buf, Reg::Rcx);
            patch_short(buf, done);

            if set_carry {
                stage_nz_from_eax(buf);
            }
            let d = alloc.reg_for(dst, location, op, buf)?;
            mov_rr(buf, false, d, SCRATCH);
        }
    }
    Ok(())
}
