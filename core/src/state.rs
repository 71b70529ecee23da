//! ARM guest CPU state: the active register file, the banked copies
//! of r8-r14, and the status registers.
//!
//! The layout is `#[repr(C)]` because generated host code addresses
//! fields at fixed byte offsets from a reserved register holding the
//! `State` pointer. Offsets are exported as constants below; the
//! backend must never hardcode them.

use std::mem::offset_of;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::psr::{Mode, Psr};

/// ARM general-purpose registers. PC is register 15 and holds the
/// pipeline-ahead fetch address (instruction address + 2 x size).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GPR {
    R0 = 0,
    R1 = 1,
    R2 = 2,
    R3 = 3,
    R4 = 4,
    R5 = 5,
    R6 = 6,
    R7 = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    SP = 13,
    LR = 14,
    PC = 15,
}

impl GPR {
    pub const fn from_index(index: u32) -> GPR {
        match index & 0xF {
            0 => GPR::R0,
            1 => GPR::R1,
            2 => GPR::R2,
            3 => GPR::R3,
            4 => GPR::R4,
            5 => GPR::R5,
            6 => GPR::R6,
            7 => GPR::R7,
            8 => GPR::R8,
            9 => GPR::R9,
            10 => GPR::R10,
            11 => GPR::R11,
            12 => GPR::R12,
            13 => GPR::SP,
            14 => GPR::LR,
            _ => GPR::PC,
        }
    }

    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Physical register bank selected by a processor mode. User and
/// System share one bank; the exception modes each get their own
/// r13/r14 (plus r8-r12 for FIQ).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Bank {
    UserSystem = 0,
    Fiq = 1,
    Irq = 2,
    Supervisor = 3,
    Abort = 4,
    Undefined = 5,
}

pub const BANK_COUNT: usize = 6;

impl Mode {
    pub const fn bank(self) -> Bank {
        match self {
            Mode::User | Mode::System => Bank::UserSystem,
            Mode::Fiq => Bank::Fiq,
            Mode::Irq => Bank::Irq,
            Mode::Supervisor => Bank::Supervisor,
            Mode::Abort => Bank::Abort,
            Mode::Undefined => Bank::Undefined,
        }
    }
}

/// An ARM guest register qualified by the processor mode it is read
/// or written in. The mode decides which physical bank slot backs
/// registers 8-14.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GuestReg {
    pub reg: GPR,
    pub mode: Mode,
}

impl GuestReg {
    pub const fn new(reg: GPR, mode: Mode) -> GuestReg {
        GuestReg { reg, mode }
    }
}

impl std::fmt::Display for GuestReg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let id = self.reg.index();
        if id <= 7 || (id <= 12 && self.mode != Mode::Fiq) || id == 15 {
            write!(f, "r{id}")
        } else {
            write!(f, "r{id}_{}", self.mode)
        }
    }
}

/// Guest CPU state.
///
/// Invariant: the active `gpr[8..=14]` always reflect the bank of
/// `cpsr`'s mode bits; mode transitions swap banks before the new
/// mode becomes visible.
#[repr(C)]
pub struct State {
    gpr: [u32; 16],
    /// Banked r8-r14 per bank. Only the FIQ and UserSystem rows use
    /// slots 0-4 (r8-r12); the other rows bank r13/r14 alone.
    bank: [[u32; 7]; BANK_COUNT],
    spsr: [u32; BANK_COUNT],
    cpsr: u32,
    /// Remaining cycle budget. Compiled block headers decrement it
    /// and bail out to the dispatcher when it runs dry.
    cycles: i32,
    /// Packed `lahf`/`seto` image staged by flag-updating lowerings.
    flag_stage: u32,
    irq_line: AtomicU32,
    wait_for_irq: AtomicU32,
}

// -- field offsets consumed by the backend --

impl State {
    pub const CPSR_OFFSET: i32 = offset_of!(State, cpsr) as i32;
    pub const CYCLES_OFFSET: i32 = offset_of!(State, cycles) as i32;
    pub const FLAG_STAGE_OFFSET: i32 = offset_of!(State, flag_stage) as i32;

    pub const fn active_gpr_offset(reg: GPR) -> i32 {
        (offset_of!(State, gpr) + reg.index() * 4) as i32
    }

    pub const fn banked_gpr_offset(bank: Bank, reg: GPR) -> i32 {
        (offset_of!(State, bank) + (bank as usize * 7 + reg.index() - 8) * 4) as i32
    }

    pub const fn spsr_offset(bank: Bank) -> i32 {
        (offset_of!(State, spsr) + bank as usize * 4) as i32
    }

    /// Resolve a `GuestReg` to its byte offset, given the mode the
    /// containing block was compiled for. Registers 0-7 and 15 are
    /// never banked; 8-12 are banked only against FIQ; 13-14 are
    /// banked per mode.
    pub fn guest_reg_offset(current: Mode, guest: GuestReg) -> i32 {
        let r = guest.reg.index();
        if r < 8 || r == 15 {
            return State::active_gpr_offset(guest.reg);
        }
        if r < 13 {
            let want_fiq = guest.mode == Mode::Fiq;
            let have_fiq = current == Mode::Fiq;
            return if want_fiq == have_fiq {
                State::active_gpr_offset(guest.reg)
            } else if want_fiq {
                State::banked_gpr_offset(Bank::Fiq, guest.reg)
            } else {
                State::banked_gpr_offset(Bank::UserSystem, guest.reg)
            };
        }
        if guest.mode.bank() == current.bank() {
            State::active_gpr_offset(guest.reg)
        } else {
            State::banked_gpr_offset(guest.mode.bank(), guest.reg)
        }
    }
}

impl State {
    pub fn new() -> State {
        let mut state = State {
            gpr: [0; 16],
            bank: [[0; 7]; BANK_COUNT],
            spsr: [0; BANK_COUNT],
            cpsr: Mode::Supervisor as u32,
            cycles: 0,
            flag_stage: 0,
            irq_line: AtomicU32::new(0),
            wait_for_irq: AtomicU32::new(0),
        };
        state.reset();
        state
    }

    /// Reset to the architectural reset state: Supervisor mode with
    /// IRQ and FIQ masked, all registers cleared.
    pub fn reset(&mut self) {
        self.gpr = [0; 16];
        self.bank = [[0; 7]; BANK_COUNT];
        self.spsr = [0; BANK_COUNT];
        self.cpsr = Mode::Supervisor as u32 | Psr::MASK_IRQ | Psr::MASK_FIQ;
        self.cycles = 0;
        self.flag_stage = 0;
        self.irq_line.store(0, Ordering::Relaxed);
        self.wait_for_irq.store(0, Ordering::Relaxed);
    }

    pub fn cpsr(&self) -> Psr {
        Psr::from_raw(self.cpsr)
    }

    /// Current mode. The stored CPSR always carries valid mode bits;
    /// writers go through `set_cpsr`, which preserves the old mode on
    /// reserved encodings.
    pub fn mode(&self) -> Mode {
        Mode::from_bits(self.cpsr).unwrap_or(Mode::System)
    }

    /// Write the CPSR, swapping register banks if the mode changed.
    /// Reserved mode encodings keep the previous mode bits (the
    /// architectural behavior is unpredictable; preserving is the
    /// conservative choice).
    pub fn set_cpsr(&mut self, value: Psr) {
        let old_mode = self.mode();
        let new_mode = value.mode().unwrap_or(old_mode);
        if new_mode != old_mode {
            self.switch_bank(old_mode, new_mode);
        }
        self.cpsr = value.with_mode(new_mode).raw();
    }

    /// Swap the active r8-r14 window from `old` to `new`.
    fn switch_bank(&mut self, old: Mode, new: Mode) {
        let ob = old.bank();
        let nb = new.bank();
        if ob == nb {
            return;
        }

        self.bank[ob as usize][5] = self.gpr[13];
        self.bank[ob as usize][6] = self.gpr[14];

        // r8-r12 are only banked between FIQ and everything else.
        let old_fiq = ob == Bank::Fiq;
        let new_fiq = nb == Bank::Fiq;
        if old_fiq != new_fiq {
            let save = if old_fiq { Bank::Fiq } else { Bank::UserSystem };
            let load = if new_fiq { Bank::Fiq } else { Bank::UserSystem };
            for i in 0..5 {
                self.bank[save as usize][i] = self.gpr[8 + i];
                self.gpr[8 + i] = self.bank[load as usize][i];
            }
        }

        self.gpr[13] = self.bank[nb as usize][5];
        self.gpr[14] = self.bank[nb as usize][6];
    }

    pub fn gpr(&self, reg: GPR) -> u32 {
        self.gpr[reg.index()]
    }

    pub fn set_gpr(&mut self, reg: GPR, value: u32) {
        self.gpr[reg.index()] = value;
    }

    pub fn gpr_for_mode(&self, reg: GPR, mode: Mode) -> u32 {
        match self.banked_slot(reg, mode) {
            Some((bank, i)) => self.bank[bank as usize][i],
            None => self.gpr[reg.index()],
        }
    }

    pub fn set_gpr_for_mode(&mut self, reg: GPR, mode: Mode, value: u32) {
        match self.banked_slot(reg, mode) {
            Some((bank, i)) => self.bank[bank as usize][i] = value,
            None => self.gpr[reg.index()] = value,
        }
    }

    /// Which bank slot backs (reg, mode), or `None` when the active
    /// register file does.
    fn banked_slot(&self, reg: GPR, mode: Mode) -> Option<(Bank, usize)> {
        let r = reg.index();
        if r < 8 || r == 15 {
            return None;
        }
        let current = self.mode();
        if r < 13 {
            let want_fiq = mode == Mode::Fiq;
            let have_fiq = current == Mode::Fiq;
            if want_fiq == have_fiq {
                return None;
            }
            let bank = if want_fiq { Bank::Fiq } else { Bank::UserSystem };
            return Some((bank, r - 8));
        }
        if mode.bank() == current.bank() {
            None
        } else {
            Some((mode.bank(), r - 8))
        }
    }

    pub fn spsr(&self, mode: Mode) -> Psr {
        Psr::from_raw(self.spsr[mode.bank() as usize])
    }

    pub fn set_spsr(&mut self, mode: Mode, value: Psr) {
        self.spsr[mode.bank() as usize] = value.raw();
    }

    pub fn cycles(&self) -> i32 {
        self.cycles
    }

    pub fn set_cycles(&mut self, cycles: i32) {
        self.cycles = cycles;
    }

    pub fn irq_line(&self) -> bool {
        self.irq_line.load(Ordering::Relaxed) != 0
    }

    pub fn set_irq_line(&self, asserted: bool) {
        self.irq_line.store(asserted as u32, Ordering::Relaxed);
    }

    pub fn wait_for_irq(&self) -> bool {
        self.wait_for_irq.load(Ordering::Relaxed) != 0
    }

    pub fn set_wait_for_irq(&self, halted: bool) {
        self.wait_for_irq.store(halted as u32, Ordering::Relaxed);
    }
}

impl Default for State {
    fn default() -> State {
        State::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn reset_enters_supervisor_masked() {
        let state = State::new();
        assert_eq!(state.mode(), Mode::Supervisor);
        assert!(state.cpsr().mask_irq());
        assert!(state.cpsr().mask_fiq());
        assert!(!state.cpsr().thumb());
    }

    #[test]
    fn fiq_banks_r8() {
        let mut state = State::new();
        state.set_cpsr(state.cpsr().with_mode(Mode::Fiq));
        state.set_gpr(GPR::R8, 0xAA);
        state.set_cpsr(state.cpsr().with_mode(Mode::User));
        state.set_gpr(GPR::R8, 0xBB);

        assert_eq!(state.gpr_for_mode(GPR::R8, Mode::Fiq), 0xAA);
        assert_eq!(state.gpr(GPR::R8), 0xBB);
        assert_eq!(state.gpr_for_mode(GPR::R8, Mode::User), 0xBB);
    }

    #[test]
    fn non_fiq_modes_share_r8_to_r12() {
        let mut state = State::new();
        state.set_cpsr(state.cpsr().with_mode(Mode::User));
        state.set_gpr(GPR::R10, 0x1234);
        state.set_cpsr(state.cpsr().with_mode(Mode::Irq));
        assert_eq!(state.gpr(GPR::R10), 0x1234);
        assert_eq!(state.gpr_for_mode(GPR::R10, Mode::User), 0x1234);
    }

    #[test]
    fn sp_banked_per_mode() {
        let mut state = State::new();
        state.set_cpsr(state.cpsr().with_mode(Mode::User));
        state.set_gpr(GPR::SP, 0x1000);
        state.set_cpsr(state.cpsr().with_mode(Mode::Irq));
        state.set_gpr(GPR::SP, 0x2000);
        state.set_cpsr(state.cpsr().with_mode(Mode::Supervisor));
        state.set_gpr(GPR::SP, 0x3000);

        assert_eq!(state.gpr_for_mode(GPR::SP, Mode::User), 0x1000);
        assert_eq!(state.gpr_for_mode(GPR::SP, Mode::Irq), 0x2000);
        assert_eq!(state.gpr(GPR::SP), 0x3000);

        state.set_cpsr(state.cpsr().with_mode(Mode::User));
        assert_eq!(state.gpr(GPR::SP), 0x1000);
    }

    #[test]
    fn bank_round_trip_through_many_switches() {
        let mut state = State::new();
        let modes = [
            Mode::User,
            Mode::Fiq,
            Mode::Irq,
            Mode::Supervisor,
            Mode::Abort,
            Mode::Undefined,
        ];
        for (i, &mode) in modes.iter().enumerate() {
            state.set_cpsr(state.cpsr().with_mode(mode));
            state.set_gpr(GPR::SP, 0x100 + i as u32);
            state.set_gpr(GPR::LR, 0x200 + i as u32);
        }
        for (i, &mode) in modes.iter().enumerate() {
            assert_eq!(state.gpr_for_mode(GPR::SP, mode), 0x100 + i as u32);
            assert_eq!(state.gpr_for_mode(GPR::LR, mode), 0x200 + i as u32);
        }
    }

    #[test]
    fn set_gpr_for_current_mode_hits_active_file() {
        let mut state = State::new();
        state.set_cpsr(state.cpsr().with_mode(Mode::Irq));
        state.set_gpr_for_mode(GPR::LR, Mode::Irq, 0xDEAD);
        assert_eq!(state.gpr(GPR::LR), 0xDEAD);
    }

    #[test]
    fn spsr_per_bank() {
        let mut state = State::new();
        state.set_spsr(Mode::Irq, Psr::from_raw(0x1F | Psr::N));
        state.set_spsr(Mode::Fiq, Psr::from_raw(0x1F | Psr::Z));
        assert_eq!(state.spsr(Mode::Irq).raw(), 0x1F | Psr::N);
        assert_eq!(state.spsr(Mode::Fiq).raw(), 0x1F | Psr::Z);
    }

    #[test]
    fn invalid_mode_write_preserves_mode() {
        let mut state = State::new();
        let before = state.mode();
        state.set_cpsr(Psr::from_raw(0x07));
        assert_eq!(state.mode(), before);
    }

    #[test]
    fn guest_reg_offsets_distinct_per_bank() {
        let active = State::guest_reg_offset(Mode::User, GuestReg::new(GPR::SP, Mode::User));
        let irq = State::guest_reg_offset(Mode::User, GuestReg::new(GPR::SP, Mode::Irq));
        let fiq_r8 = State::guest_reg_offset(Mode::User, GuestReg::new(GPR::R8, Mode::Fiq));
        assert_ne!(active, irq);
        assert_ne!(active, fiq_r8);
        // In FIQ mode the active window *is* the FIQ bank.
        assert_eq!(
            State::guest_reg_offset(Mode::Fiq, GuestReg::new(GPR::R8, Mode::Fiq)),
            State::active_gpr_offset(GPR::R8)
        );
    }
}
