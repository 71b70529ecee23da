//! x86-64 register tables, static role assignments, and stack frame
//! layout. Both common calling conventions are supported; the tables
//! below are the only ABI-dependent pieces.

/// x86-64 general-purpose register indices, matching the ModR/M and
/// REX register numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// Low 3 bits of the encoding (ModR/M field).
    #[inline]
    pub const fn low3(self) -> u8 {
        (self as u8) & 0x7
    }

    /// Whether the register needs a REX extension bit (r8-r15).
    #[inline]
    pub const fn needs_rex(self) -> bool {
        (self as u8) >= 8
    }
}

// -- static role assignments (ABI-independent) --

/// Scratch register: `lahf`/`seto` staging and lowering workspace.
/// Never allocated to a variable.
pub const SCRATCH: Reg = Reg::Rax;

/// Pointer to the guest `State` structure.
pub const STATE: Reg = Reg::Rcx;

/// Pointer to the per-invocation spill frame.
pub const FRAME: Reg = Reg::Rbp;

/// Registers handed out by the allocator, in pop order.
pub const ALLOCATABLE: &[Reg] = &[
    Reg::Rdx,
    Reg::Rbx,
    Reg::Rsi,
    Reg::Rdi,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
    Reg::R12,
    Reg::R13,
    Reg::R14,
    Reg::R15,
];

// -- calling convention --

/// Integer argument registers, in order.
#[cfg(not(windows))]
pub const ARG_REGS: &[Reg] = &[Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx];
#[cfg(windows)]
pub const ARG_REGS: &[Reg] = &[Reg::Rcx, Reg::Rdx, Reg::R8, Reg::R9];

/// Callee-saved registers the prologue preserves.
#[cfg(not(windows))]
pub const CALLEE_SAVED: &[Reg] = &[
    Reg::Rbp,
    Reg::Rbx,
    Reg::R12,
    Reg::R13,
    Reg::R14,
    Reg::R15,
];
#[cfg(windows)]
pub const CALLEE_SAVED: &[Reg] = &[
    Reg::Rbp,
    Reg::Rbx,
    Reg::Rsi,
    Reg::Rdi,
    Reg::R12,
    Reg::R13,
    Reg::R14,
    Reg::R15,
];

/// Allocatable registers that calls clobber (saved around helper
/// calls when live).
#[cfg(not(windows))]
pub const CALLER_SAVED_ALLOCATABLE: &[Reg] = &[
    Reg::Rdx,
    Reg::Rsi,
    Reg::Rdi,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
];
#[cfg(windows)]
pub const CALLER_SAVED_ALLOCATABLE: &[Reg] =
    &[Reg::Rdx, Reg::R8, Reg::R9, Reg::R10, Reg::R11];

/// Shadow space the caller owes the callee at every call.
#[cfg(not(windows))]
pub const CALL_SHADOW_SPACE: usize = 0;
#[cfg(windows)]
pub const CALL_SHADOW_SPACE: usize = 32;

// -- spill frame layout (rbp-relative) --

/// Number of 32-bit spill slots per compiled block.
pub const SPILL_SLOTS: usize = 32;

pub const SPILL_BYTES: usize = SPILL_SLOTS * 4;

/// Two 8-byte scratch cells used by multiply-long and friends.
pub const SCRATCH0_OFFSET: i32 = SPILL_BYTES as i32;
pub const SCRATCH1_OFFSET: i32 = SPILL_BYTES as i32 + 8;

const FRAME_RAW: usize = SPILL_BYTES + 16;

/// Frame size, padded so rsp is 16-byte aligned inside block bodies
/// (the prologue's pushes leave rsp 8 off).
pub const FRAME_SIZE: usize = {
    let rem = (FRAME_RAW + 8) % 16;
    if rem == 0 {
        FRAME_RAW
    } else {
        FRAME_RAW + 16 - rem
    }
};

#[inline]
pub const fn spill_slot_offset(slot: usize) -> i32 {
    (slot * 4) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reg_encoding() {
        assert_eq!(Reg::Rax.low3(), 0);
        assert_eq!(Reg::Rsp.low3(), 4);
        assert_eq!(Reg::R8.low3(), 0);
        assert_eq!(Reg::R15.low3(), 7);
        assert!(!Reg::Rdi.needs_rex());
        assert!(Reg::R8.needs_rex());
    }

    #[test]
    fn reserved_roles_not_allocatable() {
        assert!(!ALLOCATABLE.contains(&SCRATCH));
        assert!(!ALLOCATABLE.contains(&STATE));
        assert!(!ALLOCATABLE.contains(&FRAME));
        assert!(!ALLOCATABLE.contains(&Reg::Rsp));
        assert_eq!(ALLOCATABLE.len(), 12);
    }

    #[test]
    fn frame_keeps_call_alignment() {
        // Pushes (ret + callee-saved) leave rsp ≡ 8 (mod 16); the
        // frame must restore ≡ 0 for call sites.
        assert_eq!((FRAME_SIZE + 8) % 16, 0);
        assert!(FRAME_SIZE >= SPILL_BYTES + 16);
    }

    #[test]
    fn caller_saved_is_subset_of_allocatable() {
        for r in CALLER_SAVED_ALLOCATABLE {
            assert!(ALLOCATABLE.contains(r));
        }
    }
}
