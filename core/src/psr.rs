//! Program status registers and condition codes.

use crate::error::Error;

/// ARM processor modes, as encoded in CPSR bits 4:0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Mode {
    User = 0x10,
    Fiq = 0x11,
    Irq = 0x12,
    Supervisor = 0x13,
    Abort = 0x17,
    Undefined = 0x1B,
    System = 0x1F,
}

impl Mode {
    /// Decode mode bits. Returns `None` for the reserved encodings.
    pub const fn from_bits(bits: u32) -> Option<Mode> {
        match bits & 0x1F {
            0x10 => Some(Mode::User),
            0x11 => Some(Mode::Fiq),
            0x12 => Some(Mode::Irq),
            0x13 => Some(Mode::Supervisor),
            0x17 => Some(Mode::Abort),
            0x1B => Some(Mode::Undefined),
            0x1F => Some(Mode::System),
            _ => None,
        }
    }

    pub fn try_from_bits(bits: u32) -> Result<Mode, Error> {
        Mode::from_bits(bits).ok_or(Error::InvalidMode { value: bits & 0x1F })
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Mode::User => "usr",
            Mode::Fiq => "fiq",
            Mode::Irq => "irq",
            Mode::Supervisor => "svc",
            Mode::Abort => "abt",
            Mode::Undefined => "und",
            Mode::System => "sys",
        };
        f.write_str(name)
    }
}

/// A program status register (CPSR or SPSR).
///
/// Bit layout:
///
/// ```text
/// 31 30 29 28 27 26        8 7 6 5 4    0
/// ┌──┬──┬──┬──┬──┬──────────┬─┬─┬─┬──────┐
/// │N │Z │C │V │Q │ reserved │I│F│T│ mode │
/// └──┴──┴──┴──┴──┴──────────┴─┴─┴─┴──────┘
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Psr(u32);

impl Psr {
    pub const N: u32 = 1 << 31;
    pub const Z: u32 = 1 << 30;
    pub const C: u32 = 1 << 29;
    pub const V: u32 = 1 << 28;
    pub const Q: u32 = 1 << 27;
    pub const MASK_IRQ: u32 = 1 << 7;
    pub const MASK_FIQ: u32 = 1 << 6;
    pub const THUMB: u32 = 1 << 5;
    pub const MODE_MASK: u32 = 0x1F;

    /// All four arithmetic flags.
    pub const NZCV: u32 = Psr::N | Psr::Z | Psr::C | Psr::V;

    pub const fn from_raw(raw: u32) -> Psr {
        Psr(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn n(self) -> bool {
        self.0 & Psr::N != 0
    }
    pub const fn z(self) -> bool {
        self.0 & Psr::Z != 0
    }
    pub const fn c(self) -> bool {
        self.0 & Psr::C != 0
    }
    pub const fn v(self) -> bool {
        self.0 & Psr::V != 0
    }
    pub const fn q(self) -> bool {
        self.0 & Psr::Q != 0
    }
    pub const fn thumb(self) -> bool {
        self.0 & Psr::THUMB != 0
    }
    pub const fn mask_irq(self) -> bool {
        self.0 & Psr::MASK_IRQ != 0
    }
    pub const fn mask_fiq(self) -> bool {
        self.0 & Psr::MASK_FIQ != 0
    }

    pub const fn mode_bits(self) -> u32 {
        self.0 & Psr::MODE_MASK
    }

    pub const fn mode(self) -> Option<Mode> {
        Mode::from_bits(self.0)
    }

    pub const fn with_mode(self, mode: Mode) -> Psr {
        Psr((self.0 & !Psr::MODE_MASK) | mode as u32)
    }

    pub const fn with_thumb(self, thumb: bool) -> Psr {
        if thumb {
            Psr(self.0 | Psr::THUMB)
        } else {
            Psr(self.0 & !Psr::THUMB)
        }
    }

    pub const fn with_flag(self, flag: u32, set: bool) -> Psr {
        if set {
            Psr(self.0 | flag)
        } else {
            Psr(self.0 & !flag)
        }
    }

    /// Whether the given condition code passes under these flags.
    pub const fn condition_passes(self, cond: Condition) -> bool {
        match cond {
            Condition::EQ => self.z(),
            Condition::NE => !self.z(),
            Condition::CS => self.c(),
            Condition::CC => !self.c(),
            Condition::MI => self.n(),
            Condition::PL => !self.n(),
            Condition::VS => self.v(),
            Condition::VC => !self.v(),
            Condition::HI => self.c() && !self.z(),
            Condition::LS => !self.c() || self.z(),
            Condition::GE => self.n() == self.v(),
            Condition::LT => self.n() != self.v(),
            Condition::GT => !self.z() && self.n() == self.v(),
            Condition::LE => self.z() || self.n() != self.v(),
            Condition::AL => true,
            Condition::NV => false,
        }
    }
}

impl Default for Psr {
    fn default() -> Psr {
        Psr(Mode::System as u32)
    }
}

impl std::fmt::Debug for Psr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Psr({:#010x} [{}{}{}{}{}{}{}{} {}])",
            self.0,
            if self.n() { 'n' } else { '-' },
            if self.z() { 'z' } else { '-' },
            if self.c() { 'c' } else { '-' },
            if self.v() { 'v' } else { '-' },
            if self.q() { 'q' } else { '-' },
            if self.mask_irq() { 'i' } else { '-' },
            if self.mask_fiq() { 'f' } else { '-' },
            if self.thumb() { 't' } else { '-' },
            match self.mode() {
                Some(m) => m.to_string(),
                None => format!("mode={:#04x}?", self.mode_bits()),
            }
        )
    }
}

/// ARM condition codes (instruction bits 31:28).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Condition {
    EQ = 0,
    NE = 1,
    CS = 2,
    CC = 3,
    MI = 4,
    PL = 5,
    VS = 6,
    VC = 7,
    HI = 8,
    LS = 9,
    GE = 10,
    LT = 11,
    GT = 12,
    LE = 13,
    AL = 14,
    NV = 15,
}

impl Condition {
    pub const fn from_bits(bits: u32) -> Condition {
        match bits & 0xF {
            0 => Condition::EQ,
            1 => Condition::NE,
            2 => Condition::CS,
            3 => Condition::CC,
            4 => Condition::MI,
            5 => Condition::PL,
            6 => Condition::VS,
            7 => Condition::VC,
            8 => Condition::HI,
            9 => Condition::LS,
            10 => Condition::GE,
            11 => Condition::LT,
            12 => Condition::GT,
            13 => Condition::LE,
            14 => Condition::AL,
            _ => Condition::NV,
        }
    }

    /// The inverse condition (taken exactly when `self` is not).
    pub const fn invert(self) -> Condition {
        match self {
            Condition::EQ => Condition::NE,
            Condition::NE => Condition::EQ,
            Condition::CS => Condition::CC,
            Condition::CC => Condition::CS,
            Condition::MI => Condition::PL,
            Condition::PL => Condition::MI,
            Condition::VS => Condition::VC,
            Condition::VC => Condition::VS,
            Condition::HI => Condition::LS,
            Condition::LS => Condition::HI,
            Condition::GE => Condition::LT,
            Condition::LT => Condition::GE,
            Condition::GT => Condition::LE,
            Condition::LE => Condition::GT,
            Condition::AL => Condition::NV,
            Condition::NV => Condition::AL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn mode_bits_round_trip() {
        for mode in [
            Mode::User,
            Mode::Fiq,
            Mode::Irq,
            Mode::Supervisor,
            Mode::Abort,
            Mode::Undefined,
            Mode::System,
        ] {
            assert_eq!(Mode::from_bits(mode as u32), Some(mode));
        }
        assert_eq!(Mode::from_bits(0x00), None);
        assert_eq!(Mode::from_bits(0x16), None);
    }

    #[test]
    fn flag_accessors() {
        let psr = Psr::from_raw(Psr::N | Psr::C | Mode::Irq as u32);
        assert!(psr.n());
        assert!(!psr.z());
        assert!(psr.c());
        assert!(!psr.v());
        assert_eq!(psr.mode(), Some(Mode::Irq));
    }

    #[test]
    fn condition_flag_combinations() {
        let nz = Psr::from_raw(Psr::Z | Mode::User as u32);
        assert!(nz.condition_passes(Condition::EQ));
        assert!(!nz.condition_passes(Condition::NE));
        assert!(nz.condition_passes(Condition::LS));
        assert!(!nz.condition_passes(Condition::HI));

        // N != V → LT
        let lt = Psr::from_raw(Psr::N | Mode::User as u32);
        assert!(lt.condition_passes(Condition::LT));
        assert!(!lt.condition_passes(Condition::GE));

        // N == V == 1 → GE, and GT when Z clear
        let ge = Psr::from_raw(Psr::N | Psr::V | Mode::User as u32);
        assert!(ge.condition_passes(Condition::GE));
        assert!(ge.condition_passes(Condition::GT));
    }

    #[test]
    fn invert_is_involution() {
        for bits in 0..16 {
            let cond = Condition::from_bits(bits);
            assert_eq!(cond.invert().invert(), cond);
        }
    }

    proptest! {
        #[test]
        fn psr_raw_round_trip(raw in any::<u32>()) {
            prop_assert_eq!(Psr::from_raw(raw).raw(), raw);
        }

        #[test]
        fn inverted_condition_never_agrees(raw in any::<u32>(), bits in 0u32..16) {
            let psr = Psr::from_raw(raw);
            let cond = Condition::from_bits(bits);
            prop_assert_ne!(
                psr.condition_passes(cond),
                psr.condition_passes(cond.invert())
            );
        }
    }
}
