/// Guest CPU model. Selects ARMv4T (`Arm7`) or ARMv5TE (`Arm9`)
/// decode and memory-access behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Model {
    Arm7,
    Arm9,
}

impl Model {
    /// Whether the ARMv5TE extensions (CLZ, BLX, saturating
    /// arithmetic, halfword multiplies, LDRD/STRD) are available.
    pub const fn is_armv5te(self) -> bool {
        matches!(self, Model::Arm9)
    }
}

/// Default ceiling on guest instructions per translated block.
pub const DEFAULT_BLOCK_SIZE: usize = 32;
