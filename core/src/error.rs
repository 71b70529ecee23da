use thiserror::Error;

/// Errors surfaced by the recompiler.
///
/// API-surface errors (`InvalidMode`) are reported per call and mutate
/// no state. Compile-time errors (`UnknownOpcode`, `OutOfRegisters`)
/// are fatal to the current compile. `OutOfCodeMemory` is the one
/// error a caller can respond to, by flushing the block cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// The decode table hit a reserved encoding.
    #[error("unknown opcode {opcode:#010x} at {address:#010x} (thumb={thumb})")]
    UnknownOpcode {
        opcode: u32,
        address: u32,
        thumb: bool,
    },

    /// The register allocator exhausted both host registers and spill
    /// slots. Carries the flattened IR index of the offending opcode.
    #[error("out of host registers and spill space at opcode {location}")]
    OutOfRegisters { location: usize },

    /// The executable allocator refused a request.
    #[error("out of executable code memory")]
    OutOfCodeMemory,

    /// A mode value outside the defined set was passed to an accessor.
    #[error("invalid processor mode {value:#04x}")]
    InvalidMode { value: u32 },
}
