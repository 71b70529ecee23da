//! Host backend: executable code buffer, linear-scan register
//! allocator, and the x86-64 emitter that lowers `rearm-core` IR.

pub mod code_buffer;
pub mod regalloc;
pub mod x86_64;

pub use code_buffer::CodeBuffer;
pub use x86_64::codegen::{
    compile_block, emit_epilogue, emit_prologue, patch_jump, CompiledBlock, Helpers, JumpSlot,
};

/// Exit value protocol between compiled blocks and the dispatcher.
///
/// The low two bits carry the exit slot; the upper half carries the
/// exiting entry id plus one (so zero never looks like a tagged
/// value). After direct chaining, the block that exits may not be the
/// block that was called — the id identifies the actual source.
pub mod exit_code {
    /// Conditional/unconditional successor taken — chainable.
    pub const SLOT_TAKEN: u64 = 0;
    /// Fall-through successor — chainable.
    pub const SLOT_FALL_THROUGH: u64 = 1;
    /// Computed target; look up by key, never chain.
    pub const SLOT_NO_CHAIN: u64 = 2;
    /// Cycle budget exhausted.
    pub const SLOT_BUDGET: u64 = 3;

    #[inline]
    pub fn encode(entry_id: u32, slot: u64) -> u64 {
        ((entry_id as u64 + 1) << 32) | slot
    }

    #[inline]
    pub fn decode(raw: u64) -> (u32, u64) {
        ((raw >> 32) as u32 - 1, raw & 3)
    }
}
