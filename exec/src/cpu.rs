//! The public CPU object.

use rearm_backend::{emit_epilogue, emit_prologue, CodeBuffer, Helpers};
use rearm_core::bus::{Coprocessor, Memory};
use rearm_core::config::{Model, DEFAULT_BLOCK_SIZE};
use rearm_core::psr::{Mode, Psr};
use rearm_core::state::GPR;
use rearm_core::Error;

use crate::cache::BlockCache;
use crate::runtime::JitRuntime;

/// Everything needed to construct a CPU.
pub struct Descriptor {
    pub memory: Box<dyn Memory>,
    pub coprocessors: [Option<Box<dyn Coprocessor>>; 16],
    pub exception_base: u32,
    pub model: Model,
    /// Ceiling on guest instructions per translated block.
    pub block_size: usize,
}

impl Descriptor {
    pub fn new(memory: Box<dyn Memory>) -> Descriptor {
        Descriptor {
            memory,
            coprocessors: Default::default(),
            exception_base: 0,
            model: Model::Arm9,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

/// A recompiling ARM7/ARM9 CPU.
///
/// Single-threaded by contract: one host thread drives `run`; only
/// the IRQ-line and halt flags may be flipped from elsewhere.
pub struct Cpu {
    pub(crate) runtime: Box<JitRuntime>,
    pub(crate) cache: BlockCache,
    pub(crate) buf: CodeBuffer,
    pub(crate) helpers: Helpers,
    pub(crate) epilogue_offset: usize,
    /// Buffer offset where block code starts (after the shared
    /// prologue and epilogue).
    pub(crate) code_start: usize,
}

impl Cpu {
    pub fn new(descriptor: Descriptor) -> Result<Cpu, Error> {
        let mut buf = CodeBuffer::with_default_size().map_err(|_| Error::OutOfCodeMemory)?;
        emit_prologue(&mut buf);
        let epilogue_offset = emit_epilogue(&mut buf);
        let code_start = buf.offset();
        // Write-then-execute: the mapping stays sealed from here on,
        // reopened only around compiles and chain patches.
        buf.set_executable().map_err(|_| Error::OutOfCodeMemory)?;

        let mut runtime = Box::new(JitRuntime {
            state: rearm_core::state::State::new(),
            memory: descriptor.memory,
            coprocessors: descriptor.coprocessors,
            exception_base: descriptor.exception_base,
            model: descriptor.model,
            block_size: descriptor.block_size.max(1),
            icache_flush_pending: false,
        });
        let helpers = runtime.helpers();

        let mut cpu = Cpu {
            runtime,
            cache: BlockCache::new(),
            buf,
            helpers,
            epilogue_offset,
            code_start,
        };
        cpu.reset();
        Ok(cpu)
    }

    /// Architectural reset: Supervisor mode, interrupts masked,
    /// execution resuming at the reset vector.
    pub fn reset(&mut self) {
        self.runtime.state.reset();
        self.runtime
            .state
            .set_gpr(GPR::PC, self.runtime.exception_base.wrapping_add(8));
        for cop in self.runtime.coprocessors.iter_mut().flatten() {
            cop.reset();
        }
        self.clear_icache();
    }

    // -- interrupt and halt lines --

    pub fn irq_line(&self) -> bool {
        self.runtime.state.irq_line()
    }

    pub fn set_irq_line(&mut self, asserted: bool) {
        self.runtime.state.set_irq_line(asserted);
    }

    pub fn wait_for_irq(&self) -> bool {
        self.runtime.state.wait_for_irq()
    }

    pub fn set_wait_for_irq(&mut self, halted: bool) {
        self.runtime.state.set_wait_for_irq(halted);
    }

    // -- exception base --

    pub fn exception_base(&self) -> u32 {
        self.runtime.exception_base
    }

    pub fn set_exception_base(&mut self, base: u32) {
        self.runtime.exception_base = base;
    }

    // -- instruction cache control --

    pub fn clear_icache(&mut self) {
        self.cache.clear();
        self.buf.set_offset(self.code_start);
    }

    /// Drop every compiled block whose guest footprint intersects
    /// `[address_lo, address_hi)`.
    pub fn clear_icache_range(&mut self, address_lo: u32, address_hi: u32) {
        // Unlinking rewrites jumps into the removed entries.
        self.buf.set_writable().expect("set_writable failed");
        self.cache
            .invalidate_range(address_lo, address_hi, &mut self.buf);
        self.buf.set_executable().expect("set_executable failed");
    }

    // -- register file access --

    pub fn gpr(&self, reg: GPR) -> u32 {
        self.runtime.state.gpr(reg)
    }

    pub fn gpr_for_mode(&self, reg: GPR, mode: Mode) -> u32 {
        self.runtime.state.gpr_for_mode(reg, mode)
    }

    /// Writes to the PC take the address execution should continue
    /// at; the stored value is pipeline-adjusted.
    pub fn set_gpr(&mut self, reg: GPR, value: u32) {
        let value = self.adjust_pc_write(reg, value);
        self.runtime.state.set_gpr(reg, value);
    }

    pub fn set_gpr_for_mode(&mut self, reg: GPR, mode: Mode, value: u32) {
        let value = self.adjust_pc_write(reg, value);
        self.runtime.state.set_gpr_for_mode(reg, mode, value);
    }

    fn adjust_pc_write(&self, reg: GPR, value: u32) -> u32 {
        if reg == GPR::PC {
            let size = if self.runtime.state.cpsr().thumb() { 2 } else { 4 };
            value.wrapping_add(2 * size)
        } else {
            value
        }
    }

    // -- status registers --

    pub fn cpsr(&self) -> Psr {
        self.runtime.state.cpsr()
    }

    /// Rejects reserved mode encodings without touching state.
    pub fn set_cpsr(&mut self, value: Psr) -> Result<(), Error> {
        Mode::try_from_bits(value.mode_bits())?;
        self.runtime.state.set_cpsr(value);
        Ok(())
    }

    pub fn spsr(&self, mode: Mode) -> Psr {
        self.runtime.state.spsr(mode)
    }

    pub fn set_spsr(&mut self, mode: Mode, value: Psr) {
        self.runtime.state.set_spsr(mode, value);
    }
}
