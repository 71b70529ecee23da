//! The dispatcher: look up or compile the block for the current key,
//! transfer control, decode the exit, chain successors, and inject
//! IRQs — until the cycle budget runs out.

use rearm_backend::{compile_block, exit_code};
use rearm_core::ir::block::BlockKey;
use rearm_core::ir::opcode::Exception;
use rearm_core::state::{State, GPR};
use rearm_core::Error;
use rearm_frontend::Translator;

use crate::cpu::Cpu;

type EntryFn = unsafe extern "C" fn(*mut State, *const u8) -> u64;

impl Cpu {
    /// Execute for up to `cycles` guest cycles (one cycle per guest
    /// instruction at basic-block granularity). Returns the unspent
    /// remainder.
    pub fn run(&mut self, cycles: i32) -> i32 {
        self.runtime.state.set_cycles(cycles);

        loop {
            if self.runtime.state.cycles() <= 0 {
                break;
            }

            // A halted CPU sleeps the rest of the budget away unless
            // the interrupt line wakes it.
            if self.runtime.state.wait_for_irq() {
                if self.runtime.state.irq_line() {
                    self.runtime.state.set_wait_for_irq(false);
                } else {
                    self.runtime.state.set_cycles(0);
                    break;
                }
            }

            if self.runtime.state.irq_line() && !self.runtime.state.cpsr().mask_irq() {
                self.inject_irq();
            }

            let key = self.current_key();
            let id = match self.cache.lookup(key) {
                Some(id) => id,
                None => self.compile(key),
            };

            let raw = self.execute(id);
            let (src, slot) = exit_code::decode(raw);

            if self.runtime.icache_flush_pending {
                self.runtime.icache_flush_pending = false;
                self.clear_icache();
                continue;
            }

            match slot {
                exit_code::SLOT_TAKEN | exit_code::SLOT_FALL_THROUGH => {
                    // Chain the exit to wherever the guest state now
                    // points; the in-block cycle gate keeps chained
                    // loops bounded, so cycles in the chain graph are
                    // harmless.
                    if self.runtime.state.cycles() > 0 {
                        let next_key = self.current_key();
                        let dst = match self.cache.lookup(next_key) {
                            Some(id) => id,
                            None => self.compile(next_key),
                        };
                        self.buf.set_writable().expect("set_writable failed");
                        self.cache
                            .link(src as usize, slot as usize, dst, &mut self.buf);
                        self.buf.set_executable().expect("set_executable failed");
                    }
                }
                _ => {}
            }
        }

        self.runtime.state.cycles().max(0)
    }

    fn current_key(&self) -> BlockKey {
        BlockKey::from_state(self.runtime.state.gpr(GPR::PC), self.runtime.state.cpsr())
    }

    /// Inject an IRQ: bank LR/SPSR, enter IRQ mode, vector the PC.
    /// The banked LR is the interrupted instruction + 4 in either
    /// instruction set.
    fn inject_irq(&mut self) {
        let thumb = self.runtime.state.cpsr().thumb();
        let r15 = self.runtime.state.gpr(GPR::PC);
        let ret = if thumb { r15 } else { r15.wrapping_sub(4) };
        self.runtime.enter_exception(Exception::Irq, ret);
    }

    /// Translate, allocate, and emit the block for `key`, retrying
    /// once through a full flush if the code buffer is exhausted.
    /// Compile errors are implementation bugs (or unimplementable
    /// guest code) and abort.
    fn compile(&mut self, key: BlockKey) -> usize {
        match self.try_compile(key) {
            Ok(id) => id,
            Err(Error::OutOfCodeMemory) => {
                self.clear_icache();
                self.try_compile(key)
                    .unwrap_or_else(|e| panic!("rearm: compile failed after flush: {e}"))
            }
            Err(e) => panic!("rearm: {e}"),
        }
    }

    fn try_compile(&mut self, key: BlockKey) -> Result<usize, Error> {
        let rt = &mut *self.runtime;
        let block = Translator::new(
            &mut *rt.memory,
            &rt.coprocessors,
            rt.model,
            rt.block_size,
            key,
        )
        .translate()?;

        let id = self.cache.reserve(key);
        self.buf.set_writable().expect("set_writable failed");
        let compiled = compile_block(
            &block,
            id as u32,
            &mut self.buf,
            &self.helpers,
            self.epilogue_offset,
        );
        self.buf.set_executable().expect("set_executable failed");
        match compiled {
            Ok(compiled) => {
                self.cache.commit(id, compiled, block.guest_range());
                Ok(id)
            }
            Err(e) => {
                self.cache.abort(id);
                Err(e)
            }
        }
    }

    fn execute(&mut self, id: usize) -> u64 {
        let entry = self.cache.get(id);
        let code = self.buf.ptr_at(entry.host_offset);
        let state = &mut self.runtime.state as *mut State;
        // SAFETY: the buffer holds a complete prologue and the block
        // at `code`; the state pointer outlives the call; compiled
        // code honors the entry contract.
        unsafe {
            let prologue: EntryFn = std::mem::transmute(self.buf.base_ptr());
            prologue(state, code)
        }
    }
}
