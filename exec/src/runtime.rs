//! Runtime state shared with generated code, and the `extern "C"`
//! helpers it calls for guest memory, coprocessor transfers, and
//! bank-swapping CPSR writes.
//!
//! `JitRuntime` is `#[repr(C)]` with the guest `State` as its first
//! field: the same pointer serves as the state register inside
//! compiled blocks and as the context argument of every helper.

use rearm_backend::Helpers;
use rearm_core::bus::{Bus, Coprocessor, Memory};
use rearm_core::config::Model;
use rearm_core::ir::opcode::Exception;
use rearm_core::psr::Psr;
use rearm_core::state::{State, GPR};

#[repr(C)]
pub struct JitRuntime {
    pub state: State,
    pub memory: Box<dyn Memory>,
    pub coprocessors: [Option<Box<dyn Coprocessor>>; 16],
    pub exception_base: u32,
    pub model: Model,
    pub block_size: usize,
    /// Set when a coprocessor write may have remapped code; the
    /// dispatcher flushes the block cache before continuing.
    pub icache_flush_pending: bool,
}

const _: () = assert!(std::mem::offset_of!(JitRuntime, state) == 0);

impl JitRuntime {
    /// Exception entry: bank the return address and saved PSR, switch
    /// mode, mask IRQs, and vector the PC (ARM state, so the stored
    /// r15 is the vector plus the two-word fetch offset).
    pub fn enter_exception(&mut self, exception: Exception, ret: u32) {
        let mode = exception.target_mode();
        let cpsr = self.state.cpsr();
        self.state.set_spsr(mode, cpsr);
        let new = cpsr
            .with_mode(mode)
            .with_thumb(false)
            .with_flag(Psr::MASK_IRQ, true);
        self.state.set_cpsr(new);
        self.state.set_gpr(GPR::LR, ret);
        self.state.set_gpr(
            GPR::PC,
            self.exception_base
                .wrapping_add(exception.vector_offset())
                .wrapping_add(8),
        );
        tracing::debug!(?exception, ret, "exception entry");
    }

    /// The helper table handed to the backend. `self` must already
    /// live at its final (boxed) address.
    pub fn helpers(&mut self) -> Helpers {
        Helpers {
            ctx: self as *mut JitRuntime as u64,
            read_byte: helper_read_byte as usize as u64,
            read_byte_signed: helper_read_byte_signed as usize as u64,
            read_half: helper_read_half as usize as u64,
            read_half_rotate: helper_read_half_rotate as usize as u64,
            read_half_signed: helper_read_half_signed as usize as u64,
            read_half_signed_rotate: helper_read_half_signed_rotate as usize as u64,
            read_word: helper_read_word as usize as u64,
            read_word_rotate: helper_read_word_rotate as usize as u64,
            write_byte: helper_write_byte as usize as u64,
            write_half: helper_write_half as usize as u64,
            write_word: helper_write_word as usize as u64,
            cop_read: helper_cop_read as usize as u64,
            cop_write: helper_cop_write as usize as u64,
            set_cpsr: helper_set_cpsr as usize as u64,
            raise_exception: helper_raise_exception as usize as u64,
        }
    }
}

// -- guest memory helpers --
//
// Alignment quirks live here rather than in generated code: halfword
// and word accesses are force-aligned, with the ARM7 rotate variants
// folding the misalignment back into the result.

unsafe extern "C" fn helper_read_byte(ctx: *mut JitRuntime, addr: u32) -> u32 {
    let rt = &mut *ctx;
    rt.memory.read_byte(addr, Bus::Data) as u32
}

unsafe extern "C" fn helper_read_byte_signed(ctx: *mut JitRuntime, addr: u32) -> u32 {
    let rt = &mut *ctx;
    rt.memory.read_byte(addr, Bus::Data) as i8 as i32 as u32
}

unsafe extern "C" fn helper_read_half(ctx: *mut JitRuntime, addr: u32) -> u32 {
    let rt = &mut *ctx;
    rt.memory.read_half(addr & !1, Bus::Data) as u32
}

unsafe extern "C" fn helper_read_half_rotate(ctx: *mut JitRuntime, addr: u32) -> u32 {
    let rt = &mut *ctx;
    let value = rt.memory.read_half(addr & !1, Bus::Data) as u32;
    value.rotate_right(8 * (addr & 1))
}

unsafe extern "C" fn helper_read_half_signed(ctx: *mut JitRuntime, addr: u32) -> u32 {
    let rt = &mut *ctx;
    rt.memory.read_half(addr & !1, Bus::Data) as i16 as i32 as u32
}

/// ARM7 LDRSH at an odd address degrades to a sign-extended byte.
unsafe extern "C" fn helper_read_half_signed_rotate(ctx: *mut JitRuntime, addr: u32) -> u32 {
    let rt = &mut *ctx;
    if addr & 1 != 0 {
        rt.memory.read_byte(addr, Bus::Data) as i8 as i32 as u32
    } else {
        rt.memory.read_half(addr, Bus::Data) as i16 as i32 as u32
    }
}

unsafe extern "C" fn helper_read_word(ctx: *mut JitRuntime, addr: u32) -> u32 {
    let rt = &mut *ctx;
    rt.memory.read_word(addr & !3, Bus::Data)
}

unsafe extern "C" fn helper_read_word_rotate(ctx: *mut JitRuntime, addr: u32) -> u32 {
    let rt = &mut *ctx;
    let value = rt.memory.read_word(addr & !3, Bus::Data);
    value.rotate_right(8 * (addr & 3))
}

unsafe extern "C" fn helper_write_byte(ctx: *mut JitRuntime, addr: u32, value: u32) {
    let rt = &mut *ctx;
    rt.memory.write_byte(addr, value as u8, Bus::Data);
}

unsafe extern "C" fn helper_write_half(ctx: *mut JitRuntime, addr: u32, value: u32) {
    let rt = &mut *ctx;
    rt.memory.write_half(addr & !1, value as u16, Bus::Data);
}

unsafe extern "C" fn helper_write_word(ctx: *mut JitRuntime, addr: u32, value: u32) {
    let rt = &mut *ctx;
    rt.memory.write_word(addr & !3, value, Bus::Data);
}

// -- coprocessor helpers --

fn unpack_cop(packed: u32) -> (usize, u8, u8, u8, u8) {
    (
        (packed & 0xF) as usize,
        ((packed >> 4) & 0x7) as u8,
        ((packed >> 8) & 0xF) as u8,
        ((packed >> 12) & 0xF) as u8,
        ((packed >> 16) & 0x7) as u8,
    )
}

unsafe extern "C" fn helper_cop_read(ctx: *mut JitRuntime, packed: u32) -> u32 {
    let rt = &mut *ctx;
    let (cp, opc1, cn, cm, opc2) = unpack_cop(packed);
    match rt.coprocessors[cp].as_mut() {
        Some(cop) => cop.read(opc1, cn, cm, opc2),
        None => 0,
    }
}

unsafe extern "C" fn helper_cop_write(ctx: *mut JitRuntime, packed: u32, value: u32) {
    let rt = &mut *ctx;
    let (cp, opc1, cn, cm, opc2) = unpack_cop(packed);
    if let Some(cop) = rt.coprocessors[cp].as_mut() {
        cop.write(opc1, cn, cm, opc2, value);
        if cop.should_break_basic_block(opc1, cn, cm, opc2) {
            rt.icache_flush_pending = true;
        }
    }
}

// -- status helpers --

unsafe extern "C" fn helper_set_cpsr(ctx: *mut JitRuntime, value: u32) {
    let rt = &mut *ctx;
    rt.state.set_cpsr(Psr::from_raw(value));
}

unsafe extern "C" fn helper_raise_exception(ctx: *mut JitRuntime, vector: u32, ret: u32) {
    let rt = &mut *ctx;
    let exception = match vector {
        0x04 => Exception::Undefined,
        0x08 => Exception::SoftwareInterrupt,
        0x0C => Exception::PrefetchAbort,
        _ => Exception::Irq,
    };
    rt.enter_exception(exception, ret);
}
