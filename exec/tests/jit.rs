//! End-to-end tests: guest machine code in, architectural effects
//! out. These execute generated host code, so they only run on
//! x86-64 hosts.

#![cfg(target_arch = "x86_64")]

use std::cell::RefCell;
use std::rc::Rc;

use pretty_assertions::assert_eq;
use rearm_exec::{Bus, Cpu, Descriptor, Memory, Mode, Model, Psr, GPR};

/// Flat RAM bus shared with the test so memory can be inspected and
/// patched while the CPU owns its own handle.
#[derive(Clone)]
struct TestBus {
    ram: Rc<RefCell<Vec<u8>>>,
}

impl TestBus {
    fn new(size: usize) -> TestBus {
        TestBus {
            ram: Rc::new(RefCell::new(vec![0; size])),
        }
    }

    fn load_words(&self, base: u32, words: &[u32]) {
        let mut ram = self.ram.borrow_mut();
        for (i, w) in words.iter().enumerate() {
            let at = base as usize + i * 4;
            ram[at..at + 4].copy_from_slice(&w.to_le_bytes());
        }
    }

    fn load_halves(&self, base: u32, halves: &[u16]) {
        let mut ram = self.ram.borrow_mut();
        for (i, h) in halves.iter().enumerate() {
            let at = base as usize + i * 2;
            ram[at..at + 2].copy_from_slice(&h.to_le_bytes());
        }
    }

    fn word(&self, address: u32) -> u32 {
        let ram = self.ram.borrow();
        let a = address as usize;
        u32::from_le_bytes([ram[a], ram[a + 1], ram[a + 2], ram[a + 3]])
    }
}

impl Memory for TestBus {
    fn read_byte(&mut self, address: u32, _bus: Bus) -> u8 {
        self.ram.borrow()[address as usize]
    }
    fn read_half(&mut self, address: u32, _bus: Bus) -> u16 {
        let ram = self.ram.borrow();
        let a = (address & !1) as usize;
        u16::from_le_bytes([ram[a], ram[a + 1]])
    }
    fn read_word(&mut self, address: u32, _bus: Bus) -> u32 {
        let ram = self.ram.borrow();
        let a = (address & !3) as usize;
        u32::from_le_bytes([ram[a], ram[a + 1], ram[a + 2], ram[a + 3]])
    }
    fn write_byte(&mut self, address: u32, value: u8, _bus: Bus) {
        self.ram.borrow_mut()[address as usize] = value;
    }
    fn write_half(&mut self, address: u32, value: u16, _bus: Bus) {
        let a = (address & !1) as usize;
        self.ram.borrow_mut()[a..a + 2].copy_from_slice(&value.to_le_bytes());
    }
    fn write_word(&mut self, address: u32, value: u32, _bus: Bus) {
        let a = (address & !3) as usize;
        self.ram.borrow_mut()[a..a + 4].copy_from_slice(&value.to_le_bytes());
    }
}

fn make_cpu(bus: &TestBus, model: Model) -> Cpu {
    let mut descriptor = Descriptor::new(Box::new(bus.clone()));
    descriptor.model = model;
    Cpu::new(descriptor).unwrap()
}

/// Enter System mode with interrupts masked and start at `pc`.
fn start_at(cpu: &mut Cpu, pc: u32) {
    let cpsr = Psr::from_raw(Mode::System as u32 | Psr::MASK_IRQ | Psr::MASK_FIQ);
    cpu.set_cpsr(cpsr).unwrap();
    cpu.set_gpr(GPR::PC, pc);
}

const B_SELF: u32 = 0xEAFF_FFFE;

#[test]
fn immediate_add() {
    let bus = TestBus::new(0x1000);
    // MOV r0, #5 ; ADD r0, r0, #3 ; B .
    bus.load_words(0, &[0xE3A0_0005, 0xE280_0003, B_SELF]);
    let mut cpu = make_cpu(&bus, Model::Arm9);
    start_at(&mut cpu, 0);
    cpu.run(8);
    assert_eq!(cpu.gpr(GPR::R0), 8);
}

#[test]
fn flag_update_on_overflowing_add() {
    let bus = TestBus::new(0x1000);
    // MVN r0, #0 ; ADDS r0, r0, #1 ; B .
    bus.load_words(0, &[0xE3E0_0000, 0xE290_0001, B_SELF]);
    let mut cpu = make_cpu(&bus, Model::Arm9);
    start_at(&mut cpu, 0);
    cpu.run(8);
    assert_eq!(cpu.gpr(GPR::R0), 0);
    assert!(cpu.cpsr().z(), "zero flag expected");
    assert!(cpu.cpsr().c(), "carry flag expected");
    assert!(!cpu.cpsr().n());
    assert!(!cpu.cpsr().v());
}

#[test]
fn mode_banked_r8() {
    let bus = TestBus::new(0x100);
    let mut cpu = make_cpu(&bus, Model::Arm9);

    cpu.set_cpsr(cpu.cpsr().with_mode(Mode::Fiq)).unwrap();
    cpu.set_gpr(GPR::R8, 0xAA);
    cpu.set_cpsr(cpu.cpsr().with_mode(Mode::User)).unwrap();
    cpu.set_gpr(GPR::R8, 0xBB);

    assert_eq!(cpu.gpr_for_mode(GPR::R8, Mode::Fiq), 0xAA);
    assert_eq!(cpu.gpr(GPR::R8), 0xBB);
}

#[test]
fn thumb_conditional_branch_not_taken() {
    let bus = TestBus::new(0x1000);
    // MOV r0, #5 ; BEQ +0 (Z clear: not taken) ; B .
    bus.load_halves(0, &[0x2005, 0xD000, 0xE7FE]);
    let mut cpu = make_cpu(&bus, Model::Arm9);
    let cpsr = Psr::from_raw(Mode::System as u32 | Psr::MASK_IRQ | Psr::MASK_FIQ).with_thumb(true);
    cpu.set_cpsr(cpsr).unwrap();
    cpu.set_gpr(GPR::PC, 0);
    cpu.run(8);
    assert_eq!(cpu.gpr(GPR::R0), 5);
    // MOV r0, #5 set N/Z from 5: both clear, so the branch stayed
    // untaken and execution parked on the final B.
    assert_eq!(cpu.gpr(GPR::PC), 4 + 4);
}

#[test]
fn icache_range_invalidation_forces_retranslation() {
    let bus = TestBus::new(0x2000);
    // At 0x1000: MOV r0, #1 ; B .
    bus.load_words(0x1000, &[0xE3A0_0001, B_SELF]);
    let mut cpu = make_cpu(&bus, Model::Arm9);
    start_at(&mut cpu, 0x1000);
    cpu.run(8);
    assert_eq!(cpu.gpr(GPR::R0), 1);

    // Overwrite the MOV through the bus; without invalidation the
    // stale block would still set 1.
    bus.load_words(0x1000, &[0xE3A0_0002]);
    cpu.clear_icache_range(0x1000, 0x1004);
    start_at(&mut cpu, 0x1000);
    cpu.run(8);
    assert_eq!(cpu.gpr(GPR::R0), 2);
}

#[test]
fn irq_injection() {
    let bus = TestBus::new(0x1000);
    bus.load_words(0, &[B_SELF]);
    // IRQ vector at 0x18: park there.
    bus.load_words(0x18, &[B_SELF]);
    let mut cpu = make_cpu(&bus, Model::Arm9);

    // System mode with IRQs enabled.
    let cpsr = Psr::from_raw(Mode::System as u32 | Psr::MASK_FIQ);
    cpu.set_cpsr(cpsr).unwrap();
    cpu.set_gpr(GPR::PC, 0);
    cpu.set_irq_line(true);
    cpu.run(8);

    assert_eq!(cpu.cpsr().mode(), Some(Mode::Irq));
    assert!(cpu.cpsr().mask_irq());
    assert!(!cpu.cpsr().thumb());
    // Banked LR holds the interrupted instruction + 4.
    assert_eq!(cpu.gpr_for_mode(GPR::LR, Mode::Irq), 4);
    // Saved PSR is the pre-exception CPSR.
    assert_eq!(cpu.spsr(Mode::Irq).raw(), cpsr.raw());
    // Stored r15 is the vector plus the fetch offset.
    assert_eq!(cpu.gpr(GPR::PC), 0x18 + 8);
}

#[test]
fn conditional_execution_follows_flags() {
    let bus = TestBus::new(0x1000);
    // MOV r0, #0 ; CMP r0, #0 ; MOVEQ r1, #7 ; MOVNE r2, #9 ; B .
    bus.load_words(
        0,
        &[
            0xE3A0_0000,
            0xE350_0000,
            0x03A0_1007,
            0x13A0_2009,
            B_SELF,
        ],
    );
    let mut cpu = make_cpu(&bus, Model::Arm9);
    start_at(&mut cpu, 0);
    cpu.run(16);
    assert_eq!(cpu.gpr(GPR::R1), 7);
    assert_eq!(cpu.gpr(GPR::R2), 0);
    assert!(cpu.cpsr().z());
}

#[test]
fn subtraction_carry_polarity() {
    let bus = TestBus::new(0x1000);
    // MOV r0, #5 ; SUBS r1, r0, #3 ; B .  (no borrow → C set)
    bus.load_words(0, &[0xE3A0_0005, 0xE250_1003, B_SELF]);
    let mut cpu = make_cpu(&bus, Model::Arm9);
    start_at(&mut cpu, 0);
    cpu.run(8);
    assert_eq!(cpu.gpr(GPR::R1), 2);
    assert!(cpu.cpsr().c(), "no borrow must set C");
    assert!(!cpu.cpsr().z());

    // SUBS with borrow clears C.
    bus.load_words(0x100, &[0xE3A0_0002, 0xE250_1003, B_SELF]);
    start_at(&mut cpu, 0x100);
    cpu.run(8);
    assert_eq!(cpu.gpr(GPR::R1), 0xFFFF_FFFF);
    assert!(!cpu.cpsr().c(), "borrow must clear C");
    assert!(cpu.cpsr().n());
}

#[test]
fn load_store_round_trip() {
    let bus = TestBus::new(0x1000);
    // MOV r0, #0x200 ; MOV r1, #0x2A ; STR r1, [r0] ;
    // LDR r2, [r0] ; STRB r1, [r0, #4] ; B .
    bus.load_words(
        0,
        &[
            0xE3A0_0C02,
            0xE3A0_102A,
            0xE580_1000,
            0xE590_2000,
            0xE5C0_1004,
            B_SELF,
        ],
    );
    let mut cpu = make_cpu(&bus, Model::Arm9);
    start_at(&mut cpu, 0);
    cpu.run(16);
    assert_eq!(bus.word(0x200), 0x2A);
    assert_eq!(cpu.gpr(GPR::R2), 0x2A);
    assert_eq!(bus.word(0x204) & 0xFF, 0x2A);
}

#[test]
fn block_transfer_round_trip() {
    let bus = TestBus::new(0x1000);
    // MOV sp, #0x400 ; MOV r0, #1 ; MOV r1, #2 ;
    // STMFD sp!, {r0, r1} ; MOV r0, #0 ; MOV r1, #0 ;
    // LDMFD sp!, {r0, r1} ; B .
    bus.load_words(
        0,
        &[
            0xE3A0_DB01,
            0xE3A0_0001,
            0xE3A0_1002,
            0xE92D_0003,
            0xE3A0_0000,
            0xE3A0_1000,
            0xE8BD_0003,
            B_SELF,
        ],
    );
    let mut cpu = make_cpu(&bus, Model::Arm9);
    start_at(&mut cpu, 0);
    cpu.run(16);
    assert_eq!(cpu.gpr(GPR::R0), 1);
    assert_eq!(cpu.gpr(GPR::R1), 2);
    assert_eq!(cpu.gpr(GPR::SP), 0x400);
    assert_eq!(bus.word(0x3F8), 1);
    assert_eq!(bus.word(0x3FC), 2);
}

#[test]
fn bx_interworking_to_thumb_and_back() {
    let bus = TestBus::new(0x1000);
    // ARM at 0: MOV r0, #0x41 (0x40 | 1) ; BX r0
    bus.load_words(0, &[0xE3A0_0041, 0xE12F_FF10]);
    // Thumb at 0x40: MOV r0, #5 ; B .
    bus.load_halves(0x40, &[0x2005, 0xE7FE]);
    let mut cpu = make_cpu(&bus, Model::Arm9);
    start_at(&mut cpu, 0);
    cpu.run(8);
    assert!(cpu.cpsr().thumb());
    assert_eq!(cpu.gpr(GPR::R0), 5);
}

#[test]
fn thumb_long_branch_with_link() {
    let bus = TestBus::new(0x1000);
    // Thumb at 0: BL +4 → lands at 8 ; (skipped: B .) ; at 8: B .
    // prefix F000, suffix F802 (offset 4).
    bus.load_halves(0, &[0xF000, 0xF802, 0xE7FE, 0xE7FE, 0xE7FE]);
    let mut cpu = make_cpu(&bus, Model::Arm9);
    let cpsr = Psr::from_raw(Mode::System as u32 | Psr::MASK_IRQ | Psr::MASK_FIQ).with_thumb(true);
    cpu.set_cpsr(cpsr).unwrap();
    cpu.set_gpr(GPR::PC, 0);
    cpu.run(8);
    // LR = return address (4) with the Thumb bit.
    assert_eq!(cpu.gpr(GPR::LR), 5);
    assert_eq!(cpu.gpr(GPR::PC), 8 + 4);
}

#[test]
fn swi_enters_supervisor() {
    let bus = TestBus::new(0x1000);
    // MOV r0, #3 ; SWI #0 ; (vector 0x08): B .
    bus.load_words(0, &[0xE3A0_0003, 0xEF00_0000]);
    bus.load_words(0x08, &[B_SELF]);
    let mut cpu = make_cpu(&bus, Model::Arm9);

    let entry = Psr::from_raw(Mode::User as u32 | Psr::MASK_IRQ | Psr::MASK_FIQ);
    cpu.set_cpsr(entry).unwrap();
    cpu.set_gpr(GPR::PC, 0);
    cpu.run(8);

    assert_eq!(cpu.cpsr().mode(), Some(Mode::Supervisor));
    assert_eq!(cpu.gpr_for_mode(GPR::LR, Mode::Supervisor), 8);
    assert_eq!(cpu.spsr(Mode::Supervisor).raw(), entry.raw());
    assert_eq!(cpu.gpr(GPR::R0), 3);
}

#[test]
fn clear_icache_reproduces_first_run() {
    let bus = TestBus::new(0x1000);
    bus.load_words(0, &[0xE3A0_0005, 0xE280_0003, B_SELF]);
    let mut cpu = make_cpu(&bus, Model::Arm9);

    start_at(&mut cpu, 0);
    cpu.run(8);
    let first = (cpu.gpr(GPR::R0), cpu.gpr(GPR::PC), cpu.cpsr().raw());

    cpu.clear_icache();
    start_at(&mut cpu, 0);
    cpu.run(8);
    let second = (cpu.gpr(GPR::R0), cpu.gpr(GPR::PC), cpu.cpsr().raw());

    assert_eq!(first, second);
}

#[test]
fn halt_consumes_budget_until_irq() {
    let bus = TestBus::new(0x1000);
    bus.load_words(0, &[B_SELF]);
    let mut cpu = make_cpu(&bus, Model::Arm9);
    start_at(&mut cpu, 0);

    cpu.set_wait_for_irq(true);
    let remaining = cpu.run(100);
    assert_eq!(remaining, 0);
    assert!(cpu.wait_for_irq(), "halt persists without an interrupt");

    // The line wakes the core even while IRQs are masked.
    cpu.set_irq_line(true);
    cpu.run(4);
    assert!(!cpu.wait_for_irq());
}

#[test]
fn shifter_carry_through_register_amounts() {
    let bus = TestBus::new(0x1000);
    // MOV r0, #0x80000000 ; MOV r1, #1 ; MOVS r2, r0, LSL r1 ;
    // (carry out = bit 31) ; B .
    bus.load_words(
        0,
        &[
            0xE3A0_0102, // MOV r0, #0x80000000
            0xE3A0_1001,
            0xE1B0_2110, // MOVS r2, r0, LSL r1
            B_SELF,
        ],
    );
    let mut cpu = make_cpu(&bus, Model::Arm9);
    start_at(&mut cpu, 0);
    cpu.run(8);
    assert_eq!(cpu.gpr(GPR::R2), 0);
    assert!(cpu.cpsr().c(), "bit 31 must shift into carry");
    assert!(cpu.cpsr().z());
}

#[test]
fn multiply_long_unsigned() {
    let bus = TestBus::new(0x1000);
    // MOV r0, #0xFF000000 ; MOV r1, #0x10 ; UMULL r2, r3, r0, r1 ; B .
    bus.load_words(
        0,
        &[0xE3A0_04FF, 0xE3A0_1010, 0xE083_2190, B_SELF],
    );
    let mut cpu = make_cpu(&bus, Model::Arm9);
    start_at(&mut cpu, 0);
    cpu.run(8);
    let product = 0xFF00_0000u64 * 0x10;
    assert_eq!(cpu.gpr(GPR::R2), product as u32);
    assert_eq!(cpu.gpr(GPR::R3), (product >> 32) as u32);
}
