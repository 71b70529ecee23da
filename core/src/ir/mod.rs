//! Intermediate representation for translated basic blocks.
//!
//! A basic block is lifted into a flat list of IR opcodes over
//! single-assignment variables, partitioned into micro-blocks that
//! each share one ARM condition code. IR lives only for the duration
//! of one block compile; the containing `BasicBlock` owns the arenas
//! and drops them wholesale after emission.

pub mod block;
pub mod emitter;
pub mod opcode;
pub mod var;

pub use block::{BasicBlock, BlockKey, BranchTarget, MicroBlock};
pub use opcode::{AluKind, Exception, MemAccess, MemSize, Op, SatKind, ShiftKind};
pub use var::{DataType, Operand, Var, VarIdx};
