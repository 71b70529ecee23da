//! ARM and Thumb frontend: decode tables and per-opcode lifters that
//! turn guest basic blocks into `rearm-core` IR.

pub mod arm;
pub mod thumb;
pub mod translator;

pub use translator::{Status, Translator};
