//! Execution engine: block cache, runtime helpers, the dispatcher
//! loop, and the public `Cpu` surface.

mod cache;
mod cpu;
mod dispatch;
mod runtime;

pub use cpu::{Cpu, Descriptor};

pub use rearm_core::bus::{Bus, Coprocessor, Memory};
pub use rearm_core::config::Model;
pub use rearm_core::error::Error;
pub use rearm_core::psr::{Mode, Psr};
pub use rearm_core::state::GPR;
