//! A table-driven 8086 emulator core. Registers and flags live in a window
//! of guest memory, and a 20x256 byte matrix drives decode and flag updates.

pub mod boot;
pub mod cpu;
pub mod error;
pub mod exec;
pub mod flags;
pub mod host;
pub mod mem;
pub mod regs;
pub mod tables;
pub mod timing;

#[cfg(test)]
mod test;

pub use boot::{BootConfig, Exit, Machine, TableSource};
pub use cpu::{Cpu, StepOutcome};
pub use error::{EmuError, Result};
pub use tables::OpcodeTables;
