//! A target driver for RISC-V harts implementing version 0.11 of the
//! RISC-V Debug Specification.
//!
//! The driver bridges a host debugger to a hart through a JTAG Debug
//! Transport Module and an on-chip Debug Module exposing a small Debug
//! RAM and a resume ROM. Registers and memory are reached by staging
//! short instruction sequences ("debug programs") in Debug RAM and
//! raising the debug interrupt; the hart's run state is tracked through
//! the haltnot/interrupt flags that ride along on every dbus scan.
//!
//! # As short as it gets
//! ```no_run
//! use riscv011::{RiscvCommunicationInterface, RiscvRegister};
//!
//! # fn attach(probe: &mut dyn riscv011::probe::JtagAccess) -> Result<(), riscv011::RiscvError> {
//! let mut core = RiscvCommunicationInterface::new(probe);
//! core.examine()?;
//!
//! core.halt()?;
//! core.poll()?;
//!
//! let x5 = core.register_get(RiscvRegister::Gpr(5))?;
//! println!("x5 = {x5:#x}");
//! # Ok(())
//! # }
//! ```
//!
//! The probe side is abstracted behind [`probe::JtagAccess`]: anything
//! that can shift IR/DR scans with run-test/idle padding and execute
//! them in batches can drive this crate, including a simulator.

pub mod assembly;
pub mod communication_interface;
pub mod dram_cache;
pub mod dtm;
mod memory_interface;
pub mod probe;
pub mod registers;
pub mod triggers;

pub use communication_interface::{
    CoreState, DebugReason, RiscvCommunicationInterface, RiscvError,
};
pub use registers::{RegisterClass, RiscvRegister};
pub use triggers::{Breakpoint, BreakpointKind, Watchpoint, WatchpointKind};
