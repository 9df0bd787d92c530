//! Hardware triggers, breakpoints and watchpoints.
//!
//! Hardware breakpoints and watchpoints are both backed by the trigger
//! module: a match unit is selected via TSELECT and configured through
//! TDATA1/TDATA2. Software breakpoints patch an `ebreak` into target
//! memory and keep the original bytes for removal.

use crate::assembly;
use crate::communication_interface::{RiscvCommunicationInterface, RiscvError};
use crate::registers::{csr, get_field, mcontrol, misa_has_extension, set_field};

/// Number of hardware trigger slots the allocator probes.
pub const MAX_HWBPS: usize = 16;

/// How a breakpoint is realised on the target.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BreakpointKind {
    /// An `ebreak` patched into memory.
    Software,
    /// A hardware execute trigger.
    Hardware,
}

/// The accesses a watchpoint fires on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WatchpointKind {
    /// Loads from the watched address.
    Read,
    /// Stores to the watched address.
    Write,
    /// Both loads and stores.
    Access,
}

/// A breakpoint owned by the driver.
#[derive(Debug, Clone)]
pub struct Breakpoint {
    /// Address of the patched or matched instruction.
    pub address: u32,
    /// Instruction length in bytes: 4, or 2 for compressed code.
    pub length: u32,
    /// Software or hardware realisation.
    pub kind: BreakpointKind,
    pub(crate) orig_instr: [u8; 4],
    pub(crate) unique_id: u32,
    pub(crate) set: bool,
}

/// A watchpoint owned by the driver.
#[derive(Debug, Clone)]
pub struct Watchpoint {
    /// The watched address.
    pub address: u32,
    /// Width of the watched access in bytes.
    pub length: u32,
    /// The accesses that fire the trigger.
    pub kind: WatchpointKind,
    pub(crate) mask: u64,
    pub(crate) value: u64,
    pub(crate) unique_id: u32,
    pub(crate) set: bool,
}

/// What a breakpoint or watchpoint asks of a hardware trigger.
#[derive(Debug, Clone)]
pub(crate) struct Trigger {
    address: u64,
    read: bool,
    write: bool,
    execute: bool,
    // unique_id is unique across both breakpoints and watchpoints.
    unique_id: u32,
}

impl Trigger {
    fn from_breakpoint(breakpoint: &Breakpoint) -> Self {
        Trigger {
            address: breakpoint.address as u64,
            read: false,
            write: false,
            execute: true,
            unique_id: breakpoint.unique_id,
        }
    }

    fn from_watchpoint(watchpoint: &Watchpoint) -> Self {
        Trigger {
            address: watchpoint.address as u64,
            read: matches!(watchpoint.kind, WatchpointKind::Read | WatchpointKind::Access),
            write: matches!(watchpoint.kind, WatchpointKind::Write | WatchpointKind::Access),
            execute: false,
            unique_id: watchpoint.unique_id,
        }
    }
}

impl RiscvCommunicationInterface<'_> {
    /// Sets a breakpoint. Software breakpoints overwrite the instruction
    /// with `ebreak`/`c.ebreak`; hardware ones allocate a trigger.
    pub fn add_breakpoint(
        &mut self,
        address: u32,
        length: u32,
        kind: BreakpointKind,
    ) -> Result<(), RiscvError> {
        let unique_id = self.next_unique_id;
        self.next_unique_id += 1;

        let mut breakpoint = Breakpoint {
            address,
            length,
            kind,
            orig_instr: [0; 4],
            unique_id,
            set: false,
        };
        self.set_breakpoint(&mut breakpoint)?;
        self.breakpoints.push(breakpoint);

        Ok(())
    }

    /// Removes the breakpoint at `address`, restoring the original
    /// instruction or freeing the trigger.
    pub fn remove_breakpoint(&mut self, address: u32) -> Result<(), RiscvError> {
        let index = self
            .breakpoints
            .iter()
            .position(|breakpoint| breakpoint.address == address)
            .ok_or(RiscvError::BreakpointNotFound(address))?;

        let mut breakpoint = self.breakpoints[index].clone();
        self.unset_breakpoint(&mut breakpoint)?;
        self.breakpoints.remove(index);

        Ok(())
    }

    /// Sets a watchpoint on the given address.
    pub fn add_watchpoint(
        &mut self,
        address: u32,
        length: u32,
        kind: WatchpointKind,
    ) -> Result<(), RiscvError> {
        let unique_id = self.next_unique_id;
        self.next_unique_id += 1;

        let mut watchpoint = Watchpoint {
            address,
            length,
            kind,
            mask: !0,
            value: 0,
            unique_id,
            set: false,
        };
        self.set_watchpoint(&mut watchpoint)?;
        self.watchpoints.push(watchpoint);

        Ok(())
    }

    /// Removes the watchpoint at `address` and frees its trigger.
    pub fn remove_watchpoint(&mut self, address: u32) -> Result<(), RiscvError> {
        let index = self
            .watchpoints
            .iter()
            .position(|watchpoint| watchpoint.address == address)
            .ok_or(RiscvError::BreakpointNotFound(address))?;

        let mut watchpoint = self.watchpoints[index].clone();
        self.unset_watchpoint(&mut watchpoint)?;
        self.watchpoints.remove(index);

        Ok(())
    }

    pub(crate) fn set_breakpoint(&mut self, breakpoint: &mut Breakpoint) -> Result<(), RiscvError> {
        match breakpoint.kind {
            BreakpointKind::Software => {
                let length = breakpoint.length as usize;
                if breakpoint.length != 2 && breakpoint.length != 4 {
                    return Err(RiscvError::UnsupportedAccessSize(breakpoint.length));
                }

                let mut orig_instr = [0u8; 4];
                self.read_memory(breakpoint.address, breakpoint.length, 1, &mut orig_instr)
                    .map_err(|error| {
                        tracing::error!(
                            "Failed to read original instruction at {:#010x}",
                            breakpoint.address
                        );
                        error
                    })?;
                breakpoint.orig_instr = orig_instr;

                let result = if breakpoint.length == 4 {
                    self.write_memory(breakpoint.address, 4, 1, &assembly::EBREAK.to_le_bytes())
                } else {
                    self.write_memory(breakpoint.address, 2, 1, &assembly::EBREAK_C.to_le_bytes())
                };
                result.map_err(|error| {
                    tracing::error!(
                        "Failed to write {}-byte breakpoint instruction at {:#010x}",
                        length,
                        breakpoint.address
                    );
                    error
                })?;
            }
            BreakpointKind::Hardware => {
                let trigger = Trigger::from_breakpoint(breakpoint);
                self.add_trigger(&trigger)?;
            }
        }

        breakpoint.set = true;

        Ok(())
    }

    pub(crate) fn unset_breakpoint(
        &mut self,
        breakpoint: &mut Breakpoint,
    ) -> Result<(), RiscvError> {
        match breakpoint.kind {
            BreakpointKind::Software => {
                let orig_instr = breakpoint.orig_instr;
                self.write_memory(
                    breakpoint.address,
                    breakpoint.length,
                    1,
                    &orig_instr[..breakpoint.length as usize],
                )
                .map_err(|error| {
                    tracing::error!(
                        "Failed to restore instruction for {}-byte breakpoint at {:#010x}",
                        breakpoint.length,
                        breakpoint.address
                    );
                    error
                })?;
            }
            BreakpointKind::Hardware => {
                self.remove_trigger(breakpoint.unique_id)?;
            }
        }

        breakpoint.set = false;

        Ok(())
    }

    pub(crate) fn set_watchpoint(&mut self, watchpoint: &mut Watchpoint) -> Result<(), RiscvError> {
        let trigger = Trigger::from_watchpoint(watchpoint);
        self.add_trigger(&trigger)?;
        watchpoint.set = true;

        Ok(())
    }

    pub(crate) fn unset_watchpoint(
        &mut self,
        watchpoint: &mut Watchpoint,
    ) -> Result<(), RiscvError> {
        self.remove_trigger(watchpoint.unique_id)?;
        watchpoint.set = false;

        Ok(())
    }

    /// Finds a free, capable trigger slot and programs it.
    fn add_trigger(&mut self, trigger: &Trigger) -> Result<(), RiscvError> {
        self.maybe_read_tselect()?;

        let xlen = self.cache.xlen();

        for i in 0..MAX_HWBPS {
            if self.trigger_unique_id[i].is_some() {
                continue;
            }

            let tselect = i as u64;
            self.write_csr(csr::TSELECT, tselect)?;
            let tselect_readback = self.read_csr(csr::TSELECT)?;
            if tselect_readback != tselect {
                // We've run out of triggers.
                tracing::error!(
                    "Couldn't find an available hardware trigger. ({:#x} != {:#x})",
                    tselect,
                    tselect_readback
                );
                return Err(RiscvError::NoFreeTrigger);
            }

            let mut tdata1 = self.read_csr(csr::TDATA1)?;
            let trigger_type = get_field(tdata1, mcontrol::type_mask(xlen));

            if trigger_type != 2 {
                continue;
            }

            if tdata1 & (mcontrol::EXECUTE | mcontrol::STORE | mcontrol::LOAD) != 0 {
                // Trigger is already in use, presumably by user code.
                continue;
            }

            // address/data match trigger
            tdata1 |= mcontrol::dmode(xlen);
            tdata1 = set_field(tdata1, mcontrol::ACTION, mcontrol::ACTION_DEBUG_MODE);
            tdata1 = set_field(tdata1, mcontrol::MATCH, mcontrol::MATCH_EQUAL);
            tdata1 |= mcontrol::M;
            if misa_has_extension(self.misa, 'H') {
                tdata1 |= mcontrol::H;
            }
            if misa_has_extension(self.misa, 'S') {
                tdata1 |= mcontrol::S;
            }
            if misa_has_extension(self.misa, 'U') {
                tdata1 |= mcontrol::U;
            }

            if trigger.execute {
                tdata1 |= mcontrol::EXECUTE;
            }
            if trigger.read {
                tdata1 |= mcontrol::LOAD;
            }
            if trigger.write {
                tdata1 |= mcontrol::STORE;
            }

            self.write_csr(csr::TDATA1, tdata1)?;

            let tdata1_readback = self.read_csr(csr::TDATA1)?;
            tracing::debug!("tdata1={:#x}", tdata1_readback);

            if tdata1_readback != tdata1 {
                // The hardware dropped bits we need.
                tracing::debug!(
                    "Trigger {} doesn't support what we need; after writing {:#x} to tdata1 it contains {:#x}",
                    i,
                    tdata1,
                    tdata1_readback
                );
                self.write_csr(csr::TDATA1, 0)?;
                continue;
            }

            self.write_csr(csr::TDATA2, trigger.address)?;

            tracing::debug!("Using resource {} for bp {}", i, trigger.unique_id);
            self.trigger_unique_id[i] = Some(trigger.unique_id);

            return Ok(());
        }

        tracing::error!("Couldn't find an available hardware trigger.");
        Err(RiscvError::NoFreeTrigger)
    }

    /// Releases the trigger owned by the given unique id.
    fn remove_trigger(&mut self, unique_id: u32) -> Result<(), RiscvError> {
        self.maybe_read_tselect()?;

        let Some(i) = self
            .trigger_unique_id
            .iter()
            .position(|owner| *owner == Some(unique_id))
        else {
            tracing::error!("Couldn't find the hardware resources used by hardware trigger.");
            return Err(RiscvError::TriggerNotFound(unique_id));
        };

        tracing::debug!("Stop using resource {} for bp {}", i, unique_id);
        self.write_csr(csr::TSELECT, i as u64)?;
        self.write_csr(csr::TDATA1, 0)?;
        self.trigger_unique_id[i] = None;

        Ok(())
    }
}
