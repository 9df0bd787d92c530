//! Debug Module Communication
//!
//! This module implements communication with a Debug Module as described
//! in version 0.11 of the RISC-V debug specification: the hart is
//! controlled by staging short instruction sequences in Debug RAM and
//! raising the debug interrupt, and its run state is tracked through the
//! haltnot/interrupt flags that ride along on every dbus scan.

use crate::assembly;
use crate::dram_cache::{
    dram_address, DebugRamCache, Slot, DEBUG_RAM_START, SETHALTNOT,
};
use crate::dtm::jtag_dtm::{DbusStatus, Dminfo, JtagDtm, DMCONTROL_INTERRUPT, DMINFO};
use crate::probe::{DebugProbeError, JtagAccess};
use crate::registers::{
    csr, set_field, Dcsr, DcsrCause, RegisterClass, RiscvRegister, DCSR_HALT_IMM, REG_COUNT, S0,
    S1, ZERO,
};
use crate::triggers::{Breakpoint, Watchpoint, MAX_HWBPS};
use std::time::{Duration, Instant};

/// Deadline for every busy-wait the driver performs.
pub(crate) const RISCV_TIMEOUT: Duration = Duration::from_secs(2);

/// Some error occurred when working with the RISC-V core.
#[derive(thiserror::Error, Debug)]
pub enum RiscvError {
    /// An error with operating the debug probe occurred.
    #[error("Debug Probe Error")]
    DebugProbe(#[from] DebugProbeError),
    /// A poll loop ran into its deadline.
    #[error("Timeout during dbus access.")]
    Timeout,
    /// `dtminfo` read as zero.
    #[error("dtminfo is 0. Check JTAG connectivity/board power.")]
    NoRiscvTarget,
    /// This debug transport module (DTM) version is not supported.
    #[error("The version '{0}' of the debug transport module (DTM) is currently not supported.")]
    UnsupportedDebugTransportModuleVersion(u8),
    /// This version of the debug module is not supported.
    #[error("The version '{0}' of the debug module is currently not supported.")]
    UnsupportedDebugModuleVersion(u8),
    /// The target demands authentication, which is not supported.
    #[error("The target requires authentication (authtype {0}), which is not supported.")]
    AuthenticationRequired(u8),
    /// The discovered register width cannot be operated on.
    #[error("The discovered XLEN of {0} bits is not supported.")]
    UnsupportedXlen(u32),
    /// The XLEN probe left values that match no known register width.
    #[error("XLEN discovery failed; the probe program left {word0:#010x}, {word1:#010x}.")]
    XlenDiscoveryFailed {
        /// First Debug RAM word after the probe program ran.
        word0: u32,
        /// Second Debug RAM word after the probe program ran.
        word1: u32,
    },
    /// A dbus access reported the sticky FAILED status.
    #[error("A dbus access reported the FAILED status. Hardware error?")]
    DbusFailure,
    /// A dbus response carried the reserved status value.
    #[error("A dbus access returned the reserved status value {0}.")]
    InvalidDbusStatus(u8),
    /// Debug RAM does not hold what was written to it.
    #[error("Debug RAM did not read back the value written to it.")]
    DebugRamMismatch,
    /// The hart trapped while executing a debug program.
    #[error("The hart took exception {0:#x} while executing a debug program.")]
    Exception(u32),
    /// All hardware triggers are in use or unsuitable.
    #[error("No hardware trigger is available for the breakpoint or watchpoint.")]
    NoFreeTrigger,
    /// Memory accesses support element sizes 1, 2 and 4 only.
    #[error("Memory access size {0} is not supported.")]
    UnsupportedAccessSize(u32),
    /// A resume mode the driver does not implement was requested.
    #[error("Unsupported resume argument: {0}")]
    UnsupportedResumeArgument(&'static str),
    /// The GDB register number maps to no known register.
    #[error("No register with GDB number {0}.")]
    UnknownRegister(u16),
    /// No breakpoint or watchpoint is set at the address.
    #[error("No breakpoint or watchpoint is set at address {0:#010x}.")]
    BreakpointNotFound(u32),
    /// A hardware trigger owned by the given unique id does not exist.
    #[error("No hardware trigger is owned by id {0}.")]
    TriggerNotFound(u32),
    /// A batched scan result went missing.
    #[error("The result of a batched scan is not available.")]
    BatchedResultNotAvailable,
}

/// The run state of the hart, as derived from the haltnot and interrupt
/// flags.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CoreState {
    /// The state has not been polled yet.
    Unknown,
    /// The hart is executing user code.
    Running,
    /// The hart is in debug mode, parked in the Debug ROM.
    Halted,
    /// The hart is in debug mode and executing a debug program.
    DebugRunning,
    /// A reset has been asserted.
    Reset,
}

/// Why the hart last entered debug mode.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DebugReason {
    /// No halt has been observed yet.
    Unknown,
    /// An `ebreak` instruction (software breakpoint) was executed.
    Breakpoint,
    /// The trigger module fired; covers both hardware breakpoints and
    /// watchpoints.
    WatchpointAndBreakpoint,
    /// The halt was requested by the debugger.
    DebugRequest,
    /// A single step completed.
    SingleStep,
}

/// Outcome of one pass of the halt-entry routine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum RoutineResult {
    Done,
    Again,
}

/// An interface that implements controls for RISC-V cores with a v0.11
/// debug module.
#[derive(Debug)]
pub struct RiscvCommunicationInterface<'probe> {
    /// The Debug Transport Module (DTM) is used to communicate with the
    /// Debug Module on the target chip.
    pub(crate) dtm: JtagDtm<'probe>,

    /// Cache over the Debug RAM words; also holds the examined XLEN and
    /// Debug RAM size.
    pub(crate) cache: DebugRamCache,

    state: CoreState,
    debug_reason: DebugReason,
    examined: bool,

    // Shadowed registers; authoritative only while the hart is halted.
    dcsr: u64,
    dpc: u64,
    pub(crate) misa: u64,
    tselect: u64,
    tselect_dirty: bool,

    // This cache is write-through, and always valid when the target is
    // halted. x0 stays pinned to zero.
    gpr_cache: [u64; 32],

    /// Set when the last halt was caused by a data trigger; the next step
    /// must be a strict one.
    pub(crate) need_strict_step: bool,

    // For each physical trigger, the unique id of the breakpoint or
    // watchpoint that owns it.
    pub(crate) trigger_unique_id: [Option<u32>; MAX_HWBPS],

    pub(crate) breakpoints: Vec<Breakpoint>,
    pub(crate) watchpoints: Vec<Watchpoint>,
    pub(crate) next_unique_id: u32,

    reset_halt: bool,
}

impl<'probe> RiscvCommunicationInterface<'probe> {
    /// Creates a new driver on top of a JTAG probe. Nothing is known
    /// about the target until [`Self::examine`] has run.
    pub fn new(probe: &'probe mut dyn JtagAccess) -> Self {
        Self {
            dtm: JtagDtm::new(probe),
            cache: DebugRamCache::new(),
            state: CoreState::Unknown,
            debug_reason: DebugReason::Unknown,
            examined: false,
            dcsr: 0,
            dpc: 0,
            misa: 0,
            tselect: 0,
            tselect_dirty: false,
            gpr_cache: [0; 32],
            need_strict_step: false,
            trigger_unique_id: [None; MAX_HWBPS],
            breakpoints: Vec::new(),
            watchpoints: Vec::new(),
            next_unique_id: 0,
            reset_halt: false,
        }
    }

    /// The last polled run state.
    pub fn state(&self) -> CoreState {
        self.state
    }

    /// The reason for the last observed halt.
    pub fn debug_reason(&self) -> DebugReason {
        self.debug_reason
    }

    /// The examined register width in bits.
    pub fn xlen(&self) -> u32 {
        self.cache.xlen()
    }

    /// The examined number of Debug RAM words.
    pub fn dramsize(&self) -> u32 {
        self.cache.dramsize()
    }

    /// Extra idle cycles inserted per scan to avoid BUSY responses.
    /// Monotonically non-decreasing over a session.
    pub fn dbus_busy_delay(&self) -> u32 {
        self.dtm.dbus_busy_delay()
    }

    /// Extra idle cycles inserted after raising the debug interrupt.
    /// Monotonically non-decreasing over a session.
    pub fn interrupt_high_delay(&self) -> u32 {
        self.dtm.interrupt_high_delay()
    }

    /// Discovers the target: DTM layout, Debug Module version, Debug RAM
    /// size and the hart's register width.
    pub fn examine(&mut self) -> Result<(), RiscvError> {
        tracing::debug!("examine()");
        if self.examined {
            return Ok(());
        }

        self.dtm.tap_reset()?;

        let dtminfo = self.dtm.read_dtminfo()?;
        tracing::debug!(
            "dtminfo={:#010x} (addrbits={}, version={})",
            dtminfo.0,
            dtminfo.addrbits(),
            dtminfo.version()
        );
        if dtminfo.0 == 0 {
            return Err(RiscvError::NoRiscvTarget);
        }
        if dtminfo.version() != 0 {
            return Err(RiscvError::UnsupportedDebugTransportModuleVersion(
                dtminfo.version() as u8,
            ));
        }

        self.dtm.addrbits = dtminfo.addrbits() as u8;

        let dminfo = Dminfo(self.dtm.dbus_read(DMINFO)? as u32);
        tracing::debug!("dminfo: {:?}", dminfo);

        if dminfo.version() != 1 {
            return Err(RiscvError::UnsupportedDebugModuleVersion(
                dminfo.version() as u8,
            ));
        }

        if dminfo.authtype() != 0 {
            return Err(RiscvError::AuthenticationRequired(dminfo.authtype() as u8));
        }

        let dramsize = dminfo.dramsize() + 1;
        // XLEN is still provisional at this point; the probe program below
        // only uses width-independent instructions.
        self.cache.configure(32, dramsize);

        // Figure out XLEN.
        self.cache.set32(0, assembly::xori(S1, ZERO, -1));
        // 0xffffffff  0xffffffff:ffffffff  0xffffffff:ffffffff:ffffffff:ffffffff
        self.cache.set32(1, assembly::srli(S1, S1, 31));
        // 0x00000001  0x00000001:ffffffff  0x00000001:ffffffff:ffffffff:ffffffff
        self.cache
            .set32(2, assembly::sw(S1, ZERO, DEBUG_RAM_START as u16));
        self.cache.set32(3, assembly::srli(S1, S1, 31));
        // 0x00000000  0x00000000:00000003  0x00000000:00000003:ffffffff:ffffffff
        self.cache
            .set32(4, assembly::sw(S1, ZERO, DEBUG_RAM_START as u16 + 4));
        self.cache.set_jump(5);

        self.cache.write(&mut self.dtm, 0, false)?;

        // Check that we can actually read/write dram.
        self.cache.check(&mut self.dtm)?;

        self.cache.write(&mut self.dtm, 0, true)?;
        self.cache.invalidate();

        let word0 = self.cache.get32(&mut self.dtm, 0)?;
        let word1 = self.cache.get32(&mut self.dtm, 1)?;

        let xlen = match (word0, word1) {
            (1, 0) => 32,
            (0xffff_ffff, 3) => 64,
            (0xffff_ffff, 0xffff_ffff) => return Err(RiscvError::UnsupportedXlen(128)),
            _ => {
                let exception = self
                    .cache
                    .get32(&mut self.dtm, dramsize as usize - 1)?;
                tracing::error!(
                    "Failed to discover xlen; word0={:#x}, word1={:#x}, exception={:#x}",
                    word0,
                    word1,
                    exception
                );
                return Err(RiscvError::XlenDiscoveryFailed { word0, word1 });
            }
        };
        tracing::debug!("Discovered XLEN is {}", xlen);

        self.cache.configure(xlen, dramsize);
        self.examined = true;

        self.misa = self.read_csr(csr::MISA)?;

        Ok(())
    }

    /// Derives the hart state from the haltnot/interrupt flags. On the
    /// rising edge of a halt, reads back the whole register file.
    pub fn poll(&mut self) -> Result<CoreState, RiscvError> {
        let bits = self.dtm.read_bits()?;

        if bits.haltnot && bits.interrupt {
            self.state = CoreState::DebugRunning;
            tracing::debug!("debug running");
        } else if bits.haltnot && !bits.interrupt {
            if self.state != CoreState::Halted {
                self.handle_halt()?;
            }
        } else if !bits.haltnot && bits.interrupt {
            // The hart is halting. There is no state for that, so don't
            // change anything.
            tracing::debug!("halting");
        } else {
            self.state = CoreState::Running;
            tracing::debug!("running");
        }

        Ok(self.state)
    }

    /// Requests a halt by running the halt program. The state change is
    /// observed by a subsequent [`Self::poll`].
    pub fn halt(&mut self) -> Result<(), RiscvError> {
        tracing::debug!("halt()");

        self.cache
            .set32(0, assembly::csrsi(csr::DCSR, DCSR_HALT_IMM));
        self.cache.set32(1, assembly::csrr(S0, csr::MHARTID));
        self.cache
            .set32(2, assembly::sw(S0, ZERO, SETHALTNOT as u16));
        self.cache.set_jump(3);

        self.cache.write(&mut self.dtm, 4, true)?;

        Ok(())
    }

    /// Resumes the hart.
    ///
    /// Only `current == true` without breakpoint handling or debug
    /// execution is supported; the other modes are surfaced as explicit
    /// unsupported-argument errors.
    pub fn resume(
        &mut self,
        current: bool,
        _address: u32,
        handle_breakpoints: bool,
        debug_execution: bool,
    ) -> Result<(), RiscvError> {
        if self.need_strict_step {
            self.strict_step()?;
        }

        self.resume_checked(current, handle_breakpoints, debug_execution, false)
    }

    /// Single-steps the hart by one instruction.
    pub fn step(
        &mut self,
        current: bool,
        _address: u32,
        handle_breakpoints: bool,
    ) -> Result<(), RiscvError> {
        if self.need_strict_step {
            self.strict_step()
        } else {
            self.resume_checked(current, handle_breakpoints, false, true)
        }
    }

    fn resume_checked(
        &mut self,
        current: bool,
        handle_breakpoints: bool,
        debug_execution: bool,
        step: bool,
    ) -> Result<(), RiscvError> {
        if !current {
            if self.cache.xlen() > 32 {
                tracing::warn!(
                    "Asked to resume at 32-bit PC on {}-bit target.",
                    self.cache.xlen()
                );
            }
            return Err(RiscvError::UnsupportedResumeArgument("current == false"));
        }

        if handle_breakpoints {
            return Err(RiscvError::UnsupportedResumeArgument("handle_breakpoints"));
        }

        if debug_execution {
            return Err(RiscvError::UnsupportedResumeArgument("debug_execution"));
        }

        self.execute_resume(step)
    }

    fn execute_resume(&mut self, step: bool) -> Result<(), RiscvError> {
        tracing::debug!("resume(step={})", step);

        self.maybe_write_tselect()?;

        self.cache.set_load(0, S0, Slot::Zero);
        self.cache.set32(1, assembly::csrw(csr::DPC, S0));
        self.cache.set_jump(2);
        self.cache.set(Slot::Zero, self.dpc);
        self.cache.write(&mut self.dtm, 4, true)?;

        let mut dcsr = Dcsr(self.dcsr);
        dcsr.set_ebreakm(true);
        dcsr.set_ebreakh(true);
        dcsr.set_ebreaks(true);
        dcsr.set_ebreaku(true);
        dcsr.set_halt(false);
        dcsr.set_step(step);
        self.dcsr = dcsr.0;

        self.dtm.dram_write32(
            0,
            assembly::lw(S0, ZERO, DEBUG_RAM_START as u16 + 16),
            false,
        )?;
        self.dtm
            .dram_write32(1, assembly::csrw(csr::DCSR, S0), false)?;
        self.dtm.dram_write32(2, assembly::FENCE_I, false)?;
        self.dtm.dram_write_jump(3, false)?;

        // Write the DCSR value, set interrupt and clear haltnot.
        let dbus_value = DMCONTROL_INTERRUPT | self.dcsr;
        self.dtm.dbus_write(dram_address(4), dbus_value)?;

        self.cache.invalidate();

        if self.dtm.wait_for_debugint_clear(true).is_err() {
            tracing::error!("Debug interrupt didn't clear.");
            return Err(RiscvError::Timeout);
        }

        self.state = CoreState::Running;
        for value in &mut self.gpr_cache {
            *value = 0xbadbad;
        }

        Ok(())
    }

    /// Executes a step and waits for reentry into debug mode.
    pub(crate) fn full_step(&mut self) -> Result<(), RiscvError> {
        self.execute_resume(true)?;

        let start = Instant::now();
        loop {
            self.poll()?;
            if self.state != CoreState::DebugRunning {
                return Ok(());
            }
            if start.elapsed() > RISCV_TIMEOUT {
                tracing::error!("Timed out waiting for step to complete.");
                return Err(RiscvError::Timeout);
            }
        }
    }

    /// The "remove all triggers, step once, reinstall" dance needed to
    /// advance past a data-trigger hit without immediately re-hitting it.
    pub(crate) fn strict_step(&mut self) -> Result<(), RiscvError> {
        tracing::debug!("strict_step()");

        for i in 0..self.breakpoints.len() {
            let mut breakpoint = self.breakpoints[i].clone();
            self.unset_breakpoint(&mut breakpoint)?;
            self.breakpoints[i] = breakpoint;
        }
        for i in 0..self.watchpoints.len() {
            let mut watchpoint = self.watchpoints[i].clone();
            self.unset_watchpoint(&mut watchpoint)?;
            self.watchpoints[i] = watchpoint;
        }

        self.full_step()?;

        for i in 0..self.breakpoints.len() {
            let mut breakpoint = self.breakpoints[i].clone();
            self.set_breakpoint(&mut breakpoint)?;
            self.breakpoints[i] = breakpoint;
        }
        for i in 0..self.watchpoints.len() {
            let mut watchpoint = self.watchpoints[i].clone();
            self.set_watchpoint(&mut watchpoint)?;
            self.watchpoints[i] = watchpoint;
        }

        self.need_strict_step = false;

        Ok(())
    }

    /// Latches a reset. With `reset_halt` the hart halts out of reset,
    /// otherwise it starts running.
    pub fn assert_reset(&mut self, reset_halt: bool) -> Result<(), RiscvError> {
        self.reset_halt = reset_halt;

        // The only assumption we can make is that the TAP was reset.
        if self.dtm.wait_for_debugint_clear(true).is_err() {
            tracing::error!("Debug interrupt didn't clear.");
            return Err(RiscvError::Timeout);
        }

        let mut dcsr = Dcsr(self.dcsr);
        dcsr.set_ebreakm(true);
        dcsr.set_ebreakh(true);
        dcsr.set_ebreaks(true);
        dcsr.set_ebreaku(true);
        dcsr.set_halt(true);
        if reset_halt {
            dcsr.set_ndreset(true);
        } else {
            dcsr.set_fullreset(true);
        }
        self.dcsr = dcsr.0;

        self.dtm.dram_write32(
            0,
            assembly::lw(S0, ZERO, DEBUG_RAM_START as u16 + 16),
            false,
        )?;
        self.dtm
            .dram_write32(1, assembly::csrw(csr::DCSR, S0), false)?;
        // We shouldn't actually need the jump because a reset should happen.
        self.dtm.dram_write_jump(2, false)?;
        self.dtm.dram_write32(4, self.dcsr as u32, true)?;
        self.cache.invalidate();

        self.state = CoreState::Reset;

        Ok(())
    }

    /// Waits for the state requested by [`Self::assert_reset`] to be
    /// reached after the reset line is released.
    pub fn deassert_reset(&mut self) -> Result<(), RiscvError> {
        if self.reset_halt {
            self.wait_for_state(CoreState::Halted)
        } else {
            self.wait_for_state(CoreState::Running)
        }
    }

    fn wait_for_state(&mut self, state: CoreState) -> Result<(), RiscvError> {
        let start = Instant::now();
        loop {
            self.poll()?;
            if self.state == state {
                return Ok(());
            }
            if start.elapsed() > RISCV_TIMEOUT {
                tracing::error!("Timed out waiting for state {:?}.", state);
                return Err(RiscvError::Timeout);
            }
        }
    }

    /// Reads a register.
    pub fn register_get(&mut self, reg: RiscvRegister) -> Result<u64, RiscvError> {
        self.maybe_write_tselect()?;

        match reg {
            RiscvRegister::Gpr(n) => {
                let value = self.gpr_cache[n as usize];
                tracing::debug!("{}={:#x}", reg.name(), value);
                return Ok(value);
            }
            RiscvRegister::Pc => {
                tracing::debug!("pc={:#x} (cached)", self.dpc);
                return Ok(self.dpc);
            }
            RiscvRegister::Priv => {
                let prv = Dcsr(self.dcsr).prv();
                tracing::debug!("priv={} (cached)", prv);
                return Ok(prv);
            }
            RiscvRegister::Fpr(n) => {
                self.cache
                    .set32(0, assembly::fsw(n, ZERO, DEBUG_RAM_START as u16 + 16));
                self.cache.set_jump(1);
            }
            RiscvRegister::Csr(n) => {
                self.cache.set32(0, assembly::csrr(S0, n));
                self.cache.set_store(1, S0, Slot::Zero);
                self.cache.set_jump(2);
            }
        }

        self.cache.write(&mut self.dtm, 4, true)?;
        let value = self.cache.get(&mut self.dtm, Slot::Zero)?;

        let exception = self
            .cache
            .get32(&mut self.dtm, self.cache.dramsize() as usize - 1)?;
        if exception != 0 {
            tracing::error!(
                "Got exception {:#x} when reading register {}",
                exception,
                reg.name()
            );
            return Err(RiscvError::Exception(exception));
        }

        tracing::debug!("{}={:#x}", reg.name(), value);

        Ok(value)
    }

    /// Writes a register. GPR writes go both to the cache and through a
    /// debug program.
    pub fn register_set(&mut self, reg: RiscvRegister, value: u64) -> Result<(), RiscvError> {
        tracing::debug!("write {:#x} to {}", value, reg.name());

        if let RiscvRegister::Gpr(n) = reg {
            // x0 stays zero in the cache no matter what the caller says.
            if n != 0 {
                self.gpr_cache[n as usize] = value;
            }
        }

        self.register_write(reg, value)
    }

    pub(crate) fn register_write(
        &mut self,
        reg: RiscvRegister,
        value: u64,
    ) -> Result<(), RiscvError> {
        self.maybe_write_tselect()?;

        match reg {
            // Writes to the hardwired zero register are discarded.
            RiscvRegister::Gpr(0) => return Ok(()),
            // The hart's S0 lives in DSCRATCH while it is in debug mode.
            RiscvRegister::Gpr(n) if n == S0 => {
                self.cache.set_load(0, S0, Slot::Zero);
                self.cache.set32(1, assembly::csrw(csr::DSCRATCH, S0));
                self.cache.set_jump(2);
            }
            // The hart's S1 is parked in the last Debug RAM slot.
            RiscvRegister::Gpr(n) if n == S1 => {
                self.cache.set_load(0, S0, Slot::Zero);
                self.cache.set_store(1, S0, Slot::Last);
                self.cache.set_jump(2);
            }
            RiscvRegister::Gpr(n) => {
                self.cache.set_load(0, n, Slot::Zero);
                self.cache.set_jump(1);
            }
            RiscvRegister::Pc => {
                self.dpc = value;
                return Ok(());
            }
            RiscvRegister::Fpr(n) => {
                // TODO: fld for 64-bit floats
                self.cache
                    .set32(0, assembly::flw(n, ZERO, DEBUG_RAM_START as u16 + 16));
                self.cache.set_jump(1);
            }
            RiscvRegister::Csr(n) => {
                self.cache.set_load(0, S0, Slot::Zero);
                self.cache.set32(1, assembly::csrw(n, S0));
                self.cache.set_jump(2);
            }
            RiscvRegister::Priv => {
                self.dcsr = set_field(self.dcsr, 0b11, value);
                return Ok(());
            }
        }

        self.cache.set(Slot::Zero, value);
        self.cache.write(&mut self.dtm, 4, true)
    }

    /// The register list gdb expects for a register class.
    pub fn get_gdb_reg_list(&self, reg_class: RegisterClass) -> Vec<RiscvRegister> {
        let count = match reg_class {
            RegisterClass::General => 32,
            RegisterClass::All => REG_COUNT,
        };

        (0..count)
            .map(|n| RiscvRegister::from_gdb_number(n).expect("the register numbering is dense"))
            .collect()
    }

    /// Reads a CSR through a debug program.
    pub(crate) fn read_csr(&mut self, csr: u16) -> Result<u64, RiscvError> {
        self.cache.set32(0, assembly::csrr(S0, csr));
        self.cache.set_store(1, S0, Slot::Zero);
        self.cache.set_jump(2);
        self.cache.write(&mut self.dtm, 4, true)?;

        self.cache.get(&mut self.dtm, Slot::Zero)
    }

    /// Writes a CSR through a debug program.
    pub(crate) fn write_csr(&mut self, csr: u16, value: u64) -> Result<(), RiscvError> {
        self.cache.set_load(0, S0, Slot::Zero);
        self.cache.set32(1, assembly::csrw(csr, S0));
        self.cache.set_jump(2);
        self.cache.set(Slot::Zero, value);

        self.cache.write(&mut self.dtm, 4, true)
    }

    /// Writes a GPR through a debug program, without touching the cache.
    pub(crate) fn write_gpr(&mut self, gpr: u8, value: u64) -> Result<(), RiscvError> {
        self.cache.set_load(0, gpr, Slot::Zero);
        self.cache.set_jump(1);
        self.cache.set(Slot::Zero, value);

        self.cache.write(&mut self.dtm, 4, true)
    }

    /// Saves the user's TSELECT into the shadow before the trigger
    /// allocator clobbers the hardware register.
    pub(crate) fn maybe_read_tselect(&mut self) -> Result<(), RiscvError> {
        if self.tselect_dirty {
            self.tselect = self.read_csr(csr::TSELECT)?;
            self.tselect_dirty = false;
        }

        Ok(())
    }

    /// Restores the user's TSELECT from the shadow.
    pub(crate) fn maybe_write_tselect(&mut self) -> Result<(), RiscvError> {
        if !self.tselect_dirty {
            self.write_csr(csr::TSELECT, self.tselect)?;
            self.tselect_dirty = true;
        }

        Ok(())
    }

    fn handle_halt(&mut self) -> Result<(), RiscvError> {
        self.state = CoreState::Halted;

        loop {
            match self.handle_halt_routine()? {
                RoutineResult::Done => break,
                RoutineResult::Again => continue,
            }
        }

        let cause = DcsrCause::parse(Dcsr(self.dcsr).cause() as u8);
        tracing::debug!("halt cause is {:?}; dcsr={:#x}", cause, self.dcsr);
        match cause {
            DcsrCause::SoftwareBreakpoint => self.debug_reason = DebugReason::Breakpoint,
            DcsrCause::Trigger => {
                self.debug_reason = DebugReason::WatchpointAndBreakpoint;
                // If we halted because of a data trigger, gdb doesn't know
                // to do the disable-breakpoints-step-enable-breakpoints
                // dance.
                self.need_strict_step = true;
            }
            DcsrCause::DebugInterrupt => self.debug_reason = DebugReason::DebugRequest,
            DcsrCause::Step => self.debug_reason = DebugReason::SingleStep,
            other => {
                tracing::error!(
                    "Invalid halt cause {:?} in DCSR ({:#x})",
                    other,
                    self.dcsr
                );
            }
        }

        tracing::debug!("halted at {:#x}", self.dpc);

        Ok(())
    }

    /// Batch-reads every GPR plus DPC and DCSR in one queue flush.
    ///
    /// Read all GPRs as fast as we can, because gdb is going to ask for
    /// them anyway. Reading them one at a time is much slower.
    fn handle_halt_routine(&mut self) -> Result<RoutineResult, RiscvError> {
        let mut scans = self.cache.scan_buffer(256);

        // Write the jump back to address 1.
        scans.add_write_jump(&self.dtm, 1, false);
        for reg in 1..32u8 {
            if reg == S0 || reg == S1 {
                continue;
            }

            // Write the store instruction, then read the value out.
            scans.add_write_store(&self.dtm, 0, reg, Slot::Zero, true);
            scans.add_read(&self.dtm, Slot::Zero, false);
        }

        // Write the store of s0 at index 1, the jump at index 2, then
        // expose S1 (parked in the last slot by the Debug ROM) in SLOT0.
        scans.add_write_store(&self.dtm, 1, S0, Slot::Zero, false);
        scans.add_write_jump(&self.dtm, 2, false);
        scans.add_write_load(&self.dtm, 0, S0, Slot::Last, true);
        scans.add_read(&self.dtm, Slot::Zero, false);

        // Read S0 from dscratch, then DPC and DCSR.
        for csr_address in [csr::DSCRATCH, csr::DPC, csr::DCSR] {
            scans.add_write32(&self.dtm, 0, assembly::csrr(S0, csr_address), true);
            scans.add_read(&self.dtm, Slot::Zero, false);
        }

        // Final read to flush the last value out of the pipeline.
        scans.add_read32(&self.dtm, 4, false);

        scans.execute(&mut self.dtm)?;

        let xlen = self.cache.xlen();
        let mut dbus_busy = 0;
        let mut interrupt_set = 0;
        let mut result = 0usize;
        self.gpr_cache[0] = 0;

        // The first scan result is the response to something old we don't
        // care about.
        for response in scans.responses().iter().skip(1) {
            match response.status {
                DbusStatus::Success => {}
                DbusStatus::Failed => {
                    tracing::error!("Debug access failed. Hardware error?");
                    return Err(RiscvError::DbusFailure);
                }
                DbusStatus::Busy => dbus_busy += 1,
            }

            tracing::debug!(
                "read scan result={:?} data={:#011x} address={:#04x}",
                response.status,
                response.data,
                response.address
            );

            if response.data & DMCONTROL_INTERRUPT != 0 {
                interrupt_set += 1;
                break;
            }

            if response.address == 4 || response.address == 5 {
                let data = response.data & 0xffff_ffff;
                let address = response.address;
                let destination = self.halt_routine_destination(result);

                if xlen == 32 {
                    *destination = data;
                    result += 1;
                } else if address == 4 {
                    *destination = data;
                } else {
                    *destination |= data << 32;
                    result += 1;
                }
            }

            if dbus_busy > 0 {
                break;
            }
        }

        self.cache.invalidate();

        if dbus_busy > 0 {
            self.dtm.increase_dbus_busy_delay();
            return Ok(RoutineResult::Again);
        }
        if interrupt_set > 0 {
            self.dtm.increase_interrupt_high_delay();
            return Ok(RoutineResult::Again);
        }

        Ok(RoutineResult::Done)
    }

    /// Where the n-th value read by the halt routine belongs. The order
    /// follows the scan sequence: x1..x7 and x10..x31 first, then S1, S0
    /// (from DSCRATCH), DPC and DCSR.
    fn halt_routine_destination(&mut self, result: usize) -> &mut u64 {
        match result {
            0..=6 => &mut self.gpr_cache[result + 1],
            7..=28 => &mut self.gpr_cache[result + 3],
            29 => &mut self.gpr_cache[S1 as usize],
            30 => &mut self.gpr_cache[S0 as usize],
            31 => &mut self.dpc,
            32 => &mut self.dcsr,
            _ => unreachable!("the halt routine read more values than it scheduled"),
        }
    }
}
