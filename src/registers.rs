//! RISC-V register descriptions.
//!
//! The GDB register numbering is a dense range split into semantic bands
//! (GPRs, PC, FPRs, CSRs, privilege level). [`RiscvRegister`] models it as
//! a tagged variant with explicit constructors so that dispatch in the
//! register access paths is a match instead of range arithmetic.

use bitfield::bitfield;

/// The zero register, x0.
pub const ZERO: u8 = 0;

/// x5, used as the address cursor by the block memory writer.
pub const T0: u8 = 5;

/// x8, the first scratch register of the debug programs.
pub const S0: u8 = 8;

/// x9, the second scratch register of the debug programs.
pub const S1: u8 = 9;

/// GDB register number of the program counter.
pub const REG_PC: u16 = 32;

/// GDB register number of f0.
pub const REG_FPR0: u16 = 33;

/// GDB register number of f31.
pub const REG_FPR31: u16 = 64;

/// GDB register number of csr0.
pub const REG_CSR0: u16 = 65;

/// GDB register number of csr4095.
pub const REG_CSR4095: u16 = 4160;

/// GDB register number of the virtual privilege-level register.
pub const REG_PRIV: u16 = 4161;

/// Total number of registers in the GDB numbering.
pub const REG_COUNT: u16 = 4162;

/// A target register, in the numbering gdb uses for RISC-V.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RiscvRegister {
    /// A general purpose register, x0..x31.
    Gpr(u8),
    /// The program counter (dpc while halted).
    Pc,
    /// A floating point register, f0..f31.
    Fpr(u8),
    /// A control and status register, csr0..csr4095.
    Csr(u16),
    /// The current privilege level, a virtual register backed by
    /// `dcsr.prv`.
    Priv,
}

impl RiscvRegister {
    /// Looks up a register by its GDB register number.
    pub fn from_gdb_number(number: u16) -> Option<Self> {
        match number {
            0..=31 => Some(RiscvRegister::Gpr(number as u8)),
            REG_PC => Some(RiscvRegister::Pc),
            REG_FPR0..=REG_FPR31 => Some(RiscvRegister::Fpr((number - REG_FPR0) as u8)),
            REG_CSR0..=REG_CSR4095 => Some(RiscvRegister::Csr(number - REG_CSR0)),
            REG_PRIV => Some(RiscvRegister::Priv),
            _ => None,
        }
    }

    /// The GDB register number of this register.
    pub fn gdb_number(&self) -> u16 {
        match self {
            RiscvRegister::Gpr(n) => *n as u16,
            RiscvRegister::Pc => REG_PC,
            RiscvRegister::Fpr(n) => REG_FPR0 + *n as u16,
            RiscvRegister::Csr(n) => REG_CSR0 + n,
            RiscvRegister::Priv => REG_PRIV,
        }
    }

    /// The name gdb knows this register by.
    pub fn name(&self) -> String {
        match self {
            RiscvRegister::Gpr(n) => format!("x{n}"),
            RiscvRegister::Pc => "pc".to_string(),
            RiscvRegister::Fpr(n) => format!("f{n}"),
            RiscvRegister::Csr(n) => format!("csr{n}"),
            RiscvRegister::Priv => "priv".to_string(),
        }
    }
}

/// Register classes a debugger can ask for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RegisterClass {
    /// The general purpose registers, x0..x31.
    General,
    /// Every register in the numbering.
    All,
}

/// Addresses of the CSRs the driver touches.
pub mod csr {
    /// Machine ISA register.
    pub const MISA: u16 = 0x301;
    /// Trigger select.
    pub const TSELECT: u16 = 0x7a0;
    /// Trigger data 1 (mcontrol for match triggers).
    pub const TDATA1: u16 = 0x7a1;
    /// Trigger data 2 (the match value).
    pub const TDATA2: u16 = 0x7a2;
    /// Debug control and status.
    pub const DCSR: u16 = 0x7b0;
    /// Debug program counter.
    pub const DPC: u16 = 0x7b1;
    /// Debug scratch; holds the hart's S0 while in debug mode.
    pub const DSCRATCH: u16 = 0x7b2;
    /// Machine hart id.
    pub const MHARTID: u16 = 0xf14;
}

bitfield! {
    /// The `dcsr` register as laid out by v0.11 of the debug spec.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Dcsr(u64);
    impl Debug;

    pub xdebugver, _: 31, 30;
    pub ndreset, set_ndreset: 29;
    pub fullreset, set_fullreset: 28;
    pub ebreakm, set_ebreakm: 15;
    pub ebreakh, set_ebreakh: 14;
    pub ebreaks, set_ebreaks: 13;
    pub ebreaku, set_ebreaku: 12;
    pub stopcycle, set_stopcycle: 10;
    pub stoptime, set_stoptime: 9;
    pub cause, set_cause: 8, 6;
    pub debugint, set_debugint: 5;
    pub halt, set_halt: 3;
    pub step, set_step: 2;
    pub prv, set_prv: 1, 0;
}

/// The `halt` bit of `dcsr` as a csrsi immediate.
pub const DCSR_HALT_IMM: u8 = 1 << 3;

/// Reasons the hart can give for entering debug mode, from `dcsr.cause`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DcsrCause {
    /// No cause recorded.
    None,
    /// An `ebreak` instruction was executed.
    SoftwareBreakpoint,
    /// The trigger module requested entry.
    Trigger,
    /// The debug interrupt was asserted.
    DebugInterrupt,
    /// A single step completed.
    Step,
    /// The halt bit was set at reset.
    HaltRequest,
    /// A value the spec reserves.
    Reserved(u8),
}

impl DcsrCause {
    /// Decodes the 3-bit `cause` field.
    pub fn parse(value: u8) -> Self {
        match value {
            0 => DcsrCause::None,
            1 => DcsrCause::SoftwareBreakpoint,
            2 => DcsrCause::Trigger,
            3 => DcsrCause::DebugInterrupt,
            4 => DcsrCause::Step,
            5 => DcsrCause::HaltRequest,
            other => DcsrCause::Reserved(other),
        }
    }
}

/// Field masks of the `mcontrol` flavour of `tdata1`.
///
/// The `type` and `dmode` fields sit at the top of the register and move
/// with XLEN, so they are functions rather than constants.
pub mod mcontrol {
    /// Compare data instead of the address.
    pub const SELECT: u64 = 1 << 19;
    /// Trap before (0) or after (1) the access.
    pub const TIMING: u64 = 1 << 18;
    /// What happens when the trigger fires.
    pub const ACTION: u64 = 0x3f << 12;
    /// Chain with the next trigger.
    pub const CHAIN: u64 = 1 << 11;
    /// The comparison the trigger performs.
    pub const MATCH: u64 = 0xf << 7;
    /// Fire in machine mode.
    pub const M: u64 = 1 << 6;
    /// Fire in hypervisor mode.
    pub const H: u64 = 1 << 5;
    /// Fire in supervisor mode.
    pub const S: u64 = 1 << 4;
    /// Fire in user mode.
    pub const U: u64 = 1 << 3;
    /// Fire on instruction execution.
    pub const EXECUTE: u64 = 1 << 2;
    /// Fire on stores.
    pub const STORE: u64 = 1 << 1;
    /// Fire on loads.
    pub const LOAD: u64 = 1 << 0;

    /// `action` value that enters debug mode.
    pub const ACTION_DEBUG_MODE: u64 = 1;
    /// `match` value for an exact compare against `tdata2`.
    pub const MATCH_EQUAL: u64 = 0;

    /// Mask of the `type` field for the given XLEN.
    pub fn type_mask(xlen: u32) -> u64 {
        0xf << (xlen - 4)
    }

    /// The `dmode` bit for the given XLEN.
    pub fn dmode(xlen: u32) -> u64 {
        1 << (xlen - 5)
    }
}

/// Extracts a field from a register value, shifted down to bit 0.
pub(crate) fn get_field(value: u64, mask: u64) -> u64 {
    (value & mask) >> mask.trailing_zeros()
}

/// Replaces a field in a register value.
pub(crate) fn set_field(value: u64, mask: u64, field: u64) -> u64 {
    (value & !mask) | ((field << mask.trailing_zeros()) & mask)
}

/// Whether `misa` advertises the single-letter extension.
pub(crate) fn misa_has_extension(misa: u64, extension: char) -> bool {
    misa & (1 << (extension as u8 - b'A')) != 0
}
