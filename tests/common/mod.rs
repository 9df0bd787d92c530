//! A simulated DTM/DM with a miniature hart behind it.
//!
//! The simulator implements [`JtagAccess`] and models the v0.11 debug
//! protocol: the one-deep dbus pipeline (a scan returns the result of the
//! previous operation), BUSY responses when scans arrive before the
//! previous operation finished, the haltnot/interrupt flags, Debug RAM,
//! and a hart that interprets the staged debug programs. User code runs
//! from a byte-addressed memory with execute/store triggers, `ebreak`
//! and single stepping, so resume scenarios are exercised end to end.

use riscv011::probe::{DebugProbeError, JtagAccess};
use std::collections::HashMap;

const DTMINFO_IR: u32 = 0x10;
const DBUS_IR: u32 = 0x11;

const DMCONTROL: u16 = 0x10;
const DMINFO: u16 = 0x11;

const HALTNOT_BIT: u64 = 1 << 32;
const INTERRUPT_BIT: u64 = 1 << 33;

const DEBUG_RAM_START: u32 = 0x400;
const DEBUG_ROM_RESUME: u32 = 0x804;
const SETHALTNOT: u32 = 0x10c;

const DCSR_NDRESET: u32 = 1 << 29;
const DCSR_FULLRESET: u32 = 1 << 28;
const DCSR_EBREAKM: u32 = 1 << 15;
const DCSR_HALT: u32 = 1 << 3;
const DCSR_STEP: u32 = 1 << 2;

const CAUSE_SWBP: u32 = 1;
const CAUSE_TRIGGER: u32 = 2;
const CAUSE_DEBUGINT: u32 = 3;
const CAUSE_STEP: u32 = 4;
const CAUSE_HALT: u32 = 5;

const MCONTROL_TYPE_DEFAULT: u32 = 2 << 28;
const MCONTROL_WRITABLE: u32 = (1 << 27)      // dmode
    | (0x3f << 12)                            // action
    | (0xf << 7)                              // match
    | (1 << 6)                                // m
    | (1 << 3)                                // u
    | (1 << 2)                                // execute
    | (1 << 1)                                // store
    | 1; // load

const MCONTROL_EXECUTE: u32 = 1 << 2;
const MCONTROL_STORE: u32 = 1 << 1;

/// RV32IMU.
const MISA: u32 = (1 << 30) | (1 << 20) | (1 << 12) | (1 << 8);

const RESET_VECTOR: u32 = 0x1000;

const ILLEGAL_INSTRUCTION: u32 = 2;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HartMode {
    Running,
    Halted,
}

#[derive(Debug, Copy, Clone)]
struct PendingOp {
    op: u8,
    address: u16,
    data: u64,
    complete_at: u64,
}

#[derive(Debug)]
enum StepOutcome {
    Next(u32),
    Jump(u32),
    Ebreak,
    Trap(u32),
    StoreTriggerHit,
}

/// A deterministic xorshift generator for latency jitter.
#[derive(Debug)]
pub struct Lcg(u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Lcg(seed.max(1))
    }

    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

#[derive(Debug)]
pub struct SimTarget {
    pub dtminfo: u32,
    pub dminfo: u32,
    addrbits: u8,
    dramsize: usize,

    pub dram: Vec<u32>,
    pub haltnot: bool,
    pub interrupt: bool,
    pub mode: HartMode,
    pub pc: u32,
    pub regs: [u32; 32],
    pub fregs: [u32; 32],
    pub dcsr: u32,
    pub dpc: u32,
    pub dscratch: u32,
    pub mscratch: u32,
    tselect: u32,
    pub tdata1: Vec<u32>,
    pub tdata2: Vec<u32>,
    pub memory: HashMap<u32, u8>,

    cycle: u64,
    pending: Option<PendingOp>,
    // (address, data) of the last completed operation.
    last_result: (u16, u64),
    exec_done_at: Option<u64>,

    /// Fixed number of cycles the hart needs to run a debug program.
    pub exec_latency: u64,
    /// Random extra dbus latency, drawn per operation.
    pub op_jitter: Option<(Lcg, u64)>,
    /// Scans to serve without jitter, so discovery runs undisturbed.
    pub calm_scans: u64,
    pub scan_count: u64,
}

impl SimTarget {
    /// A target with 4 dbus address bits and 16 words of Debug RAM.
    pub fn new() -> Self {
        Self::with_dramsize(16)
    }

    pub fn with_dramsize(dramsize: usize) -> Self {
        let addrbits: u8 = if dramsize > 16 { 7 } else { 4 };
        SimTarget {
            // version = 0
            dtminfo: (addrbits as u32) << 4,
            // access32, dramsize field, version = 1
            dminfo: (1 << 18) | (((dramsize as u32) - 1) << 10) | 1,
            addrbits,
            dramsize,
            dram: vec![0; dramsize],
            haltnot: false,
            interrupt: false,
            mode: HartMode::Running,
            pc: RESET_VECTOR,
            regs: [0; 32],
            fregs: [0; 32],
            dcsr: 0,
            dpc: 0,
            dscratch: 0,
            mscratch: 0,
            tselect: 0,
            tdata1: vec![MCONTROL_TYPE_DEFAULT; 2],
            tdata2: vec![0; 2],
            memory: HashMap::new(),
            cycle: 0,
            pending: None,
            last_result: (0, 0),
            exec_done_at: None,
            exec_latency: 0,
            op_jitter: None,
            calm_scans: 0,
            scan_count: 0,
        }
    }

    /// A target whose dbus needs more time than the idle padding gives
    /// it, so BUSY retries and interrupt-high handling are exercised.
    pub fn busy(seed: u64) -> Self {
        let mut sim = Self::new();
        sim.exec_latency = 60;
        sim.op_jitter = Some((Lcg::new(seed), 150));
        // Leave discovery alone; the storm starts afterwards.
        sim.calm_scans = 100;
        sim
    }

    /// Places a user program in memory, word by word.
    pub fn load_program(&mut self, base: u32, words: &[u32]) {
        for (i, word) in words.iter().enumerate() {
            for (j, byte) in word.to_le_bytes().iter().enumerate() {
                self.memory.insert(base + 4 * i as u32 + j as u32, *byte);
            }
        }
    }

    pub fn mem_read32(&self, address: u32) -> u32 {
        u32::from_le_bytes([
            *self.memory.get(&address).unwrap_or(&0),
            *self.memory.get(&(address + 1)).unwrap_or(&0),
            *self.memory.get(&(address + 2)).unwrap_or(&0),
            *self.memory.get(&(address + 3)).unwrap_or(&0),
        ])
    }

    fn slot_last(&self) -> usize {
        self.dramsize - 1
    }

    // ---- memory map shared by debug programs and user code ----

    fn bus_read8(&self, address: u32) -> u8 {
        let dram_end = DEBUG_RAM_START + 4 * self.dramsize as u32;
        if (DEBUG_RAM_START..dram_end).contains(&address) {
            let offset = address - DEBUG_RAM_START;
            let word = self.dram[(offset / 4) as usize];
            (word >> (8 * (offset % 4))) as u8
        } else {
            *self.memory.get(&address).unwrap_or(&0)
        }
    }

    fn bus_read(&self, address: u32, size: u32) -> u32 {
        let mut value = 0;
        for i in (0..size).rev() {
            value = (value << 8) | self.bus_read8(address + i) as u32;
        }
        value
    }

    fn bus_write(&mut self, address: u32, size: u32, value: u32) {
        if address == SETHALTNOT {
            self.haltnot = true;
            return;
        }
        let dram_end = DEBUG_RAM_START + 4 * self.dramsize as u32;
        for i in 0..size {
            let byte = (value >> (8 * i)) as u8;
            let address = address + i;
            if (DEBUG_RAM_START..dram_end).contains(&address) {
                let offset = address - DEBUG_RAM_START;
                let word = &mut self.dram[(offset / 4) as usize];
                let shift = 8 * (offset % 4);
                *word = (*word & !(0xff << shift)) | ((byte as u32) << shift);
            } else {
                self.memory.insert(address, byte);
            }
        }
    }

    // ---- CSRs ----

    fn csr_read(&self, csr: u16) -> Option<u32> {
        match csr {
            0x301 => Some(MISA),
            0x340 => Some(self.mscratch),
            0x7a0 => Some(self.tselect),
            0x7a1 => Some(self.tdata1[self.tselect as usize]),
            0x7a2 => Some(self.tdata2[self.tselect as usize]),
            0x7b0 => Some(self.dcsr),
            0x7b1 => Some(self.dpc),
            0x7b2 => Some(self.dscratch),
            0xf14 => Some(0),
            _ => None,
        }
    }

    fn csr_write(&mut self, csr: u16, value: u32) -> Option<()> {
        match csr {
            0x301 | 0xf14 => {}
            0x340 => self.mscratch = value,
            0x7a0 => self.tselect = value.min(self.tdata1.len() as u32 - 1),
            0x7a1 => {
                self.tdata1[self.tselect as usize] =
                    MCONTROL_TYPE_DEFAULT | (value & MCONTROL_WRITABLE);
            }
            0x7a2 => self.tdata2[self.tselect as usize] = value,
            0x7b0 => self.dcsr = value,
            0x7b1 => self.dpc = value,
            0x7b2 => self.dscratch = value,
            _ => return None,
        }
        Some(())
    }

    // ---- instruction interpreter ----

    fn set_reg(&mut self, rd: u32, value: u32) {
        if rd != 0 {
            self.regs[rd as usize] = value;
        }
    }

    fn store_trigger_hit(&self, address: u32) -> bool {
        for (tdata1, tdata2) in self.tdata1.iter().zip(&self.tdata2) {
            if tdata1 & MCONTROL_STORE != 0 && *tdata2 == address {
                return true;
            }
        }
        false
    }

    fn exec_trigger_hit(&self, pc: u32) -> bool {
        for (tdata1, tdata2) in self.tdata1.iter().zip(&self.tdata2) {
            if tdata1 & MCONTROL_EXECUTE != 0 && *tdata2 == pc {
                return true;
            }
        }
        false
    }

    fn step_at(&mut self, pc: u32, in_debug: bool) -> StepOutcome {
        let insn = self.bus_read(pc, 4);

        if insn & 3 != 3 {
            return match insn as u16 {
                0x9002 => StepOutcome::Ebreak,
                0x0001 => StepOutcome::Next(pc + 2),
                _ => StepOutcome::Trap(ILLEGAL_INSTRUCTION),
            };
        }

        let opcode = insn & 0x7f;
        let rd = (insn >> 7) & 0x1f;
        let funct3 = (insn >> 12) & 7;
        let rs1 = (insn >> 15) & 0x1f;
        let rs2 = (insn >> 20) & 0x1f;
        let imm_i = (insn as i32) >> 20;
        let imm_s = (((insn as i32) >> 25) << 5) | ((insn >> 7) & 0x1f) as i32;

        match opcode {
            // loads
            0x03 => {
                let address = self.regs[rs1 as usize].wrapping_add(imm_i as u32);
                let value = match funct3 {
                    0 => self.bus_read(address, 1) as i8 as i32 as u32,
                    1 => self.bus_read(address, 2) as i16 as i32 as u32,
                    2 => self.bus_read(address, 4),
                    _ => return StepOutcome::Trap(ILLEGAL_INSTRUCTION),
                };
                self.set_reg(rd, value);
                StepOutcome::Next(pc + 4)
            }
            // stores
            0x23 => {
                let address = self.regs[rs1 as usize].wrapping_add(imm_s as u32);
                let size = match funct3 {
                    0 => 1,
                    1 => 2,
                    2 => 4,
                    _ => return StepOutcome::Trap(ILLEGAL_INSTRUCTION),
                };
                if !in_debug && self.store_trigger_hit(address) {
                    return StepOutcome::StoreTriggerHit;
                }
                self.bus_write(address, size, self.regs[rs2 as usize]);
                StepOutcome::Next(pc + 4)
            }
            // op-imm
            0x13 => {
                let value = match funct3 {
                    0 => self.regs[rs1 as usize].wrapping_add(imm_i as u32),
                    4 => self.regs[rs1 as usize] ^ imm_i as u32,
                    5 => self.regs[rs1 as usize] >> (imm_i as u32 & 0x1f),
                    _ => return StepOutcome::Trap(ILLEGAL_INSTRUCTION),
                };
                self.set_reg(rd, value);
                StepOutcome::Next(pc + 4)
            }
            // jal
            0x6f => {
                let imm = ((((insn as i32) >> 31) as u32) << 20)
                    | (((insn >> 12) & 0xff) << 12)
                    | (((insn >> 20) & 1) << 11)
                    | (((insn >> 21) & 0x3ff) << 1);
                self.set_reg(rd, pc + 4);
                StepOutcome::Jump(pc.wrapping_add(imm))
            }
            // fence / fence.i
            0x0f => StepOutcome::Next(pc + 4),
            // system
            0x73 => {
                let csr = (insn >> 20) as u16;
                match funct3 {
                    0 if insn == 0x00100073 => StepOutcome::Ebreak,
                    // csrrw
                    1 => {
                        let Some(old) = self.csr_read(csr) else {
                            return StepOutcome::Trap(ILLEGAL_INSTRUCTION);
                        };
                        let value = self.regs[rs1 as usize];
                        if self.csr_write(csr, value).is_none() {
                            return StepOutcome::Trap(ILLEGAL_INSTRUCTION);
                        }
                        self.set_reg(rd, old);
                        StepOutcome::Next(pc + 4)
                    }
                    // csrrs
                    2 => {
                        let Some(old) = self.csr_read(csr) else {
                            return StepOutcome::Trap(ILLEGAL_INSTRUCTION);
                        };
                        if rs1 != 0
                            && self
                                .csr_write(csr, old | self.regs[rs1 as usize])
                                .is_none()
                        {
                            return StepOutcome::Trap(ILLEGAL_INSTRUCTION);
                        }
                        self.set_reg(rd, old);
                        StepOutcome::Next(pc + 4)
                    }
                    // csrrsi
                    6 => {
                        let Some(old) = self.csr_read(csr) else {
                            return StepOutcome::Trap(ILLEGAL_INSTRUCTION);
                        };
                        if self.csr_write(csr, old | rs1).is_none() {
                            return StepOutcome::Trap(ILLEGAL_INSTRUCTION);
                        }
                        self.set_reg(rd, old);
                        StepOutcome::Next(pc + 4)
                    }
                    _ => StepOutcome::Trap(ILLEGAL_INSTRUCTION),
                }
            }
            // flw
            0x07 if funct3 == 2 => {
                let address = self.regs[rs1 as usize].wrapping_add(imm_i as u32);
                self.fregs[rd as usize] = self.bus_read(address, 4);
                StepOutcome::Next(pc + 4)
            }
            // fsw
            0x27 if funct3 == 2 => {
                let address = self.regs[rs1 as usize].wrapping_add(imm_s as u32);
                self.bus_write(address, 4, self.fregs[rs2 as usize]);
                StepOutcome::Next(pc + 4)
            }
            _ => StepOutcome::Trap(ILLEGAL_INSTRUCTION),
        }
    }

    // ---- debug mode transitions ----

    fn enter_debug(&mut self, cause: u32, dpc: u32) {
        self.dscratch = self.regs[8];
        let slot_last = self.slot_last();
        self.dram[slot_last] = self.regs[9];
        self.dcsr = (self.dcsr & !(7 << 6)) | (cause << 6);
        self.dpc = dpc;
        self.haltnot = true;
        self.mode = HartMode::Halted;
    }

    fn run_debug_program(&mut self) {
        // The Debug ROM parks S0 in dscratch and S1 in the last Debug RAM
        // word so the staged program can use both freely.
        self.dscratch = self.regs[8];
        let slot_last = self.slot_last();
        self.dram[slot_last] = self.regs[9];

        let dram_end = DEBUG_RAM_START + 4 * self.dramsize as u32;
        let mut pc = DEBUG_RAM_START;
        for _ in 0..1000 {
            match self.step_at(pc, true) {
                StepOutcome::Next(next) => pc = next,
                StepOutcome::Jump(target) if target == DEBUG_ROM_RESUME => {
                    self.finish_debug_program();
                    return;
                }
                StepOutcome::Jump(target) if (DEBUG_RAM_START..dram_end).contains(&target) => {
                    pc = target;
                }
                StepOutcome::Jump(target) => {
                    panic!("debug program jumped to {target:#x}");
                }
                StepOutcome::Trap(cause) => {
                    self.take_debug_exception(cause);
                    return;
                }
                StepOutcome::Ebreak => {
                    // A breakpoint exception, should a program contain one.
                    self.take_debug_exception(3);
                    return;
                }
                StepOutcome::StoreTriggerHit => unreachable!("triggers are masked in debug mode"),
            }
            if !(DEBUG_RAM_START..dram_end).contains(&pc) {
                self.take_debug_exception(ILLEGAL_INSTRUCTION);
                return;
            }
        }
        panic!("runaway debug program");
    }

    fn take_debug_exception(&mut self, cause: u32) {
        // The Debug ROM exception entry records the cause in the last
        // Debug RAM word. The scratch registers are restored the same way
        // the normal path restores them.
        self.regs[9] = self.dram[self.slot_last()];
        self.regs[8] = self.dscratch;
        let slot_last = self.slot_last();
        self.dram[slot_last] = cause;
        self.interrupt = false;
    }

    fn finish_debug_program(&mut self) {
        // Resume path of the Debug ROM: restore the scratch registers and
        // clear the status word.
        self.regs[9] = self.dram[self.slot_last()];
        self.regs[8] = self.dscratch;
        let slot_last = self.slot_last();
        self.dram[slot_last] = 0;
        self.interrupt = false;

        if self.dcsr & (DCSR_NDRESET | DCSR_FULLRESET) != 0 {
            self.do_reset();
            return;
        }

        match self.mode {
            HartMode::Running => {
                if self.dcsr & DCSR_HALT != 0 {
                    self.enter_debug(CAUSE_DEBUGINT, self.pc);
                }
            }
            HartMode::Halted => {
                if !self.haltnot {
                    // The debugger cleared haltnot: leave debug mode.
                    self.mode = HartMode::Running;
                    self.pc = self.dpc;
                    self.run_user();
                }
            }
        }
    }

    fn do_reset(&mut self) {
        let ndreset = self.dcsr & DCSR_NDRESET != 0;
        self.pc = RESET_VECTOR;
        if ndreset {
            // A non-debug reset leaves the debug state alone, so the halt
            // request survives into the new epoch.
            self.dcsr &= !(DCSR_NDRESET | DCSR_FULLRESET);
            self.enter_debug(CAUSE_HALT, self.pc);
        } else {
            self.dcsr = 0;
            self.haltnot = false;
            self.mode = HartMode::Running;
            self.run_user();
        }
    }

    fn run_user(&mut self) {
        let step = self.dcsr & DCSR_STEP != 0;

        for _ in 0..10_000 {
            if self.exec_trigger_hit(self.pc) {
                self.enter_debug(CAUSE_TRIGGER, self.pc);
                return;
            }

            match self.step_at(self.pc, false) {
                StepOutcome::Next(next) | StepOutcome::Jump(next) => {
                    self.pc = next;
                    if step {
                        self.enter_debug(CAUSE_STEP, next);
                        return;
                    }
                }
                StepOutcome::Ebreak => {
                    if self.dcsr & DCSR_EBREAKM != 0 {
                        self.enter_debug(CAUSE_SWBP, self.pc);
                    }
                    return;
                }
                StepOutcome::StoreTriggerHit => {
                    self.enter_debug(CAUSE_TRIGGER, self.pc);
                    return;
                }
                StepOutcome::Trap(_) => {
                    // Nothing traps in the test programs; park the hart.
                    return;
                }
            }
        }
        // Budget exhausted: the hart keeps "running" where it is.
    }

    // ---- dbus pipeline ----

    fn flag_bits(&self) -> u64 {
        ((self.haltnot as u64) << 32) | ((self.interrupt as u64) << 33)
    }

    fn dm_read32(&self, address: u16) -> u32 {
        match address {
            DMCONTROL => 0,
            DMINFO => self.dminfo,
            a if (a as usize) < 0x10.min(self.dramsize) => self.dram[a as usize],
            a if (0x40..0x80).contains(&a) && (a as usize - 0x40 + 0x10) < self.dramsize => {
                self.dram[a as usize - 0x40 + 0x10]
            }
            _ => 0,
        }
    }

    fn dm_write(&mut self, address: u16, data: u64, at: u64) {
        if data & HALTNOT_BIT == 0 {
            self.haltnot = false;
        }

        let value = data as u32;
        match address {
            DMCONTROL | DMINFO => {}
            a if (a as usize) < 0x10.min(self.dramsize) => self.dram[a as usize] = value,
            a if (0x40..0x80).contains(&a) && (a as usize - 0x40 + 0x10) < self.dramsize => {
                self.dram[a as usize - 0x40 + 0x10] = value;
            }
            _ => {}
        }

        if data & INTERRUPT_BIT != 0 {
            self.interrupt = true;
            let latency = if self.scan_count <= self.calm_scans {
                0
            } else {
                self.exec_latency
            };
            self.exec_done_at = Some(at + latency);
        }
    }

    fn finish_op(&mut self) {
        let pending = self.pending.take().expect("an operation is in flight");
        match pending.op {
            // read
            1 => {
                self.last_result = (pending.address, self.dm_read32(pending.address) as u64);
            }
            // write: the response carries the word's previous content
            2 => {
                self.last_result = (pending.address, self.dm_read32(pending.address) as u64);
                self.dm_write(pending.address, pending.data, pending.complete_at);
            }
            // nop
            _ => {
                self.last_result = (0, 0);
            }
        }
    }

    fn finish_exec(&mut self) {
        self.exec_done_at = None;
        self.run_debug_program();
    }

    fn advance(&mut self, to: u64) {
        loop {
            let op_at = self
                .pending
                .as_ref()
                .map(|p| p.complete_at)
                .filter(|at| *at <= to);
            let exec_at = self.exec_done_at.filter(|at| *at <= to);

            match (op_at, exec_at) {
                (Some(op), Some(exec)) if exec <= op => self.finish_exec(),
                (Some(_), _) => self.finish_op(),
                (None, Some(_)) => self.finish_exec(),
                (None, None) => break,
            }
        }
    }

    fn op_latency(&mut self) -> u64 {
        if self.scan_count <= self.calm_scans {
            return 0;
        }
        match &mut self.op_jitter {
            Some((lcg, range)) => lcg.next() % *range,
            None => 0,
        }
    }

    fn dbus_scan(&mut self, data: &[u8], len: u32, idle_cycles: u32) -> Vec<u8> {
        let mut raw = [0u8; 16];
        raw[..data.len().min(16)].copy_from_slice(&data[..data.len().min(16)]);
        let out = u128::from_le_bytes(raw);

        let op = (out & 3) as u8;
        let out_data = ((out >> 2) & 0x3_ffff_ffff) as u64;
        let out_address = ((out >> 36) & ((1 << self.addrbits) - 1)) as u16;

        self.scan_count += 1;
        let arrival = self.cycle + len as u64;
        self.advance(arrival);

        let response = if self.pending.is_some() {
            // The previous operation is still in flight; this one is
            // dropped and the caller sees BUSY.
            pack_response(3, 0, 0, self.flag_bits())
        } else {
            let (address, result) = self.last_result;
            let packed = pack_response(0, address, result as u32, self.flag_bits());

            let latency = self.op_latency();
            self.pending = Some(PendingOp {
                op,
                address: out_address,
                data: out_data,
                complete_at: arrival + latency,
            });

            packed
        };

        self.cycle = arrival + idle_cycles as u64;

        let byte_len = ((len as usize) + 7) / 8;
        response.to_le_bytes()[..byte_len].to_vec()
    }
}

fn pack_response(status: u8, address: u16, data32: u32, flags: u64) -> u128 {
    let data = data32 as u64 | flags;
    (status as u128) | ((data as u128) << 2) | ((address as u128) << 36)
}

impl JtagAccess for SimTarget {
    fn tap_reset(&mut self) -> Result<(), DebugProbeError> {
        Ok(())
    }

    fn write_register(
        &mut self,
        address: u32,
        data: &[u8],
        len: u32,
        idle_cycles: u32,
    ) -> Result<Vec<u8>, DebugProbeError> {
        match address {
            DTMINFO_IR => Ok(self.dtminfo.to_le_bytes().to_vec()),
            DBUS_IR => Ok(self.dbus_scan(data, len, idle_cycles)),
            _ => Ok(vec![0; ((len as usize) + 7) / 8]),
        }
    }
}
