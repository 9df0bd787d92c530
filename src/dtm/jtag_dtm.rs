//! The dbus scan engine.
//!
//! Almost everything the driver does goes through DR scans of the `dbus`
//! JTAG register. A scan shifts an operation, a 34-bit data field and a
//! Debug Module address in, and shifts the status, data and address of an
//! earlier operation out. The engine handles the BUSY retry protocol and
//! adapts the number of run-test/idle cycles between scans so that
//! retries stay rare.

use bitvec::field::BitField;
use bitvec::order::Lsb0;
use bitvec::view::BitView;

use crate::communication_interface::{RiscvError, RISCV_TIMEOUT};
use crate::dram_cache::{dram_address, jump_to_resume, slot_offset, Slot};
use crate::probe::{
    CommandResult, DeferredResultIndex, JtagAccess, JtagCommandQueue, JtagWriteCommand,
};
use bitfield::bitfield;
use std::time::Instant;

/// Address of the `dtminfo` JTAG register.
pub const DTMINFO_ADDRESS: u32 = 0x10;

/// Width of the `dtminfo` JTAG register.
pub const DTMINFO_WIDTH: u32 = 32;

/// Address of the `dbus` JTAG register.
pub const DBUS_ADDRESS: u32 = 0x11;

/// Width of the op field of the `dbus` register.
const DBUS_OP_BITS: u32 = 2;

/// Width of the data field of the `dbus` register: a 32-bit payload plus
/// the haltnot and interrupt flags above it.
const DBUS_DATA_BITS: u32 = 34;

/// Bit offset of the data field.
const DBUS_DATA_OFFSET: u32 = 2;

/// Bit offset of the address field.
const DBUS_ADDRESS_OFFSET: u32 = 36;

/// Debug Module address of the `dmcontrol` register.
pub const DMCONTROL: u16 = 0x10;

/// Debug Module address of the `dminfo` register.
pub const DMINFO: u16 = 0x11;

/// The haltnot flag, bit 32 of the data field. Every write latches it, so
/// Debug RAM writes while the hart is halted must keep it set.
pub const DMCONTROL_HALTNOT: u64 = 1 << 32;

/// The interrupt flag, bit 33 of the data field. Set by the host to make
/// the hart execute the staged debug program, cleared by the hart when
/// the program is done.
pub const DMCONTROL_INTERRUPT: u64 = 1 << 33;

bitfield! {
    /// The read-only `dtminfo` register.
    pub struct Dtminfo(u32);
    impl Debug;

    /// Number of address bits in the dbus register.
    pub addrbits, _: 7, 4;
    /// DTM version; only 0 is supported.
    pub version, _: 3, 0;
}

bitfield! {
    /// The `dminfo` Debug Module register.
    pub struct Dminfo(u32);
    impl Debug;

    pub abussize, _: 31, 25;
    pub serialcount, _: 24, 21;
    pub access128, _: 20;
    pub access64, _: 19;
    pub access32, _: 18;
    pub access16, _: 17;
    pub access8, _: 16;
    pub dramsize, _: 15, 10;
    pub authenticated, _: 5;
    pub authbusy, _: 4;
    pub authtype, _: 3, 2;
    pub version, _: 1, 0;
}

/// Operations of a dbus scan.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DbusOp {
    /// No operation; shifts out the response of the previous scan.
    Nop = 0,
    /// Read the addressed Debug Module register.
    Read = 1,
    /// Write the addressed Debug Module register.
    Write = 2,
}

/// Status returned in the op field of the following scan.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DbusStatus {
    /// The previous operation completed.
    Success = 0,
    /// The previous operation failed and the failure is sticky.
    Failed = 2,
    /// The previous operation had not completed when the scan started.
    Busy = 3,
}

impl DbusStatus {
    pub(crate) fn parse(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Success),
            2 => Some(Self::Failed),
            3 => Some(Self::Busy),
            _ => None,
        }
    }
}

/// The parsed result of one dbus scan.
#[derive(Debug, Copy, Clone)]
pub struct DbusResponse {
    /// Status of the previous operation.
    pub status: DbusStatus,
    /// Address the shifted-out data belongs to.
    pub address: u16,
    /// The 34-bit data field, flags included.
    pub data: u64,
}

impl DbusResponse {
    /// Parses the bits captured by a dbus scan.
    pub fn parse(bytes: &[u8], addrbits: u8) -> Result<Self, RiscvError> {
        let bits = bytes.view_bits::<Lsb0>();

        let op = bits[0..DBUS_OP_BITS as usize].load_le::<u8>();
        let data = bits[DBUS_DATA_OFFSET as usize..DBUS_ADDRESS_OFFSET as usize].load_le::<u64>();
        let address = bits
            [DBUS_ADDRESS_OFFSET as usize..(DBUS_ADDRESS_OFFSET + addrbits as u32) as usize]
            .load_le::<u16>();

        let status = DbusStatus::parse(op).ok_or(RiscvError::InvalidDbusStatus(op))?;

        Ok(DbusResponse {
            status,
            address,
            data,
        })
    }

    /// The 32-bit payload without the haltnot/interrupt flags.
    pub fn data32(&self) -> u32 {
        self.data as u32
    }

    /// Whether the interrupt flag was set in the shifted-out data.
    pub fn interrupt(&self) -> bool {
        self.data & DMCONTROL_INTERRUPT != 0
    }
}

/// The haltnot and interrupt flags, as read back by [`JtagDtm::read_bits`].
#[derive(Debug, Copy, Clone)]
pub struct Bits {
    /// The hart is in debug mode.
    pub haltnot: bool,
    /// A staged debug program has not finished yet.
    pub interrupt: bool,
}

/// Access to the Debug Transport Module (DTM),
/// which is used to communicate with the RISC-V debug module.
#[derive(Debug)]
pub struct JtagDtm<'probe> {
    probe: &'probe mut dyn JtagAccess,

    /// Number of address bits in the dbus register, from `dtminfo`.
    pub(crate) addrbits: u8,

    // This value is incremented every time a dbus access comes back as
    // "busy". It decides how many run-test/idle cycles to feed the target
    // in between accesses.
    dbus_busy_delay: u32,

    // This value is incremented every time we read the debug interrupt as
    // high. It adds extra run-test/idle cycles after setting the debug
    // interrupt, so ideally we never have to perform a whole extra scan
    // before the interrupt is cleared.
    interrupt_high_delay: u32,
}

impl<'probe> JtagDtm<'probe> {
    /// Wraps a JTAG probe. The address width stays unknown until
    /// [`Self::read_dtminfo`] has run.
    pub fn new(probe: &'probe mut dyn JtagAccess) -> Self {
        Self {
            probe,
            addrbits: 0,
            dbus_busy_delay: 0,
            interrupt_high_delay: 0,
        }
    }

    /// Reads the `dtminfo` register.
    pub fn read_dtminfo(&mut self) -> Result<Dtminfo, RiscvError> {
        let bits = self.probe.read_register(DTMINFO_ADDRESS, DTMINFO_WIDTH)?;

        Ok(Dtminfo(bits.view_bits::<Lsb0>()[..32].load_le::<u32>()))
    }

    /// Executes a TAP reset.
    pub fn tap_reset(&mut self) -> Result<(), RiscvError> {
        self.probe.tap_reset()?;
        Ok(())
    }

    pub(crate) fn increase_dbus_busy_delay(&mut self) {
        self.dbus_busy_delay += 1;
        tracing::info!("Increment dbus_busy_delay to {}", self.dbus_busy_delay);
    }

    pub(crate) fn increase_interrupt_high_delay(&mut self) {
        self.interrupt_high_delay += 1;
        tracing::info!(
            "Increment interrupt_high_delay to {}",
            self.interrupt_high_delay
        );
    }

    /// The current busy-avoidance delay. Monotonically non-decreasing.
    pub fn dbus_busy_delay(&self) -> u32 {
        self.dbus_busy_delay
    }

    /// The current interrupt-high delay. Monotonically non-decreasing.
    pub fn interrupt_high_delay(&self) -> u32 {
        self.interrupt_high_delay
    }

    fn scan_bits(&self) -> u32 {
        self.addrbits as u32 + DBUS_OP_BITS + DBUS_DATA_BITS
    }

    /// Run-test/idle cycles to append to a scan shifting `data` out.
    fn idle_cycles_for(&self, data: u64) -> u32 {
        let mut idle_count = 1 + self.dbus_busy_delay;
        if data & DMCONTROL_INTERRUPT != 0 {
            idle_count += self.interrupt_high_delay;
        }
        idle_count
    }

    fn pack_scan(op: DbusOp, address: u16, data: u64) -> [u8; 16] {
        let value: u128 = ((address as u128) << DBUS_ADDRESS_OFFSET)
            | (((data as u128) & 0x3_ffff_ffff) << DBUS_DATA_OFFSET)
            | op as u128;
        value.to_le_bytes()
    }

    /// Performs a single dbus scan and returns the parsed response.
    pub fn dbus_scan(
        &mut self,
        op: DbusOp,
        address: u16,
        data: u64,
    ) -> Result<DbusResponse, RiscvError> {
        assert!(self.addrbits != 0);

        let bytes = Self::pack_scan(op, address, data);
        let idle_cycles = self.idle_cycles_for(data);

        let response =
            self.probe
                .write_register(DBUS_ADDRESS, &bytes, self.scan_bits(), idle_cycles)?;
        let response = DbusResponse::parse(&response, self.addrbits)?;

        tracing::debug!(
            "dbus scan {:?} {:09x} @{:02x} -> {:?} {:09x} @{:02x}",
            op,
            data,
            address,
            response.status,
            response.data,
            response.address,
        );

        Ok(response)
    }

    /// Reads a Debug Module register, retrying while the bus is busy.
    ///
    /// The returned address is checked against the requested one so a
    /// stale response from an earlier request is never handed out.
    pub fn dbus_read(&mut self, address: u16) -> Result<u64, RiscvError> {
        loop {
            let response = loop {
                let response = self.dbus_scan(DbusOp::Read, address, 0)?;
                if response.status != DbusStatus::Busy {
                    break response;
                }
            };

            if response.address == address {
                return Ok(response.data);
            }
        }
    }

    /// Writes a Debug Module register, retrying while the bus is busy.
    pub fn dbus_write(&mut self, address: u16, value: u64) -> Result<(), RiscvError> {
        let status = loop {
            let response = self.dbus_scan(DbusOp::Write, address, value)?;
            if response.status != DbusStatus::Busy {
                break response.status;
            }
        };

        if status != DbusStatus::Success {
            tracing::error!(
                "dbus_write failed write {:#x} to {:#x}; status={:?}",
                value,
                address,
                status
            );
        }

        Ok(())
    }

    /// Reads the haltnot and interrupt bits.
    pub fn read_bits(&mut self) -> Result<Bits, RiscvError> {
        let data = loop {
            let response = loop {
                let response = self.dbus_scan(DbusOp::Read, 0, 0)?;
                if response.status != DbusStatus::Busy {
                    break response;
                }
            };

            if response.address <= DMCONTROL {
                break response.data;
            }
        };

        Ok(Bits {
            haltnot: data & DMCONTROL_HALTNOT != 0,
            interrupt: data & DMCONTROL_INTERRUPT != 0,
        })
    }

    /// Polls until the hart clears the debug interrupt.
    ///
    /// With `ignore_first`, the result of the first read is thrown away:
    /// it contains the result of the read that happened just before the
    /// interrupt was set, assuming the previous scan was one that set it.
    pub fn wait_for_debugint_clear(&mut self, ignore_first: bool) -> Result<(), RiscvError> {
        let start = Instant::now();

        if ignore_first {
            self.read_bits()?;
        }

        loop {
            let bits = self.read_bits()?;
            if !bits.interrupt {
                return Ok(());
            }
            if start.elapsed() > RISCV_TIMEOUT {
                tracing::error!("Timed out waiting for debug int to clear.");
                return Err(RiscvError::Timeout);
            }
        }
    }

    /// Reads one Debug RAM word, bypassing the cache.
    pub fn dram_read32(&mut self, index: usize) -> Result<u32, RiscvError> {
        let value = self.dbus_read(dram_address(index))?;
        Ok(value as u32)
    }

    /// Writes one Debug RAM word, bypassing the cache. Keeps haltnot set.
    pub fn dram_write32(
        &mut self,
        index: usize,
        value: u32,
        set_interrupt: bool,
    ) -> Result<(), RiscvError> {
        let mut dbus_value = DMCONTROL_HALTNOT | value as u64;
        if set_interrupt {
            dbus_value |= DMCONTROL_INTERRUPT;
        }
        self.dbus_write(dram_address(index), dbus_value)
    }

    /// Writes the instruction that jumps from the given Debug RAM word
    /// back to the resume entry of the Debug ROM.
    pub fn dram_write_jump(&mut self, index: usize, set_interrupt: bool) -> Result<(), RiscvError> {
        self.dram_write32(index, jump_to_resume(index), set_interrupt)
    }
}

/// A batch of dbus scans executed with a single queue flush.
///
/// Slots are sized for the target's XLEN; responses become available
/// after [`ScanBuffer::execute`] and stay valid until the next
/// [`ScanBuffer::reset`].
#[derive(Debug)]
pub struct ScanBuffer {
    queue: JtagCommandQueue,
    entries: Vec<DeferredResultIndex>,
    responses: Vec<DbusResponse>,
    xlen: u32,
    dramsize: u32,
    capacity: usize,
}

impl ScanBuffer {
    /// Reserves space for `capacity` scans against a target with the
    /// given XLEN and Debug RAM size.
    pub fn new(xlen: u32, dramsize: u32, capacity: usize) -> Self {
        Self {
            queue: JtagCommandQueue::new(),
            entries: Vec::with_capacity(capacity),
            responses: Vec::new(),
            xlen,
            dramsize,
            capacity,
        }
    }

    /// Drops all queued scans and buffered responses.
    pub fn reset(&mut self) {
        self.queue.clear();
        self.entries.clear();
        self.responses.clear();
    }

    /// Number of queued scans.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the buffer holds no scans.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn add_scan(&mut self, dtm: &JtagDtm<'_>, op: DbusOp, address: u16, data: u64) {
        tracing::debug!("op={:?} address={:#04x} data={:#011x}", op, address, data);

        let bytes = JtagDtm::pack_scan(op, address, data);

        let index = self.queue.schedule(JtagWriteCommand {
            address: DBUS_ADDRESS,
            data: bytes.to_vec(),
            len: dtm.scan_bits(),
            idle_cycles: dtm.idle_cycles_for(data),
            transform: |_, bits| CommandResult::VecU8(bits),
        });
        self.entries.push(index);

        assert!(self.entries.len() <= self.capacity);
    }

    /// Queues a 32-bit write of a Debug RAM word or Debug Module register.
    pub fn add_write32(&mut self, dtm: &JtagDtm<'_>, address: u16, data: u32, set_interrupt: bool) {
        let flags = if set_interrupt {
            DMCONTROL_INTERRUPT | DMCONTROL_HALTNOT
        } else {
            DMCONTROL_HALTNOT
        };
        self.add_scan(dtm, DbusOp::Write, address, flags | data as u64);
    }

    /// Queues a 32-bit read.
    pub fn add_read32(&mut self, dtm: &JtagDtm<'_>, address: u16, set_interrupt: bool) {
        let flags = if set_interrupt {
            DMCONTROL_INTERRUPT | DMCONTROL_HALTNOT
        } else {
            DMCONTROL_HALTNOT
        };
        self.add_scan(dtm, DbusOp::Read, address, flags);
    }

    /// Queues the write of a jump-to-resume at the given Debug RAM word.
    pub fn add_write_jump(&mut self, dtm: &JtagDtm<'_>, address: u16, set_interrupt: bool) {
        self.add_write32(dtm, address, jump_to_resume(address as usize), set_interrupt);
    }

    /// Queues the write of a load of `reg` from an operand slot.
    pub fn add_write_load(
        &mut self,
        dtm: &JtagDtm<'_>,
        address: u16,
        reg: u8,
        slot: Slot,
        set_interrupt: bool,
    ) {
        let instruction = crate::dram_cache::load_slot(self.xlen, self.dramsize, reg, slot);
        self.add_write32(dtm, address, instruction, set_interrupt);
    }

    /// Queues the write of a store of `reg` into an operand slot.
    pub fn add_write_store(
        &mut self,
        dtm: &JtagDtm<'_>,
        address: u16,
        reg: u8,
        slot: Slot,
        set_interrupt: bool,
    ) {
        let instruction = crate::dram_cache::store_slot(self.xlen, self.dramsize, reg, slot);
        self.add_write32(dtm, address, instruction, set_interrupt);
    }

    /// Queues the read of an operand slot: one scan for XLEN=32, low and
    /// high word for XLEN=64 with `set_interrupt` only on the second.
    pub fn add_read(&mut self, dtm: &JtagDtm<'_>, slot: Slot, set_interrupt: bool) {
        let offset = slot_offset(self.xlen, self.dramsize, slot) as u16;
        match self.xlen {
            32 => self.add_read32(dtm, offset, set_interrupt),
            64 => {
                self.add_read32(dtm, offset, false);
                self.add_read32(dtm, offset + 1, set_interrupt);
            }
            other => unreachable!("XLEN {other} cannot be operated on"),
        }
    }

    /// Flushes the queue and parses every response.
    pub fn execute(&mut self, dtm: &mut JtagDtm<'_>) -> Result<(), RiscvError> {
        let mut results = dtm.probe.write_register_batch(&self.queue)?;

        self.responses.clear();
        for entry in &self.entries {
            let bytes = results
                .take(entry)
                .ok_or(RiscvError::BatchedResultNotAvailable)?
                .into_bytes();
            self.responses
                .push(DbusResponse::parse(&bytes, dtm.addrbits)?);
        }

        Ok(())
    }

    /// The responses of the last [`Self::execute`], in scan order.
    pub fn responses(&self) -> &[DbusResponse] {
        &self.responses
    }
}
