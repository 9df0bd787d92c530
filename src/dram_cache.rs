//! The Debug RAM cache and program builder.
//!
//! Debug programs are staged as 32-bit words in the on-chip Debug RAM and
//! executed by raising the debug interrupt. The cache keeps a local copy
//! of every word with valid/dirty state so that consecutive programs only
//! scan out the words that actually changed.

use crate::assembly;
use crate::communication_interface::RiscvError;
use crate::dtm::jtag_dtm::{
    DbusStatus, JtagDtm, ScanBuffer, DMCONTROL, DMCONTROL_HALTNOT, DMCONTROL_INTERRUPT,
};
use crate::registers::ZERO;

/// Start of the Debug ROM in the hart's address space.
pub const DEBUG_ROM_START: u32 = 0x800;

/// The Debug ROM entry that returns the hart to normal execution.
pub const DEBUG_ROM_RESUME: u32 = DEBUG_ROM_START + 4;

/// The Debug ROM entry taken when a debug program traps.
pub const DEBUG_ROM_EXCEPTION: u32 = DEBUG_ROM_START + 8;

/// Start of the Debug RAM in the hart's address space.
pub const DEBUG_RAM_START: u32 = 0x400;

/// Memory-mapped register that latches the haltnot flag when stored to.
pub const SETHALTNOT: u32 = 0x10c;

/// Number of Debug RAM words covered by the cache.
pub const DRAM_CACHE_SIZE: usize = 16;

/// Passing an address at or above this to [`DebugRamCache::write`] skips
/// the trailing read pair.
pub const CACHE_NO_READ: u32 = 128;

/// The fixed Debug RAM slots used to pass XLEN-wide operands between the
/// host and the hart.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Slot {
    /// The primary operand slot.
    Zero,
    /// The secondary operand slot.
    One,
    /// The slot at the end of Debug RAM; the Debug ROM parks S1 there.
    Last,
}

/// Debug RAM word index of a slot. The layout depends on XLEN because a
/// 64-bit slot covers two consecutive words, low word first.
pub fn slot_offset(xlen: u32, dramsize: u32, slot: Slot) -> u32 {
    match xlen {
        32 => match slot {
            Slot::Zero => 4,
            Slot::One => 5,
            Slot::Last => dramsize - 1,
        },
        64 => match slot {
            Slot::Zero => 4,
            Slot::One => 6,
            Slot::Last => dramsize - 2,
        },
        other => unreachable!("slot_offset called with XLEN {other}"),
    }
}

/// Translates a Debug RAM word index into its dbus address.
pub fn dram_address(index: usize) -> u16 {
    if index < 0x10 {
        index as u16
    } else {
        (0x40 + index - 0x10) as u16
    }
}

/// The load instruction matching the target's register width.
pub(crate) fn load(xlen: u32, destination: u8, base: u8, offset: u16) -> u32 {
    match xlen {
        32 => assembly::lw(destination, base, offset),
        64 => assembly::ld(destination, base, offset),
        other => unreachable!("load called with XLEN {other}"),
    }
}

/// The store instruction matching the target's register width.
pub(crate) fn store(xlen: u32, source: u8, base: u8, offset: u16) -> u32 {
    match xlen {
        32 => assembly::sw(source, base, offset),
        64 => assembly::sd(source, base, offset),
        other => unreachable!("store called with XLEN {other}"),
    }
}

/// A load of `destination` from an operand slot.
pub(crate) fn load_slot(xlen: u32, dramsize: u32, destination: u8, slot: Slot) -> u32 {
    let offset = DEBUG_RAM_START + 4 * slot_offset(xlen, dramsize, slot);
    load(xlen, destination, ZERO, offset as u16)
}

/// A store of `source` into an operand slot.
pub(crate) fn store_slot(xlen: u32, dramsize: u32, source: u8, slot: Slot) -> u32 {
    let offset = DEBUG_RAM_START + 4 * slot_offset(xlen, dramsize, slot);
    store(xlen, source, ZERO, offset as u16)
}

/// The `jal x0` that jumps from the given Debug RAM word back to the
/// resume entry of the Debug ROM. The offset depends on the word the
/// instruction sits in, so this must not be hoisted into a constant.
pub fn jump_to_resume(index: usize) -> u32 {
    assembly::jal(
        0,
        DEBUG_ROM_RESUME as i32 - (DEBUG_RAM_START as i32 + 4 * index as i32),
    )
}

#[derive(Debug, Copy, Clone, Default)]
struct CacheLine {
    data: u32,
    valid: bool,
    dirty: bool,
}

/// Write-through cache over the Debug RAM words.
#[derive(Debug)]
pub struct DebugRamCache {
    lines: [CacheLine; DRAM_CACHE_SIZE],

    /// Width of a GPR (and many other things) in bits.
    xlen: u32,

    /// Number of words in Debug RAM.
    dramsize: u32,
}

impl DebugRamCache {
    /// Creates an empty cache. The layout is provisional until
    /// [`Self::configure`] has run with the examined values.
    pub fn new() -> Self {
        Self {
            lines: [CacheLine::default(); DRAM_CACHE_SIZE],
            xlen: 32,
            dramsize: DRAM_CACHE_SIZE as u32,
        }
    }

    /// Records the examined XLEN and Debug RAM size.
    pub fn configure(&mut self, xlen: u32, dramsize: u32) {
        self.xlen = xlen;
        self.dramsize = dramsize;
    }

    /// The configured register width in bits.
    pub fn xlen(&self) -> u32 {
        self.xlen
    }

    /// The configured number of Debug RAM words.
    pub fn dramsize(&self) -> u32 {
        self.dramsize
    }

    /// Debug RAM word index of a slot for the configured layout.
    pub fn slot_offset(&self, slot: Slot) -> u32 {
        slot_offset(self.xlen, self.dramsize, slot)
    }

    /// A scan buffer sized for the configured layout.
    pub fn scan_buffer(&self, capacity: usize) -> ScanBuffer {
        ScanBuffer::new(self.xlen, self.dramsize, capacity)
    }

    /// Stages a word. The line is always marked dirty, even when the
    /// value matches: [`Self::write`] relies on every staged word being
    /// flushed out.
    pub fn set32(&mut self, index: usize, data: u32) {
        tracing::debug!("cache[{:#x}] = {:#010x}", index, data);
        self.lines[index] = CacheLine {
            data,
            valid: true,
            dirty: true,
        };
    }

    /// Stages an XLEN-wide value into an operand slot.
    pub fn set(&mut self, slot: Slot, value: u64) {
        let offset = self.slot_offset(slot) as usize;
        self.set32(offset, value as u32);
        if self.xlen > 32 {
            self.set32(offset + 1, (value >> 32) as u32);
        }
    }

    /// Stages a jump-to-resume at the given word.
    pub fn set_jump(&mut self, index: usize) {
        self.set32(index, jump_to_resume(index));
    }

    /// Stages a load of `reg` from an operand slot.
    pub fn set_load(&mut self, index: usize, reg: u8, slot: Slot) {
        self.set32(index, load_slot(self.xlen, self.dramsize, reg, slot));
    }

    /// Stages a store of `reg` into an operand slot.
    pub fn set_store(&mut self, index: usize, reg: u8, slot: Slot) {
        self.set32(index, store_slot(self.xlen, self.dramsize, reg, slot));
    }

    /// Drops all cached state. Call this whenever code ran that writes to
    /// Debug RAM entries 0 through 3.
    pub fn invalidate(&mut self) {
        for line in &mut self.lines {
            line.valid = false;
            line.dirty = false;
        }
    }

    /// Called after a program has run: the program words above the
    /// preamble are invalidated, nothing stays dirty. The preamble slots
    /// (indices below 4) keep their values.
    pub fn clean(&mut self) {
        for (i, line) in self.lines.iter_mut().enumerate() {
            if i >= 4 {
                line.valid = false;
            }
            line.dirty = false;
        }
    }

    /// Returns a word, reading through to the target on a miss. Words
    /// beyond the cached range (Debug RAM can be larger than the cache)
    /// are read through unconditionally.
    pub fn get32(&mut self, dtm: &mut JtagDtm<'_>, index: usize) -> Result<u32, RiscvError> {
        if index >= DRAM_CACHE_SIZE {
            return dtm.dram_read32(index);
        }
        if !self.lines[index].valid {
            self.lines[index].data = dtm.dram_read32(index)?;
            self.lines[index].valid = true;
        }
        Ok(self.lines[index].data)
    }

    /// Returns an operand slot, reading through to the target on a miss.
    pub fn get(&mut self, dtm: &mut JtagDtm<'_>, slot: Slot) -> Result<u64, RiscvError> {
        let offset = self.slot_offset(slot) as usize;
        let mut value = self.get32(dtm, offset)? as u64;
        if self.xlen > 32 {
            value |= (self.get32(dtm, offset + 1)? as u64) << 32;
        }
        Ok(value)
    }

    /// Verifies that every valid, clean line matches Debug RAM.
    pub fn check(&mut self, dtm: &mut JtagDtm<'_>) -> Result<(), RiscvError> {
        let mut errors = 0;

        for (i, line) in self.lines.iter().enumerate() {
            if line.valid && !line.dirty {
                let actual = dtm.dram_read32(i)?;
                if actual != line.data {
                    tracing::error!(
                        "Wrote {:#x} to Debug RAM at {}, but read back {:#x}",
                        line.data,
                        i,
                        actual
                    );
                    errors += 1;
                }
            }
        }

        if errors > 0 {
            self.dump_debug_ram(dtm)?;
            return Err(RiscvError::DebugRamMismatch);
        }

        Ok(())
    }

    fn dump_debug_ram(&self, dtm: &mut JtagDtm<'_>) -> Result<(), RiscvError> {
        for i in 0..DRAM_CACHE_SIZE {
            let value = dtm.dram_read32(i)?;
            tracing::error!("Debug RAM {:#x}: {:#010x}", i, value);
        }
        Ok(())
    }

    /// Writes the staged words to the target and optionally runs the
    /// program, then reads the word at `address` back into the cache
    /// (skipped when `address` is [`CACHE_NO_READ`] or higher and `run`
    /// is false).
    ///
    /// The write at the highest dirty index raises the debug interrupt
    /// when `run` is set, so the hart starts executing exactly when the
    /// program is complete. If nothing is dirty, a bare
    /// `dmcontrol` write kicks the hart into the staged program.
    pub fn write(
        &mut self,
        dtm: &mut JtagDtm<'_>,
        address: u32,
        run: bool,
    ) -> Result<(), RiscvError> {
        let mut scans = self.scan_buffer(DRAM_CACHE_SIZE + 2);

        let mut last = None;
        for (i, line) in self.lines.iter().enumerate() {
            if line.dirty {
                assert!(i < self.dramsize as usize);
                last = Some(i);
            }
        }

        match last {
            None => {
                // Nothing needs to be written to RAM.
                dtm.dbus_write(DMCONTROL, DMCONTROL_HALTNOT | DMCONTROL_INTERRUPT)?;
            }
            Some(last) => {
                for i in 0..DRAM_CACHE_SIZE {
                    if self.lines[i].dirty {
                        let set_interrupt = i == last && run;
                        scans.add_write32(dtm, i as u16, self.lines[i].data, set_interrupt);
                    }
                }
            }
        }

        if run || address < CACHE_NO_READ {
            // Throw away the results of the first read; it carries the
            // result of the read that happened just before the interrupt
            // was raised.
            scans.add_read32(dtm, address as u16, false);

            // This scan contains the result the caller asked for, along
            // with an up-to-date interrupt bit.
            scans.add_read32(dtm, address as u16, false);
        }

        scans.execute(dtm)?;

        let mut busy_scans = 0;
        for response in scans.responses() {
            match response.status {
                DbusStatus::Success => {}
                DbusStatus::Failed => {
                    tracing::error!("Debug RAM write failed. Hardware error?");
                    return Err(RiscvError::DbusFailure);
                }
                DbusStatus::Busy => busy_scans += 1,
            }
        }

        if busy_scans > 0 {
            dtm.increase_dbus_busy_delay();

            // Try again, using the slow careful code.
            for i in 0..DRAM_CACHE_SIZE {
                let set_interrupt = Some(i) == last && run;
                dtm.dram_write32(i, self.lines[i].data, set_interrupt)?;
                self.lines[i].dirty = false;
            }
            self.clean();

            if dtm.wait_for_debugint_clear(true).is_err() {
                tracing::error!("Debug interrupt didn't clear.");
                self.dump_debug_ram(dtm)?;
                return Err(RiscvError::Timeout);
            }
        } else {
            self.clean();

            if run || address < CACHE_NO_READ {
                let result = *scans
                    .responses()
                    .last()
                    .expect("the read pair was just queued");

                if result.interrupt() {
                    dtm.increase_interrupt_high_delay();
                    // Slow path wait for it to clear.
                    if dtm.wait_for_debugint_clear(false).is_err() {
                        tracing::error!("Debug interrupt didn't clear.");
                        self.dump_debug_ram(dtm)?;
                        return Err(RiscvError::Timeout);
                    }
                } else {
                    // We read a useful value in that last scan. Because of
                    // pipelining it may belong to a different address than
                    // the one requested.
                    if result.address as u32 != address {
                        tracing::info!(
                            "Got data from {:#x} but expected it from {:#x}",
                            result.address,
                            address
                        );
                    }
                    if let Some(line) = self.lines.get_mut(result.address as usize) {
                        line.data = result.data32();
                        line.valid = true;
                    }
                }
            }
        }

        Ok(())
    }
}

impl Default for DebugRamCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dram_address_translation() {
        assert_eq!(dram_address(0), 0);
        assert_eq!(dram_address(0xf), 0xf);
        assert_eq!(dram_address(0x10), 0x40);
        assert_eq!(dram_address(0x13), 0x43);
    }

    #[test]
    fn slot_layout_follows_xlen() {
        assert_eq!(slot_offset(32, 17, Slot::Zero), 4);
        assert_eq!(slot_offset(32, 17, Slot::One), 5);
        assert_eq!(slot_offset(32, 17, Slot::Last), 16);

        assert_eq!(slot_offset(64, 16, Slot::Zero), 4);
        assert_eq!(slot_offset(64, 16, Slot::One), 6);
        assert_eq!(slot_offset(64, 16, Slot::Last), 14);
    }

    #[test]
    fn jump_offset_depends_on_position() {
        // jal x0, 0x404 from word 0, four bytes less per word after that.
        assert_eq!(jump_to_resume(0), assembly::jal(0, 0x404));
        assert_eq!(jump_to_resume(3), assembly::jal(0, 0x3f8));
        assert_ne!(jump_to_resume(0), jump_to_resume(1));
    }

    #[test]
    fn clean_spares_the_preamble() {
        let mut cache = DebugRamCache::new();
        cache.set32(0, 0x11);
        cache.set32(4, 0x22);
        cache.set32(15, 0x33);

        cache.clean();

        assert!(cache.lines[0].valid);
        assert!(!cache.lines[0].dirty);
        assert!(!cache.lines[4].valid);
        assert!(!cache.lines[15].valid);
    }

    #[test]
    fn set_marks_dirty_even_on_same_value() {
        let mut cache = DebugRamCache::new();
        cache.set32(2, 0xabcd);
        cache.clean();

        cache.set32(2, 0xabcd);
        assert!(cache.lines[2].dirty);
    }

    #[test]
    fn wide_slot_covers_two_words() {
        let mut cache = DebugRamCache::new();
        cache.configure(64, 16);
        cache.set(Slot::Zero, 0x1122334455667788);

        assert_eq!(cache.lines[4].data, 0x55667788);
        assert_eq!(cache.lines[5].data, 0x11223344);
    }
}
