//! Block memory access.
//!
//! Both directions stream batches of up to 256 dbus transactions through
//! Debug RAM word 4, which doubles as the dbus-visible data word while
//! the hart loops through a four-instruction program. Reads are pipelined
//! two deep: the n-th address produces the (n+2)-th scan's data.

use crate::assembly;
use crate::communication_interface::{RiscvCommunicationInterface, RiscvError};
use crate::dram_cache::{dram_address, Slot, CACHE_NO_READ, DEBUG_RAM_START};
use crate::dtm::jtag_dtm::{DbusStatus, DMCONTROL_INTERRUPT};
use crate::registers::{RiscvRegister, S0, S1, T0, ZERO};

const MAX_BATCH_SIZE: usize = 256;

impl RiscvCommunicationInterface<'_> {
    /// Reads `count` elements of `size` bytes (1, 2 or 4) from target
    /// memory into `buffer`. Elements are stored little-endian.
    pub fn read_memory(
        &mut self,
        address: u32,
        size: u32,
        count: u32,
        buffer: &mut [u8],
    ) -> Result<(), RiscvError> {
        assert!(buffer.len() >= (size * count) as usize);

        self.cache
            .set32(0, assembly::lw(S0, ZERO, DEBUG_RAM_START as u16 + 16));
        match size {
            1 => self.cache.set32(1, assembly::lb(S1, S0, 0)),
            2 => self.cache.set32(1, assembly::lh(S1, S0, 0)),
            4 => self.cache.set32(1, assembly::lw(S1, S0, 0)),
            other => {
                tracing::error!("Unsupported size: {}", other);
                return Err(RiscvError::UnsupportedAccessSize(other));
            }
        }
        self.cache
            .set32(2, assembly::sw(S1, ZERO, DEBUG_RAM_START as u16 + 16));
        self.cache.set_jump(3);
        self.cache.write(&mut self.dtm, CACHE_NO_READ, false)?;

        let exception_address = dram_address(self.cache.dramsize() as usize - 1);
        let mut scans = self.cache.scan_buffer(MAX_BATCH_SIZE);

        let mut result_value: u32 = 0x777;
        let mut i: u32 = 0;
        while i < count + 3 {
            let batch_size = ((count + 3 - i) as usize).min(MAX_BATCH_SIZE);
            scans.reset();

            for j in 0..batch_size as u32 {
                if i + j == count {
                    // Just insert a read so we can scan out the last value.
                    scans.add_read32(&self.dtm, 4, false);
                } else if i + j >= count + 1 {
                    // And check for errors.
                    scans.add_read32(&self.dtm, exception_address, false);
                } else {
                    // Write the next address and set interrupt.
                    let offset = size * (i + j);
                    scans.add_write32(&self.dtm, 4, address + offset, true);
                }
            }

            if let Err(error) = scans.execute(&mut self.dtm) {
                self.cache.clean();
                return Err(error);
            }

            let mut dbus_busy = 0;
            let mut execute_busy = 0;
            for (j, response) in scans.responses().iter().enumerate() {
                let j = j as u32;
                match response.status {
                    DbusStatus::Success => {}
                    DbusStatus::Failed => {
                        tracing::error!("Debug RAM write failed. Hardware error?");
                        self.cache.clean();
                        return Err(RiscvError::DbusFailure);
                    }
                    DbusStatus::Busy => dbus_busy += 1,
                }

                if response.data & DMCONTROL_INTERRUPT != 0 {
                    execute_busy += 1;
                }
                if i + j == count + 2 {
                    // The raw data still carries the haltnot/interrupt
                    // flags; only the low 32 bits hold the exception code.
                    result_value = response.data32();
                } else if i + j > 1 {
                    let offset = (size * (i + j - 2)) as usize;
                    let data = response.data32().to_le_bytes();
                    buffer[offset..offset + size as usize].copy_from_slice(&data[..size as usize]);
                }
                tracing::debug!("j={} status={:?} data={:#011x}", j, response.status, response.data);
            }

            if dbus_busy > 0 {
                self.dtm.increase_dbus_busy_delay();
            }
            if execute_busy > 0 {
                self.dtm.increase_interrupt_high_delay();
            }
            if dbus_busy > 0 || execute_busy > 0 {
                self.dtm.wait_for_debugint_clear(false)?;

                // Retry the batch with the new delays.
                tracing::info!(
                    "Retrying memory read starting from {:#x} with more delays",
                    address + size * i
                );
            } else {
                i += batch_size as u32;
            }
        }

        self.cache.clean();

        if result_value != 0 {
            tracing::error!(
                "Core got an exception ({:#x}) while reading from {:#x}",
                result_value,
                address + size * (count - 1)
            );
            if count > 1 {
                tracing::error!(
                    "(It may have failed between {:#x} and {:#x} as well, but we didn't check then.)",
                    address,
                    address + size * (count - 2) + size - 1
                );
            }
            return Err(RiscvError::Exception(result_value));
        }

        Ok(())
    }

    /// Writes `count` elements of `size` bytes (1, 2 or 4) from `buffer`
    /// to target memory. Elements are read little-endian.
    ///
    /// T0 is used as the target address cursor and restored to its
    /// original value afterwards.
    pub fn write_memory(
        &mut self,
        address: u32,
        size: u32,
        count: u32,
        buffer: &[u8],
    ) -> Result<(), RiscvError> {
        assert!(buffer.len() >= (size * count) as usize);

        // Set up the address in T0, capturing the user's T0 in SLOT1 on
        // the way.
        self.cache.set_store(0, T0, Slot::One);
        self.cache.set_load(1, T0, Slot::Zero);
        self.cache.set_jump(2);
        self.cache.set(Slot::Zero, address as u64);
        self.cache.write(&mut self.dtm, 5, true)?;

        let t0 = self.cache.get(&mut self.dtm, Slot::One)?;
        tracing::debug!("t0 is {:#x}", t0);

        self.setup_write_memory(size)?;

        let exception_address = dram_address(self.cache.dramsize() as usize - 1);
        let mut scans = self.cache.scan_buffer(MAX_BATCH_SIZE);

        let mut result_value: u32 = 0x777;
        let mut i: u32 = 0;
        while i < count + 2 {
            let batch_size = ((count + 2 - i) as usize).min(MAX_BATCH_SIZE);
            scans.reset();

            for j in 0..batch_size as u32 {
                if i + j >= count {
                    // Check for an exception.
                    scans.add_read32(&self.dtm, exception_address, false);
                } else {
                    // Write the next value and set interrupt.
                    let offset = (size * (i + j)) as usize;
                    let value = match size {
                        1 => buffer[offset] as u32,
                        2 => u16::from_le_bytes([buffer[offset], buffer[offset + 1]]) as u32,
                        4 => u32::from_le_bytes([
                            buffer[offset],
                            buffer[offset + 1],
                            buffer[offset + 2],
                            buffer[offset + 3],
                        ]),
                        other => {
                            self.cache.clean();
                            return Err(RiscvError::UnsupportedAccessSize(other));
                        }
                    };

                    scans.add_write32(&self.dtm, 4, value, true);
                }
            }

            if let Err(error) = scans.execute(&mut self.dtm) {
                self.cache.clean();
                return Err(error);
            }

            let mut dbus_busy = 0;
            let mut execute_busy = 0;
            for (j, response) in scans.responses().iter().enumerate() {
                let j = j as u32;
                match response.status {
                    DbusStatus::Success => {}
                    DbusStatus::Failed => {
                        tracing::error!("Debug RAM write failed. Hardware error?");
                        self.cache.clean();
                        return Err(RiscvError::DbusFailure);
                    }
                    DbusStatus::Busy => dbus_busy += 1,
                }

                if response.data & DMCONTROL_INTERRUPT != 0 {
                    execute_busy += 1;
                }
                if i + j == count + 1 {
                    result_value = response.data32();
                }
            }

            if dbus_busy > 0 {
                self.dtm.increase_dbus_busy_delay();
            }
            if execute_busy > 0 {
                self.dtm.increase_interrupt_high_delay();
            }
            if dbus_busy > 0 || execute_busy > 0 {
                self.dtm.wait_for_debugint_clear(false)?;

                // Retry. Set T0 back to what it should have been at the
                // beginning of this batch.
                tracing::info!(
                    "Retrying memory write starting from {:#x} with more delays",
                    address + size * i
                );

                self.cache.clean();

                self.write_gpr(T0, (address + size * i) as u64)?;
                self.setup_write_memory(size)?;
            } else {
                i += batch_size as u32;
            }
        }

        self.cache.clean();

        if result_value != 0 {
            tracing::error!(
                "Core got an exception ({:#x}) while writing to {:#x}",
                result_value,
                address + size * (count - 1)
            );
            if count > 1 {
                tracing::error!(
                    "(It may have failed between {:#x} and {:#x} as well, but we didn't check then.)",
                    address,
                    address + size * (count - 2) + size - 1
                );
            }
            return Err(RiscvError::Exception(result_value));
        }

        self.register_write(RiscvRegister::Gpr(T0), t0)
    }

    /// Stages the write loop: load the next value from the data word,
    /// store it through the T0 cursor, advance the cursor.
    fn setup_write_memory(&mut self, size: u32) -> Result<(), RiscvError> {
        match size {
            1 => {
                self.cache
                    .set32(0, assembly::lb(S0, ZERO, DEBUG_RAM_START as u16 + 16));
                self.cache.set32(1, assembly::sb(S0, T0, 0));
            }
            2 => {
                self.cache
                    .set32(0, assembly::lh(S0, ZERO, DEBUG_RAM_START as u16 + 16));
                self.cache.set32(1, assembly::sh(S0, T0, 0));
            }
            4 => {
                self.cache
                    .set32(0, assembly::lw(S0, ZERO, DEBUG_RAM_START as u16 + 16));
                self.cache.set32(1, assembly::sw(S0, T0, 0));
            }
            other => {
                tracing::error!("Unsupported size: {}", other);
                return Err(RiscvError::UnsupportedAccessSize(other));
            }
        }
        self.cache.set32(2, assembly::addi(T0, T0, size as i16));
        self.cache.set_jump(3);
        self.cache.write(&mut self.dtm, 4, false)?;

        Ok(())
    }
}
