//! Low-level access to the JTAG scan queue.
//!
//! Everything in this crate reaches the target through the primitives
//! defined here: shift a value into an IR-selected data register, follow
//! the scan with a number of run-test/idle cycles, and execute queued
//! scans as one batch. A debug probe (or a simulator) implements
//! [`JtagAccess`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// An error with the debug probe driving the JTAG interface.
#[derive(thiserror::Error, Debug)]
pub enum DebugProbeError {
    /// An error that is specific to the probe driver in use.
    #[error("An error specific to the probe driver occurred")]
    ProbeSpecific(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The probe does not support the requested scan length.
    #[error("The probe does not support scans of {0} bits")]
    UnsupportedScanLength(u32),

    /// The probe did not answer in time.
    #[error("Timeout waiting for the probe to answer")]
    Timeout,
}

/// Low-level access to the JTAG protocol.
///
/// The driver assumes that scans enqueued through this trait are executed
/// strictly in order, and that each data register scan is followed by the
/// requested number of run-test/idle cycles before the next scan starts.
/// Selecting the instruction register is the implementation's job: a scan
/// names the IR value it needs, and the probe only shifts IR when the
/// selected instruction changes.
pub trait JtagAccess: fmt::Debug {
    /// Executes a TAP reset.
    fn tap_reset(&mut self) -> Result<(), DebugProbeError>;

    /// Writes `len` bits of `data` into the DR selected by the `address`
    /// instruction, then stays in run-test/idle for `idle_cycles` clock
    /// cycles. Returns the bits captured while shifting.
    fn write_register(
        &mut self,
        address: u32,
        data: &[u8],
        len: u32,
        idle_cycles: u32,
    ) -> Result<Vec<u8>, DebugProbeError>;

    /// Reads a JTAG register.
    ///
    /// This emulates a read by performing a write with all zeros to the DR.
    fn read_register(&mut self, address: u32, len: u32) -> Result<Vec<u8>, DebugProbeError> {
        let data = vec![0u8; (len as usize + 7) / 8];

        self.write_register(address, &data, len, 0)
    }

    /// Executes a sequence of JTAG scans.
    ///
    /// Probes with deep command pipelines should override this to submit
    /// the whole queue in one transfer.
    fn write_register_batch(
        &mut self,
        writes: &JtagCommandQueue,
    ) -> Result<DeferredResultSet, DebugProbeError> {
        let mut results = DeferredResultSet::with_capacity(writes.len());

        for (idx, write) in writes.iter() {
            let response =
                self.write_register(write.address, &write.data, write.len, write.idle_cycles)?;
            results.push(idx, (write.transform)(write, response));
        }

        Ok(results)
    }
}

/// A single queued JTAG scan.
#[derive(Debug, Clone)]
pub struct JtagWriteCommand {
    /// The IR value selecting the DR to write to.
    pub address: u32,

    /// The data to be shifted into DR.
    pub data: Vec<u8>,

    /// The number of bits in `data`.
    pub len: u32,

    /// Run-test/idle cycles to insert after the scan.
    pub idle_cycles: u32,

    /// Transforms the captured DR bits into a [`CommandResult`].
    pub transform: fn(&JtagWriteCommand, Vec<u8>) -> CommandResult,
}

/// Results generated by queued JTAG scans.
#[derive(Debug, Clone)]
pub enum CommandResult {
    /// No result was captured.
    None,

    /// A single 32-bit word.
    U32(u32),

    /// The raw captured bits.
    VecU8(Vec<u8>),
}

impl CommandResult {
    /// Returns the result as a `u32`.
    ///
    /// # Panics
    ///
    /// Panics if the result is not a `u32`.
    pub fn into_u32(self) -> u32 {
        match self {
            CommandResult::U32(value) => value,
            _ => panic!("CommandResult is not a u32"),
        }
    }

    /// Returns the raw captured bytes.
    ///
    /// # Panics
    ///
    /// Panics if the result does not carry raw bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            CommandResult::VecU8(bytes) => bytes,
            _ => panic!("CommandResult does not carry raw bytes"),
        }
    }
}

/// A set of batched scans that will be executed all at once.
#[derive(Default, Debug)]
pub struct JtagCommandQueue {
    commands: Vec<(DeferredResultIndex, JtagWriteCommand)>,
}

impl JtagCommandQueue {
    /// Creates a new empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules a scan for later execution.
    ///
    /// Returns a token that can be used to retrieve the result of the scan
    /// after the queue has been executed.
    pub fn schedule(&mut self, command: JtagWriteCommand) -> DeferredResultIndex {
        let index = DeferredResultIndex::new();
        self.commands.push((index.clone(), command));
        index
    }

    /// Returns the number of scans in the queue.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Returns whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Drops all queued scans.
    pub fn clear(&mut self) {
        self.commands.clear();
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &(DeferredResultIndex, JtagWriteCommand)> {
        self.commands.iter()
    }
}

/// The set of results returned by executing a batched command queue.
#[derive(Debug, Default)]
pub struct DeferredResultSet(HashMap<DeferredResultIndex, CommandResult>);

impl DeferredResultSet {
    /// Creates a new empty result set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new empty result set with the given capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self(HashMap::with_capacity(capacity))
    }

    /// Stores a result under its index.
    pub fn push(&mut self, idx: &DeferredResultIndex, result: CommandResult) {
        self.0.insert(idx.clone(), result);
    }

    /// Returns the number of results in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Takes a result from the set.
    pub fn take(&mut self, index: &DeferredResultIndex) -> Option<CommandResult> {
        self.0.remove(index)
    }
}

/// An index type used to retrieve the result of a deferred scan.
#[derive(Eq)]
pub struct DeferredResultIndex(Arc<()>);

impl DeferredResultIndex {
    // Intentionally private. User code must not be able to create these.
    fn new() -> Self {
        Self(Arc::new(()))
    }

    fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub(crate) fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl PartialEq for DeferredResultIndex {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::hash::Hash for DeferredResultIndex {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id().hash(state)
    }
}

impl fmt::Debug for DeferredResultIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DeferredResultIndex")
            .field(&self.id())
            .finish()
    }
}
