//! Register snapshots
//!
//! A compact `postcard` encoding of the register table, for applications that
//! want to keep their configuration across power cycles. Where and when to
//! store the bytes is up to them.

use serde::{Deserialize, Serialize};

use crate::{
    error::ErrorKind,
    registers::{HoldingRegisters, RegisterId, REGISTER_COUNT},
};

/// Upper bound for an encoded [`Snapshot`]: each `u16` varint takes at most 3 bytes
pub const MAX_ENCODED_LEN: usize = REGISTER_COUNT * 3;

/// Every register value, in address order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The values
    pub values: [u16; REGISTER_COUNT],
}

impl HoldingRegisters {
    /// Capture every register
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            values: *self.values(),
        }
    }

    /// Load `snapshot` back, through the usual clamping
    ///
    /// The error register and read-only registers describe the running
    /// device, not its configuration, and are left alone.
    pub fn restore(&mut self, snapshot: &Snapshot) {
        for (id, value) in RegisterId::ALL.into_iter().zip(snapshot.values) {
            if id == RegisterId::Errors || id.is_read_only() {
                continue;
            }
            self.write(id, value);
        }
    }
}

/// Encode `registers` into `buf`, returning the used part
pub fn encode<'b>(registers: &HoldingRegisters, buf: &'b mut [u8]) -> Result<&'b mut [u8], ErrorKind> {
    postcard::to_slice(&registers.snapshot(), buf).map_err(|_| ErrorKind::Memory)
}

/// Decode a [`Snapshot`] previously produced by [`encode`]
pub fn decode(bytes: &[u8]) -> Result<Snapshot, ErrorKind> {
    postcard::from_bytes(bytes).map_err(|_| ErrorKind::Range)
}
