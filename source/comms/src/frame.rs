//! RTU frames
//!
//! A [`Frame`] is one complete message as it appears on the wire:
//!
//! ```text
//! [address:1][function:1][payload:0..=252][crcLo:1][crcHi:1]
//! ```
//!
//! Frames own their bytes. The reassembler copies them out of its ring, so
//! nothing outside of the interrupt context ever holds a reference into
//! reception storage.

use heapless::Vec;

use crate::{crc, error::ErrorKind};

/// Largest RTU frame: address, function, 252 payload bytes, checksum
pub const MAX_ADU: usize = 256;

/// Largest payload carried between function code and checksum
pub const MAX_PAYLOAD: usize = MAX_ADU - 4;

/// Address, function, two byte start address, two byte count
pub const HEADER_LEN: usize = 6;

/// Smallest frame that can carry anything: address, function, checksum
pub const MIN_FRAME_LEN: usize = 2 + crc::CRC_LEN;

/// Address that every responder answers for device discovery
pub const DISCOVERY_ADDRESS: u8 = 0xFF;

/// Set on the function code of every exception response
pub const EXCEPTION_BIT: u8 = 0x80;

/// Function codes this engine speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[repr(u8)]
pub enum FunctionCode {
    /// `0x03`
    ReadHoldingRegisters = 0x03,
    /// `0x10`
    WriteMultipleRegisters = 0x10,
}

/// A function code outside of [`FunctionCode`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct UnknownFunction(pub u8);

impl TryFrom<u8> for FunctionCode {
    type Error = UnknownFunction;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x03 => Ok(FunctionCode::ReadHoldingRegisters),
            0x10 => Ok(FunctionCode::WriteMultipleRegisters),
            other => Err(UnknownFunction(other)),
        }
    }
}

impl From<FunctionCode> for u8 {
    fn from(value: FunctionCode) -> Self {
        value as u8
    }
}

/// One complete RTU frame, checksum included
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    buf: Vec<u8, MAX_ADU>,
}

impl Frame {
    /// Wrap raw bytes received from the wire
    ///
    /// Returns `None` if `bytes` is shorter than [`MIN_FRAME_LEN`] or longer
    /// than [`MAX_ADU`]. The checksum is NOT checked, see [`Frame::crc_ok`].
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < MIN_FRAME_LEN {
            return None;
        }
        Vec::from_slice(bytes).ok().map(|buf| Self { buf })
    }

    /// Start building a frame for `address` and `function`
    pub fn build(address: u8, function: u8) -> FrameBuilder {
        let mut buf = Vec::new();
        // Capacity is far above two bytes
        let _ = buf.extend_from_slice(&[address, function]);
        FrameBuilder { buf, overflow: false }
    }

    /// The address byte
    #[inline]
    pub fn address(&self) -> u8 {
        self.buf[0]
    }

    /// The raw function byte, exception bit included
    #[inline]
    pub fn function(&self) -> u8 {
        self.buf[1]
    }

    /// Does the function byte carry the exception bit?
    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function() & EXCEPTION_BIT != 0
    }

    /// Everything between the function byte and the checksum
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.buf[2..self.buf.len() - crc::CRC_LEN]
    }

    /// Big-endian `u16` at `offset` into the payload
    pub fn payload_u16(&self, offset: usize) -> Option<u16> {
        let p = self.payload();
        let hi = *p.get(offset)?;
        let lo = *p.get(offset + 1)?;
        Some(u16::from_be_bytes([hi, lo]))
    }

    /// Does the trailing checksum match the rest of the frame?
    #[inline]
    pub fn crc_ok(&self) -> bool {
        crc::verify_frame(&self.buf)
    }

    /// The whole frame, as sent on the wire
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Total length, checksum included
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Frames are never empty. Present for API symmetry with `len`.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl core::fmt::Debug for Frame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("Frame(")?;
        for (i, b) in self.buf.iter().enumerate() {
            if i != 0 {
                f.write_str(" ")?;
            }
            write!(f, "{:02X}", b)?;
        }
        f.write_str(")")
    }
}

#[cfg(feature = "defmt-logging")]
impl defmt::Format for Frame {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "Frame({=[u8]:X})", self.as_bytes())
    }
}

/// Appends fields to an outgoing frame, then seals it with a checksum
///
/// Pushing past [`MAX_ADU`] does not panic: the builder remembers, and
/// [`FrameBuilder::finish`] reports [`ErrorKind::Memory`].
pub struct FrameBuilder {
    buf: Vec<u8, MAX_ADU>,
    overflow: bool,
}

impl FrameBuilder {
    /// Append one byte
    pub fn byte(mut self, value: u8) -> Self {
        self.overflow |= self.buf.push(value).is_err();
        self
    }

    /// Append a big-endian `u16`
    pub fn word(self, value: u16) -> Self {
        let [hi, lo] = value.to_be_bytes();
        self.byte(hi).byte(lo)
    }

    /// Append raw bytes
    pub fn bytes(mut self, values: &[u8]) -> Self {
        self.overflow |= self.buf.extend_from_slice(values).is_err();
        self
    }

    /// Append the checksum, producing the finished frame
    pub fn finish(mut self) -> Result<Frame, ErrorKind> {
        let wire = crc::to_wire(crc::compute(&self.buf));
        self.overflow |= self.buf.extend_from_slice(&wire).is_err();
        if self.overflow {
            return Err(ErrorKind::Memory);
        }
        Ok(Frame { buf: self.buf })
    }
}
