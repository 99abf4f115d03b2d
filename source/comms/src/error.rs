//! Error kinds and Modbus exception codes
//!
//! Every failure the engine can observe is one [`ErrorKind`]. Each kind owns
//! one bit of the error register, so the register doubles as a "has this ever
//! happened" summary readable over the bus like any other holding register.

/// The kinds of failure the engine distinguishes
///
/// The discriminants are the internal codes. The three exception kinds sit
/// exactly three above their wire exception codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[repr(u8)]
pub enum ErrorKind {
    /// A generic out-of-range value
    Range = 3,
    /// Unsupported function, or a write touching a read-only register
    IllegalFunction = 4,
    /// Register span runs past the end of the table
    IllegalDataAddress = 5,
    /// Register count (or the data carrying it) is malformed
    IllegalDataValue = 6,
    /// A response came from someone other than the addressed device
    SlaveIdMismatch = 7,
    /// A response carried a different function code than requested
    FunctionMismatch = 8,
    /// Checksum did not match
    InvalidCrc = 9,
    /// The serial transport reported a fault, or a frame stalled mid-reception
    Transport = 10,
    /// A transmission did not complete in time
    TransmitTimeout = 11,
    /// No response arrived within the response interval
    ResponseTimeout = 12,
    /// A link reset could not restore a working configuration
    Fatal = 13,
    /// A request does not fit the internal buffers
    Memory = 14,
}

/// Largest value the error register may hold: one bit per [`ErrorKind`]
pub const ERROR_MASK_CEILING: u16 = (1 << ErrorKind::COUNT) - 1;

impl ErrorKind {
    const FIRST: u8 = ErrorKind::Range as u8;
    const COUNT: u8 = ErrorKind::Memory as u8 - Self::FIRST + 1;

    /// All kinds, in bit order
    pub const ALL: [ErrorKind; 12] = [
        ErrorKind::Range,
        ErrorKind::IllegalFunction,
        ErrorKind::IllegalDataAddress,
        ErrorKind::IllegalDataValue,
        ErrorKind::SlaveIdMismatch,
        ErrorKind::FunctionMismatch,
        ErrorKind::InvalidCrc,
        ErrorKind::Transport,
        ErrorKind::TransmitTimeout,
        ErrorKind::ResponseTimeout,
        ErrorKind::Fatal,
        ErrorKind::Memory,
    ];

    /// The internal code
    #[inline]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// The bit this kind occupies in the error register
    #[inline]
    pub const fn bit(self) -> u16 {
        1 << (self as u8 - Self::FIRST)
    }

    /// The matching exception, for the kinds that have one
    pub const fn exception(self) -> Option<Exception> {
        match self {
            ErrorKind::IllegalFunction => Some(Exception::IllegalFunction),
            ErrorKind::IllegalDataAddress => Some(Exception::IllegalDataAddress),
            ErrorKind::IllegalDataValue => Some(Exception::IllegalDataValue),
            _ => None,
        }
    }

    /// Every kind whose bit is set in `mask`
    pub fn decode_mask(mask: u16) -> impl Iterator<Item = ErrorKind> {
        Self::ALL.into_iter().filter(move |k| mask & k.bit() != 0)
    }
}

/// Exception codes this device sends and understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[repr(u8)]
pub enum Exception {
    /// Wire code 1
    IllegalFunction = 1,
    /// Wire code 2
    IllegalDataAddress = 2,
    /// Wire code 3
    IllegalDataValue = 3,
}

/// A wire exception code outside of the supported set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct UnknownException(pub u8);

impl Exception {
    /// The byte sent after the (high-bit-set) function code
    #[inline]
    pub const fn wire(self) -> u8 {
        self as u8
    }

    /// The [`ErrorKind`] recorded for this exception
    pub const fn kind(self) -> ErrorKind {
        match self {
            Exception::IllegalFunction => ErrorKind::IllegalFunction,
            Exception::IllegalDataAddress => ErrorKind::IllegalDataAddress,
            Exception::IllegalDataValue => ErrorKind::IllegalDataValue,
        }
    }
}

impl From<Exception> for ErrorKind {
    fn from(value: Exception) -> Self {
        value.kind()
    }
}

impl TryFrom<u8> for Exception {
    type Error = UnknownException;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Exception::IllegalFunction),
            2 => Ok(Exception::IllegalDataAddress),
            3 => Ok(Exception::IllegalDataValue),
            other => Err(UnknownException(other)),
        }
    }
}
