//! Line speed codes and baud renegotiation
//!
//! The bus master changes our line speed by writing a code into the
//! [`RegisterId::BaudRate`] register. The new speed is only applied once the
//! acknowledgement for that write has left at the old speed.

use crate::{
    error::ErrorKind,
    link::Link,
    registers::{HoldingRegisters, RegisterId},
    LineConfig, LinkCfg,
};

/// Supported line speeds, by register code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[repr(u16)]
pub enum BaudRate {
    /// Code 1
    B2400 = 1,
    /// Code 2
    B4800 = 2,
    /// Code 3
    B9600 = 3,
    /// Code 4
    B19200 = 4,
    /// Code 5
    B38400 = 5,
    /// Code 6
    B57600 = 6,
    /// Code 7
    B115200 = 7,
    /// Code 8
    B128000 = 8,
    /// Code 9
    B256000 = 9,
}

impl BaudRate {
    /// Used at startup and whenever an unsupported code shows up
    pub const DEFAULT: BaudRate = BaudRate::B9600;
    /// Lowest supported code
    pub const MIN_CODE: u16 = BaudRate::B2400 as u16;
    /// Highest supported code
    pub const MAX_CODE: u16 = BaudRate::B256000 as u16;

    /// The register code
    #[inline]
    pub const fn code(self) -> u16 {
        self as u16
    }

    /// The line rate in bits per second
    pub const fn bits_per_second(self) -> u32 {
        match self {
            BaudRate::B2400 => 2400,
            BaudRate::B4800 => 4800,
            BaudRate::B9600 => 9600,
            BaudRate::B19200 => 19200,
            BaudRate::B38400 => 38400,
            BaudRate::B57600 => 57600,
            BaudRate::B115200 => 115_200,
            BaudRate::B128000 => 128_000,
            BaudRate::B256000 => 256_000,
        }
    }

    /// Decode a register code
    pub const fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            1 => BaudRate::B2400,
            2 => BaudRate::B4800,
            3 => BaudRate::B9600,
            4 => BaudRate::B19200,
            5 => BaudRate::B38400,
            6 => BaudRate::B57600,
            7 => BaudRate::B115200,
            8 => BaudRate::B128000,
            9 => BaudRate::B256000,
            _ => return None,
        })
    }
}

/// Apply the line speed currently held in the baud register
///
/// An unsupported code puts the register (and the line) back on
/// [`BaudRate::DEFAULT`], still reconfigures, and reports
/// [`ErrorKind::Range`]. The link is fully reset either way, so reception
/// is re-armed at the new speed. A reset that fails is [`ErrorKind::Fatal`].
pub fn renegotiate<Cfg, const N: usize>(
    link: &mut Link<'_, Cfg, N>,
    registers: &mut HoldingRegisters,
) -> Result<(), ErrorKind>
where
    Cfg: LinkCfg,
{
    let (baud, outcome) = line_for(registers.read(RegisterId::BaudRate));
    if outcome.is_err() {
        registers.write(RegisterId::BaudRate, baud.code());
    }

    mb_info!("switching line to {} bps", baud.bits_per_second());
    link.set_line(LineConfig { baud });
    link.reset()?;
    outcome
}

/// The line speed for `code`, or the default and [`ErrorKind::Range`]
///
/// The baud register clamps every write into the table, so only a code that
/// bypassed [`HoldingRegisters`] takes the fallback.
fn line_for(code: u16) -> (BaudRate, Result<(), ErrorKind>) {
    match BaudRate::from_code(code) {
        Some(baud) => (baud, Ok(())),
        None => {
            mb_warn!("unsupported baud code {}, falling back", code);
            (BaudRate::DEFAULT, Err(ErrorKind::Range))
        }
    }
}
