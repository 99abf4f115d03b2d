//! # Relaybox Comms
//!
//! This is the Modbus RTU engine of the relaybox project. It's intended to be
//! used on a half-duplex RS-485 bus, on bare metal devices with a single
//! cooperative main loop plus interrupt handlers.
//!
//! Only two function codes are spoken: Read Holding Registers (`0x03`) and
//! Write Multiple Registers (`0x10`).
//!
//! ## Entities
//!
//! There are two roles on the bus:
//!
//! 1. The Controller (the Modbus "master"), which sends requests and
//!    supervises the responses. See [`Controller`].
//! 2. The Target (the Modbus "slave"), which owns a small table of holding
//!    registers and answers requests for its address. See [`Target`].
//!
//! Both roles share the same lower layers, and either may be used by a given
//! firmware. There must always be exactly one Controller on any bus.
//!
//! ## Message Framing
//!
//! RTU frames carry no length prefix and no delimiter:
//!
//! ```text
//! [address:1][function:1][payload:0..=252][crcLo:1][crcHi:1]
//! ```
//!
//! The serial hardware delivers received bytes in arbitrary chunks, from its
//! interrupt context. The [`reassembler`] puts them back together in two
//! phases: first the fixed six byte header, from which a bound on the rest is
//! derived, then the remainder, up to that bound or until the line goes idle.
//! Storage is a ring, so frames may straddle
//! its end. A partial frame that goes quiet for longer than
//! [`LinkCfg::STALL_THRESHOLD`] is a "chunk miss": it is dropped and the link
//! is reset.
//!
//! Every frame ends in a CRC-16/Modbus checksum, see [`crc`].
//!
//! ## Main loop
//!
//! Nothing in this crate blocks, waits, or reads the clock on its own. The
//! application passes the current [`Instant`] into every call that needs it,
//! and calls [`Target::poll`] (or [`Controller::poll`]) once per tick. Each
//! poll:
//!
//! 1. Checks link health: chunk misses, transport errors and transmit
//!    timeouts, resetting the link where needed.
//! 2. Takes at most one complete frame and handles it.
//!
//! The only exception is recovering from a failed link reset, which retries
//! in a loop until the transport accepts its configuration again.
//!
//! ## Errors
//!
//! Every failure is one [`ErrorKind`]. On a Target, each kind also sets its
//! own bit in the [`RegisterId::Errors`] holding register, so the Controller
//! can read back a summary of everything that has gone wrong since the
//! register was last cleared.
//!
//! ## Line speed
//!
//! The Controller changes a Target's line speed by writing a code into the
//! [`RegisterId::BaudRate`] register. The acknowledgement goes out at the old
//! speed, after which the Target switches over (see [`baud`]).

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![warn(missing_docs)]

#[macro_use]
mod macros;

pub mod baud;
pub mod controller;
pub mod crc;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod link;
pub mod reassembler;
pub mod registers;
pub mod ring;
#[cfg(feature = "snapshot")]
pub mod snapshot;
pub mod target;

use embassy_time::Duration;

pub use crate::{
    baud::BaudRate,
    controller::Controller,
    error::{ErrorKind, Exception},
    frame::Frame,
    link::{Link, LinkShared},
    registers::{HoldingRegisters, RegisterId},
    target::Target,
};
pub use embassy_time::Instant;

/// An error type for [`Link`], [`Target`] and [`Controller`] operations
#[derive(Debug, PartialEq)]
#[non_exhaustive]
pub enum Error<E> {
    /// Some error with the underlying hardware serial port
    Serial(E),
    /// A protocol level failure
    Protocol(ErrorKind),
    /// The link is still busy with an earlier transmission or request
    Busy,
}

impl<E> Error<E> {
    /// The [`ErrorKind`] to record for this error, if any
    ///
    /// [`Error::Busy`] is not a failure, only a request to come back later.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::Serial(_) => Some(ErrorKind::Transport),
            Error::Protocol(kind) => Some(*kind),
            Error::Busy => None,
        }
    }
}

impl<E> From<ErrorKind> for Error<E> {
    fn from(value: ErrorKind) -> Self {
        Self::Protocol(value)
    }
}

/// Serial line settings
///
/// The link remembers the last settings it was given, and re-applies them on
/// every reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct LineConfig {
    /// Line speed
    pub baud: BaudRate,
}

impl LineConfig {
    /// The settings used before anything else is known
    pub const DEFAULT: LineConfig = LineConfig {
        baud: BaudRate::DEFAULT,
    };
}

impl Default for LineConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// A trait representing the half-duplex serial port the bus is attached to
///
/// None of these methods may block. Completion is reported back through the
/// [`LinkShared`] notifications instead.
pub trait Transport {
    /// The error type of the underlying serial port
    type Error;

    /// Start sending `data`
    ///
    /// This function is responsible for activating the "send mode" of the
    /// transceiver (e.g. asserting DE), and for disabling it again once the
    /// data is out, at which point [`LinkShared::on_transmit_complete`] must
    /// be called.
    fn transmit(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    /// Start receiving up to `max_len` bytes, or until the line goes idle
    ///
    /// Whatever arrives is handed to [`LinkShared::on_chunk`], flagged as
    /// idle unless reception stopped because `max_len` was reached.
    fn receive_until_idle(&mut self, max_len: usize) -> Result<(), Self::Error>;

    /// Stop any transfer in progress, in either direction
    fn abort(&mut self) -> Result<(), Self::Error>;

    /// De-initialise the port and bring it back up with `config`
    fn reset(&mut self, config: &LineConfig) -> Result<(), Self::Error>;
}

/// Metadata trait to contain relevant generics
pub trait LinkCfg {
    /// Serial interface type
    type Transport: Transport;

    /// How long a partially received frame may go quiet before it is dropped
    const STALL_THRESHOLD: Duration = reassembler::STALL_THRESHOLD;

    /// Line settings used until told otherwise
    const INITIAL_LINE: LineConfig = LineConfig::DEFAULT;

    /// Failed resets between two log messages while recovering the link
    const RESET_ATTEMPTS_BEFORE_LOG: u32 = 16;
}
