//! Target interface
//!
//! This interface is used when operating as a Target: the responder that owns
//! the holding registers and answers whatever the Controller asks.
//!
//! There is no task to spawn. The application's main loop calls
//! [`Target::poll`] once per tick, and acts on the returned [`Event`], for
//! example by feeding its watchdog whenever it has been addressed.

use embassy_time::Instant;

use crate::{
    baud::{self, BaudRate},
    dispatch::{self, Outcome},
    error::ErrorKind,
    frame::{Frame, FunctionCode, DISCOVERY_ADDRESS},
    link::{Health, Link},
    reassembler::RING_SIZE,
    registers::{HoldingRegisters, RegisterId},
    LineConfig, LinkCfg,
};

/// What happened during one [`Target::poll`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum Event {
    /// Nothing to do
    Idle,
    /// Our last reply is still going out
    Busy,
    /// A request for our address was handled and a reply sent
    Addressed,
    /// A discovery request was answered
    Discovery,
    /// A frame for someone else went by
    Ignored,
    /// The line now runs at a new speed
    Renegotiated(BaudRate),
    /// Something went wrong. Already recorded in the error register.
    Fault(ErrorKind),
}

impl Event {
    /// Was this an exchange with the Controller?
    pub fn is_exchange(&self) -> bool {
        matches!(self, Event::Addressed | Event::Discovery)
    }
}

/// The responder
pub struct Target<'a, Cfg: LinkCfg, const N: usize = RING_SIZE> {
    link: Link<'a, Cfg, N>,
    registers: HoldingRegisters,
    retries_left: u8,
    renegotiate: bool,
}

impl<'a, Cfg: LinkCfg, const N: usize> Target<'a, Cfg, N> {
    /// Create a new [Target]
    pub fn new(link: Link<'a, Cfg, N>, registers: HoldingRegisters) -> Self {
        Self {
            link,
            registers,
            retries_left: 0,
            renegotiate: false,
        }
    }

    /// Bring the link up at the line speed held in the baud register
    pub fn start(&mut self) -> Result<(), ErrorKind> {
        let code = self.registers.read(RegisterId::BaudRate);
        let baud = BaudRate::from_code(code).unwrap_or(BaudRate::DEFAULT);
        self.link.set_line(LineConfig { baud });
        self.link.start().map_err(|_| {
            self.registers.record_error(ErrorKind::Transport);
            ErrorKind::Transport
        })
    }

    /// Do one tick worth of work
    ///
    /// Returns `Err(ErrorKind::Fatal)` if the link could not be reset. By
    /// then it has been brought back up by [`Link::reset_until_ok`].
    pub fn poll(&mut self, now: Instant) -> Result<Event, ErrorKind> {
        match self.link.monitor(now, self.registers.transmit_timeout()) {
            Health::Idle => {}
            Health::Busy => return Ok(Event::Busy),
            Health::Fault(ErrorKind::TransmitTimeout) => return Ok(self.transmit_timed_out(now)),
            Health::Fault(kind) => return self.fault(kind),
        }

        if self.renegotiate {
            self.renegotiate = false;
            return match baud::renegotiate(&mut self.link, &mut self.registers) {
                Ok(()) => Ok(Event::Renegotiated(self.link.line().baud)),
                Err(kind) => self.fault(kind),
            };
        }

        match self.link.take_frame() {
            Some(frame) => Ok(self.respond(&frame, now)),
            None => Ok(Event::Idle),
        }
    }

    fn respond(&mut self, request: &Frame, now: Instant) -> Event {
        if !request.crc_ok() {
            mb_debug!("dropping {}: bad crc", request);
            self.registers.record_error(ErrorKind::InvalidCrc);
            return Event::Fault(ErrorKind::InvalidCrc);
        }

        let event = if request.address() == self.registers.device_address() {
            Event::Addressed
        } else if is_discovery(request) {
            Event::Discovery
        } else {
            return Event::Ignored;
        };
        mb_trace!("rx {}", request);

        let reply = match dispatch::handle(request, &mut self.registers) {
            Outcome::Response { frame, renegotiate } => {
                self.renegotiate |= renegotiate;
                frame
            }
            Outcome::Exception { frame, exception } => {
                self.registers.record_error(exception.kind());
                frame
            }
            Outcome::Error(kind) => {
                self.registers.record_error(kind);
                return Event::Fault(kind);
            }
        };

        self.retries_left = self.registers.transmit_retries();
        match self.link.send(reply, now) {
            Ok(()) => event,
            Err(e) => {
                let kind = e.kind().unwrap_or(ErrorKind::Transport);
                self.registers.record_error(kind);
                Event::Fault(kind)
            }
        }
    }

    fn transmit_timed_out(&mut self, now: Instant) -> Event {
        self.registers.record_error(ErrorKind::TransmitTimeout);
        if self.retries_left == 0 {
            self.link.abandon_transmit();
            return Event::Fault(ErrorKind::TransmitTimeout);
        }

        self.retries_left -= 1;
        mb_warn!("tx timeout, retrying ({} left)", self.retries_left);
        if self.link.retransmit(now).is_err() {
            self.registers.record_error(ErrorKind::Transport);
        }
        Event::Fault(ErrorKind::TransmitTimeout)
    }

    fn fault(&mut self, kind: ErrorKind) -> Result<Event, ErrorKind> {
        self.registers.record_error(kind);
        if kind == ErrorKind::Fatal {
            self.link.reset_until_ok();
            return Err(kind);
        }
        Ok(Event::Fault(kind))
    }

    /// Current value of register `id`
    pub fn register(&self, id: RegisterId) -> u16 {
        self.registers.read(id)
    }

    /// Store into register `id`, clamped
    ///
    /// Unlike the bus, the application may write read-only registers.
    pub fn set_register(&mut self, id: RegisterId, value: u16) -> u16 {
        self.registers.write(id, value)
    }

    /// The register table
    pub fn registers(&self) -> &HoldingRegisters {
        &self.registers
    }

    /// The register table, mutably
    pub fn registers_mut(&mut self) -> &mut HoldingRegisters {
        &mut self.registers
    }

    /// The link
    pub fn link(&self) -> &Link<'a, Cfg, N> {
        &self.link
    }

    /// The link, mutably
    pub fn link_mut(&mut self) -> &mut Link<'a, Cfg, N> {
        &mut self.link
    }
}

/// A read of exactly register 0 sent to [`DISCOVERY_ADDRESS`]
fn is_discovery(request: &Frame) -> bool {
    request.address() == DISCOVERY_ADDRESS
        && request.function() == u8::from(FunctionCode::ReadHoldingRegisters)
        && request.payload_u16(0) == Some(RegisterId::DeviceAddress.index() as u16)
        && request.payload_u16(2) == Some(1)
}
