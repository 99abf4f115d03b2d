//! Controller Interface
//!
//! The Controller is responsible for running the bus. It sends one request at
//! a time and supervises the Target's response:
//!
//! 1. [`Controller::read_holding_registers`] or
//!    [`Controller::write_multiple_registers`] builds the request, hands it to
//!    the link and remembers it as the [`PendingRequest`].
//! 2. Every tick, [`Controller::poll`] checks the link, and either takes the
//!    response and checks it against the pending request, or gives up once
//!    the response interval has passed.
//!
//! Only one request may be pending at a time. Values to write are staged with
//! [`Controller::set_transmit_value`]; values read back are available through
//! [`Controller::response_value`].

use embassy_time::{Duration, Instant};

use crate::{
    crc::CRC_LEN,
    dispatch::MAX_REGISTER_COUNT,
    error::{ErrorKind, Exception},
    frame::{Frame, FunctionCode, EXCEPTION_BIT, HEADER_LEN},
    link::{elapsed, Health, Link, LinkError},
    reassembler::RING_SIZE,
    Error, LinkCfg,
};

/// Time that a Controller will wait for a Target to respond, by default
pub const DEFAULT_RESPONSE_INTERVAL: Duration = Duration::from_millis(1000);

/// Time a request may take to leave the wire, by default
pub const DEFAULT_TRANSMIT_TIMEOUT: Duration = Duration::from_millis(1000);

/// How often a late request is sent again, by default
pub const DEFAULT_TRANSMIT_RETRIES: u8 = 2;

/// Registers that fit in the staging and response buffers
pub const RESPONSE_CAPACITY: usize = MAX_REGISTER_COUNT as usize;

/// Address, function, byte count, checksum
const READ_RESPONSE_OVERHEAD: usize = 3 + CRC_LEN;

/// Address, function, start, count, checksum
const WRITE_RESPONSE_LEN: usize = HEADER_LEN + CRC_LEN;

/// Should responses have their checksum verified?
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum CrcPolicy {
    /// Reject responses with a bad checksum
    #[default]
    Verify,
    /// Accept whatever arrives
    Skip,
}

/// The request awaiting a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct PendingRequest {
    /// The addressed Target
    pub target: u8,
    /// What was asked
    pub function: FunctionCode,
    /// How many registers
    pub quantity: u16,
    /// Full length of a successful response
    pub expected_len: usize,
    /// When the request was handed to the link
    pub issued: Instant,
}

/// Result of one [`Controller::poll`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum Status {
    /// No request pending
    Idle,
    /// Still waiting for a response
    Waiting,
    /// A valid response to the pending request arrived
    Response(FunctionCode),
    /// The pending request failed, and has been dropped
    Failed(ErrorKind),
}

/// The initiator
pub struct Controller<'a, Cfg: LinkCfg, const N: usize = RING_SIZE> {
    link: Link<'a, Cfg, N>,
    pending: Option<PendingRequest>,
    transmit_buf: [u16; RESPONSE_CAPACITY],
    response_buf: [u16; RESPONSE_CAPACITY],
    response_len: usize,
    response_interval: Duration,
    transmit_timeout: Duration,
    transmit_retries: u8,
    retries_left: u8,
    crc: CrcPolicy,
    received: bool,
}

impl<'a, Cfg: LinkCfg, const N: usize> Controller<'a, Cfg, N> {
    /// Create a new [Controller]
    pub fn new(link: Link<'a, Cfg, N>) -> Self {
        Self {
            link,
            pending: None,
            transmit_buf: [0; RESPONSE_CAPACITY],
            response_buf: [0; RESPONSE_CAPACITY],
            response_len: 0,
            response_interval: DEFAULT_RESPONSE_INTERVAL,
            transmit_timeout: DEFAULT_TRANSMIT_TIMEOUT,
            transmit_retries: DEFAULT_TRANSMIT_RETRIES,
            retries_left: 0,
            crc: CrcPolicy::default(),
            received: false,
        }
    }

    /// Ask `target` for `quantity` registers starting at `start`
    ///
    /// Fails with [`ErrorKind::Memory`] if the values would not fit the
    /// response buffer, and with [`Error::Busy`] while another request is
    /// pending.
    pub fn read_holding_registers(
        &mut self,
        target: u8,
        start: u16,
        quantity: u16,
        now: Instant,
    ) -> Result<(), LinkError<Cfg>> {
        self.check_quantity(quantity)?;
        let frame = Frame::build(target, FunctionCode::ReadHoldingRegisters.into())
            .word(start)
            .word(quantity)
            .finish()?;
        let expected_len = READ_RESPONSE_OVERHEAD + usize::from(quantity) * 2;
        self.issue(frame, FunctionCode::ReadHoldingRegisters, quantity, expected_len, now)
    }

    /// Write the first `quantity` staged values to `target`, starting at `start`
    ///
    /// See [`Controller::set_transmit_value`].
    pub fn write_multiple_registers(
        &mut self,
        target: u8,
        start: u16,
        quantity: u16,
        now: Instant,
    ) -> Result<(), LinkError<Cfg>> {
        self.check_quantity(quantity)?;
        let mut builder = Frame::build(target, FunctionCode::WriteMultipleRegisters.into())
            .word(start)
            .word(quantity)
            .byte((quantity * 2) as u8);
        for value in &self.transmit_buf[..usize::from(quantity)] {
            builder = builder.word(*value);
        }
        // More than fits a frame shows up as Memory here
        let frame = builder.finish()?;
        self.issue(frame, FunctionCode::WriteMultipleRegisters, quantity, WRITE_RESPONSE_LEN, now)
    }

    fn check_quantity(&self, quantity: u16) -> Result<(), LinkError<Cfg>> {
        if self.pending.is_some() {
            return Err(Error::Busy);
        }
        match usize::from(quantity) {
            0 => Err(ErrorKind::Range.into()),
            q if q > RESPONSE_CAPACITY => Err(ErrorKind::Memory.into()),
            _ => Ok(()),
        }
    }

    fn issue(
        &mut self,
        frame: Frame,
        function: FunctionCode,
        quantity: u16,
        expected_len: usize,
        now: Instant,
    ) -> Result<(), LinkError<Cfg>> {
        let target = frame.address();
        self.drain_unsolicited();
        self.link.expect_response(Some(expected_len));
        if let Err(e) = self.link.send(frame, now) {
            self.link.expect_response(None);
            return Err(e);
        }
        self.retries_left = self.transmit_retries;
        self.pending = Some(PendingRequest {
            target,
            function,
            quantity,
            expected_len,
            issued: now,
        });
        Ok(())
    }

    /// Do one tick worth of work
    pub fn poll(&mut self, now: Instant) -> Status {
        match self.link.monitor(now, self.transmit_timeout) {
            Health::Idle | Health::Busy => {}
            Health::Fault(ErrorKind::TransmitTimeout) if self.retries_left > 0 => {
                self.retries_left -= 1;
                mb_warn!("tx timeout, retrying ({} left)", self.retries_left);
                // The response window starts over with the new attempt
                if let Some(pending) = self.pending.as_mut() {
                    pending.issued = now;
                }
                return match self.link.retransmit(now) {
                    Ok(()) => Status::Waiting,
                    Err(_) => self.fail(ErrorKind::Transport),
                };
            }
            Health::Fault(kind) => {
                self.link.abandon_transmit();
                return self.fail(kind);
            }
        }

        let Some(pending) = self.pending else {
            self.drain_unsolicited();
            return Status::Idle;
        };

        if let Some(frame) = self.link.take_frame() {
            self.clear_pending();
            return match self.check_integrity(&pending, &frame) {
                Ok(()) => {
                    self.store(&pending, &frame);
                    self.received = true;
                    Status::Response(pending.function)
                }
                Err(kind) => {
                    mb_debug!("bad response {}: {}", frame, kind);
                    Status::Failed(kind)
                }
            };
        }

        if elapsed(now, pending.issued) > self.response_interval {
            mb_debug!("no response from {=u8}", pending.target);
            return self.fail(ErrorKind::ResponseTimeout);
        }
        Status::Waiting
    }

    /// Check `frame` against what `pending` asked for
    ///
    /// Address first, then function, then an embedded exception, then the
    /// checksum (unless [`CrcPolicy::Skip`]).
    pub fn check_integrity(&self, pending: &PendingRequest, frame: &Frame) -> Result<(), ErrorKind> {
        if frame.address() != pending.target {
            return Err(ErrorKind::SlaveIdMismatch);
        }
        if frame.function() & !EXCEPTION_BIT != u8::from(pending.function) {
            return Err(ErrorKind::FunctionMismatch);
        }
        if frame.is_exception() {
            let code = frame.payload().first().copied().unwrap_or(0);
            return Err(match Exception::try_from(code) {
                Ok(exception) => exception.kind(),
                Err(_unknown) => {
                    mb_warn!("unknown exception code {=u8}", _unknown.0);
                    ErrorKind::IllegalFunction
                }
            });
        }
        if self.crc == CrcPolicy::Verify && !frame.crc_ok() {
            return Err(ErrorKind::InvalidCrc);
        }
        if pending.function == FunctionCode::ReadHoldingRegisters {
            let byte_count = usize::from(pending.quantity) * 2;
            let payload = frame.payload();
            if payload.first().copied().map(usize::from) != Some(byte_count)
                || payload.len() != byte_count + 1
            {
                return Err(ErrorKind::IllegalDataValue);
            }
        }
        Ok(())
    }

    fn store(&mut self, pending: &PendingRequest, frame: &Frame) {
        if pending.function != FunctionCode::ReadHoldingRegisters {
            return;
        }
        let count = usize::from(pending.quantity);
        for (i, slot) in self.response_buf[..count].iter_mut().enumerate() {
            *slot = frame.payload_u16(1 + i * 2).unwrap_or(0);
        }
        self.response_len = count;
    }

    fn fail(&mut self, kind: ErrorKind) -> Status {
        if self.pending.is_none() {
            return match kind {
                // Nothing was waiting on the link, but the fault is still news
                ErrorKind::Transport | ErrorKind::Fatal | ErrorKind::Memory => Status::Failed(kind),
                _ => Status::Idle,
            };
        }
        self.clear_pending();
        Status::Failed(kind)
    }

    fn clear_pending(&mut self) {
        self.pending = None;
        self.link.expect_response(None);
    }

    fn drain_unsolicited(&mut self) {
        while let Some(_frame) = self.link.take_frame() {
            mb_trace!("unsolicited {}", _frame);
        }
    }

    /// Stage `value` at `index` for the next write request
    pub fn set_transmit_value(&mut self, index: usize, value: u16) -> Result<(), ErrorKind> {
        let slot = self.transmit_buf.get_mut(index).ok_or(ErrorKind::Range)?;
        *slot = value;
        Ok(())
    }

    /// Value `index` of the last successful read, if it was that long
    pub fn response_value(&self, index: usize) -> Option<u16> {
        self.response_values().get(index).copied()
    }

    /// Every value of the last successful read
    pub fn response_values(&self) -> &[u16] {
        &self.response_buf[..self.response_len]
    }

    /// Has a valid response arrived since the last call?
    pub fn response_received(&mut self) -> bool {
        core::mem::take(&mut self.received)
    }

    /// The request awaiting a response, if any
    pub fn pending(&self) -> Option<&PendingRequest> {
        self.pending.as_ref()
    }

    /// How long to wait for a response
    pub fn response_interval(&self) -> Duration {
        self.response_interval
    }

    /// Change how long to wait for a response
    pub fn set_response_interval(&mut self, interval: Duration) {
        self.response_interval = interval;
    }

    /// Change how long a request may take to leave the wire
    pub fn set_transmit_timeout(&mut self, timeout: Duration) {
        self.transmit_timeout = timeout;
    }

    /// Change how often a late request is sent again
    pub fn set_transmit_retries(&mut self, retries: u8) {
        self.transmit_retries = retries;
    }

    /// Change whether response checksums are verified
    pub fn set_crc_policy(&mut self, policy: CrcPolicy) {
        self.crc = policy;
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
