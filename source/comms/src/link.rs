//! The serial link
//!
//! Split in two halves, the same way reception storage is:
//!
//! * [`LinkShared`] lives in a `static` and is handed to the transport's
//!   interrupt handlers. It only ever sees `&self`.
//! * [`Link`] is owned by the main loop. It holds the transport, the line
//!   configuration last known to work, and the transmission in flight.
//!
//! The main loop calls [`Link::monitor`] once per tick. That is where chunk
//! misses, transport errors and transmit timeouts are noticed, and where the
//! link is reset when it needs to be.

use core::sync::atomic::{AtomicBool, Ordering};

use embassy_time::{Duration, Instant};

use crate::{
    error::ErrorKind,
    frame::Frame,
    reassembler::{Reassembler, RxRequest, Stall, RING_SIZE},
    Error, LineConfig, LinkCfg, Transport,
};

/// Errors returned by [`Link`] operations for a given configuration
pub type LinkError<Cfg> = Error<<<Cfg as LinkCfg>::Transport as Transport>::Error>;

/// State written by the transport's interrupt handlers
///
/// Intended for static usage. The interrupt glue is expected to:
///
/// * call [`LinkShared::on_chunk`] with every chunk received, saying whether
///   it ended on an idle line, then re-arm reception for the returned
///   [`RxRequest`]
/// * call [`LinkShared::on_transmit_complete`] once a transmission has fully
///   left the wire
/// * call [`LinkShared::on_error`] on any framing, parity, overrun or DMA fault
pub struct LinkShared<const N: usize = RING_SIZE> {
    rx: Reassembler<N>,
    tx_done: AtomicBool,
    error: AtomicBool,
}

impl<const N: usize> LinkShared<N> {
    /// Create the shared half of a link
    pub const fn new() -> Self {
        Self {
            rx: Reassembler::new(),
            tx_done: AtomicBool::new(false),
            error: AtomicBool::new(false),
        }
    }

    /// Bytes arrived, see [`Reassembler::on_chunk`]
    pub fn on_chunk(&self, bytes: &[u8], idle: bool, now: Instant) -> RxRequest {
        self.rx.on_chunk(bytes, idle, now)
    }

    /// The last transmission completed
    pub fn on_transmit_complete(&self) {
        self.tx_done.store(true, Ordering::Release);
    }

    /// The transport reported a fault
    pub fn on_error(&self) {
        self.error.store(true, Ordering::Release);
    }

    /// The reception state
    pub fn reassembler(&self) -> &Reassembler<N> {
        &self.rx
    }

    fn take_error(&self) -> bool {
        critical_section::with(|_| {
            let old = self.error.load(Ordering::Acquire);
            self.error.store(false, Ordering::Release);
            old
        })
    }
}

impl<const N: usize> Default for LinkShared<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of one [`Link::monitor`] pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum Health {
    /// Nothing in flight
    Idle,
    /// A transmission is still in flight, within its timeout
    Busy,
    /// Something went wrong
    ///
    /// * [`ErrorKind::Transport`]: a chunk miss or a transport error; the link
    ///   has already been reset
    /// * [`ErrorKind::Fatal`]: the reset above failed
    /// * [`ErrorKind::Memory`]: received bytes were dropped
    /// * [`ErrorKind::TransmitTimeout`]: the transmission in flight is late;
    ///   see [`Link::retransmit`] and [`Link::abandon_transmit`]
    Fault(ErrorKind),
}

struct InFlight {
    frame: Frame,
    started: Instant,
}

/// The main loop's half of a link
pub struct Link<'a, Cfg: LinkCfg, const N: usize = RING_SIZE> {
    shared: &'a LinkShared<N>,
    transport: Cfg::Transport,
    line: LineConfig,
    tx: Option<InFlight>,
}

impl<'a, Cfg: LinkCfg, const N: usize> Link<'a, Cfg, N> {
    /// Create a link. Nothing is touched until [`Link::start`].
    pub fn new(shared: &'a LinkShared<N>, transport: Cfg::Transport) -> Self {
        Self {
            shared,
            transport,
            line: Cfg::INITIAL_LINE,
            tx: None,
        }
    }

    /// Configure the transport with the current line settings and start receiving
    pub fn start(&mut self) -> Result<(), LinkError<Cfg>> {
        mb_info!("link start at {} bps", self.line.baud.bits_per_second());
        self.shared.rx.reset();
        self.transport.reset(&self.line).map_err(Error::Serial)?;
        self.arm_rx()
    }

    /// Stop receiving and forget anything in flight
    ///
    /// The transport is left idle until the next [`Link::start`].
    pub fn shutdown(&mut self) -> Result<(), LinkError<Cfg>> {
        mb_info!("link shutdown");
        self.tx = None;
        let res = self.transport.abort().map_err(Error::Serial);
        self.shared.rx.reset();
        res
    }

    /// Hand a frame to the transport
    ///
    /// Only one transmission may be in flight at a time. A transport failure
    /// also flags the link for a reset on the next [`Link::monitor`].
    pub fn send(&mut self, frame: Frame, now: Instant) -> Result<(), LinkError<Cfg>> {
        if self.tx.is_some() {
            return Err(Error::Busy);
        }
        self.shared.tx_done.store(false, Ordering::Release);
        if let Err(e) = self.transport.transmit(frame.as_bytes()) {
            mb_warn!("transmit refused");
            self.shared.on_error();
            return Err(Error::Serial(e));
        }
        mb_trace!("tx {}", frame);
        self.tx = Some(InFlight { frame, started: now });
        Ok(())
    }

    /// Send the transmission in flight again, restarting its timeout
    ///
    /// Does nothing if nothing is in flight.
    pub fn retransmit(&mut self, now: Instant) -> Result<(), LinkError<Cfg>> {
        let Some(flight) = self.tx.as_mut() else {
            return Ok(());
        };
        if self.transport.abort().is_err() {
            mb_warn!("abort before retransmit failed");
        }
        self.shared.tx_done.store(false, Ordering::Release);
        flight.started = now;
        let res = self
            .transport
            .transmit(flight.frame.as_bytes())
            .map_err(Error::Serial);
        if res.is_err() {
            self.shared.on_error();
        }
        // The abort above also stopped reception
        let rearm = self.arm_rx();
        res.and(rearm)
    }

    /// Give up on the transmission in flight
    pub fn abandon_transmit(&mut self) {
        if self.tx.take().is_some() {
            mb_warn!("transmission abandoned");
        }
    }

    /// Is a transmission still in flight?
    pub fn tx_pending(&self) -> bool {
        self.tx.is_some()
    }

    /// Take the oldest completed frame, if any
    pub fn take_frame(&self) -> Option<Frame> {
        self.shared.rx.take_frame()
    }

    /// See [`Reassembler::expect_response`]
    pub fn expect_response(&self, len: Option<usize>) {
        self.shared.rx.expect_response(len)
    }

    /// Check the link's health, resetting it if needed
    pub fn monitor(&mut self, now: Instant, tx_timeout: Duration) -> Health {
        if self.shared.rx.poll_stall(now, Cfg::STALL_THRESHOLD) == Stall::Stalled {
            mb_warn!("chunk miss, resetting link");
            return self.reset_after_fault();
        }
        if self.shared.take_error() {
            mb_warn!("transport error, resetting link");
            return self.reset_after_fault();
        }
        if let Some(kind) = self.shared.rx.take_fault() {
            mb_warn!("rx bytes dropped");
            return Health::Fault(kind);
        }

        let Some(started) = self.tx.as_ref().map(|f| f.started) else {
            return Health::Idle;
        };
        if self.shared.tx_done.load(Ordering::Acquire) {
            self.tx = None;
            Health::Idle
        } else if elapsed(now, started) > tx_timeout {
            Health::Fault(ErrorKind::TransmitTimeout)
        } else {
            Health::Busy
        }
    }

    /// Fully reset the link with the current line settings
    ///
    /// Aborts whatever the transport is doing, drops any partial reception
    /// and the transmission in flight, re-initialises the transport and
    /// re-arms reception. A transport that refuses is [`ErrorKind::Fatal`].
    pub fn reset(&mut self) -> Result<(), ErrorKind> {
        self.tx = None;
        if self.transport.abort().is_err() {
            mb_warn!("abort failed during reset");
        }
        self.shared.rx.reset();
        if self.transport.reset(&self.line).is_err() {
            mb_error!("transport reset failed");
            return Err(ErrorKind::Fatal);
        }
        // The abort may itself have raised an error notification
        self.shared.take_error();
        self.shared.tx_done.store(false, Ordering::Release);
        self.arm_rx().map_err(|_| ErrorKind::Fatal)
    }

    /// Reset until the transport accepts, however long that takes
    pub fn reset_until_ok(&mut self) {
        let log_every = Cfg::RESET_ATTEMPTS_BEFORE_LOG.max(1);
        let mut attempts: u32 = 0;
        while self.reset().is_err() {
            attempts = attempts.wrapping_add(1);
            if attempts % log_every == 0 {
                mb_error!("link still down after {} resets", attempts);
            }
        }
        mb_info!("link recovered");
    }

    /// The line settings in use
    pub fn line(&self) -> LineConfig {
        self.line
    }

    /// Replace the line settings. Applied by the next [`Link::reset`].
    pub fn set_line(&mut self, line: LineConfig) {
        self.line = line;
    }

    /// The transport
    pub fn transport(&self) -> &Cfg::Transport {
        &self.transport
    }

    /// The transport, mutably
    pub fn transport_mut(&mut self) -> &mut Cfg::Transport {
        &mut self.transport
    }

    /// The shared half
    pub fn shared(&self) -> &'a LinkShared<N> {
        self.shared
    }

    fn arm_rx(&mut self) -> Result<(), LinkError<Cfg>> {
        let RxRequest { max_len } = self.shared.rx.next_request();
        self.transport
            .receive_until_idle(max_len)
            .map_err(Error::Serial)
    }

    fn reset_after_fault(&mut self) -> Health {
        match self.reset() {
            Ok(()) => Health::Fault(ErrorKind::Transport),
            Err(kind) => Health::Fault(kind),
        }
    }
}

/// Time since `since`, zero if `now` is earlier
pub(crate) fn elapsed(now: Instant, since: Instant) -> Duration {
    now.checked_duration_since(since)
        .unwrap_or(Duration::from_ticks(0))
}
