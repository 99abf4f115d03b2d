//! Frame reassembly
//!
//! The transport hands us bytes from its interrupt context in whatever
//! chunks the hardware produced: possibly one byte at a time, possibly
//! several frames at once. The [`Reassembler`] turns that stream back into
//! whole [`Frame`]s in two phases:
//!
//! 1. **Header**: collect the fixed six byte header (address, function,
//!    start address, register count).
//! 2. **Payload**: the header bounds the rest of the frame at
//!    `count * 2 + 2 (CRC) + 1`. That is exact for a write request (the extra
//!    byte is its byte count) and slack for anything else. The frame is
//!    complete once the bound is reached, or once the transport reports the
//!    line idle, whichever comes first. Then we flip back to phase 1.
//!
//! The bound never exceeds [`MAX_ADU`], so a request with an absurd count is
//! still closed by the idle line and handed on, to be refused by the
//! dispatcher. Traffic between other devices on the bus is framed by the
//! idle line the same way. An idle line in the middle of a header leaves a
//! runt that no request fits in; it is dropped.
//!
//! When acting as the Controller, the expected response length is known up
//! front (see [`Reassembler::expect_response`]) and replaces the header
//! derived bound. Exception responses are recognised by their function byte
//! and are always five bytes long.
//!
//! Bytes live in a [`Ring`], so a frame may straddle the end of storage.
//! Completed frames are copied out by [`Reassembler::take_frame`]; the main
//! loop never holds a reference into the ring.
//!
//! ## Sharing
//!
//! The assembly state sits behind a critical section [`Mutex`]. The last
//! chunk timestamp, the "partial frame present" flag and the fault latch are
//! plain atomics that are only ever `load`ed and `store`d, so the main loop
//! can check for stalls without masking interrupts on every tick.

use core::{
    cell::RefCell,
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
};

use embassy_sync::blocking_mutex::{raw::CriticalSectionRawMutex, Mutex};
use embassy_time::{Duration, Instant};
use heapless::Deque;

use crate::{
    crc::CRC_LEN,
    error::ErrorKind,
    frame::{Frame, EXCEPTION_BIT, HEADER_LEN, MAX_ADU},
    ring::Ring,
};

/// Default reception storage size
pub const RING_SIZE: usize = 512;

/// Silence tolerated inside a partially received frame
pub const STALL_THRESHOLD: Duration = Duration::from_millis(10);

/// Address, function, exception code, checksum
pub const EXCEPTION_LEN: usize = 3 + CRC_LEN;

/// Completed frames that may wait for the main loop
const READY_DEPTH: usize = 4;

/// Which part of a frame we are waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum Phase {
    /// Waiting for the fixed header
    Header,
    /// Header seen, waiting for the rest of the frame
    Payload,
}

/// Result of [`Reassembler::poll_stall`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum Stall {
    /// Nothing stuck
    Ok,
    /// A partial frame went quiet and was dropped (a "chunk miss")
    Stalled,
}

/// How many bytes the transport should be asked for next
///
/// Returned from [`Reassembler::on_chunk`] so the interrupt glue can re-arm
/// reception without calling back into the main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct RxRequest {
    /// Upper bound for the next receive-until-idle
    pub max_len: usize,
}

/// Reception state shared between the interrupt and the main loop
pub struct Reassembler<const N: usize = RING_SIZE> {
    assembly: Mutex<CriticalSectionRawMutex, RefCell<Assembly<N>>>,
    last_chunk_ms: AtomicU32,
    partial: AtomicBool,
    fault: AtomicBool,
}

impl<const N: usize> Reassembler<N> {
    /// Create an empty reassembler
    ///
    /// Intended for static usage.
    pub const fn new() -> Self {
        Self {
            assembly: Mutex::new(RefCell::new(Assembly::new())),
            last_chunk_ms: AtomicU32::new(0),
            partial: AtomicBool::new(false),
            fault: AtomicBool::new(false),
        }
    }

    /// Accept bytes from the transport
    ///
    /// `idle` is set when the chunk ended because the line went quiet, rather
    /// than because the requested length was reached.
    ///
    /// Called from the interrupt context. Never blocks beyond the critical
    /// section needed to append to the ring.
    pub fn on_chunk(&self, bytes: &[u8], idle: bool, now: Instant) -> RxRequest {
        self.assembly.lock(|cell| {
            let mut asm = cell.borrow_mut();
            let mut dropped = asm.accept(bytes);
            if idle {
                dropped |= asm.line_idle();
            }
            if dropped {
                self.fault.store(true, Ordering::Release);
            }
            self.last_chunk_ms.store(millis(now), Ordering::Release);
            self.partial.store(asm.is_partial(), Ordering::Release);
            asm.next_request()
        })
    }

    /// Drop a partial frame that has been quiet for longer than `threshold`
    pub fn poll_stall(&self, now: Instant, threshold: Duration) -> Stall {
        if !self.partial.load(Ordering::Acquire) {
            return Stall::Ok;
        }
        let limit = threshold.as_millis() as i32;
        let quiet = |last: &AtomicU32| millis(now).wrapping_sub(last.load(Ordering::Acquire)) as i32;
        if quiet(&self.last_chunk_ms) <= limit {
            return Stall::Ok;
        }

        self.assembly.lock(|cell| {
            // A chunk may have landed between the check above and taking the lock
            if quiet(&self.last_chunk_ms) <= limit {
                return Stall::Ok;
            }
            cell.borrow_mut().discard_partial();
            self.partial.store(false, Ordering::Release);
            Stall::Stalled
        })
    }

    /// Take the oldest completed frame, if any
    pub fn take_frame(&self) -> Option<Frame> {
        self.assembly.lock(|cell| cell.borrow_mut().pop_frame())
    }

    /// Forget everything, including completed frames
    pub fn reset(&self) {
        self.assembly.lock(|cell| {
            *cell.borrow_mut() = Assembly::new();
            self.partial.store(false, Ordering::Release);
            self.fault.store(false, Ordering::Release);
        })
    }

    /// Expect responses of `len` bytes instead of parsing request headers
    ///
    /// `None` returns to request parsing.
    pub fn expect_response(&self, len: Option<usize>) {
        self.assembly.lock(|cell| cell.borrow_mut().response_len = len)
    }

    /// The current phase
    pub fn phase(&self) -> Phase {
        self.assembly.lock(|cell| cell.borrow().phase)
    }

    /// What to ask the transport for when (re-)arming reception
    pub fn next_request(&self) -> RxRequest {
        self.assembly.lock(|cell| cell.borrow().next_request())
    }

    /// Take the latched overflow fault, if one occurred since the last call
    ///
    /// Uses a critical section so the test-and-clear works even on targets
    /// without CAS atomics.
    pub fn take_fault(&self) -> Option<ErrorKind> {
        critical_section::with(|_| {
            let old = self.fault.load(Ordering::Acquire);
            self.fault.store(false, Ordering::Release);
            old
        })
        .then_some(ErrorKind::Memory)
    }
}

impl<const N: usize> Default for Reassembler<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn millis(now: Instant) -> u32 {
    now.as_millis() as u32
}

/// State only touched while holding the lock
///
/// `ring` holds, in order: completed frames (lengths in `ready`), then the
/// frame under assembly starting at `frame_start`.
struct Assembly<const N: usize> {
    ring: Ring<N>,
    phase: Phase,
    frame_start: usize,
    frame_len: Option<usize>,
    ready: Deque<usize, READY_DEPTH>,
    response_len: Option<usize>,
}

impl<const N: usize> Assembly<N> {
    const fn new() -> Self {
        Self {
            ring: Ring::new(),
            phase: Phase::Header,
            frame_start: 0,
            frame_len: None,
            ready: Deque::new(),
            response_len: None,
        }
    }

    /// Returns true if anything had to be dropped
    fn accept(&mut self, bytes: &[u8]) -> bool {
        let mut dropped = false;
        for &byte in bytes {
            if self.ring.push(byte).is_err() {
                mb_trace!("rx ring full");
                self.discard_partial();
                dropped = true;
                continue;
            }
            dropped |= self.advance();
        }
        dropped
    }

    /// Re-evaluate the frame under assembly after one more byte
    fn advance(&mut self) -> bool {
        let have = self.ring.len() - self.frame_start;
        if self.frame_len.is_none() {
            self.frame_len = self.derive_len(have);
            if self.frame_len.is_none() {
                return false;
            }
            self.phase = Phase::Payload;
        }

        match self.frame_len {
            Some(len) if have >= len => self.complete(len),
            _ => false,
        }
    }

    fn derive_len(&self, have: usize) -> Option<usize> {
        let at = |i: usize| self.ring.read_at(self.frame_start + i).unwrap_or(0);
        if let Some(expected) = self.response_len {
            if have >= 2 && at(1) & EXCEPTION_BIT != 0 {
                return Some(EXCEPTION_LEN);
            }
            if have < HEADER_LEN.min(expected) {
                return None;
            }
            return Some(expected);
        }

        if have < HEADER_LEN {
            return None;
        }
        let count = usize::from(u16::from_be_bytes([at(4), at(5)]));
        Some((HEADER_LEN + count * 2 + CRC_LEN + 1).min(MAX_ADU))
    }

    /// The line went quiet: close a frame in its payload phase as it stands,
    /// drop a runt still in its header phase
    fn line_idle(&mut self) -> bool {
        let have = self.ring.len() - self.frame_start;
        match self.phase {
            Phase::Payload => self.complete(have),
            Phase::Header if have > 0 => {
                mb_trace!("dropping {=usize} byte runt", have);
                self.discard_partial();
                false
            }
            Phase::Header => false,
        }
    }

    fn complete(&mut self, len: usize) -> bool {
        self.frame_len = None;
        self.phase = Phase::Header;
        if self.ready.push_back(len).is_err() {
            mb_trace!("rx frame queue full");
            self.ring.truncate(self.frame_start);
            return true;
        }
        self.frame_start += len;
        false
    }

    fn discard_partial(&mut self) {
        self.ring.truncate(self.frame_start);
        self.frame_len = None;
        self.phase = Phase::Header;
    }

    fn is_partial(&self) -> bool {
        self.ring.len() > self.frame_start
    }

    fn next_request(&self) -> RxRequest {
        let have = self.ring.len() - self.frame_start;
        let want = self.frame_len.unwrap_or(HEADER_LEN);
        RxRequest {
            max_len: want.saturating_sub(have).max(1),
        }
    }

    fn pop_frame(&mut self) -> Option<Frame> {
        let len = self.ready.pop_front()?;
        let mut buf = [0u8; MAX_ADU];
        let out = &mut buf[..len];
        let copied = self.ring.copy_out(0, out);
        self.ring.consume(len);
        self.frame_start -= len;
        if !copied {
            return None;
        }
        Frame::from_bytes(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc;

    fn sealed(body: &[u8]) -> std::vec::Vec<u8> {
        let mut v = body.to_vec();
        v.extend_from_slice(&crc::to_wire(crc::compute(body)));
        v
    }

    fn read_req() -> std::vec::Vec<u8> {
        sealed(&[0x07, 0x03, 0x00, 0x00, 0x00, 0x02])
    }

    fn write_req() -> std::vec::Vec<u8> {
        sealed(&[0x07, 0x10, 0x00, 0x06, 0x00, 0x02, 0x04, 0x00, 0x03, 0x01, 0xF4])
    }

    fn at(ms: u64) -> Instant {
        Instant::from_millis(ms)
    }

    /// Deliver `bytes` the way receive-until-idle would: the last chunk ends
    /// on an idle line
    fn feed_in_chunks<const N: usize>(rx: &Reassembler<N>, bytes: &[u8], chunk: usize) {
        let mut chunks = bytes.chunks(chunk).peekable();
        while let Some(c) = chunks.next() {
            rx.on_chunk(c, chunks.peek().is_none(), at(0));
        }
    }

    #[test]
    fn whole_frame() {
        let rx = Reassembler::<RING_SIZE>::new();
        let req = read_req();
        rx.on_chunk(&req, true, at(0));
        let frame = rx.take_frame().unwrap();
        assert_eq!(frame.as_bytes(), req.as_slice());
        assert!(rx.take_frame().is_none());
        assert_eq!(rx.phase(), Phase::Header);
    }

    #[test]
    fn fragmentation_does_not_matter() {
        for req in [read_req(), write_req()] {
            for chunk in [1, 3, req.len()] {
                let rx = Reassembler::<RING_SIZE>::new();
                feed_in_chunks(&rx, &req, chunk);
                let frame = rx.take_frame().unwrap();
                assert_eq!(frame.as_bytes(), req.as_slice(), "chunk {}", chunk);
            }
        }
    }

    #[test]
    fn frame_straddling_the_wrap_point() {
        let first = read_req();
        let second = write_req();
        for chunk in [1, 3, second.len()] {
            // 8 + 13 bytes through 16 bytes of storage
            let rx = Reassembler::<16>::new();
            rx.on_chunk(&first, true, at(0));
            assert_eq!(rx.take_frame().unwrap().as_bytes(), first.as_slice());
            feed_in_chunks(&rx, &second, chunk);
            assert_eq!(rx.take_frame().unwrap().as_bytes(), second.as_slice());
        }
    }

    #[test]
    fn back_to_back_frames_in_one_chunk() {
        let rx = Reassembler::<RING_SIZE>::new();
        let mut both = write_req();
        both.extend_from_slice(&read_req());
        rx.on_chunk(&both, true, at(0));
        assert_eq!(rx.take_frame().unwrap().as_bytes(), write_req().as_slice());
        assert_eq!(rx.take_frame().unwrap().as_bytes(), read_req().as_slice());
        assert!(rx.take_frame().is_none());
    }

    #[test]
    fn phases_and_requests() {
        let rx = Reassembler::<RING_SIZE>::new();
        assert_eq!(rx.next_request(), RxRequest { max_len: HEADER_LEN });
        let req = write_req();
        let r = rx.on_chunk(&req[..2], false, at(0));
        assert_eq!(r.max_len, 4);
        assert_eq!(rx.phase(), Phase::Header);
        // header complete: count 2 -> 2 * 2 + 2 + 1 more bytes
        let r = rx.on_chunk(&req[2..6], false, at(0));
        assert_eq!(r.max_len, 7);
        assert_eq!(rx.phase(), Phase::Payload);
        // the bound alone completes a write, no idle needed
        let r = rx.on_chunk(&req[6..], false, at(0));
        assert_eq!(r.max_len, HEADER_LEN);
        assert_eq!(rx.phase(), Phase::Header);
        assert_eq!(rx.take_frame().unwrap().as_bytes(), req.as_slice());
    }

    #[test]
    fn read_request_waits_for_the_idle_line() {
        let rx = Reassembler::<RING_SIZE>::new();
        let req = read_req();
        // count 2 bounds the frame at 6 + 2 * 2 + 2 + 1 bytes
        let r = rx.on_chunk(&req, false, at(0));
        assert_eq!(r.max_len, 13 - req.len());
        assert!(rx.take_frame().is_none());
        rx.on_chunk(&[], true, at(1));
        assert_eq!(rx.take_frame().unwrap().as_bytes(), req.as_slice());
    }

    #[test]
    fn foreign_response_is_framed_by_the_idle_line() {
        let rx = Reassembler::<RING_SIZE>::new();
        // Another device answering a read; its byte count and data look
        // like a huge register count
        let reply = sealed(&[0x09, 0x03, 0x04, 0x00, 0x07, 0x00, 0x03]);
        feed_in_chunks(&rx, &reply, 4);
        assert_eq!(rx.take_frame().unwrap().as_bytes(), reply.as_slice());

        let req = read_req();
        rx.on_chunk(&req, true, at(3));
        let frame = rx.take_frame().unwrap();
        assert_eq!(frame.as_bytes(), req.as_slice());
        assert!(frame.crc_ok());
    }

    #[test]
    fn runts_are_dropped_on_idle() {
        let rx = Reassembler::<RING_SIZE>::new();
        // Another device's exception response is shorter than any header
        rx.on_chunk(&sealed(&[0x09, 0x83, 0x02]), true, at(0));
        assert!(rx.take_frame().is_none());
        assert_eq!(rx.phase(), Phase::Header);
        assert_eq!(rx.poll_stall(at(100), STALL_THRESHOLD), Stall::Ok);
        assert_eq!(rx.take_fault(), None);

        let req = read_req();
        rx.on_chunk(&req, true, at(100));
        assert_eq!(rx.take_frame().unwrap().as_bytes(), req.as_slice());
    }

    #[test]
    fn short_write_is_closed_by_the_idle_line() {
        let rx = Reassembler::<RING_SIZE>::new();
        // count 2, but a single value carried
        let req = sealed(&[0x07, 0x10, 0x00, 0x06, 0x00, 0x02, 0x02, 0x00, 0x01]);
        feed_in_chunks(&rx, &req, 3);
        assert_eq!(rx.take_frame().unwrap().as_bytes(), req.as_slice());
        assert_eq!(rx.poll_stall(at(100), STALL_THRESHOLD), Stall::Ok);
    }

    #[test]
    fn oversize_count_is_bounded() {
        let rx = Reassembler::<RING_SIZE>::new();
        // 126 registers would need 261 bytes
        let req = sealed(&[0x07, 0x10, 0x00, 0x00, 0x00, 0x7E, 0x00]);
        let r = rx.on_chunk(&req[..HEADER_LEN], false, at(0));
        assert_eq!(r.max_len, MAX_ADU - HEADER_LEN);
        rx.on_chunk(&req[HEADER_LEN..], true, at(0));
        assert_eq!(rx.take_frame().unwrap().as_bytes(), req.as_slice());
        assert_eq!(rx.take_fault(), None);

        // Without an idle line the frame is cut at the largest size
        let mut junk = std::vec![0x07, 0x10, 0x00, 0x00, 0x00, 200];
        junk.resize(MAX_ADU, 0xAA);
        rx.on_chunk(&junk, false, at(0));
        assert_eq!(rx.take_frame().unwrap().as_bytes(), junk.as_slice());
        assert_eq!(rx.phase(), Phase::Header);
    }

    #[test]
    fn chunk_miss_recovery() {
        let rx = Reassembler::<RING_SIZE>::new();
        let req = read_req();
        rx.on_chunk(&req[..3], false, at(100));
        assert_eq!(rx.poll_stall(at(105), STALL_THRESHOLD), Stall::Ok);
        assert_eq!(rx.poll_stall(at(110), STALL_THRESHOLD), Stall::Ok);
        assert_eq!(rx.poll_stall(at(111), STALL_THRESHOLD), Stall::Stalled);
        assert_eq!(rx.phase(), Phase::Header);
        assert_eq!(rx.poll_stall(at(200), STALL_THRESHOLD), Stall::Ok);
        assert!(rx.take_frame().is_none());

        rx.on_chunk(&req, true, at(300));
        assert_eq!(rx.take_frame().unwrap().as_bytes(), req.as_slice());
    }

    #[test]
    fn no_stall_while_idle_or_in_the_past() {
        let rx = Reassembler::<RING_SIZE>::new();
        assert_eq!(rx.poll_stall(at(1_000), STALL_THRESHOLD), Stall::Ok);
        rx.on_chunk(&[0x07], false, at(500));
        // The main loop sampled `now` before the chunk landed
        assert_eq!(rx.poll_stall(at(490), STALL_THRESHOLD), Stall::Ok);
    }

    #[test]
    fn overrun_latches_a_fault() {
        let rx = Reassembler::<16>::new();
        let req = read_req();
        rx.on_chunk(&req, true, at(0));
        rx.on_chunk(&req, true, at(0));
        assert_eq!(rx.take_fault(), None);
        rx.on_chunk(&req, true, at(0));
        assert_eq!(rx.take_fault(), Some(ErrorKind::Memory));
        assert!(rx.take_frame().is_some());
        assert!(rx.take_frame().is_some());
        assert!(rx.take_frame().is_none());
    }

    #[test]
    fn response_shapes() {
        let rx = Reassembler::<RING_SIZE>::new();
        // read of two registers: addr, fn, count, 4 data bytes, crc
        let resp = sealed(&[0x07, 0x03, 0x04, 0x00, 0x07, 0x00, 0x03]);
        rx.expect_response(Some(resp.len()));
        feed_in_chunks(&rx, &resp, 1);
        assert_eq!(rx.take_frame().unwrap().as_bytes(), resp.as_slice());

        let exc = sealed(&[0x07, 0x83, 0x02]);
        feed_in_chunks(&rx, &exc, 2);
        assert_eq!(rx.take_frame().unwrap().as_bytes(), exc.as_slice());
    }

    #[test]
    fn reset_forgets_everything() {
        let rx = Reassembler::<RING_SIZE>::new();
        rx.on_chunk(&read_req(), true, at(0));
        rx.on_chunk(&[0x07, 0x03], false, at(0));
        rx.reset();
        assert!(rx.take_frame().is_none());
        assert_eq!(rx.poll_stall(at(1_000), STALL_THRESHOLD), Stall::Ok);
        assert_eq!(rx.phase(), Phase::Header);
    }
}
