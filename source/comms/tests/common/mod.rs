#![allow(dead_code)]

use relaybox_comms::{crc, Instant, LineConfig, LinkCfg, LinkShared, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockError;

/// Records everything asked of it, and fails on demand
#[derive(Debug, Default)]
pub struct MockSerial {
    pub sent: Vec<Vec<u8>>,
    pub armed: Vec<usize>,
    pub resets: Vec<LineConfig>,
    pub aborts: usize,
    pub fail_resets: usize,
    pub fail_transmit: bool,
}

impl Transport for MockSerial {
    type Error = MockError;

    fn transmit(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        if self.fail_transmit {
            return Err(MockError);
        }
        self.sent.push(data.to_vec());
        Ok(())
    }

    fn receive_until_idle(&mut self, max_len: usize) -> Result<(), Self::Error> {
        self.armed.push(max_len);
        Ok(())
    }

    fn abort(&mut self) -> Result<(), Self::Error> {
        self.aborts += 1;
        Ok(())
    }

    fn reset(&mut self, config: &LineConfig) -> Result<(), Self::Error> {
        if self.fail_resets > 0 {
            self.fail_resets -= 1;
            return Err(MockError);
        }
        self.resets.push(*config);
        Ok(())
    }
}

pub struct TestCfg;

impl LinkCfg for TestCfg {
    type Transport = MockSerial;
    const RESET_ATTEMPTS_BEFORE_LOG: u32 = 2;
}

pub fn at(ms: u64) -> Instant {
    Instant::from_millis(ms)
}

/// `body` followed by its checksum, low byte first
pub fn sealed(body: &[u8]) -> Vec<u8> {
    let mut v = body.to_vec();
    v.extend_from_slice(&crc::to_wire(crc::compute(body)));
    v
}

pub fn leak_shared() -> &'static LinkShared {
    Box::leak(Box::new(LinkShared::new()))
}

/// Deliver `bytes` in `chunk` sized pieces, the last one ending on an idle line
pub fn feed(shared: &LinkShared, bytes: &[u8], chunk: usize, now: Instant) {
    let mut chunks = bytes.chunks(chunk).peekable();
    while let Some(c) = chunks.next() {
        shared.on_chunk(c, chunks.peek().is_none(), now);
    }
}
