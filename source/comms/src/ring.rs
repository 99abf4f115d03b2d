//! Fixed capacity byte ring
//!
//! Storage for received bytes that may straddle the end of the backing
//! array. All wrap-around index math lives here: callers only ever see
//! logical offsets counted from the oldest byte still held.

/// A fixed capacity FIFO of bytes
///
/// `start` marks the first active byte in `buf`, `len` the number of
/// active bytes following it (modulo `N`).
pub struct Ring<const N: usize> {
    buf: [u8; N],
    start: usize,
    len: usize,
}

impl<const N: usize> Ring<N> {
    /// Create an empty ring
    pub const fn new() -> Self {
        Self {
            buf: [0u8; N],
            start: 0,
            len: 0,
        }
    }

    /// Append one byte
    ///
    /// Returns the byte back if the ring is full.
    pub fn push(&mut self, byte: u8) -> Result<(), u8> {
        if self.len == N {
            return Err(byte);
        }
        let idx = (self.start + self.len) % N;
        self.buf[idx] = byte;
        self.len += 1;
        Ok(())
    }

    /// The byte at logical `offset`, if it is held
    #[inline]
    pub fn read_at(&self, offset: usize) -> Option<u8> {
        if offset >= self.len {
            return None;
        }
        Some(self.buf[(self.start + offset) % N])
    }

    /// Copy `out.len()` bytes starting at logical `offset`
    ///
    /// Returns `false`, copying nothing, if the span is not fully held.
    pub fn copy_out(&self, offset: usize, out: &mut [u8]) -> bool {
        if offset + out.len() > self.len {
            return false;
        }
        let first = (self.start + offset) % N;
        let head = out.len().min(N - first);
        let (a, b) = out.split_at_mut(head);
        a.copy_from_slice(&self.buf[first..first + head]);
        b.copy_from_slice(&self.buf[..b.len()]);
        true
    }

    /// Release the `n` oldest bytes
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.len);
        self.start = (self.start + n) % N;
        self.len -= n;
    }

    /// Drop everything past the first `len` bytes
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    /// Drop all bytes
    pub fn clear(&mut self) {
        self.start = 0;
        self.len = 0;
    }

    /// Number of bytes held
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Is the ring empty?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total storage
    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<const N: usize> Default for Ring<N> {
    fn default() -> Self {
        Self::new()
    }
}
