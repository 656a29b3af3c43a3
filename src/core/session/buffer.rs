//! Adaptive read buffer for remote channels

pub const INITIAL_READ_SIZE: usize = 8 * 1024;
pub const MAX_READ_SIZE: usize = 32 * 1024;
/// Consecutive full reads before the buffer grows
pub const GROWTH_THRESHOLD: u32 = 10;

/// Starts small for interactive typing and doubles under sustained bulk
/// output, up to [`MAX_READ_SIZE`].
pub struct ReadBuffer {
    buf: Vec<u8>,
    full_reads: u32,
}

impl Default for ReadBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadBuffer {
    pub fn new() -> Self {
        Self {
            buf: vec![0; INITIAL_READ_SIZE],
            full_reads: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn filled(&self, n: usize) -> &[u8] {
        &self.buf[..n.min(self.buf.len())]
    }

    /// Record a read of `n` bytes, growing after enough full reads
    pub fn record(&mut self, n: usize) {
        if n < self.buf.len() {
            self.full_reads = 0;
            return;
        }
        self.full_reads += 1;
        if self.full_reads >= GROWTH_THRESHOLD {
            let size = (self.buf.len() * 2).min(MAX_READ_SIZE);
            self.buf.resize(size, 0);
            self.full_reads = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grows_after_ten_full_reads() {
        let mut buf = ReadBuffer::new();
        for _ in 0..9 {
            buf.record(INITIAL_READ_SIZE);
        }
        assert_eq!(buf.size(), INITIAL_READ_SIZE);

        buf.record(INITIAL_READ_SIZE);
        assert_eq!(buf.size(), 2 * INITIAL_READ_SIZE);
    }

    #[test]
    fn test_growth_pauses_until_next_ten() {
        let mut buf = ReadBuffer::new();
        for _ in 0..10 {
            buf.record(buf.size());
        }
        let grown = buf.size();
        for _ in 0..9 {
            buf.record(buf.size());
        }
        assert_eq!(buf.size(), grown);
        buf.record(buf.size());
        assert_eq!(buf.size(), (grown * 2).min(MAX_READ_SIZE));
    }

    #[test]
    fn test_partial_read_resets_streak() {
        let mut buf = ReadBuffer::new();
        for _ in 0..9 {
            buf.record(INITIAL_READ_SIZE);
        }
        buf.record(100);
        buf.record(INITIAL_READ_SIZE);
        assert_eq!(buf.size(), INITIAL_READ_SIZE);
    }

    #[test]
    fn test_capped_at_max() {
        let mut buf = ReadBuffer::new();
        for _ in 0..100 {
            buf.record(buf.size());
        }
        assert_eq!(buf.size(), MAX_READ_SIZE);
    }
}
