//! Byte buffer with a read cursor.
//!
//! Stages and the device writer consume data by advancing the cursor; whatever is left
//! is retried on the next pass.

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AudioBuf {
    data: Vec<u8>,
    pos: usize,
}

impl AudioBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self::from_vec(data.to_vec())
    }

    /// Unread bytes.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn has_remaining(&self) -> bool {
        self.pos < self.data.len()
    }

    /// The unread part of the buffer.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    /// Mark `n` bytes as consumed (clamped to what is left).
    pub fn advance(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.data.len());
    }

    /// Consume and return up to `n` bytes.
    pub fn take(&mut self, n: usize) -> &[u8] {
        let start = self.pos;
        self.advance(n);
        &self.data[start..self.pos]
    }

    /// Drop all content and reuse the allocation for `capacity` bytes.
    pub fn reset_with_capacity(&mut self, capacity: usize) -> &mut Vec<u8> {
        self.data.clear();
        self.data.reserve(capacity);
        self.pos = 0;
        &mut self.data
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_is_clamped() {
        let mut buf = AudioBuf::from_slice(&[1, 2, 3]);
        buf.advance(2);
        assert_eq!(buf.as_slice(), &[3]);
        buf.advance(10);
        assert!(!buf.has_remaining());
    }

    #[test]
    fn take_returns_consumed_bytes() {
        let mut buf = AudioBuf::from_slice(&[1, 2, 3, 4]);
        assert_eq!(buf.take(3), &[1, 2, 3]);
        assert_eq!(buf.remaining(), 1);
    }
}
