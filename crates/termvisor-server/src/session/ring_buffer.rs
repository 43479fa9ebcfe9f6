//! Capped output history for replay on reattach.

use std::collections::VecDeque;

/// Byte buffer that keeps only the newest `capacity` bytes.
#[derive(Debug)]
pub struct RingBuffer {
    buf: VecDeque<u8>,
    capacity: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `data`, evicting the oldest bytes past the cap.
    pub fn write(&mut self, data: &[u8]) {
        let keep = data.len().min(self.capacity);
        let data = &data[data.len() - keep..];
        let overflow = (self.buf.len() + data.len()).saturating_sub(self.capacity);
        self.buf.drain(..overflow);
        self.buf.extend(data);
    }

    /// Buffered bytes, oldest first.
    pub fn read_all(&self) -> Vec<u8> {
        let (front, back) = self.buf.as_slices();
        [front, back].concat()
    }

    /// Buffered bytes as text. Eviction can cut a character at the start;
    /// that fragment decodes to U+FFFD.
    pub fn read_text(&self) -> String {
        String::from_utf8_lossy(&self.read_all()).into_owned()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
