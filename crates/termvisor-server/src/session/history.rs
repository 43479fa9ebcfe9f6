//! Session output history: a capped ring buffer plus UTF-8 carry-over for
//! multi-byte characters split across PTY reads.

use super::ring_buffer::RingBuffer;

#[derive(Debug)]
pub struct History {
    ring: RingBuffer,
    /// Incomplete trailing UTF-8 sequence from the previous chunk.
    pending: Vec<u8>,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: RingBuffer::new(capacity),
            pending: Vec::new(),
        }
    }

    /// Decode a raw output chunk, append it and return the text to forward.
    ///
    /// Invalid bytes become U+FFFD; an incomplete sequence at the end of the
    /// chunk is held back until the next call. Returns `None` when nothing
    /// decodable was produced.
    pub fn ingest(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);
        let text = take_utf8(&mut self.pending);
        if text.is_empty() {
            return None;
        }
        self.ring.write(text.as_bytes());
        Some(text)
    }

    /// Append supervisor-generated text (notices, failures).
    pub fn append(&mut self, text: &str) {
        self.ring.write(text.as_bytes());
    }

    /// Everything still buffered, oldest first.
    pub fn replay(&self) -> String {
        self.ring.read_text()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

/// Decode the longest prefix of `buf`, leaving an incomplete trailing
/// sequence in place.
fn take_utf8(buf: &mut Vec<u8>) -> String {
    let (out, keep) = {
        let mut out = String::with_capacity(buf.len());
        let mut rest: &[u8] = buf.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push('\u{FFFD}');
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        (out, rest.len())
    };
    let consumed = buf.len() - keep;
    buf.drain(..consumed);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_passes_through() {
        let mut h = History::new(64);
        assert_eq!(h.ingest(b"hello\r\n").as_deref(), Some("hello\r\n"));
        assert_eq!(h.replay(), "hello\r\n");
    }

    #[test]
    fn split_multibyte_is_carried_over() {
        let bytes = "héllo".as_bytes();
        let mut h = History::new(64);
        // 'é' is two bytes; cut between them.
        assert_eq!(h.ingest(&bytes[..2]).as_deref(), Some("h"));
        assert_eq!(h.ingest(&bytes[2..]).as_deref(), Some("éllo"));
        assert_eq!(h.replay(), "héllo");
    }

    #[test]
    fn lone_partial_sequence_yields_nothing_yet() {
        let mut h = History::new(64);
        assert_eq!(h.ingest(&[0xE2, 0x82]), None);
        assert_eq!(h.ingest(&[0xAC]).as_deref(), Some("€"));
    }

    #[test]
    fn invalid_bytes_are_replaced() {
        let mut h = History::new(64);
        assert_eq!(h.ingest(b"a\xFFb").as_deref(), Some("a\u{FFFD}b"));
    }

    #[test]
    fn append_goes_after_output() {
        let mut h = History::new(64);
        h.ingest(b"out");
        h.append(" notice");
        assert_eq!(h.replay(), "out notice");
        assert_eq!(h.len(), 10);
    }

    #[test]
    fn capped_history_keeps_latest() {
        let mut h = History::new(4);
        h.ingest(b"abcdef");
        assert_eq!(h.replay(), "cdef");
    }
}
