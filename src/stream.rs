//! Buffered line/byte extractor for one direction of a stream
//!
//! Bytes are appended as they arrive; complete lines are extracted with
//! their CRLF/LF delimiter stripped. Bytes are never reordered: `skip_bytes`
//! and `replace_buffer` only ever act on the unconsumed tail.

use tracing::debug;

/// Default upper bound of a single line
pub const DEFAULT_MAX_LINE: usize = 4096;

#[derive(Debug, Clone)]
pub struct StreamParser {
    buf: Vec<u8>,
    /// Start of the unconsumed bytes in `buf`
    pos: usize,
    max_line: usize,
}

impl StreamParser {
    pub fn new(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            pos: 0,
            max_line: max_line.max(1),
        }
    }

    /// Append newly received bytes
    pub fn add_payload(&mut self, data: &[u8]) {
        self.compact();
        self.buf.extend_from_slice(data);
    }

    /// Extract the next complete line.
    ///
    /// Returns None while no delimiter is buffered, unless more than
    /// `max_line` bytes are pending, in which case they are flushed as a line.
    pub fn get_line(&mut self) -> Option<Vec<u8>> {
        let pending = &self.buf[self.pos..];

        match pending.iter().position(|b| *b == b'\n') {
            Some(nl) => {
                let mut end = nl;
                if end > 0 && pending[end - 1] == b'\r' {
                    end -= 1;
                }
                let line = pending[..end].to_vec();
                self.pos += nl + 1;
                Some(line)
            }
            None if pending.len() > self.max_line => {
                debug!("Flushing {} undelimited bytes as a line", self.max_line);
                let line = pending[..self.max_line].to_vec();
                self.pos += self.max_line;
                Some(line)
            }
            None => None,
        }
    }

    /// Unconsumed bytes
    pub fn remaining(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    pub fn remaining_len(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Consume up to `n` bytes, returning how many were skipped
    pub fn skip_bytes(&mut self, n: usize) -> usize {
        let n = n.min(self.remaining_len());
        self.pos += n;
        n
    }

    /// Drop everything buffered
    pub fn empty(&mut self) {
        self.buf.clear();
        self.pos = 0;
    }

    /// Replace the unconsumed bytes with `data`
    pub fn replace_buffer(&mut self, data: Vec<u8>) {
        self.buf = data;
        self.pos = 0;
    }

    pub fn max_line(&self) -> usize {
        self.max_line
    }

    fn compact(&mut self) {
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        } else if self.pos > self.buf.len() / 2 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_split_across_payloads() {
        let mut parser = StreamParser::default();
        parser.add_payload(b"a001 LOG");
        assert!(parser.get_line().is_none());
        parser.add_payload(b"IN user pass\r\na002 NOOP\n");
        assert_eq!(parser.get_line().unwrap(), b"a001 LOGIN user pass");
        assert_eq!(parser.get_line().unwrap(), b"a002 NOOP");
        assert!(parser.get_line().is_none());
        assert!(parser.remaining().is_empty());
    }

    #[test]
    fn test_blank_line() {
        let mut parser = StreamParser::default();
        parser.add_payload(b"\r\nx\r\n");
        assert_eq!(parser.get_line().unwrap(), b"");
        assert_eq!(parser.get_line().unwrap(), b"x");
    }

    #[test]
    fn test_skip_and_remaining() {
        let mut parser = StreamParser::default();
        parser.add_payload(b"hello)\r\n");
        assert_eq!(parser.skip_bytes(5), 5);
        assert_eq!(parser.remaining(), b")\r\n");
        assert_eq!(parser.skip_bytes(100), 3);
        assert_eq!(parser.remaining_len(), 0);
    }

    #[test]
    fn test_replace_buffer() {
        let mut parser = StreamParser::default();
        parser.add_payload(b"line\r\nxyz");
        parser.get_line();
        parser.replace_buffer(b"decoded\r\n".to_vec());
        assert_eq!(parser.get_line().unwrap(), b"decoded");
    }

    #[test]
    fn test_overlong_line_flushed() {
        let mut parser = StreamParser::new(8);
        parser.add_payload(b"0123456789");
        assert_eq!(parser.get_line().unwrap(), b"01234567");
        assert!(parser.get_line().is_none());
        assert_eq!(parser.remaining(), b"89");
    }

    #[test]
    fn test_compaction_keeps_order() {
        let mut parser = StreamParser::default();
        for i in 0..100 {
            parser.add_payload(format!("line {}\r\n", i).as_bytes());
            assert_eq!(parser.get_line().unwrap(), format!("line {}", i).as_bytes());
        }
        parser.add_payload(b"tail");
        assert_eq!(parser.remaining(), b"tail");
    }
}
