//! Accumulation of payload event chunks

use tracing::debug;

const MIN_CAPACITY: usize = 64;

/// Growable byte buffer for the payload of one event.
///
/// With an expected size, bytes beyond it are dropped. Capacity grows by
/// doubling.
#[derive(Debug, Clone, Default)]
pub struct PayloadBuffer {
    data: Vec<u8>,
    expected: Option<usize>,
    dropped: usize,
}

impl PayloadBuffer {
    pub fn new(expected: Option<usize>) -> Self {
        let capacity = expected.map(|e| e.min(1 << 20)).unwrap_or(0);
        Self {
            data: Vec::with_capacity(capacity),
            expected,
            dropped: 0,
        }
    }

    /// Append a chunk, returning how many bytes were kept
    pub fn append(&mut self, chunk: &[u8]) -> usize {
        let keep = match self.expected {
            Some(expected) => chunk.len().min(expected.saturating_sub(self.data.len())),
            None => chunk.len(),
        };

        if keep < chunk.len() {
            debug!(
                "Dropping {} payload bytes beyond the expected {:?}",
                chunk.len() - keep,
                self.expected
            );
            self.dropped += chunk.len() - keep;
        }

        let needed = self.data.len() + keep;
        if needed > self.data.capacity() {
            let mut capacity = self.data.capacity().max(MIN_CAPACITY);
            while capacity < needed {
                capacity *= 2;
            }
            self.data.reserve_exact(capacity - self.data.len());
        }

        self.data.extend_from_slice(&chunk[..keep]);
        keep
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn expected(&self) -> Option<usize> {
        self.expected
    }

    /// Bytes dropped because they exceeded the expected size
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn is_complete(&self) -> bool {
        self.expected.map(|e| self.data.len() >= e).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oversize_append_dropped() {
        let mut buf = PayloadBuffer::new(Some(5));
        assert_eq!(buf.append(b"hel"), 3);
        assert_eq!(buf.append(b"lo world"), 2);
        assert_eq!(buf.as_slice(), b"hello");
        assert_eq!(buf.dropped(), 6);
        assert!(buf.is_complete());
        assert_eq!(buf.append(b"!"), 0);
    }

    #[test]
    fn test_capacity_doubles() {
        let mut buf = PayloadBuffer::new(None);
        buf.append(&[0u8; 10]);
        assert_eq!(buf.capacity(), MIN_CAPACITY);
        buf.append(&[0u8; 60]);
        assert_eq!(buf.capacity(), MIN_CAPACITY * 2);
        buf.append(&[0u8; 200]);
        assert_eq!(buf.capacity(), MIN_CAPACITY * 8);
        assert_eq!(buf.len(), 270);
    }
}
