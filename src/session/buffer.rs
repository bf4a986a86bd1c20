//! # Utterance Buffer
//!
//! Collects the raw audio chunks of the utterance currently being spoken.
//! Chunks are opaque bytes: no decoding, resampling or size limit happens
//! here. Order matters, so chunks are kept exactly as they arrived and
//! concatenated only when the utterance is committed.

use bytes::{Bytes, BytesMut};

/// Ordered chunk accumulator for one utterance.
#[derive(Debug, Default, Clone)]
pub struct AudioBuffer {
    chunks: Vec<Bytes>,
    total_bytes: usize,
}

impl AudioBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one chunk to the end of the buffer.
    ///
    /// `Bytes` is reference counted, so frames coming off the socket are
    /// stored without copying.
    pub fn append(&mut self, chunk: Bytes) {
        self.total_bytes += chunk.len();
        self.chunks.push(chunk);
    }

    /// Concatenate every chunk in arrival order and empty the buffer.
    pub fn freeze(&mut self) -> Bytes {
        let frozen = self.contents();
        self.clear();
        frozen
    }

    /// Concatenation of the buffered chunks, leaving the buffer untouched.
    pub fn contents(&self) -> Bytes {
        match self.chunks.as_slice() {
            [] => Bytes::new(),
            [single] => single.clone(),
            chunks => {
                let mut joined = BytesMut::with_capacity(self.total_bytes);
                for chunk in chunks {
                    joined.extend_from_slice(chunk);
                }
                joined.freeze()
            }
        }
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total_bytes = 0;
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.total_bytes
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contents_concatenate_in_order() {
        let mut buffer = AudioBuffer::new();
        buffer.append(Bytes::from_static(b"AA"));
        buffer.append(Bytes::from_static(b"B"));
        buffer.append(Bytes::from_static(b"CCC"));

        assert_eq!(buffer.contents(), Bytes::from_static(b"AABCCC"));
        assert_eq!(buffer.len(), 6);
        assert_eq!(buffer.chunk_count(), 3);
    }

    #[test]
    fn test_freeze_empties_buffer() {
        let mut buffer = AudioBuffer::new();
        buffer.append(Bytes::from_static(b"hello"));

        let frozen = buffer.freeze();
        assert_eq!(frozen, Bytes::from_static(b"hello"));
        assert!(buffer.is_empty());
        assert_eq!(buffer.len(), 0);
        assert_eq!(buffer.freeze(), Bytes::new());
    }

    #[test]
    fn test_empty_chunks_are_kept() {
        let mut buffer = AudioBuffer::new();
        buffer.append(Bytes::new());
        assert!(!buffer.is_empty());
        assert_eq!(buffer.len(), 0);
        assert_eq!(buffer.chunk_count(), 1);
    }
}
