//! Owned growable byte buffer for accumulating partial records and frames
//!
//! Protocol engines receive bytes in arbitrary slices from the network and must
//! hold on to partial messages until a whole record, frame or header block has
//! arrived. [`ByteBuffer`] is that accumulation area.
//!
//! # Contract
//!
//! - Appending may reallocate. Slices previously obtained from [`ByteBuffer::as_slice`]
//!   are invalidated, which the borrow checker enforces.
//! - Consuming from the front is O(1) and never copies the remaining bytes.
//! - An optional hard limit makes [`ByteBuffer::extend`] fail instead of growing without bound.

use crate::{Error, Result};
use bytes::{Buf, Bytes, BytesMut};

#[derive(Debug, Default)]
pub struct ByteBuffer {
    data: BytesMut,
    limit: Option<usize>,
    stats: BufferStats,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub bytes_appended: u64,
    pub bytes_consumed: u64,
    pub peak_len: usize,
}

impl ByteBuffer {
    /// Create an unbounded buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an unbounded buffer with preallocated capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            ..Self::default()
        }
    }

    /// Create a buffer that refuses to hold more than `limit` bytes
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Append bytes, failing without modification if the limit would be exceeded
    pub fn extend(&mut self, bytes: &[u8]) -> Result<()> {
        if let Some(limit) = self.limit {
            if self.data.len() + bytes.len() > limit {
                return Err(Error::Validation(format!(
                    "buffer limit of {} bytes exceeded",
                    limit
                )));
            }
        }

        self.data.extend_from_slice(bytes);
        self.stats.bytes_appended += bytes.len() as u64;
        self.stats.peak_len = self.stats.peak_len.max(self.data.len());
        Ok(())
    }

    /// Append a single byte
    pub fn push(&mut self, byte: u8) -> Result<()> {
        self.extend(&[byte])
    }

    /// Borrow the unconsumed bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Drop `n` bytes from the front
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.data.len());
        self.data.advance(n);
        self.stats.bytes_consumed += n as u64;
    }

    /// Detach the first `n` bytes as an immutable chunk
    pub fn split_to(&mut self, n: usize) -> Bytes {
        let n = n.min(self.data.len());
        self.stats.bytes_consumed += n as u64;
        self.data.split_to(n).freeze()
    }

    /// Take everything, leaving the buffer empty
    pub fn take(&mut self) -> Bytes {
        let len = self.data.len();
        self.split_to(len)
    }

    /// Copy as much as fits into `out`, consuming what was copied
    pub fn read_into(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.data.len());
        out[..n].copy_from_slice(&self.data[..n]);
        self.consume(n);
        n
    }

    pub fn ends_with(&self, suffix: &[u8]) -> bool {
        self.data.ends_with(suffix)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn clear(&mut self) {
        let len = self.data.len();
        self.consume(len);
    }

    pub fn stats(&self) -> &BufferStats {
        &self.stats
    }
}
