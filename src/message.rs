//! Owned protocol message frames and the per-connection buffer pool.

use bytes::BytesMut;
use tracing::trace;

use crate::{ALIGNMENT_SIZE, DEFAULT_BUFFER_SIZE};

/// One protocol message: a single-byte kind (ASCII tag, `0` for the
/// untagged startup family) and the complete wire image of the frame,
/// including the tag byte and the length field.
///
/// Messages are single-owner; [`Clone`] makes a deep copy.
#[derive(Debug, Clone)]
pub struct Message {
    pub kind: u8,
    data: BytesMut,
}

impl Message {
    /// Allocates a zero-filled message of `size` bytes. The backing
    /// capacity is rounded up to [`ALIGNMENT_SIZE`].
    pub fn allocate(size: usize) -> Self {
        let mut data = BytesMut::with_capacity(aligned_size(size));
        data.resize(size, 0);
        Message { kind: 0, data }
    }

    pub fn from_parts(kind: u8, data: BytesMut) -> Self {
        Message { kind, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_data(self) -> BytesMut {
        self.data
    }

    /// Dumps kind, length and payload hex at trace level.
    pub fn dump(&self) {
        trace!(
            kind = %(self.kind as char),
            length = self.data.len(),
            data = %hex(&self.data),
            "message"
        );
    }
}

/// Rounds `size` up to the next multiple of [`ALIGNMENT_SIZE`].
pub fn aligned_size(size: usize) -> usize {
    const {
        assert!(ALIGNMENT_SIZE.is_power_of_two());
    }
    (size + ALIGNMENT_SIZE - 1) & !(ALIGNMENT_SIZE - 1)
}

fn hex(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len() * 2);
    for b in data {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

/// Per-connection pool of read buffers.
///
/// Each transport read draws a [`DEFAULT_BUFFER_SIZE`] buffer from here
/// and hands it back once its bytes have been consumed, so the hot path
/// does not allocate per frame.
#[derive(Debug, Default)]
pub struct MessageMemory {
    free: Vec<BytesMut>,
}

impl MessageMemory {
    pub fn new() -> Self {
        MessageMemory::default()
    }

    /// Hands out a cleared buffer of [`DEFAULT_BUFFER_SIZE`] capacity.
    pub fn acquire(&mut self) -> BytesMut {
        let mut buf = self
            .free
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(DEFAULT_BUFFER_SIZE));
        buf.clear();
        buf
    }

    /// Returns a buffer to the pool for reuse.
    pub fn release(&mut self, buf: BytesMut) {
        self.free.push(buf);
    }
}
