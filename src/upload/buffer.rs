use bytes::{Bytes, BytesMut};

/// Reusable accumulator for one part.
///
/// The producer fills it up to `limit` and then takes an owned, frozen copy
/// of the contents to hand to the uploader.
#[derive(Debug)]
pub struct PartBuffer {
    buf: BytesMut,
    limit: usize,
}

impl PartBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(limit),
            limit,
        }
    }

    /// Append as much of `data` as fits and return how many bytes were taken.
    pub fn extend(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.remaining());
        self.buf.extend_from_slice(&data[..n]);
        n
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.limit
    }

    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.buf.len())
    }

    /// Take the current contents and reset for the next fill.
    pub fn take(&mut self) -> Bytes {
        let part = self.buf.split().freeze();
        self.buf.reserve(self.limit);
        part
    }
}
