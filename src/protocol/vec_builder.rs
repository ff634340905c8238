//! Growable buffers for lengths announced by untrusted peers.
//!
//! A frame may claim that a string or array is gigabytes long. Allocating that upfront would let a broken (or
//! malicious) broker exhaust our memory before the read fails, so capacity is only reserved in bounded steps while
//! data actually arrives.

use std::io::Read;

/// Upper bound for a single up-front reservation, in bytes.
const MAX_BLOCK_BYTES: usize = 64 * 1024;

#[derive(Debug)]
pub struct VecBuilder<T> {
    remaining: usize,
    data: Vec<T>,
}

impl<T> VecBuilder<T> {
    pub fn new(expected: usize) -> Self {
        let elem = std::mem::size_of::<T>().max(1);
        let first = expected.min(MAX_BLOCK_BYTES / elem);

        Self {
            remaining: expected,
            data: Vec::with_capacity(first),
        }
    }

    pub fn push(&mut self, v: T) {
        self.remaining = self.remaining.saturating_sub(1);
        self.data.push(v);
    }
}

impl VecBuilder<u8> {
    /// Fill the buffer with exactly the expected number of bytes.
    pub fn read_exact<R: Read>(mut self, reader: &mut R) -> Result<Self, std::io::Error> {
        while self.remaining > 0 {
            let step = self.remaining.min(MAX_BLOCK_BYTES);
            let start = self.data.len();
            self.data.resize(start + step, 0);
            reader.read_exact(&mut self.data[start..])?;
            self.remaining -= step;
        }

        Ok(self)
    }
}

impl<T> From<VecBuilder<T>> for Vec<T> {
    fn from(builder: VecBuilder<T>) -> Self {
        builder.data
    }
}
