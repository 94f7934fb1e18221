//! XOR value column codec
//!
//! Values are XOR-ed against the previous value; identical values cost one
//! bit, values sharing the previous leading/trailing-zero window reuse it.
//! Lossy precision reduction happens before encoding, see
//! [`round_to_precision_bits`](super::round_to_precision_bits).

use super::bitstream::{BitReader, BitWriter};
use crate::{Result, TephraError};

/// Streaming encoder for one value column
pub struct ValueEncoder {
    writer: BitWriter,
    count: usize,
    prev_bits: u64,
    prev_leading: u32,
    prev_trailing: u32,
}

impl ValueEncoder {
    pub fn new() -> Self {
        Self {
            writer: BitWriter::with_capacity(1024),
            count: 0,
            prev_bits: 0,
            prev_leading: u32::MAX,
            prev_trailing: 0,
        }
    }

    /// Append one value
    pub fn push(&mut self, value: f64) {
        let bits = value.to_bits();
        if self.count == 0 {
            self.writer.write_bits(bits, 64);
            self.prev_bits = bits;
            self.count = 1;
            return;
        }

        let xor = bits ^ self.prev_bits;
        if xor == 0 {
            self.writer.write_bit(false);
        } else {
            self.writer.write_bit(true);

            // Leading-zero count is stored in 5 bits, so clamp at 31.
            let leading = xor.leading_zeros().min(31);
            let trailing = xor.trailing_zeros();

            if self.prev_leading != u32::MAX
                && leading >= self.prev_leading
                && trailing >= self.prev_trailing
            {
                self.writer.write_bit(false);
                let width = 64 - self.prev_leading - self.prev_trailing;
                self.writer.write_bits(xor >> self.prev_trailing, width as usize);
            } else {
                let width = 64 - leading - trailing;
                self.writer.write_bit(true);
                self.writer.write_bits(leading as u64, 5);
                // width is in 1..=64; store width-1 so 64 fits in 6 bits
                self.writer.write_bits((width - 1) as u64, 6);
                self.writer.write_bits(xor >> trailing, width as usize);
                self.prev_leading = leading;
                self.prev_trailing = trailing;
            }
        }
        self.prev_bits = bits;
        self.count += 1;
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Finish encoding and return the column bytes
    pub fn finish(self) -> Vec<u8> {
        self.writer.finish()
    }
}

impl Default for ValueEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decoder for one value column
pub struct ValueDecoder<'a> {
    reader: BitReader<'a>,
    remaining: usize,
    first: bool,
    prev_bits: u64,
    prev_leading: u32,
    prev_trailing: u32,
}

impl<'a> ValueDecoder<'a> {
    pub fn new(data: &'a [u8], count: usize) -> Self {
        Self {
            reader: BitReader::new(data),
            remaining: count,
            first: true,
            prev_bits: 0,
            prev_leading: 0,
            prev_trailing: 0,
        }
    }

    /// Decode the next value, or `None` when the column is exhausted
    pub fn decode_next(&mut self) -> Result<Option<f64>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;

        if self.first {
            self.first = false;
            self.prev_bits = self.read_bits(64)?;
            return Ok(Some(f64::from_bits(self.prev_bits)));
        }

        if !self.read_bit()? {
            return Ok(Some(f64::from_bits(self.prev_bits)));
        }

        if self.read_bit()? {
            let leading = self.read_bits(5)? as u32;
            let width = self.read_bits(6)? as u32 + 1;
            self.prev_leading = leading;
            self.prev_trailing = 64 - leading - width;
        }

        let width = 64 - self.prev_leading - self.prev_trailing;
        let xor = self.read_bits(width as usize)? << self.prev_trailing;
        self.prev_bits ^= xor;
        Ok(Some(f64::from_bits(self.prev_bits)))
    }

    /// Decode the whole column
    pub fn decode_all(mut self) -> Result<Vec<f64>> {
        let mut out = Vec::with_capacity(self.remaining);
        while let Some(v) = self.decode_next()? {
            out.push(v);
        }
        Ok(out)
    }

    fn read_bit(&mut self) -> Result<bool> {
        self.reader
            .read_bit()
            .ok_or_else(|| TephraError::Compression("truncated value column".into()))
    }

    fn read_bits(&mut self, n: usize) -> Result<u64> {
        self.reader
            .read_bits(n)
            .ok_or_else(|| TephraError::Compression("truncated value column".into()))
    }
}
