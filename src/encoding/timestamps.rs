//! Delta-of-delta timestamp column codec
//!
//! The first timestamp is stored raw; every following one stores the change
//! of its delta, bucketed into variable-width fields. Regularly spaced
//! samples cost one bit each.

use super::bitstream::{BitReader, BitWriter};
use crate::{Result, TephraError};

/// Streaming encoder for one timestamp column
pub struct TimestampEncoder {
    writer: BitWriter,
    count: usize,
    prev: i64,
    prev_delta: i64,
}

impl TimestampEncoder {
    pub fn new() -> Self {
        Self {
            writer: BitWriter::with_capacity(1024),
            count: 0,
            prev: 0,
            prev_delta: 0,
        }
    }

    /// Append one timestamp; input must be fed in storage order
    pub fn push(&mut self, timestamp: i64) {
        if self.count == 0 {
            self.writer.write_bits(timestamp as u64, 64);
        } else {
            let delta = timestamp - self.prev;
            let dod = delta - self.prev_delta;
            self.encode_dod(dod);
            self.prev_delta = delta;
        }
        self.prev = timestamp;
        self.count += 1;
    }

    fn encode_dod(&mut self, dod: i64) {
        if dod == 0 {
            self.writer.write_bit(false);
        } else if (-63..=64).contains(&dod) {
            self.writer.write_bits(0b10, 2);
            self.writer.write_bits((dod + 63) as u64, 7);
        } else if (-255..=256).contains(&dod) {
            self.writer.write_bits(0b110, 3);
            self.writer.write_bits((dod + 255) as u64, 9);
        } else if (-2047..=2048).contains(&dod) {
            self.writer.write_bits(0b1110, 4);
            self.writer.write_bits((dod + 2047) as u64, 12);
        } else {
            self.writer.write_bits(0b1111, 4);
            self.writer.write_bits(dod as u64, 64);
        }
    }

    /// Number of timestamps pushed
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

impl Default for TimestampEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decoder for one timestamp column
pub struct TimestampDecoder<'a> {
    reader: BitReader<'a>,
    remaining: usize,
    first: bool,
    prev: i64,
    prev_delta: i64,
}

impl<'a> TimestampDecoder<'a> {
    pub fn new(data: &'a [u8], count: usize) -> Self {
        Self {
            reader: BitReader::new(data),
            remaining: count,
            first: true,
            prev: 0,
            prev_delta: 0,
        }
    }

    /// Decode the next timestamp, or `None` when the column is exhausted
    pub fn decode_next(&mut self) -> Result<Option<i64>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;

        if self.first {
            self.first = false;
            let ts = self.read_bits(64)? as i64;
            self.prev = ts;
            return Ok(Some(ts));
        }

        let dod = self.decode_dod()?;
        let delta = self.prev_delta + dod;
        let ts = self.prev + delta;
        self.prev_delta = delta;
        self.prev = ts;
        Ok(Some(ts))
    }

    /// Decode the whole column
    pub fn decode_all(mut self) -> Result<Vec<i64>> {
        let mut out = Vec::with_capacity(self.remaining);
        while let Some(ts) = self.decode_next()? {
            out.push(ts);
        }
        Ok(out)
    }

    fn decode_dod(&mut self) -> Result<i64> {
        if !self.read_bit()? {
            return Ok(0);
        }
        if !self.read_bit()? {
            return Ok(self.read_bits(7)? as i64 - 63);
        }
        if !self.read_bit()? {
            return Ok(self.read_bits(9)? as i64 - 255);
        }
        if !self.read_bit()? {
            return Ok(self.read_bits(12)? as i64 - 2047);
        }
        Ok(self.read_bits(64)? as i64)
    }

    fn read_bit(&mut self) -> Result<bool> {
        self.reader
            .read_bit()
            .ok_or_else(|| TephraError::Compression("truncated timestamp column".into()))
    }

    fn read_bits(&mut self, n: usize) -> Result<u64> {
        self.reader
            .read_bits(n)
            .ok_or_else(|| TephraError::Compression("truncated timestamp column".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(timestamps: &[i64]) {
        let mut enc = TimestampEncoder::new();
        for &ts in timestamps {
            enc.push(ts);
        }
        let data = enc.finish();
        let decoded = TimestampDecoder::new(&data, timestamps.len())
            .decode_all()
            .unwrap();
        assert_eq!(decoded, timestamps);
    }

    #[test]
    fn test_single() {
        roundtrip(&[1_700_000_000_000]);
        roundtrip(&[-5]);
        roundtrip(&[0]);
    }

    #[test]
    fn test_constant_interval() {
        let timestamps: Vec<i64> = (0..500).map(|i| 1_700_000_000_000 + i * 10_000).collect();
        let mut enc = TimestampEncoder::new();
        for &ts in &timestamps {
            enc.push(ts);
        }
        let data = enc.finish();
        // one raw value plus roughly one bit per sample afterwards
        assert!(data.len() < 8 + timestamps.len() / 4);
        let decoded = TimestampDecoder::new(&data, timestamps.len())
            .decode_all()
            .unwrap();
        assert_eq!(decoded, timestamps);
    }

    #[test]
    fn test_jittered_and_jumping() {
        let mut ts = 1_700_000_000_000i64;
        let mut timestamps = Vec::new();
        for i in 0..300 {
            timestamps.push(ts);
            ts += match i % 5 {
                0 => 1,
                1 => 10_000,
                2 => 9_999,
                3 => 1_000_000,
                _ => 86_400_000,
            };
        }
        roundtrip(&timestamps);
    }

    #[test]
    fn test_duplicate_timestamps() {
        roundtrip(&[100, 100, 100, 200, 200, 300]);
    }

    #[test]
    fn test_truncated_column_errors() {
        let mut enc = TimestampEncoder::new();
        for i in 0..10 {
            enc.push(i * 1000);
        }
        let data = enc.finish();
        // claim more rows than were encoded
        let err = TimestampDecoder::new(&data[..4], 10).decode_all();
        assert!(err.is_err());
    }
}
