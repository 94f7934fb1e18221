//! Block payload layout
//!
//! A block holds rows for exactly one Tsid with non-decreasing timestamps,
//! stored as two compressed columns. The payload carries a small header and
//! the two columns; its CRC32 lives in the owning part's block index so that
//! index scans never touch payload bytes.

use crate::encoding::{
    round_to_precision_bits, TimestampDecoder, TimestampEncoder, ValueDecoder, ValueEncoder,
};
use crate::{Result, TephraError, TimeRange, Tsid};
use bytes::{Buf, BufMut, BytesMut};

/// Maximum rows in a single block
pub const MAX_ROWS_PER_BLOCK: usize = 8192;

const PAYLOAD_HEADER_SIZE: usize = 4 + 1 + 4 + 4;

/// Decoded rows for one Tsid
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    /// Series all rows belong to
    pub tsid: Tsid,
    /// Non-decreasing timestamps
    pub timestamps: Vec<i64>,
    /// Values, parallel to `timestamps`
    pub values: Vec<f64>,
}

impl Block {
    pub fn new(tsid: Tsid, timestamps: Vec<i64>, values: Vec<f64>) -> Self {
        debug_assert_eq!(timestamps.len(), values.len());
        Self {
            tsid,
            timestamps,
            values,
        }
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Smallest timestamp; blocks are never empty once built
    pub fn min_timestamp(&self) -> i64 {
        self.timestamps.first().copied().unwrap_or(0)
    }

    /// Largest timestamp
    pub fn max_timestamp(&self) -> i64 {
        self.timestamps.last().copied().unwrap_or(0)
    }

    /// Drop rows outside the half-open range
    pub fn trim_to_range(&mut self, tr: &TimeRange) {
        let start = self.timestamps.partition_point(|&ts| ts < tr.min_timestamp);
        let end = self.timestamps.partition_point(|&ts| ts < tr.max_timestamp);
        if start == 0 && end == self.timestamps.len() {
            return;
        }
        self.timestamps.drain(..start);
        self.timestamps.truncate(end - start);
        self.values.drain(..start);
        self.values.truncate(end - start);
    }
}

/// Encode one block's rows into a payload.
///
/// Values are rounded to `precision_bits` first. Returns the payload bytes
/// and their CRC32.
pub(crate) fn encode_block_payload(
    timestamps: &[i64],
    values: &[f64],
    precision_bits: u8,
    lz4: bool,
) -> (Vec<u8>, u32) {
    debug_assert!(!timestamps.is_empty());
    debug_assert_eq!(timestamps.len(), values.len());

    let mut ts_enc = TimestampEncoder::new();
    for &ts in timestamps {
        ts_enc.push(ts);
    }
    let ts_col = ts_enc.finish();

    let mut val_enc = ValueEncoder::new();
    for &v in values {
        val_enc.push(round_to_precision_bits(v, precision_bits));
    }
    let val_col = val_enc.finish();

    let mut inner = BytesMut::with_capacity(PAYLOAD_HEADER_SIZE + ts_col.len() + val_col.len());
    inner.put_u32_le(timestamps.len() as u32);
    inner.put_u8(precision_bits);
    inner.put_u32_le(ts_col.len() as u32);
    inner.put_u32_le(val_col.len() as u32);
    inner.put_slice(&ts_col);
    inner.put_slice(&val_col);

    let mut out = Vec::with_capacity(inner.len() + 1);
    if lz4 {
        out.push(1);
        out.extend_from_slice(&lz4_flex::compress_prepend_size(&inner));
    } else {
        out.push(0);
        out.extend_from_slice(&inner);
    }
    let crc = crc32fast::hash(&out);
    (out, crc)
}

/// Decode a block payload previously produced by [`encode_block_payload`].
///
/// `expected_crc` and `expected_rows` come from the block index entry; any
/// mismatch means the part is corrupt.
pub(crate) fn decode_block_payload(
    data: &[u8],
    expected_crc: u32,
    expected_rows: u32,
    tsid: Tsid,
) -> Result<Block> {
    let actual = crc32fast::hash(data);
    if actual != expected_crc {
        return Err(TephraError::ChecksumMismatch {
            expected: expected_crc,
            actual,
        });
    }
    if data.is_empty() {
        return Err(TephraError::Corruption("empty block payload".into()));
    }

    let inner;
    let decompressed;
    match data[0] {
        0 => inner = &data[1..],
        1 => {
            decompressed = lz4_flex::decompress_size_prepended(&data[1..])
                .map_err(|e| TephraError::Compression(e.to_string()))?;
            inner = &decompressed;
        }
        flag => {
            return Err(TephraError::Corruption(format!(
                "unknown block compression flag {flag}"
            )))
        }
    }

    if inner.len() < PAYLOAD_HEADER_SIZE {
        return Err(TephraError::Corruption("block payload too short".into()));
    }
    let mut cursor = inner;
    let rows = cursor.get_u32_le();
    let _precision_bits = cursor.get_u8();
    let ts_len = cursor.get_u32_le() as usize;
    let val_len = cursor.get_u32_le() as usize;

    if rows != expected_rows {
        return Err(TephraError::Corruption(format!(
            "block row count {rows} does not match index entry {expected_rows}"
        )));
    }
    if cursor.remaining() != ts_len + val_len {
        return Err(TephraError::Corruption(format!(
            "block column sizes {ts_len}+{val_len} do not match payload length {}",
            cursor.remaining()
        )));
    }

    let timestamps = TimestampDecoder::new(&cursor[..ts_len], rows as usize).decode_all()?;
    let values = ValueDecoder::new(&cursor[ts_len..], rows as usize).decode_all()?;

    Ok(Block::new(tsid, timestamps, values))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rows(n: usize) -> (Vec<i64>, Vec<f64>) {
        let timestamps: Vec<i64> = (0..n as i64).map(|i| 1_700_000_000_000 + i * 15_000).collect();
        let values: Vec<f64> = (0..n).map(|i| 100.0 + (i as f64 * 0.7).cos() * 3.0).collect();
        (timestamps, values)
    }

    #[test]
    fn test_payload_roundtrip_all_sizes() {
        for n in [1usize, 2, 7, 100, MAX_ROWS_PER_BLOCK] {
            for lz4 in [false, true] {
                let (timestamps, values) = sample_rows(n);
                let (payload, crc) = encode_block_payload(&timestamps, &values, 64, lz4);
                let block =
                    decode_block_payload(&payload, crc, n as u32, Tsid::from_metric_id(9)).unwrap();
                assert_eq!(block.timestamps, timestamps);
                assert_eq!(block.values, values);
                assert_eq!(block.tsid, Tsid::from_metric_id(9));
            }
        }
    }

    #[test]
    fn test_lossy_roundtrip_within_tolerance() {
        let (timestamps, values) = sample_rows(512);
        for bits in [8u8, 16, 24, 32] {
            let (payload, crc) = encode_block_payload(&timestamps, &values, bits, true);
            let block =
                decode_block_payload(&payload, crc, 512, Tsid::from_metric_id(1)).unwrap();
            assert_eq!(block.timestamps, timestamps);
            let tol = 2f64.powi(-(bits as i32));
            for (orig, got) in values.iter().zip(block.values.iter()) {
                assert!(((orig - got) / orig).abs() <= tol, "bits={bits}: {orig} vs {got}");
            }
        }
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let (timestamps, values) = sample_rows(64);
        let (mut payload, crc) = encode_block_payload(&timestamps, &values, 64, false);
        payload[10] ^= 0x40;
        let err = decode_block_payload(&payload, crc, 64, Tsid::default()).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_truncated_payload_detected() {
        let (timestamps, values) = sample_rows(64);
        let (payload, crc) = encode_block_payload(&timestamps, &values, 64, false);
        let err =
            decode_block_payload(&payload[..payload.len() / 2], crc, 64, Tsid::default())
                .unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_row_count_mismatch_detected() {
        let (timestamps, values) = sample_rows(10);
        let (payload, crc) = encode_block_payload(&timestamps, &values, 64, false);
        let err = decode_block_payload(&payload, crc, 11, Tsid::default()).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_trim_to_range() {
        let (timestamps, values) = sample_rows(10);
        let mut block = Block::new(Tsid::default(), timestamps.clone(), values);

        let mut full = block.clone();
        full.trim_to_range(&TimeRange::new(i64::MIN, i64::MAX));
        assert_eq!(full.len(), 10);

        block.trim_to_range(&TimeRange::new(timestamps[2], timestamps[7]));
        assert_eq!(block.len(), 5);
        assert_eq!(block.min_timestamp(), timestamps[2]);
        assert_eq!(block.max_timestamp(), timestamps[6]);

        let mut empty = full.clone();
        empty.trim_to_range(&TimeRange::new(0, 1));
        assert!(empty.is_empty());
    }
}
