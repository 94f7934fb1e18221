//! Core types for tephra

use crate::{Result, TephraError};
use bytes::{Buf, BufMut};
use std::fmt;

/// Timestamp in milliseconds since Unix epoch
pub type Timestamp = i64;

/// Identifier of one time series.
///
/// Ordering is field-by-field in declaration order; `metric_id` is unique per
/// series and acts as the primary sort/dedup component once the grouping
/// fields are equal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tsid {
    /// Metric group the series belongs to
    pub metric_group_id: u64,
    /// Job tag id
    pub job_id: u32,
    /// Instance tag id
    pub instance_id: u32,
    /// Unique metric id
    pub metric_id: u64,
}

impl Tsid {
    /// Wire size in bytes
    pub const SIZE: usize = 24;

    /// Create a Tsid carrying only a metric id
    pub fn from_metric_id(metric_id: u64) -> Self {
        Self {
            metric_id,
            ..Self::default()
        }
    }

    /// Serialize into a buffer
    pub fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.metric_group_id);
        buf.put_u32_le(self.job_id);
        buf.put_u32_le(self.instance_id);
        buf.put_u64_le(self.metric_id);
    }

    /// Deserialize from a buffer
    pub fn read_from(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(TephraError::InvalidFormat("Tsid too short".into()));
        }
        Ok(Self {
            metric_group_id: buf.get_u64_le(),
            job_id: buf.get_u32_le(),
            instance_id: buf.get_u32_le(),
            metric_id: buf.get_u64_le(),
        })
    }
}

impl fmt::Display for Tsid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.metric_group_id, self.job_id, self.instance_id, self.metric_id
        )
    }
}

/// One ingested sample. Exists only until flushed into a part.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawRow {
    /// Series the sample belongs to
    pub tsid: Tsid,
    /// Timestamp in milliseconds
    pub timestamp: Timestamp,
    /// Sample value
    pub value: f64,
    /// Significant mantissa bits to keep when encoding the value;
    /// 53 and above means lossless
    pub precision_bits: u8,
}

impl RawRow {
    /// Create a new row with lossless precision
    pub fn new(tsid: Tsid, timestamp: Timestamp, value: f64) -> Self {
        Self {
            tsid,
            timestamp,
            value,
            precision_bits: 64,
        }
    }

    /// Create a new row with the given precision
    pub fn with_precision(tsid: Tsid, timestamp: Timestamp, value: f64, precision_bits: u8) -> Self {
        Self {
            tsid,
            timestamp,
            value,
            precision_bits,
        }
    }
}

/// Half-open time range `[min_timestamp, max_timestamp)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub min_timestamp: Timestamp,
    /// End timestamp (exclusive)
    pub max_timestamp: Timestamp,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(min_timestamp: Timestamp, max_timestamp: Timestamp) -> Self {
        Self {
            min_timestamp,
            max_timestamp,
        }
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.min_timestamp && ts < self.max_timestamp
    }

    /// Check if two ranges overlap
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.min_timestamp < other.max_timestamp && other.min_timestamp < self.max_timestamp
    }

    /// Check if the range contains no timestamps
    pub fn is_empty(&self) -> bool {
        self.min_timestamp >= self.max_timestamp
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.min_timestamp, self.max_timestamp)
    }
}

/// Aggregate counters for one partition
#[derive(Debug, Clone, Copy, Default)]
pub struct PartitionMetrics {
    pub parts_count: u64,
    pub in_memory_parts_count: u64,
    pub blocks_count: u64,
    pub rows_count: u64,
    pub pending_rows_count: u64,
    pub bytes_size: u64,
}

/// Aggregate counters for one table
#[derive(Debug, Clone, Copy, Default)]
pub struct TableMetrics {
    pub partitions_count: u64,
    pub parts_count: u64,
    pub in_memory_parts_count: u64,
    pub blocks_count: u64,
    pub rows_count: u64,
    pub pending_rows_count: u64,
    pub bytes_size: u64,
}

impl TableMetrics {
    /// Total rows, counting both flushed and still-pending ones
    pub fn total_rows_count(&self) -> u64 {
        self.rows_count + self.pending_rows_count
    }

    pub(crate) fn add_partition(&mut self, pm: &PartitionMetrics) {
        self.partitions_count += 1;
        self.parts_count += pm.parts_count;
        self.in_memory_parts_count += pm.in_memory_parts_count;
        self.blocks_count += pm.blocks_count;
        self.rows_count += pm.rows_count;
        self.pending_rows_count += pm.pending_rows_count;
        self.bytes_size += pm.bytes_size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_tsid_ordering() {
        let a = Tsid {
            metric_group_id: 1,
            job_id: 2,
            instance_id: 3,
            metric_id: 4,
        };
        let b = Tsid {
            metric_group_id: 1,
            job_id: 2,
            instance_id: 3,
            metric_id: 5,
        };
        let c = Tsid {
            metric_group_id: 2,
            job_id: 0,
            instance_id: 0,
            metric_id: 0,
        };

        assert!(a < b);
        assert!(b < c);
        assert!(a < c);
        assert_eq!(a, a);
    }

    #[test]
    fn test_tsid_wire_roundtrip() {
        let tsid = Tsid {
            metric_group_id: 0xDEAD_BEEF,
            job_id: 7,
            instance_id: 42,
            metric_id: u64::MAX,
        };

        let mut buf = BytesMut::new();
        tsid.write_to(&mut buf);
        assert_eq!(buf.len(), Tsid::SIZE);

        let mut rd = buf.freeze();
        let restored = Tsid::read_from(&mut rd).unwrap();
        assert_eq!(restored, tsid);
    }

    #[test]
    fn test_tsid_read_short_buffer() {
        let mut short = &b"abc"[..];
        assert!(Tsid::read_from(&mut short).is_err());
    }

    #[test]
    fn test_time_range() {
        let range = TimeRange::new(100, 200);

        assert!(range.contains(100));
        assert!(range.contains(199));
        assert!(!range.contains(200));
        assert!(!range.contains(99));

        assert!(range.overlaps(&TimeRange::new(150, 250)));
        assert!(range.overlaps(&TimeRange::new(199, 300)));
        assert!(!range.overlaps(&TimeRange::new(200, 300)));
        assert!(!range.overlaps(&TimeRange::new(0, 100)));
        assert!(TimeRange::new(100, 100).is_empty());
    }
}
