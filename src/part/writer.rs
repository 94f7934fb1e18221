//! Part writer
//!
//! Turns a `(tsid, timestamp)`-ordered row stream into capped per-Tsid
//! blocks and commits them as one new part, either in memory or on disk.
//! Both the flush path and the merger feed it.

use super::{
    commit_part_files, encode_block_payload, encode_index, BlockIndexEntry, Part, PartMeta,
    MAX_ROWS_PER_BLOCK,
};
use crate::{RawRow, Result, TephraError, Tsid};
use bytes::BytesMut;
use std::path::Path;

/// Builder for one immutable part
pub struct PartWriter {
    lz4: bool,
    data: BytesMut,
    index: Vec<BlockIndexEntry>,

    // current per-Tsid run
    cur_tsid: Option<Tsid>,
    cur_timestamps: Vec<i64>,
    cur_values: Vec<f64>,
    cur_precision: u8,

    rows_count: u64,
    min_timestamp: i64,
    max_timestamp: i64,
}

impl PartWriter {
    /// Create a new writer; `lz4` enables payload compression
    pub fn new(lz4: bool) -> Self {
        Self {
            lz4,
            data: BytesMut::new(),
            index: Vec::new(),
            cur_tsid: None,
            cur_timestamps: Vec::new(),
            cur_values: Vec::new(),
            cur_precision: 0,
            rows_count: 0,
            min_timestamp: i64::MAX,
            max_timestamp: i64::MIN,
        }
    }

    /// Append one row. Rows must arrive in `(tsid, timestamp)` order.
    pub fn push_row(&mut self, tsid: Tsid, timestamp: i64, value: f64, precision_bits: u8) {
        let start_new_run = match self.cur_tsid {
            Some(cur) => cur != tsid || self.cur_timestamps.len() >= MAX_ROWS_PER_BLOCK,
            None => true,
        };
        if start_new_run {
            debug_assert!(self.cur_tsid.map_or(true, |cur| cur <= tsid));
            self.flush_run();
            self.cur_tsid = Some(tsid);
            self.cur_precision = 0;
        }
        debug_assert!(self
            .cur_timestamps
            .last()
            .map_or(true, |&last| last <= timestamp));

        self.cur_timestamps.push(timestamp);
        self.cur_values.push(value);
        // the least lossy precision among the run's rows wins
        self.cur_precision = self.cur_precision.max(precision_bits);
        self.rows_count += 1;
        self.min_timestamp = self.min_timestamp.min(timestamp);
        self.max_timestamp = self.max_timestamp.max(timestamp);
    }

    /// Append a pre-sorted batch of rows
    pub fn push_sorted_rows(&mut self, rows: &[RawRow]) {
        for row in rows {
            self.push_row(row.tsid, row.timestamp, row.value, row.precision_bits);
        }
    }

    /// Rows appended so far
    pub fn rows_count(&self) -> u64 {
        self.rows_count
    }

    pub fn is_empty(&self) -> bool {
        self.rows_count == 0
    }

    fn flush_run(&mut self) {
        let Some(tsid) = self.cur_tsid else {
            return;
        };
        if self.cur_timestamps.is_empty() {
            return;
        }
        let (payload, crc) = encode_block_payload(
            &self.cur_timestamps,
            &self.cur_values,
            self.cur_precision,
            self.lz4,
        );
        self.index.push(BlockIndexEntry {
            tsid,
            min_timestamp: self.cur_timestamps[0],
            max_timestamp: self.cur_timestamps[self.cur_timestamps.len() - 1],
            rows_count: self.cur_timestamps.len() as u32,
            precision_bits: self.cur_precision,
            offset: self.data.len() as u64,
            size: payload.len() as u32,
            crc,
        });
        self.data.extend_from_slice(&payload);
        self.cur_timestamps.clear();
        self.cur_values.clear();
    }

    fn finish(mut self) -> Result<(PartMeta, Vec<BlockIndexEntry>, BytesMut)> {
        self.flush_run();
        if self.index.is_empty() {
            return Err(TephraError::Internal("refusing to build an empty part".into()));
        }
        let meta = PartMeta {
            rows_count: self.rows_count,
            blocks_count: self.index.len() as u32,
            min_timestamp: self.min_timestamp,
            max_timestamp: self.max_timestamp,
            size_bytes: (self.data.len() + encode_index(&self.index).len()) as u64,
        };
        Ok((meta, self.index, self.data))
    }

    /// Seal the part in memory
    pub fn finish_in_memory(self, generation: u64) -> Result<Part> {
        let (meta, index, data) = self.finish()?;
        Ok(Part::new_in_memory(generation, meta, index, data.freeze()))
    }

    /// Seal the part on disk under `partition_dir`, committed atomically
    pub fn finish_to_disk(self, generation: u64, partition_dir: &Path) -> Result<Part> {
        let (meta, index, data) = self.finish()?;
        let dir = commit_part_files(partition_dir, generation, &meta, &index, &data)?;
        Part::open(&dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TimeRange;

    fn tsid(id: u64) -> Tsid {
        Tsid::from_metric_id(id)
    }

    #[test]
    fn test_runs_split_by_tsid() {
        let mut w = PartWriter::new(false);
        for i in 0..10 {
            w.push_row(tsid(1), 1000 + i, i as f64, 64);
        }
        for i in 0..5 {
            w.push_row(tsid(2), 2000 + i, i as f64, 64);
        }
        let part = w.finish_in_memory(1).unwrap();

        assert_eq!(part.meta().rows_count, 15);
        assert_eq!(part.meta().blocks_count, 2);
        assert_eq!(part.index()[0].tsid, tsid(1));
        assert_eq!(part.index()[0].rows_count, 10);
        assert_eq!(part.index()[1].tsid, tsid(2));
        assert_eq!(part.index()[1].rows_count, 5);
        assert_eq!(part.time_range(), TimeRange::new(1000, 2005));
    }

    #[test]
    fn test_runs_capped_at_max_rows() {
        let mut w = PartWriter::new(true);
        let n = MAX_ROWS_PER_BLOCK + 100;
        for i in 0..n {
            w.push_row(tsid(1), i as i64, 1.0, 64);
        }
        let part = w.finish_in_memory(1).unwrap();

        assert_eq!(part.meta().blocks_count, 2);
        assert_eq!(part.index()[0].rows_count as usize, MAX_ROWS_PER_BLOCK);
        assert_eq!(part.index()[1].rows_count as usize, 100);

        // blocks for one tsid must not overlap in time
        assert!(part.index()[0].max_timestamp < part.index()[1].min_timestamp);
    }

    #[test]
    fn test_roundtrip_through_blocks() {
        let mut w = PartWriter::new(true);
        let mut expected = Vec::new();
        for id in [5u64, 6] {
            for i in 0..300i64 {
                let ts = 1_700_000_000_000 + i * 500;
                let v = id as f64 * 10.0 + (i as f64 * 0.01).sin();
                w.push_row(tsid(id), ts, v, 64);
                expected.push((tsid(id), ts, v));
            }
        }
        let part = w.finish_in_memory(3).unwrap();
        assert_eq!(part.generation(), 3);

        let mut got = Vec::new();
        for entry in part.index() {
            let block = part.read_block(entry).unwrap();
            for (ts, v) in block.timestamps.iter().zip(block.values.iter()) {
                got.push((block.tsid, *ts, *v));
            }
        }
        assert_eq!(got, expected);
    }

    #[test]
    fn test_empty_writer_refused() {
        let w = PartWriter::new(false);
        assert!(w.finish_in_memory(1).is_err());
    }

    #[test]
    fn test_run_precision_takes_least_lossy() {
        let mut w = PartWriter::new(false);
        w.push_row(tsid(1), 1, 1.0, 8);
        w.push_row(tsid(1), 2, 2.0, 32);
        w.push_row(tsid(1), 3, 3.0, 16);
        let part = w.finish_in_memory(1).unwrap();
        assert_eq!(part.index()[0].precision_bits, 32);
    }
}
