//! Table search
//!
//! A search merges forward cursors over every part of every partition that
//! overlaps the requested time range, yielding blocks ordered by
//! `(tsid, min_timestamp)` and restricted to the requested Tsid set. Cursor
//! positioning works entirely on block indexes; payloads are only touched
//! when a block is actually read.
//!
//! Part-set snapshots pin the parts for the lifetime of the search, so
//! concurrent flushes and merges never invalidate an iteration; references
//! drop when the search does.

use crate::part::{Block, BlockIndexEntry, Part};
use crate::table::Table;
use crate::{Result, TephraError, TimeRange, Tsid};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

/// Cooperative cancellation for a running search
#[derive(Clone)]
pub struct SearchStopHandle(Arc<AtomicBool>);

impl SearchStopHandle {
    /// Stop the search; checked between block productions
    pub fn stop(&self) {
        self.0.store(true, AtomicOrdering::SeqCst);
    }
}

/// Reference to one matching block; decoding is deferred until
/// [`read_block`](BlockRef::read_block)
pub struct BlockRef {
    part: Arc<Part>,
    entry: BlockIndexEntry,
    trim: TimeRange,
}

impl BlockRef {
    pub fn tsid(&self) -> Tsid {
        self.entry.tsid
    }

    /// Time range covered by the underlying block, before trimming
    pub fn time_range(&self) -> TimeRange {
        self.entry.time_range()
    }

    pub fn rows_count(&self) -> u32 {
        self.entry.rows_count
    }

    /// Decode the block, trimmed to the search's time range.
    ///
    /// May come back empty when the block only brushes the range.
    pub fn read_block(&self) -> Result<Block> {
        let mut block = self.part.read_block(&self.entry)?;
        block.trim_to_range(&self.trim);
        Ok(block)
    }
}

/// Forward cursor over one part's matching blocks
pub(crate) struct PartCursor {
    part: Arc<Part>,
    tsids: Arc<[Tsid]>,
    tr: TimeRange,
    pos: usize,
    tsid_pos: usize,
}

impl PartCursor {
    /// Build a cursor positioned on the first matching block, or `None`
    /// when the part holds nothing relevant
    pub(crate) fn new(part: Arc<Part>, tsids: Arc<[Tsid]>, tr: TimeRange) -> Option<Self> {
        if tsids.is_empty() || !part.time_range().overlaps(&tr) {
            return None;
        }
        let mut cursor = Self {
            part,
            tsids,
            tr,
            pos: 0,
            tsid_pos: 0,
        };
        if cursor.seek() {
            Some(cursor)
        } else {
            None
        }
    }

    fn current_entry(&self) -> &BlockIndexEntry {
        &self.part.index()[self.pos]
    }

    /// Move past the current block to the next match
    fn advance(&mut self) -> bool {
        self.pos += 1;
        self.seek()
    }

    /// Position `pos` on the next block whose tsid is in the requested set
    /// and whose time range intersects the query range, using only the index.
    fn seek(&mut self) -> bool {
        let index = self.part.index();
        loop {
            if self.pos >= index.len() || self.tsid_pos >= self.tsids.len() {
                return false;
            }
            let entry = &index[self.pos];
            let want = self.tsids[self.tsid_pos];

            if entry.tsid < want {
                // jump over blocks for series below the requested one
                self.pos += index[self.pos..].partition_point(|e| e.tsid < want);
                continue;
            }
            if entry.tsid > want {
                // the request list has fallen behind; catch it up
                self.tsid_pos += self.tsids[self.tsid_pos..].partition_point(|t| *t < entry.tsid);
                continue;
            }

            if entry.max_timestamp < self.tr.min_timestamp {
                self.pos += 1;
                continue;
            }
            if entry.min_timestamp >= self.tr.max_timestamp {
                // blocks for one tsid are time-ordered: the rest of this
                // series is beyond the range too
                self.pos += index[self.pos..].partition_point(|e| e.tsid <= want);
                continue;
            }
            return true;
        }
    }

    fn key(&self) -> (Tsid, i64, Reverse<u64>) {
        let entry = self.current_entry();
        (
            entry.tsid,
            entry.min_timestamp,
            Reverse(self.part.generation()),
        )
    }
}

struct HeapEntry {
    cursor: PartCursor,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cursor.key() == other.cursor.key()
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert for smallest-key-first
        other.cursor.key().cmp(&self.cursor.key())
    }
}

/// Lazy iteration over every matching block of one table.
///
/// Finite, not restartable; create a fresh search per query. Dropping the
/// search releases every pinned part regardless of how it ended.
pub struct TableSearch {
    heap: BinaryHeap<HeapEntry>,
    err: Option<TephraError>,
    stop: Arc<AtomicBool>,
}

impl TableSearch {
    /// Prepare a search over `table` for the given Tsid set and time range.
    ///
    /// Pending rows of overlapping partitions are flushed first so the
    /// still-unbuffered data is visible; part-set snapshots are taken
    /// afterwards.
    pub fn init(table: &Table, tsids: &[Tsid], tr: TimeRange) -> TableSearch {
        let mut sorted = tsids.to_vec();
        sorted.sort();
        sorted.dedup();
        let tsids: Arc<[Tsid]> = sorted.into();

        let mut search = TableSearch {
            heap: BinaryHeap::new(),
            err: None,
            stop: Arc::new(AtomicBool::new(false)),
        };
        if tsids.is_empty() || tr.is_empty() {
            return search;
        }

        for partition in table.partitions_snapshot() {
            if !partition.time_range().overlaps(&tr) {
                continue;
            }
            if let Err(e) = partition.flush_pending() {
                search.err = Some(e);
                search.heap.clear();
                return search;
            }
            for part in partition.snapshot_parts() {
                if let Some(cursor) = PartCursor::new(part, tsids.clone(), tr) {
                    search.heap.push(HeapEntry { cursor });
                }
            }
        }
        search
    }

    /// Next matching block reference in `(tsid, min_timestamp)` order,
    /// without touching payload bytes
    pub fn next_block_ref(&mut self) -> Option<BlockRef> {
        if self.err.is_some() {
            return None;
        }
        if self.stop.load(AtomicOrdering::SeqCst) {
            self.heap.clear();
            return None;
        }
        let mut entry = self.heap.pop()?;
        let block_ref = BlockRef {
            part: entry.cursor.part.clone(),
            entry: *entry.cursor.current_entry(),
            trim: entry.cursor.tr,
        };
        if entry.cursor.advance() {
            self.heap.push(entry);
        }
        Some(block_ref)
    }

    /// Next decoded block, trimmed to the time range.
    ///
    /// A decoding failure terminates the search; inspect
    /// [`error`](TableSearch::error) after `None`.
    pub fn next_block(&mut self) -> Option<Block> {
        loop {
            let block_ref = self.next_block_ref()?;
            match block_ref.read_block() {
                Ok(block) if block.is_empty() => continue,
                Ok(block) => return Some(block),
                Err(e) => {
                    self.err = Some(e);
                    self.heap.clear();
                    return None;
                }
            }
        }
    }

    /// Terminal error, set when iteration ended abnormally
    pub fn error(&self) -> Option<&TephraError> {
        self.err.as_ref()
    }

    /// Handle for cancelling the search from another thread
    pub fn stop_handle(&self) -> SearchStopHandle {
        SearchStopHandle(self.stop.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::PartWriter;
    use crate::RawRow;

    fn tsid(id: u64) -> Tsid {
        Tsid::from_metric_id(id)
    }

    fn part_with(rows: &[(u64, i64, f64)], generation: u64) -> Arc<Part> {
        let mut sorted: Vec<RawRow> = rows
            .iter()
            .map(|&(id, ts, v)| RawRow::new(tsid(id), ts, v))
            .collect();
        sorted.sort_by(|a, b| (a.tsid, a.timestamp).cmp(&(b.tsid, b.timestamp)));
        let mut w = PartWriter::new(false);
        w.push_sorted_rows(&sorted);
        Arc::new(w.finish_in_memory(generation).unwrap())
    }

    fn requested(ids: &[u64]) -> Arc<[Tsid]> {
        let v: Vec<Tsid> = ids.iter().map(|&id| tsid(id)).collect();
        v.into()
    }

    fn collect_entries(mut cursor: PartCursor) -> Vec<(u64, i64)> {
        let mut out = Vec::new();
        loop {
            let e = cursor.current_entry();
            out.push((e.tsid.metric_id, e.min_timestamp));
            if !cursor.advance() {
                return out;
            }
        }
    }

    #[test]
    fn test_cursor_filters_tsids() {
        let part = part_with(
            &[(1, 10, 1.0), (2, 10, 2.0), (3, 10, 3.0), (5, 10, 5.0)],
            1,
        );
        let cursor = PartCursor::new(part, requested(&[2, 4, 5]), TimeRange::new(0, 100)).unwrap();
        assert_eq!(collect_entries(cursor), vec![(2, 10), (5, 10)]);
    }

    #[test]
    fn test_cursor_filters_time_range() {
        let part = part_with(
            &[
                (1, 10, 1.0),
                (1, 20, 2.0),
                (2, 10, 1.0),
                (2, 30, 3.0),
            ],
            1,
        );
        // range touches only timestamp 10; both series have a matching block,
        // pruning is by block metadata
        let cursor =
            PartCursor::new(part.clone(), requested(&[1, 2]), TimeRange::new(0, 15)).unwrap();
        let hits = collect_entries(cursor);
        assert_eq!(hits.len(), 2);

        // range beyond every block
        assert!(PartCursor::new(part.clone(), requested(&[1, 2]), TimeRange::new(50, 99)).is_none());
        // range before every block
        assert!(PartCursor::new(part, requested(&[1, 2]), TimeRange::new(0, 10)).is_none());
    }

    #[test]
    fn test_cursor_empty_request() {
        let part = part_with(&[(1, 10, 1.0)], 1);
        assert!(PartCursor::new(part, requested(&[]), TimeRange::new(0, 100)).is_none());
    }

    #[test]
    fn test_cursor_no_matching_series() {
        let part = part_with(&[(2, 10, 1.0), (4, 10, 1.0)], 1);
        assert!(PartCursor::new(part, requested(&[1, 3, 5]), TimeRange::new(0, 100)).is_none());
    }

    #[test]
    fn test_cursor_skips_blocks_not_requested() {
        // many series in the part, only the extremes requested
        let mut rows = Vec::new();
        for id in 1..=50u64 {
            rows.push((id, 10, id as f64));
        }
        let part = part_with(&rows, 1);
        let cursor = PartCursor::new(part, requested(&[1, 50]), TimeRange::new(0, 100)).unwrap();
        assert_eq!(collect_entries(cursor), vec![(1, 10), (50, 10)]);
    }

    #[test]
    fn test_block_ref_trims() {
        let part = part_with(&[(1, 10, 1.0), (1, 20, 2.0), (1, 30, 3.0)], 1);
        let entry = part.index()[0];
        let block_ref = BlockRef {
            part,
            entry,
            trim: TimeRange::new(15, 30),
        };
        let block = block_ref.read_block().unwrap();
        assert_eq!(block.timestamps, vec![20]);
        assert_eq!(block.values, vec![2.0]);
    }
}
