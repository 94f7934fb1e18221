//! Background part merging
//!
//! Search cost grows with the number of parts, so a merger keeps the count
//! bounded: it repeatedly picks a same-size-tier group of parts, rewrites
//! them into one larger part and swaps it in atomically. Exact
//! `(tsid, timestamp)` duplicates collapse to the row from the
//! highest-generation input, so the last flush wins.

use crate::part::{Block, Part, PartWriter};
use crate::partition::Partition;
use crate::{Result, Tsid};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use tracing::info;

/// Merge policy configuration
#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Fewest parts worth merging at once
    pub min_merge_parts: usize,
    /// Most parts merged at once
    pub max_merge_parts: usize,
    /// Combined input size ceiling per merge
    pub max_merge_bytes: u64,
    /// The largest input may not exceed this multiple of the rest combined;
    /// keeps merges within one size tier and bounds write amplification
    pub tier_ratio: f64,
    /// Above this part count, the smallest parts merge even across tiers
    pub max_parts_per_partition: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            min_merge_parts: crate::config::MIN_MERGE_PARTS,
            max_merge_parts: crate::config::MAX_MERGE_PARTS,
            max_merge_bytes: 512 * 1024 * 1024,
            tier_ratio: 2.0,
            max_parts_per_partition: 30,
        }
    }
}

/// Pick a group of parts to merge, or `None` when the set is healthy
pub(crate) fn plan_merge(parts: &[Arc<Part>], cfg: &MergeConfig) -> Option<Vec<Arc<Part>>> {
    if parts.len() < cfg.min_merge_parts {
        return None;
    }
    let mut candidates: Vec<Arc<Part>> = parts.to_vec();
    candidates.sort_by_key(|p| p.meta().size_bytes);

    // widest group first: folding many small parts beats pairwise churn
    let upper = cfg.max_merge_parts.min(candidates.len());
    for count in (cfg.min_merge_parts..=upper).rev() {
        for window in candidates.windows(count) {
            let sum: u64 = window.iter().map(|p| p.meta().size_bytes).sum();
            if sum > cfg.max_merge_bytes {
                // windows only grow to the right
                break;
            }
            let largest = window.last().map_or(0, |p| p.meta().size_bytes);
            if (largest as f64) <= cfg.tier_ratio * (sum - largest) as f64 {
                return Some(window.to_vec());
            }
        }
    }

    // tier preference failed but the part count is out of hand; fold the
    // smallest parts regardless
    if candidates.len() > cfg.max_parts_per_partition {
        let window = &candidates[..cfg.min_merge_parts];
        let sum: u64 = window.iter().map(|p| p.meta().size_bytes).sum();
        if sum <= cfg.max_merge_bytes {
            return Some(window.to_vec());
        }
    }
    None
}

/// Statistics for one executed merge
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeStats {
    pub rows_written: u64,
    pub duplicates_dropped: u64,
}

/// Merge `inputs` into one new part and swap it into the partition.
///
/// Any failure before the swap leaves the partition untouched; the partial
/// output is discarded. Readers holding a snapshot of the inputs keep them
/// alive until they finish.
pub(crate) fn merge_parts(partition: &Partition, inputs: Vec<Arc<Part>>) -> Result<MergeStats> {
    debug_assert!(inputs.len() >= 2);
    let total_bytes: u64 = inputs.iter().map(|p| p.meta().size_bytes).sum();
    let all_in_memory = inputs.iter().all(|p| p.is_in_memory());

    let mut heap = BinaryHeap::with_capacity(inputs.len());
    for part in &inputs {
        heap.push(HeapEntry {
            cursor: RowCursor::new(part.clone())?,
        });
    }

    let mut writer = PartWriter::new(partition.config().lz4_compression);
    let mut stats = MergeStats::default();
    let mut last_key: Option<(Tsid, i64)> = None;

    while let Some(mut entry) = heap.pop() {
        let (tsid, timestamp, value, precision_bits) = entry.cursor.current();
        if last_key == Some((tsid, timestamp)) {
            // equal keys pop highest-generation first, so this one is older
            stats.duplicates_dropped += 1;
        } else {
            writer.push_row(tsid, timestamp, value, precision_bits);
            stats.rows_written += 1;
            last_key = Some((tsid, timestamp));
        }
        if entry.cursor.advance()? {
            heap.push(entry);
        }
    }

    let generation = partition.next_generation();
    let output = if all_in_memory && total_bytes <= partition.config().max_in_memory_part_bytes {
        writer.finish_in_memory(generation)?
    } else {
        writer.finish_to_disk(generation, partition.path())?
    };
    info!(
        "merged {} part(s) of partition {} into generation {:016X}: {} rows, {} duplicate(s) dropped",
        inputs.len(),
        partition.name(),
        generation,
        stats.rows_written,
        stats.duplicates_dropped,
    );
    partition.swap_merged(&inputs, Arc::new(output));
    Ok(stats)
}

/// Run at most one planned merge; returns whether anything was merged
pub(crate) fn run_merge_cycle(partition: &Partition, cfg: &MergeConfig) -> Result<bool> {
    let _guard = partition.merge_guard();
    let parts = partition.snapshot_parts();
    match plan_merge(&parts, cfg) {
        Some(inputs) => {
            merge_parts(partition, inputs)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Merge everything in the partition down to a single part
pub(crate) fn force_merge_partition(partition: &Partition) -> Result<()> {
    loop {
        let _guard = partition.merge_guard();
        let parts = partition.snapshot_parts();
        if parts.len() < 2 {
            return Ok(());
        }
        merge_parts(partition, parts)?;
    }
}

/// Forward row cursor over one part, in `(tsid, timestamp)` order
struct RowCursor {
    part: Arc<Part>,
    generation: u64,
    block_idx: usize,
    block: Block,
    precision_bits: u8,
    row_idx: usize,
}

impl RowCursor {
    fn new(part: Arc<Part>) -> Result<Self> {
        debug_assert!(!part.index().is_empty());
        let entry = part.index()[0];
        let block = part.read_block(&entry)?;
        Ok(Self {
            generation: part.generation(),
            block_idx: 0,
            block,
            precision_bits: entry.precision_bits,
            row_idx: 0,
            part,
        })
    }

    fn current(&self) -> (Tsid, i64, f64, u8) {
        (
            self.block.tsid,
            self.block.timestamps[self.row_idx],
            self.block.values[self.row_idx],
            self.precision_bits,
        )
    }

    /// Move to the next row; returns false when the part is exhausted
    fn advance(&mut self) -> Result<bool> {
        self.row_idx += 1;
        if self.row_idx < self.block.len() {
            return Ok(true);
        }
        self.block_idx += 1;
        match self.part.index().get(self.block_idx) {
            Some(entry) => {
                self.block = self.part.read_block(entry)?;
                self.precision_bits = entry.precision_bits;
                self.row_idx = 0;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn key(&self) -> (Tsid, i64, Reverse<u64>) {
        (
            self.block.tsid,
            self.block.timestamps[self.row_idx],
            Reverse(self.generation),
        )
    }
}

struct HeapEntry {
    cursor: RowCursor,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::{partition_name_for, partition_range_for};
    use crate::table::TableConfig;
    use crate::{RawRow, TephraError};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn mem_part(generation: u64, rows: &[(u64, i64, f64)]) -> Arc<Part> {
        let mut sorted: Vec<RawRow> = rows
            .iter()
            .map(|&(id, ts, v)| RawRow::new(Tsid::from_metric_id(id), ts, v))
            .collect();
        sorted.sort_by(|a, b| (a.tsid, a.timestamp).cmp(&(b.tsid, b.timestamp)));
        let mut w = PartWriter::new(false);
        w.push_sorted_rows(&sorted);
        Arc::new(w.finish_in_memory(generation).unwrap())
    }

    fn sized_part(generation: u64, approx_rows: usize) -> Arc<Part> {
        let rows: Vec<(u64, i64, f64)> = (0..approx_rows)
            .map(|i| (1, i as i64, i as f64))
            .collect();
        mem_part(generation, &rows)
    }

    fn test_partition(dir: &std::path::Path) -> Partition {
        let ts = 1_612_325_106_000;
        Partition::create(
            dir,
            partition_name_for(ts).unwrap(),
            partition_range_for(ts).unwrap(),
            Arc::new(TableConfig::default()),
        )
        .unwrap()
    }

    #[test]
    fn test_plan_needs_min_parts() {
        let cfg = MergeConfig::default();
        assert!(plan_merge(&[sized_part(1, 100)], &cfg).is_none());
        assert!(plan_merge(&[], &cfg).is_none());
    }

    #[test]
    fn test_plan_prefers_same_tier() {
        let cfg = MergeConfig {
            max_merge_parts: 4,
            ..MergeConfig::default()
        };
        // one huge part and three small ones: the huge one must stay out
        let parts = vec![
            sized_part(1, 50_000),
            sized_part(2, 100),
            sized_part(3, 120),
            sized_part(4, 90),
        ];
        let plan = plan_merge(&parts, &cfg).unwrap();
        assert_eq!(plan.len(), 3);
        assert!(plan.iter().all(|p| p.meta().rows_count < 1000));
    }

    #[test]
    fn test_plan_respects_byte_ceiling() {
        let cfg = MergeConfig {
            max_merge_bytes: 1,
            ..MergeConfig::default()
        };
        let parts = vec![sized_part(1, 100), sized_part(2, 100)];
        assert!(plan_merge(&parts, &cfg).is_none());
    }

    #[test]
    fn test_plan_force_folds_when_overcrowded() {
        let cfg = MergeConfig {
            tier_ratio: 0.0, // nothing passes the tier test
            max_parts_per_partition: 4,
            ..MergeConfig::default()
        };
        let parts: Vec<Arc<Part>> = (1..=6).map(|g| sized_part(g, 100 * g as usize)).collect();
        let plan = plan_merge(&parts, &cfg).unwrap();
        assert_eq!(plan.len(), cfg.min_merge_parts);
    }

    #[test]
    fn test_merge_preserves_multiset() {
        let dir = TempDir::new().unwrap();
        let partition = test_partition(dir.path());
        let base = partition.time_range().min_timestamp;

        let a = mem_part(
            partition.next_generation(),
            &[(1, base, 1.0), (1, base + 10, 2.0), (3, base, 30.0)],
        );
        let b = mem_part(partition.next_generation(), &[(1, base + 5, 1.5), (2, base, 20.0)]);
        let c = mem_part(
            partition.next_generation(),
            &[(3, base + 7, 33.0), (1, base + 20, 4.0)],
        );
        partition.register_part(a.clone());
        partition.register_part(b.clone());
        partition.register_part(c.clone());

        let stats = merge_parts(&partition, vec![a, b, c]).unwrap();
        assert_eq!(stats.rows_written, 7);
        assert_eq!(stats.duplicates_dropped, 0);

        let parts = partition.snapshot_parts();
        assert_eq!(parts.len(), 1);
        let mut got = Vec::new();
        for entry in parts[0].index() {
            let block = parts[0].read_block(entry).unwrap();
            for (ts, v) in block.timestamps.iter().zip(block.values.iter()) {
                got.push((block.tsid.metric_id, *ts, *v));
            }
        }
        let expected = vec![
            (1, base, 1.0),
            (1, base + 5, 1.5),
            (1, base + 10, 2.0),
            (1, base + 20, 4.0),
            (2, base, 20.0),
            (3, base, 30.0),
            (3, base + 7, 33.0),
        ];
        assert_eq!(got, expected);
    }

    #[test]
    fn test_merge_dedup_last_flush_wins() {
        let dir = TempDir::new().unwrap();
        let partition = test_partition(dir.path());
        let base = partition.time_range().min_timestamp;

        // same (tsid, timestamp) written in two flush generations
        let old = mem_part(partition.next_generation(), &[(1, base, 1.0), (1, base + 10, 10.0)]);
        let new = mem_part(partition.next_generation(), &[(1, base, 99.0)]);
        partition.register_part(old.clone());
        partition.register_part(new.clone());

        let stats = merge_parts(&partition, vec![old, new]).unwrap();
        assert_eq!(stats.duplicates_dropped, 1);

        let parts = partition.snapshot_parts();
        let mut values = BTreeMap::new();
        for entry in parts[0].index() {
            let block = parts[0].read_block(entry).unwrap();
            for (ts, v) in block.timestamps.iter().zip(block.values.iter()) {
                values.insert(*ts, *v);
            }
        }
        assert_eq!(values[&base], 99.0);
        assert_eq!(values[&(base + 10)], 10.0);
    }

    #[test]
    fn test_merge_failure_leaves_inputs_registered() {
        let dir = TempDir::new().unwrap();
        let partition = test_partition(dir.path());
        let base = partition.time_range().min_timestamp;

        let a = mem_part(partition.next_generation(), &[(1, base, 1.0)]);
        let b = mem_part(partition.next_generation(), &[(1, base + 1, 2.0)]);
        partition.register_part(a.clone());
        partition.register_part(b.clone());

        // corrupt one input on disk so its cursor fails mid-merge
        let c = mem_part(partition.next_generation(), &[(2, base, 5.0)]);
        let c_disk = Arc::new(c.persist(partition.path()).unwrap());
        let data_path = c_disk.path().unwrap().join("data.bin");
        let payload = std::fs::read(&data_path).unwrap();
        let mut tampered = payload.clone();
        tampered[payload.len() / 2] ^= 0xFF;
        std::fs::write(&data_path, tampered).unwrap();
        partition.register_part(c_disk.clone());

        let err = merge_parts(&partition, vec![a, b, c_disk]).unwrap_err();
        assert!(matches!(
            err,
            TephraError::ChecksumMismatch { .. } | TephraError::Corruption(_)
        ));
        // nothing was swapped
        assert_eq!(partition.parts_count(), 3);
    }

    #[test]
    fn test_run_merge_cycle_converges() {
        let dir = TempDir::new().unwrap();
        let partition = test_partition(dir.path());
        let base = partition.time_range().min_timestamp;
        for g in 0..5u64 {
            partition.register_part(mem_part(
                partition.next_generation(),
                &[(g, base + g as i64, g as f64)],
            ));
        }
        let cfg = MergeConfig::default();
        while run_merge_cycle(&partition, &cfg).unwrap() {}
        assert!(partition.parts_count() < 5);

        force_merge_partition(&partition).unwrap();
        assert_eq!(partition.parts_count(), 1);
    }
}
