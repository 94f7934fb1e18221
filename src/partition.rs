//! Month-bounded partitions
//!
//! A partition owns the pending raw-row buffer and the set of immutable
//! parts for one calendar month. Ingestion appends under a narrow mutex;
//! flushing swaps the buffer out and encodes off the hot path. The part set
//! sits behind a lock that is only ever held for cheap pointer swaps, so
//! readers snapshot it without blocking flushes or merges.

use crate::part::{parse_generation, Part, PartWriter, TMP_DIR_NAME};
use crate::table::TableConfig;
use crate::{PartitionMetrics, RawRow, Result, TephraError, TimeRange};
use chrono::{Datelike, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Time-bounded owner of parts plus the pending raw buffer
pub struct Partition {
    name: String,
    time_range: TimeRange,
    path: PathBuf,
    config: Arc<TableConfig>,

    pending: Mutex<Vec<RawRow>>,
    parts: RwLock<Vec<Arc<Part>>>,
    next_generation: AtomicU64,
    // serializes in-memory part persistence
    persist_lock: Mutex<()>,
    // serializes merge planning+execution; two merges over overlapping
    // inputs would duplicate rows
    merge_lock: Mutex<()>,
}

impl Partition {
    /// Create a fresh partition directory for the month containing `name`'s range
    pub(crate) fn create(
        data_dir: &Path,
        name: String,
        time_range: TimeRange,
        config: Arc<TableConfig>,
    ) -> Result<Self> {
        let path = data_dir.join(&name);
        fs::create_dir_all(&path)?;
        info!("created partition {} covering {}", name, time_range);
        Ok(Self {
            name,
            time_range,
            path,
            config,
            pending: Mutex::new(Vec::new()),
            parts: RwLock::new(Vec::new()),
            next_generation: AtomicU64::new(1),
            persist_lock: Mutex::new(()),
            merge_lock: Mutex::new(()),
        })
    }

    /// Open a persisted partition directory, loading every part in it
    pub(crate) fn open(dir: &Path, config: Arc<TableConfig>) -> Result<Self> {
        let name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| TephraError::InvalidFormat(format!("bad partition path {dir:?}")))?;
        let time_range = partition_range_for_name(&name).ok_or_else(|| {
            TephraError::InvalidFormat(format!("partition directory {name:?} is not a month"))
        })?;

        // leftovers from a crash mid-commit are not yet registered parts
        let tmp_dir = dir.join(TMP_DIR_NAME);
        if tmp_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&tmp_dir) {
                warn!("failed to clear stale tmp dir {:?}: {}", tmp_dir, e);
            }
        }

        let mut parts = Vec::new();
        let mut max_generation = 0u64;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let part_dir = entry.path();
            match parse_generation(&part_dir) {
                Some(generation) => {
                    let part = Part::open(&part_dir)?;
                    max_generation = max_generation.max(generation);
                    parts.push(Arc::new(part));
                }
                None => {
                    warn!("skipping unrecognized entry {:?} in partition {}", part_dir, name);
                }
            }
        }
        parts.sort_by_key(|p| p.generation());
        info!("opened partition {} with {} part(s)", name, parts.len());

        Ok(Self {
            name,
            time_range,
            path: dir.to_path_buf(),
            config,
            pending: Mutex::new(Vec::new()),
            parts: RwLock::new(parts),
            next_generation: AtomicU64::new(max_generation + 1),
            persist_lock: Mutex::new(()),
            merge_lock: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn time_range(&self) -> TimeRange {
        self.time_range
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn config(&self) -> &TableConfig {
        &self.config
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::SeqCst)
    }

    /// Append rows to the pending buffer.
    ///
    /// Every timestamp must lie inside the partition's bounds; routing is the
    /// table's job and a violation here is a caller bug. Returns the pending
    /// row count so the caller can decide whether to trigger a flush.
    pub fn add_rows(&self, rows: &[RawRow]) -> Result<usize> {
        for row in rows {
            if !self.time_range.contains(row.timestamp) {
                return Err(TephraError::TimestampOutOfBounds {
                    timestamp: row.timestamp,
                    min: self.time_range.min_timestamp,
                    max: self.time_range.max_timestamp,
                });
            }
        }
        let mut pending = self.pending.lock();
        pending.extend_from_slice(rows);
        Ok(pending.len())
    }

    /// Rows waiting in the pending buffer
    pub fn pending_rows(&self) -> usize {
        self.pending.lock().len()
    }

    /// Flush the pending buffer into one new in-memory part.
    ///
    /// The buffer is swapped out under the mutex; sorting and encoding happen
    /// after it is released so ingestion is never blocked on them.
    pub fn flush_pending(&self) -> Result<()> {
        let mut rows = {
            let mut pending = self.pending.lock();
            if pending.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut *pending)
        };

        // stable sort keeps arrival order for identical (tsid, timestamp)
        rows.sort_by(|a, b| (a.tsid, a.timestamp).cmp(&(b.tsid, b.timestamp)));

        let mut writer = PartWriter::new(self.config.lz4_compression);
        writer.push_sorted_rows(&rows);
        let generation = self.next_generation();
        match writer.finish_in_memory(generation) {
            Ok(part) => {
                self.register_part(Arc::new(part));
                Ok(())
            }
            Err(e) => {
                // put the rows back; they stay flushable
                self.pending.lock().extend_from_slice(&rows);
                Err(e)
            }
        }
    }

    /// Write every in-memory part to disk, swapping the disk-backed
    /// replacements into the part set.
    pub fn persist_in_memory_parts(&self) -> Result<()> {
        let _guard = self.persist_lock.lock();
        let mem_parts: Vec<Arc<Part>> = self
            .parts
            .read()
            .iter()
            .filter(|p| p.is_in_memory())
            .cloned()
            .collect();

        for part in mem_parts {
            let disk = Arc::new(part.persist(&self.path)?);
            let mut parts = self.parts.write();
            match parts.iter_mut().find(|p| Arc::ptr_eq(p, &part)) {
                Some(slot) => *slot = disk,
                None => {
                    // a merge superseded the part while we were writing it
                    disk.mark_for_drop();
                }
            }
        }
        Ok(())
    }

    /// Reference-counted snapshot of the current part set
    pub fn snapshot_parts(&self) -> Vec<Arc<Part>> {
        self.parts.read().clone()
    }

    pub(crate) fn parts_count(&self) -> usize {
        self.parts.read().len()
    }

    pub(crate) fn register_part(&self, part: Arc<Part>) {
        self.parts.write().push(part);
    }

    /// Guard serializing merge planning and execution on this partition
    pub(crate) fn merge_guard(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.merge_lock.lock()
    }

    /// Atomically replace merge inputs with the merged output.
    ///
    /// Matching is by generation: a concurrent persistence pass may have
    /// swapped an in-memory input for its disk-backed twin, which carries the
    /// same generation and the same rows. Everything removed is marked for
    /// deletion; readers holding an older snapshot keep their parts alive
    /// until they finish.
    pub(crate) fn swap_merged(&self, inputs: &[Arc<Part>], output: Arc<Part>) {
        let removed: Vec<Arc<Part>> = {
            let mut parts = self.parts.write();
            let mut removed = Vec::with_capacity(inputs.len());
            parts.retain(|p| {
                if inputs.iter().any(|input| input.generation() == p.generation()) {
                    removed.push(p.clone());
                    false
                } else {
                    true
                }
            });
            parts.push(output);
            removed
        };
        for part in removed.iter().chain(inputs.iter()) {
            part.mark_for_drop();
        }
    }

    /// Aggregate counters across parts plus the pending buffer
    pub fn update_metrics(&self, m: &mut PartitionMetrics) {
        let parts = self.parts.read();
        m.parts_count += parts.len() as u64;
        for part in parts.iter() {
            if part.is_in_memory() {
                m.in_memory_parts_count += 1;
            }
            let meta = part.meta();
            m.blocks_count += meta.blocks_count as u64;
            m.rows_count += meta.rows_count;
            m.bytes_size += meta.size_bytes;
        }
        drop(parts);
        m.pending_rows_count += self.pending_rows() as u64;
    }

    /// Flush and persist everything; used on close and before snapshots
    pub(crate) fn finalize(&self) -> Result<()> {
        self.flush_pending()?;
        self.persist_in_memory_parts()
    }

    /// Tear the partition down for retention expiry, deleting its files.
    pub(crate) fn drop_storage(&self) {
        let parts = {
            let mut guard = self.parts.write();
            std::mem::take(&mut *guard)
        };
        for part in &parts {
            part.mark_for_drop();
        }
        drop(parts);
        // open file handles keep concurrent readers safe after the unlink
        if let Err(e) = fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove expired partition {}: {}", self.name, e);
            }
        }
        info!("dropped expired partition {}", self.name);
    }
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("name", &self.name)
            .field("time_range", &self.time_range)
            .field("parts", &self.parts_count())
            .finish()
    }
}

/// Calendar month `[start, end)` containing `ts`, if `ts` is representable
pub(crate) fn partition_range_for(ts: i64) -> Option<TimeRange> {
    let dt = Utc.timestamp_millis_opt(ts).single()?;
    month_range(dt.year(), dt.month())
}

/// Partition directory name (`YYYY_MM`) for `ts`
pub(crate) fn partition_name_for(ts: i64) -> Option<String> {
    let dt = Utc.timestamp_millis_opt(ts).single()?;
    Some(format!("{:04}_{:02}", dt.year(), dt.month()))
}

/// Parse a `YYYY_MM` partition directory name back into its range
pub(crate) fn partition_range_for_name(name: &str) -> Option<TimeRange> {
    let (year, month) = name.split_once('_')?;
    if year.len() != 4 || month.len() != 2 {
        return None;
    }
    let year: i32 = year.parse().ok()?;
    let month: u32 = month.parse().ok()?;
    if !(1..=12).contains(&month) {
        return None;
    }
    month_range(year, month)
}

fn month_range(year: i32, month: u32) -> Option<TimeRange> {
    let start = Utc
        .with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()?
        .timestamp_millis();
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    let end = Utc
        .with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0)
        .single()?
        .timestamp_millis();
    Some(TimeRange::new(start, end))
}
