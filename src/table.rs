//! Table - top-level owner of all partitions
//!
//! The table routes incoming rows to month partitions (creating them on
//! demand inside the retention window), runs the background flusher and
//! merger threads, enforces retention, and exposes the search entry point.

use crate::merge::{self, MergeConfig};
use crate::partition::{
    partition_name_for, partition_range_for, partition_range_for_name, Partition,
};
use crate::search::TableSearch;
use crate::{RawRow, Result, TableMetrics, TephraError, TimeRange, Tsid};
use chrono::Utc;
use crossbeam_channel::{bounded, tick, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, warn};

const MANIFEST_FILE_NAME: &str = "table.json";
pub(crate) const DATA_DIR_NAME: &str = "data";
pub(crate) const SNAPSHOTS_DIR_NAME: &str = "snapshots";

/// Bounded retries for background flush/merge work before giving up on a
/// partition until the next tick
const BACKGROUND_RETRIES: usize = 3;

/// Table configuration
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// How far back rows are accepted and partitions are kept
    pub retention: Duration,
    /// How far into the future rows are accepted
    pub future_tolerance: Duration,
    /// Pending rows triggering an inline flush
    pub max_pending_rows: usize,
    /// Periodic pending-row flush interval
    pub flush_interval: Duration,
    /// Periodic in-memory part persistence interval
    pub persist_interval: Duration,
    /// Merge planning interval
    pub merge_interval: Duration,
    /// LZ4-wrap block payloads
    pub lz4_compression: bool,
    /// Merged outputs at most this big may stay in memory
    pub max_in_memory_part_bytes: u64,
    /// Merge policy
    pub merge: MergeConfig,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(365 * 24 * 3600),
            future_tolerance: Duration::from_secs(2 * 24 * 3600),
            max_pending_rows: crate::config::MAX_PENDING_ROWS,
            flush_interval: Duration::from_millis(crate::config::FLUSH_INTERVAL_MS),
            persist_interval: Duration::from_millis(crate::config::PERSIST_INTERVAL_MS),
            merge_interval: Duration::from_secs(2),
            lz4_compression: true,
            max_in_memory_part_bytes: crate::config::MAX_IN_MEMORY_PART_BYTES,
            merge: MergeConfig::default(),
        }
    }
}

impl TableConfig {
    fn retention_ms(&self) -> i64 {
        i64::try_from(self.retention.as_millis()).unwrap_or(i64::MAX)
    }

    fn future_tolerance_ms(&self) -> i64 {
        i64::try_from(self.future_tolerance.as_millis()).unwrap_or(i64::MAX)
    }
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct TableManifest {
    partitions: Vec<String>,
}

pub(crate) struct TableCore {
    path: PathBuf,
    data_dir: PathBuf,
    config: Arc<TableConfig>,
    partitions: RwLock<Vec<Arc<Partition>>>,
    partition_creation_lock: Mutex<()>,
}

impl TableCore {
    fn partitions_snapshot(&self) -> Vec<Arc<Partition>> {
        self.partitions.read().clone()
    }

    fn write_manifest(&self) -> Result<()> {
        let manifest = TableManifest {
            partitions: self
                .partitions
                .read()
                .iter()
                .map(|p| p.name().to_string())
                .collect(),
        };
        let raw = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| TephraError::Internal(format!("serializing table manifest: {e}")))?;
        let tmp = self.path.join(format!("{MANIFEST_FILE_NAME}.tmp"));
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, self.path.join(MANIFEST_FILE_NAME))?;
        Ok(())
    }

    fn flush_cycle(&self) {
        for partition in self.partitions_snapshot() {
            with_retries("flush", partition.name(), || partition.flush_pending());
        }
    }

    fn persist_cycle(&self) {
        for partition in self.partitions_snapshot() {
            with_retries("persist", partition.name(), || {
                partition.persist_in_memory_parts()
            });
        }
    }

    fn merge_cycle(&self) {
        for partition in self.partitions_snapshot() {
            with_retries("merge", partition.name(), || {
                // drain planned merges for this partition, one at a time
                while merge::run_merge_cycle(&partition, &self.config.merge)? {}
                Ok(())
            });
        }
    }

    fn enforce_retention(&self) {
        let now = Utc::now().timestamp_millis();
        let min_valid = now.saturating_sub(self.config.retention_ms());

        let expired: Vec<Arc<Partition>> = {
            let mut partitions = self.partitions.write();
            let (keep, drop): (Vec<_>, Vec<_>) = partitions
                .drain(..)
                .partition(|p| p.time_range().max_timestamp > min_valid);
            *partitions = keep;
            drop
        };
        if expired.is_empty() {
            return;
        }
        if let Err(e) = self.write_manifest() {
            warn!("failed to update manifest after retention: {}", e);
        }
        for partition in expired {
            partition.drop_storage();
        }
    }
}

/// Run a fallible background operation with bounded retries; exhaustion is
/// logged and the work is retried on a later tick, never escalated
fn with_retries(what: &str, partition: &str, mut op: impl FnMut() -> Result<()>) {
    for attempt in 1..=BACKGROUND_RETRIES {
        match op() {
            Ok(()) => return,
            Err(e) if e.is_retryable() && attempt < BACKGROUND_RETRIES => {
                warn!(
                    "background {} for partition {} failed (attempt {}): {}",
                    what, partition, attempt, e
                );
            }
            Err(e) => {
                error!(
                    "background {} for partition {} gave up: {}",
                    what, partition, e
                );
                return;
            }
        }
    }
}

/// Top-level owner of all partitions spanning the retention window
pub struct Table {
    core: Arc<TableCore>,
    stop_tx: Mutex<Option<Sender<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Table {
    /// Open (or create) a table at `path` and start its background workers.
    ///
    /// A corrupt part refuses the whole open: serving wrong data is never an
    /// option, operators must intervene.
    pub fn open(path: impl AsRef<Path>, config: TableConfig) -> Result<Table> {
        let path = path.as_ref().to_path_buf();
        let config = Arc::new(config);
        let data_dir = path.join(DATA_DIR_NAME);
        fs::create_dir_all(&data_dir)?;

        let mut partitions = Vec::new();
        let mut known = BTreeMap::new();

        // the manifest names every partition the table shut down with
        let manifest_path = path.join(MANIFEST_FILE_NAME);
        if manifest_path.exists() {
            let raw = fs::read(&manifest_path)?;
            let manifest: TableManifest = serde_json::from_slice(&raw)
                .map_err(|e| TephraError::Corruption(format!("bad table manifest: {e}")))?;
            for name in manifest.partitions {
                let dir = data_dir.join(&name);
                if !dir.is_dir() {
                    return Err(TephraError::Corruption(format!(
                        "manifest lists partition {name} but {dir:?} is missing"
                    )));
                }
                known.insert(name, dir);
            }
        }
        // partitions created after the last clean shutdown are picked up too
        for entry in fs::read_dir(&data_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            match entry.file_name().to_str() {
                Some(name) if partition_range_for_name(name).is_some() => {
                    known
                        .entry(name.to_string())
                        .or_insert_with(|| entry.path());
                }
                _ => {
                    warn!("skipping unrecognized entry {:?} in data dir", entry.path());
                }
            }
        }

        for (_, dir) in known {
            partitions.push(Arc::new(Partition::open(&dir, config.clone())?));
        }
        partitions.sort_by_key(|p| p.time_range().min_timestamp);

        let core = Arc::new(TableCore {
            path: path.clone(),
            data_dir,
            config,
            partitions: RwLock::new(partitions),
            partition_creation_lock: Mutex::new(()),
        });
        core.write_manifest()?;

        let (stop_tx, stop_rx) = bounded::<()>(0);
        let workers = vec![
            spawn_flusher(core.clone(), stop_rx.clone())?,
            spawn_merger(core.clone(), stop_rx)?,
        ];
        info!(
            "opened table at {:?} with {} partition(s)",
            path,
            core.partitions.read().len()
        );

        Ok(Table {
            core,
            stop_tx: Mutex::new(Some(stop_tx)),
            workers: Mutex::new(workers),
            closed: AtomicBool::new(false),
        })
    }

    /// Table root directory
    pub fn path(&self) -> &Path {
        &self.core.path
    }

    pub fn config(&self) -> &TableConfig {
        &self.core.config
    }

    /// Ingest rows, routing each to its partition by timestamp.
    ///
    /// Rows outside `[now - retention, now + future_tolerance)` are rejected;
    /// everything else is ingested first and the rejects are then reported in
    /// a [`TephraError::RowsOutOfRetention`] so nothing fails silently.
    pub fn add_rows(&self, rows: &[RawRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let now = Utc::now().timestamp_millis();
        let min_valid = now.saturating_sub(self.core.config.retention_ms());
        let max_valid = now.saturating_add(self.core.config.future_tolerance_ms());

        let mut rejected = 0usize;
        let mut first_bad: Option<i64> = None;
        let mut routed: BTreeMap<i64, (Arc<Partition>, Vec<RawRow>)> = BTreeMap::new();

        for row in rows {
            if row.timestamp < min_valid || row.timestamp >= max_valid {
                rejected += 1;
                first_bad.get_or_insert(row.timestamp);
                continue;
            }
            let partition = match routed
                .values()
                .find(|(p, _)| p.time_range().contains(row.timestamp))
            {
                Some((p, _)) => p.clone(),
                None => self.partition_for_timestamp(row.timestamp)?,
            };
            routed
                .entry(partition.time_range().min_timestamp)
                .or_insert_with(|| (partition, Vec::new()))
                .1
                .push(*row);
        }

        for (partition, batch) in routed.into_values() {
            let pending = partition.add_rows(&batch)?;
            if pending >= self.core.config.max_pending_rows {
                // encoding happens off the ingest mutex and in memory, so an
                // inline flush never waits on disk
                partition.flush_pending()?;
            }
        }

        match (rejected, first_bad) {
            (0, _) | (_, None) => Ok(()),
            (rejected, Some(first_timestamp)) => Err(TephraError::RowsOutOfRetention {
                rejected,
                first_timestamp,
            }),
        }
    }

    fn partition_for_timestamp(&self, ts: i64) -> Result<Arc<Partition>> {
        {
            let partitions = self.core.partitions.read();
            if let Some(p) = partitions.iter().find(|p| p.time_range().contains(ts)) {
                return Ok(p.clone());
            }
        }

        let _guard = self.core.partition_creation_lock.lock();
        // another writer may have won the race
        {
            let partitions = self.core.partitions.read();
            if let Some(p) = partitions.iter().find(|p| p.time_range().contains(ts)) {
                return Ok(p.clone());
            }
        }

        let name = partition_name_for(ts)
            .ok_or_else(|| TephraError::InvalidFormat(format!("unrepresentable timestamp {ts}")))?;
        let range = partition_range_for(ts)
            .ok_or_else(|| TephraError::InvalidFormat(format!("unrepresentable timestamp {ts}")))?;
        let partition = Arc::new(Partition::create(
            &self.core.data_dir,
            name,
            range,
            self.core.config.clone(),
        )?);
        {
            let mut partitions = self.core.partitions.write();
            partitions.push(partition.clone());
            partitions.sort_by_key(|p| p.time_range().min_timestamp);
        }
        self.core.write_manifest()?;
        Ok(partition)
    }

    /// Search the table for blocks of the given series inside `tr`
    pub fn search(&self, tsids: &[Tsid], tr: TimeRange) -> TableSearch {
        TableSearch::init(self, tsids, tr)
    }

    /// Flush pending rows and persist in-memory parts, giving tests and
    /// snapshot/export flows deterministic visibility
    pub fn force_flush(&self) -> Result<()> {
        for partition in self.core.partitions_snapshot() {
            partition.finalize()?;
        }
        Ok(())
    }

    /// Merge every partition down to a single part
    pub fn force_merge(&self) -> Result<()> {
        for partition in self.core.partitions_snapshot() {
            merge::force_merge_partition(&partition)?;
        }
        Ok(())
    }

    /// Accumulate table-wide counters into `m`
    pub fn update_metrics(&self, m: &mut TableMetrics) {
        for partition in self.core.partitions_snapshot() {
            let mut pm = crate::PartitionMetrics::default();
            partition.update_metrics(&mut pm);
            m.add_partition(&pm);
        }
    }

    /// Drop partitions whose range lies fully outside the retention window
    pub fn enforce_retention(&self) {
        self.core.enforce_retention();
    }

    pub(crate) fn partitions_snapshot(&self) -> Vec<Arc<Partition>> {
        self.core.partitions_snapshot()
    }

    pub(crate) fn core_path(&self) -> &Path {
        &self.core.path
    }

    /// Stop background workers, flush everything and write the manifest
    pub fn close(self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // dropping the sender disconnects both worker loops
        self.stop_tx.lock().take();
        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                warn!("background worker panicked during shutdown");
            }
        }
        let mut first_err = None;
        for partition in self.core.partitions_snapshot() {
            if let Err(e) = partition.finalize() {
                error!("failed to finalize partition {}: {}", partition.name(), e);
                first_err.get_or_insert(e);
            }
        }
        self.core.write_manifest()?;
        info!("closed table at {:?}", self.core.path);
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            if let Err(e) = self.shutdown() {
                warn!("error while closing table on drop: {}", e);
            }
        }
    }
}

fn spawn_flusher(core: Arc<TableCore>, stop_rx: Receiver<()>) -> Result<JoinHandle<()>> {
    let flush_tick = tick(core.config.flush_interval);
    let persist_tick = tick(core.config.persist_interval);
    let handle = std::thread::Builder::new()
        .name("tephra-flusher".into())
        .spawn(move || loop {
            crossbeam_channel::select! {
                recv(flush_tick) -> _ => core.flush_cycle(),
                recv(persist_tick) -> _ => core.persist_cycle(),
                recv(stop_rx) -> _ => return,
            }
        })?;
    Ok(handle)
}

fn spawn_merger(core: Arc<TableCore>, stop_rx: Receiver<()>) -> Result<JoinHandle<()>> {
    let merge_tick = tick(core.config.merge_interval);
    // expiry is cheap to check but rarely fires
    let retention_tick = tick(Duration::from_secs(3600));
    let handle = std::thread::Builder::new()
        .name("tephra-merger".into())
        .spawn(move || loop {
            crossbeam_channel::select! {
                recv(merge_tick) -> _ => core.merge_cycle(),
                recv(retention_tick) -> _ => core.enforce_retention(),
                recv(stop_rx) -> _ => return,
            }
        })?;
    Ok(handle)
}
