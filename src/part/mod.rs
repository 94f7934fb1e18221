//! Immutable sorted parts
//!
//! A part is an ordered sequence of blocks, globally sorted by
//! `(tsid, min_timestamp)`, with the block index kept separate from block
//! payloads so searches can prune without decompressing anything. Small
//! freshly-flushed parts live in memory; persisted parts occupy one
//! directory per generation holding `index.bin`, `data.bin` and
//! `metadata.json`, committed with a write-to-tmp + rename.
//!
//! Parts are immutable once registered. Deletion is deferred to the last
//! reference: the merger marks superseded parts and the files go away when
//! the final `Arc` drops.

mod block;
mod writer;

pub use block::{Block, MAX_ROWS_PER_BLOCK};
pub use writer::PartWriter;

pub(crate) use block::{decode_block_payload, encode_block_payload};

use crate::{Result, TephraError, TimeRange, Tsid};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

pub(crate) const INDEX_FILE_NAME: &str = "index.bin";
pub(crate) const DATA_FILE_NAME: &str = "data.bin";
pub(crate) const META_FILE_NAME: &str = "metadata.json";
pub(crate) const TMP_DIR_NAME: &str = "tmp";

const INDEX_MAGIC: &[u8; 4] = b"TPIX";
const INDEX_VERSION: u32 = 1;
const INDEX_ENTRY_SIZE: usize = Tsid::SIZE + 8 + 8 + 4 + 1 + 8 + 4 + 4;

/// One block's entry in a part's index
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockIndexEntry {
    /// Series the block belongs to
    pub tsid: Tsid,
    /// Smallest timestamp in the block
    pub min_timestamp: i64,
    /// Largest timestamp in the block
    pub max_timestamp: i64,
    /// Rows in the block
    pub rows_count: u32,
    /// Precision the values were encoded with
    pub precision_bits: u8,
    /// Payload offset within the data file
    pub offset: u64,
    /// Payload size in bytes
    pub size: u32,
    /// CRC32 of the payload bytes
    pub crc: u32,
}

impl BlockIndexEntry {
    fn write_to(&self, buf: &mut impl BufMut) {
        self.tsid.write_to(buf);
        buf.put_i64_le(self.min_timestamp);
        buf.put_i64_le(self.max_timestamp);
        buf.put_u32_le(self.rows_count);
        buf.put_u8(self.precision_bits);
        buf.put_u64_le(self.offset);
        buf.put_u32_le(self.size);
        buf.put_u32_le(self.crc);
    }

    fn read_from(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < INDEX_ENTRY_SIZE {
            return Err(TephraError::Corruption("block index entry too short".into()));
        }
        Ok(Self {
            tsid: Tsid::read_from(buf)?,
            min_timestamp: buf.get_i64_le(),
            max_timestamp: buf.get_i64_le(),
            rows_count: buf.get_u32_le(),
            precision_bits: buf.get_u8(),
            offset: buf.get_u64_le(),
            size: buf.get_u32_le(),
            crc: buf.get_u32_le(),
        })
    }

    /// Time range covered by the block, as a half-open range
    pub fn time_range(&self) -> TimeRange {
        TimeRange::new(self.min_timestamp, self.max_timestamp + 1)
    }
}

/// Aggregate part statistics, persisted as `metadata.json`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PartMeta {
    pub rows_count: u64,
    pub blocks_count: u32,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
    pub size_bytes: u64,
}

/// Where a part's payload bytes live
enum PartData {
    Mem(Bytes),
    Disk(File),
}

/// An immutable sorted container of blocks
pub struct Part {
    generation: u64,
    meta: PartMeta,
    index: Vec<BlockIndexEntry>,
    data: PartData,
    /// Part directory for persisted parts
    path: Option<PathBuf>,
    must_drop: AtomicBool,
}

impl Part {
    /// Generation id, unique within the owning partition
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn meta(&self) -> &PartMeta {
        &self.meta
    }

    /// Block index, sorted by `(tsid, min_timestamp)`
    pub fn index(&self) -> &[BlockIndexEntry] {
        &self.index
    }

    pub fn is_in_memory(&self) -> bool {
        matches!(self.data, PartData::Mem(_))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Time range covered by the part, as a half-open range
    pub fn time_range(&self) -> TimeRange {
        TimeRange::new(self.meta.min_timestamp, self.meta.max_timestamp + 1)
    }

    /// Read and decode the block behind an index entry
    pub fn read_block(&self, entry: &BlockIndexEntry) -> Result<Block> {
        let payload = self.read_payload(entry.offset, entry.size as usize)?;
        decode_block_payload(&payload, entry.crc, entry.rows_count, entry.tsid)
    }

    fn read_payload(&self, offset: u64, size: usize) -> Result<Vec<u8>> {
        match &self.data {
            PartData::Mem(bytes) => {
                let start = offset as usize;
                let end = start
                    .checked_add(size)
                    .filter(|&end| end <= bytes.len())
                    .ok_or_else(|| {
                        TephraError::Corruption(format!(
                            "block at {offset}+{size} outside part data of {} bytes",
                            bytes.len()
                        ))
                    })?;
                Ok(bytes[start..end].to_vec())
            }
            PartData::Disk(file) => {
                let mut buf = vec![0u8; size];
                file.read_exact_at(&mut buf, offset)?;
                Ok(buf)
            }
        }
    }

    /// Mark the part's files for deletion once the last reference drops
    pub fn mark_for_drop(&self) {
        self.must_drop.store(true, Ordering::Release);
    }

    pub(crate) fn new_in_memory(
        generation: u64,
        meta: PartMeta,
        index: Vec<BlockIndexEntry>,
        data: Bytes,
    ) -> Self {
        Self {
            generation,
            meta,
            index,
            data: PartData::Mem(data),
            path: None,
            must_drop: AtomicBool::new(false),
        }
    }

    /// Open a persisted part directory, validating everything up front.
    ///
    /// Any inconsistency is a corruption error; a part that fails to open is
    /// never partially served.
    pub fn open(dir: &Path) -> Result<Self> {
        let generation = parse_generation(dir).ok_or_else(|| {
            TephraError::InvalidFormat(format!("part directory name {:?} is not a generation", dir))
        })?;

        let meta_raw = fs::read(dir.join(META_FILE_NAME))?;
        let meta: PartMeta = serde_json::from_slice(&meta_raw)
            .map_err(|e| TephraError::Corruption(format!("bad part metadata in {dir:?}: {e}")))?;

        let mut index_raw = Vec::new();
        File::open(dir.join(INDEX_FILE_NAME))?.read_to_end(&mut index_raw)?;
        let index = decode_index(&index_raw)
            .map_err(|e| TephraError::Corruption(format!("bad block index in {dir:?}: {e}")))?;

        let data_file = File::open(dir.join(DATA_FILE_NAME))?;
        let data_len = data_file.metadata()?.len();

        validate_part(&meta, &index, data_len)
            .map_err(|e| TephraError::Corruption(format!("inconsistent part {dir:?}: {e}")))?;

        Ok(Self {
            generation,
            meta,
            index,
            data: PartData::Disk(data_file),
            path: Some(dir.to_path_buf()),
            must_drop: AtomicBool::new(false),
        })
    }

    /// Persist an in-memory part into `partition_dir`, keeping its
    /// generation, and return the disk-backed replacement.
    pub(crate) fn persist(&self, partition_dir: &Path) -> Result<Self> {
        let data = match &self.data {
            PartData::Mem(bytes) => bytes.clone(),
            PartData::Disk(_) => {
                return Err(TephraError::Internal("part is already persisted".into()))
            }
        };
        let dir = commit_part_files(
            partition_dir,
            self.generation,
            &self.meta,
            &self.index,
            &data,
        )?;
        Part::open(&dir)
    }
}

impl Drop for Part {
    fn drop(&mut self) {
        if !self.must_drop.load(Ordering::Acquire) {
            return;
        }
        if let Some(path) = &self.path {
            match fs::remove_dir_all(path) {
                Ok(()) => {}
                // already gone, e.g. the whole partition was dropped
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("failed to remove superseded part {:?}: {}", path, e),
            }
        }
    }
}

impl std::fmt::Debug for Part {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Part")
            .field("generation", &self.generation)
            .field("meta", &self.meta)
            .field("in_memory", &self.is_in_memory())
            .finish()
    }
}

/// Directory name for a generation id
pub(crate) fn generation_dir_name(generation: u64) -> String {
    format!("{generation:016X}")
}

/// Parse a part directory name back into its generation id
pub(crate) fn parse_generation(dir: &Path) -> Option<u64> {
    let name = dir.file_name()?.to_str()?;
    if name.len() != 16 {
        return None;
    }
    u64::from_str_radix(name, 16).ok()
}

pub(crate) fn encode_index(entries: &[BlockIndexEntry]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(12 + entries.len() * INDEX_ENTRY_SIZE + 4);
    buf.put_slice(INDEX_MAGIC);
    buf.put_u32_le(INDEX_VERSION);
    buf.put_u32_le(entries.len() as u32);
    for entry in entries {
        entry.write_to(&mut buf);
    }
    let crc = crc32fast::hash(&buf);
    buf.put_u32_le(crc);
    buf.to_vec()
}

pub(crate) fn decode_index(data: &[u8]) -> Result<Vec<BlockIndexEntry>> {
    if data.len() < 16 {
        return Err(TephraError::Corruption("block index too short".into()));
    }
    let (body, crc_bytes) = data.split_at(data.len() - 4);
    let expected = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    let actual = crc32fast::hash(body);
    if actual != expected {
        return Err(TephraError::ChecksumMismatch { expected, actual });
    }

    let mut cursor = body;
    let mut magic = [0u8; 4];
    cursor.copy_to_slice(&mut magic);
    if &magic != INDEX_MAGIC {
        return Err(TephraError::InvalidFormat("bad block index magic".into()));
    }
    let version = cursor.get_u32_le();
    if version != INDEX_VERSION {
        return Err(TephraError::InvalidFormat(format!(
            "unsupported block index version {version}"
        )));
    }
    let count = cursor.get_u32_le() as usize;
    if cursor.remaining() != count * INDEX_ENTRY_SIZE {
        return Err(TephraError::Corruption(format!(
            "block index claims {count} entries but carries {} bytes",
            cursor.remaining()
        )));
    }

    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        entries.push(BlockIndexEntry::read_from(&mut cursor)?);
    }

    for pair in entries.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        if (b.tsid, b.min_timestamp) < (a.tsid, a.min_timestamp) {
            return Err(TephraError::Corruption("block index out of order".into()));
        }
    }
    Ok(entries)
}

fn validate_part(meta: &PartMeta, index: &[BlockIndexEntry], data_len: u64) -> Result<()> {
    if meta.blocks_count as usize != index.len() {
        return Err(TephraError::Corruption(format!(
            "metadata says {} blocks, index has {}",
            meta.blocks_count,
            index.len()
        )));
    }
    let rows: u64 = index.iter().map(|e| e.rows_count as u64).sum();
    if rows != meta.rows_count {
        return Err(TephraError::Corruption(format!(
            "metadata says {} rows, index sums to {rows}",
            meta.rows_count
        )));
    }
    for entry in index {
        let end = entry.offset + entry.size as u64;
        if end > data_len {
            return Err(TephraError::Corruption(format!(
                "block at {}+{} exceeds data file of {data_len} bytes",
                entry.offset, entry.size
            )));
        }
        if entry.rows_count == 0 || entry.min_timestamp > entry.max_timestamp {
            return Err(TephraError::Corruption("degenerate block index entry".into()));
        }
    }
    Ok(())
}

/// Write part files under `tmp/` and atomically rename into place.
pub(crate) fn commit_part_files(
    partition_dir: &Path,
    generation: u64,
    meta: &PartMeta,
    index: &[BlockIndexEntry],
    data: &[u8],
) -> Result<PathBuf> {
    let name = generation_dir_name(generation);
    let tmp_dir = partition_dir.join(TMP_DIR_NAME).join(&name);
    let final_dir = partition_dir.join(&name);

    fs::create_dir_all(&tmp_dir)?;
    let write_all = || -> Result<()> {
        fs::write(tmp_dir.join(DATA_FILE_NAME), data)?;
        fs::write(tmp_dir.join(INDEX_FILE_NAME), encode_index(index))?;
        let meta_json = serde_json::to_vec_pretty(meta)
            .map_err(|e| TephraError::Internal(format!("serializing part metadata: {e}")))?;
        fs::write(tmp_dir.join(META_FILE_NAME), meta_json)?;
        fs::rename(&tmp_dir, &final_dir)?;
        Ok(())
    };
    if let Err(e) = write_all() {
        let _ = fs::remove_dir_all(&tmp_dir);
        return Err(e);
    }
    Ok(final_dir)
}
