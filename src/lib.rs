//! Tephra - Partitioned Part Storage Engine for Time Series
//!
//! A Rust storage core for time-series databases, built around immutable
//! sorted parts:
//!
//! - **Pending buffer**: per-partition in-memory row accumulation, swapped
//!   out under a narrow lock and sorted off the ingestion path
//! - **Part**: immutable container of compressed per-series blocks with a
//!   separate block index for payload-free pruning
//! - **Partition**: month-bounded owner of parts plus the pending buffer
//! - **Merger**: background tiered consolidation keeping part counts bounded
//! - **Table search**: cross-part, cross-partition merge iterator answering
//!   `(tsid set, time range)` queries concurrently with ingestion

pub mod encoding;
pub mod merge;
pub mod part;
pub mod partition;
pub mod search;
pub mod snapshot;
pub mod table;

mod error;
mod types;

pub use error::{Result, TephraError};
pub use merge::MergeConfig;
pub use part::{Block, BlockIndexEntry, Part, PartMeta, MAX_ROWS_PER_BLOCK};
pub use partition::Partition;
pub use search::{BlockRef, SearchStopHandle, TableSearch};
pub use table::{Table, TableConfig};
pub use types::*;

/// Tephra version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Pending rows triggering an inline flush (per partition)
    pub const MAX_PENDING_ROWS: usize = 100_000;

    /// Periodic pending-row flush interval
    pub const FLUSH_INTERVAL_MS: u64 = 1_000;

    /// Periodic in-memory part persistence interval
    pub const PERSIST_INTERVAL_MS: u64 = 5_000;

    /// Merged outputs at most this big may stay in memory
    pub const MAX_IN_MEMORY_PART_BYTES: u64 = 1024 * 1024;

    /// Fewest parts worth merging at once
    pub const MIN_MERGE_PARTS: usize = 2;

    /// Most parts merged at once
    pub const MAX_MERGE_PARTS: usize = 8;
}
