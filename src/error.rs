//! Error types for tephra

use thiserror::Error;

/// Result type alias for tephra operations
pub type Result<T> = std::result::Result<T, TephraError>;

/// Tephra error types
#[derive(Error, Debug)]
pub enum TephraError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Compression/decompression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Row timestamp outside the owning partition's bounds
    #[error("Timestamp {timestamp} outside partition bounds [{min}, {max})")]
    TimestampOutOfBounds { timestamp: i64, min: i64, max: i64 },

    /// Rows rejected because their timestamps fall outside the retention window
    #[error("{rejected} row(s) outside the retention window; first offending timestamp {first_timestamp}")]
    RowsOutOfRetention { rejected: usize, first_timestamp: i64 },

    /// Merge error
    #[error("Merge error: {0}")]
    Merge(String),

    /// Snapshot not found
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TephraError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, TephraError::Io(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            TephraError::Corruption(_)
                | TephraError::ChecksumMismatch { .. }
                | TephraError::InvalidFormat(_)
        )
    }
}
