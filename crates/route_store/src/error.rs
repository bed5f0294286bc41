//! Error type for cache storage operations.

use std::io;

use datafusion::arrow::error::ArrowError;

/// Result alias used throughout the store.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failures surfaced by the paged cache store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem failure while reading or writing cache files.
    #[error("cache io failed ({context}): {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// Arrow encode/decode or compute failure.
    #[error("cache arrow failure ({context}): {source}")]
    Arrow {
        context: String,
        #[source]
        source: ArrowError,
    },

    /// Manifest JSON could not be encoded.
    #[error("cache manifest encode failed: {0}")]
    Manifest(#[from] serde_json::Error),

    /// Rows handed to `materialize` are not ordered by the declared keys.
    #[error("rows are not ordered by [{order_by}]: row {row} sorts before its predecessor")]
    Unsorted { order_by: String, row: usize },

    /// A row falls outside the invariant value box of the shard being written.
    #[error("row {row} has {column}={value:?}, outside the shard being materialized")]
    ShardViolation {
        row: usize,
        column: String,
        value: Option<String>,
    },

    /// A column named by an ordering key or invariant filter does not exist.
    #[error("column `{0}` is not present in the cached schema")]
    MissingColumn(String),

    /// Materialization was cancelled before its manifest was committed.
    #[error("materialization cancelled before commit")]
    Cancelled,
}

impl StoreError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn arrow(context: impl Into<String>, source: ArrowError) -> Self {
        Self::Arrow {
            context: context.into(),
            source,
        }
    }

    /// Returns whether the failure was caused by the storage device running out of space.
    pub fn is_storage_exhausted(&self) -> bool {
        // ENOSPC on unix, ERROR_DISK_FULL on windows.
        const ENOSPC: i32 = 28;
        const ERROR_DISK_FULL: i32 = 112;
        match self {
            Self::Io { source, .. } => {
                source.kind() == io::ErrorKind::StorageFull
                    || matches!(source.raw_os_error(), Some(ENOSPC) | Some(ERROR_DISK_FULL))
            }
            _ => false,
        }
    }

    /// Returns whether a file or directory the operation relied on no longer exists.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }

    /// Returns whether the rows themselves were rejected (as opposed to the storage layer failing).
    pub fn is_row_constraint(&self) -> bool {
        matches!(self, Self::Unsorted { .. } | Self::ShardViolation { .. })
    }
}
