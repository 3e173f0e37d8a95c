//! Error types for the byte store.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for byte store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors produced by the byte store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO failures while reading or writing cache files.
    #[error("byte store io failure")]
    Io {
        /// Operation that triggered the IO failure.
        operation: &'static str,
        /// Path involved in the IO failure.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// The entry already has an active writer, or is doomed for deletion.
    #[error("cache entry is busy")]
    Busy {
        /// Key of the busy entry.
        key: String,
    },
    /// The underlying filesystem refused further bytes.
    #[error("storage is full")]
    Full {
        /// Path that could not grow.
        path: PathBuf,
    },
}

impl StoreError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Whether the failure means the disk (not the request) is at fault.
    #[must_use]
    pub const fn is_storage_full(&self) -> bool {
        matches!(self, Self::Full { .. })
    }
}
