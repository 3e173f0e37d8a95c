//! Error types for the persistent task index.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for task index operations.
pub type IndexResult<T> = Result<T, IndexError>;

/// Errors produced by the task index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// IO failures while reading or writing index files.
    #[error("task index io failure")]
    Io {
        /// Operation that triggered the IO failure.
        operation: &'static str,
        /// Path involved in the IO failure.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// JSON serialization failures for row payloads.
    #[error("task index json failure")]
    Json {
        /// Operation that triggered the JSON failure.
        operation: &'static str,
        /// Path involved in the JSON failure.
        path: PathBuf,
        /// Underlying JSON error.
        source: serde_json::Error,
    },
    /// The on-disk schema is newer than this build understands.
    #[error("task index schema is unsupported")]
    UnsupportedSchema {
        /// Version recorded on disk.
        found: u32,
        /// Newest version this build can read.
        supported: u32,
    },
}

impl IndexError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: serde_json::Error,
    ) -> Self {
        Self::Json {
            operation,
            path: path.into(),
            source,
        }
    }
}
