//! The fetcher seam between the engine and transfer implementations.

use crate::cancel::CancelToken;
use crate::error::FetchResult;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// One fetch attempt for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Task being served, for logging only.
    pub task_id: String,
    /// Opaque locator to resolve.
    pub source: String,
    /// Bytes already stored; the fetcher must start serving at this offset.
    pub resume_offset: u64,
}

/// Events streamed by a fetcher while an attempt runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchEvent {
    /// Total payload size, when the source reveals it. Emitted at most once,
    /// before the first chunk.
    Size {
        /// Full payload size in bytes, `None` when unknown up front.
        total_bytes: Option<u64>,
    },
    /// The next run of payload bytes, starting at the resume offset.
    Chunk {
        /// Raw payload bytes.
        bytes: Vec<u8>,
    },
}

/// Transfer implementation injected into the engine.
///
/// A fetcher resolves a source locator and streams the payload through the
/// `events` channel; the engine owns all writes to storage. Implementations
/// must watch `cancel` between chunks and return [`FetchError::Cancelled`]
/// promptly once it fires.
///
/// [`FetchError::Cancelled`]: crate::error::FetchError::Cancelled
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Run one fetch attempt to completion, cancellation, or failure.
    async fn fetch(
        &self,
        request: FetchRequest,
        events: mpsc::Sender<FetchEvent>,
        cancel: CancelToken,
    ) -> FetchResult<()>;
}
