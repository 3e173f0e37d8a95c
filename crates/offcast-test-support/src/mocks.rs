//! Scripted fetchers for driving the engine without a network.

use async_trait::async_trait;
use offcast_core::{CancelToken, FetchError, FetchEvent, FetchRequest, FetchResult, Fetcher};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Failure a script injects, kept copyable because [`FetchError`] is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    /// Transfer-level failure.
    Network,
    /// Storage exhausted.
    StorageFull,
    /// Bad locator.
    InvalidRequest,
}

impl ScriptedFailure {
    fn into_error(self) -> FetchError {
        match self {
            Self::Network => FetchError::network(std::io::Error::other("scripted network failure")),
            Self::StorageFull => FetchError::StorageFull,
            Self::InvalidRequest => FetchError::InvalidRequest {
                detail: "scripted invalid request".into(),
            },
        }
    }
}

#[derive(Clone)]
enum Script {
    /// Wait for cancellation, then report it.
    Park,
    /// Announce the size and stream the body from the resume offset.
    Serve {
        body: Vec<u8>,
        chunk_size: usize,
        announce_total: bool,
    },
    /// Stream part of the body, then fail.
    ServeThenFail {
        body: Vec<u8>,
        total: u64,
        chunk_size: usize,
        failure: ScriptedFailure,
    },
    /// Fail immediately.
    Fail(ScriptedFailure),
}

/// Programmable [`Fetcher`] keyed by task id.
///
/// Ids without a script fall back to the constructor's default behavior.
/// Every call records the resume offset it was asked to continue from.
pub struct ScriptedFetcher {
    scripts: HashMap<String, Script>,
    fallback: Script,
    offsets: Mutex<Vec<(String, u64)>>,
}

impl ScriptedFetcher {
    /// Fetcher whose unscripted ids fail with an invalid-request error.
    #[must_use]
    pub fn new() -> Self {
        Self::with_fallback(Script::Fail(ScriptedFailure::InvalidRequest))
    }

    /// Fetcher whose unscripted ids park until cancelled.
    #[must_use]
    pub fn parked() -> Self {
        Self::with_fallback(Script::Park)
    }

    fn with_fallback(fallback: Script) -> Self {
        Self {
            scripts: HashMap::new(),
            fallback,
            offsets: Mutex::new(Vec::new()),
        }
    }

    /// Serve the full body for one id, announcing its total size.
    #[must_use]
    pub fn serve(self, id: &str, body: impl Into<Vec<u8>>) -> Self {
        self.serve_chunked(id, body, 4)
    }

    /// Serve the full body for one id in chunks of the given size.
    #[must_use]
    pub fn serve_chunked(mut self, id: &str, body: impl Into<Vec<u8>>, chunk_size: usize) -> Self {
        self.scripts.insert(
            id.to_owned(),
            Script::Serve {
                body: body.into(),
                chunk_size: chunk_size.max(1),
                announce_total: true,
            },
        );
        self
    }

    /// Serve the full body for one id without ever announcing a total size.
    #[must_use]
    pub fn serve_unsized(mut self, id: &str, body: impl Into<Vec<u8>>) -> Self {
        self.scripts.insert(
            id.to_owned(),
            Script::Serve {
                body: body.into(),
                chunk_size: 4,
                announce_total: false,
            },
        );
        self
    }

    /// Stream a prefix for one id, announce the given total, then fail.
    #[must_use]
    pub fn serve_then_fail(
        mut self,
        id: &str,
        body: impl Into<Vec<u8>>,
        total: u64,
        failure: ScriptedFailure,
    ) -> Self {
        self.scripts.insert(
            id.to_owned(),
            Script::ServeThenFail {
                body: body.into(),
                total,
                chunk_size: 4,
                failure,
            },
        );
        self
    }

    /// Fail one id immediately with the given failure.
    #[must_use]
    pub fn fail(mut self, id: &str, failure: ScriptedFailure) -> Self {
        self.scripts.insert(id.to_owned(), Script::Fail(failure));
        self
    }

    /// Park one id until its fetch is cancelled.
    #[must_use]
    pub fn park(mut self, id: &str) -> Self {
        self.scripts.insert(id.to_owned(), Script::Park);
        self
    }

    /// Resume offsets observed so far, in call order.
    ///
    /// # Panics
    ///
    /// Panics if a previous caller poisoned the internal lock.
    #[must_use]
    pub fn recorded_offsets(&self) -> Vec<(String, u64)> {
        self.offsets.lock().expect("offsets lock").clone()
    }

    async fn stream(
        body: &[u8],
        total: Option<u64>,
        chunk_size: usize,
        resume_offset: u64,
        events: &mpsc::Sender<FetchEvent>,
        cancel: &mut CancelToken,
    ) -> FetchResult<()> {
        send_or_cancelled(events, FetchEvent::Size { total_bytes: total }, cancel).await?;
        let start = usize::try_from(resume_offset).unwrap_or(body.len()).min(body.len());
        for chunk in body[start..].chunks(chunk_size) {
            send_or_cancelled(
                events,
                FetchEvent::Chunk {
                    bytes: chunk.to_vec(),
                },
                cancel,
            )
            .await?;
        }
        Ok(())
    }
}

impl Default for ScriptedFetcher {
    fn default() -> Self {
        Self::new()
    }
}

async fn send_or_cancelled(
    events: &mpsc::Sender<FetchEvent>,
    event: FetchEvent,
    cancel: &mut CancelToken,
) -> FetchResult<()> {
    tokio::select! {
        () = cancel.cancelled() => Err(FetchError::Cancelled),
        sent = events.send(event) => sent.map_err(|_| FetchError::Cancelled),
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(
        &self,
        request: FetchRequest,
        events: mpsc::Sender<FetchEvent>,
        mut cancel: CancelToken,
    ) -> FetchResult<()> {
        self.offsets
            .lock()
            .expect("offsets lock")
            .push((request.task_id.clone(), request.resume_offset));
        let script = self
            .scripts
            .get(&request.task_id)
            .unwrap_or(&self.fallback)
            .clone();
        match script {
            Script::Park => {
                cancel.cancelled().await;
                Err(FetchError::Cancelled)
            }
            Script::Serve {
                body,
                chunk_size,
                announce_total,
            } => {
                let total = announce_total.then(|| body.len() as u64);
                Self::stream(
                    &body,
                    total,
                    chunk_size,
                    request.resume_offset,
                    &events,
                    &mut cancel,
                )
                .await
            }
            Script::ServeThenFail {
                body,
                total,
                chunk_size,
                failure,
            } => {
                Self::stream(
                    &body,
                    Some(total),
                    chunk_size,
                    request.resume_offset,
                    &events,
                    &mut cancel,
                )
                .await?;
                Err(failure.into_error())
            }
            Script::Fail(failure) => Err(failure.into_error()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serve_streams_size_then_chunks_from_offset() {
        let fetcher = ScriptedFetcher::new().serve_chunked("t1", b"abcdefgh".to_vec(), 3);
        let (tx, mut rx) = mpsc::channel(8);
        let (_handle, cancel) = offcast_core::cancel_pair();
        let request = FetchRequest {
            task_id: "t1".into(),
            source: "https://cdn.example/t1".into(),
            resume_offset: 2,
        };
        fetcher.fetch(request, tx, cancel).await.expect("fetch");

        let size = rx.recv().await.expect("size event");
        assert!(matches!(
            size,
            FetchEvent::Size {
                total_bytes: Some(8)
            }
        ));
        let mut received = Vec::new();
        while let Some(FetchEvent::Chunk { bytes }) = rx.recv().await {
            received.extend_from_slice(&bytes);
        }
        assert_eq!(received, b"cdefgh");
        assert_eq!(fetcher.recorded_offsets(), vec![("t1".into(), 2)]);
    }

    #[tokio::test]
    async fn parked_fetch_returns_cancelled_after_the_handle_fires() {
        let fetcher = ScriptedFetcher::parked();
        let (tx, _rx) = mpsc::channel(8);
        let (handle, cancel) = offcast_core::cancel_pair();
        let request = FetchRequest {
            task_id: "t1".into(),
            source: "https://cdn.example/t1".into(),
            resume_offset: 0,
        };
        let fetch = tokio::spawn(async move { fetcher.fetch(request, tx, cancel).await });
        handle.cancel();
        let result = fetch.await.expect("join");
        assert!(matches!(result, Err(FetchError::Cancelled)));
    }

    #[tokio::test]
    async fn unscripted_id_uses_the_fallback() {
        let fetcher = ScriptedFetcher::new();
        let (tx, _rx) = mpsc::channel(8);
        let (_handle, cancel) = offcast_core::cancel_pair();
        let request = FetchRequest {
            task_id: "mystery".into(),
            source: "https://cdn.example/mystery".into(),
            resume_offset: 0,
        };
        let result = fetcher.fetch(request, tx, cancel).await;
        assert!(matches!(result, Err(FetchError::InvalidRequest { .. })));
    }
}
