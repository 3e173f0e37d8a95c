//! Cooperative cancellation primitives handed to fetchers.

use tokio::sync::watch;

/// Create a linked cancel handle/token pair.
#[must_use]
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (sender, receiver) = watch::channel(false);
    (CancelHandle { sender }, CancelToken { receiver })
}

/// Engine-side half of a cancellation pair. Dropping the handle cancels the
/// token, so an aborted control path can never leak a running fetch.
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl CancelHandle {
    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        let _ = self.sender.send(true);
    }
}

/// Fetcher-side half of a cancellation pair.
#[derive(Debug, Clone)]
pub struct CancelToken {
    receiver: watch::Receiver<bool>,
}

impl CancelToken {
    /// Whether cancellation has been requested or the handle was dropped.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow() || self.receiver.has_changed().is_err()
    }

    /// Wait until cancellation is requested or the handle is dropped.
    pub async fn cancelled(&mut self) {
        while !*self.receiver.borrow_and_update() {
            if self.receiver.changed().await.is_err() {
                return;
            }
        }
    }
}
