//! Error types for fetcher implementations.

use std::error::Error;

use offcast_events::FailureReason;
use thiserror::Error;

/// Primary error type reported by fetchers.
///
/// Timeouts are deliberately missing: a fetcher never classifies its own
/// stall, the engine does that from the outside and cancels the fetch.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Transfer failed below the fetcher (DNS, socket, HTTP status, ...).
    #[error("network transfer failed")]
    Network {
        /// Underlying failure.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// Destination storage refused further bytes.
    #[error("storage rejected written bytes")]
    StorageFull,
    /// The source locator or request parameters cannot be served.
    #[error("fetch request was invalid")]
    InvalidRequest {
        /// Human-readable rejection detail.
        detail: String,
    },
    /// The fetch observed its cancel token and unwound.
    #[error("fetch was cancelled")]
    Cancelled,
}

impl FetchError {
    /// Wrap an arbitrary transfer failure.
    pub fn network(source: impl Error + Send + Sync + 'static) -> Self {
        Self::Network {
            source: Box::new(source),
        }
    }

    /// Task-level failure classification, or `None` for cancellation, which
    /// is not a failure.
    #[must_use]
    pub const fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            Self::Network { .. } => Some(FailureReason::Network),
            Self::StorageFull => Some(FailureReason::StorageFull),
            Self::InvalidRequest { .. } => Some(FailureReason::InvalidRequest),
            Self::Cancelled => None,
        }
    }
}

/// Convenience alias for fetch results.
pub type FetchResult<T> = Result<T, FetchError>;
