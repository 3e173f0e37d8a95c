//! Engine-agnostic download interfaces and DTOs.
//!
//! This crate owns the seams between the download engine and its injected
//! collaborators: the [`Fetcher`] trait that turns an opaque source locator
//! into bytes, the cooperative [`CancelToken`] handed to every fetch, and the
//! control/inspection traits the engine facade implements.

pub mod cancel;
pub mod error;
pub mod fetch;
pub mod model;
pub mod service;

pub use cancel::{CancelHandle, CancelToken, cancel_pair};
pub use error::{FetchError, FetchResult};
pub use fetch::{FetchEvent, FetchRequest, Fetcher};
pub use model::{CacheKey, DownloadRequest, percent_complete};
pub use service::{DownloadControl, DownloadInspector};
