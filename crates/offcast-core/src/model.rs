//! Domain DTOs shared across the download subsystem.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Caller-facing request to admit a new download task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// Opaque caller-supplied task identifier. Re-adding an existing id is a
    /// no-op for the engine.
    pub id: String,
    /// Opaque locator the fetcher resolves to bytes.
    pub source: String,
    /// Caller-attached blob round-tripped through the index and the bus.
    #[serde(default)]
    pub payload: Vec<u8>,
}

/// Content-addressed storage key derived from a source locator.
///
/// The derivation is stable across restarts so a half-written prefix can be
/// found again for ranged resume.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for a source locator.
    #[must_use]
    pub fn for_source(source: &str) -> Self {
        use std::fmt::Write as _;

        let digest = Sha256::digest(source.as_bytes());
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest {
            let _ = write!(hex, "{byte:02x}");
        }
        Self(hex)
    }

    /// Rebuild a key from its hex form, e.g. a scanned filename stem.
    /// Returns `None` when the input is not a lowercase hex digest.
    #[must_use]
    pub fn from_hex(hex: &str) -> Option<Self> {
        let valid = hex.len() == 64
            && hex
                .chars()
                .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase());
        valid.then(|| Self(hex.to_owned()))
    }

    /// Key as a filesystem-safe lowercase hex string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Completion percentage in `[0, 100]`. An unknown total reports zero until
/// the transfer finishes.
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn percent_complete(bytes_done: u64, total_bytes: Option<u64>) -> f32 {
    match total_bytes {
        Some(total) if total > 0 => {
            (((bytes_done.min(total) as f64) / (total as f64)) * 100.0) as f32
        }
        _ => 0.0,
    }
}
