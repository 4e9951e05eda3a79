//! Error taxonomy for archive attempts.

use std::time::Duration;

use thiserror::Error;

/// Why an archive attempt did not complete.
///
/// Per-image and per-metadata-field problems never show up here; they degrade the
/// result instead of aborting it.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The page could not be retrieved (network, timeout, non-2xx/3xx status, empty body,
    /// non-HTML content).
    #[error("failed to fetch page: {0}")]
    Fetch(String),

    /// A database write or read failed.
    #[error("persistence failure: {0:#}")]
    Persistence(anyhow::Error),

    /// A blob storage operation failed.
    #[error("storage failure: {0:#}")]
    Storage(anyhow::Error),

    /// The attempt ran past the job runner's wall-clock limit.
    #[error("archive attempt timed out after {0:?}")]
    Timeout(Duration),

    /// The bookmark URL cannot be archived at all.
    #[error("invalid bookmark url: {0}")]
    InvalidUrl(String),

    /// The bookmark disappeared while the attempt was running.
    #[error("bookmark {0} not found")]
    BookmarkNotFound(i64),

    /// The job used up every attempt it was allowed.
    #[error("gave up after {attempts} attempts: {last_error}")]
    ExhaustedRetries { attempts: u32, last_error: String },
}

impl ArchiveError {
    /// Whether the job runner should try this bookmark again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Fetch(_) | Self::Persistence(_) | Self::Storage(_) | Self::Timeout(_)
        )
    }
}
