//! Shared constants used across the archival pipeline.

/// User agent string used for archival HTTP requests.
///
/// This is a realistic browser user agent that is indistinguishable from a real browser,
/// making archival requests appear as normal browser traffic.
pub const ARCHIVAL_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// `Accept` header sent with page requests.
pub const PAGE_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

/// `Accept-Language` header sent with page requests.
pub const PAGE_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.5";

/// `Accept` header sent with image requests.
pub const IMAGE_ACCEPT: &str = "image/webp,image/apng,image/*,*/*;q=0.8";

/// Redirects followed when fetching a page.
pub const PAGE_MAX_REDIRECTS: usize = 5;

/// Redirects followed when fetching an image.
pub const IMAGE_MAX_REDIRECTS: usize = 3;

/// Largest page body accepted, in bytes (20 MiB).
pub const MAX_PAGE_BYTES: u64 = 20_971_520;

/// Largest image accepted, in bytes (10 MiB).
pub const MAX_IMAGE_BYTES: u64 = 10_485_760;

/// Images fetched concurrently in one batch.
pub const IMAGE_BATCH_SIZE: usize = 20;

/// Average reading speed used for reading-time estimates.
pub const WORDS_PER_MINUTE: u32 = 225;

/// MIME types an archived image may have.
pub const ACCEPTED_IMAGE_TYPES: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/webp"];

/// Calculate reading time in minutes from a word count.
///
/// Always at least one minute, even for empty articles.
#[must_use]
pub fn reading_time_minutes(word_count: u32) -> u32 {
    word_count.div_ceil(WORDS_PER_MINUTE).max(1)
}
