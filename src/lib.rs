//! Bookmark archiver library.
//!
//! Turns a bookmarked URL into a durable archive: the readable article with its images
//! stored locally, the page's metadata, and a compressed snapshot of the raw HTML.

// Allow raw string hashes for safety - they're harmless and prevent issues if content changes
#![allow(clippy::needless_raw_string_hashes)]

pub mod archiver;
pub mod article;
pub mod config;
pub mod constants;
pub mod db;
pub mod error;
pub mod fetch;
pub mod images;
pub mod jobs;
pub mod metadata;
pub mod storage;
pub mod url_utils;
