//! Blob storage for archive artifacts.
//!
//! Keys are `/`-separated and hierarchical, e.g. `archives/{user_id}/{bookmark_id}/images/img_001.png`.
//! Deleting a prefix removes everything stored beneath it.

mod local;
mod s3_store;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

pub use local::LocalStore;
pub use s3_store::S3Store;

use crate::config::{Config, StorageBackend};

/// Key-to-bytes store used for snapshots and images.
#[async_trait]
pub trait BlobStore: Send + Sync + std::fmt::Debug {
    /// Store `bytes` under `key`, replacing any existing value.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Fetch the bytes under `key`, or `None` if nothing is stored there.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Remove every key under `prefix`, returning how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;

    /// All keys under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }
}

/// Build the store selected by configuration.
///
/// # Errors
///
/// Returns an error if the S3 client cannot be created.
pub fn from_config(config: &Config) -> Result<Arc<dyn BlobStore>> {
    match &config.storage {
        StorageBackend::Local { root } => Ok(Arc::new(LocalStore::new(root.clone()))),
        StorageBackend::S3 {
            bucket,
            region,
            endpoint,
        } => Ok(Arc::new(S3Store::new(bucket, region, endpoint.as_deref())?)),
    }
}

/// Storage prefix holding everything archived for one bookmark.
#[must_use]
pub fn archive_storage_prefix(user_id: i64, bookmark_id: i64) -> String {
    format!("archives/{user_id}/{bookmark_id}")
}

/// Content type stored alongside a key, guessed from its extension.
pub(crate) fn content_type_for(key: &str) -> String {
    mime_guess::from_path(key)
        .first_or_octet_stream()
        .to_string()
}
