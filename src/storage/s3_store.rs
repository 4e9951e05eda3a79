use anyhow::{Context, Result};
use async_trait::async_trait;
use s3::creds::Credentials;
use s3::region::Region;
use s3::Bucket;
use tracing::debug;

use super::{content_type_for, BlobStore};

/// Blobs stored as objects in an S3-compatible bucket.
#[derive(Clone)]
pub struct S3Store {
    bucket: Box<Bucket>,
}

impl S3Store {
    /// Connect to `bucket`, using `endpoint` for S3-compatible services (MinIO, R2).
    ///
    /// Credentials come from `AWS_ACCESS_KEY_ID` and `AWS_SECRET_ACCESS_KEY`.
    ///
    /// # Errors
    ///
    /// Returns an error if credentials are missing or the bucket handle cannot be built.
    pub fn new(bucket: &str, region: &str, endpoint: Option<&str>) -> Result<Self> {
        let access_key = std::env::var("AWS_ACCESS_KEY_ID").context("AWS_ACCESS_KEY_ID not set")?;
        let secret_key =
            std::env::var("AWS_SECRET_ACCESS_KEY").context("AWS_SECRET_ACCESS_KEY not set")?;

        let credentials = Credentials::new(Some(&access_key), Some(&secret_key), None, None, None)
            .context("Failed to create S3 credentials")?;

        let region = match endpoint {
            Some(endpoint) => Region::Custom {
                region: region.to_string(),
                endpoint: endpoint.to_string(),
            },
            None => region.parse().unwrap_or(Region::UsEast1),
        };

        let handle =
            Bucket::new(bucket, region, credentials).context("Failed to create S3 bucket")?;

        // Path-style addressing for custom endpoints
        let handle = if endpoint.is_some() {
            handle.with_path_style()
        } else {
            handle
        };

        Ok(Self { bucket: handle })
    }

    /// Normalize a prefix so `archives/1/2` never matches `archives/1/20`.
    fn directory_prefix(prefix: &str) -> String {
        format!("{}/", prefix.trim_end_matches('/'))
    }
}

#[async_trait]
impl BlobStore for S3Store {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let content_type = content_type_for(key);
        debug!(key = %key, content_type = %content_type, bytes = bytes.len(), "Uploading blob to S3");

        self.bucket
            .put_object_with_content_type(key, bytes, &content_type)
            .await
            .context("Failed to upload blob to S3")?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.bucket.get_object(key).await {
            Ok(response) if response.status_code() == 404 => Ok(None),
            Ok(response) => Ok(Some(response.to_vec())),
            Err(s3::error::S3Error::HttpFailWithBody(404, _)) => Ok(None),
            Err(e) => Err(anyhow::anyhow!("S3 get object failed: {e}")),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        debug!(key = %key, "Deleting S3 object");
        self.bucket
            .delete_object(key)
            .await
            .context("Failed to delete S3 object")?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let keys = self.list(prefix).await?;
        for key in &keys {
            self.delete(key).await?;
        }
        debug!(prefix = %prefix, removed = keys.len(), "Deleted S3 prefix");
        Ok(keys.len())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let results = self
            .bucket
            .list(Self::directory_prefix(prefix), None)
            .await
            .context("Failed to list S3 objects")?;

        let mut keys: Vec<String> = results
            .into_iter()
            .flat_map(|result| result.contents)
            .map(|object| object.key)
            .collect();
        keys.sort();
        Ok(keys)
    }
}

impl std::fmt::Debug for S3Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Store")
            .field("bucket", &self.bucket.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_prefix() {
        assert_eq!(S3Store::directory_prefix("archives/1/2"), "archives/1/2/");
        assert_eq!(S3Store::directory_prefix("archives/1/2/"), "archives/1/2/");
    }
}
