use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use super::BlobStore;

/// Blobs stored as files under a root directory, one file per key.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key onto the filesystem, refusing keys that would escape the root.
    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key.trim_start_matches('/'));
        if relative.as_os_str().is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            anyhow::bail!("Invalid storage key: {key:?}");
        }
        Ok(self.root.join(relative))
    }

    /// Every file beneath `dir`, walked with an explicit stack.
    async fn files_under(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut stack = vec![dir.to_path_buf()];

        while let Some(current) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&current).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(anyhow::Error::new(e))
                        .context(format!("Failed to read directory: {}", current.display()))
                }
            };

            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(entry.path());
                } else if file_type.is_file() {
                    files.push(entry.path());
                }
            }
        }

        Ok(files)
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<_> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => part.to_str(),
                _ => None,
            })
            .collect();
        Some(parts.join("/"))
    }
}

#[async_trait]
impl BlobStore for LocalStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write blob: {}", path.display()))?;
        debug!(key = %key, bytes = bytes.len(), "Stored blob");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(anyhow::Error::new(e))
                .context(format!("Failed to read blob: {}", path.display())),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::Error::new(e))
                .context(format!("Failed to delete blob: {}", path.display())),
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let path = self.path_for(prefix.trim_end_matches('/'))?;

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(anyhow::Error::new(e))
                    .context(format!("Failed to stat prefix: {}", path.display()))
            }
        };

        if metadata.is_file() {
            tokio::fs::remove_file(&path)
                .await
                .with_context(|| format!("Failed to delete blob: {}", path.display()))?;
            return Ok(1);
        }

        let removed = Self::files_under(&path).await?.len();
        tokio::fs::remove_dir_all(&path)
            .await
            .with_context(|| format!("Failed to delete directory: {}", path.display()))?;
        debug!(prefix = %prefix, removed, "Deleted blob prefix");
        Ok(removed)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let path = self.path_for(prefix.trim_end_matches('/'))?;
        if tokio::fs::metadata(&path)
            .await
            .is_ok_and(|m| m.is_file())
        {
            return Ok(vec![prefix.trim_end_matches('/').to_string()]);
        }

        let mut keys: Vec<String> = Self::files_under(&path)
            .await?
            .iter()
            .filter_map(|file| self.key_for(file))
            .collect();
        keys.sort();
        Ok(keys)
    }
}
