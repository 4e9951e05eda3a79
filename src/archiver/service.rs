use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use url::Url;

use super::localize::localize_images;
use super::rate_limiter::HostLimiter;
use super::snapshot;
use crate::article::{Article, ArticleExtractor};
use crate::config::Config;
use crate::db::{
    delete_archive_for_bookmark, get_archive_for_bookmark, get_archive_keys, get_bookmark,
    replace_archive, set_archive_status, try_mark_processing, ArchiveStatus, ArchiveWrite,
    Bookmark, Database, NewArchive, NewImage,
};
use crate::error::ArchiveError;
use crate::fetch::PageFetcher;
use crate::images::{DownloadedImage, ImageBatch, ImageDownloader};
use crate::metadata::{MetadataExtractor, MetadataRecord};
use crate::storage::{archive_storage_prefix, BlobStore};

/// What an archive request ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveOutcome {
    /// A new archive was committed.
    Archived(ArchiveSummary),
    /// Another attempt already holds the bookmark; nothing was done.
    AlreadyProcessing { bookmark_id: i64 },
}

/// Summary of a committed archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub bookmark_id: i64,
    pub archive_id: i64,
    /// Whether an existing archive row was replaced by this commit.
    pub replaced: bool,
    pub image_count: usize,
    pub word_count: u32,
    pub primary_image_path: Option<String>,
    pub used_fallback: bool,
}

/// Runs the archival pipeline for one bookmark at a time.
///
/// Cheap to share: clone the `Arc` it is usually held in.
#[derive(Debug)]
pub struct ArchiveService {
    db: Database,
    store: Arc<dyn BlobStore>,
    fetcher: PageFetcher,
    metadata: MetadataExtractor,
    article: ArticleExtractor,
    images: ImageDownloader,
    hosts: Arc<HostLimiter>,
    public_prefix: String,
}

impl ArchiveService {
    /// # Errors
    ///
    /// Returns an error if an HTTP client cannot be constructed.
    pub fn new(config: &Config, db: Database, store: Arc<dyn BlobStore>) -> anyhow::Result<Self> {
        Ok(Self {
            fetcher: PageFetcher::new(config.page_timeout)?,
            metadata: MetadataExtractor::new(),
            article: ArticleExtractor::new(),
            images: ImageDownloader::from_config(config, Arc::clone(&store))?,
            hosts: Arc::new(HostLimiter::new(config.per_domain_concurrency)),
            public_prefix: config.public_storage_prefix.clone(),
            db,
            store,
        })
    }

    #[must_use]
    pub const fn db(&self) -> &Database {
        &self.db
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    #[must_use]
    pub fn host_limiter(&self) -> &Arc<HostLimiter> {
        &self.hosts
    }

    /// Archive a bookmark.
    ///
    /// Does nothing if another attempt already has the bookmark in `processing`.
    ///
    /// # Errors
    ///
    /// Returns the reason the attempt failed; the bookmark is left `failed`.
    pub async fn archive(&self, bookmark_id: i64) -> Result<ArchiveOutcome, ArchiveError> {
        let bookmark = self.load_bookmark(bookmark_id).await?;

        let claimed = try_mark_processing(self.db.pool(), bookmark_id)
            .await
            .map_err(ArchiveError::Persistence)?;
        if !claimed {
            info!(bookmark_id, "Bookmark is already being archived, skipping");
            return Ok(ArchiveOutcome::AlreadyProcessing { bookmark_id });
        }

        self.run_attempt(&bookmark).await
    }

    /// Delete the bookmark's archive, images and stored files, then archive it again.
    ///
    /// Runs even if another attempt holds the bookmark.
    ///
    /// # Errors
    ///
    /// Returns the reason the attempt failed; the bookmark is left `failed`.
    pub async fn re_archive(&self, bookmark_id: i64) -> Result<ArchiveOutcome, ArchiveError> {
        let bookmark = self.load_bookmark(bookmark_id).await?;

        set_archive_status(self.db.pool(), bookmark_id, ArchiveStatus::Processing)
            .await
            .map_err(ArchiveError::Persistence)?;

        if let Err(e) = self.clear_archive(&bookmark).await {
            error!(bookmark_id, error = %e, "Failed to clear previous archive");
            self.mark_failed(bookmark_id).await;
            return Err(e);
        }

        self.run_attempt(&bookmark).await
    }

    /// Clean up after an attempt that was cut off from outside (timeout, cancellation).
    ///
    /// Marks the bookmark failed and, if it has no committed archive, removes whatever the
    /// attempt left in storage.
    pub async fn abandon(&self, bookmark_id: i64) {
        self.mark_failed(bookmark_id).await;

        let bookmark = match get_bookmark(self.db.pool(), bookmark_id).await {
            Ok(Some(bookmark)) => bookmark,
            Ok(None) => return,
            Err(e) => {
                warn!(bookmark_id, error = %format!("{e:#}"), "Failed to load abandoned bookmark");
                return;
            }
        };

        match get_archive_for_bookmark(self.db.pool(), bookmark_id).await {
            Ok(None) => {
                let prefix = archive_storage_prefix(bookmark.user_id, bookmark.id);
                match self.store.delete_prefix(&prefix).await {
                    Ok(removed) => {
                        debug!(bookmark_id, removed, "Removed files of abandoned attempt");
                    }
                    Err(e) => {
                        warn!(bookmark_id, error = %format!("{e:#}"), "Failed to remove abandoned files");
                    }
                }
            }
            Ok(Some(_)) => {}
            Err(e) => {
                warn!(bookmark_id, error = %format!("{e:#}"), "Failed to check for committed archive");
            }
        }
    }

    async fn load_bookmark(&self, bookmark_id: i64) -> Result<Bookmark, ArchiveError> {
        get_bookmark(self.db.pool(), bookmark_id)
            .await
            .map_err(ArchiveError::Persistence)?
            .ok_or(ArchiveError::BookmarkNotFound(bookmark_id))
    }

    async fn clear_archive(&self, bookmark: &Bookmark) -> Result<(), ArchiveError> {
        let existed = delete_archive_for_bookmark(self.db.pool(), bookmark.id)
            .await
            .map_err(ArchiveError::Persistence)?;

        let prefix = archive_storage_prefix(bookmark.user_id, bookmark.id);
        let removed = self
            .store
            .delete_prefix(&prefix)
            .await
            .map_err(ArchiveError::Storage)?;

        debug!(bookmark_id = bookmark.id, existed, removed, "Cleared previous archive");
        Ok(())
    }

    async fn run_attempt(&self, bookmark: &Bookmark) -> Result<ArchiveOutcome, ArchiveError> {
        info!(bookmark_id = bookmark.id, url = %bookmark.url, "Archiving bookmark");

        let mut written = Vec::new();
        match self.pipeline(bookmark, &mut written).await {
            Ok(summary) => {
                info!(
                    bookmark_id = bookmark.id,
                    archive_id = summary.archive_id,
                    images = summary.image_count,
                    words = summary.word_count,
                    replaced = summary.replaced,
                    "Archive complete"
                );
                Ok(ArchiveOutcome::Archived(summary))
            }
            Err(e) => {
                warn!(bookmark_id = bookmark.id, url = %bookmark.url, error = %e, "Archive attempt failed");
                self.discard_written(bookmark.id, &written).await;
                self.mark_failed(bookmark.id).await;
                Err(e)
            }
        }
    }

    /// Every stage of one attempt. Keys stored along the way are pushed onto `written`
    /// so a failed attempt can remove them.
    async fn pipeline(
        &self,
        bookmark: &Bookmark,
        written: &mut Vec<String>,
    ) -> Result<ArchiveSummary, ArchiveError> {
        let url = Url::parse(&bookmark.url)
            .map_err(|e| ArchiveError::InvalidUrl(format!("{}: {e}", bookmark.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ArchiveError::InvalidUrl(bookmark.url.clone()));
        }
        let host = url
            .host_str()
            .ok_or_else(|| ArchiveError::InvalidUrl(bookmark.url.clone()))?
            .to_lowercase();

        let html = {
            let _permit = self
                .hosts
                .acquire(&host)
                .await
                .map_err(|e| ArchiveError::Fetch(format!("host limiter closed: {e}")))?;
            self.fetcher.fetch(&bookmark.url).await?
        };

        let metadata = self.metadata.extract(&html, &bookmark.url);
        let article = self.article.extract(&html, &bookmark.url);
        if article.used_fallback {
            debug!(bookmark_id = bookmark.id, "Article extracted by selector fallback");
        }

        let prefix = archive_storage_prefix(bookmark.user_id, bookmark.id);
        let images_dir = format!("{prefix}/images");

        let batch = if article.images.is_empty() {
            ImageBatch::default()
        } else {
            self.images
                .download_batch(&article.images, &images_dir, &bookmark.url)
                .await
        };
        written.extend(batch.downloaded.iter().map(|image| image.local_path.clone()));

        let content_html = match localize_images(&article.html, &batch.url_to_path, &self.public_prefix) {
            Ok(localized) => localized,
            Err(e) => {
                warn!(bookmark_id = bookmark.id, error = %format!("{e:#}"), "Image localization failed, keeping remote URLs");
                article.html.clone()
            }
        };

        let snapshot_path = snapshot::snapshot_key(&prefix);
        let compressed = snapshot::compress(&html).map_err(ArchiveError::Storage)?;
        self.store
            .put(&snapshot_path, &compressed)
            .await
            .map_err(ArchiveError::Storage)?;
        written.push(snapshot_path.clone());

        let favicon_path = match &metadata.favicon {
            Some(favicon) => {
                self.images
                    .download_single(favicon, &prefix, "favicon", &bookmark.url)
                    .await
            }
            None => None,
        };
        written.extend(favicon_path.clone());

        let og_image_path = match &metadata.og_image {
            Some(og_image) => {
                self.images
                    .download_single(og_image, &prefix, "og_image", &bookmark.url)
                    .await
            }
            None => None,
        };
        written.extend(og_image_path.clone());

        let primary_image_path = batch
            .primary()
            .map(|image| image.local_path.clone())
            .or_else(|| og_image_path.clone());

        let record = new_archive(
            &metadata,
            &article,
            content_html,
            snapshot_path,
            og_image_path,
            primary_image_path.clone(),
            (!batch.downloaded.is_empty()).then_some(images_dir),
            favicon_path,
        );
        let images: Vec<NewImage> = batch.downloaded.iter().map(new_image).collect();

        let write = replace_archive(self.db.pool(), bookmark.id, &record, &images)
            .await
            .map_err(ArchiveError::Persistence)?;

        if let ArchiveWrite::Replaced { superseded_keys, .. } = &write {
            // A concurrent attempt committed first; drop the files only it referenced.
            let current: HashSet<&String> = written.iter().collect();
            for key in superseded_keys.iter().filter(|key| !current.contains(key)) {
                if let Err(e) = self.store.delete(key).await {
                    warn!(bookmark_id = bookmark.id, key = %key, error = %format!("{e:#}"), "Failed to delete superseded file");
                }
            }
        }

        Ok(ArchiveSummary {
            bookmark_id: bookmark.id,
            archive_id: write.archive_id(),
            replaced: matches!(write, ArchiveWrite::Replaced { .. }),
            image_count: images.len(),
            word_count: article.word_count,
            primary_image_path,
            used_fallback: article.used_fallback,
        })
    }

    /// Remove files a failed attempt stored, sparing any a committed archive references.
    async fn discard_written(&self, bookmark_id: i64, written: &[String]) {
        if written.is_empty() {
            return;
        }

        let keep: HashSet<String> = match get_archive_keys(self.db.pool(), bookmark_id).await {
            Ok(keys) => keys.into_iter().collect(),
            Err(e) => {
                warn!(bookmark_id, error = %format!("{e:#}"), "Cannot tell which files are committed, keeping them");
                return;
            }
        };

        for key in written.iter().filter(|key| !keep.contains(*key)) {
            if let Err(e) = self.store.delete(key).await {
                warn!(bookmark_id, key = %key, error = %format!("{e:#}"), "Failed to delete file of failed attempt");
            }
        }
    }

    async fn mark_failed(&self, bookmark_id: i64) {
        if let Err(e) = set_archive_status(self.db.pool(), bookmark_id, ArchiveStatus::Failed).await {
            error!(bookmark_id, error = %format!("{e:#}"), "Failed to mark bookmark failed");
        }
    }
}

fn new_archive(
    metadata: &MetadataRecord,
    article: &Article,
    content_html: String,
    snapshot_path: String,
    og_image_path: Option<String>,
    primary_image_path: Option<String>,
    images_directory: Option<String>,
    favicon_path: Option<String>,
) -> NewArchive {
    NewArchive {
        content_html: Some(content_html),
        content_text: Some(article.text.clone()),
        snapshot_path: Some(snapshot_path),
        title: metadata.title.clone(),
        description: metadata.description.clone(),
        author: metadata.author.clone(),
        published_date: metadata.published_date.map(|d| d.to_rfc3339()),
        modified_date: metadata.modified_date.map(|d| d.to_rfc3339()),
        language: metadata.language.clone(),
        site_name: metadata.site_name.clone(),
        og_title: metadata.og_title.clone(),
        og_description: metadata.og_description.clone(),
        og_image_path,
        primary_image_path,
        images_directory,
        word_count: article.word_count,
        metadata: serde_json::to_string(metadata).ok(),
        archived_at: Utc::now().to_rfc3339(),
        favicon_path,
    }
}

fn new_image(image: &DownloadedImage) -> NewImage {
    NewImage {
        original_url: image.original_url.clone(),
        local_path: image.local_path.clone(),
        file_name: image.file_name.clone(),
        file_size: i64::try_from(image.file_size).unwrap_or(i64::MAX),
        width: image.width.map(i64::from),
        height: image.height.map(i64::from),
        mime_type: image.mime_type.clone(),
        alt_text: image.alt_text.clone(),
        caption: image.caption.clone(),
    }
}
