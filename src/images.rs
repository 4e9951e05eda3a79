//! Image downloading for archived articles.
//!
//! Images are fetched in batches of bounded size. Each response is size-checked, its type
//! sniffed from the bytes, and accepted images are written to blob storage under a name
//! derived from the image's position in the request.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::future::join_all;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::redirect::Policy;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, warn};

use crate::article::ImageRef;
use crate::config::Config;
use crate::constants::{ACCEPTED_IMAGE_TYPES, ARCHIVAL_USER_AGENT, IMAGE_ACCEPT, IMAGE_MAX_REDIRECTS};
use crate::storage::BlobStore;
use crate::url_utils::resolve;

/// Why an image was left out of an archive. Never fatal to the archive attempt.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImageRejection {
    #[error("could not resolve image URL")]
    Unresolvable,
    #[error("request failed: {0}")]
    Request(String),
    #[error("HTTP {0}")]
    Status(u16),
    #[error("empty response")]
    Empty,
    #[error("{0} bytes exceeds the size limit")]
    TooLarge(u64),
    #[error("unsupported type {0}")]
    UnsupportedType(String),
    #[error("failed to store image: {0}")]
    Storage(String),
}

/// An image that was fetched, validated and stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedImage {
    /// The reference as submitted, possibly relative.
    pub original_url: String,
    pub absolute_url: String,
    /// Storage key of the stored bytes.
    pub local_path: String,
    pub file_name: String,
    pub file_size: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub mime_type: String,
    pub alt_text: Option<String>,
    pub caption: Option<String>,
}

/// Result of downloading a batch of images.
#[derive(Debug, Clone, Default)]
pub struct ImageBatch {
    /// Both the original and the absolute URL of every stored image, mapped to its key.
    pub url_to_path: HashMap<String, String>,
    /// Stored images in submission order.
    pub downloaded: Vec<DownloadedImage>,
}

impl ImageBatch {
    /// The archive's primary image: the first one that was stored.
    #[must_use]
    pub fn primary(&self) -> Option<&DownloadedImage> {
        self.downloaded.first()
    }
}

/// Fetches and stores images referenced by an article.
#[derive(Debug, Clone)]
pub struct ImageDownloader {
    client: reqwest::Client,
    store: Arc<dyn BlobStore>,
    batch_size: usize,
    max_bytes: u64,
}

impl ImageDownloader {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(
        store: Arc<dyn BlobStore>,
        timeout: Duration,
        batch_size: usize,
        max_bytes: u64,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(Policy::limited(IMAGE_MAX_REDIRECTS))
            .user_agent(ARCHIVAL_USER_AGENT)
            .build()
            .context("Failed to build image HTTP client")?;

        Ok(Self {
            client,
            store,
            batch_size: batch_size.max(1),
            max_bytes,
        })
    }

    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn from_config(config: &Config, store: Arc<dyn BlobStore>) -> anyhow::Result<Self> {
        Self::new(
            store,
            config.image_timeout,
            config.image_concurrency,
            config.max_image_bytes,
        )
    }

    /// Download `images` into `dir_key`, resolving relative references against `base_url`.
    ///
    /// Each batch runs fully concurrently and completes before the next starts. Rejected
    /// images are logged and skipped. The stored name is `img_NNN.<ext>` where `NNN` is the
    /// image's one-based position in `images`.
    pub async fn download_batch(
        &self,
        images: &[ImageRef],
        dir_key: &str,
        base_url: &str,
    ) -> ImageBatch {
        let mut batch = ImageBatch::default();

        for (chunk_index, chunk) in images.chunks(self.batch_size).enumerate() {
            let offset = chunk_index * self.batch_size;
            let results = join_all(chunk.iter().enumerate().map(|(i, image)| {
                let file_stem = format!("img_{:03}", offset + i + 1);
                self.download_one(image, dir_key, file_stem, base_url)
            }))
            .await;

            for (image, result) in chunk.iter().zip(results) {
                match result {
                    Ok(downloaded) => {
                        batch
                            .url_to_path
                            .insert(downloaded.original_url.clone(), downloaded.local_path.clone());
                        batch
                            .url_to_path
                            .insert(downloaded.absolute_url.clone(), downloaded.local_path.clone());
                        batch.downloaded.push(downloaded);
                    }
                    Err(rejection) => {
                        debug!(url = %image.url, reason = %rejection, "Image rejected");
                    }
                }
            }
        }

        debug!(
            requested = images.len(),
            stored = batch.downloaded.len(),
            dir = %dir_key,
            "Image batch complete"
        );
        batch
    }

    /// Download one image to `{dir_key}/{name}.<ext>`, returning its storage key.
    ///
    /// Returns `None` for any failure; the reason is logged.
    pub async fn download_single(
        &self,
        url: &str,
        dir_key: &str,
        name: &str,
        base_url: &str,
    ) -> Option<String> {
        let image = ImageRef {
            url: url.to_string(),
            alt: None,
            caption: None,
        };
        match self
            .download_one(&image, dir_key, name.to_string(), base_url)
            .await
        {
            Ok(downloaded) => Some(downloaded.local_path),
            Err(rejection) => {
                warn!(url = %url, name = %name, reason = %rejection, "Single image download failed");
                None
            }
        }
    }

    async fn download_one(
        &self,
        image: &ImageRef,
        dir_key: &str,
        file_stem: String,
        base_url: &str,
    ) -> Result<DownloadedImage, ImageRejection> {
        let absolute_url = resolve(&image.url, base_url).ok_or(ImageRejection::Unresolvable)?;
        let (bytes, header_type) = self.fetch_bytes(&absolute_url).await?;

        let mime_type = detect_mime(&bytes, header_type.as_deref())?;
        let file_name = format!("{file_stem}.{}", extension_for(mime_type));
        let local_path = format!("{}/{file_name}", dir_key.trim_end_matches('/'));

        self.store
            .put(&local_path, &bytes)
            .await
            .map_err(|e| ImageRejection::Storage(format!("{e:#}")))?;

        let (width, height) = dimensions(&bytes).unzip();

        Ok(DownloadedImage {
            original_url: image.url.clone(),
            absolute_url,
            local_path,
            file_name,
            file_size: bytes.len() as u64,
            width,
            height,
            mime_type: mime_type.to_string(),
            alt_text: image.alt.clone(),
            caption: image.caption.clone(),
        })
    }

    /// GET an image, enforcing the size limit on both the declared and received length.
    async fn fetch_bytes(&self, url: &str) -> Result<(Vec<u8>, Option<String>), ImageRejection> {
        let mut response = self
            .client
            .get(url)
            .header(ACCEPT, IMAGE_ACCEPT)
            .send()
            .await
            .map_err(|e| ImageRejection::Request(e.to_string()))?;

        if response.status() != StatusCode::OK {
            return Err(ImageRejection::Status(response.status().as_u16()));
        }

        if let Some(length) = response.content_length() {
            if length > self.max_bytes {
                return Err(ImageRejection::TooLarge(length));
            }
        }

        let header_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);

        let mut bytes = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| ImageRejection::Request(e.to_string()))?
        {
            bytes.extend_from_slice(&chunk);
            if bytes.len() as u64 > self.max_bytes {
                return Err(ImageRejection::TooLarge(bytes.len() as u64));
            }
        }

        if bytes.is_empty() {
            return Err(ImageRejection::Empty);
        }
        Ok((bytes, header_type))
    }
}

/// The accepted MIME type of `bytes`.
///
/// Content sniffing decides when it recognizes the format; the declared content type is
/// only consulted when sniffing is inconclusive.
fn detect_mime(bytes: &[u8], header_type: Option<&str>) -> Result<&'static str, ImageRejection> {
    if let Some(kind) = infer::get(bytes) {
        return ACCEPTED_IMAGE_TYPES
            .iter()
            .find(|accepted| **accepted == kind.mime_type())
            .copied()
            .ok_or_else(|| ImageRejection::UnsupportedType(kind.mime_type().to_string()));
    }

    let declared = header_type
        .and_then(|value| value.split(';').next())
        .map(|value| value.trim().to_ascii_lowercase())
        .unwrap_or_default();

    ACCEPTED_IMAGE_TYPES
        .iter()
        .find(|accepted| **accepted == declared.as_str())
        .copied()
        .ok_or(ImageRejection::UnsupportedType(declared))
}

fn extension_for(mime_type: &str) -> &'static str {
    match mime_type {
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        _ => "jpg",
    }
}

/// Pixel dimensions, if the image header can be decoded.
fn dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MAX_IMAGE_BYTES;
    use crate::storage::LocalStore;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut out = Vec::new();
        image::RgbImage::new(width, height)
            .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        out
    }

    const GIF: &[u8] = b"GIF89a\x01\x00\x01\x00\x80\x00\x00\xff\xff\xff\x00\x00\x00!\xf9\x04\x01\x00\x00\x00\x00,\x00\x00\x00\x00\x01\x00\x01\x00\x00\x02\x02D\x01\x00;";

    fn downloader(dir: &TempDir) -> (ImageDownloader, Arc<LocalStore>) {
        let store = Arc::new(LocalStore::new(dir.path()));
        let downloader =
            ImageDownloader::new(store.clone(), Duration::from_secs(5), 20, MAX_IMAGE_BYTES)
                .unwrap();
        (downloader, store)
    }

    fn image_ref(url: &str, alt: Option<&str>) -> ImageRef {
        ImageRef {
            url: url.to_string(),
            alt: alt.map(ToString::to_string),
            caption: None,
        }
    }

    async fn mount_image(server: &MockServer, at: &str, body: Vec<u8>, content_type: &str) {
        Mock::given(method("GET"))
            .and(path(at))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, content_type))
            .mount(server)
            .await;
    }

    #[test]
    fn test_detect_mime_prefers_sniffing() {
        assert_eq!(detect_mime(&png(1, 1), Some("image/jpeg")), Ok("image/png"));
        assert_eq!(detect_mime(GIF, None), Ok("image/gif"));
        assert!(matches!(
            detect_mime(b"%PDF-1.7 rest", Some("image/png")),
            Err(ImageRejection::UnsupportedType(t)) if t == "application/pdf"
        ));
    }

    #[test]
    fn test_detect_mime_falls_back_to_header() {
        assert_eq!(
            detect_mime(b"not sniffable", Some("image/webp; q=1")),
            Ok("image/webp")
        );
        assert!(detect_mime(b"not sniffable", Some("text/plain")).is_err());
        assert!(detect_mime(b"not sniffable", None).is_err());
    }

    #[test]
    fn test_dimensions() {
        assert_eq!(dimensions(&png(3, 2)), Some((3, 2)));
        assert_eq!(dimensions(b"garbage"), None);
    }

    #[tokio::test]
    async fn test_batch_keeps_order_and_maps_both_urls() {
        let server = MockServer::start().await;
        mount_image(&server, "/img/a.png", png(4, 3), "image/png").await;
        mount_image(&server, "/img/b.gif", GIF.to_vec(), "image/gif").await;

        let dir = TempDir::new().unwrap();
        let (downloader, store) = downloader(&dir);
        let base = format!("{}/posts/1", server.uri());
        let images = vec![
            image_ref("/img/a.png", Some("A")),
            image_ref(&format!("{}/img/b.gif", server.uri()), None),
        ];

        let batch = downloader
            .download_batch(&images, "archives/1/2/images", &base)
            .await;

        assert_eq!(batch.downloaded.len(), 2);
        let first = &batch.downloaded[0];
        assert_eq!(first.local_path, "archives/1/2/images/img_001.png");
        assert_eq!(first.original_url, "/img/a.png");
        assert_eq!(first.absolute_url, format!("{}/img/a.png", server.uri()));
        assert_eq!((first.width, first.height), (Some(4), Some(3)));
        assert_eq!(first.alt_text.as_deref(), Some("A"));
        assert_eq!(batch.downloaded[1].local_path, "archives/1/2/images/img_002.gif");
        assert_eq!(batch.primary().map(|i| i.file_name.as_str()), Some("img_001.png"));

        assert_eq!(
            batch.url_to_path.get("/img/a.png").map(String::as_str),
            Some("archives/1/2/images/img_001.png")
        );
        assert_eq!(
            batch
                .url_to_path
                .get(&format!("{}/img/a.png", server.uri()))
                .map(String::as_str),
            Some("archives/1/2/images/img_001.png")
        );
        assert!(store
            .exists("archives/1/2/images/img_002.gif")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_batch_drops_oversized_and_non_images() {
        let server = MockServer::start().await;
        let oversized = {
            let mut bytes = png(1, 1);
            bytes.resize(11 * 1024 * 1024, 0);
            bytes
        };
        mount_image(&server, "/big.png", oversized, "image/png").await;
        mount_image(&server, "/page.html", b"<html></html>".to_vec(), "text/html").await;
        mount_image(&server, "/ok.png", png(2, 2), "image/png").await;
        Mock::given(method("GET"))
            .and(path("/missing.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let (downloader, store) = downloader(&dir);
        let images = vec![
            image_ref("/big.png", None),
            image_ref("/page.html", None),
            image_ref("/missing.png", None),
            image_ref("/ok.png", None),
        ];

        let batch = downloader
            .download_batch(&images, "archives/1/3/images", &server.uri())
            .await;

        assert_eq!(batch.downloaded.len(), 1);
        assert_eq!(batch.downloaded[0].file_name, "img_004.png");
        assert!(batch
            .downloaded
            .iter()
            .all(|img| img.file_size <= MAX_IMAGE_BYTES));
        assert_eq!(
            store.list("archives/1/3").await.unwrap(),
            vec!["archives/1/3/images/img_004.png"]
        );
    }

    #[tokio::test]
    async fn test_batches_of_bounded_size_preserve_numbering() {
        let server = MockServer::start().await;
        mount_image(&server, "/same.gif", GIF.to_vec(), "image/gif").await;

        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::new(dir.path()));
        let downloader =
            ImageDownloader::new(store, Duration::from_secs(5), 2, MAX_IMAGE_BYTES).unwrap();
        let images: Vec<_> = (0..5)
            .map(|i| image_ref(&format!("/same.gif?v={i}"), None))
            .collect();

        let batch = downloader
            .download_batch(&images, "archives/1/4/images", &server.uri())
            .await;

        let names: Vec<_> = batch.downloaded.iter().map(|i| i.file_name.as_str()).collect();
        assert_eq!(
            names,
            vec!["img_001.gif", "img_002.gif", "img_003.gif", "img_004.gif", "img_005.gif"]
        );
    }

    /// Serves `GIF` slowly, noting when each request arrived.
    struct SlowGif {
        arrivals: Arc<std::sync::Mutex<Vec<std::time::Instant>>>,
        delay: Duration,
    }

    impl wiremock::Respond for SlowGif {
        fn respond(&self, _request: &wiremock::Request) -> ResponseTemplate {
            self.arrivals.lock().unwrap().push(std::time::Instant::now());
            ResponseTemplate::new(200)
                .set_body_raw(GIF.to_vec(), "image/gif")
                .set_delay(self.delay)
        }
    }

    #[tokio::test]
    async fn test_batches_run_concurrently_without_overlap() {
        let delay = Duration::from_millis(300);
        let arrivals = Arc::new(std::sync::Mutex::new(Vec::new()));
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow.gif"))
            .respond_with(SlowGif {
                arrivals: Arc::clone(&arrivals),
                delay,
            })
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::new(dir.path()));
        let downloader =
            ImageDownloader::new(store, Duration::from_secs(5), 2, MAX_IMAGE_BYTES).unwrap();
        let images: Vec<_> = (0..5)
            .map(|i| image_ref(&format!("/slow.gif?v={i}"), None))
            .collect();

        let batch = downloader
            .download_batch(&images, "archives/1/6/images", &server.uri())
            .await;
        assert_eq!(batch.downloaded.len(), 5);

        let mut arrivals = arrivals.lock().unwrap().clone();
        arrivals.sort();
        assert_eq!(arrivals.len(), 5);
        // Both requests of a batch are in flight together
        assert!(arrivals[1] - arrivals[0] < delay);
        assert!(arrivals[3] - arrivals[2] < delay);
        // A batch starts only after the previous one has finished
        assert!(arrivals[2] - arrivals[1] >= delay);
        assert!(arrivals[4] - arrivals[3] >= delay);
    }

    #[tokio::test]
    async fn test_download_single_names_by_sniffed_type() {
        let server = MockServer::start().await;
        mount_image(&server, "/favicon.ico", png(16, 16), "image/x-icon").await;

        let dir = TempDir::new().unwrap();
        let (downloader, _store) = downloader(&dir);

        let key = downloader
            .download_single("/favicon.ico", "archives/1/5", "favicon", &server.uri())
            .await;
        assert_eq!(key.as_deref(), Some("archives/1/5/favicon.png"));

        let missing = downloader
            .download_single("/nope.png", "archives/1/5", "og_image", &server.uri())
            .await;
        assert_eq!(missing, None);
    }
}
