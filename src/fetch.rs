//! Page retrieval with a browser-like identity.

use std::time::Duration;

use anyhow::Context;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE};
use reqwest::redirect::Policy;
use tracing::debug;

use crate::constants::{
    ARCHIVAL_USER_AGENT, MAX_PAGE_BYTES, PAGE_ACCEPT, PAGE_ACCEPT_LANGUAGE, PAGE_MAX_REDIRECTS,
};
use crate::error::ArchiveError;

/// Fetches raw HTML for a bookmark URL.
#[derive(Debug, Clone)]
pub struct PageFetcher {
    client: reqwest::Client,
    max_bytes: u64,
}

impl PageFetcher {
    /// Build a fetcher that gives up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(Policy::limited(PAGE_MAX_REDIRECTS))
            .user_agent(ARCHIVAL_USER_AGENT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            max_bytes: MAX_PAGE_BYTES,
        })
    }

    /// Refuse bodies larger than `max_bytes` instead of the default cap.
    #[must_use]
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Fetch the HTML body of `url`.
    ///
    /// Succeeds only for a final status in 200..=399 with a non-empty HTML body.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Fetch`] for timeouts, connection and DNS failures,
    /// 4xx/5xx statuses, oversized or empty bodies and non-HTML content.
    pub async fn fetch(&self, url: &str) -> Result<String, ArchiveError> {
        let mut response = self
            .client
            .get(url)
            .header(ACCEPT, PAGE_ACCEPT)
            .header(ACCEPT_LANGUAGE, PAGE_ACCEPT_LANGUAGE)
            .send()
            .await
            .map_err(|e| ArchiveError::Fetch(format!("request to {url} failed: {e}")))?;

        let status = response.status();
        if !(200..400).contains(&status.as_u16()) {
            return Err(ArchiveError::Fetch(format!("HTTP {status} for {url}")));
        }

        if let Some(content_type) = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        {
            if !is_html_content_type(content_type) {
                return Err(ArchiveError::Fetch(format!(
                    "unsupported content type '{content_type}' for {url}"
                )));
            }
        }

        if let Some(length) = response.content_length() {
            if length > self.max_bytes {
                return Err(ArchiveError::Fetch(format!(
                    "page of {length} bytes exceeds the size limit for {url}"
                )));
            }
        }

        let final_url = response.url().to_string();
        let mut bytes = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| ArchiveError::Fetch(format!("failed to read body of {url}: {e}")))?
        {
            bytes.extend_from_slice(&chunk);
            if bytes.len() as u64 > self.max_bytes {
                return Err(ArchiveError::Fetch(format!(
                    "page body exceeds the size limit for {url}"
                )));
            }
        }
        // Invalid UTF-8 sequences become U+FFFD.
        let body = String::from_utf8_lossy(&bytes).into_owned();

        if body.trim().is_empty() {
            return Err(ArchiveError::Fetch(format!("empty body for {url}")));
        }

        debug!(url = %url, final_url = %final_url, bytes = body.len(), "Fetched page");
        Ok(body)
    }
}

fn is_html_content_type(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_lowercase();
    mime.is_empty() || mime.contains("html")
}
