use serde::{Deserialize, Serialize};

use crate::constants::reading_time_minutes;
use crate::metadata::MetadataRecord;

/// Archive status of a bookmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveStatus {
    /// Never archived.
    #[serde(rename = "none")]
    Unarchived,
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ArchiveStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unarchived => "none",
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::Unarchived),
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A saved link owned by a user.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Bookmark {
    pub id: i64,
    pub user_id: i64,
    pub url: String,
    pub url_hash: String,
    pub domain: Option<String>,
    pub title: Option<String>,
    pub favicon_path: Option<String>,
    pub is_archived: bool,
    pub archive_status: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Bookmark {
    /// Parsed status; unknown values read as never archived.
    #[must_use]
    pub fn status(&self) -> ArchiveStatus {
        ArchiveStatus::from_str(&self.archive_status).unwrap_or(ArchiveStatus::Unarchived)
    }
}

/// The durable snapshot of a bookmark's page.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BookmarkArchive {
    pub id: i64,
    pub bookmark_id: i64,
    pub content_html: Option<String>,
    pub content_text: Option<String>,
    pub snapshot_path: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub published_date: Option<String>,
    pub modified_date: Option<String>,
    pub language: Option<String>,
    pub site_name: Option<String>,
    pub og_title: Option<String>,
    pub og_description: Option<String>,
    pub og_image_path: Option<String>,
    pub primary_image_path: Option<String>,
    pub images_directory: Option<String>,
    pub image_count: i64,
    pub word_count: i64,
    pub reading_time: i64,
    pub metadata: Option<String>,
    pub archived_at: String,
    pub created_at: String,
    pub updated_at: String,
}

impl BookmarkArchive {
    /// The full extracted metadata record stored with the archive.
    #[must_use]
    pub fn metadata_record(&self) -> Option<MetadataRecord> {
        self.metadata
            .as_deref()
            .and_then(|json| serde_json::from_str(json).ok())
    }

    /// The first `len` characters of the article text, with `...` appended when cut.
    #[must_use]
    pub fn excerpt(&self, len: usize) -> String {
        let text = self.content_text.as_deref().unwrap_or_default().trim();
        match text.char_indices().nth(len) {
            Some((cut, _)) => format!("{}...", text[..cut].trim_end()),
            None => text.to_string(),
        }
    }

    /// Storage keys referenced by this row (snapshot, social image, primary image).
    #[must_use]
    pub fn stored_keys(&self) -> Vec<String> {
        [
            &self.snapshot_path,
            &self.og_image_path,
            &self.primary_image_path,
        ]
        .into_iter()
        .flatten()
        .cloned()
        .collect()
    }
}

/// A downloaded image belonging to an archive.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BookmarkImage {
    pub id: i64,
    pub archive_id: i64,
    pub original_url: String,
    pub local_path: String,
    pub file_name: String,
    pub file_size: i64,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub mime_type: String,
    pub alt_text: Option<String>,
    pub caption: Option<String>,
    pub is_primary: bool,
    pub position: i64,
    pub created_at: String,
}

/// Data for inserting a new bookmark.
#[derive(Debug, Clone)]
pub struct NewBookmark {
    pub user_id: i64,
    pub url: String,
    pub title: Option<String>,
}

/// Data for writing a bookmark's archive.
#[derive(Debug, Clone, Default)]
pub struct NewArchive {
    pub content_html: Option<String>,
    pub content_text: Option<String>,
    pub snapshot_path: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub published_date: Option<String>,
    pub modified_date: Option<String>,
    pub language: Option<String>,
    pub site_name: Option<String>,
    pub og_title: Option<String>,
    pub og_description: Option<String>,
    pub og_image_path: Option<String>,
    pub primary_image_path: Option<String>,
    pub images_directory: Option<String>,
    pub word_count: u32,
    pub metadata: Option<String>,
    pub archived_at: String,
    /// Set on the bookmark when the archive commits.
    pub favicon_path: Option<String>,
}

impl NewArchive {
    #[must_use]
    pub fn reading_time(&self) -> u32 {
        reading_time_minutes(self.word_count)
    }
}

/// Data for inserting an archive image. Position and primary flag come from list order.
#[derive(Debug, Clone)]
pub struct NewImage {
    pub original_url: String,
    pub local_path: String,
    pub file_name: String,
    pub file_size: i64,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub mime_type: String,
    pub alt_text: Option<String>,
    pub caption: Option<String>,
}

/// How the archive write landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveWrite {
    /// No archive existed for the bookmark.
    Created { archive_id: i64 },
    /// An existing archive (and its images) was replaced. `superseded_keys` are the
    /// storage keys the old rows referenced.
    Replaced {
        archive_id: i64,
        superseded_keys: Vec<String>,
    },
}

impl ArchiveWrite {
    #[must_use]
    pub const fn archive_id(&self) -> i64 {
        match self {
            Self::Created { archive_id } | Self::Replaced { archive_id, .. } => *archive_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive_with_text(text: Option<&str>) -> BookmarkArchive {
        BookmarkArchive {
            id: 1,
            bookmark_id: 1,
            content_html: None,
            content_text: text.map(str::to_string),
            snapshot_path: Some("archives/1/1/snapshot.html.gz".to_string()),
            title: None,
            description: None,
            author: None,
            published_date: None,
            modified_date: None,
            language: None,
            site_name: None,
            og_title: None,
            og_description: None,
            og_image_path: None,
            primary_image_path: Some("archives/1/1/images/img_001.png".to_string()),
            images_directory: None,
            image_count: 1,
            word_count: 0,
            reading_time: 1,
            metadata: Some(r#"{"title":"Hello","keywords":["a"]}"#.to_string()),
            archived_at: "2024-01-01T00:00:00Z".to_string(),
            created_at: "2024-01-01 00:00:00".to_string(),
            updated_at: "2024-01-01 00:00:00".to_string(),
        }
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            ArchiveStatus::Unarchived,
            ArchiveStatus::Pending,
            ArchiveStatus::Processing,
            ArchiveStatus::Completed,
            ArchiveStatus::Failed,
        ] {
            assert_eq!(ArchiveStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(ArchiveStatus::from_str("complete"), None);
    }

    #[test]
    fn test_excerpt_is_char_safe() {
        let archive = archive_with_text(Some("  héllo wörld  "));
        assert_eq!(archive.excerpt(5), "héllo...");
        assert_eq!(archive.excerpt(50), "héllo wörld");
        assert_eq!(archive_with_text(None).excerpt(10), "");
    }

    #[test]
    fn test_metadata_record_parses_stored_json() {
        let record = archive_with_text(None).metadata_record().unwrap();
        assert_eq!(record.title.as_deref(), Some("Hello"));
        assert_eq!(record.keywords, vec!["a"]);
    }

    #[test]
    fn test_stored_keys() {
        assert_eq!(
            archive_with_text(None).stored_keys(),
            vec![
                "archives/1/1/snapshot.html.gz",
                "archives/1/1/images/img_001.png"
            ]
        );
    }

    #[test]
    fn test_new_archive_reading_time() {
        let archive = NewArchive {
            word_count: 451,
            ..NewArchive::default()
        };
        assert_eq!(archive.reading_time(), 3);
        assert_eq!(NewArchive::default().reading_time(), 1);
    }
}
