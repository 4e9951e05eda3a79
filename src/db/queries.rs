use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use super::models::{
    ArchiveStatus, ArchiveWrite, Bookmark, BookmarkArchive, BookmarkImage, NewArchive,
    NewBookmark, NewImage,
};
use crate::url_utils::host_of;

// ========== Bookmarks ==========

/// Hex SHA-256 of a bookmark URL, used for per-user uniqueness.
#[must_use]
pub fn url_hash(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

/// Insert a new bookmark and return its ID.
pub async fn insert_bookmark(pool: &SqlitePool, bookmark: &NewBookmark) -> Result<i64> {
    let result = sqlx::query(
        r"
        INSERT INTO bookmarks (user_id, url, url_hash, domain, title)
        VALUES (?, ?, ?, ?, ?)
        ",
    )
    .bind(bookmark.user_id)
    .bind(&bookmark.url)
    .bind(url_hash(&bookmark.url))
    .bind(host_of(&bookmark.url))
    .bind(&bookmark.title)
    .execute(pool)
    .await
    .context("Failed to insert bookmark")?;

    Ok(result.last_insert_rowid())
}

/// Get a bookmark by ID.
pub async fn get_bookmark(pool: &SqlitePool, id: i64) -> Result<Option<Bookmark>> {
    sqlx::query_as("SELECT * FROM bookmarks WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch bookmark")
}

/// The bookmarks among `ids` that belong to `user_id`, in ID order.
pub async fn get_user_bookmarks_by_ids(
    pool: &SqlitePool,
    user_id: i64,
    ids: &[i64],
) -> Result<Vec<Bookmark>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    sqlx::query_as(
        r"
        SELECT * FROM bookmarks
        WHERE user_id = ?
          AND id IN (SELECT value FROM json_each(?))
        ORDER BY id
        ",
    )
    .bind(user_id)
    .bind(serde_json::to_string(ids)?)
    .fetch_all(pool)
    .await
    .context("Failed to fetch user bookmarks")
}

/// Set a bookmark's archive status.
pub async fn set_archive_status(pool: &SqlitePool, id: i64, status: ArchiveStatus) -> Result<()> {
    sqlx::query(
        "UPDATE bookmarks SET archive_status = ?, updated_at = datetime('now') WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(id)
    .execute(pool)
    .await
    .context("Failed to set archive status")?;

    Ok(())
}

/// Move a bookmark to `processing` unless it is already there.
///
/// Returns `false` when another attempt holds the bookmark.
pub async fn try_mark_processing(pool: &SqlitePool, id: i64) -> Result<bool> {
    let result = sqlx::query(
        r"
        UPDATE bookmarks
        SET archive_status = 'processing', updated_at = datetime('now')
        WHERE id = ? AND archive_status != 'processing'
        ",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("Failed to mark bookmark processing")?;

    Ok(result.rows_affected() > 0)
}

/// Mark many bookmarks `pending`, returning how many rows changed.
pub async fn mark_pending(pool: &SqlitePool, ids: &[i64]) -> Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }

    let result = sqlx::query(
        r"
        UPDATE bookmarks
        SET archive_status = 'pending', updated_at = datetime('now')
        WHERE id IN (SELECT value FROM json_each(?))
        ",
    )
    .bind(serde_json::to_string(ids)?)
    .execute(pool)
    .await
    .context("Failed to mark bookmarks pending")?;

    Ok(result.rows_affected())
}

/// Reset bookmarks stuck in `processing` (e.g. after a crash) back to `pending`.
///
/// Returns the IDs that were reset.
pub async fn reset_stuck_processing(pool: &SqlitePool) -> Result<Vec<i64>> {
    sqlx::query_scalar(
        r"
        UPDATE bookmarks
        SET archive_status = 'pending', updated_at = datetime('now')
        WHERE archive_status = 'processing'
        RETURNING id
        ",
    )
    .fetch_all(pool)
    .await
    .context("Failed to reset stuck processing bookmarks")
}

/// IDs of bookmarks waiting to be archived, oldest first.
pub async fn get_pending_bookmark_ids(pool: &SqlitePool) -> Result<Vec<i64>> {
    sqlx::query_scalar(
        "SELECT id FROM bookmarks WHERE archive_status = 'pending' ORDER BY updated_at, id",
    )
    .fetch_all(pool)
    .await
    .context("Failed to fetch pending bookmarks")
}

// ========== Archives ==========

/// Get the archive for a bookmark.
pub async fn get_archive_for_bookmark(
    pool: &SqlitePool,
    bookmark_id: i64,
) -> Result<Option<BookmarkArchive>> {
    sqlx::query_as("SELECT * FROM bookmark_archives WHERE bookmark_id = ?")
        .bind(bookmark_id)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch archive")
}

/// Get an archive's images in download order.
pub async fn get_archive_images(pool: &SqlitePool, archive_id: i64) -> Result<Vec<BookmarkImage>> {
    sqlx::query_as("SELECT * FROM bookmark_images WHERE archive_id = ? ORDER BY position")
        .bind(archive_id)
        .fetch_all(pool)
        .await
        .context("Failed to fetch archive images")
}

/// Every storage key the bookmark's current archive rows reference.
pub async fn get_archive_keys(pool: &SqlitePool, bookmark_id: i64) -> Result<Vec<String>> {
    let mut keys = Vec::new();

    if let Some(archive) = get_archive_for_bookmark(pool, bookmark_id).await? {
        keys.extend(archive.stored_keys());
        keys.extend(
            get_archive_images(pool, archive.id)
                .await?
                .into_iter()
                .map(|image| image.local_path),
        );
    }

    let favicon: Option<Option<String>> =
        sqlx::query_scalar("SELECT favicon_path FROM bookmarks WHERE id = ?")
            .bind(bookmark_id)
            .fetch_optional(pool)
            .await
            .context("Failed to fetch bookmark favicon")?;
    keys.extend(favicon.flatten());

    keys.sort();
    keys.dedup();
    Ok(keys)
}

/// Write the bookmark's archive and images and mark the bookmark completed, atomically.
///
/// Any previous archive for the bookmark is deleted in the same transaction (its images
/// cascade), so readers see either the old archive or the new one.
pub async fn replace_archive(
    pool: &SqlitePool,
    bookmark_id: i64,
    archive: &NewArchive,
    images: &[NewImage],
) -> Result<ArchiveWrite> {
    let mut tx = pool
        .begin()
        .await
        .context("Failed to begin archive transaction")?;

    let previous: Option<BookmarkArchive> =
        sqlx::query_as("SELECT * FROM bookmark_archives WHERE bookmark_id = ?")
            .bind(bookmark_id)
            .fetch_optional(&mut *tx)
            .await
            .context("Failed to fetch previous archive")?;

    let superseded_keys = if let Some(previous) = &previous {
        let mut keys = previous.stored_keys();
        let image_paths: Vec<String> =
            sqlx::query_scalar("SELECT local_path FROM bookmark_images WHERE archive_id = ?")
                .bind(previous.id)
                .fetch_all(&mut *tx)
                .await
                .context("Failed to fetch previous images")?;
        keys.extend(image_paths);

        let favicon: Option<String> =
            sqlx::query_scalar("SELECT favicon_path FROM bookmarks WHERE id = ?")
                .bind(bookmark_id)
                .fetch_one(&mut *tx)
                .await
                .context("Failed to fetch previous favicon")?;
        keys.extend(favicon);

        // Images cascade from the archive row
        sqlx::query("DELETE FROM bookmark_archives WHERE id = ?")
            .bind(previous.id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete previous archive")?;

        keys.sort();
        keys.dedup();
        Some(keys)
    } else {
        None
    };

    let archive_id = sqlx::query(
        r"
        INSERT INTO bookmark_archives (
            bookmark_id, content_html, content_text, snapshot_path,
            title, description, author, published_date, modified_date, language, site_name,
            og_title, og_description, og_image_path, primary_image_path, images_directory,
            image_count, word_count, reading_time, metadata, archived_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ",
    )
    .bind(bookmark_id)
    .bind(&archive.content_html)
    .bind(&archive.content_text)
    .bind(&archive.snapshot_path)
    .bind(&archive.title)
    .bind(&archive.description)
    .bind(&archive.author)
    .bind(&archive.published_date)
    .bind(&archive.modified_date)
    .bind(&archive.language)
    .bind(&archive.site_name)
    .bind(&archive.og_title)
    .bind(&archive.og_description)
    .bind(&archive.og_image_path)
    .bind(&archive.primary_image_path)
    .bind(&archive.images_directory)
    .bind(i64::try_from(images.len()).unwrap_or(i64::MAX))
    .bind(i64::from(archive.word_count))
    .bind(i64::from(archive.reading_time()))
    .bind(&archive.metadata)
    .bind(&archive.archived_at)
    .execute(&mut *tx)
    .await
    .context("Failed to insert archive")?
    .last_insert_rowid();

    for (position, image) in images.iter().enumerate() {
        sqlx::query(
            r"
            INSERT INTO bookmark_images (
                archive_id, original_url, local_path, file_name, file_size, width, height,
                mime_type, alt_text, caption, is_primary, position
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(archive_id)
        .bind(&image.original_url)
        .bind(&image.local_path)
        .bind(&image.file_name)
        .bind(image.file_size)
        .bind(image.width)
        .bind(image.height)
        .bind(&image.mime_type)
        .bind(&image.alt_text)
        .bind(&image.caption)
        .bind(position == 0)
        .bind(i64::try_from(position).unwrap_or(i64::MAX))
        .execute(&mut *tx)
        .await
        .context("Failed to insert archive image")?;
    }

    let updated = sqlx::query(
        r"
        UPDATE bookmarks
        SET archive_status = 'completed',
            is_archived = 1,
            favicon_path = ?,
            updated_at = datetime('now')
        WHERE id = ?
        ",
    )
    .bind(&archive.favicon_path)
    .bind(bookmark_id)
    .execute(&mut *tx)
    .await
    .context("Failed to mark bookmark completed")?;

    if updated.rows_affected() == 0 {
        anyhow::bail!("Bookmark {bookmark_id} disappeared before its archive was committed");
    }

    tx.commit().await.context("Failed to commit archive")?;

    Ok(match superseded_keys {
        Some(superseded_keys) => ArchiveWrite::Replaced {
            archive_id,
            superseded_keys,
        },
        None => ArchiveWrite::Created { archive_id },
    })
}

/// Delete a bookmark's archive (images cascade) and clear its archived flag.
///
/// Returns whether an archive existed.
pub async fn delete_archive_for_bookmark(pool: &SqlitePool, bookmark_id: i64) -> Result<bool> {
    let mut tx = pool
        .begin()
        .await
        .context("Failed to begin delete transaction")?;

    let deleted = sqlx::query("DELETE FROM bookmark_archives WHERE bookmark_id = ?")
        .bind(bookmark_id)
        .execute(&mut *tx)
        .await
        .context("Failed to delete archive")?;

    sqlx::query(
        r"
        UPDATE bookmarks
        SET is_archived = 0, favicon_path = NULL, updated_at = datetime('now')
        WHERE id = ?
        ",
    )
    .bind(bookmark_id)
    .execute(&mut *tx)
    .await
    .context("Failed to clear archived flag")?;

    tx.commit().await.context("Failed to commit delete")?;

    Ok(deleted.rows_affected() > 0)
}
