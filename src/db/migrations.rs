use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::debug;

/// Run all pending migrations.
pub async fn run(pool: &SqlitePool) -> Result<()> {
    create_migration_table(pool).await?;
    let current_version = get_schema_version(pool).await?;

    if current_version < 1 {
        debug!("Running migration v1");
        run_migration_v1(pool).await?;
        set_schema_version(pool, 1).await?;
    }

    Ok(())
}

async fn create_migration_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS _schema_version (
            version INTEGER PRIMARY KEY
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create schema version table")?;

    Ok(())
}

async fn get_schema_version(pool: &SqlitePool) -> Result<i32> {
    let row: Option<(i32,)> = sqlx::query_as("SELECT version FROM _schema_version LIMIT 1")
        .fetch_optional(pool)
        .await
        .context("Failed to get schema version")?;

    Ok(row.map_or(0, |(v,)| v))
}

async fn set_schema_version(pool: &SqlitePool, version: i32) -> Result<()> {
    sqlx::query("DELETE FROM _schema_version")
        .execute(pool)
        .await?;
    sqlx::query("INSERT INTO _schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

async fn run_migration_v1(pool: &SqlitePool) -> Result<()> {
    debug!("Running migration v1: creating bookmark archive schema");

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS bookmarks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            url TEXT NOT NULL,
            url_hash TEXT NOT NULL,
            domain TEXT,
            title TEXT,
            favicon_path TEXT,
            is_archived INTEGER NOT NULL DEFAULT 0,
            archive_status TEXT NOT NULL DEFAULT 'none'
                CHECK (archive_status IN ('none', 'pending', 'processing', 'completed', 'failed')),
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (user_id, url_hash)
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create bookmarks table")?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_bookmarks_status ON bookmarks(archive_status)",
    )
    .execute(pool)
    .await?;

    // One archive per bookmark; replacing an archive means deleting the old row.
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS bookmark_archives (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            bookmark_id INTEGER NOT NULL UNIQUE REFERENCES bookmarks(id) ON DELETE CASCADE,
            content_html TEXT,
            content_text TEXT,
            snapshot_path TEXT,
            title TEXT,
            description TEXT,
            author TEXT,
            published_date TEXT,
            modified_date TEXT,
            language TEXT,
            site_name TEXT,
            og_title TEXT,
            og_description TEXT,
            og_image_path TEXT,
            primary_image_path TEXT,
            images_directory TEXT,
            image_count INTEGER NOT NULL DEFAULT 0,
            word_count INTEGER NOT NULL DEFAULT 0,
            reading_time INTEGER NOT NULL DEFAULT 1,
            metadata TEXT,
            archived_at TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create bookmark_archives table")?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS bookmark_images (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            archive_id INTEGER NOT NULL REFERENCES bookmark_archives(id) ON DELETE CASCADE,
            original_url TEXT NOT NULL,
            local_path TEXT NOT NULL,
            file_name TEXT NOT NULL,
            file_size INTEGER NOT NULL,
            width INTEGER,
            height INTEGER,
            mime_type TEXT NOT NULL,
            alt_text TEXT,
            caption TEXT,
            is_primary INTEGER NOT NULL DEFAULT 0,
            position INTEGER NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create bookmark_images table")?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_bookmark_images_archive ON bookmark_images(archive_id, position)",
    )
    .execute(pool)
    .await?;

    // At most one primary image per archive.
    sqlx::query(
        r"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_bookmark_images_primary
        ON bookmark_images(archive_id) WHERE is_primary = 1
        ",
    )
    .execute(pool)
    .await?;

    Ok(())
}
