//! Integration tests for database operations.

use bookmark_archiver::db::{
    delete_archive_for_bookmark, get_archive_for_bookmark, get_archive_images, get_archive_keys,
    get_bookmark, get_pending_bookmark_ids, get_user_bookmarks_by_ids, insert_bookmark,
    mark_pending, replace_archive, reset_stuck_processing, set_archive_status,
    try_mark_processing, url_hash, ArchiveStatus, ArchiveWrite, Database, NewArchive,
    NewBookmark, NewImage,
};
use tempfile::TempDir;

async fn setup_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.sqlite");
    let db = Database::new(&db_path)
        .await
        .expect("Failed to create database");
    (db, temp_dir)
}

async fn add_bookmark(db: &Database, user_id: i64, url: &str) -> i64 {
    insert_bookmark(
        db.pool(),
        &NewBookmark {
            user_id,
            url: url.to_string(),
            title: None,
        },
    )
    .await
    .expect("Failed to insert bookmark")
}

fn new_archive(prefix: &str, word_count: u32) -> NewArchive {
    NewArchive {
        content_html: Some("<p>hello</p>".to_string()),
        content_text: Some("hello".to_string()),
        snapshot_path: Some(format!("{prefix}/snapshot.html.gz")),
        title: Some("Hello".to_string()),
        primary_image_path: Some(format!("{prefix}/images/img_001.png")),
        images_directory: Some(format!("{prefix}/images")),
        word_count,
        metadata: Some(r#"{"title":"Hello"}"#.to_string()),
        archived_at: "2024-05-01T12:00:00+00:00".to_string(),
        favicon_path: Some(format!("{prefix}/favicon.ico")),
        ..NewArchive::default()
    }
}

fn new_image(prefix: &str, n: u32) -> NewImage {
    NewImage {
        original_url: format!("https://example.com/{n}.png"),
        local_path: format!("{prefix}/images/img_{n:03}.png"),
        file_name: format!("img_{n:03}.png"),
        file_size: 100,
        width: Some(10),
        height: Some(20),
        mime_type: "image/png".to_string(),
        alt_text: None,
        caption: None,
    }
}

#[tokio::test]
async fn test_insert_and_get_bookmark() {
    let (db, _temp_dir) = setup_db().await;

    let id = add_bookmark(&db, 7, "https://Example.com/post?id=1").await;
    let bookmark = get_bookmark(db.pool(), id)
        .await
        .expect("Failed to get bookmark")
        .expect("Bookmark not found");

    assert_eq!(bookmark.user_id, 7);
    assert_eq!(bookmark.domain.as_deref(), Some("example.com"));
    assert_eq!(bookmark.url_hash, url_hash("https://Example.com/post?id=1"));
    assert_eq!(bookmark.status(), ArchiveStatus::Unarchived);
    assert!(!bookmark.is_archived);
    assert!(get_bookmark(db.pool(), id + 100).await.unwrap().is_none());
}

#[tokio::test]
async fn test_same_url_twice_for_one_user_is_rejected() {
    let (db, _temp_dir) = setup_db().await;

    add_bookmark(&db, 1, "https://example.com/a").await;
    add_bookmark(&db, 2, "https://example.com/a").await;
    let duplicate = insert_bookmark(
        db.pool(),
        &NewBookmark {
            user_id: 1,
            url: "https://example.com/a".to_string(),
            title: None,
        },
    )
    .await;
    assert!(duplicate.is_err());
}

#[tokio::test]
async fn test_try_mark_processing_is_exclusive() {
    let (db, _temp_dir) = setup_db().await;
    let id = add_bookmark(&db, 1, "https://example.com/a").await;

    assert!(try_mark_processing(db.pool(), id).await.unwrap());
    assert!(!try_mark_processing(db.pool(), id).await.unwrap());

    set_archive_status(db.pool(), id, ArchiveStatus::Failed)
        .await
        .unwrap();
    assert!(try_mark_processing(db.pool(), id).await.unwrap());
}

#[tokio::test]
async fn test_user_bookmarks_filter_by_owner() {
    let (db, _temp_dir) = setup_db().await;
    let a = add_bookmark(&db, 1, "https://example.com/a").await;
    let b = add_bookmark(&db, 1, "https://example.com/b").await;
    let c = add_bookmark(&db, 2, "https://example.com/c").await;

    let owned = get_user_bookmarks_by_ids(db.pool(), 1, &[c, b, a, 999])
        .await
        .unwrap();
    let ids: Vec<i64> = owned.iter().map(|b| b.id).collect();
    assert_eq!(ids, vec![a, b]);

    assert!(get_user_bookmarks_by_ids(db.pool(), 1, &[])
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_pending_and_stuck_recovery() {
    let (db, _temp_dir) = setup_db().await;
    let a = add_bookmark(&db, 1, "https://example.com/a").await;
    let b = add_bookmark(&db, 1, "https://example.com/b").await;
    let c = add_bookmark(&db, 1, "https://example.com/c").await;

    assert_eq!(mark_pending(db.pool(), &[a, b]).await.unwrap(), 2);
    set_archive_status(db.pool(), c, ArchiveStatus::Processing)
        .await
        .unwrap();

    let reset = reset_stuck_processing(db.pool()).await.unwrap();
    assert_eq!(reset, vec![c]);

    let mut pending = get_pending_bookmark_ids(db.pool()).await.unwrap();
    pending.sort_unstable();
    assert_eq!(pending, vec![a, b, c]);
}

#[tokio::test]
async fn test_replace_archive_creates_then_replaces() {
    let (db, _temp_dir) = setup_db().await;
    let id = add_bookmark(&db, 3, "https://example.com/a").await;
    let prefix = format!("archives/3/{id}");

    let images = vec![new_image(&prefix, 1), new_image(&prefix, 3)];
    let write = replace_archive(db.pool(), id, &new_archive(&prefix, 451), &images)
        .await
        .unwrap();
    let ArchiveWrite::Created { archive_id } = write else {
        panic!("expected Created, got {write:?}");
    };

    let bookmark = get_bookmark(db.pool(), id).await.unwrap().unwrap();
    assert_eq!(bookmark.status(), ArchiveStatus::Completed);
    assert!(bookmark.is_archived);
    assert_eq!(
        bookmark.favicon_path.as_deref(),
        Some(format!("{prefix}/favicon.ico").as_str())
    );

    let archive = get_archive_for_bookmark(db.pool(), id).await.unwrap().unwrap();
    assert_eq!(archive.id, archive_id);
    assert_eq!(archive.image_count, 2);
    assert_eq!(archive.word_count, 451);
    assert_eq!(archive.reading_time, 3);

    let stored = get_archive_images(db.pool(), archive_id).await.unwrap();
    assert_eq!(stored.len(), 2);
    assert!(stored[0].is_primary);
    assert!(!stored[1].is_primary);
    assert_eq!(stored[0].position, 0);
    assert_eq!(stored[1].position, 1);
    assert_eq!(stored[1].file_name, "img_003.png");

    // Replacing reports every key the old rows referenced
    let write = replace_archive(
        db.pool(),
        id,
        &NewArchive {
            favicon_path: None,
            primary_image_path: None,
            ..new_archive(&prefix, 10)
        },
        &[],
    )
    .await
    .unwrap();
    let ArchiveWrite::Replaced {
        archive_id: new_id,
        superseded_keys,
    } = write
    else {
        panic!("expected Replaced");
    };
    assert_ne!(new_id, archive_id);
    assert_eq!(
        superseded_keys,
        vec![
            format!("{prefix}/favicon.ico"),
            format!("{prefix}/images/img_001.png"),
            format!("{prefix}/images/img_003.png"),
            format!("{prefix}/snapshot.html.gz"),
        ]
    );

    // Old images cascaded away
    assert!(get_archive_images(db.pool(), archive_id).await.unwrap().is_empty());
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM bookmark_archives WHERE bookmark_id = ?")
        .bind(id)
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(count, 1);

    let bookmark = get_bookmark(db.pool(), id).await.unwrap().unwrap();
    assert_eq!(bookmark.favicon_path, None);
}

#[tokio::test]
async fn test_replace_archive_for_missing_bookmark_rolls_back() {
    let (db, _temp_dir) = setup_db().await;

    let result = replace_archive(db.pool(), 404, &new_archive("archives/1/404", 1), &[]).await;
    assert!(result.is_err());

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM bookmark_archives")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn test_delete_archive_and_keys() {
    let (db, _temp_dir) = setup_db().await;
    let id = add_bookmark(&db, 1, "https://example.com/a").await;
    let prefix = format!("archives/1/{id}");

    replace_archive(
        db.pool(),
        id,
        &new_archive(&prefix, 5),
        &[new_image(&prefix, 1), new_image(&prefix, 2)],
    )
    .await
    .unwrap();

    let keys = get_archive_keys(db.pool(), id).await.unwrap();
    assert_eq!(
        keys,
        vec![
            format!("{prefix}/favicon.ico"),
            format!("{prefix}/images/img_001.png"),
            format!("{prefix}/images/img_002.png"),
            format!("{prefix}/snapshot.html.gz"),
        ]
    );

    assert!(delete_archive_for_bookmark(db.pool(), id).await.unwrap());
    assert!(!delete_archive_for_bookmark(db.pool(), id).await.unwrap());
    assert!(get_archive_for_bookmark(db.pool(), id).await.unwrap().is_none());
    assert!(get_archive_keys(db.pool(), id).await.unwrap().is_empty());

    let orphans: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM bookmark_images")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(orphans, 0);

    let bookmark = get_bookmark(db.pool(), id).await.unwrap().unwrap();
    assert!(!bookmark.is_archived);
}

#[tokio::test]
async fn test_deleting_bookmark_cascades() {
    let (db, _temp_dir) = setup_db().await;
    let id = add_bookmark(&db, 1, "https://example.com/a").await;
    let prefix = format!("archives/1/{id}");
    replace_archive(db.pool(), id, &new_archive(&prefix, 5), &[new_image(&prefix, 1)])
        .await
        .unwrap();

    sqlx::query("DELETE FROM bookmarks WHERE id = ?")
        .bind(id)
        .execute(db.pool())
        .await
        .unwrap();

    let archives: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM bookmark_archives")
        .fetch_one(db.pool())
        .await
        .unwrap();
    let images: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM bookmark_images")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!((archives, images), (0, 0));
}

#[tokio::test]
async fn test_status_check_constraint() {
    let (db, _temp_dir) = setup_db().await;
    let id = add_bookmark(&db, 1, "https://example.com/a").await;

    let result = sqlx::query("UPDATE bookmarks SET archive_status = 'done' WHERE id = ?")
        .bind(id)
        .execute(db.pool())
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_reopening_database_keeps_data() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("nested").join("test.sqlite");

    let id = {
        let db = Database::new(&db_path).await.unwrap();
        add_bookmark(&db, 1, "https://example.com/a").await
    };

    let db = Database::new(&db_path).await.unwrap();
    assert!(get_bookmark(db.pool(), id).await.unwrap().is_some());
}
