use super::*;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tempfile::TempDir;

async fn create_test_pool() -> Result<(TempDir, SqlitePool)> {
    let temp_dir = TempDir::new()?;
    let options = SqliteConnectOptions::new()
        .filename(temp_dir.path().join("schema.db"))
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(2)
        .connect_with(options)
        .await?;
    Ok((temp_dir, pool))
}

#[tokio::test]
async fn init_creates_all_tables() -> Result<()> {
    let (_temp_dir, pool) = create_test_pool().await?;

    init_schema(&pool).await?;

    let files = table_columns(&pool, "files").await?;
    for column in [
        "file_id",
        "name",
        "size",
        "media_type",
        "content_hash",
        "path",
        "status",
        "created_at",
        "updated_at",
    ] {
        assert!(files.iter().any(|c| c == column), "files.{column} missing");
    }

    let chunks = table_columns(&pool, "chunks").await?;
    assert!(chunks.iter().any(|c| c == "content_hash"));
    assert!(chunks.iter().any(|c| c == "chunk_index"));

    let index_structs = table_columns(&pool, "index_structs").await?;
    assert!(index_structs.iter().any(|c| c == "summary"));

    assert_eq!(user_version(&pool).await?, SCHEMA_VERSION);
    Ok(())
}

#[tokio::test]
async fn init_is_idempotent() -> Result<()> {
    let (_temp_dir, pool) = create_test_pool().await?;

    init_schema(&pool).await?;
    let before = table_columns(&pool, "files").await?;
    init_schema(&pool).await?;
    init_schema(&pool).await?;

    assert_eq!(table_columns(&pool, "files").await?, before);
    assert_eq!(user_version(&pool).await?, SCHEMA_VERSION);
    Ok(())
}

#[tokio::test]
async fn upgrades_legacy_database_in_place() -> Result<()> {
    let (_temp_dir, pool) = create_test_pool().await?;

    // version 1 layout, before status/path/content_hash/summary existed
    for statement in BASE_TABLES {
        sqlx::query(statement).execute(&pool).await?;
    }
    sqlx::query(
        "INSERT INTO files (file_id, name, size, media_type, content_hash, created_at, updated_at)
         VALUES ('file_legacy', 'old.txt', 3, 'text/plain', 'abc', '2023-01-01 00:00:00', '2023-01-01 00:00:00')",
    )
    .execute(&pool)
    .await?;
    sqlx::query(
        "INSERT INTO chunks (chunk_id, file_id, chunk_index, payload, created_at, updated_at)
         VALUES ('legacy-chunk', 'file_legacy', 0, '{\"text\":\"old\"}', '2023-01-01 00:00:00', '2023-01-01 00:00:00')",
    )
    .execute(&pool)
    .await?;
    assert_eq!(user_version(&pool).await?, 0);

    init_schema(&pool).await?;

    let row = sqlx::query("SELECT status, path FROM files WHERE file_id = 'file_legacy'")
        .fetch_one(&pool)
        .await?;
    assert_eq!(row.try_get::<String, _>("status")?, "indexed");
    assert_eq!(row.try_get::<Option<String>, _>("path")?, None);

    let row = sqlx::query("SELECT payload, content_hash FROM chunks WHERE chunk_id = 'legacy-chunk'")
        .fetch_one(&pool)
        .await?;
    assert_eq!(row.try_get::<String, _>("payload")?, r#"{"text":"old"}"#);
    assert_eq!(row.try_get::<Option<String>, _>("content_hash")?, None);

    assert_eq!(user_version(&pool).await?, SCHEMA_VERSION);
    Ok(())
}

#[tokio::test]
async fn newer_schema_version_is_left_alone() -> Result<()> {
    let (_temp_dir, pool) = create_test_pool().await?;

    init_schema(&pool).await?;
    sqlx::query("ALTER TABLE files ADD COLUMN added_by_future TEXT")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA user_version = 9").execute(&pool).await?;

    init_schema(&pool).await?;

    assert_eq!(user_version(&pool).await?, 9);
    assert!(
        table_columns(&pool, "files")
            .await?
            .iter()
            .any(|c| c == "added_by_future")
    );
    Ok(())
}
