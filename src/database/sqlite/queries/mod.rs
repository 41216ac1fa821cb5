
use std::collections::HashMap;

use super::models::*;
use anyhow::{Context, Result};
use chrono::{NaiveDateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use tracing::{debug, warn};

const FILE_COLUMNS: &str =
    "file_id, name, size, media_type, content_hash, path, status, created_at, updated_at";
const CHUNK_COLUMNS: &str =
    "chunk_id, file_id, chunk_index, content_hash, payload, created_at, updated_at";

// SQLite's default limit on bound parameters is 999 on older builds
const MAX_BOUND_IDS: usize = 500;

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

fn escape_like(fragment: &str) -> String {
    let mut escaped = String::with_capacity(fragment.len());
    for c in fragment.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

pub struct FileQueries;

impl FileQueries {
    /// Insert or replace a file row, keeping the existing `created_at`
    #[inline]
    pub async fn upsert(
        conn: &mut SqliteConnection,
        file: &NewFile,
        status: FileStatus,
    ) -> Result<()> {
        let now = now();
        let created_at = file.created_at.unwrap_or(now);

        sqlx::query(
            r#"
            INSERT INTO files (file_id, name, size, media_type, content_hash, path, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(file_id) DO UPDATE SET
                name = excluded.name,
                size = excluded.size,
                media_type = excluded.media_type,
                content_hash = excluded.content_hash,
                path = excluded.path,
                status = excluded.status,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&file.file_id)
        .bind(&file.name)
        .bind(file.size)
        .bind(&file.media_type)
        .bind(&file.content_hash)
        .bind(&file.path)
        .bind(status)
        .bind(created_at)
        .bind(now)
        .execute(&mut *conn)
        .await
        .with_context(|| format!("Failed to write file {}", file.file_id))?;

        debug!("Wrote file {} ({})", file.file_id, status);
        Ok(())
    }

    #[inline]
    pub async fn get(pool: &SqlitePool, file_id: &str) -> Result<Option<FileRecord>> {
        let query = format!("SELECT {FILE_COLUMNS} FROM files WHERE file_id = ?");
        sqlx::query_as::<_, FileRecord>(&query)
            .bind(file_id)
            .fetch_optional(pool)
            .await
            .context("Failed to get file by id")
    }

    /// Indexed files, most recent upload first
    #[inline]
    pub async fn list_indexed(pool: &SqlitePool, page: Page) -> Result<Vec<FileRecord>> {
        let query = format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE status = 'indexed'
             ORDER BY updated_at DESC, file_id ASC LIMIT ? OFFSET ?"
        );
        sqlx::query_as::<_, FileRecord>(&query)
            .bind(i64::from(page.limit))
            .bind(i64::from(page.offset))
            .fetch_all(pool)
            .await
            .context("Failed to list files")
    }

    #[inline]
    pub async fn list_by_status(pool: &SqlitePool, status: FileStatus) -> Result<Vec<FileRecord>> {
        let query = format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE status = ? ORDER BY updated_at ASC, file_id ASC"
        );
        sqlx::query_as::<_, FileRecord>(&query)
            .bind(status)
            .fetch_all(pool)
            .await
            .context("Failed to list files by status")
    }

    #[inline]
    pub async fn mark_indexed(pool: &SqlitePool, file_id: &str) -> Result<bool> {
        let result =
            sqlx::query("UPDATE files SET status = 'indexed', updated_at = ? WHERE file_id = ?")
                .bind(now())
                .bind(file_id)
                .execute(pool)
                .await
                .context("Failed to mark file indexed")?;

        Ok(result.rows_affected() > 0)
    }

    #[inline]
    pub async fn count(pool: &SqlitePool) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM files")
            .fetch_one(pool)
            .await
            .context("Failed to count files")?;
        row.try_get("count").context("Failed to decode file count")
    }
}

pub struct ChunkQueries;

impl ChunkQueries {
    fn from_row(row: &SqliteRow) -> Result<ChunkRecord> {
        let chunk_id: String = row.try_get("chunk_id")?;
        let payload: String = row.try_get("payload")?;
        let payload: ChunkPayload = serde_json::from_str(&payload)
            .with_context(|| format!("Failed to decode payload of chunk {chunk_id}"))?;

        Ok(ChunkRecord {
            file_id: row.try_get("file_id")?,
            chunk_index: row.try_get("chunk_index")?,
            content_hash: row.try_get("content_hash")?,
            payload,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            chunk_id,
        })
    }

    /// Write chunks on an open connection or transaction.
    ///
    /// With `upsert` an existing row with the same id is replaced (keeping its
    /// `created_at`); without it existing rows are left untouched.
    #[inline]
    pub async fn put(conn: &mut SqliteConnection, chunks: &[NewChunk], upsert: bool) -> Result<u64> {
        let sql = if upsert {
            r#"
            INSERT INTO chunks (chunk_id, file_id, chunk_index, content_hash, payload, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET
                file_id = excluded.file_id,
                chunk_index = excluded.chunk_index,
                content_hash = excluded.content_hash,
                payload = excluded.payload,
                updated_at = excluded.updated_at
            "#
        } else {
            r#"
            INSERT INTO chunks (chunk_id, file_id, chunk_index, content_hash, payload, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(chunk_id) DO NOTHING
            "#
        };

        let now = now();
        let mut written = 0;
        for chunk in chunks {
            let payload = serde_json::to_string(&chunk.payload)
                .with_context(|| format!("Failed to encode payload of chunk {}", chunk.chunk_id))?;

            written += sqlx::query(sql)
                .bind(&chunk.chunk_id)
                .bind(&chunk.file_id)
                .bind(chunk.chunk_index)
                .bind(&chunk.content_hash)
                .bind(payload)
                .bind(now)
                .bind(now)
                .execute(&mut *conn)
                .await
                .with_context(|| format!("Failed to write chunk {}", chunk.chunk_id))?
                .rows_affected();
        }

        Ok(written)
    }

    /// All-or-nothing batch write
    #[inline]
    pub async fn put_batch(pool: &SqlitePool, chunks: &[NewChunk], upsert: bool) -> Result<u64> {
        if chunks.is_empty() {
            return Ok(0);
        }

        let mut transaction = pool
            .begin()
            .await
            .context("Failed to begin transaction for chunk write")?;
        let written = Self::put(&mut transaction, chunks, upsert).await?;
        transaction
            .commit()
            .await
            .context("Failed to commit chunk write transaction")?;

        debug!("Wrote {} of {} chunks", written, chunks.len());
        Ok(written)
    }

    #[inline]
    pub async fn get(pool: &SqlitePool, chunk_id: &str) -> Result<Option<ChunkRecord>> {
        let query = format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE chunk_id = ?");
        let row = sqlx::query(&query)
            .bind(chunk_id)
            .fetch_optional(pool)
            .await
            .context("Failed to get chunk by id")?;

        row.as_ref().map(Self::from_row).transpose()
    }

    /// Fetch chunks by id, in input order, skipping ids that do not exist
    #[inline]
    pub async fn get_many(pool: &SqlitePool, chunk_ids: &[String]) -> Result<Vec<ChunkRecord>> {
        let mut found: HashMap<String, ChunkRecord> = HashMap::with_capacity(chunk_ids.len());

        for batch in chunk_ids.chunks(MAX_BOUND_IDS) {
            let mut builder: QueryBuilder<'_, Sqlite> =
                QueryBuilder::new(format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE chunk_id IN ("));
            let mut separated = builder.separated(", ");
            for id in batch {
                separated.push_bind(id);
            }
            separated.push_unseparated(")");

            let rows = builder
                .build()
                .fetch_all(pool)
                .await
                .context("Failed to get chunks by id")?;
            for row in &rows {
                let chunk = Self::from_row(row)?;
                found.insert(chunk.chunk_id.clone(), chunk);
            }
        }

        Ok(chunk_ids.iter().filter_map(|id| found.remove(id)).collect())
    }

    #[inline]
    pub async fn list_by_file(pool: &SqlitePool, file_id: &str) -> Result<Vec<ChunkRecord>> {
        let query = format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE file_id = ? ORDER BY chunk_index ASC, chunk_id ASC"
        );
        let rows = sqlx::query(&query)
            .bind(file_id)
            .fetch_all(pool)
            .await
            .context("Failed to list chunks of file")?;

        rows.iter().map(Self::from_row).collect()
    }

    #[inline]
    pub async fn ids_by_file(conn: &mut SqliteConnection, file_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT chunk_id FROM chunks WHERE file_id = ? ORDER BY chunk_index")
            .bind(file_id)
            .fetch_all(&mut *conn)
            .await
            .context("Failed to list chunk ids of file")?;

        rows.iter()
            .map(|row| row.try_get("chunk_id").context("Failed to decode chunk id"))
            .collect()
    }

    /// Every chunk id with its file's id and status
    #[inline]
    pub async fn list_refs(pool: &SqlitePool) -> Result<Vec<ChunkRef>> {
        sqlx::query_as::<_, ChunkRef>(
            r#"
            SELECT c.chunk_id, c.file_id, COALESCE(f.status, 'pending') AS status
            FROM chunks c LEFT JOIN files f ON f.file_id = c.file_id
            ORDER BY c.file_id, c.chunk_index
            "#,
        )
        .fetch_all(pool)
        .await
        .context("Failed to list chunk references")
    }

    /// Delete a file row and all of its chunks in one transaction
    #[inline]
    pub async fn delete_by_file(pool: &SqlitePool, file_id: &str) -> Result<DeletedChunks> {
        let mut transaction = pool
            .begin()
            .await
            .context("Failed to begin transaction for file delete")?;

        let chunk_ids = Self::ids_by_file(&mut transaction, file_id).await?;

        sqlx::query("DELETE FROM chunks WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *transaction)
            .await
            .context("Failed to delete chunks of file")?;

        let files_removed = sqlx::query("DELETE FROM files WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *transaction)
            .await
            .context("Failed to delete file row")?
            .rows_affected();

        transaction
            .commit()
            .await
            .context("Failed to commit file delete transaction")?;

        debug!(
            "Deleted {} chunks and {} file row(s) for {}",
            chunk_ids.len(),
            files_removed,
            file_id
        );
        Ok(DeletedChunks {
            chunk_ids,
            files_removed,
        })
    }

    /// First chunk whose id matches `pattern` under LIKE, oldest first
    #[inline]
    pub async fn find_like(pool: &SqlitePool, pattern: &str) -> Result<Option<ChunkRecord>> {
        let query = format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE chunk_id LIKE ? ESCAPE '\\'
             ORDER BY created_at ASC, chunk_id ASC LIMIT 1"
        );
        let row = sqlx::query(&query)
            .bind(pattern)
            .fetch_optional(pool)
            .await
            .context("Failed to search chunks by id")?;

        row.as_ref().map(Self::from_row).transpose()
    }

    #[inline]
    pub async fn find_by_prefix(pool: &SqlitePool, prefix: &str) -> Result<Option<ChunkRecord>> {
        Self::find_like(pool, &format!("{}%", escape_like(prefix))).await
    }

    #[inline]
    pub async fn find_containing(pool: &SqlitePool, fragment: &str) -> Result<Option<ChunkRecord>> {
        Self::find_like(pool, &format!("%{}%", escape_like(fragment))).await
    }

    #[inline]
    pub async fn count(pool: &SqlitePool) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM chunks")
            .fetch_one(pool)
            .await
            .context("Failed to count chunks")?;
        row.try_get("count").context("Failed to decode chunk count")
    }
}

pub struct IndexStructQueries;

impl IndexStructQueries {
    fn from_row(row: &SqliteRow) -> Result<IndexStruct> {
        let index_id: String = row.try_get("index_id")?;
        let kind: String = row.try_get("kind")?;
        let raw: String = row.try_get("data")?;

        let data = IndexStructData::decode(&kind, &raw).unwrap_or_else(|(fallback, err)| {
            warn!(
                "Index struct {} of kind {:?} could not be decoded, using placeholder: {}",
                index_id, kind, err
            );
            fallback
        });

        Ok(IndexStruct {
            summary: row.try_get("summary")?,
            index_id,
            data,
        })
    }

    #[inline]
    pub async fn upsert(pool: &SqlitePool, index: &IndexStruct) -> Result<()> {
        let data = index
            .data
            .encode()
            .with_context(|| format!("Failed to encode index struct {}", index.index_id))?;

        sqlx::query(
            r#"
            INSERT INTO index_structs (index_id, kind, data, summary, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(index_id) DO UPDATE SET
                kind = excluded.kind,
                data = excluded.data,
                summary = excluded.summary,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&index.index_id)
        .bind(index.data.kind())
        .bind(data)
        .bind(&index.summary)
        .bind(now())
        .execute(pool)
        .await
        .with_context(|| format!("Failed to write index struct {}", index.index_id))?;

        debug!(
            "Wrote index struct {} ({})",
            index.index_id,
            index.data.kind()
        );
        Ok(())
    }

    #[inline]
    pub async fn get(pool: &SqlitePool, index_id: &str) -> Result<Option<IndexStruct>> {
        let row = sqlx::query("SELECT index_id, kind, data, summary FROM index_structs WHERE index_id = ?")
            .bind(index_id)
            .fetch_optional(pool)
            .await
            .context("Failed to get index struct")?;

        row.as_ref().map(Self::from_row).transpose()
    }

    #[inline]
    pub async fn list(pool: &SqlitePool) -> Result<Vec<IndexStruct>> {
        let rows = sqlx::query("SELECT index_id, kind, data, summary FROM index_structs ORDER BY index_id")
            .fetch_all(pool)
            .await
            .context("Failed to list index structs")?;

        rows.iter().map(Self::from_row).collect()
    }

    #[inline]
    pub async fn delete(pool: &SqlitePool, index_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM index_structs WHERE index_id = ?")
            .bind(index_id)
            .execute(pool)
            .await
            .context("Failed to delete index struct")?;

        Ok(result.rows_affected() > 0)
    }
}
