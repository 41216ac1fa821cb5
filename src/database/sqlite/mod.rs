use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

use crate::database::sqlite::models::{
    ChunkRecord, ChunkRef, DeletedChunks, FileRecord, FileStatus, IndexStruct, NewChunk, NewFile,
    Page,
};
use crate::database::sqlite::queries::{ChunkQueries, FileQueries, IndexStructQueries};
use crate::{EngineError, Result};


pub mod models;
pub mod queries;
pub mod schema;

pub type DbPool = Pool<Sqlite>;

pub const DATABASE_FILE_NAME: &str = "metadata.db";

fn store_error(err: anyhow::Error) -> EngineError {
    EngineError::Store(format!("{err:#}"))
}

/// Relational store: files, chunks and index structs in SQLite
#[derive(Debug, Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    #[inline]
    pub async fn new<P: AsRef<Path>>(database_path: P) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .foreign_keys(true);

        Self::with_options(options).await
    }

    /// Open with explicit connection options and bring the schema up to date
    #[inline]
    pub async fn with_options(options: SqliteConnectOptions) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .map_err(|e| EngineError::Store(format!("Failed to open database: {e}")))?;

        let database = Self { pool };
        database.init_schema().await?;

        Ok(database)
    }

    /// Open `metadata.db` under the storage root, creating the root if needed
    #[inline]
    pub async fn open_in(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        Self::new(root.join(DATABASE_FILE_NAME)).await
    }

    #[inline]
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    #[inline]
    pub async fn init_schema(&self) -> Result<()> {
        schema::init_schema(&self.pool)
            .await
            .map_err(|e| EngineError::Schema(format!("{e:#}")))
    }

    // Chunk operations
    #[inline]
    pub async fn put_chunks(&self, chunks: &[NewChunk], upsert: bool) -> Result<u64> {
        ChunkQueries::put_batch(&self.pool, chunks, upsert)
            .await
            .map_err(store_error)
    }

    #[inline]
    pub async fn get_chunk(&self, chunk_id: &str) -> Result<ChunkRecord> {
        ChunkQueries::get(&self.pool, chunk_id)
            .await
            .map_err(store_error)?
            .ok_or_else(|| EngineError::NotFound(format!("chunk {chunk_id}")))
    }

    /// Fetch chunks in input order. Missing ids are skipped, or with `strict`
    /// the first missing id is reported as `NotFound`.
    #[inline]
    pub async fn get_chunks(&self, chunk_ids: &[String], strict: bool) -> Result<Vec<ChunkRecord>> {
        let chunks = ChunkQueries::get_many(&self.pool, chunk_ids)
            .await
            .map_err(store_error)?;

        if strict && chunks.len() < chunk_ids.len() {
            let present: HashSet<&str> = chunks.iter().map(|c| c.chunk_id.as_str()).collect();
            if let Some(missing) = chunk_ids.iter().find(|id| !present.contains(id.as_str())) {
                return Err(EngineError::NotFound(format!("chunk {missing}")));
            }
        }

        Ok(chunks)
    }

    #[inline]
    pub async fn get_chunks_of_file(&self, file_id: &str) -> Result<Vec<ChunkRecord>> {
        ChunkQueries::list_by_file(&self.pool, file_id)
            .await
            .map_err(store_error)
    }

    /// Remove a file's chunks and its file row, returning the removed chunk ids
    #[inline]
    pub async fn delete_chunks_of_file(&self, file_id: &str) -> Result<DeletedChunks> {
        ChunkQueries::delete_by_file(&self.pool, file_id)
            .await
            .map_err(store_error)
    }

    #[inline]
    pub async fn list_chunk_refs(&self) -> Result<Vec<ChunkRef>> {
        ChunkQueries::list_refs(&self.pool).await.map_err(store_error)
    }

    /// Exact id first, then id prefix, then id substring; oldest match wins
    #[inline]
    pub async fn lookup_chunk(&self, fragment: &str) -> Result<ChunkRecord> {
        let fragment = fragment.trim();
        if fragment.is_empty() {
            return Err(EngineError::NotFound("empty chunk id".to_string()));
        }

        if let Some(chunk) = ChunkQueries::get(&self.pool, fragment)
            .await
            .map_err(store_error)?
        {
            return Ok(chunk);
        }

        if let Some(chunk) = ChunkQueries::find_by_prefix(&self.pool, fragment)
            .await
            .map_err(store_error)?
        {
            debug!("Chunk {} resolved by prefix to {}", fragment, chunk.chunk_id);
            return Ok(chunk);
        }

        if let Some(chunk) = ChunkQueries::find_containing(&self.pool, fragment)
            .await
            .map_err(store_error)?
        {
            debug!("Chunk {} resolved by substring to {}", fragment, chunk.chunk_id);
            return Ok(chunk);
        }

        Err(EngineError::NotFound(format!("chunk {fragment}")))
    }

    #[inline]
    pub async fn count_chunks(&self) -> Result<i64> {
        ChunkQueries::count(&self.pool).await.map_err(store_error)
    }

    // File operations
    #[inline]
    pub async fn put_file(&self, file: &NewFile, status: FileStatus) -> Result<()> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| EngineError::Store(format!("Failed to acquire connection: {e}")))?;
        FileQueries::upsert(&mut conn, file, status)
            .await
            .map_err(store_error)
    }

    /// Write a `pending` file row together with its chunks in one transaction
    #[inline]
    pub async fn stage_file(&self, file: &NewFile, chunks: &[NewChunk]) -> Result<()> {
        let staged = async {
            let mut transaction = self.pool.begin().await?;
            FileQueries::upsert(&mut transaction, file, FileStatus::Pending).await?;
            ChunkQueries::put(&mut transaction, chunks, true).await?;
            transaction.commit().await?;
            anyhow::Ok(())
        };
        staged.await.map_err(store_error)?;

        debug!(
            "Staged file {} with {} chunks",
            file.file_id,
            chunks.len()
        );
        Ok(())
    }

    #[inline]
    pub async fn mark_file_indexed(&self, file_id: &str) -> Result<()> {
        let updated = FileQueries::mark_indexed(&self.pool, file_id)
            .await
            .map_err(store_error)?;
        if updated {
            Ok(())
        } else {
            Err(EngineError::NotFound(format!("file {file_id}")))
        }
    }

    #[inline]
    pub async fn get_file(&self, file_id: &str) -> Result<Option<FileRecord>> {
        FileQueries::get(&self.pool, file_id)
            .await
            .map_err(store_error)
    }

    /// Indexed files, most recent upload first
    #[inline]
    pub async fn list_files(&self, page: Page) -> Result<Vec<FileRecord>> {
        FileQueries::list_indexed(&self.pool, page)
            .await
            .map_err(store_error)
    }

    #[inline]
    pub async fn list_files_with_status(&self, status: FileStatus) -> Result<Vec<FileRecord>> {
        FileQueries::list_by_status(&self.pool, status)
            .await
            .map_err(store_error)
    }

    #[inline]
    pub async fn count_files(&self) -> Result<i64> {
        FileQueries::count(&self.pool).await.map_err(store_error)
    }

    // Index struct operations
    #[inline]
    pub async fn put_index_struct(&self, index: &IndexStruct) -> Result<()> {
        IndexStructQueries::upsert(&self.pool, index)
            .await
            .map_err(store_error)
    }

    #[inline]
    pub async fn get_index_struct(&self, index_id: &str) -> Result<IndexStruct> {
        IndexStructQueries::get(&self.pool, index_id)
            .await
            .map_err(store_error)?
            .ok_or_else(|| EngineError::NotFound(format!("index struct {index_id}")))
    }

    #[inline]
    pub async fn list_index_structs(&self) -> Result<Vec<IndexStruct>> {
        IndexStructQueries::list(&self.pool)
            .await
            .map_err(store_error)
    }

    #[inline]
    pub async fn delete_index_struct(&self, index_id: &str) -> Result<()> {
        let deleted = IndexStructQueries::delete(&self.pool, index_id)
            .await
            .map_err(store_error)?;
        if deleted {
            Ok(())
        } else {
            Err(EngineError::NotFound(format!("index struct {index_id}")))
        }
    }

    /// Optimize database performance by running VACUUM and ANALYZE
    #[inline]
    pub async fn optimize(&self) -> Result<()> {
        info!("Optimizing database performance");

        for statement in ["VACUUM", "ANALYZE"] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| EngineError::Store(format!("Failed to run {statement}: {e}")))?;
        }

        debug!("Database optimization completed");
        Ok(())
    }
}
