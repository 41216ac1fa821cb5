// API module
// Request/response shapes of the engine's external operations

#[cfg(test)]
mod tests;

use chrono::NaiveDateTime;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::database::sqlite::models::{ChunkRecord, FileRecord, Page};
use crate::identity::{CHUNK_INDEX_KEY, FILE_ID_KEY};
use crate::indexer::{Indexer, RetrievedChunk};
use crate::{EngineError, Result};

/// One file handed to [`upload`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub name: String,
    pub content: Vec<u8>,
}

impl UploadFile {
    #[inline]
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// Per-file outcome of an upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum UploadResult {
    Success {
        filename: String,
        chunks: usize,
        file_id: String,
    },
    Error {
        filename: String,
        message: String,
    },
}

impl UploadResult {
    #[inline]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    #[inline]
    pub fn filename(&self) -> &str {
        match self {
            Self::Success { filename, .. } | Self::Error { filename, .. } => filename,
        }
    }
}

/// File-level listing entry; `upload_date` is the time of the latest upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSummary {
    pub id: String,
    pub name: String,
    pub size: i64,
    #[serde(rename = "type")]
    pub media_type: String,
    pub upload_date: NaiveDateTime,
}

impl From<FileRecord> for FileSummary {
    #[inline]
    fn from(file: FileRecord) -> Self {
        Self {
            id: file.file_id,
            name: file.name,
            size: file.size,
            media_type: file.media_type,
            upload_date: file.updated_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeleteResult {
    Deleted,
    NotFound,
}

/// A chunk as returned by lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkView {
    pub id: String,
    pub text: String,
    pub metadata: Map<String, Value>,
}

impl From<ChunkRecord> for ChunkView {
    #[inline]
    fn from(chunk: ChunkRecord) -> Self {
        // Rows written before positions were stamped into the payload lack these keys
        let mut metadata = chunk.payload.metadata;
        metadata
            .entry(FILE_ID_KEY)
            .or_insert_with(|| Value::from(chunk.file_id));
        metadata
            .entry(CHUNK_INDEX_KEY)
            .or_insert_with(|| Value::from(chunk.chunk_index));
        Self {
            id: chunk.chunk_id,
            text: chunk.payload.text,
            metadata,
        }
    }
}

/// A similarity search hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub file_id: String,
    pub chunk_index: i64,
    pub score: f32,
    pub text: String,
}

impl From<RetrievedChunk> for SearchHit {
    #[inline]
    fn from(hit: RetrievedChunk) -> Self {
        Self {
            id: hit.chunk.chunk_id,
            file_id: hit.chunk.file_id,
            chunk_index: hit.chunk.chunk_index,
            score: hit.score,
            text: hit.chunk.payload.text,
        }
    }
}

/// Ingest every file concurrently; one result per file, in input order.
///
/// A failing file becomes an `error` entry and never affects its siblings.
/// Re-uploading an existing name replaces the previous version.
#[inline]
pub async fn upload(indexer: &Indexer, files: Vec<UploadFile>) -> Vec<UploadResult> {
    let uploads = files.into_iter().map(|file| async move {
        match indexer.ingest(&file.name, &file.content).await {
            Ok(outcome) => {
                debug!(
                    "Uploaded {} as {} with {} chunks",
                    file.name,
                    outcome.file_id,
                    outcome.chunk_count()
                );
                UploadResult::Success {
                    filename: file.name,
                    chunks: outcome.chunk_count(),
                    file_id: outcome.file_id,
                }
            }
            Err(e) => {
                warn!("Upload of {} failed: {}", file.name, e);
                UploadResult::Error {
                    filename: file.name,
                    message: e.to_string(),
                }
            }
        }
    });

    join_all(uploads).await
}

/// Indexed files, most recent upload first.
///
/// Store failures are returned as errors, never as an empty list.
#[inline]
pub async fn list(indexer: &Indexer, page: Page) -> Result<Vec<FileSummary>> {
    let files = indexer.list_files(page).await?;
    Ok(files.into_iter().map(FileSummary::from).collect())
}

#[inline]
pub async fn delete(indexer: &Indexer, file_id: &str) -> Result<DeleteResult> {
    match indexer.delete_file(file_id).await {
        Ok(_) => Ok(DeleteResult::Deleted),
        Err(EngineError::NotFound(_)) => Ok(DeleteResult::NotFound),
        Err(e) => Err(e),
    }
}

/// Exact id, or the first prefix/substring match for truncated ids
#[inline]
pub async fn lookup_chunk(indexer: &Indexer, chunk_id: &str) -> Result<Option<ChunkView>> {
    match indexer.lookup_chunk(chunk_id).await {
        Ok(chunk) => Ok(Some(ChunkView::from(chunk))),
        Err(EngineError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

#[inline]
pub async fn search(indexer: &Indexer, query: &str, top_k: usize) -> Result<Vec<SearchHit>> {
    let hits = indexer.retrieve(query, top_k).await?;
    Ok(hits.into_iter().map(SearchHit::from).collect())
}
