// Consistency module
// Keeps the relational store and the vector store in agreement on replace, delete and rollback

#[cfg(test)]
mod tests;

pub mod validator;

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::database::sqlite::Database;
use crate::database::sqlite::models::FileRecord;
use crate::database::vector::VectorStoreAdapter;
use crate::{EngineError, Result};

pub use validator::{ConsistencyReport, ConsistencyValidator, FileConsistencyIssue, RepairSummary};

/// What a cascade delete removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedFile {
    pub file: FileRecord,
    pub chunk_ids: Vec<String>,
}

/// Drives every cross-store deletion.
///
/// Vectors are always removed before the relational rows that point at
/// them. The two deletes are not atomic; a crash between them leaves
/// relational rows whose vectors are gone until the next cascade or repair.
#[derive(Debug, Clone)]
pub struct ConsistencyManager {
    database: Database,
    vectors: VectorStoreAdapter,
    files_dir: PathBuf,
}

impl ConsistencyManager {
    #[inline]
    pub fn new(database: Database, vectors: VectorStoreAdapter, files_dir: PathBuf) -> Self {
        Self {
            database,
            vectors,
            files_dir,
        }
    }

    #[inline]
    pub const fn database(&self) -> &Database {
        &self.database
    }

    #[inline]
    pub const fn vectors(&self) -> &VectorStoreAdapter {
        &self.vectors
    }

    #[inline]
    pub fn files_dir(&self) -> &Path {
        &self.files_dir
    }

    /// Remove the live version of `file_id`, if any, before it is rewritten
    #[inline]
    pub async fn clear_prior_version(&self, file_id: &str) -> Result<Option<RemovedFile>> {
        let Some(file) = self.database.get_file(file_id).await? else {
            return Ok(None);
        };

        info!(
            "Replacing prior version of {} ({}, status {})",
            file.name, file_id, file.status
        );
        self.cascade(file).await.map(Some)
    }

    /// Remove `file_id` from both stores and drop its on-disk artifact.
    ///
    /// Unknown ids are `NotFound` and change nothing.
    #[inline]
    pub async fn delete_file(&self, file_id: &str) -> Result<RemovedFile> {
        let file = self
            .database
            .get_file(file_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("file {file_id}")))?;

        self.cascade(file).await
    }

    /// Undo a failed ingestion attempt: its vectors, its rows and its artifact.
    ///
    /// Relational rows are removed even when the vector store cannot be
    /// reached, so no file is left advertising chunks without vectors.
    #[inline]
    pub async fn rollback(
        &self,
        file_id: &str,
        chunk_ids: &[String],
        artifact: Option<&Path>,
    ) -> Result<()> {
        warn!(
            "Rolling back ingestion of {} ({} chunks)",
            file_id,
            chunk_ids.len()
        );

        if let Err(e) = self.vectors.delete(chunk_ids).await {
            warn!(
                "Could not remove vectors of {} during rollback, leaving them for repair: {}",
                file_id, e
            );
        }

        let deleted = self.database.delete_chunks_of_file(file_id).await?;
        debug!(
            "Rollback removed {} chunk rows and {} file rows for {}",
            deleted.chunk_ids.len(),
            deleted.files_removed,
            file_id
        );

        if let Some(path) = artifact {
            remove_artifact(path).await;
        }
        Ok(())
    }

    async fn cascade(&self, file: FileRecord) -> Result<RemovedFile> {
        let mut chunk_ids: Vec<String> = self
            .database
            .get_chunks_of_file(&file.file_id)
            .await?
            .into_iter()
            .map(|chunk| chunk.chunk_id)
            .collect();

        self.vectors.delete(&chunk_ids).await?;

        let deleted = self.database.delete_chunks_of_file(&file.file_id).await?;

        // Rows written between the two reads still need their vectors gone
        let late: Vec<String> = deleted
            .chunk_ids
            .into_iter()
            .filter(|id| !chunk_ids.contains(id))
            .collect();
        if !late.is_empty() {
            self.vectors.delete(&late).await?;
            chunk_ids.extend(late);
        }

        if let Some(path) = file.path.as_deref() {
            remove_artifact(Path::new(path)).await;
        }

        info!(
            "Removed {} ({}) with {} chunks",
            file.name,
            file.file_id,
            chunk_ids.len()
        );
        Ok(RemovedFile { file, chunk_ids })
    }
}

pub(crate) async fn remove_artifact(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed artifact {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove artifact {}: {}", path.display(), e),
    }
}
