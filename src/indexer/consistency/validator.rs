use chrono::{Duration, NaiveDateTime, Utc};
use std::collections::HashSet;
use tracing::{debug, error, info, warn};

use super::ConsistencyManager;
use crate::database::sqlite::models::FileStatus;
use crate::database::vector::{VectorPayload, VectorRecord};
use crate::embeddings::{Embedder, embed_checked};
use crate::indexer::locks::FileLocks;
use crate::{EngineError, Result};

const DEFAULT_STALE_AFTER_MINUTES: i64 = 10;
const REPAIR_EMBED_BATCH: usize = 64;

/// Consistency check results between the relational store and the vector store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistencyReport {
    /// Chunks owned by indexed files
    pub relational_chunks: usize,
    /// Vectors in the vector store
    pub vector_count: usize,
    /// Chunk ids of indexed files with no vector
    pub missing_in_vector_store: Vec<String>,
    /// Vector ids with no chunk row at all
    pub orphaned_vectors: Vec<String>,
    /// Indexed files with missing vectors or broken chunk positions
    pub inconsistent_files: Vec<FileConsistencyIssue>,
    /// Files stuck in `pending` longer than the stale threshold
    pub stale_pending_files: Vec<String>,
    pub is_consistent: bool,
}

/// Consistency issue for a specific file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileConsistencyIssue {
    pub file_id: String,
    pub name: String,
    pub chunk_count: usize,
    pub missing_vectors: Vec<String>,
    /// Whether chunk positions are exactly `0..chunk_count`
    pub positions_contiguous: bool,
}

/// What [`ConsistencyValidator::repair`] changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairSummary {
    pub orphans_removed: usize,
    pub vectors_restored: usize,
    pub stale_files_removed: usize,
}

impl RepairSummary {
    #[inline]
    pub const fn is_noop(&self) -> bool {
        self.orphans_removed == 0 && self.vectors_restored == 0 && self.stale_files_removed == 0
    }
}

/// Compares both stores and fixes what can be fixed with the cascade primitives.
///
/// Repairs touching a file hold that file's lock from `locks`, the same
/// table ingestion and deletion use.
pub struct ConsistencyValidator<'a> {
    manager: &'a ConsistencyManager,
    embedder: &'a dyn Embedder,
    locks: &'a FileLocks,
    stale_after: Duration,
}

impl<'a> ConsistencyValidator<'a> {
    #[inline]
    pub fn new(
        manager: &'a ConsistencyManager,
        embedder: &'a dyn Embedder,
        locks: &'a FileLocks,
    ) -> Self {
        Self {
            manager,
            embedder,
            locks,
            stale_after: Duration::minutes(DEFAULT_STALE_AFTER_MINUTES),
        }
    }

    /// Age after which a `pending` file counts as an abandoned ingestion
    #[inline]
    #[must_use]
    pub const fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Perform a full consistency check between the two stores
    #[inline]
    pub async fn validate(&self) -> Result<ConsistencyReport> {
        info!("Starting cross-store consistency validation");
        let database = self.manager.database();

        let vector_ids: HashSet<String> = self
            .manager
            .vectors()
            .list_ids()
            .await?
            .into_iter()
            .collect();
        debug!("Found {} vectors", vector_ids.len());

        let refs = database.list_chunk_refs().await?;
        let relational_ids: HashSet<&str> = refs.iter().map(|r| r.chunk_id.as_str()).collect();

        let mut orphaned_vectors: Vec<String> = vector_ids
            .iter()
            .filter(|id| !relational_ids.contains(id.as_str()))
            .cloned()
            .collect();
        orphaned_vectors.sort();

        let mut relational_chunks = 0;
        let mut missing_in_vector_store = Vec::new();
        let mut inconsistent_files = Vec::new();

        for file in database.list_files_with_status(FileStatus::Indexed).await? {
            let chunks = database.get_chunks_of_file(&file.file_id).await?;
            relational_chunks += chunks.len();

            let missing_vectors: Vec<String> = chunks
                .iter()
                .filter(|c| !vector_ids.contains(&c.chunk_id))
                .map(|c| c.chunk_id.clone())
                .collect();

            // Chunks arrive ordered by position, so contiguity is a direct comparison
            let positions_contiguous = chunks
                .iter()
                .enumerate()
                .all(|(expected, c)| c.chunk_index == expected as i64);

            if !missing_vectors.is_empty() || !positions_contiguous {
                missing_in_vector_store.extend(missing_vectors.iter().cloned());
                inconsistent_files.push(FileConsistencyIssue {
                    file_id: file.file_id,
                    name: file.name,
                    chunk_count: chunks.len(),
                    missing_vectors,
                    positions_contiguous,
                });
            }
        }

        let cutoff = self.stale_cutoff();
        let stale_pending_files: Vec<String> = database
            .list_files_with_status(FileStatus::Pending)
            .await?
            .into_iter()
            .filter(|file| file.updated_at <= cutoff)
            .map(|file| file.file_id)
            .collect();

        let is_consistent = missing_in_vector_store.is_empty()
            && orphaned_vectors.is_empty()
            && inconsistent_files.is_empty()
            && stale_pending_files.is_empty();

        let report = ConsistencyReport {
            relational_chunks,
            vector_count: vector_ids.len(),
            missing_in_vector_store,
            orphaned_vectors,
            inconsistent_files,
            stale_pending_files,
            is_consistent,
        };

        if report.is_consistent {
            info!("Consistency validation passed");
        } else {
            warn!("Consistency validation found issues");
            log_consistency_issues(&report);
        }

        Ok(report)
    }

    fn stale_cutoff(&self) -> NaiveDateTime {
        Utc::now().naive_utc() - self.stale_after
    }

    /// Validate, then remove orphaned vectors, drop stale pending files and
    /// re-embed chunks whose vectors are missing. Running it twice in a row
    /// makes no further changes the second time.
    ///
    /// Every file is re-read under its lock before it is changed, so work
    /// reported by the validation pass is skipped when a concurrent ingestion
    /// or deletion already changed that file.
    #[inline]
    pub async fn repair(&self) -> Result<RepairSummary> {
        let report = self.validate().await?;
        let mut summary = RepairSummary::default();

        // Chunk ids are never reused, so a vector without a row stays orphaned
        if !report.orphaned_vectors.is_empty() {
            self.manager
                .vectors()
                .delete(&report.orphaned_vectors)
                .await?;
            summary.orphans_removed = report.orphaned_vectors.len();
            info!("Removed {} orphaned vectors", summary.orphans_removed);
        }

        for file_id in &report.stale_pending_files {
            if self.remove_stale_file(file_id).await? {
                summary.stale_files_removed += 1;
            }
        }

        for issue in &report.inconsistent_files {
            if !issue.missing_vectors.is_empty() {
                summary.vectors_restored += self
                    .restore_vectors(&issue.file_id, &issue.missing_vectors)
                    .await?;
            }
        }

        info!(
            "Repair finished: {} orphans removed, {} vectors restored, {} stale files removed",
            summary.orphans_removed, summary.vectors_restored, summary.stale_files_removed
        );
        Ok(summary)
    }

    async fn remove_stale_file(&self, file_id: &str) -> Result<bool> {
        let _lock = self.locks.acquire(file_id).await;

        let still_stale = self
            .manager
            .database()
            .get_file(file_id)
            .await?
            .is_some_and(|file| {
                file.status == FileStatus::Pending && file.updated_at <= self.stale_cutoff()
            });
        if !still_stale {
            debug!("{} changed since validation, leaving it", file_id);
            return Ok(false);
        }

        match self.manager.delete_file(file_id).await {
            Ok(removed) => {
                debug!(
                    "Removed stale pending file {} with {} chunks",
                    file_id,
                    removed.chunk_ids.len()
                );
                Ok(true)
            }
            Err(EngineError::NotFound(_)) => Ok(false),
            Err(e) => {
                error!("Failed to remove stale pending file {}: {}", file_id, e);
                Err(e)
            }
        }
    }

    /// Re-embed the given chunks of one file, skipping rows that no longer exist
    async fn restore_vectors(&self, file_id: &str, chunk_ids: &[String]) -> Result<usize> {
        let _lock = self.locks.acquire(file_id).await;

        let chunks = self.manager.database().get_chunks(chunk_ids, false).await?;
        if chunks.len() < chunk_ids.len() {
            debug!(
                "{} of {} chunks of {} are gone, restoring the rest",
                chunk_ids.len() - chunks.len(),
                chunk_ids.len(),
                file_id
            );
        }
        if chunks.is_empty() {
            return Ok(0);
        }

        info!("Regenerating {} vectors of {}", chunks.len(), file_id);
        let mut restored = 0;
        for batch in chunks.chunks(REPAIR_EMBED_BATCH) {
            let texts: Vec<String> = batch.iter().map(|c| c.payload.text.clone()).collect();
            let vectors = embed_checked(self.embedder, &texts).await?;

            let records: Vec<VectorRecord> = batch
                .iter()
                .zip(vectors)
                .map(|(chunk, vector)| VectorRecord {
                    chunk_id: chunk.chunk_id.clone(),
                    vector,
                    payload: VectorPayload {
                        file_id: chunk.file_id.clone(),
                        chunk_index: u32::try_from(chunk.chunk_index).unwrap_or(u32::MAX),
                        text: chunk.payload.text.clone(),
                    },
                })
                .collect();

            self.manager.vectors().upsert(&records).await?;
            restored += records.len();
        }

        Ok(restored)
    }
}

fn log_consistency_issues(report: &ConsistencyReport) {
    if !report.missing_in_vector_store.is_empty() {
        warn!(
            "Found {} chunks missing from the vector store",
            report.missing_in_vector_store.len()
        );
    }

    if !report.orphaned_vectors.is_empty() {
        warn!("Found {} orphaned vectors", report.orphaned_vectors.len());
    }

    for issue in &report.inconsistent_files {
        warn!(
            "File {} ({}) has consistency issues: {} chunks, {} without vectors, positions contiguous: {}",
            issue.name,
            issue.file_id,
            issue.chunk_count,
            issue.missing_vectors.len(),
            issue.positions_contiguous
        );
    }

    if !report.stale_pending_files.is_empty() {
        warn!(
            "Found {} files stuck in pending",
            report.stale_pending_files.len()
        );
    }
}

impl ConsistencyReport {
    /// Get a human-readable summary of the consistency report
    #[inline]
    pub fn summary(&self) -> String {
        if self.is_consistent {
            format!(
                "Stores are consistent: {} chunks, {} vectors",
                self.relational_chunks, self.vector_count
            )
        } else {
            format!(
                "Inconsistencies found: {} missing vectors, {} orphaned vectors, {} files with issues, {} stale pending files",
                self.missing_in_vector_store.len(),
                self.orphaned_vectors.len(),
                self.inconsistent_files.len(),
                self.stale_pending_files.len()
            )
        }
    }

    /// Get the total number of consistency issues
    #[inline]
    pub fn total_issues(&self) -> usize {
        let broken_positions = self
            .inconsistent_files
            .iter()
            .filter(|f| !f.positions_contiguous)
            .count();
        self.missing_in_vector_store.len()
            + self.orphaned_vectors.len()
            + self.stale_pending_files.len()
            + broken_positions
    }
}
