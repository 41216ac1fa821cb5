// Vector store module
// Embeddings keyed by chunk id, behind a backend trait with a retrying adapter in front

pub mod adapter;
pub mod lance;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;

pub use adapter::{RetryPolicy, VectorStoreAdapter};
pub use lance::LanceVectorStore;
pub use memory::MemoryVectorStore;

/// Embedding of one chunk, stored under the chunk's id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub payload: VectorPayload,
}

/// Data stored alongside a vector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorPayload {
    pub file_id: String,
    pub chunk_index: u32,
    pub text: String,
}

/// One similarity hit; higher `score` is more similar
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    pub chunk_id: String,
    pub score: f32,
}

#[derive(Error, Debug)]
pub enum BackendError {
    /// Connection or I/O trouble; worth retrying
    #[error("transient: {0:#}")]
    Transient(anyhow::Error),

    /// The backend refused the request; retrying will not help
    #[error("rejected: {0:#}")]
    Rejected(anyhow::Error),
}

impl BackendError {
    #[inline]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(anyhow::anyhow!(message.into()))
    }

    #[inline]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected(anyhow::anyhow!(message.into()))
    }

    #[inline]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// A vector collection keyed by chunk id.
///
/// `upsert` and `delete` are idempotent: re-upserting an id replaces its
/// vector, and deleting an absent id is a no-op.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn upsert(&self, records: &[VectorRecord]) -> Result<(), BackendError>;

    async fn delete(&self, chunk_ids: &[String]) -> Result<(), BackendError>;

    /// At most `top_k` matches, ranked by [`rank_matches`] order
    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<VectorMatch>, BackendError>;

    async fn count(&self) -> Result<u64, BackendError>;

    async fn list_ids(&self) -> Result<Vec<String>, BackendError>;

    /// Compact storage; backends with nothing to compact keep this no-op
    #[inline]
    async fn optimize(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// A match together with the insertion sequence of its vector
#[derive(Debug, Clone)]
pub struct RankedMatch {
    pub chunk_id: String,
    pub score: f32,
    pub seq: i64,
}

/// Sort by score descending, then most recently inserted, then chunk id, and keep `top_k`
#[inline]
pub fn rank_matches(mut matches: Vec<RankedMatch>, top_k: usize) -> Vec<VectorMatch> {
    matches.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.seq.cmp(&a.seq))
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });

    matches
        .into_iter()
        .take(top_k)
        .map(|m| VectorMatch {
            chunk_id: m.chunk_id,
            score: m.score,
        })
        .collect()
}
