use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{PoisonError, RwLock};

use super::{
    BackendError, RankedMatch, VectorBackend, VectorMatch, VectorPayload, VectorRecord,
    rank_matches,
};

#[derive(Debug, Clone)]
struct StoredVector {
    vector: Vec<f32>,
    payload: VectorPayload,
    seq: i64,
}

/// Process-local vector backend scored by cosine similarity.
///
/// Used when `[vector_store] backend = "memory"` and throughout the tests.
/// Failures can be injected to exercise retry and rollback paths.
#[derive(Debug, Default)]
pub struct MemoryVectorStore {
    entries: RwLock<BTreeMap<String, StoredVector>>,
    next_seq: AtomicI64,
    pending_failures: AtomicU32,
    unavailable: AtomicBool,
}

impl MemoryVectorStore {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls fail with a transient error
    #[inline]
    pub fn inject_failures(&self, count: u32) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// While set, every call fails with a transient error
    #[inline]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    #[inline]
    pub fn payload(&self, chunk_id: &str) -> Option<VectorPayload> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(chunk_id).map(|stored| stored.payload.clone())
    }

    fn check_available(&self) -> Result<(), BackendError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::transient("memory vector store is offline"));
        }

        let injected = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(BackendError::transient("injected failure"));
        }

        Ok(())
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[async_trait]
impl VectorBackend for MemoryVectorStore {
    #[inline]
    fn name(&self) -> &str {
        "memory"
    }

    #[inline]
    async fn upsert(&self, records: &[VectorRecord]) -> Result<(), BackendError> {
        self.check_available()?;

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        let expected = entries
            .values()
            .next()
            .map(|stored| stored.vector.len())
            .or_else(|| records.first().map(|r| r.vector.len()));
        if let Some(dimension) = expected {
            if let Some(bad) = records.iter().find(|r| r.vector.len() != dimension) {
                return Err(BackendError::rejected(format!(
                    "vector for {} has dimension {}, collection uses {}",
                    bad.chunk_id,
                    bad.vector.len(),
                    dimension
                )));
            }
        }

        for record in records {
            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            entries.insert(
                record.chunk_id.clone(),
                StoredVector {
                    vector: record.vector.clone(),
                    payload: record.payload.clone(),
                    seq,
                },
            );
        }

        Ok(())
    }

    #[inline]
    async fn delete(&self, chunk_ids: &[String]) -> Result<(), BackendError> {
        self.check_available()?;

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        for chunk_id in chunk_ids {
            entries.remove(chunk_id);
        }
        Ok(())
    }

    #[inline]
    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<VectorMatch>, BackendError> {
        self.check_available()?;

        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut matches = Vec::with_capacity(entries.len());
        for (chunk_id, stored) in entries.iter() {
            if stored.vector.len() != vector.len() {
                return Err(BackendError::rejected(format!(
                    "query dimension {} does not match collection dimension {}",
                    vector.len(),
                    stored.vector.len()
                )));
            }
            matches.push(RankedMatch {
                chunk_id: chunk_id.clone(),
                score: cosine_similarity(vector, &stored.vector),
                seq: stored.seq,
            });
        }

        Ok(rank_matches(matches, top_k))
    }

    #[inline]
    async fn count(&self) -> Result<u64, BackendError> {
        self.check_available()?;
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.len() as u64)
    }

    #[inline]
    async fn list_ids(&self) -> Result<Vec<String>, BackendError> {
        self.check_available()?;
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.keys().cloned().collect())
    }

    #[inline]
    async fn optimize(&self) -> Result<(), BackendError> {
        self.check_available()
    }
}
