
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{
    BackendError, LanceVectorStore, MemoryVectorStore, VectorBackend, VectorMatch, VectorPayload,
    VectorRecord,
};
use crate::config::{Config, VectorBackendKind, VectorStoreConfig};
use crate::{EngineError, Result};

/// Bounded exponential backoff for transient backend failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    #[inline]
    pub const fn new(attempts: u32, backoff_base: Duration) -> Self {
        Self {
            attempts: if attempts == 0 { 1 } else { attempts },
            backoff_base,
        }
    }

    #[inline]
    pub fn from_config(config: &VectorStoreConfig) -> Self {
        Self::new(
            config.retry_attempts,
            Duration::from_millis(config.backoff_base_ms),
        )
    }

    /// Delay after the given failed attempt (1-based)
    #[inline]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff_base * 2_u32.saturating_pow(attempt.saturating_sub(1))
    }
}

impl Default for RetryPolicy {
    #[inline]
    fn default() -> Self {
        Self::new(3, Duration::from_millis(200))
    }
}

/// The vector store as seen by the rest of the engine.
///
/// Transient backend failures are retried here; once retries run out the
/// caller gets `VectorStoreUnavailable`. Rejections surface immediately as
/// `VectorStore`.
#[derive(Clone)]
pub struct VectorStoreAdapter {
    backend: Arc<dyn VectorBackend>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for VectorStoreAdapter {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorStoreAdapter")
            .field("backend", &self.backend.name())
            .field("retry", &self.retry)
            .finish()
    }
}

impl VectorStoreAdapter {
    #[inline]
    pub fn new(backend: Arc<dyn VectorBackend>, retry: RetryPolicy) -> Self {
        Self { backend, retry }
    }

    /// Open the backend selected by `[vector_store] backend`
    #[inline]
    pub async fn open(config: &Config) -> Result<Self> {
        let retry = RetryPolicy::from_config(&config.vector_store);

        let backend: Arc<dyn VectorBackend> = match config.vector_store.backend {
            VectorBackendKind::Lancedb => Arc::new(
                LanceVectorStore::open(
                    config.vector_database_path(),
                    &config.vector_store.collection,
                )
                .await?,
            ),
            VectorBackendKind::Memory => Arc::new(MemoryVectorStore::new()),
        };

        info!(
            "Vector store ready: backend={}, collection={}",
            backend.name(),
            config.vector_store.collection
        );
        Ok(Self::new(backend, retry))
    }

    #[inline]
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    #[inline]
    pub const fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    #[inline]
    pub async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        self.with_retry("upsert", || self.backend.upsert(records))
            .await?;
        debug!("Upserted {} vectors", records.len());
        Ok(())
    }

    #[inline]
    pub async fn upsert_one(
        &self,
        chunk_id: &str,
        vector: Vec<f32>,
        payload: VectorPayload,
    ) -> Result<()> {
        let record = VectorRecord {
            chunk_id: chunk_id.to_string(),
            vector,
            payload,
        };
        self.upsert(std::slice::from_ref(&record)).await
    }

    /// Remove vectors by chunk id; ids that are not present are ignored
    #[inline]
    pub async fn delete(&self, chunk_ids: &[String]) -> Result<()> {
        if chunk_ids.is_empty() {
            return Ok(());
        }

        self.with_retry("delete", || self.backend.delete(chunk_ids))
            .await?;
        debug!("Deleted {} vectors", chunk_ids.len());
        Ok(())
    }

    #[inline]
    pub async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<VectorMatch>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        self.with_retry("query", || self.backend.query(vector, top_k))
            .await
    }

    #[inline]
    pub async fn count(&self) -> Result<u64> {
        self.with_retry("count", || self.backend.count()).await
    }

    #[inline]
    pub async fn list_ids(&self) -> Result<Vec<String>> {
        self.with_retry("list_ids", || self.backend.list_ids())
            .await
    }

    /// Compact the backend's storage
    #[inline]
    pub async fn optimize(&self) -> Result<()> {
        self.with_retry("optimize", || self.backend.optimize())
            .await?;
        info!("Vector store {} optimized", self.backend.name());
        Ok(())
    }

    async fn with_retry<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, BackendError>>,
    {
        let mut last_error = None;

        for attempt in 1..=self.retry.attempts {
            match call().await {
                Ok(value) => return Ok(value),
                Err(BackendError::Rejected(e)) => {
                    warn!("Vector store rejected {}: {:#}", operation, e);
                    return Err(EngineError::VectorStore(format!("{operation}: {e:#}")));
                }
                Err(BackendError::Transient(e)) => {
                    warn!(
                        "Vector store {} failed, attempt {}/{}: {:#}",
                        operation, attempt, self.retry.attempts, e
                    );
                    last_error = Some(e);

                    if attempt < self.retry.attempts {
                        let delay = self.retry.delay_for(attempt);
                        debug!("Waiting {:?} before retry", delay);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        error!(
            "Vector store {} failed after {} attempts",
            operation, self.retry.attempts
        );
        let detail = last_error.map_or_else(|| "no attempts made".to_string(), |e| format!("{e:#}"));
        Err(EngineError::VectorStoreUnavailable(format!(
            "{operation} failed after {} attempts: {detail}",
            self.retry.attempts
        )))
    }
}
