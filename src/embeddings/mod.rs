pub mod chunking;
pub mod hashing;
pub mod ollama;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{Config, EmbeddingProvider};
use crate::{EngineError, Result};

pub use chunking::{ChunkingConfig, ParagraphSplitter, SplitError, Splitter, TextChunk};
pub use hashing::HashingEmbedder;
pub use ollama::OllamaClient;

/// Maps texts to fixed-dimension vectors, one vector per input text, in order
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;

    /// Vector length the embedder is configured to produce, when known
    #[inline]
    fn expected_dimension(&self) -> Option<usize> {
        None
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Fail when the embedder cannot serve requests; local embedders always can
    #[inline]
    async fn ensure_ready(&self) -> Result<()> {
        Ok(())
    }
}

/// Build the embedder selected by `[embedding] provider`
#[inline]
pub fn build_embedder(config: &Config) -> Result<Arc<dyn Embedder>> {
    match config.embedding.provider {
        EmbeddingProvider::Ollama => {
            let client = OllamaClient::new(&config.ollama)
                .map_err(|e| EngineError::Config(format!("{e:#}")))?;
            Ok(Arc::new(client))
        }
        EmbeddingProvider::Hashing => Ok(Arc::new(HashingEmbedder::new(
            config.embedding.hashing_dimension as usize,
        ))),
    }
}

/// Embed `texts` and check that every vector has the same, non-zero length,
/// matching the embedder's configured dimension when it declares one
#[inline]
pub async fn embed_checked(embedder: &dyn Embedder, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let vectors = embedder.embed(texts).await?;

    if vectors.len() != texts.len() {
        return Err(EngineError::Embedding(format!(
            "{} returned {} vectors for {} texts",
            embedder.model_name(),
            vectors.len(),
            texts.len()
        )));
    }

    if let Some(first) = vectors.first() {
        let dimension = first.len();
        if dimension == 0 || vectors.iter().any(|v| v.len() != dimension) {
            return Err(EngineError::Embedding(format!(
                "{} returned vectors of inconsistent dimension",
                embedder.model_name()
            )));
        }

        if let Some(expected) = embedder.expected_dimension() {
            if dimension != expected {
                return Err(EngineError::Embedding(format!(
                    "{} returned {}-dimensional vectors, configured for {}",
                    embedder.model_name(),
                    dimension,
                    expected
                )));
            }
        }
    }

    Ok(vectors)
}
