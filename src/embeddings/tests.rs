use super::*;

struct FixedEmbedder {
    vectors: Vec<Vec<f32>>,
}

#[async_trait]
impl Embedder for FixedEmbedder {
    fn model_name(&self) -> &str {
        "fixed"
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(self.vectors.clone())
    }
}

#[tokio::test]
async fn embed_checked_rejects_count_mismatch() {
    let embedder = FixedEmbedder {
        vectors: vec![vec![1.0, 0.0]],
    };
    let texts = vec!["a".to_string(), "b".to_string()];

    let result = embed_checked(&embedder, &texts).await;
    assert!(matches!(result, Err(EngineError::Embedding(_))));
}

#[tokio::test]
async fn embed_checked_rejects_ragged_vectors() {
    let embedder = FixedEmbedder {
        vectors: vec![vec![1.0, 0.0], vec![1.0]],
    };
    let texts = vec!["a".to_string(), "b".to_string()];

    let result = embed_checked(&embedder, &texts).await;
    assert!(matches!(result, Err(EngineError::Embedding(_))));
}

#[tokio::test]
async fn embed_checked_passes_matching_output() {
    let embedder = HashingEmbedder::new(8);
    let texts = vec!["a".to_string(), "b".to_string()];

    let vectors = embed_checked(&embedder, &texts)
        .await
        .expect("should embed");
    assert_eq!(vectors.len(), 2);
    assert!(vectors.iter().all(|v| v.len() == 8));
}

struct DeclaredEmbedder {
    dimension: usize,
    vectors: Vec<Vec<f32>>,
}

#[async_trait]
impl Embedder for DeclaredEmbedder {
    fn model_name(&self) -> &str {
        "declared"
    }

    fn expected_dimension(&self) -> Option<usize> {
        Some(self.dimension)
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(self.vectors.clone())
    }
}

#[tokio::test]
async fn embed_checked_enforces_declared_dimension() {
    let texts = vec!["a".to_string()];

    let wrong = DeclaredEmbedder {
        dimension: 4,
        vectors: vec![vec![1.0, 0.0, 0.0]],
    };
    let Err(EngineError::Embedding(message)) = embed_checked(&wrong, &texts).await else {
        panic!("mismatched dimension should be an embedding error");
    };
    assert!(message.contains("configured for 4"));

    let right = DeclaredEmbedder {
        dimension: 3,
        vectors: vec![vec![1.0, 0.0, 0.0]],
    };
    let vectors = embed_checked(&right, &texts)
        .await
        .expect("should accept declared dimension");
    assert_eq!(vectors[0].len(), 3);
}

#[test]
fn build_embedder_follows_provider() {
    let mut config = Config::default();
    config.embedding.provider = EmbeddingProvider::Hashing;
    config.embedding.hashing_dimension = 32;

    let embedder = build_embedder(&config).expect("should build hashing embedder");
    assert_eq!(embedder.model_name(), "hashing-32");
    assert_eq!(embedder.expected_dimension(), Some(32));

    let mut config = Config::default();
    config.ollama.embedding_dimension = 1024;
    let embedder = build_embedder(&config).expect("should build ollama client");
    assert_eq!(embedder.model_name(), "nomic-embed-text:latest");
    assert_eq!(embedder.expected_dimension(), Some(1024));
}
