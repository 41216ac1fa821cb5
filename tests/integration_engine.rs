#![expect(
    clippy::tests_outside_test_module,
    reason = "integration tests are only compiled in test mode"
)]

//! End-to-end tests of the document engine
//!
//! Everything runs against a temporary storage root with the deterministic
//! hashing embedder, so no model server is needed. Most tests use the
//! in-memory vector backend; the LanceDB tests use the real on-disk store.

use std::collections::{BTreeSet, HashSet};
use tempfile::TempDir;

use dualstore::EngineError;
use dualstore::api::{self, DeleteResult, UploadFile, UploadResult};
use dualstore::config::{
    Config, EmbeddingConfig, EmbeddingProvider, VectorBackendKind, VectorStoreConfig,
};
use dualstore::database::sqlite::models::{ChunkPayload, NewChunk, Page};
use dualstore::embeddings::ChunkingConfig;
use dualstore::indexer::Indexer;

const THREE_PARAGRAPHS: &str =
    "alpha beta gamma delta.\n\nepsilon zeta eta theta.\n\niota kappa lambda mu.";
const TWO_PARAGRAPHS: &str = "nu xi omicron pi.\n\nrho sigma tau upsilon.";

const WORDS: [&str; 12] = [
    "storage", "vector", "chunk", "file", "index", "query", "replace", "delete", "embed", "split",
    "position", "record",
];

fn test_config(root: &std::path::Path, backend: VectorBackendKind) -> Config {
    Config {
        embedding: EmbeddingConfig {
            provider: EmbeddingProvider::Hashing,
            hashing_dimension: 48,
        },
        chunking: ChunkingConfig {
            target_chunk_size: 8,
            max_chunk_size: 12,
            min_chunk_size: 1,
            overlap_size: 0,
            ..ChunkingConfig::default()
        },
        vector_store: VectorStoreConfig {
            backend,
            retry_attempts: 2,
            backoff_base_ms: 1,
            ..VectorStoreConfig::default()
        },
        base_dir: root.to_path_buf(),
        ..Config::default()
    }
}

async fn create_engine(backend: VectorBackendKind) -> (Indexer, TempDir) {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let config = test_config(temp_dir.path(), backend);
    let indexer = Indexer::new(&config).await.expect("should open engine");
    (indexer, temp_dir)
}

/// Deterministic document with `paragraphs` short paragraphs
fn document(seed: usize, paragraphs: usize) -> String {
    (0..paragraphs)
        .map(|p| {
            let words: Vec<&str> = (0..4)
                .map(|w| WORDS[(seed * 7 + p * 3 + w) % WORDS.len()])
                .collect();
            format!("{} {}.", words.join(" "), seed * 100 + p)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

async fn relational_ids(indexer: &Indexer) -> BTreeSet<String> {
    indexer
        .database()
        .list_chunk_refs()
        .await
        .expect("should list chunk refs")
        .into_iter()
        .map(|r| r.chunk_id)
        .collect()
}

async fn vector_ids(indexer: &Indexer) -> BTreeSet<String> {
    indexer
        .vectors()
        .list_ids()
        .await
        .expect("should list vector ids")
        .into_iter()
        .collect()
}

#[tokio::test]
async fn chunk_positions_are_dense_for_every_file() {
    let (indexer, _temp_dir) = create_engine(VectorBackendKind::Memory).await;

    for seed in 0..12 {
        let content = document(seed, 1 + seed % 6);
        let outcome = indexer
            .ingest(&format!("doc-{seed}.txt"), content.as_bytes())
            .await
            .expect("should ingest");

        let chunks = indexer
            .get_chunks_of_file(&outcome.file_id)
            .await
            .expect("should read chunks");
        let positions: Vec<i64> = chunks.iter().map(|c| c.chunk_index).collect();
        let expected: Vec<i64> = (0..chunks.len() as i64).collect();
        assert_eq!(positions, expected, "positions of doc-{seed}.txt");
        assert_eq!(chunks.len(), outcome.chunk_count());
    }
}

#[tokio::test]
async fn both_stores_hold_the_same_chunk_ids() {
    let (indexer, _temp_dir) = create_engine(VectorBackendKind::Memory).await;

    for seed in 0..10 {
        indexer
            .ingest(&format!("doc-{seed}.md"), document(seed, 2 + seed % 4).as_bytes())
            .await
            .expect("should ingest");
    }
    // Replace a few to exercise the cascade as well
    for seed in [1, 4, 7] {
        indexer
            .ingest(&format!("doc-{seed}.md"), document(seed + 50, 1).as_bytes())
            .await
            .expect("should re-ingest");
    }
    indexer
        .delete_file(&dualstore::identity::derive_file_id("doc-2.md").expect("should derive id"))
        .await
        .expect("should delete");

    let relational = relational_ids(&indexer).await;
    assert!(!relational.is_empty());
    assert_eq!(relational, vector_ids(&indexer).await);
    assert!(
        indexer
            .validator()
            .validate()
            .await
            .expect("should validate")
            .is_consistent
    );
}

#[tokio::test]
async fn reupload_replaces_three_chunks_with_two() {
    let (indexer, _temp_dir) = create_engine(VectorBackendKind::Memory).await;

    let first = indexer
        .ingest("a.txt", THREE_PARAGRAPHS.as_bytes())
        .await
        .expect("should ingest");
    assert_eq!(first.chunk_count(), 3);
    let vectors_before = indexer.vectors().count().await.expect("should count");
    assert_eq!(vectors_before, 3);

    let second = indexer
        .ingest("a.txt", TWO_PARAGRAPHS.as_bytes())
        .await
        .expect("should re-ingest");

    assert_eq!(second.file_id, first.file_id);
    assert_eq!(second.chunk_count(), 2);
    assert_eq!(
        second.replaced_chunk_ids.as_deref(),
        Some(first.chunk_ids.as_slice())
    );

    let chunks = indexer
        .get_chunks_of_file(&first.file_id)
        .await
        .expect("should read chunks");
    assert_eq!(chunks.len(), 2);
    assert_eq!(
        chunks.iter().map(|c| c.chunk_index).collect::<Vec<_>>(),
        vec![0, 1]
    );

    let vectors_after = indexer.vectors().count().await.expect("should count");
    assert_eq!(vectors_after as i64 - vectors_before as i64, -1);

    let old: HashSet<&String> = first.chunk_ids.iter().collect();
    assert!(second.chunk_ids.iter().all(|id| !old.contains(id)));
    let relational = relational_ids(&indexer).await;
    let vectors = vector_ids(&indexer).await;
    for id in &first.chunk_ids {
        assert!(!relational.contains(id));
        assert!(!vectors.contains(id));
    }

    let files = api::list(&indexer, Page::default()).await.expect("should list");
    assert_eq!(files.len(), 1);
}

#[tokio::test]
async fn identical_content_under_two_names() {
    let (indexer, _temp_dir) = create_engine(VectorBackendKind::Memory).await;

    let results = api::upload(
        &indexer,
        vec![
            UploadFile::new("a.txt", THREE_PARAGRAPHS),
            UploadFile::new("b.txt", THREE_PARAGRAPHS),
        ],
    )
    .await;

    let ids: Vec<&str> = results
        .iter()
        .map(|r| match r {
            UploadResult::Success { file_id, chunks, .. } => {
                assert_eq!(*chunks, 3);
                file_id.as_str()
            }
            UploadResult::Error { message, .. } => panic!("upload failed: {message}"),
        })
        .collect();
    assert_ne!(ids[0], ids[1]);

    for file_id in ids {
        let chunks = indexer
            .get_chunks_of_file(file_id)
            .await
            .expect("should read chunks");
        assert_eq!(
            chunks.iter().map(|c| c.chunk_index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }
    assert_eq!(indexer.vectors().count().await.ok(), Some(6));
}

#[tokio::test]
async fn delete_unknown_file_changes_nothing() {
    let (indexer, temp_dir) = create_engine(VectorBackendKind::Memory).await;
    let outcome = indexer
        .ingest("a.txt", THREE_PARAGRAPHS.as_bytes())
        .await
        .expect("should ingest");

    let before = (relational_ids(&indexer).await, vector_ids(&indexer).await);
    assert_eq!(
        api::delete(&indexer, "file_0000000000000000")
            .await
            .expect("should not error"),
        DeleteResult::NotFound
    );
    assert_eq!(before, (relational_ids(&indexer).await, vector_ids(&indexer).await));

    assert_eq!(
        api::delete(&indexer, &outcome.file_id)
            .await
            .expect("should delete"),
        DeleteResult::Deleted
    );
    assert!(relational_ids(&indexer).await.is_empty());
    assert!(vector_ids(&indexer).await.is_empty());
    assert!(matches!(
        indexer.get_file(&outcome.file_id).await,
        Err(EngineError::NotFound(_))
    ));
    let artifacts = std::fs::read_dir(temp_dir.path().join("files"))
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(artifacts, 0);
}

#[tokio::test]
async fn put_chunks_upsert_is_idempotent() {
    let (indexer, _temp_dir) = create_engine(VectorBackendKind::Memory).await;
    let outcome = indexer
        .ingest("a.txt", THREE_PARAGRAPHS.as_bytes())
        .await
        .expect("should ingest");
    let database = indexer.database();

    let chunks: Vec<NewChunk> = (0..2)
        .map(|i| NewChunk {
            chunk_id: format!("extra-{i}"),
            file_id: outcome.file_id.clone(),
            chunk_index: 3 + i,
            content_hash: None,
            payload: ChunkPayload {
                text: format!("extra chunk {i}"),
                ..ChunkPayload::default()
            },
        })
        .collect();

    database
        .put_chunks(&chunks, true)
        .await
        .expect("should put chunks");
    let once = database
        .get_chunks_of_file(&outcome.file_id)
        .await
        .expect("should read chunks");

    database
        .put_chunks(&chunks, true)
        .await
        .expect("should put chunks again");
    let twice = database
        .get_chunks_of_file(&outcome.file_id)
        .await
        .expect("should read chunks");

    assert_eq!(once.len(), 5);
    let strip = |records: &[dualstore::database::sqlite::models::ChunkRecord]| {
        records
            .iter()
            .map(|c| (c.chunk_id.clone(), c.chunk_index, c.payload.clone()))
            .collect::<Vec<_>>()
    };
    assert_eq!(strip(&once), strip(&twice));
}

#[tokio::test]
async fn lancedb_engine_survives_reopen() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let config = test_config(temp_dir.path(), VectorBackendKind::Lancedb);

    let (file_id, chunk_ids) = {
        let indexer = Indexer::new(&config).await.expect("should open engine");
        let outcome = indexer
            .ingest("a.txt", THREE_PARAGRAPHS.as_bytes())
            .await
            .expect("should ingest");
        indexer
            .ingest("b.txt", TWO_PARAGRAPHS.as_bytes())
            .await
            .expect("should ingest");
        (outcome.file_id, outcome.chunk_ids)
    };

    let indexer = Indexer::new(&config).await.expect("should reopen engine");
    assert_eq!(indexer.vectors().count().await.ok(), Some(5));
    assert_eq!(relational_ids(&indexer).await, vector_ids(&indexer).await);

    let hits = indexer
        .retrieve("epsilon zeta eta theta.", 1)
        .await
        .expect("should retrieve");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].chunk.chunk_id, chunk_ids[1]);

    let replaced = indexer
        .ingest("A.TXT", TWO_PARAGRAPHS.as_bytes())
        .await
        .expect("should replace");
    assert_eq!(replaced.file_id, file_id);
    let vectors = vector_ids(&indexer).await;
    assert!(chunk_ids.iter().all(|id| !vectors.contains(id)));
    assert_eq!(vectors.len(), 4);
}

#[tokio::test]
async fn config_file_selects_components() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let saved = Config {
        chunking: ChunkingConfig::default(),
        ..test_config(temp_dir.path(), VectorBackendKind::Memory)
    };
    saved.save().expect("should save config");

    let config = Config::load(temp_dir.path()).expect("should load config");
    assert_eq!(config.vector_store.backend, VectorBackendKind::Memory);
    assert_eq!(config.embedding.provider, EmbeddingProvider::Hashing);
    assert_eq!(config.embedding.hashing_dimension, 48);

    let indexer = Indexer::new(&config).await.expect("should open engine");
    assert_eq!(indexer.vectors().backend_name(), "memory");
    let outcome = indexer
        .ingest("notes.md", THREE_PARAGRAPHS.as_bytes())
        .await
        .expect("should ingest");
    assert!(outcome.chunk_count() >= 1);
    assert_eq!(indexer.vectors().count().await.ok(), Some(outcome.chunk_count() as u64));
}
