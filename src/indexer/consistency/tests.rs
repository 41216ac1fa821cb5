use super::*;
use crate::database::sqlite::models::{ChunkPayload, FileStatus, NewChunk, NewFile};
use crate::database::vector::{MemoryVectorStore, RetryPolicy, VectorPayload};
use crate::embeddings::{ChunkingConfig, HashingEmbedder, ParagraphSplitter};
use crate::indexer::Indexer;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const THREE_PARAGRAPHS: &str =
    "alpha beta gamma delta.\n\nepsilon zeta eta theta.\n\niota kappa lambda mu.";

async fn create_test_indexer() -> (Indexer, Arc<MemoryVectorStore>, TempDir) {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let database = Database::open_in(temp_dir.path())
        .await
        .expect("should open database");
    let backend = Arc::new(MemoryVectorStore::new());
    let vectors = VectorStoreAdapter::new(
        backend.clone(),
        RetryPolicy::new(1, Duration::from_millis(1)),
    );
    let splitter = ParagraphSplitter::new(ChunkingConfig {
        target_chunk_size: 8,
        max_chunk_size: 12,
        min_chunk_size: 1,
        overlap_size: 0,
        ..ChunkingConfig::default()
    });

    let indexer = Indexer::with_components(
        database,
        vectors,
        Arc::new(HashingEmbedder::new(32)),
        Arc::new(splitter),
        temp_dir.path(),
    );
    (indexer, backend, temp_dir)
}

fn new_file(file_id: &str, name: &str) -> NewFile {
    NewFile {
        file_id: file_id.to_string(),
        name: name.to_string(),
        size: 4,
        media_type: "text/plain".to_string(),
        content_hash: "00".to_string(),
        path: None,
        created_at: None,
    }
}

fn new_chunk(chunk_id: &str, file_id: &str, chunk_index: i64) -> NewChunk {
    NewChunk {
        chunk_id: chunk_id.to_string(),
        file_id: file_id.to_string(),
        chunk_index,
        content_hash: None,
        payload: ChunkPayload {
            text: format!("text of {chunk_id}"),
            ..ChunkPayload::default()
        },
    }
}

fn empty_report(is_consistent: bool) -> ConsistencyReport {
    ConsistencyReport {
        relational_chunks: 100,
        vector_count: 100,
        missing_in_vector_store: vec![],
        orphaned_vectors: vec![],
        inconsistent_files: vec![],
        stale_pending_files: vec![],
        is_consistent,
    }
}

#[test]
fn consistent_report() {
    let report = empty_report(true);

    assert_eq!(report.total_issues(), 0);
    assert!(report.summary().contains("Stores are consistent"));
}

#[test]
fn consistency_report_summary_formats_correctly() {
    let report = ConsistencyReport {
        missing_in_vector_store: vec!["c1".to_string(), "c2".to_string(), "c3".to_string()],
        orphaned_vectors: vec!["orphan1".to_string()],
        inconsistent_files: vec![FileConsistencyIssue {
            file_id: "file_a".to_string(),
            name: "a.txt".to_string(),
            chunk_count: 3,
            missing_vectors: vec!["c1".to_string()],
            positions_contiguous: false,
        }],
        ..empty_report(false)
    };

    let summary = report.summary();
    assert!(summary.contains("3 missing vectors"));
    assert!(summary.contains("1 orphaned vectors"));
    assert!(summary.contains("1 files with issues"));
    assert_eq!(report.total_issues(), 5);
}

#[test]
fn repair_summary_noop() {
    assert!(RepairSummary::default().is_noop());
    let summary = RepairSummary {
        orphans_removed: 1,
        ..RepairSummary::default()
    };
    assert!(!summary.is_noop());
}

#[tokio::test]
async fn fresh_ingest_is_consistent() {
    let (indexer, _backend, _temp_dir) = create_test_indexer().await;
    indexer
        .ingest("a.txt", THREE_PARAGRAPHS.as_bytes())
        .await
        .expect("should ingest");

    let report = indexer.validator().validate().await.expect("should validate");

    assert!(report.is_consistent, "{}", report.summary());
    assert_eq!(report.relational_chunks, 3);
    assert_eq!(report.vector_count, 3);
}

#[tokio::test]
async fn repair_fixes_drift_and_is_idempotent() {
    let (indexer, _backend, _temp_dir) = create_test_indexer().await;
    let outcome = indexer
        .ingest("a.txt", THREE_PARAGRAPHS.as_bytes())
        .await
        .expect("should ingest");

    // Drift: one lost vector, one vector without a row
    indexer
        .vectors()
        .delete(std::slice::from_ref(&outcome.chunk_ids[0]))
        .await
        .expect("should delete vector");
    indexer
        .vectors()
        .upsert_one(
            "orphan",
            vec![1.0; 32],
            VectorPayload {
                file_id: "file_gone".to_string(),
                chunk_index: 0,
                text: String::new(),
            },
        )
        .await
        .expect("should upsert orphan");

    let report = indexer.validator().validate().await.expect("should validate");
    assert!(!report.is_consistent);
    assert_eq!(report.missing_in_vector_store, vec![outcome.chunk_ids[0].clone()]);
    assert_eq!(report.orphaned_vectors, vec!["orphan".to_string()]);
    assert_eq!(report.inconsistent_files.len(), 1);
    assert!(report.inconsistent_files[0].positions_contiguous);

    let summary = indexer.validator().repair().await.expect("should repair");
    assert_eq!(summary.orphans_removed, 1);
    assert_eq!(summary.vectors_restored, 1);

    let again = indexer.validator().repair().await.expect("should repair again");
    assert!(again.is_noop());
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
async fn stale_pending_file_is_removed() {
    let (indexer, _backend, _temp_dir) = create_test_indexer().await;
    let database = indexer.database();
    database
        .stage_file(
            &new_file("file_pending", "pending.txt"),
            &[new_chunk("p0", "file_pending", 0)],
        )
        .await
        .expect("should stage file");

    let fresh = indexer.validator().validate().await.expect("should validate");
    assert!(fresh.stale_pending_files.is_empty());

    let validator = indexer
        .validator()
        .with_stale_after(chrono::Duration::zero());
    let report = validator.validate().await.expect("should validate");
    assert_eq!(report.stale_pending_files, vec!["file_pending".to_string()]);
    assert!(report.missing_in_vector_store.is_empty());

    let summary = validator.repair().await.expect("should repair");
    assert_eq!(summary.stale_files_removed, 1);
    assert_eq!(database.count_files().await.ok(), Some(0));
    assert_eq!(database.count_chunks().await.ok(), Some(0));
}

#[tokio::test]
async fn broken_positions_are_reported() {
    let (indexer, _backend, _temp_dir) = create_test_indexer().await;
    let database = indexer.database();
    database
        .put_file(&new_file("file_legacy", "legacy.txt"), FileStatus::Indexed)
        .await
        .expect("should write file");
    database
        .put_chunks(
            &[
                new_chunk("l0", "file_legacy", 0),
                new_chunk("l1", "file_legacy", 0),
            ],
            true,
        )
        .await
        .expect("should write chunks");

    let report = indexer.validator().validate().await.expect("should validate");

    let issue = &report.inconsistent_files[0];
    assert_eq!(issue.file_id, "file_legacy");
    assert!(!issue.positions_contiguous);
    assert_eq!(issue.missing_vectors.len(), 2);
}

#[tokio::test]
async fn rollback_tolerates_vector_outage() {
    let (indexer, backend, _temp_dir) = create_test_indexer().await;
    let manager = indexer.consistency();
    manager
        .database()
        .stage_file(
            &new_file("file_a", "a.txt"),
            &[new_chunk("a0", "file_a", 0), new_chunk("a1", "file_a", 1)],
        )
        .await
        .expect("should stage file");

    backend.set_unavailable(true);
    manager
        .rollback("file_a", &["a0".to_string(), "a1".to_string()], None)
        .await
        .expect("rollback should still clear relational rows");

    assert_eq!(manager.database().count_files().await.ok(), Some(0));
    assert_eq!(manager.database().count_chunks().await.ok(), Some(0));
}

#[tokio::test]
async fn clear_prior_version_without_prior_is_none() {
    let (indexer, _backend, _temp_dir) = create_test_indexer().await;

    let cleared = indexer
        .consistency()
        .clear_prior_version("file_missing")
        .await
        .expect("should succeed");
    assert!(cleared.is_none());
}

#[tokio::test]
async fn repair_waits_for_file_lock_and_rechecks_rows() {
    let (indexer, _backend, _temp_dir) = create_test_indexer().await;
    let outcome = indexer
        .ingest("a.txt", THREE_PARAGRAPHS.as_bytes())
        .await
        .expect("should ingest");
    indexer
        .vectors()
        .delete(std::slice::from_ref(&outcome.chunk_ids[1]))
        .await
        .expect("should delete vector");

    // A deletion of the same file is in flight while repair validates
    let guard = indexer.inner.locks.acquire(&outcome.file_id).await;
    let repairing = tokio::spawn({
        let indexer = indexer.clone();
        async move { indexer.repair().await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    indexer
        .consistency()
        .delete_file(&outcome.file_id)
        .await
        .expect("should delete file");
    drop(guard);

    let summary = repairing
        .await
        .expect("repair task should join")
        .expect("should repair");
    assert_eq!(summary.vectors_restored, 0);
    assert!(
        indexer
            .vectors()
            .list_ids()
            .await
            .expect("should list vectors")
            .is_empty()
    );
    assert!(
        indexer
            .validate()
            .await
            .expect("should validate")
            .is_consistent
    );
}

#[tokio::test]
async fn repair_skips_pending_file_finished_under_lock() {
    let (indexer, _backend, _temp_dir) = create_test_indexer().await;
    let database = indexer.database().clone();
    database
        .stage_file(
            &new_file("file_pending", "pending.txt"),
            &[new_chunk("p0", "file_pending", 0)],
        )
        .await
        .expect("should stage file");

    // The ingestion that staged it still holds the lock while repair validates
    let guard = indexer.inner.locks.acquire("file_pending").await;
    let repairing = tokio::spawn({
        let indexer = indexer.clone();
        async move {
            indexer
                .validator()
                .with_stale_after(chrono::Duration::zero())
                .repair()
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    indexer
        .vectors()
        .upsert_one(
            "p0",
            vec![1.0; 32],
            VectorPayload {
                file_id: "file_pending".to_string(),
                chunk_index: 0,
                text: "text of p0".to_string(),
            },
        )
        .await
        .expect("should upsert vector");
    database
        .mark_file_indexed("file_pending")
        .await
        .expect("should mark indexed");
    drop(guard);

    let summary = repairing
        .await
        .expect("repair task should join")
        .expect("should repair");
    assert_eq!(summary.stale_files_removed, 0);
    assert_eq!(database.count_files().await.ok(), Some(1));
    assert_eq!(database.count_chunks().await.ok(), Some(1));
}

#[tokio::test]
async fn engine_optimize_keeps_both_stores() {
    let (indexer, _backend, _temp_dir) = create_test_indexer().await;
    indexer
        .ingest("a.txt", THREE_PARAGRAPHS.as_bytes())
        .await
        .expect("should ingest");
    indexer
        .check_embedder()
        .await
        .expect("local embedder should be ready");

    indexer.optimize().await.expect("should optimize");

    let report = indexer.validate().await.expect("should validate");
    assert!(report.is_consistent);
    assert_eq!(report.relational_chunks, 3);
    assert_eq!(report.vector_count, 3);
}
