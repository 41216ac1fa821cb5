use super::*;
use crate::database::sqlite::Database;
use crate::database::vector::{MemoryVectorStore, RetryPolicy, VectorStoreAdapter};
use crate::embeddings::{ChunkingConfig, HashingEmbedder, ParagraphSplitter};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const THREE_PARAGRAPHS: &str =
    "alpha beta gamma delta.\n\nepsilon zeta eta theta.\n\niota kappa lambda mu.";

async fn create_test_indexer() -> (Indexer, TempDir) {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let database = Database::open_in(temp_dir.path())
        .await
        .expect("should open database");
    let vectors = VectorStoreAdapter::new(
        Arc::new(MemoryVectorStore::new()),
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
    (indexer, temp_dir)
}

#[test]
fn upload_result_serializes_with_status_tag() {
    let success = UploadResult::Success {
        filename: "a.txt".to_string(),
        chunks: 3,
        file_id: "file_0123".to_string(),
    };
    let error = UploadResult::Error {
        filename: "b.bin".to_string(),
        message: "Split error: not text".to_string(),
    };

    assert_eq!(
        serde_json::to_value(&success).expect("should serialize"),
        json!({"status": "success", "filename": "a.txt", "chunks": 3, "file_id": "file_0123"})
    );
    assert_eq!(
        serde_json::to_value(&error).expect("should serialize"),
        json!({"status": "error", "filename": "b.bin", "message": "Split error: not text"})
    );
}

#[test]
fn file_summary_uses_type_key() {
    let upload_date = chrono::DateTime::from_timestamp(1_700_000_000, 0)
        .expect("should build timestamp")
        .naive_utc();
    let summary = FileSummary {
        id: "file_0123".to_string(),
        name: "a.txt".to_string(),
        size: 42,
        media_type: "text/plain".to_string(),
        upload_date,
    };

    let value = serde_json::to_value(&summary).expect("should serialize");
    assert_eq!(value["type"], "text/plain");
    assert!(value.get("media_type").is_none());
    assert_eq!(value["upload_date"], "2023-11-14T22:13:20");
}

#[tokio::test]
async fn upload_isolates_failing_files() {
    let (indexer, _temp_dir) = create_test_indexer().await;

    let results = upload(
        &indexer,
        vec![
            UploadFile::new("a.txt", THREE_PARAGRAPHS),
            UploadFile::new("broken.bin", vec![0xff, 0xfe, 0x00, 0x81]),
            UploadFile::new("b.txt", "single paragraph here."),
        ],
    )
    .await;

    assert_eq!(results.len(), 3);
    assert_eq!(results[0].filename(), "a.txt");
    assert!(matches!(results[0], UploadResult::Success { chunks: 3, .. }));
    assert!(!results[1].is_success());
    assert!(results[2].is_success());

    let files = list(&indexer, Page::default()).await.expect("should list");
    assert_eq!(files.len(), 2);
}

#[tokio::test]
async fn list_is_most_recent_first() {
    let (indexer, _temp_dir) = create_test_indexer().await;
    indexer
        .ingest("first.txt", b"one paragraph.")
        .await
        .expect("should ingest first");
    tokio::time::sleep(Duration::from_millis(5)).await;
    indexer
        .ingest("second.txt", b"another paragraph.")
        .await
        .expect("should ingest second");

    let files = list(&indexer, Page::default()).await.expect("should list");

    let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["second.txt", "first.txt"]);
    assert_eq!(files[0].media_type, "text/plain");
    assert_eq!(files[0].size, "another paragraph.".len() as i64);
}

#[tokio::test]
async fn delete_reports_not_found() {
    let (indexer, _temp_dir) = create_test_indexer().await;
    let results = upload(&indexer, vec![UploadFile::new("a.txt", THREE_PARAGRAPHS)]).await;
    let UploadResult::Success { file_id, .. } = &results[0] else {
        panic!("upload should succeed: {results:?}");
    };

    assert_eq!(
        delete(&indexer, file_id).await.expect("should delete"),
        DeleteResult::Deleted
    );
    assert_eq!(
        delete(&indexer, file_id).await.expect("should not error"),
        DeleteResult::NotFound
    );
}

#[tokio::test]
async fn lookup_chunk_returns_view() {
    let (indexer, _temp_dir) = create_test_indexer().await;
    let outcome = indexer
        .ingest("notes.md", THREE_PARAGRAPHS.as_bytes())
        .await
        .expect("should ingest");
    let chunk_id = &outcome.chunk_ids[1];

    let view = lookup_chunk(&indexer, &chunk_id[..8])
        .await
        .expect("should look up")
        .expect("should find chunk by prefix");

    assert_eq!(&view.id, chunk_id);
    assert!(view.text.contains("epsilon"));
    assert_eq!(view.metadata["file_id"], outcome.file_id.as_str());
    assert_eq!(view.metadata["chunk_index"], 1);

    let missing = lookup_chunk(&indexer, "no-such-chunk")
        .await
        .expect("should not error");
    assert!(missing.is_none());
}

#[tokio::test]
async fn search_returns_hits() {
    let (indexer, _temp_dir) = create_test_indexer().await;
    indexer
        .ingest("a.txt", THREE_PARAGRAPHS.as_bytes())
        .await
        .expect("should ingest");

    let hits = search(&indexer, "epsilon zeta eta theta.", 2)
        .await
        .expect("should search");

    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].chunk_index, 1);
    assert!(hits[0].score >= hits[1].score);
}

#[tokio::test]
async fn list_keeps_uploaded_casing() {
    let (indexer, _temp_dir) = create_test_indexer().await;

    let first = upload(
        &indexer,
        vec![UploadFile::new("reports/Quarterly_Report.TXT", THREE_PARAGRAPHS)],
    )
    .await;
    let second = upload(
        &indexer,
        vec![UploadFile::new("QUARTERLY_REPORT.txt", "single paragraph here.")],
    )
    .await;

    let (
        UploadResult::Success {
            file_id: first_id, ..
        },
        UploadResult::Success {
            file_id: second_id, ..
        },
    ) = (&first[0], &second[0])
    else {
        panic!("uploads should succeed: {first:?} {second:?}");
    };
    assert_eq!(first_id, second_id);

    let files = list(&indexer, Page::default()).await.expect("should list");
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].name, "QUARTERLY_REPORT.txt");
    assert_eq!(files[0].id, *first_id);
}
