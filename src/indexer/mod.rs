// Indexer module
// Ingestion pipeline: split, identify and embed a file, then commit it to both stores


pub mod consistency;
pub mod locks;

use futures::StreamExt;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{Instrument, Span, debug, error, info, info_span, warn};
use walkdir::WalkDir;

use crate::config::Config;
use crate::config::settings::FILES_DIR_NAME;
use crate::database::sqlite::Database;
use crate::database::sqlite::models::{
    ChunkRecord, FileRecord, FileStatus, IndexStruct, IndexStructData, NewChunk, NewFile, Page,
};
use crate::database::vector::{VectorPayload, VectorRecord, VectorStoreAdapter};
use crate::embeddings::chunking::decode_text;
use crate::embeddings::{
    Embedder, ParagraphSplitter, Splitter, TextChunk, build_embedder, embed_checked,
};
use crate::identity::{
    DraftChunk, assign_chunk_indices, derive_file_id, display_file_name, hex_digest,
};
use crate::{EngineError, Result};

use consistency::remove_artifact;

pub use consistency::{
    ConsistencyManager, ConsistencyReport, ConsistencyValidator, FileConsistencyIssue,
    RemovedFile, RepairSummary,
};
pub use locks::{FileLockGuard, FileLocks};

const DIRECTORY_CONCURRENCY: usize = 4;

/// Where a file is in the ingestion pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IngestStage {
    Received,
    Split,
    MetadataAttached,
    Persisted,
    Indexed,
}

impl fmt::Display for IngestStage {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Received => "received",
            Self::Split => "split",
            Self::MetadataAttached => "metadata_attached",
            Self::Persisted => "persisted",
            Self::Indexed => "indexed",
        };
        f.write_str(name)
    }
}

/// Result of ingesting one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub file_id: String,
    pub name: String,
    /// New chunk ids in position order
    pub chunk_ids: Vec<String>,
    /// Chunk ids of the version this ingestion replaced
    pub replaced_chunk_ids: Option<Vec<String>>,
}

impl IngestOutcome {
    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.chunk_ids.len()
    }

    #[inline]
    pub const fn replaced(&self) -> bool {
        self.replaced_chunk_ids.is_some()
    }
}

/// One file found by [`Indexer::ingest_directory`]
#[derive(Debug)]
pub struct DirectoryEntry {
    pub path: PathBuf,
    pub result: Result<IngestOutcome>,
}

/// A similarity hit joined with its chunk row
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedChunk {
    pub chunk: ChunkRecord,
    pub score: f32,
}

/// Statistics about indexing activity of one engine instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexingStats {
    pub files_ingested: u64,
    pub files_deleted: u64,
    pub chunks_written: u64,
    pub vectors_deleted: u64,
    pub rollbacks: u64,
    pub split_failures: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    files_ingested: AtomicU64,
    files_deleted: AtomicU64,
    chunks_written: AtomicU64,
    vectors_deleted: AtomicU64,
    rollbacks: AtomicU64,
    split_failures: AtomicU64,
}

impl StatsCounters {
    fn add(counter: &AtomicU64, amount: usize) {
        counter.fetch_add(amount as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> IndexingStats {
        IndexingStats {
            files_ingested: self.files_ingested.load(Ordering::Relaxed),
            files_deleted: self.files_deleted.load(Ordering::Relaxed),
            chunks_written: self.chunks_written.load(Ordering::Relaxed),
            vectors_deleted: self.vectors_deleted.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            split_failures: self.split_failures.load(Ordering::Relaxed),
        }
    }
}

/// Everything the commit step needs, prepared before any store is touched
struct CommitPlan {
    file_id: String,
    name: String,
    media_type: String,
    content: Vec<u8>,
    chunks: Vec<NewChunk>,
    vectors: Vec<Vec<f32>>,
}

struct Inner {
    database: Database,
    vectors: VectorStoreAdapter,
    consistency: ConsistencyManager,
    embedder: Arc<dyn Embedder>,
    splitter: Arc<dyn Splitter>,
    locks: FileLocks,
    counters: StatsCounters,
    span: Span,
}

/// The document engine: ingestion, deletion, lookup and retrieval over both stores.
///
/// Cheap to clone; clones share stores, locks and statistics. Ingestions of
/// different files run in parallel, ingestions and deletions of the same
/// file id are serialized.
#[derive(Clone)]
pub struct Indexer {
    inner: Arc<Inner>,
}

impl fmt::Debug for Indexer {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Indexer")
            .field("database", &self.inner.database)
            .field("vectors", &self.inner.vectors)
            .field("embedder", &self.inner.embedder.model_name())
            .finish_non_exhaustive()
    }
}

impl Indexer {
    /// Open both stores under the configured storage root
    #[inline]
    pub async fn new(config: &Config) -> Result<Self> {
        let root = config.get_base_dir();
        let database = Database::open_in(root).await?;
        let vectors = VectorStoreAdapter::open(config).await?;
        let embedder = build_embedder(config)?;
        let splitter: Arc<dyn Splitter> =
            Arc::new(ParagraphSplitter::new(config.chunking.clone()));

        Ok(Self::with_components(
            database, vectors, embedder, splitter, root,
        ))
    }

    /// Assemble an engine from already opened parts; artifacts go under `root/files`
    #[inline]
    pub fn with_components(
        database: Database,
        vectors: VectorStoreAdapter,
        embedder: Arc<dyn Embedder>,
        splitter: Arc<dyn Splitter>,
        root: &Path,
    ) -> Self {
        let span = info_span!("engine", root = %root.display());
        let consistency = ConsistencyManager::new(
            database.clone(),
            vectors.clone(),
            root.join(FILES_DIR_NAME),
        );

        Self {
            inner: Arc::new(Inner {
                database,
                vectors,
                consistency,
                embedder,
                splitter,
                locks: FileLocks::new(),
                counters: StatsCounters::default(),
                span,
            }),
        }
    }

    #[inline]
    pub fn database(&self) -> &Database {
        &self.inner.database
    }

    #[inline]
    pub fn vectors(&self) -> &VectorStoreAdapter {
        &self.inner.vectors
    }

    #[inline]
    pub fn consistency(&self) -> &ConsistencyManager {
        &self.inner.consistency
    }

    #[inline]
    pub fn stats(&self) -> IndexingStats {
        self.inner.counters.snapshot()
    }

    /// Validator over this engine's stores, re-embedding with its embedder and
    /// taking the same per-file locks as ingestion and deletion
    #[inline]
    pub fn validator(&self) -> ConsistencyValidator<'_> {
        ConsistencyValidator::new(
            &self.inner.consistency,
            self.inner.embedder.as_ref(),
            &self.inner.locks,
        )
    }

    #[inline]
    pub async fn validate(&self) -> Result<ConsistencyReport> {
        self.validator()
            .validate()
            .instrument(self.inner.span.clone())
            .await
    }

    /// Bring both stores back into agreement; see [`ConsistencyValidator::repair`]
    #[inline]
    pub async fn repair(&self) -> Result<RepairSummary> {
        self.validator()
            .repair()
            .instrument(self.inner.span.clone())
            .await
    }

    /// Compact the relational store, then the vector store
    #[inline]
    pub async fn optimize(&self) -> Result<()> {
        let span = self.inner.span.clone();
        async {
            self.inner.database.optimize().await?;
            self.inner.vectors.optimize().await
        }
        .instrument(span)
        .await
    }

    /// Confirm the embedder can serve requests
    #[inline]
    pub async fn check_embedder(&self) -> Result<()> {
        self.inner.embedder.ensure_ready().await
    }

    /// Ingest one file, replacing any live file with the same normalized name.
    ///
    /// Splitting and embedding finish before either store is touched, so a
    /// file that cannot be read or embedded leaves the prior version in place.
    /// The commit runs as its own task: dropping the returned future does not
    /// interrupt it, and it either completes or rolls back.
    #[inline]
    pub async fn ingest(&self, name: &str, content: &[u8]) -> Result<IngestOutcome> {
        let span = self.inner.span.clone();
        self.prepare_and_commit(name, content).instrument(span).await
    }

    async fn prepare_and_commit(&self, name: &str, content: &[u8]) -> Result<IngestOutcome> {
        let name = display_file_name(name)?;
        let file_id = derive_file_id(&name)?;
        debug!("{}: {} as {}", IngestStage::Received, name, file_id);

        let split = match self.split(content) {
            Ok(split) => split,
            Err(e) => {
                StatsCounters::add(&self.inner.counters.split_failures, 1);
                warn!("Could not split {}: {}", name, e);
                return Err(e);
            }
        };
        debug!("{}: {} into {} chunks", IngestStage::Split, name, split.len());

        let media_type = guess_media_type(&name);
        let drafts: Vec<DraftChunk> = split
            .into_iter()
            .map(|chunk| chunk_draft(chunk, &name, media_type))
            .collect();
        let chunks = assign_chunk_indices(&file_id, drafts);
        debug!("{}: {}", IngestStage::MetadataAttached, name);

        let texts: Vec<String> = chunks.iter().map(|c| c.payload.text.clone()).collect();
        let vectors = embed_checked(self.inner.embedder.as_ref(), &texts).await?;

        let plan = CommitPlan {
            file_id,
            name,
            media_type: media_type.to_string(),
            content: content.to_vec(),
            chunks,
            vectors,
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.commit(plan).await }.instrument(Span::current()))
            .await
            .map_err(|e| EngineError::Other(anyhow::anyhow!("ingestion task failed: {e}")))?
    }

    fn split(&self, content: &[u8]) -> Result<Vec<TextChunk>> {
        let text = decode_text(content)?;
        let chunks = self.inner.splitter.split(text)?;
        if chunks.is_empty() {
            return Err(EngineError::Split("no chunks produced".to_string()));
        }
        Ok(chunks)
    }

    /// Delete a file from both stores; unknown ids are `NotFound`
    #[inline]
    pub async fn delete_file(&self, file_id: &str) -> Result<RemovedFile> {
        let inner = Arc::clone(&self.inner);
        let file_id = file_id.to_string();

        let task = async move {
            let _lock = inner.locks.acquire(&file_id).await;
            let removed = inner.consistency.delete_file(&file_id).await?;

            StatsCounters::add(&inner.counters.files_deleted, 1);
            StatsCounters::add(&inner.counters.vectors_deleted, removed.chunk_ids.len());
            Ok(removed)
        };

        tokio::spawn(task.instrument(self.inner.span.clone()))
            .await
            .map_err(|e| EngineError::Other(anyhow::anyhow!("delete task failed: {e}")))?
    }

    #[inline]
    pub async fn get_file(&self, file_id: &str) -> Result<FileRecord> {
        self.inner
            .database
            .get_file(file_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("file {file_id}")))
    }

    /// Indexed files, most recent upload first
    #[inline]
    pub async fn list_files(&self, page: Page) -> Result<Vec<FileRecord>> {
        self.inner.database.list_files(page).await
    }

    #[inline]
    pub async fn get_chunks_of_file(&self, file_id: &str) -> Result<Vec<ChunkRecord>> {
        self.inner.database.get_chunks_of_file(file_id).await
    }

    /// Chunk by id, falling back to prefix and substring matches
    #[inline]
    pub async fn lookup_chunk(&self, chunk_id: &str) -> Result<ChunkRecord> {
        self.inner.database.lookup_chunk(chunk_id).await
    }

    /// Embed `query` and return the `top_k` most similar chunks.
    ///
    /// Hits whose chunk row no longer exists are dropped.
    #[inline]
    pub async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedChunk>> {
        let query_vectors =
            embed_checked(self.inner.embedder.as_ref(), &[query.to_string()]).await?;
        let Some(query_vector) = query_vectors.into_iter().next() else {
            return Ok(Vec::new());
        };

        let matches = self.inner.vectors.query(&query_vector, top_k).await?;
        let ids: Vec<String> = matches.iter().map(|m| m.chunk_id.clone()).collect();
        let mut by_id: HashMap<String, ChunkRecord> = self
            .inner
            .database
            .get_chunks(&ids, false)
            .await?
            .into_iter()
            .map(|chunk| (chunk.chunk_id.clone(), chunk))
            .collect();

        let hits = matches
            .into_iter()
            .filter_map(|m| match by_id.remove(&m.chunk_id) {
                Some(chunk) => Some(RetrievedChunk {
                    chunk,
                    score: m.score,
                }),
                None => {
                    warn!("Vector {} has no chunk row, skipping", m.chunk_id);
                    None
                }
            })
            .collect();

        Ok(hits)
    }

    /// Ingest every regular file under `dir`, one entry per file, in walk order.
    ///
    /// A file that fails is reported in its own entry and does not stop the rest.
    /// Files whose names map to the same file id are ingested one after another
    /// in walk order, so the last of them is the version that stays.
    #[inline]
    pub async fn ingest_directory(&self, dir: &Path) -> Result<Vec<DirectoryEntry>> {
        if !dir.is_dir() {
            return Err(EngineError::NotFound(format!(
                "directory {}",
                dir.display()
            )));
        }

        let paths: Vec<PathBuf> = WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) if entry.file_type().is_file() && !is_hidden(entry.path()) => {
                    Some(entry.into_path())
                }
                Ok(_) => None,
                Err(e) => {
                    warn!("Skipping unreadable directory entry: {}", e);
                    None
                }
            })
            .collect();

        info!("Ingesting {} files from {}", paths.len(), dir.display());

        let indexer = self.clone();
        let batches: Vec<Vec<(usize, DirectoryEntry)>> =
            futures::stream::iter(group_by_file_id(paths))
                .map(move |group| {
                    let indexer = indexer.clone();
                    async move {
                        let mut entries = Vec::with_capacity(group.len());
                        for (position, path) in group {
                            let result = indexer.ingest_path(&path).await;
                            if let Err(e) = &result {
                                warn!("Failed to ingest {}: {}", path.display(), e);
                            }
                            entries.push((position, DirectoryEntry { path, result }));
                        }
                        entries
                    }
                })
                .buffer_unordered(DIRECTORY_CONCURRENCY)
                .collect()
                .await;

        let mut entries: Vec<(usize, DirectoryEntry)> = batches.into_iter().flatten().collect();
        entries.sort_by_key(|(position, _)| *position);
        Ok(entries.into_iter().map(|(_, entry)| entry).collect())
    }

    /// Ingest a file from disk under its own file name
    #[inline]
    pub async fn ingest_path(&self, path: &Path) -> Result<IngestOutcome> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| EngineError::InvalidFileName(path.display().to_string()))?;
        let content = tokio::fs::read(path).await?;
        self.ingest(&name, &content).await
    }

    /// Write a `vector_index` index struct covering every indexed chunk
    #[inline]
    pub async fn snapshot_index_struct(&self, index_id: &str) -> Result<IndexStruct> {
        let nodes: BTreeMap<String, String> = self
            .inner
            .database
            .list_chunk_refs()
            .await?
            .into_iter()
            .filter(|r| r.status == FileStatus::Indexed)
            .map(|r| (r.chunk_id, r.file_id))
            .collect();
        let file_count = nodes.values().collect::<BTreeSet<_>>().len();

        let index = IndexStruct {
            index_id: index_id.to_string(),
            summary: Some(format!("{} chunks from {} files", nodes.len(), file_count)),
            data: IndexStructData::VectorIndex { nodes },
        };
        self.inner.database.put_index_struct(&index).await?;

        info!("Snapshot {} written", index_id);
        Ok(index)
    }
}

impl Inner {
    async fn commit(&self, plan: CommitPlan) -> Result<IngestOutcome> {
        let _lock = self.locks.acquire(&plan.file_id).await;

        let prior = self.consistency.clear_prior_version(&plan.file_id).await?;
        if let Some(removed) = &prior {
            StatsCounters::add(&self.counters.vectors_deleted, removed.chunk_ids.len());
        }

        let artifact = self.write_artifact(&plan).await?;
        let chunk_ids: Vec<String> = plan.chunks.iter().map(|c| c.chunk_id.clone()).collect();

        let file = NewFile {
            file_id: plan.file_id.clone(),
            name: plan.name.clone(),
            size: plan.content.len() as i64,
            media_type: plan.media_type.clone(),
            content_hash: hex_digest(&plan.content),
            path: Some(artifact.to_string_lossy().into_owned()),
            created_at: prior.as_ref().map(|removed| removed.file.created_at),
        };

        if let Err(e) = self.database.stage_file(&file, &plan.chunks).await {
            return Err(self.roll_back(&plan, &chunk_ids, &artifact, e).await);
        }
        debug!(
            "{}: {} chunks of {}",
            IngestStage::Persisted,
            chunk_ids.len(),
            plan.file_id
        );

        let records: Vec<VectorRecord> = plan
            .chunks
            .iter()
            .zip(&plan.vectors)
            .map(|(chunk, vector)| VectorRecord {
                chunk_id: chunk.chunk_id.clone(),
                vector: vector.clone(),
                payload: VectorPayload {
                    file_id: chunk.file_id.clone(),
                    chunk_index: u32::try_from(chunk.chunk_index).unwrap_or(u32::MAX),
                    text: chunk.payload.text.clone(),
                },
            })
            .collect();

        if let Err(e) = self.vectors.upsert(&records).await {
            return Err(self.roll_back(&plan, &chunk_ids, &artifact, e).await);
        }

        if let Err(e) = self.database.mark_file_indexed(&plan.file_id).await {
            return Err(self.roll_back(&plan, &chunk_ids, &artifact, e).await);
        }

        StatsCounters::add(&self.counters.files_ingested, 1);
        StatsCounters::add(&self.counters.chunks_written, chunk_ids.len());
        info!(
            "{}: {} ({}) with {} chunks{}",
            IngestStage::Indexed,
            plan.name,
            plan.file_id,
            chunk_ids.len(),
            if prior.is_some() { ", replacing prior version" } else { "" }
        );

        Ok(IngestOutcome {
            file_id: plan.file_id,
            name: plan.name,
            chunk_ids,
            replaced_chunk_ids: prior.map(|removed| removed.chunk_ids),
        })
    }

    /// Write the uploaded bytes next to a `.partial` name, then move them into
    /// place. A failed write leaves nothing behind.
    async fn write_artifact(&self, plan: &CommitPlan) -> Result<PathBuf> {
        let dir = self.consistency.files_dir();
        tokio::fs::create_dir_all(dir).await?;

        let path = dir.join(format!("{}_{}", plan.file_id, plan.name));
        let partial = dir.join(format!("{}_{}.partial", plan.file_id, plan.name));
        let written = async {
            tokio::fs::write(&partial, &plan.content).await?;
            tokio::fs::rename(&partial, &path).await
        }
        .await;

        if let Err(e) = written {
            error!("Failed to write artifact {}: {}", path.display(), e);
            remove_artifact(&partial).await;
            return Err(e.into());
        }
        Ok(path)
    }

    /// Compensate a failed commit and hand back the error that caused it
    async fn roll_back(
        &self,
        plan: &CommitPlan,
        chunk_ids: &[String],
        artifact: &Path,
        cause: EngineError,
    ) -> EngineError {
        error!("Ingestion of {} failed: {}", plan.file_id, cause);
        StatsCounters::add(&self.counters.rollbacks, 1);

        if let Err(e) = self
            .consistency
            .rollback(&plan.file_id, chunk_ids, Some(artifact))
            .await
        {
            error!("Rollback of {} failed: {}", plan.file_id, e);
        }
        cause
    }
}

fn chunk_draft(chunk: TextChunk, name: &str, media_type: &str) -> DraftChunk {
    let mut metadata = Map::new();
    metadata.insert("file_name".to_string(), Value::from(name));
    metadata.insert("media_type".to_string(), Value::from(media_type));
    if !chunk.heading_path.is_empty() {
        metadata.insert("section".to_string(), Value::from(chunk.heading_path));
    }
    metadata.insert("token_count".to_string(), Value::from(chunk.token_count));
    metadata.insert(
        "has_code_blocks".to_string(),
        Value::from(chunk.has_code_blocks),
    );

    DraftChunk {
        text: chunk.content,
        metadata,
    }
}

/// Walk positions grouped by the file id each path's name maps to, groups in
/// order of first appearance. Names that map to no file id stand alone.
fn group_by_file_id(paths: Vec<PathBuf>) -> Vec<Vec<(usize, PathBuf)>> {
    let mut groups: Vec<Vec<(usize, PathBuf)>> = Vec::new();
    let mut group_of: HashMap<String, usize> = HashMap::new();

    for (position, path) in paths.into_iter().enumerate() {
        let file_id = path
            .file_name()
            .and_then(|name| derive_file_id(&name.to_string_lossy()).ok());
        let Some(file_id) = file_id else {
            groups.push(vec![(position, path)]);
            continue;
        };

        if let Some(&group) = group_of.get(&file_id) {
            warn!(
                "{} maps to {} like an earlier file and will replace it",
                path.display(),
                file_id
            );
            groups[group].push((position, path));
        } else {
            group_of.insert(file_id, groups.len());
            groups.push(vec![(position, path)]);
        }
    }

    groups
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|name| name.to_string_lossy().starts_with('.'))
}

/// Media type from the file extension; unknown extensions are plain text
#[inline]
pub fn guess_media_type(name: &str) -> &'static str {
    let extension = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "md" | "markdown" => "text/markdown",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "json" => "application/json",
        "toml" => "application/toml",
        "yaml" | "yml" => "application/yaml",
        "xml" => "application/xml",
        "rs" => "text/x-rust",
        "py" => "text/x-python",
        _ => "text/plain",
    }
}
