use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::api::{self, DeleteResult, UploadFile, UploadResult};
use crate::config::Config;
use crate::database::sqlite::models::Page;
use crate::identity::derive_file_id;
use crate::indexer::Indexer;

async fn open_engine(config: &Config) -> Result<Indexer> {
    Indexer::new(config)
        .await
        .with_context(|| format!("Failed to open storage at {}", config.get_base_dir().display()))
}

fn print_upload_results(results: &[UploadResult]) {
    for result in results {
        match result {
            UploadResult::Success {
                filename,
                chunks,
                file_id,
            } => println!("✅ {} -> {} ({} chunks)", filename, file_id, chunks),
            UploadResult::Error { filename, message } => {
                println!("❌ {}: {}", filename, message);
            }
        }
    }

    let succeeded = results.iter().filter(|r| r.is_success()).count();
    println!();
    println!(
        "Uploaded {} of {} files ({} failed)",
        succeeded,
        results.len(),
        results.len() - succeeded
    );
}

/// Upload files from disk, replacing earlier versions with the same name
#[inline]
pub async fn upload_files(config: &Config, paths: &[PathBuf], json: bool) -> Result<()> {
    let indexer = open_engine(config).await?;

    let mut files = Vec::with_capacity(paths.len());
    let mut results = Vec::new();
    for path in paths {
        let name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
        match tokio::fs::read(path).await {
            Ok(content) => files.push(UploadFile::new(name, content)),
            Err(e) => {
                warn!("Failed to read {}: {}", path.display(), e);
                results.push(UploadResult::Error {
                    filename: name,
                    message: format!("Failed to read file: {e}"),
                });
            }
        }
    }

    results.extend(api::upload(&indexer, files).await);

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        print_upload_results(&results);
    }
    Ok(())
}

/// List indexed files, most recent upload first
#[inline]
pub async fn list_files(config: &Config, page: Page, json: bool) -> Result<()> {
    let indexer = open_engine(config).await?;
    let files = api::list(&indexer, page)
        .await
        .context("Failed to list files")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&files)?);
        return Ok(());
    }

    if files.is_empty() {
        println!("No files have been uploaded yet.");
        println!("Use 'dualstore upload <path>' to add one.");
        return Ok(());
    }

    println!("Files ({} shown):", files.len());
    println!();
    for file in &files {
        println!("📄 {} (ID: {})", file.name, file.id);
        println!("   Type: {}", file.media_type);
        println!("   Size: {} bytes", file.size);
        println!(
            "   Uploaded: {}",
            file.upload_date.format("%Y-%m-%d %H:%M:%S")
        );
        println!();
    }
    Ok(())
}

/// Delete a file by id, or by the name it was uploaded under
#[inline]
pub async fn delete_file(config: &Config, file: &str) -> Result<()> {
    let indexer = open_engine(config).await?;

    let mut result = api::delete(&indexer, file).await?;
    if result == DeleteResult::NotFound {
        if let Ok(file_id) = derive_file_id(file) {
            if file_id != file {
                result = api::delete(&indexer, &file_id).await?;
            }
        }
    }

    match result {
        DeleteResult::Deleted => {
            info!("Deleted file {}", file);
            println!("Deleted {}", file);
            Ok(())
        }
        DeleteResult::NotFound => bail!("File not found: {}", file),
    }
}

/// Print one chunk, accepting truncated ids
#[inline]
pub async fn show_chunk(config: &Config, chunk_id: &str) -> Result<()> {
    let indexer = open_engine(config).await?;
    let Some(chunk) = api::lookup_chunk(&indexer, chunk_id).await? else {
        bail!("Chunk not found: {}", chunk_id);
    };

    println!("{}", serde_json::to_string_pretty(&chunk)?);
    Ok(())
}

/// Ingest every file under `dir`, or under the configured source directory
#[inline]
pub async fn ingest_directory(config: &Config, dir: Option<&Path>) -> Result<()> {
    let dir = match dir.or(config.source_dir.as_deref()) {
        Some(dir) => dir.to_path_buf(),
        None => bail!("No directory given and no source_dir configured"),
    };

    let indexer = open_engine(config).await?;
    let entries = indexer
        .ingest_directory(&dir)
        .await
        .with_context(|| format!("Failed to scan {}", dir.display()))?;

    let results: Vec<UploadResult> = entries
        .into_iter()
        .map(|entry| {
            let filename = entry.path.display().to_string();
            match entry.result {
                Ok(outcome) => UploadResult::Success {
                    filename,
                    chunks: outcome.chunk_count(),
                    file_id: outcome.file_id,
                },
                Err(e) => UploadResult::Error {
                    filename,
                    message: e.to_string(),
                },
            }
        })
        .collect();

    print_upload_results(&results);
    Ok(())
}

/// Similarity search over indexed chunks
#[inline]
pub async fn search(config: &Config, query: &str, top_k: usize) -> Result<()> {
    let indexer = open_engine(config).await?;
    let hits = api::search(&indexer, query, top_k).await?;

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (rank, hit) in hits.iter().enumerate() {
        println!(
            "{}. [{:.3}] {} (file {}, chunk {})",
            rank + 1,
            hit.score,
            hit.id,
            hit.file_id,
            hit.chunk_index
        );
        let preview: String = hit.text.chars().take(200).collect();
        println!("   {}", preview.replace('\n', " "));
    }
    Ok(())
}

/// Confirm the embedder is reachable, then compare the relational store with
/// the vector store
#[inline]
pub async fn check(config: &Config) -> Result<()> {
    let indexer = open_engine(config).await?;

    match indexer.check_embedder().await {
        Ok(()) => println!("✅ Embedder is ready"),
        Err(e) => {
            warn!("Embedder health check failed: {}", e);
            println!("❌ Embedder is not ready: {}", e);
        }
    }

    let report = indexer.validate().await?;

    println!("{}", report.summary());
    for issue in &report.inconsistent_files {
        println!(
            "   {} ({}): {} chunks, {} missing vectors{}",
            issue.name,
            issue.file_id,
            issue.chunk_count,
            issue.missing_vectors.len(),
            if issue.positions_contiguous {
                ""
            } else {
                ", positions not contiguous"
            }
        );
    }
    Ok(())
}

/// Remove orphans and stale pending files, and restore missing vectors
#[inline]
pub async fn repair(config: &Config) -> Result<()> {
    let indexer = open_engine(config).await?;
    let summary = indexer.repair().await?;

    if summary.is_noop() {
        println!("Nothing to repair.");
    } else {
        println!("Orphaned vectors removed: {}", summary.orphans_removed);
        println!("Vectors restored: {}", summary.vectors_restored);
        println!("Stale pending files removed: {}", summary.stale_files_removed);
    }
    Ok(())
}

/// Compact both stores
#[inline]
pub async fn optimize(config: &Config) -> Result<()> {
    let indexer = open_engine(config).await?;
    indexer
        .optimize()
        .await
        .context("Failed to optimize storage")?;

    println!("Optimized the relational store and the vector store.");
    Ok(())
}

/// Record which chunks make up the vector index
#[inline]
pub async fn snapshot_index(config: &Config, index_id: &str) -> Result<()> {
    let indexer = open_engine(config).await?;
    let index = indexer.snapshot_index_struct(index_id).await?;

    println!(
        "Wrote index struct {} ({}): {}",
        index.index_id,
        index.data.kind(),
        index.summary.as_deref().unwrap_or("no summary")
    );
    Ok(())
}

/// Show the configuration, or write the defaults when `init` is set
#[inline]
pub fn show_config(config: &Config, init: bool) -> Result<()> {
    if init {
        if config.config_file_path().exists() {
            bail!(
                "Configuration already exists at {}",
                config.config_file_path().display()
            );
        }
        config.save()?;
        println!("Wrote {}", config.config_file_path().display());
        return Ok(());
    }

    println!("Storage root: {}", config.get_base_dir().display());
    println!("Relational store: {}", config.database_path().display());
    println!("Vector store: {}", config.vector_database_path().display());
    println!("Uploaded files: {}", config.files_dir().display());
    println!();
    println!(
        "{}",
        toml::to_string_pretty(config).context("Failed to serialize config")?
    );
    Ok(())
}
