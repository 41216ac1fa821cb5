use anyhow::Result;
use clap::{Parser, Subcommand};
use dualstore::commands::{
    check, delete_file, ingest_directory, list_files, optimize, repair, search, show_chunk,
    show_config, snapshot_index, upload_files,
};
use dualstore::config::{Config, resolve_root};
use dualstore::database::sqlite::models::Page;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "dualstore")]
#[command(about = "A file-scoped document engine over a relational store and a vector store")]
#[command(version)]
struct Cli {
    /// Storage root for the database, vectors and uploaded files
    #[arg(long, global = true, env = "DUALSTORE_HOME")]
    root: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload files, replacing earlier uploads with the same name
    Upload {
        /// Files to upload
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// List uploaded files, most recent first
    List {
        #[arg(long, default_value_t = 0)]
        offset: u32,
        #[arg(long, default_value_t = Page::DEFAULT_LIMIT)]
        limit: u32,
        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a file and all of its chunks and vectors
    Delete {
        /// File ID or uploaded file name
        file: String,
    },
    /// Show a chunk by ID; a unique prefix is enough
    ShowChunk { chunk_id: String },
    /// Ingest every file in a directory (defaults to the configured source_dir)
    IngestDir { dir: Option<PathBuf> },
    /// Search chunks by similarity
    Search {
        query: String,
        #[arg(long, short = 'k', default_value_t = 5)]
        top_k: usize,
    },
    /// Check the embedder, then report disagreements between the relational
    /// store and the vector store
    Check,
    /// Fix what `check` reports
    Repair,
    /// Compact the relational store and the vector store
    Optimize,
    /// Record the chunks of the vector index as an index struct
    SnapshotIndex {
        #[arg(default_value = "default")]
        index_id: String,
    },
    /// Show the configuration
    Config {
        /// Write a default config.toml to the storage root
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(resolve_root(cli.root)?)?;

    match cli.command {
        Commands::Upload { paths, json } => {
            upload_files(&config, &paths, json).await?;
        }
        Commands::List {
            offset,
            limit,
            json,
        } => {
            list_files(&config, Page::new(offset, limit), json).await?;
        }
        Commands::Delete { file } => {
            delete_file(&config, &file).await?;
        }
        Commands::ShowChunk { chunk_id } => {
            show_chunk(&config, &chunk_id).await?;
        }
        Commands::IngestDir { dir } => {
            ingest_directory(&config, dir.as_deref()).await?;
        }
        Commands::Search { query, top_k } => {
            search(&config, &query, top_k).await?;
        }
        Commands::Check => {
            check(&config).await?;
        }
        Commands::Repair => {
            repair(&config).await?;
        }
        Commands::Optimize => {
            optimize(&config).await?;
        }
        Commands::SnapshotIndex { index_id } => {
            snapshot_index(&config, &index_id).await?;
        }
        Commands::Config { init } => {
            show_config(&config, init)?;
        }
    }

    Ok(())
}
