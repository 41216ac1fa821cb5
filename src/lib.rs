use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Vector store unavailable: {0}")]
    VectorStoreUnavailable(String),

    #[error("Vector store error: {0}")]
    VectorStore(String),

    #[error("Split error: {0}")]
    Split(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Invalid file name: {0:?}")]
    InvalidFileName(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Whether this error leaves both stores untouched for the request that raised it.
    #[inline]
    #[must_use]
    pub const fn is_rejected_input(&self) -> bool {
        matches!(self, Self::Split(_) | Self::InvalidFileName(_))
    }
}

pub mod api;
pub mod commands;
pub mod config;
pub mod database;
pub mod embeddings;
pub mod identity;
pub mod indexer;
