// Database module
// Relational store (SQLite) for files, chunks and index structs; vector store for embeddings

pub mod sqlite;
pub mod vector;

pub use sqlite::*;
pub use vector::{
    BackendError, RetryPolicy, VectorBackend, VectorMatch, VectorPayload, VectorRecord,
    VectorStoreAdapter,
};
