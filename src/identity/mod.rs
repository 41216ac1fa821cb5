//! Identifier and ordering scheme.
//!
//! A file's id is derived from its normalised name only, so re-uploading the
//! same name always lands on the same id. Chunk ids are fresh on every
//! ingestion and never derived from content or position. Chunk positions are
//! assigned per file, starting at zero, as the final edit to a chunk before it
//! is handed to the stores.


use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::database::sqlite::models::{ChunkPayload, NewChunk};
use crate::{EngineError, Result};

pub const FILE_ID_PREFIX: &str = "file_";
const FILE_ID_HEX_LEN: usize = 16;

/// Metadata key holding a chunk's position within its file
pub const CHUNK_INDEX_KEY: &str = "chunk_index";
/// Metadata key holding the owning file id
pub const FILE_ID_KEY: &str = "file_id";

/// Name a file is stored and listed under: the final path component with
/// surrounding whitespace trimmed. Casing is kept.
#[inline]
pub fn display_file_name(name: &str) -> Result<String> {
    let last = name.rsplit(['/', '\\']).next().unwrap_or(name).trim();

    if last.is_empty() || last == "." || last == ".." {
        return Err(EngineError::InvalidFileName(name.to_string()));
    }

    Ok(last.to_string())
}

/// Reduce an uploaded name to the form that identifies the logical file:
/// the display name, ASCII lowercased.
#[inline]
pub fn normalize_file_name(name: &str) -> Result<String> {
    display_file_name(name).map(|last| last.to_ascii_lowercase())
}

/// `file_` followed by the first 16 hex digits of SHA-256 over the normalised name
#[inline]
pub fn derive_file_id(name: &str) -> Result<String> {
    let normalized = normalize_file_name(name)?;
    let digest = hex_digest(normalized.as_bytes());
    Ok(format!("{FILE_ID_PREFIX}{}", &digest[..FILE_ID_HEX_LEN]))
}

#[inline]
pub fn new_chunk_id() -> String {
    Uuid::new_v4().to_string()
}

/// Lowercase hex SHA-256, used for content hashes
#[inline]
pub fn hex_digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// A split chunk with its metadata attached but no identity yet
#[derive(Debug, Clone, PartialEq)]
pub struct DraftChunk {
    pub text: String,
    pub metadata: Map<String, Value>,
}

/// Give every draft a fresh chunk id and its zero-based position in split order.
///
/// Position and owner are written last, overwriting whatever the metadata
/// carried before, and the result is what gets persisted.
#[inline]
pub fn assign_chunk_indices(file_id: &str, drafts: Vec<DraftChunk>) -> Vec<NewChunk> {
    drafts
        .into_iter()
        .enumerate()
        .map(|(index, draft)| {
            let DraftChunk { text, mut metadata } = draft;
            let content_hash = hex_digest(text.as_bytes());

            metadata.insert(FILE_ID_KEY.to_string(), Value::from(file_id));
            metadata.insert(CHUNK_INDEX_KEY.to_string(), Value::from(index));

            NewChunk {
                chunk_id: new_chunk_id(),
                file_id: file_id.to_string(),
                chunk_index: index as i64,
                content_hash: Some(content_hash),
                payload: ChunkPayload { text, metadata },
            }
        })
        .collect()
}
