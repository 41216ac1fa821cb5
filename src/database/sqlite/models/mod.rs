
use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::{FromRow, Type};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct FileRecord {
    pub file_id: String,
    pub name: String,
    pub size: i64,
    pub media_type: String,
    pub content_hash: String,
    pub path: Option<String>,
    pub status: FileStatus,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl FileRecord {
    #[inline]
    pub fn is_indexed(&self) -> bool {
        self.status == FileStatus::Indexed
    }
}

/// A file row is `pending` from the moment its chunks are written until every
/// chunk has a vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Indexed,
}

impl std::fmt::Display for FileStatus {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            FileStatus::Pending => write!(f, "pending"),
            FileStatus::Indexed => write!(f, "indexed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFile {
    pub file_id: String,
    pub name: String,
    pub size: i64,
    pub media_type: String,
    pub content_hash: String,
    pub path: Option<String>,
    /// Creation time carried over from a replaced version of the same file
    pub created_at: Option<NaiveDateTime>,
}

/// Serialized text plus free-form metadata of a chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ChunkPayload {
    pub text: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub file_id: String,
    pub chunk_index: i64,
    pub content_hash: Option<String>,
    pub payload: ChunkPayload,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewChunk {
    pub chunk_id: String,
    pub file_id: String,
    pub chunk_index: i64,
    pub content_hash: Option<String>,
    pub payload: ChunkPayload,
}

/// Chunk id with the owner and status of its file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ChunkRef {
    pub chunk_id: String,
    pub file_id: String,
    pub status: FileStatus,
}

/// What `delete_chunks_of_file` removed
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeletedChunks {
    pub chunk_ids: Vec<String>,
    pub files_removed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: u32,
    pub limit: u32,
}

impl Page {
    pub const DEFAULT_LIMIT: u32 = 100;

    #[inline]
    pub const fn new(offset: u32, limit: u32) -> Self {
        Self { offset, limit }
    }

    #[inline]
    pub const fn first(limit: u32) -> Self {
        Self { offset: 0, limit }
    }
}

impl Default for Page {
    #[inline]
    fn default() -> Self {
        Self::first(Self::DEFAULT_LIMIT)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStruct {
    pub index_id: String,
    pub summary: Option<String>,
    pub data: IndexStructData,
}

/// Retrieval-index bookkeeping, tagged by `kind` when stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndexStructData {
    /// Chunk id to owning file id, for every chunk in the index
    VectorIndex { nodes: BTreeMap<String, String> },
    /// Ordered chunk ids
    List { nodes: Vec<String> },
    /// Keyword to the chunk ids mentioning it
    KeywordTable { table: BTreeMap<String, Vec<String>> },
    Empty,
    /// A stored payload this version cannot read, kept verbatim
    #[serde(skip)]
    Unknown { kind: String, raw: Vec<u8> },
}

impl IndexStructData {
    #[inline]
    pub fn kind(&self) -> &str {
        match self {
            IndexStructData::VectorIndex { .. } => "vector_index",
            IndexStructData::List { .. } => "list",
            IndexStructData::KeywordTable { .. } => "keyword_table",
            IndexStructData::Empty => "empty",
            IndexStructData::Unknown { kind, .. } => kind,
        }
    }

    #[inline]
    pub const fn is_unknown(&self) -> bool {
        matches!(self, IndexStructData::Unknown { .. })
    }

    /// Stored form; unknown payloads are written back exactly as read
    #[inline]
    pub fn encode(&self) -> serde_json::Result<String> {
        match self {
            IndexStructData::Unknown { raw, .. } => Ok(String::from_utf8_lossy(raw).into_owned()),
            known => serde_json::to_string(known),
        }
    }

    /// Decode a stored payload, falling back to `Unknown` instead of failing
    #[inline]
    pub fn decode(kind: &str, raw: &str) -> Result<Self, (Self, serde_json::Error)> {
        serde_json::from_str::<Self>(raw).map_err(|e| {
            (
                IndexStructData::Unknown {
                    kind: kind.to_string(),
                    raw: raw.as_bytes().to_vec(),
                },
                e,
            )
        })
    }
}
