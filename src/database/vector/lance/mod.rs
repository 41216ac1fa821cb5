
use arrow::array::{
    Array, FixedSizeListArray, Float32Array, Int64Array, RecordBatchIterator, StringArray,
    UInt32Array,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use lancedb::{Connection, Table};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{BackendError, RankedMatch, VectorBackend, VectorMatch, VectorRecord, rank_matches};
use crate::EngineError;

const MAX_IDS_PER_PREDICATE: usize = 500;

#[derive(Clone)]
struct OpenTable {
    table: Table,
    dimension: usize,
}

/// Vector backend on a LanceDB directory, one table per collection.
///
/// The table is created on the first upsert using that batch's vector
/// dimension. Later writes with another dimension are rejected rather than
/// recreating the table.
pub struct LanceVectorStore {
    connection: Connection,
    path: PathBuf,
    table_name: String,
    table: Mutex<Option<OpenTable>>,
    next_seq: AtomicI64,
}

impl std::fmt::Debug for LanceVectorStore {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanceVectorStore")
            .field("path", &self.path)
            .field("table_name", &self.table_name)
            .finish_non_exhaustive()
    }
}

fn transient(context: &str, err: impl std::error::Error + Send + Sync + 'static) -> BackendError {
    BackendError::Transient(anyhow::Error::new(err).context(context.to_string()))
}

fn classify(context: &str, err: lancedb::Error) -> BackendError {
    match err {
        lancedb::Error::InvalidInput { .. } | lancedb::Error::Schema { .. } => {
            BackendError::Rejected(anyhow::Error::new(err).context(context.to_string()))
        }
        other => transient(context, other),
    }
}

fn quote(id: &str) -> String {
    format!("'{}'", id.replace('\'', "''"))
}

/// `id IN (...)` predicates, at most [`MAX_IDS_PER_PREDICATE`] ids each
fn id_predicates(chunk_ids: &[String]) -> Vec<String> {
    chunk_ids
        .chunks(MAX_IDS_PER_PREDICATE)
        .map(|batch| {
            let ids: Vec<String> = batch.iter().map(|id| quote(id)).collect();
            format!("id IN ({})", ids.join(", "))
        })
        .collect()
}

fn create_schema(vector_dim: usize) -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new(
            "vector",
            DataType::FixedSizeList(
                Arc::new(Field::new("item", DataType::Float32, false)),
                vector_dim as i32,
            ),
            false,
        ),
        Field::new("file_id", DataType::Utf8, false),
        Field::new("chunk_index", DataType::UInt32, false),
        Field::new("content", DataType::Utf8, false),
        Field::new("seq", DataType::Int64, false),
    ]))
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray, BackendError> {
    batch
        .column_by_name(name)
        .ok_or_else(|| BackendError::rejected(format!("Missing {name} column")))?
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| BackendError::rejected(format!("Invalid {name} column type")))
}

impl LanceVectorStore {
    /// Connect to the LanceDB directory at `path`, creating it if needed
    ///
    /// # Arguments
    /// * `path` - Directory holding the LanceDB tables
    /// * `collection` - Table name for this store
    #[inline]
    pub async fn open<P: AsRef<Path>>(path: P, collection: &str) -> crate::Result<Self> {
        let path = path.as_ref().to_path_buf();
        debug!("Initializing LanceDB at path: {:?}", path);

        std::fs::create_dir_all(&path)?;

        let connection = lancedb::connect(&path.to_string_lossy())
            .execute()
            .await
            .map_err(|e| {
                EngineError::VectorStoreUnavailable(format!("Failed to connect to LanceDB: {e}"))
            })?;

        let store = Self {
            connection,
            path,
            table_name: collection.to_string(),
            table: Mutex::new(None),
            next_seq: AtomicI64::new(chrono::Utc::now().timestamp_micros()),
        };

        let existing = store
            .existing_table()
            .await
            .map_err(|e| EngineError::VectorStore(e.to_string()))?;
        if let Some(open) = existing {
            info!(
                "Opened vector table {} with {} dimensions",
                store.table_name, open.dimension
            );
        }

        Ok(store)
    }

    #[inline]
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Vector dimension of the table, once it exists
    #[inline]
    pub async fn dimension(&self) -> Option<usize> {
        self.table.lock().await.as_ref().map(|open| open.dimension)
    }

    async fn existing_table(&self) -> Result<Option<OpenTable>, BackendError> {
        let mut slot = self.table.lock().await;
        if let Some(open) = slot.as_ref() {
            return Ok(Some(open.clone()));
        }

        let table_names = self
            .connection
            .table_names()
            .execute()
            .await
            .map_err(|e| classify("Failed to list tables", e))?;
        if !table_names.contains(&self.table_name) {
            return Ok(None);
        }

        let table = self
            .connection
            .open_table(&self.table_name)
            .execute()
            .await
            .map_err(|e| classify("Failed to open table", e))?;
        let dimension = Self::detect_vector_dimension(&table).await?;

        let open = OpenTable { table, dimension };
        *slot = Some(open.clone());
        Ok(Some(open))
    }

    async fn table_for_write(&self, dimension: usize) -> Result<OpenTable, BackendError> {
        if let Some(open) = self.existing_table().await? {
            if open.dimension != dimension {
                return Err(BackendError::rejected(format!(
                    "vectors have dimension {dimension}, table {} uses {}",
                    self.table_name, open.dimension
                )));
            }
            return Ok(open);
        }

        let mut slot = self.table.lock().await;
        if let Some(open) = slot.as_ref() {
            if open.dimension != dimension {
                return Err(BackendError::rejected(format!(
                    "vectors have dimension {dimension}, table {} uses {}",
                    self.table_name, open.dimension
                )));
            }
            return Ok(open.clone());
        }

        info!(
            "Creating vector table {} with {} dimensions",
            self.table_name, dimension
        );
        let table = self
            .connection
            .create_empty_table(&self.table_name, create_schema(dimension))
            .execute()
            .await
            .map_err(|e| classify("Failed to create table", e))?;

        let open = OpenTable { table, dimension };
        *slot = Some(open.clone());
        Ok(open)
    }

    async fn detect_vector_dimension(table: &Table) -> Result<usize, BackendError> {
        let schema = table
            .schema()
            .await
            .map_err(|e| classify("Failed to get table schema", e))?;

        for field in schema.fields() {
            if field.name() == "vector" {
                if let DataType::FixedSizeList(_, size) = field.data_type() {
                    return Ok(*size as usize);
                }
            }
        }

        Err(BackendError::rejected(
            "Could not find vector column or determine dimension",
        ))
    }

    fn create_record_batch(
        &self,
        records: &[VectorRecord],
        vector_dim: usize,
    ) -> Result<RecordBatch, BackendError> {
        let len = records.len();
        let mut ids = Vec::with_capacity(len);
        let mut flat_values = Vec::with_capacity(len * vector_dim);
        let mut file_ids = Vec::with_capacity(len);
        let mut chunk_indices = Vec::with_capacity(len);
        let mut contents = Vec::with_capacity(len);
        let mut seqs = Vec::with_capacity(len);

        for record in records {
            ids.push(record.chunk_id.as_str());
            flat_values.extend_from_slice(&record.vector);
            file_ids.push(record.payload.file_id.as_str());
            chunk_indices.push(record.payload.chunk_index);
            contents.push(record.payload.text.as_str());
            seqs.push(self.next_seq.fetch_add(1, Ordering::SeqCst));
        }

        let field = Arc::new(Field::new("item", DataType::Float32, false));
        let vector_array = FixedSizeListArray::try_new(
            field,
            vector_dim as i32,
            Arc::new(Float32Array::from(flat_values)),
            None,
        )
        .map_err(|e| {
            BackendError::Rejected(anyhow::Error::new(e).context("Failed to create vector array"))
        })?;

        let arrays: Vec<Arc<dyn Array>> = vec![
            Arc::new(StringArray::from(ids)),
            Arc::new(vector_array),
            Arc::new(StringArray::from(file_ids)),
            Arc::new(UInt32Array::from(chunk_indices)),
            Arc::new(StringArray::from(contents)),
            Arc::new(Int64Array::from(seqs)),
        ];

        RecordBatch::try_new(create_schema(vector_dim), arrays).map_err(|e| {
            BackendError::Rejected(anyhow::Error::new(e).context("Failed to create record batch"))
        })
    }

    fn parse_matches(batch: &RecordBatch) -> Result<Vec<RankedMatch>, BackendError> {
        let ids = string_column(batch, "id")?;
        let seqs = batch
            .column_by_name("seq")
            .and_then(|col| col.as_any().downcast_ref::<Int64Array>());
        let distances = batch
            .column_by_name("_distance")
            .and_then(|col| col.as_any().downcast_ref::<Float32Array>());

        let mut matches = Vec::with_capacity(batch.num_rows());
        for row in 0..batch.num_rows() {
            let distance =
                distances.map_or(0.0, |d| if d.is_null(row) { 0.0 } else { d.value(row) });
            let seq = seqs.map_or(0, |s| if s.is_null(row) { 0 } else { s.value(row) });

            // distance is non-negative, so the score lands in (0, 1]
            matches.push(RankedMatch {
                chunk_id: ids.value(row).to_string(),
                score: 1.0 / (1.0 + distance.max(0.0)),
                seq,
            });
        }

        Ok(matches)
    }
}

#[async_trait]
impl VectorBackend for LanceVectorStore {
    #[inline]
    fn name(&self) -> &str {
        "lancedb"
    }

    #[inline]
    async fn upsert(&self, records: &[VectorRecord]) -> Result<(), BackendError> {
        let Some(first) = records.first() else {
            return Ok(());
        };

        let vector_dim = first.vector.len();
        if vector_dim == 0 {
            return Err(BackendError::rejected("vectors must not be empty"));
        }
        if let Some(bad) = records.iter().find(|r| r.vector.len() != vector_dim) {
            return Err(BackendError::rejected(format!(
                "vector for {} has dimension {}, batch uses {}",
                bad.chunk_id,
                bad.vector.len(),
                vector_dim
            )));
        }

        let open = self.table_for_write(vector_dim).await?;
        let record_batch = self.create_record_batch(records, vector_dim)?;

        let ids: Vec<String> = records.iter().map(|r| r.chunk_id.clone()).collect();
        for predicate in id_predicates(&ids) {
            open.table
                .delete(&predicate)
                .await
                .map_err(|e| classify("Failed to replace existing vectors", e))?;
        }

        let schema = record_batch.schema();
        let reader = RecordBatchIterator::new(std::iter::once(Ok(record_batch)), schema);
        open.table
            .add(reader)
            .execute()
            .await
            .map_err(|e| classify("Failed to insert vectors", e))?;

        debug!("Stored {} vectors in {}", records.len(), self.table_name);
        Ok(())
    }

    #[inline]
    async fn delete(&self, chunk_ids: &[String]) -> Result<(), BackendError> {
        if chunk_ids.is_empty() {
            return Ok(());
        }
        let Some(open) = self.existing_table().await? else {
            return Ok(());
        };

        for predicate in id_predicates(chunk_ids) {
            open.table
                .delete(&predicate)
                .await
                .map_err(|e| classify("Failed to delete vectors", e))?;
        }

        debug!(
            "Deleted up to {} vectors from {}",
            chunk_ids.len(),
            self.table_name
        );
        Ok(())
    }

    #[inline]
    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<VectorMatch>, BackendError> {
        let Some(open) = self.existing_table().await? else {
            return Ok(Vec::new());
        };
        if vector.len() != open.dimension {
            return Err(BackendError::rejected(format!(
                "query dimension {} does not match table dimension {}",
                vector.len(),
                open.dimension
            )));
        }

        let stream = open
            .table
            .vector_search(vector)
            .map_err(|e| classify("Failed to create vector search", e))?
            .column("vector")
            .select(Select::Columns(vec!["id".to_string(), "seq".to_string()]))
            .limit(top_k)
            .execute()
            .await
            .map_err(|e| classify("Failed to execute search", e))?;

        let batches: Vec<RecordBatch> = stream
            .try_collect()
            .await
            .map_err(|e| classify("Failed to read result stream", e))?;

        let mut matches = Vec::new();
        for batch in &batches {
            matches.extend(Self::parse_matches(batch)?);
        }

        Ok(rank_matches(matches, top_k))
    }

    #[inline]
    async fn count(&self) -> Result<u64, BackendError> {
        let Some(open) = self.existing_table().await? else {
            return Ok(0);
        };

        let count = open
            .table
            .count_rows(None)
            .await
            .map_err(|e| classify("Failed to count rows", e))?;
        Ok(count as u64)
    }

    #[inline]
    async fn list_ids(&self) -> Result<Vec<String>, BackendError> {
        let Some(open) = self.existing_table().await? else {
            return Ok(Vec::new());
        };

        let count = open
            .table
            .count_rows(None)
            .await
            .map_err(|e| classify("Failed to count rows", e))?;
        if count == 0 {
            return Ok(Vec::new());
        }

        let stream = open
            .table
            .query()
            .select(Select::Columns(vec!["id".to_string()]))
            .limit(count)
            .execute()
            .await
            .map_err(|e| classify("Failed to scan vector ids", e))?;

        let batches: Vec<RecordBatch> = stream
            .try_collect()
            .await
            .map_err(|e| classify("Failed to read id stream", e))?;

        let mut ids = Vec::with_capacity(count);
        for batch in &batches {
            let column = string_column(batch, "id")?;
            ids.extend((0..batch.num_rows()).map(|row| column.value(row).to_string()));
        }
        ids.sort();
        Ok(ids)
    }

    /// Compact the table files and prune old versions
    #[inline]
    async fn optimize(&self) -> Result<(), BackendError> {
        let Some(open) = self.existing_table().await? else {
            return Ok(());
        };

        open.table
            .optimize(lancedb::table::OptimizeAction::All)
            .await
            .map_err(|e| classify("Failed to optimize table", e))?;
        info!("Vector table {} optimized", self.table_name);
        Ok(())
    }
}
