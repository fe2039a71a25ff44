//! LanceDB Vector Store - persistent chunk index
//!
//! One table, one row per chunk, keyed by `chunk_id`. Every upsert is a single
//! `merge_insert` commit, so a concurrent reader sees either the previous
//! version of the table or the new one, never half a batch.
//! ref: https://lancedb.github.io/lancedb/

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use arrow_array::{
    Array, FixedSizeListArray, Float32Array, Int32Array, Int64Array, RecordBatch,
    RecordBatchIterator, StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::connection::Connection;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use lancedb::table::Table;
use lancedb::DistanceType;
use tokio::sync::Mutex;

use super::vector::{
    rank, EntryMetadata, IndexEntry, RetrievalResult, ScoredChunk, StoredChunk, VectorStore,
};
use crate::error::{RagError, Result};

/// Chunk table name
const TABLE_NAME: &str = "chunks";

/// Extra candidates in the first fetch; ties at the cutoff widen it further
const OVERFETCH: usize = 32;

// ============================================================================
// LanceVectorStore
// ============================================================================

/// LanceDB-backed [`VectorStore`]
///
/// The vector dimension is taken from the first batch written and checked on
/// every later write.
pub struct LanceVectorStore {
    db: Connection,
    /// Next insertion sequence number
    next_seq: AtomicI64,
    /// Single writer; held for one batch at a time
    write_lock: Mutex<()>,
}

impl LanceVectorStore {
    /// Open (or create) the store at `path`
    ///
    /// # Arguments
    /// * `path` - .lance directory path
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    RagError::Store(format!("cannot create {}: {}", parent.display(), e))
                })?;
            }
        }

        let path_str = path
            .to_str()
            .ok_or_else(|| RagError::Store(format!("invalid path encoding: {:?}", path)))?;

        let db = lancedb::connect(path_str).execute().await?;

        let store = Self {
            db,
            next_seq: AtomicI64::new(0),
            write_lock: Mutex::new(()),
        };

        let max_seq = store.max_seq().await?;
        store.next_seq.store(max_seq + 1, Ordering::SeqCst);
        tracing::debug!("Opened LanceDB index at {:?} (next seq {})", path, max_seq + 1);

        Ok(store)
    }

    /// Chunk table schema for a given vector dimension
    fn create_schema(dimension: i32) -> Schema {
        Schema::new(vec![
            Field::new("chunk_id", DataType::Utf8, false),
            Field::new("document_id", DataType::Utf8, false),
            Field::new("sequence_index", DataType::Int32, false),
            Field::new("text", DataType::Utf8, false),
            Field::new("source_path", DataType::Utf8, false),
            Field::new("format", DataType::Utf8, false),
            Field::new("content_hash", DataType::Utf8, false),
            Field::new("start_offset", DataType::Int64, false),
            Field::new("end_offset", DataType::Int64, false),
            Field::new("mtime", DataType::Int64, false),
            Field::new("seq", DataType::Int64, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    dimension,
                ),
                false,
            ),
        ])
    }

    /// Convert entries to one Arrow RecordBatch, assigning insertion sequence numbers
    fn entries_to_batch(&self, entries: &[IndexEntry]) -> Result<RecordBatch> {
        let dimension = entries[0].vector.len();
        if dimension == 0 {
            return Err(RagError::Store("cannot index an empty vector".into()));
        }
        if let Some(bad) = entries.iter().find(|e| e.vector.len() != dimension) {
            return Err(RagError::Store(format!(
                "vector dimension mismatch in batch: {} has {} (expected {})",
                bad.chunk_id,
                bad.vector.len(),
                dimension
            )));
        }
        let dimension = i32::try_from(dimension)
            .map_err(|_| RagError::Store(format!("vector dimension too large: {}", dimension)))?;

        let first_seq = self
            .next_seq
            .fetch_add(entries.len() as i64, Ordering::SeqCst);

        let strings = |f: fn(&IndexEntry) -> &str| {
            Arc::new(StringArray::from(entries.iter().map(f).collect::<Vec<_>>())) as Arc<dyn Array>
        };
        let offsets = |f: fn(&IndexEntry) -> usize| {
            Arc::new(Int64Array::from(
                entries.iter().map(|e| f(e) as i64).collect::<Vec<_>>(),
            )) as Arc<dyn Array>
        };

        let vectors_flat: Vec<f32> = entries
            .iter()
            .flat_map(|e| e.vector.iter().copied())
            .collect();
        let field = Arc::new(Field::new("item", DataType::Float32, true));
        let vectors = FixedSizeListArray::try_new(
            field,
            dimension,
            Arc::new(Float32Array::from(vectors_flat)) as Arc<dyn Array>,
            None,
        )?;

        let batch = RecordBatch::try_new(
            Arc::new(Self::create_schema(dimension)),
            vec![
                strings(|e| e.chunk_id.as_str()),
                strings(|e| e.document_id.as_str()),
                Arc::new(Int32Array::from(
                    entries
                        .iter()
                        .map(|e| e.sequence_index as i32)
                        .collect::<Vec<_>>(),
                )),
                strings(|e| e.text.as_str()),
                strings(|e| e.metadata.source_path.as_str()),
                strings(|e| e.metadata.format.as_str()),
                strings(|e| e.metadata.content_hash.as_str()),
                offsets(|e| e.metadata.start_offset),
                offsets(|e| e.metadata.end_offset),
                Arc::new(Int64Array::from(
                    entries.iter().map(|e| e.metadata.mtime).collect::<Vec<_>>(),
                )),
                Arc::new(Int64Array::from(
                    (0..entries.len() as i64)
                        .map(|i| first_seq + i)
                        .collect::<Vec<_>>(),
                )),
                Arc::new(vectors),
            ],
        )?;

        Ok(batch)
    }

    /// Open the chunk table, `None` if nothing was ever written
    async fn table(&self) -> Result<Option<Table>> {
        let names = self.db.table_names().execute().await?;
        if !names.iter().any(|n| n == TABLE_NAME) {
            return Ok(None);
        }

        let table = self
            .db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(|e| RagError::StoreCorruption(format!("cannot open chunk table: {}", e)))?;
        Ok(Some(table))
    }

    /// Vector dimension of an existing table
    async fn table_dimension(table: &Table) -> Result<i32> {
        let schema = table.schema().await?;
        match schema.field_with_name("vector").map(|f| f.data_type()) {
            Ok(DataType::FixedSizeList(_, n)) => Ok(*n),
            _ => Err(RagError::StoreCorruption(
                "chunk table has no vector column".into(),
            )),
        }
    }

    async fn max_seq(&self) -> Result<i64> {
        let Some(table) = self.table().await? else {
            return Ok(-1);
        };

        let batches: Vec<RecordBatch> = table
            .query()
            .select(Select::columns(&["seq"]))
            .execute()
            .await?
            .try_collect()
            .await?;

        let mut max = -1;
        for batch in &batches {
            let seqs = int64_column(batch, "seq")?;
            max = (0..seqs.len()).map(|i| seqs.value(i)).fold(max, i64::max);
        }
        Ok(max)
    }

    /// `limit` nearest rows by cosine distance, scored as similarity
    async fn nearest(table: &Table, query_vector: &[f32], limit: usize) -> Result<Vec<ScoredChunk>> {
        let batches: Vec<RecordBatch> = table
            .vector_search(query_vector.to_vec())?
            .distance_type(DistanceType::Cosine)
            .limit(limit)
            .execute()
            .await?
            .try_collect()
            .await?;

        let mut candidates = Vec::new();
        for batch in &batches {
            let chunks = batch_to_chunks(batch)?;
            let distances = batch
                .column_by_name("_distance")
                .and_then(|c| c.as_any().downcast_ref::<Float32Array>())
                .ok_or_else(|| RagError::StoreCorruption("missing _distance column".into()))?;

            for (i, chunk) in chunks.into_iter().enumerate() {
                // cosine distance = 1 - cosine similarity
                candidates.push(ScoredChunk {
                    chunk,
                    similarity_score: 1.0 - distances.value(i),
                });
            }
        }
        Ok(candidates)
    }

    /// Rows matching `filter` for one column of strings
    async fn select_strings(
        &self,
        table: &Table,
        column: &str,
        filter: Option<String>,
        limit: Option<usize>,
    ) -> Result<Vec<String>> {
        let mut query = table.query().select(Select::columns(&[column]));
        if let Some(filter) = filter {
            query = query.only_if(filter);
        }
        if let Some(limit) = limit {
            query = query.limit(limit);
        }

        let batches: Vec<RecordBatch> = query.execute().await?.try_collect().await?;
        let mut values = Vec::new();
        for batch in &batches {
            let col = string_column(batch, column)?;
            values.extend((0..col.len()).map(|i| col.value(i).to_string()));
        }
        Ok(values)
    }
}

#[async_trait]
impl VectorStore for LanceVectorStore {
    async fn upsert(&self, entries: &[IndexEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }

        let _guard = self.write_lock.lock().await;
        let batch = self.entries_to_batch(entries)?;
        let schema = batch.schema();
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);

        match self.table().await? {
            Some(table) => {
                let dimension = Self::table_dimension(&table).await?;
                if dimension as usize != entries[0].vector.len() {
                    return Err(RagError::Store(format!(
                        "embedding dimension {} does not match the index ({}); rebuild the index",
                        entries[0].vector.len(),
                        dimension
                    )));
                }

                let mut merge = table.merge_insert(&["chunk_id"]);
                merge
                    .when_matched_update_all(None)
                    .when_not_matched_insert_all();
                merge.execute(Box::new(batches)).await?;
            }
            None => {
                self.db.create_table(TABLE_NAME, batches).execute().await?;
            }
        }

        tracing::debug!("Upserted {} entries", entries.len());
        Ok(entries.len())
    }

    async fn delete(&self, document_id: &str) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let Some(table) = self.table().await? else {
            return Ok(0);
        };

        let filter = format!("document_id = '{}'", escape(document_id));
        let count = table.count_rows(Some(filter.clone())).await?;
        if count > 0 {
            table.delete(&filter).await?;
        }
        Ok(count)
    }

    async fn truncate(&self, document_id: &str, keep: u32) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let Some(table) = self.table().await? else {
            return Ok(0);
        };

        let filter = format!(
            "document_id = '{}' AND sequence_index >= {}",
            escape(document_id),
            keep
        );
        let count = table.count_rows(Some(filter.clone())).await?;
        if count > 0 {
            table.delete(&filter).await?;
        }
        Ok(count)
    }

    async fn search(
        &self,
        query_vector: &[f32],
        k: usize,
        threshold: Option<f32>,
    ) -> Result<RetrievalResult> {
        if k == 0 || query_vector.is_empty() {
            return Ok(vec![]);
        }
        let Some(table) = self.table().await? else {
            return Ok(vec![]);
        };

        let dimension = Self::table_dimension(&table).await?;
        if dimension as usize != query_vector.len() {
            return Err(RagError::Store(format!(
                "query dimension {} does not match the index ({})",
                query_vector.len(),
                dimension
            )));
        }

        // widen while the weakest fetched row still ties with the k-th best
        let total = table.count_rows(None).await?;
        let mut limit = k.saturating_add(OVERFETCH);
        loop {
            let candidates = Self::nearest(&table, query_vector, limit).await?;
            if candidates.len() < limit || limit >= total || !ties_at_cutoff(&candidates, k) {
                return Ok(rank(candidates, k, threshold));
            }
            limit = limit.saturating_mul(2).min(total);
            tracing::debug!("Equal scores at the cutoff, widening search to {} rows", limit);
        }
    }

    async fn count(&self) -> Result<usize> {
        match self.table().await? {
            Some(table) => Ok(table.count_rows(None).await?),
            None => Ok(0),
        }
    }

    async fn chunk_count(&self, document_id: &str) -> Result<usize> {
        let Some(table) = self.table().await? else {
            return Ok(0);
        };

        let filter = format!("document_id = '{}'", escape(document_id));
        Ok(table.count_rows(Some(filter)).await?)
    }

    async fn fingerprint(&self, document_id: &str) -> Result<Option<String>> {
        let Some(table) = self.table().await? else {
            return Ok(None);
        };

        let filter = format!(
            "document_id = '{}' AND sequence_index = 0",
            escape(document_id)
        );
        let hashes = self
            .select_strings(&table, "content_hash", Some(filter), Some(1))
            .await?;
        Ok(hashes.into_iter().next().filter(|h| !h.is_empty()))
    }

    async fn document_ids(&self) -> Result<Vec<String>> {
        let Some(table) = self.table().await? else {
            return Ok(vec![]);
        };

        let ids: BTreeSet<String> = self
            .select_strings(&table, "document_id", None, None)
            .await?
            .into_iter()
            .collect();
        Ok(ids.into_iter().collect())
    }

    async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if self.table().await?.is_some() {
            self.db.drop_table(TABLE_NAME).await?;
            tracing::info!("Dropped chunk table");
        }
        Ok(())
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Escape a string literal for a LanceDB filter
fn escape(value: &str) -> String {
    value.replace('\'', "''")
}

/// Whether the last candidate scores the same as the k-th best one
fn ties_at_cutoff(candidates: &[ScoredChunk], k: usize) -> bool {
    let mut scores: Vec<f32> = candidates.iter().map(|c| c.similarity_score).collect();
    scores.sort_by(|a, b| b.total_cmp(a));
    match (scores.get(k.saturating_sub(1)), scores.last()) {
        (Some(kth), Some(last)) => kth.total_cmp(last).is_eq(),
        _ => false,
    }
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| RagError::StoreCorruption(format!("missing {} column", name)))
}

fn int64_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Int64Array> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
        .ok_or_else(|| RagError::StoreCorruption(format!("missing {} column", name)))
}

fn batch_to_chunks(batch: &RecordBatch) -> Result<Vec<StoredChunk>> {
    let chunk_ids = string_column(batch, "chunk_id")?;
    let document_ids = string_column(batch, "document_id")?;
    let texts = string_column(batch, "text")?;
    let source_paths = string_column(batch, "source_path")?;
    let formats = string_column(batch, "format")?;
    let hashes = string_column(batch, "content_hash")?;
    let starts = int64_column(batch, "start_offset")?;
    let ends = int64_column(batch, "end_offset")?;
    let mtimes = int64_column(batch, "mtime")?;
    let seqs = int64_column(batch, "seq")?;
    let sequence_indices = batch
        .column_by_name("sequence_index")
        .and_then(|c| c.as_any().downcast_ref::<Int32Array>())
        .ok_or_else(|| RagError::StoreCorruption("missing sequence_index column".into()))?;

    Ok((0..batch.num_rows())
        .map(|i| StoredChunk {
            chunk_id: chunk_ids.value(i).to_string(),
            document_id: document_ids.value(i).to_string(),
            sequence_index: sequence_indices.value(i).max(0) as u32,
            text: texts.value(i).to_string(),
            metadata: EntryMetadata {
                source_path: source_paths.value(i).to_string(),
                format: formats.value(i).to_string(),
                content_hash: hashes.value(i).to_string(),
                mtime: mtimes.value(i),
                start_offset: starts.value(i).max(0) as usize,
                end_offset: ends.value(i).max(0) as usize,
            },
            seq: seqs.value(i).max(0) as u64,
        })
        .collect())
}

// ============================================================================
// Tests
// ============================================================================
