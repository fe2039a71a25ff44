//! In-process vector store
//!
//! Exhaustive cosine search over a `BTreeMap` guarded by an `RwLock`. The write
//! lock is held for one batch, so readers see whole batches only. Nothing is
//! persisted; used for ephemeral knowledge bases and tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::vector::{
    cosine_similarity, rank, IndexEntry, RetrievalResult, ScoredChunk, StoredChunk, VectorStore,
};
use crate::error::Result;

struct Row {
    chunk: StoredChunk,
    vector: Vec<f32>,
}

#[derive(Default)]
pub struct MemoryVectorStore {
    rows: RwLock<BTreeMap<String, Row>>,
    next_seq: AtomicU64,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn remove_where(&self, pred: impl Fn(&StoredChunk) -> bool) -> usize {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|_, row| !pred(&row.chunk));
        before - rows.len()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert(&self, entries: &[IndexEntry]) -> Result<usize> {
        let mut rows = self.rows.write().await;
        for entry in entries {
            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            rows.insert(
                entry.chunk_id.clone(),
                Row {
                    chunk: StoredChunk {
                        chunk_id: entry.chunk_id.clone(),
                        document_id: entry.document_id.clone(),
                        sequence_index: entry.sequence_index,
                        text: entry.text.clone(),
                        metadata: entry.metadata.clone(),
                        seq,
                    },
                    vector: entry.vector.clone(),
                },
            );
        }
        Ok(entries.len())
    }

    async fn delete(&self, document_id: &str) -> Result<usize> {
        Ok(self.remove_where(|c| c.document_id == document_id).await)
    }

    async fn truncate(&self, document_id: &str, keep: u32) -> Result<usize> {
        Ok(self
            .remove_where(|c| c.document_id == document_id && c.sequence_index >= keep)
            .await)
    }

    async fn search(
        &self,
        query_vector: &[f32],
        k: usize,
        threshold: Option<f32>,
    ) -> Result<RetrievalResult> {
        let rows = self.rows.read().await;
        let candidates = rows
            .values()
            .map(|row| ScoredChunk {
                chunk: row.chunk.clone(),
                similarity_score: cosine_similarity(query_vector, &row.vector),
            })
            .collect();
        Ok(rank(candidates, k, threshold))
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.rows.read().await.len())
    }

    async fn chunk_count(&self, document_id: &str) -> Result<usize> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .filter(|row| row.chunk.document_id == document_id)
            .count())
    }

    async fn fingerprint(&self, document_id: &str) -> Result<Option<String>> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .find(|row| row.chunk.document_id == document_id && row.chunk.sequence_index == 0)
            .map(|row| row.chunk.metadata.content_hash.clone())
            .filter(|h| !h.is_empty()))
    }

    async fn document_ids(&self) -> Result<Vec<String>> {
        let rows = self.rows.read().await;
        let ids: BTreeSet<&str> = rows.values().map(|r| r.chunk.document_id.as_str()).collect();
        Ok(ids.into_iter().map(str::to_string).collect())
    }

    async fn clear(&self) -> Result<()> {
        self.rows.write().await.clear();
        Ok(())
    }
}
