//! Vector Store - trait and shared ranking utilities
//!
//! Stores are keyed by chunk id and hold `(vector, text, metadata)`. Similarity
//! is cosine similarity; equal scores are ordered by insertion sequence.

use std::cmp::Ordering;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

// ============================================================================
// Types
// ============================================================================

/// Per-entry metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub source_path: String,
    /// Document format name
    pub format: String,
    /// Content hash of the source document; empty for partially indexed documents
    pub content_hash: String,
    /// Source modification time (unix seconds)
    pub mtime: i64,
    pub start_offset: usize,
    pub end_offset: usize,
}

/// One persisted chunk (insert form)
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub chunk_id: String,
    pub document_id: String,
    pub sequence_index: u32,
    pub text: String,
    pub vector: Vec<f32>,
    pub metadata: EntryMetadata,
}

/// A retrieved chunk
#[derive(Debug, Clone, PartialEq)]
pub struct StoredChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub sequence_index: u32,
    pub text: String,
    pub metadata: EntryMetadata,
    /// Insertion sequence assigned by the store
    pub seq: u64,
}

/// Search hit
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: StoredChunk,
    /// Cosine similarity (-1.0 ~ 1.0)
    pub similarity_score: f32,
}

/// Hits ordered by descending score, at most `k` long
pub type RetrievalResult = Vec<ScoredChunk>;

// ============================================================================
// VectorStore Trait
// ============================================================================

/// Persistent chunk-vector store.
///
/// A completed `upsert`/`delete`/`truncate` is visible to every later `search`.
/// Readers never observe a partially written entry.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace entries by chunk id
    async fn upsert(&self, entries: &[IndexEntry]) -> Result<usize>;

    /// Remove every entry of a document
    async fn delete(&self, document_id: &str) -> Result<usize>;

    /// Remove a document's entries with `sequence_index >= keep`
    async fn truncate(&self, document_id: &str, keep: u32) -> Result<usize>;

    /// Top-k entries by cosine similarity, filtered to `score >= threshold`
    async fn search(
        &self,
        query_vector: &[f32],
        k: usize,
        threshold: Option<f32>,
    ) -> Result<RetrievalResult>;

    /// Number of entries
    async fn count(&self) -> Result<usize>;

    /// Number of entries stored for the document
    async fn chunk_count(&self, document_id: &str) -> Result<usize>;

    /// Whether any entry belongs to the document
    async fn exists(&self, document_id: &str) -> Result<bool> {
        Ok(self.chunk_count(document_id).await? > 0)
    }

    /// Stored content hash of a fully indexed document
    async fn fingerprint(&self, document_id: &str) -> Result<Option<String>>;

    /// Distinct document ids in the store
    async fn document_ids(&self) -> Result<Vec<String>>;

    /// Drop every entry
    async fn clear(&self) -> Result<()>;
}

// ============================================================================
// Utility Functions
// ============================================================================

/// Cosine similarity of two vectors (-1.0 ~ 1.0).
///
/// Mismatched lengths, empty vectors and zero vectors score 0.0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// Score order: descending similarity, then ascending insertion sequence
fn rank_order(a: &ScoredChunk, b: &ScoredChunk) -> Ordering {
    b.similarity_score
        .total_cmp(&a.similarity_score)
        .then_with(|| a.chunk.seq.cmp(&b.chunk.seq))
}

/// Apply threshold, deterministic ordering and the `k` cut
pub fn rank(mut candidates: Vec<ScoredChunk>, k: usize, threshold: Option<f32>) -> RetrievalResult {
    if let Some(threshold) = threshold {
        candidates.retain(|c| c.similarity_score >= threshold);
    }
    candidates.retain(|c| !c.similarity_score.is_nan());
    candidates.sort_by(rank_order);
    candidates.truncate(k);
    candidates
}

// ============================================================================
// Tests
// ============================================================================
