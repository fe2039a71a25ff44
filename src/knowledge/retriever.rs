//! Retriever - query text to ranked chunks

use std::sync::Arc;

use super::vector::{RetrievalResult, VectorStore};
use crate::embedding::Embedder;
use crate::error::Result;

/// Embeds a query and searches the store
#[derive(Clone)]
pub struct Retriever {
    embedder: Embedder,
    store: Arc<dyn VectorStore>,
}

impl Retriever {
    pub fn new(embedder: Embedder, store: Arc<dyn VectorStore>) -> Self {
        Self { embedder, store }
    }

    /// Top `k` chunks for `query`, best first.
    ///
    /// An empty store yields an empty result without calling the embedder.
    pub async fn retrieve(
        &self,
        query: &str,
        k: usize,
        threshold: Option<f32>,
    ) -> Result<RetrievalResult> {
        if k == 0 || self.store.count().await? == 0 {
            return Ok(vec![]);
        }

        let query_vector = self.embedder.embed_query(query).await?;
        let results = self.store.search(&query_vector, k, threshold).await?;
        tracing::debug!("Retrieved {} chunks for query ({} chars)", results.len(), query.len());
        Ok(results)
    }
}
