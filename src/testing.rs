//! Deterministic backends for unit tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};
use crate::generation::{GenerationRequest, LanguageModel, TokenStream};

const DIMENSION: usize = 256;

/// Hashing bag-of-words embedding.
///
/// Texts sharing words get similar vectors. Any text containing the
/// configured marker fails as if the backend were down.
pub struct HashEmbedding {
    unreachable_marker: Option<String>,
    calls: AtomicUsize,
}

impl HashEmbedding {
    pub fn new() -> Self {
        Self {
            unreachable_marker: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn unreachable_on(marker: &str) -> Self {
        Self {
            unreachable_marker: Some(marker.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn hash_vector(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0; DIMENSION];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        // FNV-1a
        let hash = word
            .to_lowercase()
            .bytes()
            .fold(0xcbf29ce484222325u64, |h, b| (h ^ b as u64).wrapping_mul(0x100000001b3));
        vector[(hash % DIMENSION as u64) as usize] += 1.0;
    }
    vector
}

#[async_trait]
impl EmbeddingProvider for HashEmbedding {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(marker) = &self.unreachable_marker {
            if texts.iter().any(|t| t.contains(marker.as_str())) {
                return Err(RagError::ModelUnavailable("connection refused".into()));
            }
        }
        Ok(texts.iter().map(|t| hash_vector(t)).collect())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "hash-embedding"
    }
}

/// Hashing embedding that parks any batch containing a marker until released
pub struct GatedEmbedding {
    inner: HashEmbedding,
    marker: String,
    entered: Notify,
    release: Notify,
}

impl GatedEmbedding {
    pub fn new(marker: &str) -> Self {
        Self {
            inner: HashEmbedding::new(),
            marker: marker.to_string(),
            entered: Notify::new(),
            release: Notify::new(),
        }
    }

    /// Resolves once a marked batch is waiting
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[async_trait]
impl EmbeddingProvider for GatedEmbedding {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.iter().any(|t| t.contains(self.marker.as_str())) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.embed_batch(texts).await
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "gated-embedding"
    }
}

/// Language model replaying a fixed token script
pub struct ScriptedModel {
    tokens: Vec<String>,
    available: bool,
    last_request: Mutex<Option<GenerationRequest>>,
}

impl ScriptedModel {
    pub fn new(tokens: &[&str]) -> Self {
        Self {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            available: true,
            last_request: Mutex::new(None),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new(&[])
        }
    }

    pub fn last_request(&self) -> Option<GenerationRequest> {
        self.last_request.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn generate_stream(&self, request: GenerationRequest) -> Result<TokenStream> {
        *self.last_request.lock().unwrap() = Some(request);
        if !self.available {
            return Err(RagError::GenerationUnavailable("connection refused".into()));
        }
        Ok(TokenStream::from_results(
            self.tokens.iter().cloned().map(Ok).collect(),
        ))
    }

    async fn health_check(&self, _model: &str) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(RagError::GenerationUnavailable("connection refused".into()))
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
