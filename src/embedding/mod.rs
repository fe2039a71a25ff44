//! Embedding module - text vectorization through a local Ollama backend
//!
//! [`EmbeddingProvider`] is the backend seam: one HTTP call per batch, raw
//! vectors out. [`Embedder`] sits on top of it, batches by the configured
//! size, normalizes vectors to unit length and keeps one rejected input from
//! sinking the rest of its batch.
//!
//! ## Usage
//! ```rust,ignore
//! let provider = OllamaEmbedding::new(config.embedding_url()?, &config.embedding_model)?;
//! let embedder = Embedder::new(Arc::new(provider), config.embedding_batch_size);
//! let vectors = embedder.embed(&texts).await;
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::Config;
use crate::error::{RagError, Result};

/// One embedding per input, or the reason that input failed
pub type EmbeddingResults = Vec<Result<Vec<f32>>>;

// ============================================================================
// EmbeddingProvider Trait
// ============================================================================

/// Embedding backend
///
/// Implementations return exactly one vector per input, in input order, or
/// fail the whole call.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a batch of texts in one backend call
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Whether the backend is reachable and serves the model
    async fn health_check(&self) -> Result<()>;

    /// Provider name (model identifier)
    fn name(&self) -> &str;
}

// ============================================================================
// Ollama Embedding
// ============================================================================

/// Request timeout for one embedding batch
const EMBED_TIMEOUT: Duration = Duration::from_secs(120);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Ollama `/api/embed` client
#[derive(Debug, Clone)]
pub struct OllamaEmbedding {
    base_url: Url,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<ModelTag>,
}

#[derive(Debug, Deserialize)]
struct ModelTag {
    name: String,
}

impl OllamaEmbedding {
    /// # Arguments
    /// * `base_url` - Ollama server URL (e.g. `http://localhost:11434`)
    /// * `model` - embedding model identifier
    pub fn new(base_url: Url, model: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(EMBED_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| RagError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: api_base(base_url),
            model: model.into(),
            client,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.embedding_url()?, config.embedding_model.clone())
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| RagError::Config(format!("invalid embedding URL: {}", e)))
    }
}

/// `base_url` with a trailing slash, so relative joins keep any path prefix
pub(crate) fn api_base(mut base_url: Url) -> Url {
    if !base_url.path().ends_with('/') {
        let path = format!("{}/", base_url.path());
        base_url.set_path(&path);
    }
    base_url
}

/// Transport failures mean the backend is down
fn unavailable(e: reqwest::Error) -> RagError {
    RagError::ModelUnavailable(e.to_string())
}

/// Whether a tag list serves `model` (a bare name matches its `:latest` tag)
pub(crate) fn serves_model(tags: &[String], model: &str) -> bool {
    tags.iter().any(|name| {
        name == model || (!model.contains(':') && name.strip_suffix(":latest") == Some(model))
    })
}

/// Fetch the model names an Ollama server serves
pub(crate) async fn list_models(client: &reqwest::Client, base_url: &Url) -> std::result::Result<Vec<String>, String> {
    let url = base_url.join("api/tags").map_err(|e| e.to_string())?;
    let response = client.get(url).send().await.map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("HTTP {}", response.status()));
    }
    let tags: TagsResponse = response.json().await.map_err(|e| e.to_string())?;
    Ok(tags.models.into_iter().map(|m| m.name).collect())
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedding {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let url = self.endpoint("api/embed")?;
        tracing::debug!("Embedding {} texts with {}", texts.len(), self.model);

        let response = self
            .client
            .post(url)
            .json(&EmbedRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .map_err(unavailable)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let reason = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error)
                .unwrap_or(body);
            return Err(if status == reqwest::StatusCode::NOT_FOUND {
                RagError::ModelUnavailable(format!("model '{}': {}", self.model, reason))
            } else {
                RagError::EmbeddingFailed(format!("{}: {}", status, reason))
            });
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| RagError::EmbeddingFailed(format!("malformed response: {}", e)))?;

        if parsed.embeddings.len() != texts.len() {
            return Err(RagError::EmbeddingFailed(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.embeddings.len()
            )));
        }

        Ok(parsed.embeddings)
    }

    async fn health_check(&self) -> Result<()> {
        let models = list_models(&self.client, &self.base_url)
            .await
            .map_err(RagError::ModelUnavailable)?;

        if serves_model(&models, &self.model) {
            Ok(())
        } else {
            Err(RagError::ModelUnavailable(format!(
                "model '{}' is not available (have: {})",
                self.model,
                models.join(", ")
            )))
        }
    }

    fn name(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// Embedder
// ============================================================================

/// Batching, normalizing front of an [`EmbeddingProvider`]
#[derive(Clone)]
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, batch_size: usize) -> Self {
        Self {
            provider,
            batch_size: batch_size.max(1),
        }
    }

    /// Embed `texts`; the output has the same length and order as the input.
    ///
    /// A batch the backend rejects is retried one item at a time, so only the
    /// offending inputs carry an error. Once the backend is unavailable the
    /// remaining inputs fail without further calls.
    pub async fn embed(&self, texts: &[String]) -> EmbeddingResults {
        let mut results: EmbeddingResults = Vec::with_capacity(texts.len());
        let mut down: Option<String> = None;
        tracing::debug!("Embedding {} texts via {}", texts.len(), self.provider.name());

        for batch in texts.chunks(self.batch_size) {
            if let Some(reason) = &down {
                results.extend(batch.iter().map(|_| Err(RagError::ModelUnavailable(reason.clone()))));
                continue;
            }

            match self.provider.embed_batch(batch).await {
                Ok(vectors) => results.extend(vectors.into_iter().map(normalize)),
                Err(RagError::ModelUnavailable(reason)) => {
                    tracing::warn!("Embedding backend unavailable: {}", reason);
                    results.extend(batch.iter().map(|_| Err(RagError::ModelUnavailable(reason.clone()))));
                    down = Some(reason);
                }
                Err(e) if batch.len() == 1 => results.push(Err(e)),
                Err(e) => {
                    tracing::debug!("Batch of {} rejected ({}), isolating items", batch.len(), e);
                    for text in batch {
                        if let Some(reason) = &down {
                            results.push(Err(RagError::ModelUnavailable(reason.clone())));
                            continue;
                        }
                        match self.provider.embed_batch(std::slice::from_ref(text)).await {
                            Ok(mut vectors) if vectors.len() == 1 => {
                                results.push(normalize(vectors.remove(0)))
                            }
                            Ok(vectors) => results.push(Err(RagError::EmbeddingFailed(format!(
                                "expected 1 embedding, got {}",
                                vectors.len()
                            )))),
                            Err(RagError::ModelUnavailable(reason)) => {
                                results.push(Err(RagError::ModelUnavailable(reason.clone())));
                                down = Some(reason);
                            }
                            Err(e) => results.push(Err(e)),
                        }
                    }
                }
            }
        }

        results
    }

    /// Embed a single query string
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&[text.to_string()])
            .await
            .pop()
            .unwrap_or_else(|| Err(RagError::EmbeddingFailed("no embedding returned".into())))
    }
}

/// Scale to unit length; rejects empty and non-finite vectors
fn normalize(mut vector: Vec<f32>) -> Result<Vec<f32>> {
    if vector.is_empty() {
        return Err(RagError::EmbeddingFailed("backend returned an empty vector".into()));
    }
    if vector.iter().any(|x| !x.is_finite()) {
        return Err(RagError::EmbeddingFailed("backend returned a non-finite value".into()));
    }

    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|x| *x /= norm);
    }
    Ok(vector)
}

// ============================================================================
// Tests
// ============================================================================
