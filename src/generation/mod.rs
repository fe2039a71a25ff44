//! Generation module - grounded prompts and streamed answers
//!
//! [`GenerationOrchestrator`] turns a question, the retrieved chunks and the
//! recent conversation into one prompt and hands it to a [`LanguageModel`].
//! Tokens come back as a [`TokenStream`]: finite, not restartable, and
//! dropping it cancels the backend request.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use url::Url;

use crate::config::Config;
use crate::embedding::{api_base, list_models, serves_model, ErrorResponse};
use crate::error::{RagError, Result};
use crate::knowledge::ScoredChunk;

/// Tokens buffered between the backend task and the consumer
const TOKEN_BUFFER: usize = 16;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Types
// ============================================================================

/// One prior exchange of a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub question: String,
    pub answer: String,
}

/// A single streaming generation call
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub model: String,
    pub prompt: String,
    pub temperature: f32,
    pub top_p: f32,
}

// ============================================================================
// TokenStream
// ============================================================================

pub type TokenSink = mpsc::Sender<Result<String>>;

/// Lazy, finite sequence of generated tokens.
///
/// A mid-stream failure arrives as one final `Err` after the tokens that were
/// already produced. Dropping the stream cancels the producer task.
pub struct TokenStream {
    rx: mpsc::Receiver<Result<String>>,
}

impl TokenStream {
    /// Run `producer` on its own task, feeding this stream.
    ///
    /// The task is aborted as soon as the stream is dropped.
    pub fn spawn<F, Fut>(producer: F) -> Self
    where
        F: FnOnce(TokenSink) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(TOKEN_BUFFER);
        let work = producer(tx.clone());
        tokio::spawn(async move {
            tokio::select! {
                _ = tx.closed() => tracing::debug!("Token stream dropped, cancelling generation"),
                _ = work => {}
            }
        });
        Self { rx }
    }

    /// A stream that ends immediately
    pub fn empty() -> Self {
        Self::from_results(Vec::new())
    }

    /// A pre-computed stream
    pub fn from_results(items: Vec<Result<String>>) -> Self {
        let (tx, rx) = mpsc::channel(items.len().max(1));
        for item in items {
            // capacity covers every item
            let _ = tx.try_send(item);
        }
        Self { rx }
    }

    /// Drain the stream into one string, stopping at the first error
    pub async fn collect_text(mut self) -> Result<String> {
        let mut text = String::new();
        while let Some(token) = self.next().await {
            text.push_str(&token?);
        }
        Ok(text)
    }
}

impl Stream for TokenStream {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

// ============================================================================
// LanguageModel Trait
// ============================================================================

/// Language-model runtime
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Start a streaming generation.
    ///
    /// Fails with `GenerationUnavailable` before any token if the runtime
    /// cannot be reached or refuses the request.
    async fn generate_stream(&self, request: GenerationRequest) -> Result<TokenStream>;

    /// Whether the runtime is reachable and serves `model`
    async fn health_check(&self, model: &str) -> Result<()>;

    fn name(&self) -> &str;
}

// ============================================================================
// Ollama Generator
// ============================================================================

/// Ollama `/api/generate` client (NDJSON streaming)
#[derive(Debug, Clone)]
pub struct OllamaGenerator {
    base_url: Url,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    top_p: f32,
}

/// One NDJSON frame of a streaming response
#[derive(Debug, Deserialize)]
struct GenerateFrame {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    error: Option<String>,
}

enum Step {
    Continue,
    Finished,
    Failed(String),
}

impl OllamaGenerator {
    /// Each request and health check names its own model
    pub fn new(base_url: Url) -> Result<Self> {
        // no total timeout: a generation may stream for minutes
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| RagError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: api_base(base_url),
            client,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.generation_url()?)
    }
}

#[async_trait]
impl LanguageModel for OllamaGenerator {
    async fn generate_stream(&self, request: GenerationRequest) -> Result<TokenStream> {
        let url = self
            .base_url
            .join("api/generate")
            .map_err(|e| RagError::Config(format!("invalid generation URL: {}", e)))?;

        tracing::debug!(
            "Generating with {} ({} prompt chars)",
            request.model,
            request.prompt.len()
        );

        let response = self
            .client
            .post(url)
            .json(&GenerateRequest {
                model: &request.model,
                prompt: &request.prompt,
                stream: true,
                options: GenerateOptions {
                    temperature: request.temperature,
                    top_p: request.top_p,
                },
            })
            .send()
            .await
            .map_err(|e| RagError::GenerationUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let reason = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error)
                .unwrap_or(body);
            return Err(RagError::GenerationUnavailable(format!("{}: {}", status, reason)));
        }

        Ok(TokenStream::spawn(move |tx| relay(response, tx)))
    }

    async fn health_check(&self, model: &str) -> Result<()> {
        let models = list_models(&self.client, &self.base_url)
            .await
            .map_err(RagError::GenerationUnavailable)?;

        if serves_model(&models, model) {
            Ok(())
        } else {
            Err(RagError::GenerationUnavailable(format!(
                "model '{}' is not available",
                model
            )))
        }
    }

    fn name(&self) -> &str {
        "ollama"
    }
}

/// Forward NDJSON frames as tokens until `done`, an error frame or EOF
async fn relay(response: reqwest::Response, tx: TokenSink) {
    let mut body = response.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();
    let mut emitted = 0usize;

    let reason = 'read: loop {
        match body.next().await {
            Some(Ok(bytes)) => {
                buf.extend_from_slice(&bytes);
                while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    match forward_frame(&line, &tx, &mut emitted).await {
                        Step::Continue => {}
                        Step::Finished => return,
                        Step::Failed(reason) => break 'read reason,
                    }
                }
            }
            Some(Err(e)) => break e.to_string(),
            None => match forward_frame(&buf, &tx, &mut emitted).await {
                Step::Finished => return,
                Step::Failed(reason) => break reason,
                Step::Continue => break "stream ended before completion".to_string(),
            },
        }
    };

    tracing::warn!("Generation interrupted after {} tokens: {}", emitted, reason);
    let _ = tx
        .send(Err(RagError::GenerationInterrupted { emitted, reason }))
        .await;
}

async fn forward_frame(line: &[u8], tx: &TokenSink, emitted: &mut usize) -> Step {
    let line = line.trim_ascii();
    if line.is_empty() {
        return Step::Continue;
    }

    let frame: GenerateFrame = match serde_json::from_slice(line) {
        Ok(frame) => frame,
        Err(e) => return Step::Failed(format!("malformed frame: {}", e)),
    };
    if let Some(error) = frame.error {
        return Step::Failed(error);
    }

    if !frame.response.is_empty() {
        if tx.send(Ok(frame.response)).await.is_err() {
            // consumer is gone
            return Step::Finished;
        }
        *emitted += 1;
    }

    if frame.done {
        Step::Finished
    } else {
        Step::Continue
    }
}

// ============================================================================
// GenerationOrchestrator
// ============================================================================

/// Fixed instruction preamble of every prompt
pub const PREAMBLE: &str = "You are a knowledge assistant. Answer the question using only the \
context below. Cite sources by their [number]. If the context does not contain the answer, \
say that you cannot answer from the provided documents. Use clear Markdown.";

/// Assemble the grounded prompt
pub fn build_prompt(
    question: &str,
    context: &[ScoredChunk],
    history: &[ChatTurn],
    history_turns: usize,
) -> String {
    let mut prompt = String::from(PREAMBLE);

    prompt.push_str("\n\nContext:\n");
    if context.is_empty() {
        prompt.push_str("(no relevant documents found)\n");
    }
    for (i, hit) in context.iter().enumerate() {
        prompt.push_str(&format!(
            "[{}] (source: {})\n{}\n\n",
            i + 1,
            hit.chunk.metadata.source_path,
            hit.chunk.text.trim()
        ));
    }

    let recent = &history[history.len().saturating_sub(history_turns)..];
    if !recent.is_empty() {
        prompt.push_str("\nConversation so far:\n");
        for turn in recent {
            prompt.push_str(&format!("User: {}\nAssistant: {}\n", turn.question, turn.answer));
        }
    }

    prompt.push_str(&format!("\nQuestion: {}\nAnswer:", question));
    prompt
}

/// Builds prompts and relays the model's token stream
#[derive(Clone)]
pub struct GenerationOrchestrator {
    model: Arc<dyn LanguageModel>,
}

impl GenerationOrchestrator {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    /// Whether the runtime serves the configured generation model
    pub async fn health_check(&self, config: &Config) -> Result<()> {
        self.model.health_check(&config.generation_model).await
    }

    /// Stream an answer grounded in `retrieved`
    pub async fn answer(
        &self,
        question: &str,
        retrieved: &[ScoredChunk],
        history: &[ChatTurn],
        config: &Config,
    ) -> Result<TokenStream> {
        let prompt = build_prompt(question, retrieved, history, config.history_turns);
        tracing::debug!(
            "Answering with {} on {} ({} sources)",
            config.generation_model,
            self.model.name(),
            retrieved.len()
        );
        self.model
            .generate_stream(GenerationRequest {
                model: config.generation_model.clone(),
                prompt,
                temperature: config.temperature,
                top_p: config.top_p,
            })
            .await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::{EntryMetadata, StoredChunk};
    use crate::testing::ScriptedModel;
    use std::sync::atomic::{AtomicBool, Ordering};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn hit(text: &str, source: &str) -> ScoredChunk {
        ScoredChunk {
            chunk: StoredChunk {
                chunk_id: format!("{}#0", source),
                document_id: source.to_string(),
                sequence_index: 0,
                text: text.to_string(),
                metadata: EntryMetadata {
                    source_path: source.to_string(),
                    format: "text".to_string(),
                    content_hash: String::new(),
                    mtime: 0,
                    start_offset: 0,
                    end_offset: text.chars().count(),
                },
                seq: 0,
            },
            similarity_score: 0.9,
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            model: "qwen2.5:7b".to_string(),
            prompt: "hi".to_string(),
            temperature: 0.7,
            top_p: 0.9,
        }
    }

    fn frames(tokens: &[&str], done: bool) -> String {
        let mut body: String = tokens
            .iter()
            .map(|t| format!("{}\n", serde_json::json!({"response": t, "done": false})))
            .collect();
        if done {
            body.push_str(&format!("{}\n", serde_json::json!({"response": "", "done": true})));
        }
        body
    }

    async fn generator(server: &MockServer) -> OllamaGenerator {
        OllamaGenerator::new(Url::parse(&server.uri()).unwrap()).unwrap()
    }

    #[test]
    fn test_build_prompt_layout() {
        let history = vec![
            ChatTurn { question: "q1".into(), answer: "a1".into() },
            ChatTurn { question: "q2".into(), answer: "a2".into() },
            ChatTurn { question: "q3".into(), answer: "a3".into() },
        ];
        let prompt = build_prompt(
            "What did the cat do?",
            &[hit("The cat sat.", "/docs/a.txt"), hit("The dog ran.", "/docs/b.md")],
            &history,
            2,
        );

        assert!(prompt.starts_with(PREAMBLE));
        assert!(prompt.contains("[1] (source: /docs/a.txt)\nThe cat sat."));
        assert!(prompt.contains("[2] (source: /docs/b.md)\nThe dog ran."));
        assert!(!prompt.contains("q1"));
        assert!(prompt.contains("User: q2\nAssistant: a2"));
        assert!(prompt.contains("User: q3\nAssistant: a3"));
        assert!(prompt.ends_with("Question: What did the cat do?\nAnswer:"));
        assert!(prompt.find("[1]").unwrap() < prompt.find("User: q2").unwrap());
    }

    #[test]
    fn test_build_prompt_without_history() {
        let prompt = build_prompt("q", &[], &[], 3);
        assert!(prompt.contains("(no relevant documents found)"));
        assert!(!prompt.contains("Conversation so far"));
    }

    #[tokio::test]
    async fn test_ollama_stream_in_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(serde_json::json!({
                "model": "qwen2.5:7b",
                "stream": true,
                "options": {"temperature": 0.7}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_string(frames(&["The", " cat", " sat"], true)))
            .mount(&server)
            .await;

        let stream = generator(&server).await.generate_stream(request()).await.unwrap();
        let tokens: Vec<Result<String>> = stream.collect().await;
        let tokens: Vec<String> = tokens.into_iter().map(|t| t.unwrap()).collect();
        assert_eq!(tokens, vec!["The", " cat", " sat"]);
    }

    #[tokio::test]
    async fn test_mid_stream_disconnect_reports_error() {
        let server = MockServer::start().await;
        let words: Vec<String> = (0..10).map(|i| format!("t{} ", i)).collect();
        let refs: Vec<&str> = words.iter().map(String::as_str).collect();
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_string(frames(&refs, false)))
            .mount(&server)
            .await;

        let stream = generator(&server).await.generate_stream(request()).await.unwrap();
        let items: Vec<Result<String>> = stream.collect().await;

        assert_eq!(items.len(), 11);
        for (item, word) in items.iter().zip(&words) {
            assert_eq!(item.as_ref().unwrap(), word);
        }
        match &items[10] {
            Err(RagError::GenerationInterrupted { emitted, .. }) => assert_eq!(*emitted, 10),
            other => panic!("expected interruption, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_error_frame_terminates_stream() {
        let server = MockServer::start().await;
        let body = format!(
            "{}{}\n",
            frames(&["partial"], false),
            serde_json::json!({"error": "model crashed"})
        );
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let stream = generator(&server).await.generate_stream(request()).await.unwrap();
        let err = stream.collect_text().await.unwrap_err();
        assert!(err.to_string().contains("model crashed"));
    }

    #[tokio::test]
    async fn test_nothing_relayed_after_error_frame() {
        let server = MockServer::start().await;
        let body = format!(
            "{}{}\n{}",
            frames(&["partial"], false),
            serde_json::json!({"error": "model crashed"}),
            frames(&["late", " tokens"], true)
        );
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let stream = generator(&server).await.generate_stream(request()).await.unwrap();
        let items: Vec<Result<String>> = stream.collect().await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "partial");
        match &items[1] {
            Err(RagError::GenerationInterrupted { emitted, reason }) => {
                assert_eq!(*emitted, 1);
                assert_eq!(reason, "model crashed");
            }
            other => panic!("expected interruption, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_base_url_path_prefix_is_kept() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ollama/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_string(frames(&["hi"], true)))
            .mount(&server)
            .await;

        let base = Url::parse(&format!("{}/ollama", server.uri())).unwrap();
        let text = OllamaGenerator::new(base)
            .unwrap()
            .generate_stream(request())
            .await
            .unwrap()
            .collect_text()
            .await
            .unwrap();
        assert_eq!(text, "hi");
    }

    #[tokio::test]
    async fn test_health_check_follows_configured_model() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "models": [{ "name": "llama3.2:latest" }]
            })))
            .mount(&server)
            .await;

        let orchestrator = GenerationOrchestrator::new(Arc::new(generator(&server).await));
        let mut config = Config {
            generation_model: "qwen2.5:7b".to_string(),
            ..Config::default()
        };
        assert!(matches!(
            orchestrator.health_check(&config).await,
            Err(RagError::GenerationUnavailable(_))
        ));

        config.generation_model = "llama3.2".to_string();
        assert!(orchestrator.health_check(&config).await.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_runtime_fails_before_tokens() {
        let generator =
            OllamaGenerator::new(Url::parse("http://127.0.0.1:9").unwrap()).unwrap();
        let err = generator.generate_stream(request()).await.err().unwrap();
        assert!(matches!(err, RagError::GenerationUnavailable(_)));
    }

    #[tokio::test]
    async fn test_missing_model_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "error": "model 'qwen2.5:7b' not found"
            })))
            .mount(&server)
            .await;

        let err = generator(&server).await.generate_stream(request()).await.err().unwrap();
        assert!(matches!(err, RagError::GenerationUnavailable(_)));
    }

    #[tokio::test]
    async fn test_dropping_stream_cancels_producer() {
        struct Flag(Arc<AtomicBool>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Flag(cancelled.clone());
        let mut stream = TokenStream::spawn(move |tx| async move {
            let _flag = flag;
            let mut i = 0;
            loop {
                if tx.send(Ok(format!("t{}", i))).await.is_err() {
                    break;
                }
                i += 1;
            }
        });

        assert_eq!(stream.next().await.unwrap().unwrap(), "t0");
        drop(stream);

        for _ in 0..50 {
            if cancelled.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(cancelled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_orchestrator_passes_config() {
        let model = Arc::new(ScriptedModel::new(&["ok"]));
        let orchestrator = GenerationOrchestrator::new(model.clone());
        let config = Config {
            generation_model: "llama3.2".to_string(),
            temperature: 0.1,
            ..Config::default()
        };

        let text = orchestrator
            .answer("q", &[hit("ctx", "/a.txt")], &[], &config)
            .await
            .unwrap()
            .collect_text()
            .await
            .unwrap();

        assert_eq!(text, "ok");
        let seen = model.last_request().unwrap();
        assert_eq!(seen.model, "llama3.2");
        assert_eq!(seen.temperature, 0.1);
        assert!(seen.prompt.contains("(source: /a.txt)"));
    }

    #[tokio::test]
    async fn test_empty_stream() {
        let text = TokenStream::empty().collect_text().await.unwrap();
        assert!(text.is_empty());
    }
}
