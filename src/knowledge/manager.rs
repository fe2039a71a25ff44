//! Knowledge base manager - build and query pipelines
//!
//! Build: Loader → Chunker → Embedder → VectorStore, one document per task on
//! a bounded worker pool. Query: Embedder → Retriever → GenerationOrchestrator.
//!
//! Build states: `Idle → Building → (Built | BuildFailed)`, `Built → Building`
//! on rebuild. Only one build runs at a time. A query during a build is served
//! from whatever the store holds at that moment; every store write is a single
//! atomic batch, so that view is always consistent.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};

use super::chunker::{Chunk, ChunkConfig, Chunker, SlidingWindowChunker};
use super::lance::LanceVectorStore;
use super::retriever::Retriever;
use super::vector::{EntryMetadata, IndexEntry, RetrievalResult, VectorStore};
use crate::config::Config;
use crate::embedding::{Embedder, EmbeddingProvider, OllamaEmbedding};
use crate::error::{LoadError, RagError, Result};
use crate::generation::{
    ChatTurn, GenerationOrchestrator, LanguageModel, OllamaGenerator, TokenStream,
};
use crate::loader::{document_id, Document, DocumentLoader, LoaderConfig};

// ============================================================================
// Types
// ============================================================================

/// Build state machine
#[derive(Debug, Clone, PartialEq)]
pub enum BuildState {
    /// Nothing indexed yet
    Idle,
    Building,
    Built,
    /// The last build aborted; the reason is kept for status output
    BuildFailed(String),
}

impl BuildState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildState::Idle => "idle",
            BuildState::Building => "building",
            BuildState::Built => "built",
            BuildState::BuildFailed(_) => "build failed",
        }
    }
}

/// A document written to the index
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedDocument {
    pub path: PathBuf,
    pub chunks: usize,
}

/// A file that could not be indexed
#[derive(Debug, Clone, PartialEq)]
pub struct FileFailure {
    pub path: PathBuf,
    pub reason: String,
}

/// A chunk that could not be embedded
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkFailure {
    pub chunk_id: String,
    pub reason: String,
}

/// Outcome of one build
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildReport {
    pub indexed: Vec<IndexedDocument>,
    /// Documents skipped because their content hash is unchanged
    pub unchanged: usize,
    /// Documents dropped because their file is gone
    pub removed: usize,
    pub failed_files: Vec<FileFailure>,
    pub failed_chunks: Vec<ChunkFailure>,
    /// Store size after the build
    pub total_entries: usize,
    pub elapsed: Duration,
}

impl BuildReport {
    pub fn chunks_indexed(&self) -> usize {
        self.indexed.iter().map(|d| d.chunks).sum()
    }

    pub fn has_failures(&self) -> bool {
        !self.failed_files.is_empty() || !self.failed_chunks.is_empty()
    }
}

/// A query's sources and its streamed answer
pub struct Answer {
    pub sources: RetrievalResult,
    pub tokens: TokenStream,
}

/// Snapshot for `status`
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub state: BuildState,
    /// Whether the persisted index holds any entry
    pub index_built: bool,
    pub entries: usize,
    /// Supported files discoverable under the configured directories
    pub source_documents: usize,
    pub embedding_available: bool,
    pub generation_available: bool,
}

enum DocumentOutcome {
    Indexed {
        path: PathBuf,
        chunks: usize,
        failed_chunks: Vec<ChunkFailure>,
    },
    Unchanged,
    Failed(FileFailure),
}

// ============================================================================
// KnowledgeBaseManager
// ============================================================================

/// Owns the configuration, the store handle and the build state
pub struct KnowledgeBaseManager {
    config: RwLock<Arc<Config>>,
    store: Arc<dyn VectorStore>,
    embedding: Arc<dyn EmbeddingProvider>,
    generator: GenerationOrchestrator,
    state: Mutex<BuildState>,
    /// Held for the whole of a build
    build_fence: tokio::sync::Mutex<()>,
}

impl KnowledgeBaseManager {
    /// Assemble a manager from explicit backends
    pub async fn new(
        config: Config,
        store: Arc<dyn VectorStore>,
        embedding: Arc<dyn EmbeddingProvider>,
        model: Arc<dyn LanguageModel>,
    ) -> Result<Self> {
        config.validate()?;

        let state = if store.count().await? > 0 {
            BuildState::Built
        } else {
            BuildState::Idle
        };

        Ok(Self {
            config: RwLock::new(Arc::new(config)),
            store,
            embedding,
            generator: GenerationOrchestrator::new(model),
            state: Mutex::new(state),
            build_fence: tokio::sync::Mutex::new(()),
        })
    }

    /// LanceDB index at `config.index_path`, Ollama for embedding and generation
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let store = LanceVectorStore::open(&config.index_path).await?;
        let embedding = OllamaEmbedding::from_config(&config)?;
        let model = OllamaGenerator::from_config(&config)?;
        tracing::info!(
            "Knowledge base at {:?} (embedding: {}, generation: {})",
            config.index_path,
            config.embedding_model,
            config.generation_model
        );
        Self::new(config, Arc::new(store), Arc::new(embedding), Arc::new(model)).await
    }

    /// Current configuration snapshot
    pub fn config(&self) -> Arc<Config> {
        match self.config.read() {
            Ok(config) => config.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn state(&self) -> BuildState {
        lock(&self.state).clone()
    }

    fn set_state(&self, state: BuildState) {
        *lock(&self.state) = state;
    }

    fn embedder(&self, config: &Config) -> Embedder {
        Embedder::new(self.embedding.clone(), config.embedding_batch_size)
    }

    fn retriever(&self, config: &Config) -> Retriever {
        Retriever::new(self.embedder(config), self.store.clone())
    }

    // ------------------------------------------------------------------------
    // Build
    // ------------------------------------------------------------------------

    /// Index `dirs` (the configured `documents_dirs` when empty).
    ///
    /// Per-file and per-chunk failures end up in the report; only a store
    /// failure aborts the build. `rebuild` clears the index first.
    pub async fn build(&self, dirs: &[PathBuf], rebuild: bool) -> Result<BuildReport> {
        let _fence = self
            .build_fence
            .try_lock()
            .map_err(|_| RagError::BuildInProgress)?;

        let config = self.config();
        let dirs: Vec<PathBuf> = if dirs.is_empty() {
            config.documents_dirs.clone()
        } else {
            dirs.to_vec()
        };

        self.set_state(BuildState::Building);
        tracing::info!("Building knowledge base from {:?}", dirs);

        match self.run_build(&config, &dirs, rebuild).await {
            Ok(report) => {
                tracing::info!(
                    "Build complete: {} documents ({} chunks) indexed, {} unchanged, {} removed, {} failed files, {} failed chunks, {} entries ({:.1}s)",
                    report.indexed.len(),
                    report.chunks_indexed(),
                    report.unchanged,
                    report.removed,
                    report.failed_files.len(),
                    report.failed_chunks.len(),
                    report.total_entries,
                    report.elapsed.as_secs_f64()
                );
                self.set_state(BuildState::Built);
                Ok(report)
            }
            Err(e) => {
                tracing::warn!("Build failed: {}", e);
                self.set_state(BuildState::BuildFailed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn run_build(&self, config: &Config, dirs: &[PathBuf], rebuild: bool) -> Result<BuildReport> {
        let started = Instant::now();
        let chunker: Arc<dyn Chunker> = Arc::new(SlidingWindowChunker::new(ChunkConfig::new(
            config.chunk_size,
            config.chunk_overlap,
        )?));
        let loader = document_loader(config);
        let embedder = self.embedder(config);
        tracing::debug!(
            "{}: {} chars, {} overlap",
            chunker.name(),
            config.chunk_size,
            config.chunk_overlap
        );
        let mut report = BuildReport::default();

        if rebuild {
            self.store.clear().await?;
        }

        // Discovery
        let mut roots = Vec::new();
        let mut paths = Vec::new();
        for dir in dirs {
            match discover(loader.clone(), dir).await {
                Ok((root, found)) => {
                    tracing::info!("Found {} documents under {:?}", found.len(), root);
                    roots.push(root);
                    paths.extend(found);
                }
                Err(e) => {
                    tracing::warn!("Cannot scan {:?}: {}", dir, e);
                    report.failed_files.push(FileFailure {
                        path: dir.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        paths.sort();
        paths.dedup();
        let seen: HashSet<String> = paths.iter().map(|p| document_id(p)).collect();

        // Indexing
        let mut outcomes = stream::iter(paths)
            .map(|path| self.index_document(path, &loader, &chunker, &embedder))
            .buffer_unordered(config.max_workers);

        while let Some(outcome) = outcomes.next().await {
            match outcome? {
                DocumentOutcome::Indexed {
                    path,
                    chunks,
                    failed_chunks,
                } => {
                    report.indexed.push(IndexedDocument { path, chunks });
                    report.failed_chunks.extend(failed_chunks);
                }
                DocumentOutcome::Unchanged => report.unchanged += 1,
                DocumentOutcome::Failed(failure) => report.failed_files.push(failure),
            }
        }
        drop(outcomes);
        report.indexed.sort_by(|a, b| a.path.cmp(&b.path));
        report.failed_files.sort_by(|a, b| a.path.cmp(&b.path));

        // Pruning documents whose files are gone
        for stored in self.store.document_ids().await? {
            let under_root = roots.iter().any(|root| Path::new(&stored).starts_with(root));
            if under_root && !seen.contains(&stored) {
                let deleted = self.store.delete(&stored).await?;
                tracing::info!("Removed {} ({} chunks)", stored, deleted);
                report.removed += 1;
            }
        }

        report.total_entries = self.store.count().await?;
        report.elapsed = started.elapsed();
        Ok(report)
    }

    /// Load, chunk, embed and store one document.
    ///
    /// Only store errors are returned as `Err`; everything else is an outcome.
    async fn index_document(
        &self,
        path: PathBuf,
        loader: &Arc<DocumentLoader>,
        chunker: &Arc<dyn Chunker>,
        embedder: &Embedder,
    ) -> Result<DocumentOutcome> {
        let loader = loader.clone();
        let chunker = chunker.clone();
        let task_path = path.clone();
        let loaded = tokio::task::spawn_blocking(move || {
            let doc = loader.load(&task_path)?;
            let chunks: Vec<Chunk> = chunker.chunk(&doc).collect();
            Ok::<_, LoadError>((doc, chunks))
        })
        .await
        .map_err(|e| LoadError::parse(&path, format!("loader aborted: {}", e)));

        let (doc, chunks) = match loaded.and_then(|r| r) {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::warn!("Failed to load {:?}: {}", path, e);
                return Ok(DocumentOutcome::Failed(FileFailure {
                    path,
                    reason: e.to_string(),
                }));
            }
        };

        // a stale tail left by an interrupted rewrite shows up as a count mismatch
        let stored = self.store.chunk_count(&doc.id).await?;
        let unchanged = if chunks.is_empty() {
            stored == 0
        } else {
            stored == chunks.len()
                && self.store.fingerprint(&doc.id).await?.as_deref()
                    == Some(doc.content_hash.as_str())
        };
        if unchanged {
            tracing::debug!("Unchanged: {:?}", path);
            return Ok(DocumentOutcome::Unchanged);
        }

        if chunks.is_empty() {
            self.store.delete(&doc.id).await?;
            tracing::info!("Indexed {:?} (empty document)", path);
            return Ok(DocumentOutcome::Indexed {
                path,
                chunks: 0,
                failed_chunks: vec![],
            });
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = embedder.embed(&texts).await;

        let mut entries = Vec::with_capacity(chunks.len());
        let mut failed_chunks = Vec::new();
        for (chunk, vector) in chunks.iter().zip(vectors) {
            match vector {
                Ok(vector) => entries.push(index_entry(&doc, chunk, vector)),
                Err(e) => failed_chunks.push(ChunkFailure {
                    chunk_id: chunk.id.clone(),
                    reason: e.to_string(),
                }),
            }
        }

        if entries.is_empty() {
            let reason = failed_chunks
                .first()
                .map(|f| f.reason.clone())
                .unwrap_or_default();
            tracing::warn!("Failed to embed {:?}: {}", path, reason);
            return Ok(DocumentOutcome::Failed(FileFailure { path, reason }));
        }

        if failed_chunks.is_empty() {
            // replace in place, then drop chunks past the new end
            self.store.upsert(&entries).await?;
            self.store.truncate(&doc.id, chunks.len() as u32).await?;
        } else {
            // partial: no fingerprint, so the next build retries the document
            for entry in &mut entries {
                entry.metadata.content_hash.clear();
            }
            tracing::warn!(
                "Indexed {:?} partially: {} of {} chunks failed",
                path,
                failed_chunks.len(),
                chunks.len()
            );
            self.store.delete(&doc.id).await?;
            self.store.upsert(&entries).await?;
        }

        tracing::info!("Indexed {:?} ({} chunks)", path, entries.len());
        Ok(DocumentOutcome::Indexed {
            path,
            chunks: entries.len(),
            failed_chunks,
        })
    }

    // ------------------------------------------------------------------------
    // Query
    // ------------------------------------------------------------------------

    /// Top `k` chunks for `text` under the configured threshold
    pub async fn retrieve(&self, text: &str, k: usize) -> Result<RetrievalResult> {
        let config = self.config();
        self.retriever(&config)
            .retrieve(text, k, config.similarity_threshold)
            .await
    }

    /// Retrieve context for `text` and stream a grounded answer.
    ///
    /// `Idle` answers with no sources and an empty stream.
    pub async fn query(&self, text: &str, history: &[ChatTurn]) -> Result<Answer> {
        let config = self.config();

        match self.state() {
            BuildState::Idle => {
                return Ok(Answer {
                    sources: vec![],
                    tokens: TokenStream::empty(),
                })
            }
            BuildState::BuildFailed(_) => return Err(RagError::NotBuilt),
            BuildState::Building | BuildState::Built => {}
        }

        let sources = self
            .retriever(&config)
            .retrieve(text, config.k, config.similarity_threshold)
            .await?;
        let tokens = self
            .generator
            .answer(text, &sources, history, &config)
            .await?;

        Ok(Answer { sources, tokens })
    }

    // ------------------------------------------------------------------------
    // Status & Reload
    // ------------------------------------------------------------------------

    pub async fn status(&self) -> Result<StatusReport> {
        let config = self.config();
        let entries = self.store.count().await?;

        let loader = document_loader(&config);
        let mut source_documents = 0;
        for dir in &config.documents_dirs {
            if let Ok((_, found)) = discover(loader.clone(), dir).await {
                source_documents += found.len();
            }
        }

        let (embedding, generation) = tokio::join!(
            self.embedding.health_check(),
            self.generator.health_check(&config)
        );

        Ok(StatusReport {
            state: self.state(),
            index_built: entries > 0,
            entries,
            source_documents,
            embedding_available: embedding.is_ok(),
            generation_available: generation.is_ok(),
        })
    }

    /// Swap in a new configuration.
    ///
    /// Rejected while a build runs. Settings bound to the index or to the
    /// backend connections need a restart.
    pub fn reload(&self, new: Config) -> Result<()> {
        new.validate()?;
        let _fence = self
            .build_fence
            .try_lock()
            .map_err(|_| RagError::BuildInProgress)?;

        let current = self.config();
        let fixed = [
            ("index_path", current.index_path != new.index_path),
            ("embedding_model", current.embedding_model != new.embedding_model),
            ("ollama_url", current.ollama_url != new.ollama_url),
            ("embedding_url", current.embedding_url != new.embedding_url),
        ];
        if let Some((key, _)) = fixed.iter().find(|(_, changed)| *changed) {
            return Err(RagError::Config(format!(
                "{} cannot change while running; restart and rebuild",
                key
            )));
        }

        match self.config.write() {
            Ok(mut config) => *config = Arc::new(new),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(new),
        }
        tracing::info!("Configuration reloaded");
        Ok(())
    }

    /// Reload from a TOML file
    pub fn reload_from(&self, path: &Path) -> Result<()> {
        self.reload(Config::load(path)?)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn document_loader(config: &Config) -> Arc<DocumentLoader> {
    Arc::new(DocumentLoader::new(LoaderConfig {
        max_file_size: config.max_file_size,
        ..LoaderConfig::default()
    }))
}

/// Canonical root and the supported files below it
async fn discover(
    loader: Arc<DocumentLoader>,
    dir: &Path,
) -> std::result::Result<(PathBuf, Vec<PathBuf>), LoadError> {
    let dir = dir.to_path_buf();
    let task_dir = dir.clone();
    tokio::task::spawn_blocking(move || {
        let root = task_dir.canonicalize().map_err(|source| LoadError::Io {
            path: task_dir.clone(),
            source,
        })?;
        let found: Vec<PathBuf> = loader.discover(&root)?.collect();
        Ok::<_, LoadError>((root, found))
    })
    .await
    .map_err(|e| LoadError::parse(dir, format!("directory scan aborted: {}", e)))?
}

fn index_entry(doc: &Document, chunk: &Chunk, vector: Vec<f32>) -> IndexEntry {
    IndexEntry {
        chunk_id: chunk.id.clone(),
        document_id: doc.id.clone(),
        sequence_index: chunk.sequence_index,
        text: chunk.text.clone(),
        vector,
        metadata: EntryMetadata {
            source_path: doc.source_path.display().to_string(),
            format: doc.format.as_str().to_string(),
            content_hash: doc.content_hash.clone(),
            mtime: doc.mtime.timestamp(),
            start_offset: chunk.start_offset,
            end_offset: chunk.end_offset,
        },
    }
}

// ============================================================================
// Tests
// ============================================================================
