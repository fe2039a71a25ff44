//! localkb - local retrieval-augmented generation over a document folder
//!
//! Documents are loaded, chunked and embedded into a LanceDB index; questions
//! are answered by a local Ollama model grounded on the retrieved chunks.

pub mod cli;
pub mod config;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod knowledge;
pub mod loader;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports
pub use config::{default_config_path, get_data_dir, Config};
pub use embedding::{Embedder, EmbeddingProvider, EmbeddingResults, OllamaEmbedding};
pub use error::{LoadError, RagError, Result};
pub use generation::{
    build_prompt, ChatTurn, GenerationOrchestrator, GenerationRequest, LanguageModel,
    OllamaGenerator, TokenStream,
};
pub use knowledge::{
    Answer, BuildReport, BuildState, Chunk, ChunkConfig, Chunker, KnowledgeBaseManager,
    LanceVectorStore, MemoryVectorStore, RetrievalResult, Retriever, ScoredChunk,
    SlidingWindowChunker, StatusReport, VectorStore,
};
pub use loader::{Document, DocumentFormat, DocumentLoader, FormatParser, LoaderConfig};
