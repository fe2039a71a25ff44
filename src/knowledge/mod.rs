//! Knowledge module - chunking, vector index, retrieval and the build/query manager
//!
//! - Chunker: sliding-window character chunks with boundary snapping
//! - VectorStore: LanceDB (persistent) or in-memory, cosine similarity
//! - Retriever: query embedding + top-k search
//! - Manager: build state machine, incremental indexing, grounded queries

mod chunker;
mod lance;
mod manager;
mod memory;
mod retriever;
mod vector;

// Re-exports
pub use chunker::{chunk_id, reassemble, Chunk, ChunkConfig, Chunker, Chunks, SlidingWindowChunker};
pub use lance::LanceVectorStore;
pub use manager::{
    Answer, BuildReport, BuildState, ChunkFailure, FileFailure, IndexedDocument,
    KnowledgeBaseManager, StatusReport,
};
pub use memory::MemoryVectorStore;
pub use retriever::Retriever;
pub use vector::{
    cosine_similarity, rank, EntryMetadata, IndexEntry, RetrievalResult, ScoredChunk,
    StoredChunk, VectorStore,
};
