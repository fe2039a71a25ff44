//! Error taxonomy
//!
//! Every failure the pipeline can surface is attributable to a file, a chunk,
//! a query or the store itself.

use std::path::PathBuf;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, RagError>;

/// Per-file loading failure. Never fatal to a build.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported file type: {0}")]
    Unsupported(PathBuf),

    #[error("failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("{path} is too large ({size} bytes, limit {limit})")]
    TooLarge { path: PathBuf, size: u64, limit: u64 },
}

impl LoadError {
    /// The file this error belongs to.
    pub fn path(&self) -> &PathBuf {
        match self {
            LoadError::Io { path, .. } => path,
            LoadError::Unsupported(path) => path,
            LoadError::Parse { path, .. } => path,
            LoadError::TooLarge { path, .. } => path,
        }
    }

    pub(crate) fn parse(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        LoadError::Parse {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RagError {
    #[error(transparent)]
    Load(#[from] LoadError),

    /// The embedding backend could not be reached (or does not serve the model).
    #[error("embedding backend unavailable: {0}")]
    ModelUnavailable(String),

    /// The embedding backend rejected a specific input.
    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),

    #[error("a build is already in progress")]
    BuildInProgress,

    /// The language-model runtime could not be reached; no tokens were emitted.
    #[error("generation backend unavailable: {0}")]
    GenerationUnavailable(String),

    /// The language-model runtime failed after `emitted` tokens were relayed.
    #[error("generation interrupted after {emitted} tokens: {reason}")]
    GenerationInterrupted { emitted: usize, reason: String },

    /// The persisted index is unreadable; it has to be rebuilt.
    #[error("vector store corrupted: {0} (rebuild the index)")]
    StoreCorruption(String),

    #[error("vector store error: {0}")]
    Store(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("knowledge base is not built (last build failed)")]
    NotBuilt,
}

impl From<lancedb::Error> for RagError {
    fn from(e: lancedb::Error) -> Self {
        RagError::Store(e.to_string())
    }
}

impl From<arrow_schema::ArrowError> for RagError {
    fn from(e: arrow_schema::ArrowError) -> Self {
        RagError::StoreCorruption(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_error_path() {
        let err = LoadError::parse("/docs/a.pdf", "bad xref");
        assert_eq!(err.path(), &PathBuf::from("/docs/a.pdf"));
        assert!(err.to_string().contains("bad xref"));
    }

    #[test]
    fn test_interrupted_message() {
        let err = RagError::GenerationInterrupted {
            emitted: 10,
            reason: "connection reset".into(),
        };
        assert_eq!(
            err.to_string(),
            "generation interrupted after 10 tokens: connection reset"
        );
    }
}
