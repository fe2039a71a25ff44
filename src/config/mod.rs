//! Configuration - fixed TOML configuration structure
//!
//! Loaded once at startup and read-only afterwards. Unknown keys are rejected.
//! Default location: `<data dir>/config.toml`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{RagError, Result};

// ============================================================================
// Data Directory
// ============================================================================

/// Data directory (`<local data dir>/localkb`)
pub fn get_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("localkb")
}

/// Default configuration file path
pub fn default_config_path() -> PathBuf {
    get_data_dir().join("config.toml")
}

// ============================================================================
// Config
// ============================================================================

/// Process-wide configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Embedding model identifier served by the embedding backend
    pub embedding_model: String,
    /// Generation model identifier served by the language-model runtime
    pub generation_model: String,
    /// Sampling temperature
    pub temperature: f32,
    /// Nucleus sampling cutoff
    pub top_p: f32,
    /// Chunk length in characters
    pub chunk_size: usize,
    /// Characters shared by adjacent chunks (< chunk_size)
    pub chunk_overlap: usize,
    /// Number of chunks retrieved per query
    pub k: usize,
    /// Minimum cosine similarity for a retrieved chunk
    pub similarity_threshold: Option<f32>,
    /// Directory holding the persisted vector index
    pub index_path: PathBuf,
    /// Base URL of the Ollama-compatible runtime
    pub ollama_url: String,
    /// Base URL of the embedding backend (defaults to `ollama_url`)
    pub embedding_url: Option<String>,
    /// Texts per embedding call
    pub embedding_batch_size: usize,
    /// Prior conversation turns included in a prompt
    pub history_turns: usize,
    /// Documents processed concurrently during a build
    pub max_workers: usize,
    /// Directories built when none are given explicitly
    pub documents_dirs: Vec<PathBuf>,
    /// Largest file a build will load, in bytes (0 = unlimited)
    pub max_file_size: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            embedding_model: "nomic-embed-text".to_string(),
            generation_model: "qwen2.5:7b".to_string(),
            temperature: 0.7,
            top_p: 0.9,
            chunk_size: 1000,
            chunk_overlap: 200,
            k: 4,
            similarity_threshold: None,
            index_path: get_data_dir().join("index.lance"),
            ollama_url: "http://localhost:11434".to_string(),
            embedding_url: None,
            embedding_batch_size: 32,
            history_turns: 3,
            max_workers: default_workers(),
            documents_dirs: Vec::new(),
            max_file_size: 100 * 1024 * 1024,
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(8)
}

impl Config {
    /// Parse and validate a TOML document
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(raw).map_err(|e| RagError::Config(e.message().to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RagError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&raw)?;
        tracing::debug!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Load from an explicit path, or from the default location if it exists.
    ///
    /// A missing default file yields the built-in defaults; a missing explicit
    /// file is an error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default_path = default_config_path();
                if default_path.exists() {
                    Self::load(&default_path)
                } else {
                    tracing::debug!("No config file at {:?}, using defaults", default_path);
                    Ok(Self::default())
                }
            }
        }
    }

    /// Check value ranges and cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(RagError::Config("chunk_size must be greater than 0".into()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(RagError::Config(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.k == 0 {
            return Err(RagError::Config("k must be greater than 0".into()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(RagError::Config(format!(
                "temperature must be within [0, 2], got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(RagError::Config(format!(
                "top_p must be within (0, 1], got {}",
                self.top_p
            )));
        }
        if let Some(threshold) = self.similarity_threshold {
            if !(-1.0..=1.0).contains(&threshold) {
                return Err(RagError::Config(format!(
                    "similarity_threshold must be within [-1, 1], got {}",
                    threshold
                )));
            }
        }
        if self.embedding_batch_size == 0 {
            return Err(RagError::Config(
                "embedding_batch_size must be greater than 0".into(),
            ));
        }
        if self.max_workers == 0 {
            return Err(RagError::Config("max_workers must be greater than 0".into()));
        }
        if self.embedding_model.trim().is_empty() || self.generation_model.trim().is_empty() {
            return Err(RagError::Config("model identifiers must not be empty".into()));
        }
        self.generation_url()?;
        self.embedding_url()?;
        Ok(())
    }

    /// Language-model runtime base URL
    pub fn generation_url(&self) -> Result<Url> {
        parse_url(&self.ollama_url)
    }

    /// Embedding backend base URL
    pub fn embedding_url(&self) -> Result<Url> {
        parse_url(self.embedding_url.as_deref().unwrap_or(&self.ollama_url))
    }
}

fn parse_url(raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| RagError::Config(format!("invalid URL '{}': {}", raw, e)))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunk_size, 1000);
        assert!(config.similarity_threshold.is_none());
        assert!(config.max_workers >= 1 && config.max_workers <= 8);
    }

    #[test]
    fn test_parse_partial_file() {
        let config = Config::from_toml_str(
            r#"
            embedding_model = "all-minilm"
            chunk_size = 20
            chunk_overlap = 5
            k = 1
            similarity_threshold = 0.25
            index_path = "/tmp/kb.lance"
            max_file_size = 1024
            "#,
        )
        .unwrap();

        assert_eq!(config.embedding_model, "all-minilm");
        assert_eq!(config.chunk_size, 20);
        assert_eq!(config.chunk_overlap, 5);
        assert_eq!(config.k, 1);
        assert_eq!(config.similarity_threshold, Some(0.25));
        assert_eq!(config.index_path, PathBuf::from("/tmp/kb.lance"));
        assert_eq!(config.max_file_size, 1024);
        // untouched keys keep their defaults
        assert_eq!(config.generation_model, "qwen2.5:7b");
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = Config::from_toml_str("chunk_size = 100\nsearch_type = \"mmr\"").unwrap_err();
        assert!(matches!(err, RagError::Config(_)));
        assert!(err.to_string().contains("search_type"));
    }

    #[test]
    fn test_overlap_must_be_smaller() {
        let err = Config::from_toml_str("chunk_size = 100\nchunk_overlap = 100").unwrap_err();
        assert!(err.to_string().contains("chunk_overlap"));
    }

    #[test]
    fn test_out_of_range_values() {
        assert!(Config::from_toml_str("temperature = 3.5").is_err());
        assert!(Config::from_toml_str("top_p = 0.0").is_err());
        assert!(Config::from_toml_str("k = 0").is_err());
        assert!(Config::from_toml_str("similarity_threshold = 1.5").is_err());
        assert!(Config::from_toml_str("ollama_url = \"not a url\"").is_err());
    }

    #[test]
    fn test_embedding_url_fallback() {
        let config = Config::from_toml_str("ollama_url = \"http://gpu-box:11434\"").unwrap();
        assert_eq!(config.embedding_url().unwrap().host_str(), Some("gpu-box"));

        let config = Config::from_toml_str(
            "ollama_url = \"http://gpu-box:11434\"\nembedding_url = \"http://cpu-box:8080\"",
        )
        .unwrap();
        assert_eq!(config.embedding_url().unwrap().port(), Some(8080));
        assert_eq!(config.generation_url().unwrap().host_str(), Some("gpu-box"));
    }

    #[test]
    fn test_load_missing_explicit_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = Config::load_or_default(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(matches!(err, RagError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "k = 7\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.k, 7);
    }
}
