//! Text Chunking Module
//!
//! Sliding-window chunker over characters. The window advances by
//! `chunk_size - chunk_overlap` characters; a chunk end is pulled back to a
//! sentence or word boundary when one lies within a short lookback window.
//! Adjacent chunks always share exactly `chunk_overlap` characters, so the
//! original text can be rebuilt from the chunk sequence.

use crate::error::{RagError, Result};
use crate::loader::Document;

/// Upper bound for the boundary lookback window (characters)
const MAX_LOOKBACK: usize = 100;

// ============================================================================
// Chunk Configuration
// ============================================================================

/// Chunking settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkConfig {
    /// Maximum chunk length (characters)
    pub chunk_size: usize,
    /// Characters shared by adjacent chunks
    pub chunk_overlap: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

impl ChunkConfig {
    /// Validated settings (`0 <= chunk_overlap < chunk_size`)
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        if chunk_size == 0 || chunk_overlap >= chunk_size {
            return Err(RagError::Config(format!(
                "invalid chunking: size={}, overlap={} (need 0 <= overlap < size)",
                chunk_size, chunk_overlap
            )));
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
        })
    }

    /// Boundary lookback: a fifth of the window, at most [`MAX_LOOKBACK`]
    fn lookback(&self) -> usize {
        (self.chunk_size / 5).clamp(1, MAX_LOOKBACK)
    }
}

// ============================================================================
// Chunk
// ============================================================================

/// A bounded, overlapping slice of a document
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// `<document_id>#<sequence_index>`
    pub id: String,
    pub document_id: String,
    pub sequence_index: u32,
    pub text: String,
    /// Character offset of the first character
    pub start_offset: usize,
    /// Character offset one past the last character
    pub end_offset: usize,
}

/// Stable chunk id
pub fn chunk_id(document_id: &str, sequence_index: u32) -> String {
    format!("{}#{}", document_id, sequence_index)
}

// ============================================================================
// Chunker Trait
// ============================================================================

/// Text chunking strategy
pub trait Chunker: Send + Sync {
    /// Lazily split a document into ordered chunks
    fn chunk<'a>(&'a self, doc: &'a Document) -> Box<dyn Iterator<Item = Chunk> + 'a>;

    /// Chunker name
    fn name(&self) -> &'static str;
}

// ============================================================================
// SlidingWindowChunker
// ============================================================================

/// Fixed-size overlapping windows with boundary snapping
#[derive(Debug, Clone)]
pub struct SlidingWindowChunker {
    config: ChunkConfig,
}

impl SlidingWindowChunker {
    pub fn new(config: ChunkConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> ChunkConfig {
        self.config
    }

    /// Chunk raw text under the given document id
    pub fn chunk_text<'a>(&self, document_id: &'a str, text: &'a str) -> Chunks<'a> {
        let mut offsets: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
        offsets.push(text.len());
        Chunks {
            document_id,
            text,
            chars: text.chars().collect(),
            offsets,
            config: self.config,
            start: 0,
            sequence_index: 0,
            done: text.is_empty(),
        }
    }
}

impl Chunker for SlidingWindowChunker {
    fn chunk<'a>(&'a self, doc: &'a Document) -> Box<dyn Iterator<Item = Chunk> + 'a> {
        Box::new(self.chunk_text(&doc.id, &doc.raw_text))
    }

    fn name(&self) -> &'static str {
        "SlidingWindowChunker"
    }
}

/// Lazy chunk sequence over one text
pub struct Chunks<'a> {
    document_id: &'a str,
    text: &'a str,
    chars: Vec<char>,
    /// Byte offset of every character, plus `text.len()`
    offsets: Vec<usize>,
    config: ChunkConfig,
    start: usize,
    sequence_index: u32,
    done: bool,
}

impl Chunks<'_> {
    fn is_sentence_break(&self, p: usize) -> bool {
        let prev = self.chars[p - 1];
        if prev == '\n' {
            return true;
        }
        matches!(prev, '.' | '!' | '?' | '。' | '！' | '？')
            && (p == self.chars.len() || self.chars[p].is_whitespace())
    }

    fn is_word_break(&self, p: usize) -> bool {
        self.chars[p - 1].is_whitespace() || self.chars.get(p).is_some_and(|c| c.is_whitespace())
    }

    /// Pick the end of a non-final chunk, at most `hard_end`.
    ///
    /// The end never falls at or before `start + chunk_overlap`, so the window always advances.
    fn snap_end(&self, hard_end: usize) -> usize {
        let floor = self.start + self.config.chunk_overlap + 1;
        let min_end = floor.max(hard_end.saturating_sub(self.config.lookback()));
        if min_end > hard_end {
            return hard_end;
        }

        (min_end..=hard_end)
            .rev()
            .find(|&p| self.is_sentence_break(p))
            .or_else(|| (min_end..=hard_end).rev().find(|&p| self.is_word_break(p)))
            .unwrap_or(hard_end)
    }
}

impl Iterator for Chunks<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.done {
            return None;
        }

        let len = self.chars.len();
        let hard_end = (self.start + self.config.chunk_size).min(len);
        let end = if hard_end == len {
            len
        } else {
            self.snap_end(hard_end)
        };

        let chunk = Chunk {
            id: chunk_id(self.document_id, self.sequence_index),
            document_id: self.document_id.to_string(),
            sequence_index: self.sequence_index,
            text: self.text[self.offsets[self.start]..self.offsets[end]].to_string(),
            start_offset: self.start,
            end_offset: end,
        };

        if end == len {
            self.done = true;
        } else {
            self.start = end - self.config.chunk_overlap;
            self.sequence_index += 1;
        }

        Some(chunk)
    }
}

/// Rebuild the source text from an ordered chunk sequence
pub fn reassemble(chunks: &[Chunk], overlap: usize) -> String {
    let mut out = String::new();
    for (i, chunk) in chunks.iter().enumerate() {
        if i == 0 {
            out.push_str(&chunk.text);
        } else {
            out.extend(chunk.text.chars().skip(overlap));
        }
    }
    out
}

// ============================================================================
// Tests
// ============================================================================
