//! Document loading
//!
//! Walks a directory tree and turns every supported file into a normalized
//! plain-text [`Document`]. `.gitignore` patterns are respected and only the
//! supported extensions are collected. A file that fails to parse is reported
//! on its own; the walk continues.

mod docx;
mod epub;
mod markdown;
mod pdf;

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::LoadError;

// ============================================================================
// Document
// ============================================================================

/// Supported document formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Text,
    Markdown,
    Pdf,
    Docx,
    Epub,
}

impl DocumentFormat {
    /// Format for a file extension (case-insensitive)
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "txt" => Some(DocumentFormat::Text),
            "md" => Some(DocumentFormat::Markdown),
            "pdf" => Some(DocumentFormat::Pdf),
            "docx" => Some(DocumentFormat::Docx),
            "epub" => Some(DocumentFormat::Epub),
            _ => None,
        }
    }

    /// Format for a path, if its extension is supported
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentFormat::Text => "text",
            DocumentFormat::Markdown => "markdown",
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Docx => "docx",
            DocumentFormat::Epub => "epub",
        }
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A loaded, normalized document. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct Document {
    /// Normalized source path (identity)
    pub id: String,
    pub source_path: PathBuf,
    /// Plain text in reading order
    pub raw_text: String,
    pub format: DocumentFormat,
    pub mtime: DateTime<Utc>,
    /// SHA-256 of the file bytes (hex)
    pub content_hash: String,
}

/// Identity of a document: its normalized (canonical) path
pub fn document_id(path: &Path) -> String {
    let normalized = path
        .canonicalize()
        .unwrap_or_else(|_| path.to_path_buf());
    normalized.to_string_lossy().into_owned()
}

/// SHA-256 of raw bytes as lowercase hex
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

// ============================================================================
// Format Parsers
// ============================================================================

/// A format-specific text extractor, dispatched by extension
pub trait FormatParser: Send + Sync {
    /// Whether this parser handles the (lowercase) extension
    fn can_parse(&self, extension: &str) -> bool;

    /// Format produced by this parser
    fn format(&self) -> DocumentFormat;

    /// Convert file bytes to plain text
    fn parse(&self, path: &Path, bytes: &[u8]) -> Result<String, LoadError>;
}

/// UTF-8 plain text
pub struct PlainTextParser;

impl FormatParser for PlainTextParser {
    fn can_parse(&self, extension: &str) -> bool {
        extension == "txt"
    }

    fn format(&self) -> DocumentFormat {
        DocumentFormat::Text
    }

    fn parse(&self, path: &Path, bytes: &[u8]) -> Result<String, LoadError> {
        decode_utf8(path, bytes)
    }
}

/// Decode strict UTF-8, dropping a leading byte-order mark
pub(crate) fn decode_utf8(path: &Path, bytes: &[u8]) -> Result<String, LoadError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| LoadError::parse(path, format!("invalid UTF-8: {}", e)))?;
    Ok(text.strip_prefix('\u{feff}').unwrap_or(text).to_string())
}

type ZipReader<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

/// Open an in-memory ZIP container (DOCX, EPUB)
pub(crate) fn open_zip<'a>(path: &Path, bytes: &'a [u8]) -> Result<ZipReader<'a>, LoadError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| LoadError::parse(path, format!("not a valid ZIP container: {}", e)))
}

/// Read one UTF-8 member of a ZIP container
pub(crate) fn zip_entry(
    archive: &mut ZipReader<'_>,
    name: &str,
    path: &Path,
) -> Result<String, LoadError> {
    use std::io::Read;

    let mut file = archive
        .by_name(name)
        .map_err(|e| LoadError::parse(path, format!("missing {}: {}", name, e)))?;
    let mut buf = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut buf).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    decode_utf8(path, &buf)
}

/// Replace the predefined XML entities and numeric character references
pub(crate) fn unescape_xml(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let Some(end) = rest.find(';') else {
            break;
        };
        let entity = &rest[1..end];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|d| d.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
pub(crate) fn build_zip(entries: &[(&str, &str)]) -> Vec<u8> {
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, content) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

// ============================================================================
// DocumentLoader
// ============================================================================

/// Loader settings
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Respect .gitignore patterns
    pub respect_gitignore: bool,
    /// Include hidden files
    pub include_hidden: bool,
    /// Maximum file size in bytes (0 = unlimited)
    pub max_file_size: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            respect_gitignore: true,
            include_hidden: false,
            max_file_size: 100 * 1024 * 1024, // 100MB
        }
    }
}

/// Reads supported files from a directory tree into [`Document`]s
pub struct DocumentLoader {
    config: LoaderConfig,
    parsers: Vec<Box<dyn FormatParser>>,
}

impl Default for DocumentLoader {
    fn default() -> Self {
        Self::new(LoaderConfig::default())
    }
}

impl DocumentLoader {
    /// Loader with every built-in format parser
    pub fn new(config: LoaderConfig) -> Self {
        Self {
            config,
            parsers: vec![
                Box::new(PlainTextParser),
                Box::new(markdown::MarkdownParser),
                Box::new(pdf::PdfParser),
                Box::new(docx::DocxParser),
                Box::new(epub::EpubParser),
            ],
        }
    }

    fn parser_for(&self, path: &Path) -> Option<&dyn FormatParser> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        self.parsers
            .iter()
            .find(|p| p.can_parse(&ext))
            .map(|p| p.as_ref())
    }

    /// Whether the loader has a parser for this path
    pub fn is_supported(&self, path: &Path) -> bool {
        self.parser_for(path).is_some()
    }

    /// Lazily discover supported files under `root`.
    ///
    /// Fails only if `root` itself is missing; unreadable entries are logged and skipped.
    /// Oversized files are still yielded so that `load` can report them.
    pub fn discover(&self, root: &Path) -> Result<impl Iterator<Item = PathBuf> + '_, LoadError> {
        let root = root.canonicalize().map_err(|source| LoadError::Io {
            path: root.to_path_buf(),
            source,
        })?;

        let walker = WalkBuilder::new(&root)
            .hidden(!self.config.include_hidden)
            .git_ignore(self.config.respect_gitignore)
            .git_global(self.config.respect_gitignore)
            .git_exclude(self.config.respect_gitignore)
            .sort_by_file_path(|a, b| a.cmp(b))
            .build();

        Ok(walker.filter_map(move |entry| {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!("Failed to read entry: {}", e);
                    return None;
                }
            };

            if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
                return None;
            }

            let path = entry.into_path();
            if !self.is_supported(&path) {
                return None;
            }

            Some(path)
        }))
    }

    /// Load a single file
    pub fn load(&self, path: &Path) -> Result<Document, LoadError> {
        let parser = self
            .parser_for(path)
            .ok_or_else(|| LoadError::Unsupported(path.to_path_buf()))?;

        let io_err = |source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        };
        let meta = std::fs::metadata(path).map_err(io_err)?;
        let limit = self.config.max_file_size;
        if limit > 0 && meta.len() > limit {
            tracing::warn!("Refusing large file: {:?} ({} bytes)", path, meta.len());
            return Err(LoadError::TooLarge {
                path: path.to_path_buf(),
                size: meta.len(),
                limit,
            });
        }

        let bytes = std::fs::read(path).map_err(io_err)?;
        let mtime = meta.modified().map(DateTime::<Utc>::from).map_err(io_err)?;

        let raw_text = parser.parse(path, &bytes)?;

        Ok(Document {
            id: document_id(path),
            source_path: path.to_path_buf(),
            raw_text,
            format: parser.format(),
            mtime,
            content_hash: content_hash(&bytes),
        })
    }

    /// Lazy sequence of documents under `root`, one result per recognized file
    pub fn documents<'a>(
        &'a self,
        root: &Path,
    ) -> Result<impl Iterator<Item = Result<Document, LoadError>> + 'a, LoadError> {
        Ok(self.discover(root)?.map(move |path| self.load(&path)))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_format_from_extension() {
        assert_eq!(DocumentFormat::from_extension("md"), Some(DocumentFormat::Markdown));
        assert_eq!(DocumentFormat::from_extension("PDF"), Some(DocumentFormat::Pdf));
        assert_eq!(DocumentFormat::from_extension("Docx"), Some(DocumentFormat::Docx));
        assert_eq!(DocumentFormat::from_extension("epub"), Some(DocumentFormat::Epub));
        assert_eq!(DocumentFormat::from_extension("rs"), None);
    }

    #[test]
    fn test_discover_skips_unsupported() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        std::fs::write(dir.path().join("b.exe"), [0u8, 1, 2]).unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested/c.MD"), "# gamma").unwrap();

        let loader = DocumentLoader::default();
        let found: Vec<PathBuf> = loader.discover(dir.path()).unwrap().collect();

        assert_eq!(found.len(), 2);
        assert!(found.iter().any(|p| p.ends_with("a.txt")));
        assert!(found.iter().any(|p| p.ends_with("nested/c.MD")));
    }

    #[test]
    fn test_oversized_file_is_reported() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("big.txt"), "far more than eight bytes").unwrap();
        std::fs::write(dir.path().join("tiny.txt"), "ok").unwrap();

        let loader = DocumentLoader::new(LoaderConfig {
            max_file_size: 8,
            ..LoaderConfig::default()
        });
        let found: Vec<PathBuf> = loader.discover(dir.path()).unwrap().collect();
        assert_eq!(found.len(), 2);

        let results: Vec<Result<Document, LoadError>> =
            loader.documents(dir.path()).unwrap().collect();
        match &results[0] {
            Err(LoadError::TooLarge { path, size, limit }) => {
                assert!(path.ends_with("big.txt"));
                assert_eq!(*size, 25);
                assert_eq!(*limit, 8);
            }
            other => panic!("expected TooLarge, got {:?}", other),
        }
        assert_eq!(results[1].as_ref().unwrap().raw_text, "ok");
    }

    #[test]
    fn test_discover_missing_root() {
        let loader = DocumentLoader::default();
        let result = loader.discover(Path::new("/definitely/not/here"));
        assert!(matches!(result, Err(LoadError::Io { .. })));
    }

    #[test]
    fn test_load_text_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("note.txt");
        std::fs::write(&path, "\u{feff}The cat sat.").unwrap();

        let doc = DocumentLoader::default().load(&path).unwrap();
        assert_eq!(doc.raw_text, "The cat sat.");
        assert_eq!(doc.format, DocumentFormat::Text);
        assert_eq!(doc.id, document_id(&path));
        assert_eq!(doc.content_hash.len(), 64);
    }

    #[test]
    fn test_partial_failure_continues() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("bad.txt"), [0xff, 0xfe, 0x00, 0xc3]).unwrap();
        std::fs::write(dir.path().join("good.txt"), "fine").unwrap();
        std::fs::write(dir.path().join("broken.docx"), b"not a zip").unwrap();

        let loader = DocumentLoader::default();
        let results: Vec<_> = loader.documents(dir.path()).unwrap().collect();

        assert_eq!(results.len(), 3);
        let ok: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(ok.len(), 1);
        assert_eq!(ok[0].raw_text, "fine");
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, LoadError::Parse { .. })));
    }

    #[test]
    fn test_content_hash_stable() {
        assert_eq!(content_hash(b"abc"), content_hash(b"abc"));
        assert_ne!(content_hash(b"abc"), content_hash(b"abd"));
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
