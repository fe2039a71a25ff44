//! PDF text extraction
//!
//! Uses pdf-extract; pages are kept in document order and separated by a blank line.

use std::path::Path;

use super::{DocumentFormat, FormatParser};
use crate::error::LoadError;

pub struct PdfParser;

impl FormatParser for PdfParser {
    fn can_parse(&self, extension: &str) -> bool {
        extension == "pdf"
    }

    fn format(&self) -> DocumentFormat {
        DocumentFormat::Pdf
    }

    fn parse(&self, path: &Path, bytes: &[u8]) -> Result<String, LoadError> {
        // pdf-extract panics on some malformed inputs
        let text = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes))
            .map_err(|_| LoadError::parse(path, "PDF parser panicked"))?
            .map_err(|e| LoadError::parse(path, e))?;

        if text.trim().is_empty() {
            tracing::warn!(
                "No text extracted from PDF: {:?}. It might be a scanned document.",
                path
            );
            return Ok(String::new());
        }

        Ok(split_pdf_pages(&text).join("\n\n"))
    }
}

/// Split extracted text into pages on form feeds, dropping empty pages
fn split_pdf_pages(text: &str) -> Vec<&str> {
    text.split('\x0c')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}
