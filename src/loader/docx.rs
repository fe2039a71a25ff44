//! Word (.docx) text extraction
//!
//! Reads `word/document.xml` and emits one line per paragraph, in body order.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use super::{open_zip, unescape_xml, zip_entry, DocumentFormat, FormatParser};
use crate::error::LoadError;

static PARAGRAPH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<w:p[\s>].*?</w:p>").expect("Invalid regex"));

/// Text runs, tabs and line breaks inside a paragraph
static RUN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<w:t(?:\s[^>]*)?>(.*?)</w:t>|<w:tab\s*/>|<w:br\s*/>").expect("Invalid regex")
});

pub struct DocxParser;

impl FormatParser for DocxParser {
    fn can_parse(&self, extension: &str) -> bool {
        extension == "docx"
    }

    fn format(&self) -> DocumentFormat {
        DocumentFormat::Docx
    }

    fn parse(&self, path: &Path, bytes: &[u8]) -> Result<String, LoadError> {
        let mut archive = open_zip(path, bytes)?;
        let xml = zip_entry(&mut archive, "word/document.xml", path)?;
        Ok(document_xml_to_text(&xml))
    }
}

fn document_xml_to_text(xml: &str) -> String {
    let mut paragraphs = Vec::new();

    for para in PARAGRAPH_RE.find_iter(xml) {
        let mut line = String::new();
        for run in RUN_RE.captures_iter(para.as_str()) {
            match run.get(1) {
                Some(text) => line.push_str(&unescape_xml(text.as_str())),
                None if run[0].starts_with("<w:tab") => line.push('\t'),
                None => line.push('\n'),
            }
        }
        if !line.trim().is_empty() {
            paragraphs.push(line);
        }
    }

    paragraphs.join("\n")
}
