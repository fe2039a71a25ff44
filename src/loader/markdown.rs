//! Markdown to plain text
//!
//! Markup is dropped; headings, paragraphs, list items and code blocks keep
//! their reading order and are separated by line breaks.

use std::path::Path;

use pulldown_cmark::{Event, Parser, TagEnd};

use super::{decode_utf8, DocumentFormat, FormatParser};
use crate::error::LoadError;

pub struct MarkdownParser;

impl FormatParser for MarkdownParser {
    fn can_parse(&self, extension: &str) -> bool {
        extension == "md"
    }

    fn format(&self) -> DocumentFormat {
        DocumentFormat::Markdown
    }

    fn parse(&self, path: &Path, bytes: &[u8]) -> Result<String, LoadError> {
        let source = decode_utf8(path, bytes)?;
        Ok(markdown_to_text(&source))
    }
}

pub(crate) fn markdown_to_text(source: &str) -> String {
    let mut out = String::with_capacity(source.len());

    for event in Parser::new(source) {
        match event {
            Event::Text(text) | Event::Code(text) => out.push_str(&text),
            Event::SoftBreak => out.push(' '),
            Event::HardBreak => out.push('\n'),
            Event::End(TagEnd::Paragraph)
            | Event::End(TagEnd::Heading(_))
            | Event::End(TagEnd::CodeBlock)
            | Event::End(TagEnd::BlockQuote(_)) => end_block(&mut out, "\n\n"),
            Event::End(TagEnd::Item) => end_block(&mut out, "\n"),
            Event::Rule => end_block(&mut out, "\n\n"),
            _ => {}
        }
    }

    out.trim().to_string()
}

fn end_block(out: &mut String, separator: &str) {
    let trimmed = out.trim_end_matches([' ', '\n']).len();
    out.truncate(trimmed);
    if !out.is_empty() {
        out.push_str(separator);
    }
}
