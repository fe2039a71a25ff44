//! EPUB text extraction
//!
//! Follows `META-INF/container.xml` to the package document and reads the
//! XHTML chapters in spine order. Each chapter becomes one paragraph.

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};

use super::{open_zip, unescape_xml, zip_entry, DocumentFormat, FormatParser};
use crate::error::LoadError;

static ROOTFILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<rootfile\s[^>]*full-path\s*=\s*"([^"]+)""#).expect("Invalid regex"));
static ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(?:opf:)?item\s[^>]*>").expect("Invalid regex"));
static ITEMREF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(?:opf:)?itemref\s[^>]*>").expect("Invalid regex"));
static ATTR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([\w:-]+)\s*=\s*"([^"]*)""#).expect("Invalid regex"));
static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("Invalid regex"));

const XHTML_MEDIA_TYPES: [&str; 2] = ["application/xhtml+xml", "text/html"];

pub struct EpubParser;

impl FormatParser for EpubParser {
    fn can_parse(&self, extension: &str) -> bool {
        extension == "epub"
    }

    fn format(&self) -> DocumentFormat {
        DocumentFormat::Epub
    }

    fn parse(&self, path: &Path, bytes: &[u8]) -> Result<String, LoadError> {
        let mut archive = open_zip(path, bytes)?;

        let container = zip_entry(&mut archive, "META-INF/container.xml", path)?;
        let opf_path = ROOTFILE_RE
            .captures(&container)
            .map(|c| unescape_xml(&c[1]))
            .ok_or_else(|| LoadError::parse(path, "container.xml names no rootfile"))?;
        let opf = zip_entry(&mut archive, &opf_path, path)?;
        let base = opf_path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");

        let mut chapters = Vec::new();
        for href in reading_order(&opf) {
            let member = resolve_href(base, &href);
            match zip_entry(&mut archive, &member, path) {
                Ok(xhtml) => {
                    let text = chapter_text(&xhtml);
                    if !text.is_empty() {
                        chapters.push(text);
                    }
                }
                Err(e) => tracing::warn!("Skipping EPUB chapter {}: {}", member, e),
            }
        }

        Ok(chapters.join("\n\n"))
    }
}

fn attributes(tag: &str) -> HashMap<&str, String> {
    ATTR_RE
        .captures_iter(tag)
        .filter_map(|c| {
            let name = c.get(1)?.as_str();
            Some((name, unescape_xml(c.get(2)?.as_str())))
        })
        .collect()
}

/// Chapter hrefs in spine order; falls back to manifest order without a spine
fn reading_order(opf: &str) -> Vec<String> {
    let mut manifest: Vec<(String, String)> = Vec::new();
    let mut by_id: HashMap<String, String> = HashMap::new();

    for tag in ITEM_RE.find_iter(opf) {
        let attrs = attributes(tag.as_str());
        let (Some(id), Some(href)) = (attrs.get("id"), attrs.get("href")) else {
            continue;
        };
        let is_xhtml = attrs
            .get("media-type")
            .map(|m| XHTML_MEDIA_TYPES.contains(&m.as_str()))
            .unwrap_or(false);
        if is_xhtml {
            manifest.push((id.clone(), href.clone()));
            by_id.insert(id.clone(), href.clone());
        }
    }

    let spine: Vec<String> = ITEMREF_RE
        .find_iter(opf)
        .filter_map(|tag| attributes(tag.as_str()).get("idref").cloned())
        .filter_map(|idref| by_id.get(&idref).cloned())
        .collect();

    if spine.is_empty() {
        manifest.into_iter().map(|(_, href)| href).collect()
    } else {
        spine
    }
}

/// Resolve a manifest href against the package directory
fn resolve_href(base: &str, href: &str) -> String {
    let href = href.split('#').next().unwrap_or(href).replace("%20", " ");
    let mut parts: Vec<&str> = if base.is_empty() {
        Vec::new()
    } else {
        base.split('/').collect()
    };
    for segment in href.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    parts.join("/")
}

fn chapter_text(xhtml: &str) -> String {
    let document = Html::parse_document(xhtml);
    let body = Selector::parse("body").expect("Invalid selector");
    let text: String = match document.select(&body).next() {
        Some(body) => body.text().collect::<Vec<_>>().join(" "),
        None => document.root_element().text().collect::<Vec<_>>().join(" "),
    };
    WHITESPACE_RE.replace_all(&text, " ").trim().to_string()
}
