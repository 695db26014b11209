//! DOCX text extraction: unzip `word/document.xml` and collect its text runs.

use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::error::{DocumentFormat, ExtractionError};

/// Text runs, paragraph ends, tabs and breaks in WordprocessingML.
static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<w:t(?:\s[^>/]*)?>(.*?)</w:t>|</w:p>|<w:tab\s*/>|<w:(?:br|cr)\b[^>]*/>")
        .expect("valid regex")
});

static ENTITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(#x[0-9a-fA-F]+|#[0-9]+|lt|gt|amp|quot|apos);").expect("valid regex")
});

fn format_error(reason: impl Into<String>) -> ExtractionError {
    ExtractionError::Format {
        format: DocumentFormat::Docx,
        reason: reason.into(),
    }
}

pub(crate) async fn extract_docx(path: &Path) -> Result<String, ExtractionError> {
    let bytes = tokio::fs::read(path).await?;
    tokio::task::spawn_blocking(move || document_text(&bytes))
        .await
        .map_err(|e| format_error(format!("extraction task failed: {e}")))?
}

fn document_text(bytes: &[u8]) -> Result<String, ExtractionError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| format_error(format!("not a DOCX archive: {e}")))?;
    let mut entry = archive
        .by_name("word/document.xml")
        .map_err(|e| format_error(format!("missing word/document.xml: {e}")))?;

    let mut xml = String::new();
    entry
        .read_to_string(&mut xml)
        .map_err(|e| format_error(format!("unreadable document.xml: {e}")))?;
    Ok(parse_document_xml(&xml))
}

/// Paragraphs become lines; runs within a paragraph are concatenated.
fn parse_document_xml(xml: &str) -> String {
    let mut text = String::with_capacity(xml.len() / 4);
    for caps in TOKEN_RE.captures_iter(xml) {
        if let Some(run) = caps.get(1) {
            text.push_str(&unescape_xml(run.as_str()));
            continue;
        }
        match &caps[0] {
            "</w:p>" => text.push('\n'),
            t if t.starts_with("<w:tab") => text.push('\t'),
            _ => text.push('\n'),
        }
    }
    let trimmed = text.trim_end_matches('\n').len();
    text.truncate(trimmed);
    text
}

fn unescape_xml(s: &str) -> String {
    ENTITY_RE
        .replace_all(s, |caps: &Captures| {
            let entity = &caps[1];
            let decoded = match entity {
                "lt" => Some('<'),
                "gt" => Some('>'),
                "amp" => Some('&'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                _ if entity.starts_with("#x") => u32::from_str_radix(&entity[2..], 16)
                    .ok()
                    .and_then(char::from_u32),
                _ => entity[1..].parse::<u32>().ok().and_then(char::from_u32),
            };
            decoded.map_or_else(|| caps[0].to_string(), |c| c.to_string())
        })
        .into_owned()
}
