//! Text extraction.
//!
//! `DocumentExtractor` validates the path, picks a format from the declared
//! media type (falling back to the file extension), pulls plain text out of
//! the file and caps it at the configured character ceiling. The source file
//! is only ever read.

mod docx;
mod ocr;
mod pdf;

pub use ocr::OcrEngine;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{DocumentFormat, ExtractionError};
use crate::safety::is_safe_path;

/// Extracted text, capped at a character ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedText {
    pub text: String,
    /// The source held more than the ceiling.
    pub truncated: bool,
}

impl ExtractedText {
    /// Cap `text` at `max_chars` characters (not bytes).
    pub fn capped(mut text: String, max_chars: usize) -> Self {
        match text.char_indices().nth(max_chars) {
            Some((byte_idx, _)) => {
                text.truncate(byte_idx);
                Self {
                    text,
                    truncated: true,
                }
            }
            None => Self {
                text,
                truncated: false,
            },
        }
    }
}

/// Pulls plain text out of a stored document.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, path: &Path, media_type: &str) -> Result<ExtractedText, ExtractionError>;
}

/// Resolve the document format from a media type, then from the extension.
pub fn detect_format(path: &Path, media_type: &str) -> Option<DocumentFormat> {
    let essence = media_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    let from_media = match essence.as_str() {
        "application/pdf" => Some(DocumentFormat::Pdf),
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
            Some(DocumentFormat::Docx)
        }
        "image/png" | "image/jpeg" | "image/jpg" | "image/tiff" | "image/bmp" => {
            Some(DocumentFormat::Image)
        }
        t if t.starts_with("text/") => Some(DocumentFormat::PlainText),
        _ => None,
    };

    from_media.or_else(|| {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(DocumentFormat::Pdf),
            "docx" => Some(DocumentFormat::Docx),
            "png" | "jpg" | "jpeg" | "tif" | "tiff" | "bmp" => Some(DocumentFormat::Image),
            "txt" | "text" | "csv" | "md" => Some(DocumentFormat::PlainText),
            _ => None,
        }
    })
}

/// Production extractor over the local filesystem.
pub struct DocumentExtractor {
    allowed_roots: Vec<PathBuf>,
    max_chars: usize,
    ocr: OcrEngine,
}

impl DocumentExtractor {
    pub fn new(allowed_roots: Vec<PathBuf>, max_chars: usize, ocr: OcrEngine) -> Self {
        Self {
            allowed_roots,
            max_chars,
            ocr,
        }
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }
}

#[async_trait]
impl TextExtractor for DocumentExtractor {
    async fn extract(&self, path: &Path, media_type: &str) -> Result<ExtractedText, ExtractionError> {
        if !is_safe_path(path, &self.allowed_roots) {
            return Err(ExtractionError::InvalidPath(path.display().to_string()));
        }

        let format = detect_format(path, media_type).ok_or_else(|| {
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| format!(" (.{e})"))
                .unwrap_or_default();
            ExtractionError::UnsupportedMediaType(format!("{media_type}{ext}"))
        })?;
        debug!(path = %path.display(), %format, "Extracting text");

        let raw = match format {
            DocumentFormat::Pdf => pdf::extract_pdf(path).await?,
            DocumentFormat::Docx => docx::extract_docx(path).await?,
            DocumentFormat::Image => self.ocr.recognize(path).await?,
            DocumentFormat::PlainText => {
                let bytes = tokio::fs::read(path).await?;
                String::from_utf8(bytes).map_err(|e| ExtractionError::Format {
                    format: DocumentFormat::PlainText,
                    reason: format!("not valid UTF-8: {e}"),
                })?
            }
        };

        let extracted = ExtractedText::capped(raw, self.max_chars);
        if extracted.truncated {
            info!(
                path = %path.display(),
                max_chars = self.max_chars,
                "Extracted text truncated"
            );
        }
        Ok(extracted)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn extractor(root: &Path, max_chars: usize) -> DocumentExtractor {
        DocumentExtractor::new(
            vec![root.to_path_buf()],
            max_chars,
            OcrEngine::new("echo", Duration::from_secs(5)),
        )
    }

    #[test]
    fn capped_counts_chars_not_bytes() {
        let capped = ExtractedText::capped("ééééé".to_string(), 3);
        assert_eq!(capped.text, "ééé");
        assert!(capped.truncated);

        let exact = ExtractedText::capped("abc".to_string(), 3);
        assert_eq!(exact.text, "abc");
        assert!(!exact.truncated);
    }

    #[test]
    fn format_from_media_type_then_extension() {
        let p = Path::new("/x/file.bin");
        assert_eq!(detect_format(p, "application/pdf"), Some(DocumentFormat::Pdf));
        assert_eq!(
            detect_format(p, "text/plain; charset=utf-8"),
            Some(DocumentFormat::PlainText)
        );
        assert_eq!(detect_format(p, "IMAGE/PNG"), Some(DocumentFormat::Image));
        assert_eq!(
            detect_format(Path::new("/x/scan.JPG"), "application/octet-stream"),
            Some(DocumentFormat::Image)
        );
        assert_eq!(
            detect_format(Path::new("/x/letter.docx"), ""),
            Some(DocumentFormat::Docx)
        );
        assert_eq!(detect_format(p, "application/octet-stream"), None);
        assert_eq!(detect_format(Path::new("/x/old.doc"), "application/msword"), None);
    }

    #[tokio::test]
    async fn plain_text_under_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        std::fs::write(&path, "Invoice INV-1 total $500").unwrap();

        let out = extractor(dir.path(), 10_000)
            .extract(&path, "text/plain")
            .await
            .unwrap();
        assert_eq!(out.text, "Invoice INV-1 total $500");
        assert!(!out.truncated);
    }

    #[tokio::test]
    async fn truncation_is_exact_for_every_format() {
        let dir = tempfile::tempdir().unwrap();
        let long = "x".repeat(50);

        let txt = dir.path().join("long.txt");
        std::fs::write(&txt, &long).unwrap();
        let docx_path = dir.path().join("long.docx");
        std::fs::write(&docx_path, docx::tests::build_docx(&[&long])).unwrap();

        let ex = extractor(dir.path(), 20);
        for (path, media) in [(&txt, "text/plain"), (&docx_path, "")] {
            let out = ex.extract(path, media).await.unwrap();
            assert!(out.truncated, "{}", path.display());
            assert_eq!(out.text.chars().count(), 20, "{}", path.display());
        }
    }

    #[tokio::test]
    async fn docx_extracts_paragraphs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bill.docx");
        std::fs::write(&path, docx::tests::build_docx(&["Vendor: ACME", "Total: 42.00"])).unwrap();

        let out = extractor(dir.path(), 10_000)
            .extract(&path, "application/vnd.openxmlformats-officedocument.wordprocessingml.document")
            .await
            .unwrap();
        assert_eq!(out.text, "Vendor: ACME\nTotal: 42.00");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn image_goes_through_ocr() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.png");
        std::fs::write(&path, ocr::tests::png_bytes()).unwrap();

        let out = extractor(dir.path(), 10_000)
            .extract(&path, "image/png")
            .await
            .unwrap();
        assert!(out.text.ends_with("stdout"));
    }

    #[tokio::test]
    async fn path_outside_root_rejected() {
        let root = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let path = other.path().join("a.txt");
        std::fs::write(&path, "hello").unwrap();

        let err = extractor(root.path(), 100)
            .extract(&path, "text/plain")
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn unknown_format_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.zip");
        std::fs::write(&path, b"PK").unwrap();

        let err = extractor(dir.path(), 100)
            .extract(&path, "application/zip")
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::UnsupportedMediaType(ref m) if m.contains("zip")));
    }

    #[tokio::test]
    async fn invalid_utf8_is_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.txt");
        std::fs::write(&path, [0xff, 0xfe, 0x00]).unwrap();

        let err = extractor(dir.path(), 100)
            .extract(&path, "text/plain")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExtractionError::Format {
                format: DocumentFormat::PlainText,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn source_file_is_not_touched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keep.txt");
        std::fs::write(&path, "still here").unwrap();

        extractor(dir.path(), 100)
            .extract(&path, "text/plain")
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "still here");
    }
}
