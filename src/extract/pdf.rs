//! PDF text-layer extraction.

use std::path::Path;

use crate::error::{DocumentFormat, ExtractionError};

fn format_error(reason: String) -> ExtractionError {
    ExtractionError::Format {
        format: DocumentFormat::Pdf,
        reason,
    }
}

/// Extract the text layer of a PDF. Scanned PDFs without a text layer yield
/// an empty string, not an error.
pub(crate) async fn extract_pdf(path: &Path) -> Result<String, ExtractionError> {
    let bytes = tokio::fs::read(path).await?;
    // pdf-extract can panic on malformed input; the blocking task contains it.
    let text = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
        .await
        .map_err(|e| format_error(format!("parser aborted: {e}")))?
        .map_err(|e| format_error(e.to_string()))?;
    Ok(text.trim().to_string())
}
