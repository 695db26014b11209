//! Image OCR through the `tesseract` command-line engine.
//!
//! The image is decoded first so corrupt files fail fast with
//! `CorruptedImage` instead of an opaque engine error.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::error::{DocumentFormat, ExtractionError};

/// Longest stderr excerpt kept in an error.
const MAX_STDERR_CHARS: usize = 200;

/// OCR engine handle.
#[derive(Debug, Clone)]
pub struct OcrEngine {
    program: PathBuf,
    timeout: Duration,
}

fn format_error(reason: String) -> ExtractionError {
    ExtractionError::Format {
        format: DocumentFormat::Image,
        reason,
    }
}

impl OcrEngine {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    pub async fn recognize(&self, path: &Path) -> Result<String, ExtractionError> {
        let bytes = tokio::fs::read(path).await?;
        tokio::task::spawn_blocking(move || image::load_from_memory(&bytes).map(|_| ()))
            .await
            .map_err(|e| ExtractionError::CorruptedImage(format!("decoder aborted: {e}")))?
            .map_err(|e| ExtractionError::CorruptedImage(e.to_string()))?;

        let mut command = Command::new(&self.program);
        command
            .arg(path)
            .arg("stdout")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(format_error(format!(
                    "failed to run {}: {e}",
                    self.program.display()
                )));
            }
            Err(_) => {
                return Err(format_error(format!(
                    "OCR timed out after {}s",
                    self.timeout.as_secs()
                )));
            }
        };

        if !output.status.success() {
            let stderr: String = String::from_utf8_lossy(&output.stderr)
                .chars()
                .take(MAX_STDERR_CHARS)
                .collect();
            return Err(format_error(format!(
                "OCR engine exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        debug!(path = %path.display(), chars = text.chars().count(), "OCR complete");
        Ok(text)
    }
}
