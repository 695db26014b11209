//! Shared types for the document workflow.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

use crate::error::{ClassificationError, ExtractionError, FilingError};
use crate::pipeline::state::{StageTransition, WorkflowStage};

pub use crate::extract::ExtractedText;

// ── Attachment ──────────────────────────────────────────────────────

/// A stored file waiting to be classified.
///
/// Built by the mail collaborator or the upload endpoint once the bytes are
/// on disk; moved into exactly one workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentItem {
    pub id: Uuid,
    pub source_path: PathBuf,
    /// Filename as declared by the sender (unsanitized).
    pub declared_filename: String,
    pub media_type: String,
    pub size_bytes: u64,
}

impl AttachmentItem {
    pub fn new(
        source_path: impl Into<PathBuf>,
        declared_filename: impl Into<String>,
        media_type: impl Into<String>,
        size_bytes: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_path: source_path.into(),
            declared_filename: declared_filename.into(),
            media_type: media_type.into(),
            size_bytes,
        }
    }
}

// ── Classification ──────────────────────────────────────────────────

/// Document label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentLabel {
    Invoice,
    NonInvoice,
}

impl fmt::Display for DocumentLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invoice => write!(f, "invoice"),
            Self::NonInvoice => write!(f, "non_invoice"),
        }
    }
}

/// Fields the model pulled out of the document. Absent means not found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<String>,
}

/// A validated classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub label: DocumentLabel,
    /// Always within `[0.0, 1.0]`.
    pub confidence: f64,
    pub rationale: String,
    pub extracted_fields: ExtractedFields,
}

// ── Filing ──────────────────────────────────────────────────────────

/// Where a classified file goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilingDecision {
    pub destination_folder: PathBuf,
    pub destination_filename: String,
}

impl FilingDecision {
    pub fn path(&self) -> PathBuf {
        self.destination_folder.join(&self.destination_filename)
    }
}

// ── Outcome ─────────────────────────────────────────────────────────

/// Why a workflow run did not finish.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("classification failed: {0}")]
    Classification(#[from] ClassificationError),

    #[error("filing failed: {0}")]
    Filing(#[from] FilingError),

    #[error("batch deadline passed before the item started")]
    Cancelled,
}

impl WorkflowError {
    /// Stable machine-readable category.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Extraction(ExtractionError::InvalidPath(_)) => "invalid_path",
            Self::Extraction(ExtractionError::UnsupportedMediaType(_)) => "unsupported_media_type",
            Self::Extraction(_) => "extraction_failed",
            Self::Classification(ClassificationError::Schema(_)) => "classification_schema",
            Self::Classification(ClassificationError::Service(_)) => "classification_service",
            Self::Filing(FilingError::InvalidFilename(_)) => "invalid_filename",
            Self::Filing(FilingError::Io { .. }) => "filing_io",
            Self::Cancelled => "cancelled",
        }
    }

    /// Generic message safe to show to API clients.
    ///
    /// Full detail (paths, provider bodies) stays in the logs.
    pub fn public_message(&self) -> &'static str {
        match self.category() {
            "invalid_path" => "The file is outside the allowed storage location",
            "unsupported_media_type" => "The file type is not supported",
            "extraction_failed" => "Text could not be extracted from the file",
            "classification_schema" => "The classifier returned an invalid response",
            "classification_service" => "The classification service is unavailable",
            "invalid_filename" => "The file name is not valid",
            "filing_io" => "The file could not be moved to its destination",
            _ => "The item was not processed before the batch deadline",
        }
    }
}

impl Serialize for WorkflowError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("WorkflowError", 2)?;
        s.serialize_field("category", self.category())?;
        s.serialize_field("message", self.public_message())?;
        s.end()
    }
}

/// Terminal record of one workflow run.
#[derive(Debug, Serialize)]
pub struct WorkflowOutcome {
    pub item_id: Uuid,
    pub filename: String,
    pub stage_reached: WorkflowStage,
    pub success: bool,
    pub error: Option<WorkflowError>,
    pub classification: Option<ClassificationResult>,
    pub destination: Option<PathBuf>,
    pub transitions: Vec<StageTransition>,
}

impl WorkflowOutcome {
    pub fn label(&self) -> Option<DocumentLabel> {
        self.classification.as_ref().map(|c| c.label)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.error, Some(WorkflowError::Cancelled))
    }

    pub fn destination_path(&self) -> Option<&Path> {
        self.destination.as_deref()
    }
}

// ── Batch report ────────────────────────────────────────────────────

/// Summary counts over a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Items that were started (skipped items excluded).
    pub processed: usize,
    pub invoices: usize,
    pub others: usize,
    pub failed: usize,
    /// Items abandoned at the batch deadline.
    pub skipped: usize,
}

/// Ordered outcomes plus counts.
#[derive(Debug, Serialize)]
pub struct BatchReport {
    pub outcomes: Vec<WorkflowOutcome>,
    pub summary: BatchSummary,
}

impl BatchReport {
    /// Build a report, counting once over the finished outcomes.
    pub fn from_outcomes(outcomes: Vec<WorkflowOutcome>) -> Self {
        let mut summary = BatchSummary::default();
        for outcome in &outcomes {
            if outcome.is_cancelled() {
                summary.skipped += 1;
                continue;
            }
            summary.processed += 1;
            match (outcome.success, outcome.label()) {
                (true, Some(DocumentLabel::Invoice)) => summary.invoices += 1,
                (true, Some(DocumentLabel::NonInvoice)) => summary.others += 1,
                _ => summary.failed += 1,
            }
        }
        Self { outcomes, summary }
    }

    pub fn empty() -> Self {
        Self::from_outcomes(Vec::new())
    }
}
