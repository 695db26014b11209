//! Workflow engine: drives one attachment through
//! extract → classify → file → clean up.
//!
//! Every stage error is caught here and turned into a failed
//! `WorkflowOutcome`; nothing propagates to the aggregator. The temp file is
//! owned by a `TempFileGuard` that is released exactly once on every path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::error::FilingError;
use crate::extract::TextExtractor;
use crate::pipeline::classifier::Classifier;
use crate::pipeline::filing::{FilingPolicy, first_free_name, move_file};
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::state::{StageTracker, WorkflowStage};
use crate::pipeline::types::{
    AttachmentItem, ClassificationResult, ExtractedText, WorkflowError, WorkflowOutcome,
};
use crate::storage::StorageLayout;

// ── Temp file ownership ─────────────────────────────────────────────

/// Owns a temp file for the duration of a run.
///
/// Armed only for files inside the temp root; sources elsewhere are never
/// deleted by the engine. Dropping an armed guard removes the file.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf, in_temp_root: bool) -> Self {
        Self {
            path,
            armed: in_temp_root,
        }
    }

    fn is_armed(&self) -> bool {
        self.armed
    }

    /// The file now lives elsewhere; nothing to clean.
    fn disarm(&mut self) {
        self.armed = false;
    }

    /// Remove the temp file if still owned. Returns whether anything was removed.
    async fn release(mut self) -> bool {
        if !self.armed {
            return false;
        }
        self.armed = false;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "Temp file removed");
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to remove temp file");
                false
            }
        }
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            warn!(path = %self.path.display(), "Temp file guard dropped while armed");
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

// ── Engine ──────────────────────────────────────────────────────────

/// Engine step. Each variant carries exactly what the next stage needs,
/// so a stage cannot run without its input.
enum Step {
    Extract,
    Classify(ExtractedText),
    File(ClassificationResult),
    CleanUp {
        classification: ClassificationResult,
        destination: PathBuf,
    },
    Fail {
        error: WorkflowError,
        classification: Option<ClassificationResult>,
    },
}

pub struct WorkflowEngine {
    extractor: Arc<dyn TextExtractor>,
    classifier: Arc<dyn Classifier>,
    filing: FilingPolicy,
    retry: RetryPolicy,
    storage: StorageLayout,
}

impl WorkflowEngine {
    pub fn new(
        extractor: Arc<dyn TextExtractor>,
        classifier: Arc<dyn Classifier>,
        storage: StorageLayout,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            extractor,
            classifier,
            filing: FilingPolicy::from_layout(&storage),
            retry,
            storage,
        }
    }

    pub fn storage(&self) -> &StorageLayout {
        &self.storage
    }

    /// Run one item to a terminal stage.
    pub async fn run(&self, item: AttachmentItem) -> WorkflowOutcome {
        let mut tracker = StageTracker::new();
        let mut guard = TempFileGuard::new(
            item.source_path.clone(),
            self.storage.is_temp_path(&item.source_path),
        );

        info!(
            item_id = %item.id,
            filename = %item.declared_filename,
            media_type = %item.media_type,
            size_bytes = item.size_bytes,
            "Workflow started"
        );

        let mut step = Step::Extract;
        loop {
            step = match step {
                Step::Extract => {
                    advance(&mut tracker, &item, WorkflowStage::Extracting, None);
                    match self.extractor.extract(&item.source_path, &item.media_type).await {
                        Ok(text) => Step::Classify(text),
                        Err(e) => Step::Fail {
                            error: e.into(),
                            classification: None,
                        },
                    }
                }
                Step::Classify(text) => {
                    let reason = format!(
                        "{} chars{}",
                        text.text.chars().count(),
                        if text.truncated { ", truncated" } else { "" }
                    );
                    advance(&mut tracker, &item, WorkflowStage::Classifying, Some(reason));
                    match self.classify(&item, &text).await {
                        Ok(classification) => Step::File(classification),
                        Err(error) => Step::Fail {
                            error,
                            classification: None,
                        },
                    }
                }
                Step::File(classification) => {
                    advance(
                        &mut tracker,
                        &item,
                        WorkflowStage::Filing,
                        Some(classification.label.to_string()),
                    );
                    match self.file(&item, &classification, &mut guard).await {
                        Ok(destination) => Step::CleanUp {
                            classification,
                            destination,
                        },
                        Err(e) => Step::Fail {
                            error: e.into(),
                            classification: Some(classification),
                        },
                    }
                }
                Step::CleanUp {
                    classification,
                    destination,
                } => {
                    advance(&mut tracker, &item, WorkflowStage::CleaningUp, None);
                    guard.release().await;
                    advance(&mut tracker, &item, WorkflowStage::Done, None);

                    info!(
                        item_id = %item.id,
                        label = %classification.label,
                        confidence = classification.confidence,
                        destination = %destination.display(),
                        "Workflow complete"
                    );
                    return WorkflowOutcome {
                        item_id: item.id,
                        filename: item.declared_filename,
                        stage_reached: tracker.stage_reached(),
                        success: true,
                        error: None,
                        classification: Some(classification),
                        destination: Some(destination),
                        transitions: tracker.into_transitions(),
                    };
                }
                Step::Fail {
                    error,
                    classification,
                } => {
                    let removed = guard.release().await;
                    advance(
                        &mut tracker,
                        &item,
                        WorkflowStage::Failed,
                        Some(error.category().to_string()),
                    );

                    warn!(
                        item_id = %item.id,
                        stage = %tracker.stage_reached(),
                        temp_removed = removed,
                        error = %error,
                        "Workflow failed"
                    );
                    return WorkflowOutcome {
                        item_id: item.id,
                        filename: item.declared_filename,
                        stage_reached: tracker.stage_reached(),
                        success: false,
                        error: Some(error),
                        classification,
                        destination: None,
                        transitions: tracker.into_transitions(),
                    };
                }
            };
        }
    }

    /// Outcome for an item abandoned before it started. Its temp file is
    /// still released.
    pub async fn cancel(&self, item: AttachmentItem) -> WorkflowOutcome {
        let guard = TempFileGuard::new(
            item.source_path.clone(),
            self.storage.is_temp_path(&item.source_path),
        );
        guard.release().await;
        info!(item_id = %item.id, filename = %item.declared_filename, "Item skipped at batch deadline");

        WorkflowOutcome {
            item_id: item.id,
            filename: item.declared_filename,
            stage_reached: WorkflowStage::Pending,
            success: false,
            error: Some(WorkflowError::Cancelled),
            classification: None,
            destination: None,
            transitions: Vec::new(),
        }
    }

    async fn classify(
        &self,
        item: &AttachmentItem,
        text: &ExtractedText,
    ) -> Result<ClassificationResult, WorkflowError> {
        self.retry
            .run(|attempt| {
                debug!(item_id = %item.id, attempt, "Classifying");
                self.classifier.classify(text)
            })
            .await
            .map_err(WorkflowError::from)
    }

    /// Decide, re-check, move. On a failed move the temp file is parked in
    /// the recovery folder.
    async fn file(
        &self,
        item: &AttachmentItem,
        classification: &ClassificationResult,
        guard: &mut TempFileGuard,
    ) -> Result<PathBuf, FilingError> {
        let decision = self.filing.decide(classification, &item.declared_filename)?;

        // Re-check right before the move; the folder may have changed since.
        let mut destination = decision.path();
        if tokio::fs::symlink_metadata(&destination).await.is_ok() {
            let again = self.filing.decide(classification, &item.declared_filename)?;
            warn!(
                item_id = %item.id,
                stale = %destination.display(),
                fresh = %again.path().display(),
                "Destination taken since decision, re-deciding"
            );
            destination = again.path();
        }

        match move_file(&item.source_path, &destination).await {
            Ok(()) => {
                guard.disarm();
                Ok(destination)
            }
            Err(e) => {
                self.park_for_recovery(item, guard).await;
                Err(e)
            }
        }
    }

    /// Move a temp file whose filing failed into the recovery folder.
    /// If that fails too, the file stays where it is.
    async fn park_for_recovery(&self, item: &AttachmentItem, guard: &mut TempFileGuard) {
        if !guard.is_armed() {
            warn!(
                item_id = %item.id,
                path = %item.source_path.display(),
                "Filing failed; source left in place"
            );
            return;
        }

        let name = file_name_or_id(&item.source_path, item);
        let target = self
            .storage
            .failed_dir()
            .join(first_free_name(self.storage.failed_dir(), &name));
        match move_file(&item.source_path, &target).await {
            Ok(()) => {
                warn!(item_id = %item.id, path = %target.display(), "Filing failed; file parked for recovery");
            }
            Err(e) => {
                error!(
                    item_id = %item.id,
                    path = %item.source_path.display(),
                    error = %e,
                    "Filing failed and recovery move failed; source left in place"
                );
            }
        }
        // Either way the engine no longer owns a deletable copy.
        guard.disarm();
    }
}

fn file_name_or_id(path: &Path, item: &AttachmentItem) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| item.id.to_string())
}

fn advance(
    tracker: &mut StageTracker,
    item: &AttachmentItem,
    next: WorkflowStage,
    reason: Option<String>,
) {
    let from = tracker.stage();
    match tracker.transition_to(next, reason) {
        Ok(()) => debug!(item_id = %item.id, %from, to = %next, "Stage transition"),
        Err(e) => error!(item_id = %item.id, error = %e, "Illegal stage transition"),
    }
}
