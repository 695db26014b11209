//! Filing policy: label → folder, plus collision-free destination names.
//!
//! Collision checks are check-then-move. Callers must serialise runs (the
//! aggregator holds a lock) and re-check immediately before moving.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::FilingError;
use crate::pipeline::types::{ClassificationResult, DocumentLabel, FilingDecision};
use crate::safety::sanitize_filename;
use crate::storage::StorageLayout;

#[derive(Debug, Clone)]
pub struct FilingPolicy {
    invoices_dir: PathBuf,
    others_dir: PathBuf,
}

impl FilingPolicy {
    pub fn new(invoices_dir: impl Into<PathBuf>, others_dir: impl Into<PathBuf>) -> Self {
        Self {
            invoices_dir: invoices_dir.into(),
            others_dir: others_dir.into(),
        }
    }

    pub fn from_layout(layout: &StorageLayout) -> Self {
        Self::new(layout.invoices_dir(), layout.others_dir())
    }

    pub fn folder_for(&self, label: DocumentLabel) -> &Path {
        match label {
            DocumentLabel::Invoice => &self.invoices_dir,
            DocumentLabel::NonInvoice => &self.others_dir,
        }
    }

    /// Compute the destination for a classified file.
    ///
    /// Reads the destination folder but never writes to it, so repeated
    /// calls with no filesystem change return the same decision.
    pub fn decide(
        &self,
        classification: &ClassificationResult,
        proposed_filename: &str,
    ) -> Result<FilingDecision, FilingError> {
        let clean = valid_filename(proposed_filename)?;
        let folder = self.folder_for(classification.label).to_path_buf();
        let destination_filename = first_free_name(&folder, &clean);
        if destination_filename != clean {
            debug!(
                proposed = %clean,
                chosen = %destination_filename,
                "Destination name taken, using suffix"
            );
        }
        Ok(FilingDecision {
            destination_folder: folder,
            destination_filename,
        })
    }
}

/// Sanitize a proposed name and reject ones that cannot name a file.
pub(crate) fn valid_filename(proposed: &str) -> Result<String, FilingError> {
    let clean = sanitize_filename(proposed);
    if clean.is_empty() || clean == "." || clean == ".." {
        return Err(FilingError::InvalidFilename(proposed.to_string()));
    }
    Ok(clean)
}

fn occupied(path: &Path) -> bool {
    // symlink_metadata so a dangling link still counts as taken.
    std::fs::symlink_metadata(path).is_ok()
}

/// `name` if free in `folder`, else the first free `stem_N.ext` with N from 1.
pub(crate) fn first_free_name(folder: &Path, name: &str) -> String {
    if !occupied(&folder.join(name)) {
        return name.to_string();
    }

    let as_path = Path::new(name);
    let stem = as_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name);
    let ext = as_path.extension().and_then(|e| e.to_str());

    let mut n: u64 = 1;
    loop {
        let candidate = match ext {
            Some(ext) => format!("{stem}_{n}.{ext}"),
            None => format!("{stem}_{n}"),
        };
        if !occupied(&folder.join(&candidate)) {
            return candidate;
        }
        n += 1;
    }
}

/// Move `from` to `to`, falling back to copy + remove across filesystems.
pub async fn move_file(from: &Path, to: &Path) -> Result<(), FilingError> {
    let io_err = |source: std::io::Error| FilingError::Io {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    };

    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(io_err(e)),
        Err(rename_err) => {
            debug!(error = %rename_err, "rename failed, trying copy");
            let existed = tokio::fs::symlink_metadata(to).await.is_ok();
            if let Err(e) = tokio::fs::copy(from, to).await {
                // A half-written copy would shift later collision suffixes.
                if !existed {
                    let _ = tokio::fs::remove_file(to).await;
                }
                return Err(io_err(e));
            }
            if let Err(e) = tokio::fs::remove_file(from).await {
                // The copy landed; drop it so the file exists exactly once.
                let _ = tokio::fs::remove_file(to).await;
                return Err(io_err(e));
            }
            warn!(from = %from.display(), to = %to.display(), "Moved file by copy");
            Ok(())
        }
    }
}
