//! Storage layout: base path plus invoices/others/temp/failed folders.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::error::StorageError;
use crate::safety::sanitize_filename;

/// Resolved storage folders.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    base: PathBuf,
    invoices: PathBuf,
    others: PathBuf,
    temp: PathBuf,
    failed: PathBuf,
}

/// File counts per folder.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StorageStats {
    pub invoices: usize,
    pub others: usize,
    pub temp: usize,
    pub failed: usize,
    pub total_processed: usize,
}

impl StorageLayout {
    pub fn new(config: &StorageConfig) -> Self {
        let base = config.base_path.clone();
        Self {
            invoices: base.join(&config.invoices_folder),
            others: base.join(&config.others_folder),
            temp: base.join(&config.temp_folder),
            failed: base.join(&config.failed_folder),
            base,
        }
    }

    /// Layout with the default folder names under `base`.
    pub fn with_base(base: impl Into<PathBuf>) -> Self {
        Self::new(&StorageConfig {
            base_path: base.into(),
            ..StorageConfig::default()
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    pub fn invoices_dir(&self) -> &Path {
        &self.invoices
    }

    pub fn others_dir(&self) -> &Path {
        &self.others
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp
    }

    /// Recovery folder for files whose final move failed.
    pub fn failed_dir(&self) -> &Path {
        &self.failed
    }

    /// Create every folder, or fail if one cannot be created.
    pub async fn ensure_dirs(&self) -> Result<(), StorageError> {
        for dir in [&self.invoices, &self.others, &self.temp, &self.failed] {
            if let Ok(meta) = fs::metadata(dir).await
                && !meta.is_dir()
            {
                return Err(StorageError::NotADirectory(dir.clone()));
            }
            fs::create_dir_all(dir)
                .await
                .map_err(|source| StorageError::CreateDir {
                    path: dir.clone(),
                    source,
                })?;
        }
        info!(base = %self.base.display(), "Storage directories initialized");
        Ok(())
    }

    /// A fresh, unique temp path for an incoming file.
    ///
    /// The declared name is sanitized and prefixed with a UUID so two
    /// attachments with the same name never share a temp file.
    pub fn temp_path_for(&self, declared_filename: &str) -> PathBuf {
        let clean = sanitize_filename(declared_filename);
        let clean = if clean.is_empty() || clean == "." || clean == ".." {
            "attachment".to_string()
        } else {
            clean
        };
        self.temp.join(format!("{}-{}", Uuid::new_v4().simple(), clean))
    }

    /// Whether `path` sits inside the temp folder.
    pub fn is_temp_path(&self, path: &Path) -> bool {
        crate::safety::is_safe_path(path, &[&self.temp])
    }

    /// Count files in each folder (dotfiles such as `.gitkeep` are ignored).
    pub async fn stats(&self) -> Result<StorageStats, StorageError> {
        let invoices = count_files(&self.invoices).await?;
        let others = count_files(&self.others).await?;
        Ok(StorageStats {
            invoices,
            others,
            temp: count_files(&self.temp).await?,
            failed: count_files(&self.failed).await?,
            total_processed: invoices + others,
        })
    }

    /// Remove temp files whose modification time is older than `older_than`.
    ///
    /// Catches leftovers from a crashed process; a clean run never leaves any.
    pub async fn sweep_stale_temp(&self, older_than: Duration) -> Result<usize, StorageError> {
        let now = SystemTime::now();
        let mut removed = 0;
        let mut entries = match fs::read_dir(&self.temp).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() || is_hidden(&entry.path()) {
                continue;
            }
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age > older_than {
                match fs::remove_file(entry.path()).await {
                    Ok(()) => {
                        removed += 1;
                        debug!(path = %entry.path().display(), "Removed stale temp file");
                    }
                    Err(e) => {
                        warn!(path = %entry.path().display(), error = %e, "Failed to remove stale temp file");
                    }
                }
            }
        }

        if removed > 0 {
            info!(removed, "Cleaned up stale temporary files");
        }
        Ok(removed)
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

async fn count_files(dir: &Path) -> Result<usize, StorageError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut count = 0;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() && !is_hidden(&entry.path()) {
            count += 1;
        }
    }
    Ok(count)
}
