//! Email/transport collaborator.
//!
//! A [`MailSource`] fetches emails, stores their attachments in temp storage,
//! and marks emails as read once they have been handled.

mod imap;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::Serialize;

use crate::config::parse_or;
use crate::error::{ConfigError, MailError};
use crate::pipeline::types::AttachmentItem;
use crate::storage::StorageLayout;

pub use imap::ImapMailbox;

// ── Configuration ───────────────────────────────────────────────────

/// IMAP mailbox configuration.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub mailbox: String,
}

impl EmailConfig {
    /// Returns `None` if `EMAIL_IMAP_HOST` is not set (email intake disabled).
    pub fn from_lookup<F>(lookup: &F) -> Result<Option<Self>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(host) = lookup("EMAIL_IMAP_HOST").filter(|h| !h.trim().is_empty()) else {
            return Ok(None);
        };

        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
        };

        Ok(Some(Self {
            host,
            port: parse_or(lookup, "EMAIL_IMAP_PORT", 993)?,
            username: required("EMAIL_USERNAME")?,
            password: SecretString::from(required("EMAIL_PASSWORD")?),
            mailbox: lookup("EMAIL_MAILBOX").unwrap_or_else(|| "INBOX".to_string()),
        }))
    }
}

// ── Mail source ─────────────────────────────────────────────────────

/// An email with its attachments already written to temp storage.
#[derive(Debug, Clone, Serialize)]
pub struct FetchedEmail {
    /// Mailbox-specific identifier passed back to [`MailSource::mark_read`].
    pub id: String,
    pub subject: String,
    pub sender: String,
    pub received_at: Option<DateTime<Utc>>,
    pub attachments: Vec<AttachmentItem>,
}

#[async_trait]
pub trait MailSource: Send + Sync {
    /// Fetch up to `max` emails, writing attachments under the temp folder
    /// of `storage`. Fetching must not change the read state.
    async fn fetch_emails(
        &self,
        max: usize,
        unread_only: bool,
        storage: &StorageLayout,
    ) -> Result<Vec<FetchedEmail>, MailError>;

    async fn mark_read(&self, email_id: &str) -> Result<(), MailError>;
}

/// Write one attachment's bytes to a fresh temp path.
pub(crate) fn store_attachment(
    storage: &StorageLayout,
    declared_filename: &str,
    media_type: &str,
    bytes: &[u8],
) -> Result<AttachmentItem, MailError> {
    let path = storage.temp_path_for(declared_filename);
    write_new(&path, bytes)?;
    Ok(AttachmentItem::new(
        path,
        declared_filename,
        media_type,
        bytes.len() as u64,
    ))
}

fn write_new(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    create_then(path, |file| {
        file.write_all(bytes)?;
        file.sync_all()
    })
}

/// Create `path` (which must not exist) and run `fill` on it. A file that
/// `fill` fails on is removed again.
fn create_then<F>(path: &Path, fill: F) -> std::io::Result<()>
where
    F: FnOnce(&mut std::fs::File) -> std::io::Result<()>,
{
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    let result = fill(&mut file);
    drop(file);
    if result.is_err() {
        let _ = std::fs::remove_file(path);
    }
    result
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn disabled_without_host() {
        assert!(EmailConfig::from_lookup(&lookup(&[])).unwrap().is_none());
    }

    #[test]
    fn defaults_applied() {
        let config = EmailConfig::from_lookup(&lookup(&[
            ("EMAIL_IMAP_HOST", "imap.example.com"),
            ("EMAIL_USERNAME", "ap@example.com"),
            ("EMAIL_PASSWORD", "hunter2"),
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(config.port, 993);
        assert_eq!(config.mailbox, "INBOX");
        assert_eq!(config.password.expose_secret(), "hunter2");
    }

    #[test]
    fn host_without_credentials_is_an_error() {
        let err = EmailConfig::from_lookup(&lookup(&[("EMAIL_IMAP_HOST", "imap.example.com")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "EMAIL_USERNAME"));
    }

    #[test]
    fn bad_port_is_an_error() {
        let err = EmailConfig::from_lookup(&lookup(&[
            ("EMAIL_IMAP_HOST", "imap.example.com"),
            ("EMAIL_IMAP_PORT", "imaps"),
            ("EMAIL_USERNAME", "u"),
            ("EMAIL_PASSWORD", "p"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn attachments_with_same_name_get_distinct_paths() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageLayout::with_base(dir.path());
        std::fs::create_dir_all(storage.temp_dir()).unwrap();

        let a = store_attachment(&storage, "invoice.pdf", "application/pdf", b"one").unwrap();
        let b = store_attachment(&storage, "invoice.pdf", "application/pdf", b"two").unwrap();
        assert_ne!(a.source_path, b.source_path);
        assert_eq!(a.declared_filename, "invoice.pdf");
        assert_eq!(a.size_bytes, 3);
        assert_eq!(std::fs::read(&b.source_path).unwrap(), b"two");
        assert!(storage.is_temp_path(&a.source_path));
    }

    #[test]
    fn hostile_names_stay_in_temp() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageLayout::with_base(dir.path());
        std::fs::create_dir_all(storage.temp_dir()).unwrap();

        let item = store_attachment(&storage, "../../etc/passwd", "text/plain", b"x").unwrap();
        assert!(storage.is_temp_path(&item.source_path));
    }

    #[test]
    fn failed_write_removes_the_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part.bin");

        let err = create_then(&path, |file| {
            use std::io::Write;
            file.write_all(b"half")?;
            Err(std::io::Error::other("disk full"))
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "disk full");
        assert!(!path.exists());
    }

    #[test]
    fn existing_file_is_never_clobbered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taken.bin");
        std::fs::write(&path, b"original").unwrap();

        let err = write_new(&path, b"new").unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::AlreadyExists);
        assert_eq!(std::fs::read(&path).unwrap(), b"original");
    }
}
