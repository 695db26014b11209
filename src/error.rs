//! Error types for Invoice Agent.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Classification error: {0}")]
    Classification(#[from] ClassificationError),

    #[error("Filing error: {0}")]
    Filing(#[from] FilingError),

    #[error("Mail error: {0}")]
    Mail(#[from] MailError),
}

/// Configuration-related errors. Fatal at process start.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Storage root errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Cannot create storage folder {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Storage path {0} exists but is not a directory")]
    NotADirectory(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Document formats the extractor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    Docx,
    PlainText,
    Image,
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::PlainText => "text",
            Self::Image => "image",
        };
        write!(f, "{s}")
    }
}

/// Text extraction errors.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("Path is outside the allowed storage roots: {0}")]
    InvalidPath(String),

    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("Corrupted image: {0}")]
    CorruptedImage(String),

    #[error("Failed to extract {format} content: {reason}")]
    Format {
        format: DocumentFormat,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Model provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} timed out")]
    Timeout { provider: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Provider {provider} server error (HTTP {status})")]
    ServerError { provider: String, status: u16 },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Quota exhausted for provider {provider}")]
    QuotaExceeded { provider: String },

    #[error("Provider {provider} rejected the request (HTTP {status}): {reason}")]
    InvalidRequest {
        provider: String,
        status: u16,
        reason: String,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

impl LlmError {
    /// Transport, rate-limit and server-side failures that may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RequestFailed { .. }
                | Self::Timeout { .. }
                | Self::RateLimited { .. }
                | Self::ServerError { .. }
        )
    }

    /// Server-suggested delay before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Classification errors.
#[derive(Debug, thiserror::Error)]
pub enum ClassificationError {
    /// The model answered, but not in the expected shape. Never retried.
    #[error("Classification response does not match the schema: {0}")]
    Schema(String),

    #[error("Classification service error: {0}")]
    Service(#[from] LlmError),
}

impl ClassificationError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Schema(_) => false,
            Self::Service(e) => e.is_transient(),
        }
    }
}

/// Filing errors.
#[derive(Debug, thiserror::Error)]
pub enum FilingError {
    #[error("Invalid filename: {0:?}")]
    InvalidFilename(String),

    #[error("Failed to move {from} to {to}: {source}")]
    Io {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Email transport errors.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Mailbox connection failed: {0}")]
    Connection(String),

    #[error("Mailbox login failed")]
    LoginFailed,

    #[error("IMAP command {command} failed: {reason}")]
    Command { command: String, reason: String },

    #[error("Failed to store attachment: {0}")]
    Attachment(#[from] std::io::Error),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_llm_errors() {
        assert!(
            LlmError::RateLimited {
                provider: "openai".into(),
                retry_after: None
            }
            .is_transient()
        );
        assert!(
            LlmError::ServerError {
                provider: "openai".into(),
                status: 503
            }
            .is_transient()
        );
        assert!(
            LlmError::Timeout {
                provider: "openai".into()
            }
            .is_transient()
        );
        assert!(
            !LlmError::AuthFailed {
                provider: "openai".into()
            }
            .is_transient()
        );
        assert!(
            !LlmError::QuotaExceeded {
                provider: "openai".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn schema_errors_are_never_retryable() {
        assert!(!ClassificationError::Schema("bad".into()).is_retryable());
        let service = ClassificationError::from(LlmError::RequestFailed {
            provider: "openai".into(),
            reason: "connection reset".into(),
        });
        assert!(service.is_retryable());
    }

    #[test]
    fn retry_after_only_for_rate_limits() {
        let limited = LlmError::RateLimited {
            provider: "openai".into(),
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(3)));
        let server = LlmError::ServerError {
            provider: "openai".into(),
            status: 500,
        };
        assert_eq!(server.retry_after(), None);
    }
}
