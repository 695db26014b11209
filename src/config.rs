//! Configuration types.
//!
//! Everything is read from environment variables once at process start and
//! passed down by reference. `from_lookup` takes any key → value function so
//! tests can supply a map instead of touching the process environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::llm::LlmConfig;
use crate::mail::EmailConfig;

/// Default hard ceiling on extracted text, in characters.
pub const DEFAULT_MAX_TEXT_CHARS: usize = 10_000;

/// Default upload ceiling: 50MB.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

/// Full application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub workflow: WorkflowConfig,
    pub logging: LoggingConfig,
    /// `None` when `EMAIL_IMAP_HOST` is unset (email intake disabled).
    pub email: Option<EmailConfig>,
    /// Background email check interval. `None` disables the poller.
    pub email_check_interval: Option<Duration>,
    pub max_emails_per_check: usize,
}

/// HTTP server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_upload_bytes: usize,
}

/// Storage root and subfolder names.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub base_path: PathBuf,
    pub invoices_folder: String,
    pub others_folder: String,
    pub temp_folder: String,
    pub failed_folder: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./storage"),
            invoices_folder: "invoices".to_string(),
            others_folder: "others".to_string(),
            temp_folder: "temp".to_string(),
            failed_folder: "failed".to_string(),
        }
    }
}

/// Workflow engine tuning.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub max_text_chars: usize,
    /// Retries after the first classification attempt (transient errors only).
    pub classify_max_retries: u32,
    pub classify_backoff: Duration,
    pub batch_timeout: Option<Duration>,
    pub tesseract_path: PathBuf,
    pub ocr_timeout: Duration,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_text_chars: DEFAULT_MAX_TEXT_CHARS,
            classify_max_retries: 2,
            classify_backoff: Duration::from_millis(500),
            batch_timeout: None,
            tesseract_path: PathBuf::from("tesseract"),
            ocr_timeout: Duration::from_secs(60),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub file: PathBuf,
}

impl AppConfig {
    /// Build configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key → value lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = lookup("OPENAI_API_KEY")
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("OPENAI_API_KEY".to_string()))?;

        let llm = LlmConfig {
            api_key: SecretString::from(api_key),
            model: lookup("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            base_url: lookup("OPENAI_BASE_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            timeout: Duration::from_secs(parse_or(&lookup, "LLM_TIMEOUT_SECS", 60)?),
        };

        let server = ServerConfig {
            host: lookup("API_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or(&lookup, "API_PORT", 8000)?,
            max_upload_bytes: parse_or(&lookup, "MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES)?,
        };

        let defaults = StorageConfig::default();
        let storage = StorageConfig {
            base_path: lookup("STORAGE_BASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.base_path),
            invoices_folder: folder_name(&lookup, "INVOICES_FOLDER", defaults.invoices_folder)?,
            others_folder: folder_name(&lookup, "OTHERS_FOLDER", defaults.others_folder)?,
            temp_folder: folder_name(&lookup, "TEMP_FOLDER", defaults.temp_folder)?,
            failed_folder: folder_name(&lookup, "FAILED_FOLDER", defaults.failed_folder)?,
        };

        let max_text_chars: usize = parse_or(&lookup, "MAX_TEXT_CHARS", DEFAULT_MAX_TEXT_CHARS)?;
        if max_text_chars == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAX_TEXT_CHARS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        let workflow = WorkflowConfig {
            max_text_chars,
            classify_max_retries: parse_or(&lookup, "CLASSIFY_MAX_RETRIES", 2)?,
            classify_backoff: Duration::from_millis(parse_or(&lookup, "CLASSIFY_BACKOFF_MS", 500)?),
            batch_timeout: parse_opt::<u64, _>(&lookup, "BATCH_TIMEOUT_SECS")?
                .map(Duration::from_secs),
            tesseract_path: lookup("TESSERACT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("tesseract")),
            ocr_timeout: Duration::from_secs(parse_or(&lookup, "OCR_TIMEOUT_SECS", 60)?),
        };

        let logging = LoggingConfig {
            level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            file: lookup("LOG_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./logs/app.log")),
        };

        let email = EmailConfig::from_lookup(&lookup)?;

        let interval_secs: u64 = parse_or(&lookup, "EMAIL_CHECK_INTERVAL", 300)?;
        let email_check_interval = (interval_secs > 0).then(|| Duration::from_secs(interval_secs));

        Ok(Self {
            llm,
            server,
            storage,
            workflow,
            logging,
            email,
            email_check_interval,
            max_emails_per_check: parse_or(&lookup, "MAX_EMAILS_PER_CHECK", 10)?,
        })
    }
}

/// Parse an optional variable, falling back to `default` when unset or blank.
pub(crate) fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_opt(lookup, key)?.unwrap_or(default))
}

pub(crate) fn parse_opt<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map(Some)
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })
        }
        _ => Ok(None),
    }
}

/// Subfolder names must be a single plain path component.
fn folder_name<F>(lookup: &F, key: &str, default: String) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let name = lookup(key).unwrap_or(default);
    let plain = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\');
    if plain {
        Ok(name)
    } else {
        Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{name:?} is not a plain folder name"),
        })
    }
}
