//! LLM integration for Invoice Agent.
//!
//! The classifier talks to the model through the `LlmProvider` trait; the
//! only production backend is OpenAI's chat-completions API.

mod openai;
pub mod provider;

pub use openai::OpenAiProvider;
pub use provider::*;

use std::sync::Arc;
use std::time::Duration;

use crate::error::LlmError;

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: secrecy::SecretString,
    pub model: String,
    pub base_url: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let provider = OpenAiProvider::new(config)?;
    tracing::info!("Using OpenAI (model: {})", config.model);
    Ok(Arc::new(provider))
}
