//! OpenAI chat-completions client over reqwest.
//!
//! Talks to `{base_url}/chat/completions` directly so HTTP status codes and
//! the `Retry-After` header are visible when mapping failures to `LlmError`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::error::LlmError;
use crate::llm::LlmConfig;
use crate::llm::provider::{
    CompletionRequest, CompletionResponse, FinishReason, LlmProvider,
};

const PROVIDER: &str = "openai";

/// Longest error body we copy into an error message.
const MAX_ERROR_BODY_CHARS: usize = 300;

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: secrecy::SecretString,
    model: String,
    endpoint: String,
}

impl OpenAiProvider {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("Failed to create HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
        })
    }

    fn request_body(&self, request: &CompletionRequest) -> serde_json::Value {
        let mut body = json!({
            "model": self.model,
            "messages": request.messages,
        });
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(max) = request.max_tokens {
            body["max_tokens"] = json!(max);
        }
        if let Some(ref schema) = request.response_schema {
            body["response_format"] = json!({
                "type": "json_schema",
                "json_schema": {
                    "name": schema.name,
                    "strict": true,
                    "schema": schema.schema,
                }
            });
        }
        body
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = self.request_body(&request);

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(resp.headers());
            let text = resp.text().await.unwrap_or_default();
            let err = map_status_error(status, retry_after, &text);
            warn!(status = %status, error = %err, "OpenAI request failed");
            return Err(err);
        }

        let envelope: ChatCompletion = resp.json().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout {
                    provider: PROVIDER.to_string(),
                }
            } else {
                invalid_response(format!("malformed response body: {e}"))
            }
        })?;

        let response = envelope.into_response()?;
        debug!(
            model = %self.model,
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "OpenAI completion finished"
        );
        Ok(response)
    }
}

// ── Response envelope ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: AssistantMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl ChatCompletion {
    fn into_response(self) -> Result<CompletionResponse, LlmError> {
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| invalid_response("response has no choices".to_string()))?;

        if let Some(refusal) = choice.message.refusal {
            return Err(invalid_response(format!("model refused: {refusal}")));
        }
        let content = choice
            .message
            .content
            .ok_or_else(|| invalid_response("response message has no content".to_string()))?;

        let (input_tokens, output_tokens) = self
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((0, 0));

        Ok(CompletionResponse {
            content,
            input_tokens,
            output_tokens,
            finish_reason: FinishReason::from_api(choice.finish_reason.as_deref()),
            response_id: self.id,
        })
    }
}

// ── Error mapping ───────────────────────────────────────────────────

fn invalid_response(reason: String) -> LlmError {
    LlmError::InvalidResponse {
        provider: PROVIDER.to_string(),
        reason,
    }
}

fn map_transport_error(e: reqwest::Error) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout {
            provider: PROVIDER.to_string(),
        }
    } else {
        LlmError::RequestFailed {
            provider: PROVIDER.to_string(),
            reason: e.to_string(),
        }
    }
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Error code reported in an OpenAI error body, if present.
fn error_code(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let error = value.get("error")?;
    error
        .get("code")
        .and_then(|c| c.as_str())
        .or_else(|| error.get("type").and_then(|t| t.as_str()))
        .map(str::to_string)
}

fn map_status_error(status: StatusCode, retry_after: Option<Duration>, body: &str) -> LlmError {
    let provider = PROVIDER.to_string();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmError::AuthFailed { provider },
        StatusCode::TOO_MANY_REQUESTS => {
            if error_code(body).as_deref() == Some("insufficient_quota") {
                LlmError::QuotaExceeded { provider }
            } else {
                LlmError::RateLimited {
                    provider,
                    retry_after,
                }
            }
        }
        s if s.is_server_error() => LlmError::ServerError {
            provider,
            status: s.as_u16(),
        },
        s => LlmError::InvalidRequest {
            provider,
            status: s.as_u16(),
            reason: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
        },
    }
}
