//! Invoice classifier.
//!
//! One model call per document. The answer must be a JSON object matching a
//! fixed schema; anything else is a `ClassificationError::Schema`. Retries are
//! the workflow engine's job, never done here.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::ClassificationError;
use crate::llm::provider::{ChatMessage, CompletionRequest, FinishReason, LlmProvider};
use crate::pipeline::types::{
    ClassificationResult, DocumentLabel, ExtractedFields, ExtractedText,
};

/// Max tokens for the classification answer.
const CLASSIFY_MAX_TOKENS: u32 = 512;

/// Classification must be repeatable for identical input.
const CLASSIFY_TEMPERATURE: f32 = 0.0;

const SCHEMA_NAME: &str = "document_classification";

/// Turns extracted text into a validated classification.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, text: &ExtractedText) -> Result<ClassificationResult, ClassificationError>;
}

/// Classifier backed by an `LlmProvider`.
pub struct LlmClassifier {
    llm: Arc<dyn LlmProvider>,
}

impl LlmClassifier {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Classifier for LlmClassifier {
    async fn classify(&self, text: &ExtractedText) -> Result<ClassificationResult, ClassificationError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_system_prompt()),
            ChatMessage::user(build_user_prompt(text)),
        ])
        .with_temperature(CLASSIFY_TEMPERATURE)
        .with_max_tokens(CLASSIFY_MAX_TOKENS)
        .with_response_schema(SCHEMA_NAME, response_schema());

        let response = self.llm.complete(request).await?;
        if response.finish_reason == FinishReason::Length {
            debug!("Classification answer hit the token limit");
        }

        let result = parse_classification(&response.content).map_err(|e| {
            warn!(
                raw_response = %response.content,
                error = %e,
                "Classification response rejected"
            );
            e
        })?;

        info!(
            label = %result.label,
            confidence = result.confidence,
            model = self.llm.model_name(),
            "Document classified"
        );
        Ok(result)
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_system_prompt() -> String {
    "You are a document classifier that decides whether a document is an invoice.\n\n\
     An invoice typically contains:\n\
     - an invoice number or ID\n\
     - an issue date and often a due date\n\
     - seller/vendor identity (name, address, tax ID)\n\
     - buyer/customer identity\n\
     - line items with descriptions, quantities and prices\n\
     - subtotal, taxes and a total amount due\n\
     - payment terms or payment instructions\n\n\
     Quotes, receipts for personal purchases, order confirmations, statements, \
     newsletters and correspondence are not invoices unless they request payment \
     for itemised goods or services.\n\n\
     Respond with ONLY a JSON object:\n\
     {\"label\": \"invoice\" | \"non_invoice\", \"confidence\": 0.0-1.0, \"rationale\": \"...\", \
     \"extracted_fields\": {\"invoice_number\": ..., \"date\": ..., \"vendor\": ..., \"total\": ...}}\n\n\
     Rules:\n\
     - confidence is your probability that the label is correct, between 0.0 and 1.0\n\
     - rationale is one or two sentences\n\
     - use null for any field not present in the document; never guess values"
        .to_string()
}

fn build_user_prompt(text: &ExtractedText) -> String {
    let mut prompt = String::with_capacity(text.text.len() + 128);
    prompt.push_str("Classify the following document.\n");
    if text.truncated {
        prompt.push_str("Note: the text was truncated; only the beginning of the document is shown.\n");
    }
    prompt.push_str("\nDocument text:\n");
    if text.text.trim().is_empty() {
        prompt.push_str("(no extractable text)");
    } else {
        prompt.push_str(&text.text);
        if text.truncated {
            prompt.push_str("\n... (truncated)");
        }
    }
    prompt
}

/// Strict structured-output schema. Every property is required; optional
/// fields are expressed as nullable.
fn response_schema() -> Value {
    let nullable_string = json!({"type": ["string", "null"]});
    json!({
        "type": "object",
        "properties": {
            "label": {"type": "string", "enum": ["invoice", "non_invoice"]},
            "confidence": {"type": "number", "minimum": 0, "maximum": 1},
            "rationale": {"type": "string"},
            "extracted_fields": {
                "type": "object",
                "properties": {
                    "invoice_number": nullable_string,
                    "date": nullable_string,
                    "vendor": nullable_string,
                    "total": nullable_string,
                },
                "required": ["invoice_number", "date", "vendor", "total"],
                "additionalProperties": false,
            },
        },
        "required": ["label", "confidence", "rationale", "extracted_fields"],
        "additionalProperties": false,
    })
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ClassificationResponse {
    label: DocumentLabel,
    confidence: f64,
    rationale: String,
    #[serde(default)]
    extracted_fields: Option<FieldsResponse>,
}

#[derive(Debug, Default, Deserialize)]
struct FieldsResponse {
    #[serde(default)]
    invoice_number: Option<Value>,
    #[serde(default)]
    date: Option<Value>,
    #[serde(default)]
    vendor: Option<Value>,
    #[serde(default)]
    total: Option<Value>,
}

/// Parse and validate a model answer.
pub fn parse_classification(raw: &str) -> Result<ClassificationResult, ClassificationError> {
    let json_str = extract_json_object(raw);
    let response: ClassificationResponse = serde_json::from_str(json_str)
        .map_err(|e| ClassificationError::Schema(format!("JSON parse error: {e}")))?;

    if !(0.0..=1.0).contains(&response.confidence) {
        return Err(ClassificationError::Schema(format!(
            "confidence {} is outside [0, 1]",
            response.confidence
        )));
    }

    let fields = response.extracted_fields.unwrap_or_default();
    Ok(ClassificationResult {
        label: response.label,
        confidence: response.confidence,
        rationale: response.rationale.trim().to_string(),
        extracted_fields: ExtractedFields {
            invoice_number: scalar_field("invoice_number", fields.invoice_number)?,
            date: scalar_field("date", fields.date)?,
            vendor: scalar_field("vendor", fields.vendor)?,
            total: scalar_field("total", fields.total)?,
        },
    })
}

/// Strings and numbers are accepted; null and blank strings mean absent.
fn scalar_field(name: &str, value: Option<Value>) -> Result<Option<String>, ClassificationError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let s = s.trim();
            Ok((!s.is_empty()).then(|| s.to_string()))
        }
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(ClassificationError::Schema(format!(
            "field {name} must be a string or number, got {other}"
        ))),
    }
}

/// The object inside a model answer: the contents of a ``` fence if there
/// is one, cut to the span from the first `{` to the last `}`.
fn extract_json_object(text: &str) -> &str {
    let mut body = text.trim();
    if let Some(start) = body.find("```") {
        let after = &body[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            body = after[..end].trim();
        }
    }

    match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if end > start => &body[start..=end],
        _ => body,
    }
}
