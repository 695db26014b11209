//! End-to-end tests for the document workflow.
//!
//! Real extractor and classifier over files in a temp storage root; only the
//! model provider is stubbed.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use invoice_agent::error::LlmError;
use invoice_agent::extract::{DocumentExtractor, OcrEngine};
use invoice_agent::llm::provider::{
    CompletionRequest, CompletionResponse, FinishReason, LlmProvider,
};
use invoice_agent::pipeline::aggregator::RunAggregator;
use invoice_agent::pipeline::classifier::LlmClassifier;
use invoice_agent::pipeline::retry::RetryPolicy;
use invoice_agent::pipeline::state::WorkflowStage;
use invoice_agent::pipeline::types::{AttachmentItem, DocumentLabel};
use invoice_agent::pipeline::workflow::WorkflowEngine;
use invoice_agent::storage::StorageLayout;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Stub provider keyed on the document text:
/// - "invoice" → invoice
/// - "GARBAGE" → a non-JSON answer
/// - "FLAKY" → 503 on the first call, then non_invoice
/// - anything else → non_invoice
#[derive(Default)]
struct StubLlm {
    calls: AtomicUsize,
    flaky_failures: AtomicUsize,
}

#[async_trait]
impl LlmProvider for StubLlm {
    fn model_name(&self) -> &str {
        "stub"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let document = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();

        if document.contains("FLAKY") && self.flaky_failures.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(LlmError::ServerError {
                provider: "stub".into(),
                status: 503,
            });
        }

        let content = if document.contains("GARBAGE") {
            "I think this is probably an invoice.".to_string()
        } else if document.to_lowercase().contains("invoice") {
            r#"{"label":"invoice","confidence":0.97,"rationale":"Has an invoice number and total.",
                "extracted_fields":{"invoice_number":"INV-1","date":null,"vendor":"Acme","total":120.5}}"#
                .to_string()
        } else {
            r#"{"label":"non_invoice","confidence":0.88,"rationale":"Plain correspondence.",
                "extracted_fields":{"invoice_number":null,"date":null,"vendor":null,"total":null}}"#
                .to_string()
        };

        Ok(CompletionResponse {
            content,
            input_tokens: 0,
            output_tokens: 0,
            finish_reason: FinishReason::Stop,
            response_id: None,
        })
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    layout: StorageLayout,
    llm: Arc<StubLlm>,
    aggregator: RunAggregator,
}

async fn harness(batch_timeout: Option<Duration>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let layout = StorageLayout::with_base(dir.path().join("storage"));
    layout.ensure_dirs().await.unwrap();

    let llm = Arc::new(StubLlm::default());
    let extractor = DocumentExtractor::new(
        vec![layout.base_dir().to_path_buf()],
        10_000,
        OcrEngine::new("tesseract", Duration::from_secs(5)),
    );
    let engine = WorkflowEngine::new(
        Arc::new(extractor),
        Arc::new(LlmClassifier::new(llm.clone())),
        layout.clone(),
        RetryPolicy::new(2, Duration::from_millis(1)),
    );

    Harness {
        _dir: dir,
        layout: layout.clone(),
        llm,
        aggregator: RunAggregator::new(engine, batch_timeout),
    }
}

fn stage(layout: &StorageLayout, name: &str, media_type: &str, body: &[u8]) -> AttachmentItem {
    let path = layout.temp_path_for(name);
    std::fs::write(&path, body).unwrap();
    AttachmentItem::new(path, name, media_type, body.len() as u64)
}

fn temp_is_empty(layout: &StorageLayout) -> bool {
    std::fs::read_dir(layout.temp_dir()).unwrap().next().is_none()
}

#[tokio::test]
async fn mixed_batch_is_filed_and_reported() {
    timeout(TEST_TIMEOUT, async {
        let h = harness(None).await;
        let outside = tempfile::tempdir().unwrap();
        let outside_file = outside.path().join("secret.txt");
        std::fs::write(&outside_file, "Invoice from elsewhere").unwrap();

        let items = vec![
            stage(&h.layout, "invoice.txt", "text/plain", b"Invoice INV-1 total 120.50"),
            stage(&h.layout, "letter.txt", "text/plain", b"Dear team, lunch is on Friday."),
            stage(&h.layout, "invoice.txt", "text/plain", b"Invoice INV-2 total 80.00"),
            stage(&h.layout, "old.doc", "application/msword", b"\xd0\xcf\x11\xe0"),
            stage(&h.layout, "broken.pdf", "application/pdf", b"%PDF-1.4 not really"),
            AttachmentItem::new(&outside_file, "secret.txt", "text/plain", 22),
        ];

        let report = h.aggregator.run(items).await;
        let o = &report.outcomes;
        assert_eq!(o.len(), 6);

        assert!(o[0].success);
        assert_eq!(o[0].stage_reached, WorkflowStage::Done);
        assert_eq!(o[0].label(), Some(DocumentLabel::Invoice));
        assert_eq!(
            o[0].destination_path(),
            Some(h.layout.invoices_dir().join("invoice.txt").as_path())
        );
        let fields = &o[0].classification.as_ref().unwrap().extracted_fields;
        assert_eq!(fields.total.as_deref(), Some("120.5"));

        assert!(o[1].success);
        assert_eq!(o[1].label(), Some(DocumentLabel::NonInvoice));
        assert!(h.layout.others_dir().join("letter.txt").exists());

        assert!(o[2].success);
        assert!(h.layout.invoices_dir().join("invoice_1.txt").exists());

        assert!(!o[3].success);
        assert_eq!(o[3].stage_reached, WorkflowStage::Extracting);
        assert_eq!(o[3].error.as_ref().unwrap().category(), "unsupported_media_type");

        assert!(!o[4].success);
        assert_eq!(o[4].error.as_ref().unwrap().category(), "extraction_failed");

        assert!(!o[5].success);
        assert_eq!(o[5].error.as_ref().unwrap().category(), "invalid_path");
        assert!(outside_file.exists(), "files outside storage are never touched");

        assert_eq!(report.summary.processed, 6);
        assert_eq!(report.summary.invoices, 2);
        assert_eq!(report.summary.others, 1);
        assert_eq!(report.summary.failed, 3);
        assert_eq!(report.summary.skipped, 0);
        assert!(temp_is_empty(&h.layout));

        // Only the three extractable documents reached the model.
        assert_eq!(h.llm.calls.load(Ordering::SeqCst), 3);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn malformed_model_answer_is_not_retried() {
    timeout(TEST_TIMEOUT, async {
        let h = harness(None).await;
        let item = stage(&h.layout, "odd.txt", "text/plain", b"GARBAGE");

        let outcome = h.aggregator.run_one(item).await;
        assert!(!outcome.success);
        assert_eq!(outcome.stage_reached, WorkflowStage::Classifying);
        assert_eq!(outcome.error.as_ref().unwrap().category(), "classification_schema");
        assert_eq!(h.llm.calls.load(Ordering::SeqCst), 1);
        assert!(temp_is_empty(&h.layout));
        assert_eq!(h.layout.stats().await.unwrap().total_processed, 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn transient_provider_error_is_retried() {
    timeout(TEST_TIMEOUT, async {
        let h = harness(None).await;
        let item = stage(&h.layout, "note.txt", "text/plain", b"FLAKY memo");

        let outcome = h.aggregator.run_one(item).await;
        assert!(outcome.success);
        assert_eq!(outcome.label(), Some(DocumentLabel::NonInvoice));
        assert_eq!(h.llm.calls.load(Ordering::SeqCst), 2);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn outcome_history_follows_the_stage_order() {
    timeout(TEST_TIMEOUT, async {
        let h = harness(None).await;
        let outcome = h
            .aggregator
            .run_one(stage(&h.layout, "a.txt", "text/plain", b"Invoice 7"))
            .await;

        let stages: Vec<_> = outcome.transitions.iter().map(|t| t.to).collect();
        assert_eq!(
            stages,
            [
                WorkflowStage::Extracting,
                WorkflowStage::Classifying,
                WorkflowStage::Filing,
                WorkflowStage::CleaningUp,
                WorkflowStage::Done,
            ]
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn expired_batch_skips_and_cleans_up() {
    timeout(TEST_TIMEOUT, async {
        let h = harness(Some(Duration::ZERO)).await;
        let items = vec![
            stage(&h.layout, "a.txt", "text/plain", b"Invoice 1"),
            stage(&h.layout, "b.txt", "text/plain", b"Invoice 2"),
        ];

        let report = h.aggregator.run(items).await;
        assert!(report.outcomes.iter().all(|o| o.is_cancelled()));
        assert!(report.outcomes.iter().all(|o| o.stage_reached == WorkflowStage::Pending));
        assert_eq!(report.summary.skipped, 2);
        assert_eq!(report.summary.processed, 0);
        assert_eq!(h.llm.calls.load(Ordering::SeqCst), 0);
        assert!(temp_is_empty(&h.layout));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn outcome_serializes_generic_errors_only() {
    timeout(TEST_TIMEOUT, async {
        let h = harness(None).await;
        let outcome = h
            .aggregator
            .run_one(stage(&h.layout, "broken.pdf", "application/pdf", b"%PDF-garbage"))
            .await;

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["stage_reached"], "extracting");
        assert_eq!(json["error"]["category"], "extraction_failed");
        let message = json["error"]["message"].as_str().unwrap();
        assert!(!message.contains("broken.pdf"));
        assert!(!message.contains(h.layout.base_dir().to_str().unwrap()));
    })
    .await
    .expect("test timed out");
}
