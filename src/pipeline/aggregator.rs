//! Run aggregator: drives the workflow engine over a batch, in order.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::info;

use crate::pipeline::types::{AttachmentItem, BatchReport, WorkflowOutcome};
use crate::pipeline::workflow::WorkflowEngine;
use crate::storage::StorageLayout;

/// Entry point of the workflow core.
///
/// Batches are serialised behind a lock so at most one filing
/// check-then-move runs at a time in this process.
pub struct RunAggregator {
    engine: WorkflowEngine,
    batch_timeout: Option<Duration>,
    lock: Mutex<()>,
}

impl RunAggregator {
    pub fn new(engine: WorkflowEngine, batch_timeout: Option<Duration>) -> Self {
        Self {
            engine,
            batch_timeout,
            lock: Mutex::new(()),
        }
    }

    pub fn storage(&self) -> &StorageLayout {
        self.engine.storage()
    }

    /// Process `items` in order. One item's failure never stops the batch.
    ///
    /// The deadline is only checked between items; an item that has started
    /// always finishes.
    pub async fn run(&self, items: Vec<AttachmentItem>) -> BatchReport {
        let _batch = self.lock.lock().await;
        let deadline = self.batch_timeout.map(|t| Instant::now() + t);
        let total = items.len();
        info!(count = total, "Processing attachment batch");

        let mut outcomes = Vec::with_capacity(total);
        for item in items {
            let expired = deadline.is_some_and(|d| Instant::now() >= d);
            let outcome = if expired {
                self.engine.cancel(item).await
            } else {
                self.engine.run(item).await
            };
            outcomes.push(outcome);
        }

        let report = BatchReport::from_outcomes(outcomes);
        let s = report.summary;
        info!(
            processed = s.processed,
            invoices = s.invoices,
            others = s.others,
            failed = s.failed,
            skipped = s.skipped,
            total,
            "Batch processing complete"
        );
        report
    }

    /// Process a single item under the same lock as batches.
    pub async fn run_one(&self, item: AttachmentItem) -> WorkflowOutcome {
        let _batch = self.lock.lock().await;
        self.engine.run(item).await
    }
}
