//! Email intake: mailbox → run aggregator → mark as read.
//!
//! One check:
//! 1. `MailSource::fetch_emails()` stores attachments in temp storage
//! 2. All attachments of all emails run as one batch through `RunAggregator`
//! 3. Emails whose attachments all succeeded are marked read
//! 4. Stale temp files are swept

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::MailError;
use crate::mail::MailSource;
use crate::pipeline::aggregator::RunAggregator;
use crate::pipeline::types::BatchReport;

/// Temp files older than this are treated as leftovers of a crashed run.
pub const STALE_TEMP_AGE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Serialize)]
pub struct EmailCheckReport {
    pub emails_processed: usize,
    pub attachments_processed: usize,
    pub report: BatchReport,
}

/// Run one email check.
///
/// Only a mailbox failure is an error; per-attachment failures are reported
/// in the batch and leave their email unread for the next check.
pub async fn check_emails(
    mailbox: &dyn MailSource,
    aggregator: &RunAggregator,
    max_emails: usize,
    unread_only: bool,
) -> Result<EmailCheckReport, MailError> {
    let storage = aggregator.storage();
    let emails = mailbox
        .fetch_emails(max_emails, unread_only, storage)
        .await?;

    // Per email: how many of the batch's outcomes belong to it.
    let spans: Vec<(String, usize)> = emails
        .iter()
        .map(|e| (e.id.clone(), e.attachments.len()))
        .collect();
    let items: Vec<_> = emails.into_iter().flat_map(|e| e.attachments).collect();
    let attachments_processed = items.len();

    let report = if items.is_empty() {
        BatchReport::empty()
    } else {
        aggregator.run(items).await
    };

    let mut offset = 0;
    for (email_id, count) in &spans {
        let outcomes = &report.outcomes[offset..offset + count];
        offset += count;

        if !outcomes.iter().all(|o| o.success) {
            debug!(email_id = %email_id, "Leaving email unread, not every attachment was filed");
            continue;
        }
        if let Err(e) = mailbox.mark_read(email_id).await {
            warn!(email_id = %email_id, error = %e, "Failed to mark email as read");
        }
    }

    match storage.sweep_stale_temp(STALE_TEMP_AGE).await {
        Ok(0) => {}
        Ok(removed) => info!(removed, "Swept stale temp files"),
        Err(e) => warn!(error = %e, "Stale temp sweep failed"),
    }

    info!(
        emails = spans.len(),
        attachments = attachments_processed,
        failed = report.summary.failed,
        "Email check complete"
    );

    Ok(EmailCheckReport {
        emails_processed: spans.len(),
        attachments_processed,
        report,
    })
}

/// Spawn a background task that checks unread email on a timer.
///
/// Returns a `JoinHandle` and shutdown flag.
pub fn spawn_email_processor(
    mailbox: Arc<dyn MailSource>,
    aggregator: Arc<RunAggregator>,
    interval: Duration,
    max_emails: usize,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(
            interval_secs = interval.as_secs(),
            max_emails, "Email processor started"
        );

        let mut tick = tokio::time::interval(interval);

        // First tick fires immediately.
        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Email processor shutting down");
                return;
            }

            if let Err(e) = check_emails(mailbox.as_ref(), &aggregator, max_emails, true).await {
                error!(error = %e, "Scheduled email check failed");
            }
        }
    });

    (handle, shutdown_flag)
}
