use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use tokio::task::JoinHandle;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use invoice_agent::api::{self, AppState};
use invoice_agent::config::{AppConfig, LoggingConfig};
use invoice_agent::extract::{DocumentExtractor, OcrEngine};
use invoice_agent::llm::create_provider;
use invoice_agent::mail::{ImapMailbox, MailSource};
use invoice_agent::pipeline::aggregator::RunAggregator;
use invoice_agent::pipeline::classifier::LlmClassifier;
use invoice_agent::pipeline::email_processor::{STALE_TEMP_AGE, spawn_email_processor};
use invoice_agent::pipeline::retry::RetryPolicy;
use invoice_agent::pipeline::workflow::WorkflowEngine;
use invoice_agent::storage::StorageLayout;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let config = AppConfig::from_env().context("Invalid configuration")?;
    let _log_guard = init_tracing(&config.logging);

    eprintln!("📄 Invoice Agent v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.llm.model);
    eprintln!("   Storage: {}", config.storage.base_path.display());

    let Services { state, poller } = build_services(&config)
        .await
        .context("Start-up failed")?;

    // ── HTTP ────────────────────────────────────────────────────────────
    let app = api::router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    eprintln!("   API: http://{addr}/api/v1\n");
    tracing::info!(%addr, "HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("HTTP server failed")?;

    if let Some((_handle, shutdown)) = poller {
        shutdown.store(true, Ordering::Relaxed);
    }
    tracing::info!("Shut down");
    Ok(())
}

struct Services {
    state: AppState,
    poller: Option<(JoinHandle<()>, Arc<AtomicBool>)>,
}

/// Validate storage, then wire extractor, classifier, engine, mailbox and poller.
async fn build_services(config: &AppConfig) -> invoice_agent::error::Result<Services> {
    // ── Storage ─────────────────────────────────────────────────────────
    let storage = StorageLayout::new(&config.storage);
    storage.ensure_dirs().await?;
    match storage.sweep_stale_temp(STALE_TEMP_AGE).await {
        Ok(0) => {}
        Ok(removed) => tracing::info!(removed, "Removed stale temp files from a previous run"),
        Err(e) => tracing::warn!(error = %e, "Stale temp sweep failed"),
    }

    // ── Workflow ────────────────────────────────────────────────────────
    let llm = create_provider(&config.llm)?;
    let classifier = Arc::new(LlmClassifier::new(llm));
    let extractor = Arc::new(DocumentExtractor::new(
        vec![storage.base_dir().to_path_buf()],
        config.workflow.max_text_chars,
        OcrEngine::new(config.workflow.tesseract_path.clone(), config.workflow.ocr_timeout),
    ));
    let retry = RetryPolicy::new(
        config.workflow.classify_max_retries,
        config.workflow.classify_backoff,
    );
    let engine = WorkflowEngine::new(extractor, classifier, storage, retry);
    let aggregator = Arc::new(RunAggregator::new(engine, config.workflow.batch_timeout));

    // ── Email ───────────────────────────────────────────────────────────
    let mailbox: Option<Arc<dyn MailSource>> = config.email.clone().map(|email| {
        eprintln!("   Mailbox: {}@{} ({})", email.username, email.host, email.mailbox);
        Arc::new(ImapMailbox::new(email)) as Arc<dyn MailSource>
    });

    let poller = match (&mailbox, config.email_check_interval) {
        (Some(mailbox), Some(interval)) => {
            eprintln!("   Email check: every {}s", interval.as_secs());
            Some(spawn_email_processor(
                Arc::clone(mailbox),
                Arc::clone(&aggregator),
                interval,
                config.max_emails_per_check,
            ))
        }
        _ => {
            eprintln!("   Email check: disabled");
            None
        }
    };

    Ok(Services {
        state: AppState {
            aggregator,
            mailbox,
            max_upload_bytes: config.server.max_upload_bytes,
            max_emails: config.max_emails_per_check,
        },
        poller,
    })
}

/// stdout plus a daily-rolling file under the directory of `LOG_FILE`.
///
/// `RUST_LOG` wins over `LOG_LEVEL`. The returned guard flushes the file
/// writer on drop and must live until exit.
fn init_tracing(config: &LoggingConfig) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.level));
    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);

    let dir = config
        .file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let file_name = config
        .file
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "app.log".into());

    if let Err(e) = std::fs::create_dir_all(dir) {
        eprintln!("   Log file disabled ({}: {e})", dir.display());
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stdout_layer)
            .init();
        return None;
    }

    let appender = tracing_appender::rolling::daily(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();
    Some(guard)
}
