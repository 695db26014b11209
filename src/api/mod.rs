//! HTTP layer.

mod routes;

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;

use crate::mail::MailSource;
use crate::pipeline::aggregator::RunAggregator;

pub const SERVICE_NAME: &str = "invoice-agent";

/// Room for multipart boundaries and headers on top of the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Shared state for all routes.
#[derive(Clone)]
pub struct AppState {
    pub aggregator: Arc<RunAggregator>,
    /// `None` when no mailbox is configured.
    pub mailbox: Option<Arc<dyn MailSource>>,
    pub max_upload_bytes: usize,
    pub max_emails: usize,
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    let body_limit = state.max_upload_bytes.saturating_add(MULTIPART_OVERHEAD);

    Router::new()
        .route("/", get(routes::root))
        .route("/api/v1/health", get(routes::health))
        .route("/api/v1/check-emails", post(routes::check_emails))
        .route("/api/v1/classify", post(routes::classify))
        .route(
            "/api/v1/upload-and-classify",
            post(routes::upload_and_classify).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/api/v1/stats", get(routes::stats))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
