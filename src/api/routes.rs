//! Route handlers.

use std::path::{Path, PathBuf};

use axum::Json;
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use super::{AppState, SERVICE_NAME};
use crate::pipeline::email_processor;
use crate::pipeline::types::AttachmentItem;
use crate::safety::{is_safe_path, sanitize_filename};

const UNKNOWN_MEDIA_TYPE: &str = "application/octet-stream";

fn error_response(status: StatusCode, category: &str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "error": { "category": category, "message": message }
        })),
    )
        .into_response()
}

// ── Info ────────────────────────────────────────────────────────────

pub(super) async fn root() -> impl IntoResponse {
    Json(json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "health": "GET /api/v1/health",
            "check_emails": "POST /api/v1/check-emails",
            "classify": "POST /api/v1/classify",
            "upload_and_classify": "POST /api/v1/upload-and-classify",
            "stats": "GET /api/v1/stats",
        }
    }))
}

pub(super) async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

pub(super) async fn stats(State(state): State<AppState>) -> Response {
    match state.aggregator.storage().stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to read storage stats");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage",
                "Storage statistics unavailable",
            )
        }
    }
}

// ── Email ───────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct CheckEmailsRequest {
    max_emails: Option<usize>,
    unread_only: Option<bool>,
}

pub(super) async fn check_emails(
    State(state): State<AppState>,
    Json(req): Json<CheckEmailsRequest>,
) -> Response {
    let Some(mailbox) = state.mailbox.as_deref() else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "mailbox_unavailable",
            "No mailbox is configured",
        );
    };

    let max = req.max_emails.unwrap_or(state.max_emails);
    let unread_only = req.unread_only.unwrap_or(true);
    info!(max_emails = max, unread_only, "Email check requested");

    match email_processor::check_emails(mailbox, &state.aggregator, max, unread_only).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => {
            error!(error = %e, "Email check failed");
            error_response(StatusCode::BAD_GATEWAY, "mailbox", "Mailbox request failed")
        }
    }
}

// ── Classification ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(super) struct ClassifyRequest {
    file_path: PathBuf,
    file_name: Option<String>,
}

/// Classify a file already inside the storage root.
pub(super) async fn classify(
    State(state): State<AppState>,
    Json(req): Json<ClassifyRequest>,
) -> Response {
    let storage = state.aggregator.storage();
    if !is_safe_path(&req.file_path, &[storage.base_dir()]) {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_path",
            "File path is outside the storage root",
        );
    }

    let size = match tokio::fs::metadata(&req.file_path).await {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => {
            return error_response(StatusCode::NOT_FOUND, "not_found", "File not found");
        }
    };

    let file_name = req
        .file_name
        .filter(|n| !n.trim().is_empty())
        .or_else(|| file_name_of(&req.file_path))
        .unwrap_or_else(|| "document".to_string());

    let item = AttachmentItem::new(req.file_path, file_name, UNKNOWN_MEDIA_TYPE, size);
    Json(state.aggregator.run_one(item).await).into_response()
}

fn file_name_of(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

/// Store an uploaded file in temp storage and classify it.
pub(super) async fn upload_and_classify(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Response {
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Malformed multipart upload");
                return upload_error(e.status());
            }
        };
        if field.name() != Some("file") {
            continue;
        }

        let declared = field.file_name().unwrap_or_default().to_string();
        let file_name = sanitize_filename(&declared);
        if file_name.is_empty() || file_name == "." || file_name == ".." {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_filename",
                "Upload has no usable filename",
            );
        }
        let media_type = field
            .content_type()
            .unwrap_or(UNKNOWN_MEDIA_TYPE)
            .to_string();

        let bytes = match field.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to read upload");
                return upload_error(e.status());
            }
        };
        if bytes.len() > state.max_upload_bytes {
            return upload_error(StatusCode::PAYLOAD_TOO_LARGE);
        }

        let storage = state.aggregator.storage();
        let path = storage.temp_path_for(&file_name);
        if let Err(e) = tokio::fs::write(&path, &bytes).await {
            error!(path = %path.display(), error = %e, "Failed to store upload");
            let _ = tokio::fs::remove_file(&path).await;
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage",
                "Could not store the upload",
            );
        }
        info!(file = %file_name, size = bytes.len(), "Upload stored");

        let item = AttachmentItem::new(path, file_name, media_type, bytes.len() as u64);
        return Json(state.aggregator.run_one(item).await).into_response();
    }

    error_response(
        StatusCode::BAD_REQUEST,
        "missing_file",
        "Multipart field `file` is required",
    )
}

fn upload_error(status: StatusCode) -> Response {
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        error_response(status, "payload_too_large", "Upload exceeds the size limit")
    } else {
        error_response(StatusCode::BAD_REQUEST, "invalid_upload", "Malformed upload")
    }
}
