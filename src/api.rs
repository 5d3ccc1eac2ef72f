// 🌐 HTTP surface - upload endpoint, health check, upload form
//
// The transport only gates the request (file present, CSV content type,
// readable text); all row decisions happen in `admission::process_upload`.

use crate::admission::process_upload;
use crate::db::{load_account_ids, record_upload, SqliteReadingStore};
use crate::reading::BatchResult;
use anyhow::Context;
use axum::{
    extract::{multipart::MultipartRejection, Multipart, State},
    http::StatusCode,
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use rusqlite::Connection;
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{error, warn};

/// Multipart field carrying the CSV
const FILE_FIELD: &str = "file";
const CSV_CONTENT_TYPE: &str = "text/csv";
/// Actor name recorded in the audit trail for uploads
const UPLOAD_ACTOR: &str = "upload_endpoint";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Connection>>,
}

impl AppState {
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Arc::new(Mutex::new(conn)),
        }
    }
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Transport-level failures; the messages are part of the client contract
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("No file provided.")]
    NoFile,

    #[error("Invalid file type. Only CSV files are allowed.")]
    InvalidFileType,

    #[error("Unable to read uploaded file: {0}")]
    UnreadablePayload(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Internal(e) => {
                error!(error = %format!("{:#}", e), "Upload failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
            other => (StatusCode::BAD_REQUEST, other.to_string()).into_response(),
        }
    }
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// POST /meter-reading-uploads - Process a CSV of meter readings
async fn upload_meter_readings(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<BatchResult>, ApiError> {
    let mut multipart = match multipart {
        Ok(m) => m,
        Err(rejection) => {
            warn!(error = %rejection, "Upload without multipart form");
            return Err(ApiError::NoFile);
        }
    };

    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::UnreadablePayload(e.to_string()))?
    {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let content_type = field.content_type().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::UnreadablePayload(e.to_string()))?;
        upload = Some((content_type, bytes));
        break;
    }

    let (content_type, bytes) = upload.ok_or(ApiError::NoFile)?;
    if content_type.as_deref() != Some(CSV_CONTENT_TYPE) {
        return Err(ApiError::InvalidFileType);
    }

    let text = std::str::from_utf8(&bytes)
        .map_err(|e| ApiError::UnreadablePayload(e.to_string()))?;
    let body = text.strip_prefix('\u{feff}').unwrap_or(text).to_string();

    // SQLite work is blocking; keep it off the async workers
    let db = Arc::clone(&state.db);
    let result = tokio::task::spawn_blocking(move || apply_upload(&db, &body))
        .await
        .context("Upload task failed")??;

    Ok(Json(result))
}

/// Run one upload against the shared connection
///
/// The lock is held for the whole batch: one upload applies at a time.
fn apply_upload(db: &Mutex<Connection>, body: &str) -> anyhow::Result<BatchResult> {
    let conn = db
        .lock()
        .map_err(|_| anyhow::anyhow!("Database lock poisoned"))?;

    let accounts = load_account_ids(&conn)?;
    let report = {
        let mut store = SqliteReadingStore::new(&conn, UPLOAD_ACTOR);
        process_upload(body, &accounts, &mut store)
    };
    let result = report.result();

    if let Err(e) = record_upload(&conn, body, &result, UPLOAD_ACTOR) {
        warn!(error = %e, "Failed to record upload in audit trail");
    }

    Ok(result)
}

/// GET / - Serve the upload form
async fn serve_index() -> impl IntoResponse {
    Html(include_str!("../web/index.html"))
}

// ============================================================================
// Router
// ============================================================================

pub fn router(state: AppState, web_dir: &Path) -> Router {
    let api_routes = Router::new().route("/health", get(health_check));

    Router::new()
        .route("/", get(serve_index))
        .route("/meter-reading-uploads", post(upload_meter_readings))
        .nest("/api", api_routes)
        .nest_service("/static", ServeDir::new(web_dir))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
