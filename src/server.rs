//! HTTP API.
//!
//! Thin request/response glue over the pipeline and search engine. The
//! upload handler registers a stored PDF and enqueues its pipeline, then
//! returns immediately; clients observe progress by polling the document
//! or subscribing to the SSE wrapper around the same read.
//!
//! # Endpoints
//!
//! | Method   | Path                      | Description |
//! |----------|---------------------------|-------------|
//! | `POST`   | `/documents`              | Register a stored PDF and start ingestion |
//! | `GET`    | `/documents/{id}`         | Document state + projected progress |
//! | `GET`    | `/documents/{id}/events`  | SSE status snapshots, 1/s, closes on terminal state |
//! | `DELETE` | `/documents/{id}`         | Cascading delete |
//! | `POST`   | `/search`                 | Rank an owner's chunks against a query |
//! | `GET`    | `/health`                 | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "owner_id must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `internal` (500).

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, KeepAliveStream, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::models::{Document, SearchHit};
use crate::pipeline::{IngestQueue, PipelineContext};
use crate::progress::{self, Progress};
use crate::{search, store};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    ctx: Arc<PipelineContext>,
    queue: IngestQueue,
}

/// Start the HTTP server. Runs until the process is terminated.
pub async fn run_server(ctx: Arc<PipelineContext>, queue: IngestQueue) -> anyhow::Result<()> {
    let bind_addr = ctx.config.server.bind.clone();
    let state = AppState { ctx, queue };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/documents", post(handle_create_document))
        .route(
            "/documents/{id}",
            get(handle_get_document).delete(handle_delete_document),
        )
        .route("/documents/{id}/events", get(handle_document_events))
        .route("/search", post(handle_search))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    info!("listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(err: anyhow::Error) -> AppError {
    warn!(error = %err, "request failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: err.to_string(),
    }
}

// ============ Documents ============

#[derive(Deserialize)]
struct CreateDocumentRequest {
    owner_id: String,
    /// Path to the already-stored PDF file.
    path: String,
    filename: Option<String>,
}

/// Document state plus the UI-facing progress projection.
#[derive(Serialize)]
struct DocumentView {
    #[serde(flatten)]
    document: Document,
    progress: Progress,
}

async fn load_view(state: &AppState, id: &str) -> anyhow::Result<Option<DocumentView>> {
    let Some(document) = store::get_document(&state.ctx.pool, id).await? else {
        return Ok(None);
    };
    let (ocr_done, _total) = store::ocr_progress(&state.ctx.pool, id).await?;
    let progress = progress::project(
        document.status,
        document.embedding_status,
        document.image_count,
        ocr_done,
    );
    Ok(Some(DocumentView { document, progress }))
}

async fn handle_create_document(
    State(state): State<AppState>,
    Json(req): Json<CreateDocumentRequest>,
) -> Result<(StatusCode, Json<DocumentView>), AppError> {
    if req.owner_id.trim().is_empty() {
        return Err(bad_request("owner_id must not be empty"));
    }
    let path = std::path::Path::new(&req.path);
    if !path.is_file() {
        return Err(bad_request(format!("no such file: {}", req.path)));
    }

    let filename = req.filename.unwrap_or_else(|| {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document.pdf".to_string())
    });

    let document = store::create_document(&state.ctx.pool, &req.owner_id, &filename, &req.path)
        .await
        .map_err(internal)?;

    state
        .queue
        .submit(document.id.clone())
        .await
        .map_err(internal)?;

    let view = load_view(&state, &document.id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found("document vanished after creation"))?;

    Ok((StatusCode::ACCEPTED, Json(view)))
}

async fn handle_get_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DocumentView>, AppError> {
    let view = load_view(&state, &id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("no document with id: {}", id)))?;
    Ok(Json(view))
}

async fn handle_delete_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let deleted = store::delete_document(&state.ctx.pool, &id)
        .await
        .map_err(internal)?;
    if !deleted {
        return Err(not_found(format!("no document with id: {}", id)));
    }
    Ok(Json(serde_json::json!({ "deleted": true })))
}

/// SSE wrapper over the same polling read: one snapshot per second, a
/// final snapshot at the terminal state, then the stream closes.
async fn handle_document_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<KeepAliveStream<ReceiverStream<Result<Event, Infallible>>>>, AppError> {
    // 404 up front rather than an empty stream.
    load_view(&state, &id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("no document with id: {}", id)))?;

    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(8);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;

            let view = match load_view(&state, &id).await {
                Ok(Some(view)) => view,
                Ok(None) => {
                    debug!(document_id = %id, "document deleted mid-stream");
                    break;
                }
                Err(e) => {
                    warn!(document_id = %id, error = %e, "status stream read failed");
                    break;
                }
            };

            let terminal = view.document.status.is_terminal();
            let event = match Event::default().event("status").json_data(&view) {
                Ok(event) => event,
                Err(e) => {
                    warn!(document_id = %id, error = %e, "failed to encode status event");
                    break;
                }
            };

            if tx.send(Ok(event)).await.is_err() {
                break; // client disconnected
            }
            if terminal {
                break;
            }
        }
    });

    Ok(Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default()))
}

// ============ Search ============

#[derive(Deserialize)]
struct SearchRequest {
    owner_id: String,
    query: String,
    top_k: Option<usize>,
    min_score: Option<f32>,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<SearchHit>,
    count: usize,
}

async fn handle_search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    if req.owner_id.trim().is_empty() {
        return Err(bad_request("owner_id must not be empty"));
    }

    let top_k = req.top_k.unwrap_or(state.ctx.config.search.top_k);
    let min_score = req.min_score.unwrap_or(state.ctx.config.search.min_score);

    let results = search::search(
        &state.ctx.pool,
        state.ctx.embedder.as_deref(),
        &req.owner_id,
        &req.query,
        top_k,
        Some(min_score),
    )
    .await
    .map_err(internal)?;

    let count = results.len();
    Ok(Json(SearchResponse { results, count }))
}

// ============ Health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
