//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/fragments` | Ingest one source for a tenant |
//! | `GET`  | `/fragments/{id}` | Fetch one fragment (no embedding) |
//! | `POST` | `/query` | Tenant-scoped similarity search |
//! | `POST` | `/answer` | Search, assemble, generate, and log |
//! | `GET`  | `/tenants` | Configured and stored tenants |
//! | `GET`  | `/analytics/poisoned` | Quarantined change events |
//! | `POST` | `/analytics/poisoned/{id}/replay` | Re-run a quarantined event |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query_text must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `replay_failed`
//! (409), `generation_failed` (502), `internal` (500). A generation timeout
//! is not an error: `/answer` returns 200 with the fallback reply and
//! `error_code: "generation_timeout"`.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use grounding_core::error::RetrievalError;
use grounding_core::models::{Fragment, PoisonedEvent};
use grounding_core::search::SearchOutcome;

use crate::analytics::{PoisonStore, Processor};
use crate::answer::{AnswerError, AnswerRequest, AnswerResponse};
use crate::app::{App, TenantSummary};
use crate::config::Config;
use crate::ingest::{FragmentStatus, IngestMetadata, IngestReport};
use crate::query::QueryRequest;

/// Shared state passed to handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    app: App,
    processor: Arc<Processor>,
}

/// Start the HTTP server, plus the analytics workers when
/// `[server].analytics` is set. Runs until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let app = App::open(config).await?;
    let processor = Arc::new(app.processor());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let workers = if config.server.analytics {
        Some(tokio::spawn(processor.clone().run(shutdown_rx)))
    } else {
        None
    };

    let router = router(AppState {
        app,
        processor,
    });
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "HTTP server listening");
    println!("Listening on http://{}", config.server.bind);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = workers {
        handle.await??;
    }
    Ok(())
}

fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/fragments", post(handle_ingest))
        .route("/fragments/{id}", get(handle_get_fragment))
        .route("/query", post(handle_query))
        .route("/answer", post(handle_answer))
        .route("/tenants", get(handle_tenants))
        .route("/analytics/poisoned", get(handle_list_poisoned))
        .route("/analytics/poisoned/{id}/replay", post(handle_replay))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
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

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

impl From<RetrievalError> for AppError {
    fn from(e: RetrievalError) -> Self {
        match e {
            RetrievalError::Validation(_) | RetrievalError::DimensionMismatch { .. } => {
                bad_request(e.to_string())
            }
            RetrievalError::NotFound(_) => not_found(e.to_string()),
            _ => internal(e.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        internal(format!("{:#}", e))
    }
}

// ============ GET /health ============

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

// ============ POST /fragments ============

/// Metadata goes in `metadata`; top-level `title` and `topic_tags` are
/// accepted too, with the nested title taking precedence and tags merged.
#[derive(Deserialize)]
struct IngestRequest {
    tenant_id: String,
    source_id: String,
    text: String,
    #[serde(default)]
    metadata: IngestMetadata,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    topic_tags: BTreeSet<String>,
}

impl IngestRequest {
    fn metadata(&self) -> IngestMetadata {
        let mut metadata = self.metadata.clone();
        if metadata.title.is_none() {
            metadata.title = self.title.clone();
        }
        metadata.topic_tags.extend(self.topic_tags.iter().cloned());
        metadata
    }
}

#[derive(Serialize)]
struct IngestResponse {
    /// First fragment of the source that is stored.
    fragment_id: Option<String>,
    status: &'static str,
    stored: usize,
    unchanged: usize,
    failed: usize,
    #[serde(flatten)]
    report: IngestReport,
}

async fn handle_ingest(
    State(state): State<AppState>,
    Json(req): Json<IngestRequest>,
) -> Result<Json<IngestResponse>, AppError> {
    let metadata = req.metadata();
    let report = state
        .app
        .ingestor
        .ingest(&req.tenant_id, &req.source_id, &req.text, &metadata)
        .await?;
    let fragment_id = report
        .fragments
        .iter()
        .find(|f| f.status != FragmentStatus::Failed)
        .map(|f| f.fragment_id.clone());
    Ok(Json(IngestResponse {
        fragment_id,
        status: report.status(),
        stored: report.stored(),
        unchanged: report.unchanged(),
        failed: report.failed(),
        report,
    }))
}

// ============ GET /fragments/{id} ============

/// A fragment as returned over HTTP: everything but the vector.
#[derive(Serialize)]
struct FragmentView {
    id: String,
    tenant_id: String,
    source_id: String,
    partition_key: String,
    ordinal: i64,
    start: usize,
    end: usize,
    text: String,
    citation: String,
    topic_tags: BTreeSet<String>,
    embedding_model_id: String,
    dims: usize,
}

impl From<Fragment> for FragmentView {
    fn from(f: Fragment) -> Self {
        let dims = f.dims();
        Self {
            id: f.id,
            tenant_id: f.tenant_id,
            source_id: f.source_id,
            partition_key: f.partition_key,
            ordinal: f.ordinal,
            start: f.start,
            end: f.end,
            text: f.text,
            citation: f.citation,
            topic_tags: f.topic_tags,
            embedding_model_id: f.embedding_model_id,
            dims,
        }
    }
}

async fn handle_get_fragment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FragmentView>, AppError> {
    match state.app.store.get(&id).await? {
        Some(f) => Ok(Json(f.into())),
        None => Err(not_found(format!("fragment not found: {}", id))),
    }
}

// ============ POST /query ============

async fn handle_query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<SearchOutcome>, AppError> {
    Ok(Json(state.app.retriever().search(&req).await?))
}

// ============ POST /answer ============

async fn handle_answer(
    State(state): State<AppState>,
    Json(req): Json<AnswerRequest>,
) -> Result<Json<AnswerResponse>, AppError> {
    match state.app.answers.answer(&req).await {
        Ok(resp) => Ok(Json(resp)),
        Err(AnswerError::Invalid(e)) => Err(e.into()),
        Err(AnswerError::Generation { interaction_id, source }) => Err(AppError {
            status: StatusCode::BAD_GATEWAY,
            code: source.code().to_string(),
            message: format!("{} (interaction {})", source, interaction_id),
        }),
    }
}

// ============ GET /tenants ============

async fn handle_tenants(State(state): State<AppState>) -> Result<Json<Vec<TenantSummary>>, AppError> {
    Ok(Json(state.app.tenants().await?))
}

// ============ Poison queue ============

async fn handle_list_poisoned(
    State(state): State<AppState>,
) -> Result<Json<Vec<PoisonedEvent>>, AppError> {
    Ok(Json(state.app.analytics.list().await?))
}

#[derive(Serialize)]
struct ReplayResponse {
    replayed: i64,
}

async fn handle_replay(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ReplayResponse>, AppError> {
    if state.app.analytics.get(id).await?.is_none() {
        return Err(not_found(format!("no poisoned event with id {}", id)));
    }
    if let Err(e) = state.processor.replay(id).await {
        error!(poison_id = id, error = %e, "replay failed");
        return Err(AppError {
            status: StatusCode::CONFLICT,
            code: "replay_failed".to_string(),
            message: format!("{:#}", e),
        });
    }
    Ok(Json(ReplayResponse { replayed: id }))
}
