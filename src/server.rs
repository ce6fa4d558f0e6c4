//! HTTP facade over the summarization pipeline.
//!
//! Exposes [`SystemApi`] as a small JSON API for the browser dashboard and
//! scripts.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/ping` | Dispatcher liveness (`503` when it does not answer) |
//! | `POST` | `/summarize/{mode}` | Run one summary; `mode` is `readme`, `commits`, `issues`, or `pulls` |
//! | `GET`  | `/summaries` | List stored summaries |
//! | `GET`  | `/summary/{owner}/{repo}/{mode}` | Fetch one stored summary |
//!
//! # Error Contract
//!
//! Error responses carry a single `detail` field:
//!
//! ```json
//! { "detail": "timed out after 300s waiting for response to request 4" }
//! ```
//!
//! A summarize call that reached the dispatcher is `200` even when the
//! dispatcher answered with a JSON-RPC error; the error is inside `data`.
//! Only transport failures (timeout, dead process, not running) are `500`.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so the dashboard can be
//! served from a different origin.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::models::{RepoId, SummaryDocument, SummaryEntry, SummaryKind};
use crate::protocol::RpcResponse;
use crate::system::SystemApi;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    api: Arc<SystemApi>,
}

/// Starts the HTTP facade and the pipeline behind it.
///
/// Binds to `[server].bind`, starts the system, and serves until Ctrl-C.
/// The system is stopped before returning.
pub async fn run_server(config: &Config, config_path: &std::path::Path) -> anyhow::Result<()> {
    let api = Arc::new(SystemApi::from_config(config, config_path)?);

    if let Err(e) = api.start_system().await {
        // Summarize calls retry the start; ping reports 503 meanwhile.
        tracing::error!(error = %e, "failed to start system");
    }

    let listener = TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "HTTP server listening");

    let result = serve(api.clone(), listener, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown requested");
    })
    .await;

    api.stop_system().await;
    result
}

/// Serve `api` on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(api: Arc<SystemApi>, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(api))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

pub fn router(api: Arc<SystemApi>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ping", get(handle_ping))
        .route("/summarize/{mode}", post(handle_summarize))
        .route("/summaries", get(handle_list_summaries))
        .route("/summary/{owner}/{repo}/{mode}", get(handle_get_summary))
        .layer(cors)
        .with_state(AppState { api })
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    detail: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { detail: self.detail })).into_response()
    }
}

fn bad_request(detail: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        detail: detail.into(),
    }
}

fn not_found(detail: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        detail: detail.into(),
    }
}

fn internal(detail: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        detail: detail.into(),
    }
}

fn parse_kind(mode: &str) -> Result<SummaryKind, AppError> {
    mode.parse::<SummaryKind>()
        .map_err(|e| not_found(e.to_string()))
}

// ============ GET /ping ============

#[derive(Serialize)]
struct StatusBody {
    status: &'static str,
}

async fn handle_ping(State(state): State<AppState>) -> Result<Json<StatusBody>, AppError> {
    if state.api.ping().await {
        Ok(Json(StatusBody { status: "ok" }))
    } else {
        Err(AppError {
            status: StatusCode::SERVICE_UNAVAILABLE,
            detail: "dispatcher is not responding".to_string(),
        })
    }
}

// ============ POST /summarize/{mode} ============

#[derive(Deserialize)]
struct RepoBody {
    owner: String,
    repo: String,
}

#[derive(Serialize)]
struct SummarizeBody {
    status: &'static str,
    data: RpcResponse,
}

async fn handle_summarize(
    State(state): State<AppState>,
    Path(mode): Path<String>,
    Json(body): Json<RepoBody>,
) -> Result<Json<SummarizeBody>, AppError> {
    let kind = parse_kind(&mode)?;
    let repo = RepoId::new(&body.owner, &body.repo).map_err(|e| bad_request(e.to_string()))?;

    let resp = state.api.summarize(kind, &repo).await.map_err(|e| {
        tracing::error!(repo = %repo, kind = %kind, error = %e, "summarize call failed");
        internal(e.to_string())
    })?;

    Ok(Json(SummarizeBody {
        status: "ok",
        data: resp,
    }))
}

// ============ GET /summaries ============

async fn handle_list_summaries(
    State(state): State<AppState>,
) -> Result<Json<Vec<SummaryEntry>>, AppError> {
    state
        .api
        .list_summaries()
        .map(Json)
        .map_err(|e| internal(format!("{:#}", e)))
}

// ============ GET /summary/{owner}/{repo}/{mode} ============

async fn handle_get_summary(
    State(state): State<AppState>,
    Path((owner, repo, mode)): Path<(String, String, String)>,
) -> Result<Json<SummaryDocument>, AppError> {
    let kind = parse_kind(&mode)?;
    let repo = RepoId::new(&owner, &repo).map_err(|e| bad_request(e.to_string()))?;

    match state.api.load_summary(&repo, kind) {
        Ok(Some(doc)) => Ok(Json(doc)),
        Ok(None) => Err(not_found(format!("no {} summary stored for {}", kind, repo))),
        Err(e) => Err(internal(format!("{:#}", e))),
    }
}
