//! HTTP server for the chat-platform collaborator.
//!
//! The collaborator forwards every inbound chat event to `POST /events`
//! and renders the instructions it gets back. `POST /detect` exposes the
//! duplicate detection engine on its own, for tooling and manual checks.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/events` | Apply one inbound event; returns `{ "instructions": [...] }` |
//! | `POST` | `/detect` | Rank duplicates for `{ "text", "project"? }` |
//! | `GET`  | `/health` | Health check (returns version and index size) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "malformed action value: nope" } }
//! ```
//!
//! Error codes: `bad_request` (400), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.
//!
//! Expired conversations are swept in the background while the server
//! runs.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use ticket_flow_core::index::{ScopeFilter, SimilarityIndex};
use ticket_flow_core::models::CandidateSet;
use ticket_flow_core::ui::UiInstruction;

use crate::app::App;
use crate::events::{EventError, InboundEvent};
use crate::orchestrator::{check_duplicates, Orchestrator};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const SWEEP_BATCH: usize = 500;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<Orchestrator>,
    index: Arc<dyn SimilarityIndex>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, index: Arc<dyn SimilarityIndex>) -> Self {
        Self {
            orchestrator,
            index,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/events", post(handle_event))
        .route("/detect", post(handle_detect))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Serve on `[server].bind` until the process is terminated.
pub async fn run_server(app: App) -> anyhow::Result<()> {
    let bind_addr = app.config.server.bind.clone();

    let sweeper = Arc::clone(&app.orchestrator);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            match sweeper.sweep(SWEEP_BATCH).await {
                Ok(0) => {}
                Ok(n) => info!(evicted = n, "Swept expired conversations"),
                Err(e) => error!(error = %e, "Conversation sweep failed"),
            }
        }
    });

    let state = AppState::new(app.orchestrator, app.index);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(bind = %bind_addr, "Listening");
    axum::serve(listener, router(state)).await?;
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
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

/// Malformed events are the caller's fault; everything else is ours.
fn classify(err: anyhow::Error) -> AppError {
    if let Some(e) = err.downcast_ref::<EventError>() {
        return bad_request(e.to_string());
    }
    error!(error = %format!("{err:#}"), "Event handling failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: format!("{err:#}"),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    indexed_tickets: usize,
}

async fn handle_health(State(state): State<AppState>) -> Result<Json<HealthResponse>, AppError> {
    let indexed_tickets = state.index.count().await.map_err(classify)?;
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        indexed_tickets,
    }))
}

// ============ POST /events ============

#[derive(Serialize)]
struct EventResponse {
    instructions: Vec<UiInstruction>,
}

async fn handle_event(
    State(state): State<AppState>,
    Json(event): Json<InboundEvent>,
) -> Result<Json<EventResponse>, AppError> {
    let instructions = state.orchestrator.handle(&event).await.map_err(classify)?;
    Ok(Json(EventResponse { instructions }))
}

// ============ POST /detect ============

#[derive(Deserialize)]
struct DetectRequest {
    text: String,
    #[serde(default)]
    project: Option<String>,
}

async fn handle_detect(
    State(state): State<AppState>,
    Json(req): Json<DetectRequest>,
) -> Result<Json<CandidateSet>, AppError> {
    if req.text.trim().is_empty() {
        return Err(bad_request("text must not be empty"));
    }
    let orchestrator = &state.orchestrator;
    let candidates = check_duplicates(
        orchestrator.detector(),
        &req.text,
        ScopeFilter {
            project: req.project,
        },
        orchestrator.detection_timeout(),
    )
    .await;
    Ok(Json(candidates))
}
