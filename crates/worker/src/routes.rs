//! HTTP intake for jobs.
//!
//! - `POST /run` - body `{ "id"?: string, "input": {...} }`, answers
//!   `{ "id": string, "output": JobResult }` once the job is terminal.
//! - `GET /health` - boot state of the generation server.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderName;
use axum::routing::{get, post};
use axum::{Json, Router};
use comfyrun_comfyui::supervisor::BootState;
use comfyrun_core::job::JobEnvelope;
use comfyrun_core::outcome::JobResult;
use serde::Serialize;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::runner::JobRunner;

/// Shared state of the intake router.
#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<JobRunner>,
}

/// Response of `POST /run`.
#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub id: String,
    pub output: JobResult,
}

/// Health check response payload.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `ok` once the generation server is ready.
    pub status: &'static str,
    pub boot_state: BootState,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
}

/// Build the intake [`Router`] with its middleware stack.
pub fn build_router(state: AppState) -> Router {
    let request_id_header = HeaderName::from_static("x-request-id");

    Router::new()
        .route("/run", post(run_job))
        .route("/health", get(health_check))
        .layer(CatchPanicLayer::new())
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        .with_state(state)
}

/// POST /run -- process one job synchronously.
async fn run_job(
    State(state): State<AppState>,
    Json(envelope): Json<JobEnvelope>,
) -> Json<RunResponse> {
    let id = envelope
        .id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let output = state.runner.run(&id, envelope.input).await;
    Json(RunResponse { id, output })
}

/// GET /health -- reports whether jobs can be served.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let boot_state = state.runner.supervisor().state();
    let status = match boot_state {
        BootState::Ready => "ok",
        BootState::NotStarted | BootState::Starting => "starting",
        BootState::Failed => "unavailable",
    };

    Json(HealthResponse {
        status,
        boot_state,
        version: env!("CARGO_PKG_VERSION"),
    })
}
