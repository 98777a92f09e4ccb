//! HTTP surface
//!
//! `POST /v1/execute` runs a batch and answers with one result per program.
//! `GET /` is a liveness probe.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::dispatcher::Dispatcher;
use crate::execution::{CancelSource, CancelToken};
use crate::program::{ProgramRequest, Problems};
use crate::result::ProgramResult;

pub struct AppState {
    pub dispatcher: Dispatcher,
    /// Fires when in-flight batches must stop
    pub shutdown: CancelToken,
    pub max_batch_size: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub programs: Vec<ProgramRequest>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub results: Vec<ProgramResult>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub problems: Option<Problems>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/execute", post(execute))
        .route("/", get(health))
        .with_state(state)
}

/// Serve until `shutdown` resolves and open connections drain
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health() -> &'static str {
    "OK"
}

async fn execute(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            warn!("Rejected request body: {}", rejection.body_text());
            return error_response(format!("decode json: {}", rejection.body_text()), None);
        }
    };

    let total = request.programs.len();
    if total > state.max_batch_size {
        let mut problems = Problems::new();
        problems.add(
            "programs",
            format!(
                "batch of {} programs exceeds the maximum of {}",
                total, state.max_batch_size
            ),
        );
        warn!("Rejected request: {}", problems);
        return error_response(
            format!("invalid request: {} problems", problems.len()),
            Some(problems),
        );
    }

    // Dropped with this handler, so a client disconnect cancels the batch
    let request_cancel = CancelSource::child_of(&state.shutdown);
    let started = Instant::now();
    let results = state
        .dispatcher
        .run_batch(&request_cancel.token(), request.programs)
        .await;

    info!(
        "Executed batch: programs={}, succeeded={}, elapsed_ms={}",
        total,
        results.iter().filter(|r| r.success).count(),
        started.elapsed().as_millis()
    );

    (StatusCode::OK, Json(ExecuteResponse { results })).into_response()
}

fn error_response(error: String, problems: Option<Problems>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse { error, problems }),
    )
        .into_response()
}
