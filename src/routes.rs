use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use common::store::Store;
use serde::Serialize;
use serde_json::json;
use session_tracker::Poller;
use std::fmt::{self, Display};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub poller: Arc<Poller>,
    pub store: Arc<dyn Store>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

impl Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.status)
    }
}

impl std::error::Error for ApiError {}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        Self::internal(value.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Read-only status surface. The full REST/SSE front-end lives outside
/// this service; these endpoints expose only what the core already
/// tracks.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", axum::routing::get(health_check))
        .route("/readyz", axum::routing::get(ready_check))
        .route("/v1/sessions", axum::routing::get(current_sessions))
        .route("/v1/backends", axum::routing::get(backend_statuses))
        .route("/metrics", axum::routing::get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "streammon"
    }))
}

async fn ready_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.health_check().await {
        Ok(true) => (StatusCode::OK, Json(json!({ "status": "ready" }))),
        Ok(false) | Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable" })),
        ),
    }
}

async fn current_sessions(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.poller.current_sessions().await)
}

async fn backend_statuses(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.poller.backend_statuses().await)
}

async fn metrics() -> Result<impl IntoResponse, ApiError> {
    let body = telemetry::encode_metrics().map_err(ApiError::from)?;
    Ok(([("content-type", "text/plain; version=0.0.4")], body))
}
