// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! HTTP dispatch surface wrapping [`agent_engine::Engine`]: job submission
//! with single-slot admission control, cooperative cancellation, and a
//! health/activity probe.

use agent_core::DispatchEnvelope;
use agent_engine::Engine;
use axum::{
    Json, Router,
    extract::{Path as AxPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared daemon state: the one engine instance backing every route.
#[derive(Clone)]
pub struct AppState {
    /// The job engine.
    pub engine: Arc<Engine>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AcceptedResponse {
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct CancelRequest {
    token: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct CancelResponse {
    job_id: String,
    cancelled: bool,
}

/// Structured JSON error returned by every route on failure.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.message }))).into_response()
    }
}

/// Build the Axum router: `POST /jobs`, `POST /jobs/{job_id}/cancel`,
/// `GET /healthz`, `GET /`.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/jobs", post(submit_job))
        .route("/jobs/{job_id}/cancel", post(cancel_job))
        .route("/healthz", get(health))
        .route("/", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn submit_job(
    State(state): State<Arc<AppState>>,
    Json(envelope): Json<DispatchEnvelope>,
) -> Result<impl IntoResponse, ApiError> {
    if let Err(error) = envelope.workflow.validate() {
        return Err(ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, error.to_string()));
    }

    let Some(guard) = state.engine.try_reserve() else {
        return Err(ApiError::new(StatusCode::CONFLICT, "agent is already processing another job"));
    };

    let job_id = envelope.job_id.clone();
    info!(job_id = %job_id, "accepted job");
    let engine = state.engine.clone();
    tokio::spawn(async move {
        engine.run_reserved(guard, envelope).await;
    });

    Ok((StatusCode::ACCEPTED, Json(AcceptedResponse { job_id })))
}

async fn cancel_job(
    State(state): State<Arc<AppState>>,
    AxPath(job_id): AxPath<String>,
    Json(request): Json<CancelRequest>,
) -> impl IntoResponse {
    let cancelled = state.engine.request_cancel(&job_id, &request.token);
    Json(CancelResponse { job_id, cancelled })
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let busy = state.engine.is_busy();
    let activity = state.engine.describe_activity().await;
    Json(json!({
        "status": "ok",
        "busy": busy,
        "activity": activity,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_request_deserializes_token_field() {
        let parsed: CancelRequest = serde_json::from_str(r#"{"token": "abc"}"#).unwrap();
        assert_eq!(parsed.token, "abc");
    }

    #[test]
    fn api_error_renders_json_body() {
        let error = ApiError::new(StatusCode::CONFLICT, "busy");
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
