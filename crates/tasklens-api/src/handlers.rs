//! API Handlers
use crate::error::ApiError;
use crate::workload;
use crate::AppState;
use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use tasklens_core::{StatsSummary, TASKLENS_VERSION};

/// Runs the workload in a fresh session and answers with its statistics.
pub async fn instrumented(State(state): State<AppState>) -> Result<Json<StatsSummary>, ApiError> {
    let pipeline = workload::request_pipeline((*state.workload).clone(), state.http.clone());
    let report = state.engine.run(pipeline).await;

    report.emit();
    state.metrics.observe(&report);

    let (summary, outcome) = report.into_parts();
    outcome?;
    Ok(Json(summary))
}

pub async fn slow(State(state): State<AppState>) -> &'static str {
    tokio::time::sleep(state.workload.slow_delay()).await;
    "OK"
}

/// Fetches the remote endpoint outside any session.
pub async fn proxy_slow(State(state): State<AppState>) -> Result<String, ApiError> {
    let url = state
        .workload
        .remote_url
        .as_deref()
        .ok_or(ApiError::RemoteDisabled)?;
    workload::slow_request(&state.http, url)
        .await
        .map_err(ApiError::Remote)
}

pub async fn metrics(State(state): State<AppState>) -> Result<String, ApiError> {
    Ok(state.metrics.encode()?)
}

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "version": TASKLENS_VERSION,
            "lag_generation": state.engine.generation().current(),
            "active_sessions": state.engine.gate().engagements(),
        })),
    )
}
