//! API errors and their HTTP mapping
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tasklens_core::WorkloadError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Workload(#[from] WorkloadError),

    #[error("REMOTE/{0:#}")]
    Remote(anyhow::Error),

    #[error("REMOTE/disabled")]
    RemoteDisabled,

    #[error("METRICS/{0}")]
    Metrics(#[from] prometheus::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Workload(_) | Self::Metrics(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Remote(_) => StatusCode::BAD_GATEWAY,
            Self::RemoteDisabled => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
