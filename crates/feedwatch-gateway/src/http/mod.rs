pub mod admin;
pub mod health;
pub mod jobs;

use axum::{http::StatusCode, Json};
use serde_json::{json, Value};
use tracing::warn;

use feedwatch_core::FeedwatchError;
use feedwatch_scheduler::SchedulerError;

/// Error half of every handler's `Result`.
pub type ApiError = (StatusCode, Json<Value>);

pub(crate) fn scheduler_error(e: SchedulerError) -> ApiError {
    let status = match &e {
        SchedulerError::UnknownJob { .. } => StatusCode::NOT_FOUND,
        SchedulerError::DuplicateJob { .. } => StatusCode::BAD_REQUEST,
        SchedulerError::InvalidConfig(_) => StatusCode::UNPROCESSABLE_ENTITY,
        SchedulerError::EngineStopped => StatusCode::SERVICE_UNAVAILABLE,
        SchedulerError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(code = e.code(), error = %e, "request failed");
    }
    (status, Json(json!({"error": e.to_string(), "code": e.code()})))
}

pub(crate) fn config_error(e: FeedwatchError) -> ApiError {
    warn!(code = e.code(), error = %e, "config reload failed");
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(json!({"error": e.to_string(), "code": e.code()})),
    )
}
