//! Job inspection and manual override endpoints.
//!
//! Reads come from the health sink; overrides go through the scheduler
//! handle and resolve on the engine's next tick.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use feedwatch_scheduler::{JobSnapshot, SchedulerError};

use super::{health::LimitQuery, scheduler_error, ApiError};
use crate::app::AppState;

const DEFAULT_RUN_LIMIT: usize = 20;
const MAX_RUN_LIMIT: usize = 500;

/// GET /jobs
pub async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!(state.scheduler.health().jobs()))
}

/// GET /jobs/{id}
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .scheduler
        .health()
        .job(&id)
        .map(|job| Json(json!(job)))
        .ok_or_else(|| scheduler_error(SchedulerError::UnknownJob { id }))
}

/// GET /jobs/{id}/runs?limit=N, newest first.
pub async fn job_runs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Value>, ApiError> {
    if state.scheduler.health().job(&id).is_none() {
        return Err(scheduler_error(SchedulerError::UnknownJob { id }));
    }
    let Some(log) = state.scheduler.run_log() else {
        return Ok(Json(json!([])));
    };
    let limit = q.limit.unwrap_or(DEFAULT_RUN_LIMIT).min(MAX_RUN_LIMIT);
    let runs = log.recent(&id, limit).map_err(scheduler_error)?;
    Ok(Json(json!(runs)))
}

/// POST /jobs/{id}/trigger
pub async fn trigger_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobSnapshot>, ApiError> {
    info!(job_id = %id, "manual trigger requested");
    state.scheduler.trigger_now(&id).await.map(Json).map_err(scheduler_error)
}

/// POST /jobs/trigger-all
pub async fn trigger_all(State(state): State<Arc<AppState>>) -> Result<Json<Vec<JobSnapshot>>, ApiError> {
    info!("manual trigger of all jobs requested");
    state.scheduler.trigger_all().await.map(Json).map_err(scheduler_error)
}

/// POST /jobs/{id}/pause
pub async fn pause_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobSnapshot>, ApiError> {
    state.scheduler.pause(&id).await.map(Json).map_err(scheduler_error)
}

/// POST /jobs/{id}/resume
pub async fn resume_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobSnapshot>, ApiError> {
    state.scheduler.resume(&id).await.map(Json).map_err(scheduler_error)
}
