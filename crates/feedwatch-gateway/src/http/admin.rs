use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, PoisonError};
use tracing::info;

use feedwatch_core::FeedwatchConfig;
use feedwatch_scheduler::{CadenceTable, SchedulerSettings};

use super::{config_error, scheduler_error, ApiError};
use crate::app::AppState;

#[derive(Debug, Deserialize)]
pub struct LiveGameSignal {
    pub active: bool,
}

/// PUT /signals/live-game with `{ "active": bool }`.
pub async fn live_game_signal(
    State(state): State<Arc<AppState>>,
    Json(signal): Json<LiveGameSignal>,
) -> Json<Value> {
    info!(active = signal.active, "live-game window signal");
    state.scheduler.set_live_game_window(signal.active);
    Json(json!({"active": signal.active}))
}

/// POST /admin/reload: re-read the config sources and swap the cadence
/// table and scheduler parameters in between ticks.
///
/// Rejected with 422 when the file is invalid or the job ids change.
pub async fn reload_handler(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let config = FeedwatchConfig::load(state.config_path.as_deref()).map_err(config_error)?;
    let settings = SchedulerSettings::from_config(&config).map_err(scheduler_error)?;
    let table = CadenceTable::from_config(&config.jobs).map_err(scheduler_error)?;
    let jobs = table.len();

    state
        .scheduler
        .reload(table, settings)
        .await
        .map_err(scheduler_error)?;

    *state.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    info!(jobs, "config reloaded");
    Ok(Json(json!({"ok": true, "jobs": jobs})))
}
