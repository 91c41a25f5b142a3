use axum::{
    extract::{Query, State},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, PoisonError};

use crate::app::AppState;

const DEFAULT_EVENT_LIMIT: usize = 50;

/// GET /health: liveness probe returning server metadata.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let status = state.scheduler.health().status();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "engine": status.status,
    }))
}

/// GET /status: engine lifecycle, active phase and aggregate counters.
pub async fn status_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let sink = state.scheduler.health();
    let status = sink.status();
    let (tick_ms, max_in_flight) = {
        let config = state.config.read().unwrap_or_else(PoisonError::into_inner);
        (config.scheduler.tick_ms, config.scheduler.max_in_flight)
    };
    Json(json!({
        "status": status.status,
        "since": status.since,
        "phase": status.phase,
        "in_flight": status.in_flight,
        "live_game_window": state.scheduler.live_game_window(),
        "tick_ms": tick_ms,
        "max_in_flight": max_in_flight,
        "uptime_secs": (Utc::now() - state.started_at).num_seconds(),
        "summary": sink.summary(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

/// GET /events?limit=N: most recent health events, oldest first.
pub async fn events_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LimitQuery>,
) -> Json<Value> {
    let events = state
        .scheduler
        .health()
        .events(q.limit.unwrap_or(DEFAULT_EVENT_LIMIT));
    Json(json!(events))
}
