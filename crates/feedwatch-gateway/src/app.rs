use std::sync::{Arc, RwLock};

use axum::{
    routing::{get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use feedwatch_core::FeedwatchConfig;
use feedwatch_scheduler::SchedulerHandle;

/// Central shared state, passed as `Arc<AppState>` to all Axum handlers.
pub struct AppState {
    /// Config currently in force. Replaced after a successful reload.
    pub config: RwLock<FeedwatchConfig>,
    /// Source re-read by `POST /admin/reload`.
    pub config_path: Option<String>,
    pub scheduler: SchedulerHandle,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: FeedwatchConfig, config_path: Option<String>, scheduler: SchedulerHandle) -> Self {
        Self {
            config: RwLock::new(config),
            config_path,
            scheduler,
            started_at: Utc::now(),
        }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    use crate::http::{admin, health, jobs};

    Router::new()
        .route("/health", get(health::health_handler))
        .route("/status", get(health::status_handler))
        .route("/events", get(health::events_handler))
        .route("/jobs", get(jobs::list_jobs))
        .route("/jobs/trigger-all", post(jobs::trigger_all))
        .route("/jobs/{id}", get(jobs::get_job))
        .route("/jobs/{id}/runs", get(jobs::job_runs))
        .route("/jobs/{id}/trigger", post(jobs::trigger_job))
        .route("/jobs/{id}/pause", post(jobs::pause_job))
        .route("/jobs/{id}/resume", post(jobs::resume_job))
        .route("/signals/live-game", put(admin::live_game_signal))
        .route("/admin/reload", post(admin::reload_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use feedwatch_core::PriorityTier;
    use feedwatch_scheduler::{
        db::RunLog, fetch_fn, registry::Cadence, HealthSink, JobDescriptor, JobRegistry,
        SchedulerEngine, SchedulerSettings,
    };
    use serde_json::{json, Value};
    use tokio::sync::watch;
    use tower::ServiceExt;

    use super::*;

    struct Harness {
        router: Router,
        runs: Arc<AtomicU32>,
        _stop: watch::Sender<bool>,
    }

    fn harness() -> Harness {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        let mut registry = JobRegistry::new();
        registry
            .register(JobDescriptor::new(
                "vegas_odds",
                PriorityTier::Critical,
                Cadence::uniform(chrono::Duration::hours(1)).unwrap(),
                fetch_fn(move |_| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            ))
            .unwrap();
        let settings = SchedulerSettings {
            tick: chrono::Duration::milliseconds(100),
            ..SchedulerSettings::default()
        };
        let log = Arc::new(RunLog::in_memory().unwrap());
        let (engine, handle) = SchedulerEngine::new(registry, settings, HealthSink::new(), Some(log));
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(engine.run(stop_rx));

        let state = Arc::new(AppState::new(
            FeedwatchConfig::default(),
            Some("/nonexistent/feedwatch.toml".to_string()),
            handle,
        ));
        Harness {
            router: build_router(state),
            runs,
            _stop: stop_tx,
        }
    }

    async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(b) => builder
                .header("content-type", "application/json")
                .body(Body::from(b.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn health_reports_version() {
        let h = harness();
        let (status, body) = call(&h.router, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn unknown_job_is_404_with_code() {
        let h = harness();
        let (status, body) = call(&h.router, "GET", "/jobs/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "UNKNOWN_JOB");

        let (status, _) = call(&h.router, "POST", "/jobs/ghost/trigger", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn trigger_runs_job_and_records_history() {
        let h = harness();
        let (status, body) = call(&h.router, "POST", "/jobs/vegas_odds/trigger", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], "vegas_odds");

        for _ in 0..50 {
            if h.runs.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert_eq!(h.runs.load(Ordering::SeqCst), 1);

        let mut rows = Value::Null;
        for _ in 0..50 {
            let (_, body) = call(&h.router, "GET", "/jobs/vegas_odds/runs?limit=5", None).await;
            if body.as_array().is_some_and(|a| !a.is_empty()) {
                rows = body;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert_eq!(rows[0]["outcome"], "success");
    }

    #[tokio::test]
    async fn pause_and_resume_round_trip() {
        let h = harness();
        let (status, body) = call(&h.router, "POST", "/jobs/vegas_odds/pause", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["paused"], true);

        let (_, body) = call(&h.router, "POST", "/jobs/vegas_odds/resume", None).await;
        assert_eq!(body["paused"], false);
    }

    #[tokio::test]
    async fn live_game_signal_is_reflected_in_status() {
        let h = harness();
        let (status, body) =
            call(&h.router, "PUT", "/signals/live-game", Some(json!({"active": true}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["active"], true);

        let mut accelerated = false;
        for _ in 0..50 {
            let (_, body) = call(&h.router, "GET", "/status", None).await;
            if body["phase"]["acceleration_active"] == true {
                accelerated = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert!(accelerated);
    }

    #[tokio::test]
    async fn reload_rejects_membership_change() {
        // The default config names nine jobs; the harness registered one.
        let h = harness();
        let (status, body) = call(&h.router, "POST", "/admin/reload", None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "INVALID_CONFIG");
    }
}
