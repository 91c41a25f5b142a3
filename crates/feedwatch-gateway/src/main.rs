use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use feedwatch_core::FeedwatchConfig;
use feedwatch_scheduler::{
    db::RunLog,
    health::{HealthEventKind, HealthSink},
    FetchCapability, JobRegistry, SchedulerEngine, SchedulerSettings,
};

mod app;
mod fetch;
mod http;

/// Feedwatch gateway: runs the ingestion scheduler and its HTTP control surface.
#[derive(Parser, Debug)]
#[command(name = "feedwatch-gateway", version, about)]
struct Cli {
    /// Path to feedwatch.toml (defaults to ~/.feedwatch/feedwatch.toml).
    #[arg(long, env = "FEEDWATCH_CONFIG")]
    config: Option<String>,

    /// Mean latency of the simulated fetch capability, in milliseconds.
    #[arg(long, default_value_t = 250)]
    simulated_latency_ms: u64,

    /// Probability in [0, 1] that a simulated fetch fails transiently.
    #[arg(long, default_value_t = 0.0)]
    simulated_failure_rate: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "feedwatch_gateway=info,feedwatch_scheduler=info,tower_http=debug".into()
            }),
        )
        .init();

    let cli = Cli::parse();

    // explicit path > FEEDWATCH_CONFIG env > ~/.feedwatch/feedwatch.toml
    let config = FeedwatchConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let settings = SchedulerSettings::from_config(&config)?;

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening run log");
    let db = rusqlite::Connection::open(db_path)?;
    db.execute_batch("PRAGMA journal_mode=WAL;")?;
    let run_log = Arc::new(RunLog::new(db)?);

    let simulated: Arc<dyn FetchCapability> = Arc::new(fetch::SimulatedFetch::new(
        Duration::from_millis(cli.simulated_latency_ms),
        cli.simulated_failure_rate,
    ));
    let registry = JobRegistry::from_config(&config.jobs, |_| Arc::clone(&simulated))?;
    info!(jobs = registry.len(), "job table registered");

    let sink = HealthSink::new();
    let (engine, handle) = SchedulerEngine::new(registry, settings, Arc::clone(&sink), Some(run_log));

    let alerts_stop = CancellationToken::new();
    tokio::spawn(forward_alerts(Arc::clone(&sink), alerts_stop.clone()));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let engine_task = tokio::spawn(engine.run(shutdown_rx));

    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    let state = Arc::new(app::AppState::new(config, cli.config, handle));
    let router = app::build_router(state);

    info!("Feedwatch gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // signal scheduler to stop and wait for it to drain
    let _ = shutdown_tx.send(true);
    if let Err(e) = engine_task.await {
        error!("scheduler engine task failed: {e}");
    }
    alerts_stop.cancel();
    Ok(())
}

/// Log health events at alerting levels until cancelled.
async fn forward_alerts(sink: Arc<HealthSink>, stop: CancellationToken) {
    let mut events = sink.subscribe();
    loop {
        let event = tokio::select! {
            _ = stop.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(event) => match &event.kind {
                HealthEventKind::CircuitChanged { from, to } => {
                    warn!(job_id = %event.job_id, %from, %to, "ALERT circuit state changed");
                }
                HealthEventKind::PersistentlyFailing {
                    consecutive_failures,
                } => {
                    warn!(job_id = %event.job_id, consecutive_failures, "ALERT job persistently failing");
                }
                HealthEventKind::Fatal { error } => {
                    error!(job_id = %event.job_id, %error, "ALERT job paused on configuration error");
                }
                HealthEventKind::TimedOut { .. }
                | HealthEventKind::Paused
                | HealthEventKind::Resumed => {}
            },
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "alert forwarder lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => {
            error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    }
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
