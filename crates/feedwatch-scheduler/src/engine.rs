//! Async driver around the scheduling core.
//!
//! [`SchedulerEngine`] ticks the [`SchedulerCore`], spawns due fetches under
//! their tier timeout and feeds each outcome back through one channel.
//! [`SchedulerHandle`] is the cloneable surface for overrides and signals.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    coordinator::{Dispatch, SchedulerCore},
    db::{RunLog, RunRecord},
    error::{FetchError, Result, SchedulerError},
    fetch::FetchContext,
    health::{EngineStatus, HealthSink},
    phase,
    registry::{CadenceTable, JobRegistry},
    settings::SchedulerSettings,
    types::{JobSnapshot, OutcomeKind, RunOutcome, SchedulePhase},
};

/// How often old rows are swept from the run log.
const PRUNE_INTERVAL_SECS: i64 = 3600;

/// Override requests, applied by the loop at the start of the next tick.
enum Request {
    Trigger {
        id: String,
        reply: oneshot::Sender<Result<JobSnapshot>>,
    },
    TriggerAll {
        reply: oneshot::Sender<Vec<JobSnapshot>>,
    },
    Pause {
        id: String,
        reply: oneshot::Sender<Result<JobSnapshot>>,
    },
    Resume {
        id: String,
        reply: oneshot::Sender<Result<JobSnapshot>>,
    },
    Reload {
        table: CadenceTable,
        settings: Box<SchedulerSettings>,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// A finished fetch on its way back to the loop.
struct Completion {
    outcome: RunOutcome,
    attempt: u32,
    started_at: DateTime<Utc>,
}

/// Wall clock anchored at start-up and advanced by the tokio clock, so
/// tests running with paused time see a consistent "now".
#[derive(Debug, Clone, Copy)]
struct Clock {
    wall: DateTime<Utc>,
    origin: Instant,
}

impl Clock {
    fn starting_at(wall: DateTime<Utc>) -> Self {
        Self {
            wall,
            origin: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.wall + Duration::from_std(self.origin.elapsed()).unwrap_or_else(|_| Duration::zero())
    }
}

fn to_std(d: Duration) -> std::time::Duration {
    d.to_std().unwrap_or(std::time::Duration::from_millis(1))
}

/// Cloneable control surface for a running [`SchedulerEngine`].
///
/// Every call fails with `EngineStopped` once the loop has exited.
#[derive(Clone)]
pub struct SchedulerHandle {
    requests: mpsc::Sender<Request>,
    live_game: Arc<watch::Sender<bool>>,
    sink: Arc<HealthSink>,
    run_log: Option<Arc<RunLog>>,
}

impl SchedulerHandle {
    /// Make the job due now. Breaker admission and concurrency caps still apply.
    pub async fn trigger_now(&self, id: &str) -> Result<JobSnapshot> {
        self.call(|reply| Request::Trigger {
            id: id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn trigger_all(&self) -> Result<Vec<JobSnapshot>> {
        self.call(|reply| Request::TriggerAll { reply }).await
    }

    pub async fn pause(&self, id: &str) -> Result<JobSnapshot> {
        self.call(|reply| Request::Pause {
            id: id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn resume(&self, id: &str) -> Result<JobSnapshot> {
        self.call(|reply| Request::Resume {
            id: id.to_string(),
            reply,
        })
        .await?
    }

    /// Replace the cadence table and scheduler parameters between ticks.
    pub async fn reload(&self, table: CadenceTable, settings: SchedulerSettings) -> Result<()> {
        self.call(|reply| Request::Reload {
            table,
            settings: Box::new(settings),
            reply,
        })
        .await?
    }

    /// Flip the live-game acceleration flag. Picked up on the next tick.
    pub fn set_live_game_window(&self, active: bool) {
        self.live_game.send_if_modified(|current| {
            let changed = *current != active;
            *current = active;
            changed
        });
    }

    pub fn live_game_window(&self) -> bool {
        *self.live_game.borrow()
    }

    pub fn health(&self) -> &Arc<HealthSink> {
        &self.sink
    }

    pub fn run_log(&self) -> Option<&Arc<RunLog>> {
        self.run_log.as_ref()
    }

    pub fn phase(&self) -> Option<SchedulePhase> {
        self.sink.status().phase
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(make(tx))
            .await
            .map_err(|_| SchedulerError::EngineStopped)?;
        rx.await.map_err(|_| SchedulerError::EngineStopped)
    }
}

/// Async driver: owns the [`SchedulerCore`] and runs its fetches.
pub struct SchedulerEngine {
    core: SchedulerCore,
    sink: Arc<HealthSink>,
    run_log: Option<Arc<RunLog>>,
    clock: Clock,
    requests: mpsc::Receiver<Request>,
    accepting: bool,
    pending: Vec<Request>,
    live_game: watch::Receiver<bool>,
    outcome_tx: mpsc::Sender<Completion>,
    outcome_rx: mpsc::Receiver<Completion>,
    running: HashMap<Uuid, CancellationToken>,
    phase_refreshed_at: DateTime<Utc>,
    last_prune: Option<DateTime<Utc>>,
}

impl SchedulerEngine {
    /// Build the engine and its handle. Call [`run`](Self::run) to start ticking.
    pub fn new(
        registry: JobRegistry,
        settings: SchedulerSettings,
        sink: Arc<HealthSink>,
        run_log: Option<Arc<RunLog>>,
    ) -> (Self, SchedulerHandle) {
        Self::starting_at(registry, settings, sink, run_log, Utc::now())
    }

    /// Like [`new`](Self::new) with an explicit wall-clock start.
    pub fn starting_at(
        registry: JobRegistry,
        settings: SchedulerSettings,
        sink: Arc<HealthSink>,
        run_log: Option<Arc<RunLog>>,
        start: DateTime<Utc>,
    ) -> (Self, SchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(64);
        let (live_tx, live_rx) = watch::channel(false);
        let (outcome_tx, outcome_rx) = mpsc::channel(settings.outcome_channel_capacity.max(1));

        sink.set_status(EngineStatus::Starting);
        let initial_phase = phase::resolve(start, false);
        let core = SchedulerCore::new(registry, settings, initial_phase, start, Arc::clone(&sink));

        let handle = SchedulerHandle {
            requests: request_tx,
            live_game: Arc::new(live_tx),
            sink: Arc::clone(&sink),
            run_log: run_log.clone(),
        };
        let engine = Self {
            core,
            sink,
            run_log,
            clock: Clock::starting_at(start),
            requests: request_rx,
            accepting: true,
            pending: Vec::new(),
            live_game: live_rx,
            outcome_tx,
            outcome_rx,
            running: HashMap::new(),
            phase_refreshed_at: start,
            last_prune: None,
        };
        (engine, handle)
    }

    /// Main loop. Ticks until `shutdown` broadcasts `true`, then drains.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let phase = self.core.phase();
        info!(
            jobs = self.core.registry().len(),
            phase = %phase.kind,
            max_in_flight = self.core.settings().max_in_flight,
            "scheduler engine started"
        );
        self.sink.set_status(EngineStatus::Running);

        let mut tick_every = self.core.settings().tick;
        let mut interval = tokio::time::interval(to_std(tick_every));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
                Some(done) = self.outcome_rx.recv() => self.complete(done),
                req = self.requests.recv(), if self.accepting => match req {
                    Some(req) => self.pending.push(req),
                    None => self.accepting = false,
                },
                _ = interval.tick() => {
                    self.tick();
                    if self.core.settings().tick != tick_every {
                        tick_every = self.core.settings().tick;
                        interval = tokio::time::interval(to_std(tick_every));
                        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        info!(tick_ms = tick_every.num_milliseconds(), "tick interval changed");
                    }
                }
            }
        }

        self.drain().await;
    }

    // --- private helpers ---------------------------------------------------

    fn tick(&mut self) {
        let now = self.clock.now();
        self.refresh_phase(now);

        for req in std::mem::take(&mut self.pending) {
            self.apply(req, now);
        }

        for dispatch in self.core.next_dispatches(now) {
            self.spawn_fetch(dispatch, now);
        }

        self.prune_run_log(now);
    }

    fn refresh_phase(&mut self, now: DateTime<Utc>) {
        let live_changed = self.live_game.has_changed().unwrap_or(false);
        if !live_changed && now - self.phase_refreshed_at < self.core.settings().phase_refresh {
            return;
        }
        let live = *self.live_game.borrow_and_update();
        self.core.set_phase(phase::resolve(now, live));
        self.phase_refreshed_at = now;
    }

    fn apply(&mut self, req: Request, now: DateTime<Utc>) {
        // A dropped receiver means the caller gave up; nothing to do.
        match req {
            Request::Trigger { id, reply } => {
                let _ = reply.send(self.core.trigger_now(&id, now));
            }
            Request::TriggerAll { reply } => {
                let _ = reply.send(self.core.trigger_all(now));
            }
            Request::Pause { id, reply } => {
                let _ = reply.send(self.core.pause(&id, now));
            }
            Request::Resume { id, reply } => {
                let _ = reply.send(self.core.resume(&id, now));
            }
            Request::Reload {
                table,
                settings,
                reply,
            } => {
                let result = self.core.reload(&table, *settings);
                if let Err(e) = &result {
                    warn!(error = %e, "reload rejected");
                }
                let _ = reply.send(result);
            }
        }
    }

    fn spawn_fetch(&mut self, dispatch: Dispatch, now: DateTime<Utc>) {
        let Dispatch {
            descriptor,
            run_id,
            attempt,
            phase,
            timeout,
            ..
        } = dispatch;

        let cancel = CancellationToken::new();
        self.running.insert(run_id, cancel.clone());

        let ctx = FetchContext {
            job_id: descriptor.id.clone(),
            run_id,
            attempt,
            phase,
            cancel: cancel.clone(),
        };
        let fetch = Arc::clone(&descriptor.fetch);
        let job_id = descriptor.id.clone();
        let tx = self.outcome_tx.clone();
        let limit = to_std(timeout);

        tokio::spawn(async move {
            let started = Instant::now();
            let mut task = tokio::spawn(async move { fetch.invoke(ctx).await });
            let result = match tokio::time::timeout(limit, &mut task).await {
                Ok(Ok(result)) => result,
                Ok(Err(join)) => Err(FetchError::Transient(format!("fetch task failed: {join}"))),
                Err(_) => {
                    cancel.cancel();
                    task.abort();
                    Err(FetchError::Timeout {
                        ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    })
                }
            };
            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            let (kind, error) = match result {
                Ok(()) => (OutcomeKind::Success, None),
                Err(e) => (e.outcome_kind(), Some(e.to_string())),
            };
            let done = Completion {
                outcome: RunOutcome {
                    job_id,
                    run_id,
                    kind,
                    duration_ms,
                    error,
                },
                attempt,
                started_at: now,
            };
            if tx.send(done).await.is_err() {
                debug!(%run_id, "engine gone; outcome dropped");
            }
        });
    }

    fn complete(&mut self, done: Completion) {
        self.running.remove(&done.outcome.run_id);
        let now = self.clock.now();
        if self.core.apply_outcome(&done.outcome, now).is_none() {
            return;
        }
        let Some(log) = &self.run_log else {
            return;
        };
        let record = RunRecord {
            run_id: done.outcome.run_id,
            job_id: done.outcome.job_id,
            attempt: done.attempt,
            outcome: done.outcome.kind,
            started_at: done.started_at,
            finished_at: now,
            duration_ms: done.outcome.duration_ms,
            error: done.outcome.error,
        };
        if let Err(e) = log.record(&record) {
            error!(job_id = %record.job_id, "failed to record run: {e}");
        }
    }

    fn prune_run_log(&mut self, now: DateTime<Utc>) {
        let Some(log) = &self.run_log else {
            return;
        };
        if self
            .last_prune
            .is_some_and(|at| now - at < Duration::seconds(PRUNE_INTERVAL_SECS))
        {
            return;
        }
        self.last_prune = Some(now);
        let cutoff = now - self.core.settings().run_log_retention;
        match log.prune_before(cutoff) {
            Ok(0) => {}
            Ok(n) => info!(removed = n, %cutoff, "pruned run log"),
            Err(e) => error!("run log prune failed: {e}"),
        }
    }

    /// Wait up to the grace period for in-flight fetches, then cancel the rest.
    async fn drain(&mut self) {
        self.sink.set_status(EngineStatus::Stopping);
        self.requests.close();
        // Dropping queued requests resolves their callers to `EngineStopped`.
        self.pending.clear();

        let grace = to_std(self.core.settings().shutdown_grace);
        let deadline = Instant::now() + grace;
        if self.core.in_flight() > 0 {
            info!(
                in_flight = self.core.in_flight(),
                grace_secs = grace.as_secs(),
                "waiting for in-flight fetches"
            );
        }
        while self.core.in_flight() > 0 {
            match tokio::time::timeout_at(deadline, self.outcome_rx.recv()).await {
                Ok(Some(done)) => self.complete(done),
                Ok(None) | Err(_) => break,
            }
        }

        for (_, token) in self.running.drain() {
            token.cancel();
        }
        let abandoned = self.core.abandon_in_flight();
        if !abandoned.is_empty() {
            warn!(count = abandoned.len(), "fetches cancelled at shutdown");
        }

        self.sink.set_status(EngineStatus::Stopped);
        info!("scheduler engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use chrono::TimeZone;
    use feedwatch_core::{PhaseKind, PriorityTier};

    use super::*;
    use crate::{
        fetch::{fetch_fn, FetchCapability},
        registry::{Cadence, JobDescriptor},
        settings::TierTimeouts,
    };

    fn october() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 11, 17, 0, 0).single().unwrap()
    }

    fn fast_settings() -> SchedulerSettings {
        SchedulerSettings {
            tick: Duration::seconds(1),
            ..SchedulerSettings::default()
        }
    }

    fn counting(counter: Arc<AtomicU32>) -> Arc<dyn FetchCapability> {
        fetch_fn(move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    fn registry_with(id: &str, tier: PriorityTier, every: Duration, fetch: Arc<dyn FetchCapability>) -> JobRegistry {
        let mut reg = JobRegistry::new();
        reg.register(JobDescriptor::new(id, tier, Cadence::uniform(every).unwrap(), fetch))
            .unwrap();
        reg
    }

    #[tokio::test(start_paused = true)]
    async fn runs_due_jobs_and_records_history() {
        let counter = Arc::new(AtomicU32::new(0));
        let reg = registry_with("vegas_odds", PriorityTier::Critical, Duration::seconds(10), counting(Arc::clone(&counter)));
        let sink = HealthSink::new();
        let log = Arc::new(RunLog::in_memory().unwrap());
        let (engine, handle) =
            SchedulerEngine::starting_at(reg, fast_settings(), Arc::clone(&sink), Some(Arc::clone(&log)), october());
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(engine.run(stop_rx));

        tokio::time::sleep(std::time::Duration::from_secs(25)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(sink.job("vegas_odds").unwrap().successes, 2);
        assert_eq!(log.recent("vegas_odds", 10).unwrap().len(), 2);
        assert_eq!(handle.phase().unwrap().kind, PhaseKind::Regular);

        stop_tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(sink.status().status, EngineStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_fetch_times_out() {
        let fetch = fetch_fn(|ctx: FetchContext| async move {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {}
                _ = tokio::time::sleep(std::time::Duration::from_secs(600)) => {}
            }
            Ok(())
        });
        let reg = registry_with("injury_status", PriorityTier::Critical, Duration::minutes(3), fetch);
        let settings = SchedulerSettings {
            timeouts: TierTimeouts {
                critical: Duration::seconds(2),
                ..TierTimeouts::default()
            },
            ..fast_settings()
        };
        let sink = HealthSink::new();
        let (engine, handle) = SchedulerEngine::starting_at(reg, settings, Arc::clone(&sink), None, october());
        let (_stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(engine.run(stop_rx));

        handle.trigger_now("injury_status").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;

        let health = sink.job("injury_status").unwrap();
        assert_eq!(health.timeouts, 1);
        assert_eq!(health.snapshot.consecutive_failures, 1);
        assert_eq!(health.snapshot.in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_dispatches_before_cadence() {
        let counter = Arc::new(AtomicU32::new(0));
        let reg = registry_with("full_ingestion", PriorityTier::Low, Duration::hours(24), counting(Arc::clone(&counter)));
        let (engine, handle) = SchedulerEngine::starting_at(reg, fast_settings(), HealthSink::new(), None, october());
        let (_stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(engine.run(stop_rx));

        let snap = handle.trigger_now("full_ingestion").await.unwrap();
        assert!(snap.next_due_at <= october() + Duration::seconds(2));
        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let err = handle.trigger_now("ghost").await.unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_JOB");
    }

    #[tokio::test(start_paused = true)]
    async fn live_game_window_accelerates_phase() {
        let reg = registry_with("vegas_odds", PriorityTier::Critical, Duration::minutes(10), counting(Arc::default()));
        let sink = HealthSink::new();
        let (engine, handle) = SchedulerEngine::starting_at(reg, fast_settings(), Arc::clone(&sink), None, october());
        let (_stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(engine.run(stop_rx));

        handle.set_live_game_window(true);
        assert!(handle.live_game_window());
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        assert!(handle.phase().unwrap().acceleration_active);
        let snap = sink.job("vegas_odds").unwrap().snapshot;
        assert_eq!(snap.next_due_at, october() + Duration::minutes(5));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_after_grace_and_rejects_requests() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let fetch = fetch_fn(move |ctx: FetchContext| {
            let flag = Arc::clone(&flag);
            async move {
                ctx.cancel.cancelled().await;
                flag.store(true, Ordering::SeqCst);
                Err(FetchError::Transient("cancelled".into()))
            }
        });
        let reg = registry_with("dfs_data", PriorityTier::Low, Duration::hours(1), fetch);
        let settings = SchedulerSettings {
            shutdown_grace: Duration::seconds(5),
            ..fast_settings()
        };
        let sink = HealthSink::new();
        let (engine, handle) = SchedulerEngine::starting_at(reg, settings, Arc::clone(&sink), None, october());
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(engine.run(stop_rx));

        handle.trigger_now("dfs_data").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        assert_eq!(sink.status().in_flight, 1);

        let started = Instant::now();
        stop_tx.send(true).unwrap();
        task.await.unwrap();
        assert!(started.elapsed() >= std::time::Duration::from_secs(5));
        assert_eq!(sink.status().status, EngineStatus::Stopped);
        assert_eq!(sink.status().in_flight, 0);

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(cancelled.load(Ordering::SeqCst));
        assert!(matches!(
            handle.pause("dfs_data").await,
            Err(SchedulerError::EngineStopped)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn reload_rejects_unknown_jobs() {
        let reg = registry_with("a", PriorityTier::High, Duration::minutes(1), counting(Arc::default()));
        let (engine, handle) = SchedulerEngine::starting_at(reg, fast_settings(), HealthSink::new(), None, october());
        let (_stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(engine.run(stop_rx));

        let err = handle
            .reload(CadenceTable::new(), SchedulerSettings::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIG");
    }
}
