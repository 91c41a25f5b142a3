// Operational scenarios driven through the synchronous core with explicit
// timestamps, so every assertion is deterministic.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use feedwatch_core::{config::default_jobs, PhaseKind, PriorityTier};
use feedwatch_scheduler::{
    coordinator::{Dispatch, SchedulerCore},
    fetch_fn,
    health::HealthEventKind,
    registry::{Cadence, JobProfile},
    CadenceTable, CircuitState, HealthSink, JobRegistry, OutcomeKind, RunOutcome, SchedulePhase,
    SchedulerSettings,
};

fn season_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 9, 13, 16, 0, 0).single().unwrap()
}

fn regular() -> SchedulePhase {
    SchedulePhase::new(PhaseKind::Regular, false)
}

fn default_core(sink: Arc<HealthSink>) -> SchedulerCore {
    let registry = JobRegistry::from_config(&default_jobs(), |_| fetch_fn(|_| async { Ok(()) })).unwrap();
    SchedulerCore::new(
        registry,
        SchedulerSettings::default(),
        regular(),
        season_start(),
        sink,
    )
}

fn finish(core: &mut SchedulerCore, d: &Dispatch, kind: OutcomeKind, at: DateTime<Utc>) {
    let outcome = RunOutcome {
        job_id: d.descriptor.id.clone(),
        run_id: d.run_id,
        kind,
        duration_ms: 40,
        error: (!kind.is_success()).then(|| "HTTP 503".to_string()),
    };
    core.apply_outcome(&outcome, at).expect("outcome applies to a live run");
}

/// One tick: every other job's dispatch succeeds instantly, so only `id`
/// competes for capacity. Returns the dispatches of `id`.
fn dispatches_for(core: &mut SchedulerCore, id: &str, now: DateTime<Utc>) -> Vec<Dispatch> {
    let (mine, others): (Vec<_>, Vec<_>) = core
        .next_dispatches(now)
        .into_iter()
        .partition(|d| d.descriptor.id == id);
    for d in &others {
        finish(core, d, OutcomeKind::Success, now);
    }
    mine
}

/// Tick every two seconds until `id` is dispatched, returning the dispatch
/// and the time it happened.
fn run_until_dispatched(
    core: &mut SchedulerCore,
    id: &str,
    mut now: DateTime<Utc>,
    limit: Duration,
) -> (Dispatch, DateTime<Utc>) {
    let give_up = now + limit;
    while now <= give_up {
        if let Some(d) = dispatches_for(core, id, now).pop() {
            return (d, now);
        }
        now += Duration::seconds(2);
    }
    panic!("{id} was not dispatched within {limit:?}");
}

/// Fail `id` on every dispatch until its circuit opens. Returns the time of
/// the failure that opened it.
fn fail_until_open(core: &mut SchedulerCore, id: &str, mut now: DateTime<Utc>) -> DateTime<Utc> {
    loop {
        let (d, at) = run_until_dispatched(core, id, now, Duration::hours(25));
        finish(core, &d, OutcomeKind::TransientFailure, at);
        now = at;
        if core.snapshot(id).unwrap().circuit_state == CircuitState::Open {
            return at;
        }
    }
}

#[test]
fn injury_status_circuit_opens_then_recovers_with_one_trial() {
    let sink = HealthSink::new();
    let mut core = default_core(Arc::clone(&sink));
    let settings = core.settings().clone();

    let opened_at = fail_until_open(&mut core, "injury_status", season_start());
    let snap = core.snapshot("injury_status").unwrap();
    assert_eq!(snap.consecutive_failures, settings.breaker.failure_threshold);
    assert_eq!(snap.circuit_opened_at, Some(opened_at));
    // Five failures fit comfortably inside the 30 minute window.
    assert!(opened_at - season_start() < settings.breaker.failure_window);

    let cool_down = settings.breaker.cool_down_for(PriorityTier::Critical, 0);
    let (trial, trial_at) = run_until_dispatched(&mut core, "injury_status", opened_at, Duration::hours(1));
    assert!(trial.trial);
    assert!(trial_at >= opened_at + cool_down);
    assert_eq!(core.snapshot("injury_status").unwrap().circuit_state, CircuitState::HalfOpen);

    // Exactly one trial: nothing else for this job while it runs.
    for step in 1..=30 {
        let later = trial_at + Duration::seconds(2 * step);
        assert!(dispatches_for(&mut core, "injury_status", later).is_empty());
    }

    let done_at = trial_at + Duration::minutes(1);
    finish(&mut core, &trial, OutcomeKind::Success, done_at);
    let snap = core.snapshot("injury_status").unwrap();
    assert_eq!(snap.circuit_state, CircuitState::Closed);
    assert_eq!(snap.consecutive_failures, 0);
    assert_eq!(snap.next_due_at, done_at + Duration::minutes(3));

    let transitions: Vec<_> = sink
        .events(usize::MAX)
        .into_iter()
        .filter(|e| e.job_id == "injury_status")
        .filter_map(|e| match e.kind {
            HealthEventKind::CircuitChanged { from, to } => Some((from, to)),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        [
            (CircuitState::Closed, CircuitState::Open),
            (CircuitState::Open, CircuitState::HalfOpen),
            (CircuitState::HalfOpen, CircuitState::Closed),
        ]
    );
}

#[test]
fn failed_trial_reopens_with_longer_cool_down() {
    let mut core = default_core(HealthSink::new());
    let settings = core.settings().clone();

    let opened_at = fail_until_open(&mut core, "vegas_odds", season_start());
    let (trial, trial_at) = run_until_dispatched(&mut core, "vegas_odds", opened_at, Duration::hours(1));
    finish(&mut core, &trial, OutcomeKind::Timeout, trial_at);

    let snap = core.snapshot("vegas_odds").unwrap();
    assert_eq!(snap.circuit_state, CircuitState::Open);
    assert_eq!(snap.circuit_opened_at, Some(trial_at));

    let longer = settings.breaker.cool_down_for(PriorityTier::Critical, 1);
    assert!(longer > settings.breaker.cool_down_for(PriorityTier::Critical, 0));
    let (_, second_trial_at) = run_until_dispatched(&mut core, "vegas_odds", trial_at, Duration::hours(2));
    assert!(second_trial_at >= trial_at + longer);
}

#[test]
fn vegas_odds_reload_applies_after_in_flight_run_completes() {
    let mut core = default_core(HealthSink::new());
    let start = season_start();

    let (run, at) = run_until_dispatched(&mut core, "vegas_odds", start, Duration::minutes(11));
    assert_eq!(at, start + Duration::minutes(10));

    let mut table = CadenceTable::new();
    for job in default_jobs() {
        let mut profile = JobProfile {
            tier: job.tier,
            cadence: Cadence::try_from(&job.cadence).unwrap(),
        };
        if job.id == "vegas_odds" {
            profile.cadence = Cadence::uniform(Duration::minutes(5)).unwrap();
        }
        table.insert(job.id, profile);
    }
    core.reload(&table, SchedulerSettings::default()).unwrap();

    // The running dispatch keeps the descriptor it started with.
    assert_eq!(run.descriptor.cadence.for_phase(PhaseKind::Regular), Duration::minutes(10));
    assert_eq!(core.cadence_for("vegas_odds").unwrap(), Duration::minutes(5));

    let done_at = at + Duration::seconds(45);
    finish(&mut core, &run, OutcomeKind::Success, done_at);
    assert_eq!(
        core.snapshot("vegas_odds").unwrap().next_due_at,
        done_at + Duration::minutes(5)
    );
}

#[test]
fn manual_trigger_waits_for_open_circuit() {
    let mut core = default_core(HealthSink::new());
    let opened_at = fail_until_open(&mut core, "dfs_data", season_start());
    let reopens_at = opened_at + core.settings().breaker.cool_down_for(PriorityTier::High, 0);

    let now = opened_at + Duration::seconds(10);
    core.trigger_now("dfs_data", now).unwrap();
    assert!(dispatches_for(&mut core, "dfs_data", now).is_empty());
    assert_eq!(core.snapshot("dfs_data").unwrap().next_due_at, reopens_at);

    let before = reopens_at - Duration::seconds(1);
    assert!(dispatches_for(&mut core, "dfs_data", before).is_empty());

    let trials = dispatches_for(&mut core, "dfs_data", reopens_at);
    assert_eq!(trials.len(), 1);
    assert!(trials[0].trial);
}

#[test]
fn pause_and_resume_keep_failure_history() {
    let mut core = default_core(HealthSink::new());
    let mut now = season_start();
    for _ in 0..2 {
        let (d, at) = run_until_dispatched(&mut core, "rss_feeds", now, Duration::hours(1));
        finish(&mut core, &d, OutcomeKind::TransientFailure, at);
        now = at;
    }

    core.pause("rss_feeds", now).unwrap();
    let later = now + Duration::hours(3);
    assert!(dispatches_for(&mut core, "rss_feeds", later).is_empty());

    let snap = core.resume("rss_feeds", later).unwrap();
    assert!(!snap.paused);
    assert_eq!(snap.consecutive_failures, 2);
    let (d, _) = run_until_dispatched(&mut core, "rss_feeds", later, Duration::minutes(1));
    assert_eq!(d.attempt, 3);
}

#[test]
fn live_game_acceleration_only_touches_critical_and_high() {
    let mut core = default_core(HealthSink::new());
    let jobs = default_jobs();
    let base: Vec<_> = jobs
        .iter()
        .map(|j| (j.id.clone(), j.tier, core.cadence_for(&j.id).unwrap()))
        .collect();

    core.set_phase(SchedulePhase::new(PhaseKind::Regular, true));
    for (id, tier, before) in base {
        let after = core.cadence_for(&id).unwrap();
        if tier.is_accelerated() {
            assert_eq!(after, before / 2, "{id}");
        } else {
            assert_eq!(after, before, "{id}");
        }
    }
}

#[test]
fn pre_season_uses_pre_season_cadence() {
    let mut core = default_core(HealthSink::new());
    core.set_phase(SchedulePhase::new(PhaseKind::PreSeason, false));
    assert_eq!(core.cadence_for("injury_status").unwrap(), Duration::minutes(15));
    assert_eq!(core.cadence_for("full_ingestion").unwrap(), Duration::hours(24));

    core.next_dispatches(season_start());
    assert_eq!(
        core.snapshot("injury_status").unwrap().next_due_at,
        season_start() + Duration::minutes(15)
    );
}

#[test]
fn higher_tiers_win_when_capacity_is_short() {
    let settings = SchedulerSettings {
        max_in_flight: 3,
        ..SchedulerSettings::default()
    };
    let registry = JobRegistry::from_config(&default_jobs(), |_| fetch_fn(|_| async { Ok(()) })).unwrap();
    let mut core = SchedulerCore::new(registry, settings, regular(), season_start(), HealthSink::new());

    let now = season_start() + Duration::days(3);
    core.trigger_all(now);
    let tiers: Vec<_> = core.next_dispatches(now).iter().map(|d| d.descriptor.tier).collect();
    assert_eq!(tiers.len(), 3);
    assert_eq!(tiers[..2], [PriorityTier::Critical, PriorityTier::Critical]);
    assert_eq!(tiers[2], PriorityTier::High);
    assert_eq!(core.in_flight(), 3);
}
