//! Single-writer scheduling state machine.
//!
//! [`SchedulerCore`] owns every [`JobRuntimeState`] and is driven with explicit
//! timestamps, so the async engine and the tests share the same decision
//! logic. Nothing here awaits.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use feedwatch_core::PriorityTier;

use crate::{
    breaker::{Admission, CircuitBreaker, CircuitTransition},
    error::{Result, SchedulerError},
    health::{HealthEvent, HealthEventKind, HealthSink},
    registry::{CadenceTable, JobDescriptor, JobRegistry},
    settings::SchedulerSettings,
    types::{CircuitState, JobSnapshot, LastResult, OutcomeKind, RunOutcome, SchedulePhase},
};

/// Mutable per-job bookkeeping. One per registered descriptor.
#[derive(Debug)]
struct JobRuntimeState {
    next_due_at: DateTime<Utc>,
    consecutive_failures: u32,
    breaker: CircuitBreaker,
    last_result: LastResult,
    last_run_at: Option<DateTime<Utc>>,
    last_duration_ms: Option<u64>,
    current_attempt: u32,
    paused: bool,
    fatal_error: Option<String>,
    persistently_failing: bool,
    /// Process start, last dispatch or last completion.
    anchor: DateTime<Utc>,
    /// Backoff delay replacing the cadence while failures are outstanding.
    retry_delay: Option<Duration>,
    /// Explicit due time from a manual trigger or a breaker rejection.
    forced_due: Option<DateTime<Utc>>,
    runs: Vec<Uuid>,
}

impl JobRuntimeState {
    fn new(now: DateTime<Utc>, cadence: Duration) -> Self {
        Self {
            next_due_at: now + cadence,
            consecutive_failures: 0,
            breaker: CircuitBreaker::new(),
            last_result: LastResult::None,
            last_run_at: None,
            last_duration_ms: None,
            current_attempt: 0,
            paused: false,
            fatal_error: None,
            persistently_failing: false,
            anchor: now,
            retry_delay: None,
            forced_due: None,
            runs: Vec::new(),
        }
    }

    fn due_at(&self, cadence: Duration) -> DateTime<Utc> {
        if let Some(at) = self.forced_due {
            return at;
        }
        let wait = self.retry_delay.map_or(cadence, |d| d.min(cadence));
        self.anchor + wait
    }

    /// Recompute `next_due_at`. An open circuit is never due before it reopens.
    fn reschedule(&mut self, cadence: Duration) {
        let mut due = self.due_at(cadence);
        if self.breaker.state() == CircuitState::Open {
            if let Some(reopens_at) = self.breaker.reopens_at().filter(|at| *at > due) {
                self.forced_due = Some(reopens_at);
                due = reopens_at;
            }
        }
        self.next_due_at = due;
    }

    fn snapshot(&self, desc: &JobDescriptor) -> JobSnapshot {
        JobSnapshot {
            id: desc.id.clone(),
            tier: desc.tier,
            circuit_state: self.breaker.state(),
            circuit_opened_at: self.breaker.opened_at(),
            consecutive_failures: self.consecutive_failures,
            current_attempt: self.current_attempt,
            last_result: self.last_result,
            last_run_at: self.last_run_at,
            last_duration_ms: self.last_duration_ms,
            next_due_at: self.next_due_at,
            paused: self.paused,
            in_flight: self.runs.len() as u32,
            fatal_error: self.fatal_error.clone(),
        }
    }
}

/// A fetch the engine should start now.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub descriptor: Arc<JobDescriptor>,
    pub run_id: Uuid,
    pub attempt: u32,
    pub phase: SchedulePhase,
    pub timeout: Duration,
    /// This run is the half-open trial.
    pub trial: bool,
}

/// Result of applying one outcome.
#[derive(Debug, Clone)]
pub struct AppliedOutcome {
    pub snapshot: JobSnapshot,
    pub transition: Option<CircuitTransition>,
}

/// Cadence in force for `desc` under `phase`.
///
/// Live-game acceleration divides the base cadence for critical and high
/// tiers only.
pub fn applicable_cadence(desc: &JobDescriptor, phase: SchedulePhase, factor: f64) -> Duration {
    let base = desc.cadence.for_phase(phase.kind);
    if phase.acceleration_active && desc.tier.is_accelerated() && factor > 1.0 {
        let ms = (base.num_milliseconds() as f64 / factor) as i64;
        Duration::milliseconds(ms.max(1))
    } else {
        base
    }
}

pub struct SchedulerCore {
    registry: JobRegistry,
    states: HashMap<String, JobRuntimeState>,
    settings: SchedulerSettings,
    phase: SchedulePhase,
    in_flight: usize,
    sink: Arc<HealthSink>,
}

impl SchedulerCore {
    pub fn new(
        registry: JobRegistry,
        settings: SchedulerSettings,
        phase: SchedulePhase,
        now: DateTime<Utc>,
        sink: Arc<HealthSink>,
    ) -> Self {
        let factor = settings.acceleration_factor;
        let states: HashMap<String, JobRuntimeState> = registry
            .all()
            .map(|desc| {
                let cadence = applicable_cadence(desc, phase, factor);
                (desc.id.clone(), JobRuntimeState::new(now, cadence))
            })
            .collect();
        for desc in registry.all() {
            if let Some(state) = states.get(&desc.id) {
                sink.record_snapshot(&state.snapshot(desc));
            }
        }
        sink.set_phase(phase);
        Self {
            registry,
            states,
            settings,
            phase,
            in_flight: 0,
            sink,
        }
    }

    /// Register a job after start-up. Its first run is one cadence from `now`.
    pub fn register(&mut self, descriptor: JobDescriptor, now: DateTime<Utc>) -> Result<JobSnapshot> {
        let desc = self.registry.register(descriptor)?;
        let cadence = applicable_cadence(&desc, self.phase, self.settings.acceleration_factor);
        let state = JobRuntimeState::new(now, cadence);
        let snapshot = state.snapshot(&desc);
        self.states.insert(desc.id.clone(), state);
        self.sink.record_snapshot(&snapshot);
        Ok(snapshot)
    }

    pub fn phase(&self) -> SchedulePhase {
        self.phase
    }

    /// Swap in a freshly resolved phase. Takes effect on the next due-time computation.
    pub fn set_phase(&mut self, phase: SchedulePhase) {
        if phase != self.phase {
            info!(
                phase = %phase.kind,
                acceleration = phase.acceleration_active,
                "schedule phase changed"
            );
        }
        self.phase = phase;
        self.sink.set_phase(phase);
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Fetches currently running, across all jobs.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn cadence_for(&self, id: &str) -> Result<Duration> {
        let desc = self.registry.lookup(id)?;
        Ok(applicable_cadence(&desc, self.phase, self.settings.acceleration_factor))
    }

    /// Select and commit the fetches to start at `now`.
    ///
    /// Due jobs are ordered by tier, then by due time. Jobs left over once
    /// the global cap is reached stay due for the next tick.
    pub fn next_dispatches(&mut self, now: DateTime<Utc>) -> Vec<Dispatch> {
        self.refresh_due();

        let mut candidates: Vec<(PriorityTier, DateTime<Utc>, Arc<JobDescriptor>)> = self
            .registry
            .all()
            .filter_map(|desc| {
                let state = self.states.get(&desc.id)?;
                // A non-closed circuit waits for its runs to drain so the
                // half-open trial is the only run of that job.
                let settled = state.runs.is_empty() || state.breaker.state() == CircuitState::Closed;
                let eligible = !state.paused
                    && settled
                    && (state.runs.len() as u32) < desc.max_concurrent
                    && state.next_due_at <= now;
                eligible.then(|| (desc.tier, state.next_due_at, Arc::clone(desc)))
            })
            .collect();
        candidates.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.id.cmp(&b.2.id)));

        let mut dispatches = Vec::new();
        for (idx, (_, _, desc)) in candidates.iter().enumerate() {
            if self.in_flight >= self.settings.max_in_flight {
                debug!(
                    deferred = candidates.len() - idx,
                    cap = self.settings.max_in_flight,
                    "in-flight cap reached; remaining due jobs wait for the next tick"
                );
                break;
            }
            let Some(state) = self.states.get_mut(&desc.id) else {
                continue;
            };

            let (admission, transition) = state.breaker.admit(now);
            if let Some(t) = transition {
                info!(job_id = %desc.id, "circuit half-open; trial dispatch permitted");
                self.sink.record_transition(&desc.id, &t);
            }

            let trial = match admission {
                Admission::Rejected { retry_at } => {
                    debug!(job_id = %desc.id, %retry_at, "circuit open; dispatch deferred");
                    state.forced_due = Some(retry_at);
                    state.next_due_at = retry_at;
                    self.sink.record_snapshot(&state.snapshot(desc));
                    continue;
                }
                Admission::Trial => true,
                Admission::Admitted => false,
            };

            let run_id = Uuid::new_v4();
            state.runs.push(run_id);
            state.forced_due = None;
            state.anchor = now;
            state.current_attempt = state.consecutive_failures.saturating_add(1);
            let cadence = applicable_cadence(desc, self.phase, self.settings.acceleration_factor);
            state.next_due_at = state.due_at(cadence);
            self.in_flight += 1;

            info!(
                job_id = %desc.id,
                %run_id,
                attempt = state.current_attempt,
                trial,
                "dispatching fetch"
            );
            self.sink.record_snapshot(&state.snapshot(desc));
            dispatches.push(Dispatch {
                descriptor: Arc::clone(desc),
                run_id,
                attempt: state.current_attempt,
                phase: self.phase,
                timeout: self.settings.timeouts.for_tier(desc.tier),
                trial,
            });
        }
        self.sink.set_in_flight(self.in_flight);
        dispatches
    }

    /// Apply a completed run. Returns `None` when the outcome is stale
    /// (its run is no longer in flight) and was discarded.
    pub fn apply_outcome(&mut self, outcome: &RunOutcome, now: DateTime<Utc>) -> Option<AppliedOutcome> {
        let Ok(desc) = self.registry.lookup(&outcome.job_id) else {
            warn!(job_id = %outcome.job_id, "outcome for unregistered job discarded");
            return None;
        };
        let state = self.states.get_mut(&outcome.job_id)?;
        let Some(pos) = state.runs.iter().position(|r| *r == outcome.run_id) else {
            warn!(
                job_id = %outcome.job_id,
                run_id = %outcome.run_id,
                "late outcome for abandoned run discarded"
            );
            return None;
        };
        state.runs.swap_remove(pos);
        self.in_flight = self.in_flight.saturating_sub(1);

        state.last_run_at = Some(now);
        state.last_duration_ms = Some(outcome.duration_ms);
        state.anchor = now;

        let cadence = applicable_cadence(&desc, self.phase, self.settings.acceleration_factor);
        let mut transition = None;
        match outcome.kind {
            OutcomeKind::Success => {
                state.consecutive_failures = 0;
                state.current_attempt = 0;
                state.retry_delay = None;
                state.persistently_failing = false;
                state.last_result = LastResult::Success;
                transition = state.breaker.report(true, now, &self.settings.breaker, desc.tier);
                debug!(job_id = %desc.id, duration_ms = outcome.duration_ms, "fetch succeeded");
            }
            OutcomeKind::TransientFailure | OutcomeKind::Timeout => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                state.last_result = LastResult::Failure;
                transition = state.breaker.report(false, now, &self.settings.breaker, desc.tier);
                let delay = self
                    .settings
                    .backoff
                    .next_delay(state.consecutive_failures, cadence);
                state.retry_delay = Some(delay);

                if outcome.kind == OutcomeKind::Timeout {
                    warn!(
                        job_id = %desc.id,
                        duration_ms = outcome.duration_ms,
                        consecutive_failures = state.consecutive_failures,
                        retry_in_ms = delay.num_milliseconds(),
                        "fetch timed out"
                    );
                    self.sink.record_event(HealthEvent {
                        at: now,
                        job_id: desc.id.clone(),
                        kind: HealthEventKind::TimedOut {
                            duration_ms: outcome.duration_ms,
                        },
                    });
                } else {
                    warn!(
                        job_id = %desc.id,
                        error = outcome.error.as_deref().unwrap_or("unknown"),
                        consecutive_failures = state.consecutive_failures,
                        retry_in_ms = delay.num_milliseconds(),
                        "fetch failed, backing off"
                    );
                }

                if self.settings.backoff.is_exhausted(state.consecutive_failures)
                    && !state.persistently_failing
                {
                    state.persistently_failing = true;
                    warn!(
                        job_id = %desc.id,
                        consecutive_failures = state.consecutive_failures,
                        "job is persistently failing"
                    );
                    self.sink.record_event(HealthEvent {
                        at: now,
                        job_id: desc.id.clone(),
                        kind: HealthEventKind::PersistentlyFailing {
                            consecutive_failures: state.consecutive_failures,
                        },
                    });
                }
            }
            OutcomeKind::ConfigurationError => {
                let message = outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| "configuration error".to_string());
                error!(job_id = %desc.id, error = %message, "fetch misconfigured; job paused");
                state.last_result = LastResult::Failure;
                state.paused = true;
                state.retry_delay = None;
                // Says nothing about the source: a half-open trial stays pending.
                state.breaker.release_trial();
                state.fatal_error = Some(message.clone());
                self.sink.record_event(HealthEvent {
                    at: now,
                    job_id: desc.id.clone(),
                    kind: HealthEventKind::Fatal { error: message },
                });
            }
        }

        if let Some(t) = transition {
            match t.to {
                CircuitState::Open => warn!(
                    job_id = %desc.id,
                    from = %t.from,
                    reopens_at = ?state.breaker.reopens_at(),
                    "circuit opened"
                ),
                _ => info!(job_id = %desc.id, from = %t.from, to = %t.to, "circuit state changed"),
            }
            self.sink.record_transition(&desc.id, &t);
        }

        state.reschedule(cadence);
        let snapshot = state.snapshot(&desc);
        self.sink.record_snapshot(&snapshot);
        self.sink.record_outcome(outcome, state.persistently_failing);
        self.sink.set_in_flight(self.in_flight);
        Some(AppliedOutcome { snapshot, transition })
    }

    /// Make the job due immediately. Breaker admission and caps still apply.
    pub fn trigger_now(&mut self, id: &str, now: DateTime<Utc>) -> Result<JobSnapshot> {
        let desc = self.registry.lookup(id)?;
        let state = state_of(&mut self.states, id)?;
        state.forced_due = Some(now);
        state.next_due_at = now;
        info!(job_id = %id, paused = state.paused, "manual trigger accepted");
        let snapshot = state.snapshot(&desc);
        self.sink.record_snapshot(&snapshot);
        Ok(snapshot)
    }

    pub fn trigger_all(&mut self, now: DateTime<Utc>) -> Vec<JobSnapshot> {
        let ids: Vec<String> = self.registry.all().map(|d| d.id.clone()).collect();
        ids.iter()
            .filter_map(|id| self.trigger_now(id, now).ok())
            .collect()
    }

    /// Suppress future dispatches. A run already in flight is not cancelled.
    pub fn pause(&mut self, id: &str, now: DateTime<Utc>) -> Result<JobSnapshot> {
        let desc = self.registry.lookup(id)?;
        let state = state_of(&mut self.states, id)?;
        if !state.paused {
            state.paused = true;
            info!(job_id = %id, "job paused");
            self.sink.record_event(HealthEvent {
                at: now,
                job_id: id.to_string(),
                kind: HealthEventKind::Paused,
            });
        }
        let snapshot = state.snapshot(&desc);
        self.sink.record_snapshot(&snapshot);
        Ok(snapshot)
    }

    /// Resume a paused job, keeping its failure history.
    ///
    /// Also clears a fatal configuration error: resuming is the operator's
    /// acknowledgement that the source was fixed.
    pub fn resume(&mut self, id: &str, now: DateTime<Utc>) -> Result<JobSnapshot> {
        let desc = self.registry.lookup(id)?;
        let cadence = applicable_cadence(&desc, self.phase, self.settings.acceleration_factor);
        let state = state_of(&mut self.states, id)?;
        if state.paused {
            state.paused = false;
            state.fatal_error = None;
            info!(job_id = %id, "job resumed");
            self.sink.record_event(HealthEvent {
                at: now,
                job_id: id.to_string(),
                kind: HealthEventKind::Resumed,
            });
        }
        state.reschedule(cadence);
        let snapshot = state.snapshot(&desc);
        self.sink.record_snapshot(&snapshot);
        Ok(snapshot)
    }

    /// Swap the cadence table and scheduler parameters between ticks.
    pub fn reload(&mut self, table: &CadenceTable, settings: SchedulerSettings) -> Result<()> {
        self.registry.replace_table(table)?;
        info!(
            max_in_flight = settings.max_in_flight,
            acceleration_factor = settings.acceleration_factor,
            "scheduler settings reloaded"
        );
        self.settings = settings;
        self.refresh_due();
        Ok(())
    }

    pub fn snapshot(&self, id: &str) -> Result<JobSnapshot> {
        let desc = self.registry.lookup(id)?;
        self.states
            .get(id)
            .map(|s| s.snapshot(&desc))
            .ok_or_else(|| SchedulerError::UnknownJob { id: id.to_string() })
    }

    pub fn snapshots(&self) -> Vec<JobSnapshot> {
        self.registry
            .all()
            .filter_map(|desc| self.states.get(&desc.id).map(|s| s.snapshot(desc)))
            .collect()
    }

    /// Forget every in-flight run; their outcomes will be discarded on arrival.
    pub fn abandon_in_flight(&mut self) -> Vec<Uuid> {
        let mut abandoned = Vec::new();
        for (id, state) in self.states.iter_mut() {
            if !state.runs.is_empty() {
                warn!(job_id = %id, runs = state.runs.len(), "abandoning in-flight fetch");
                abandoned.append(&mut state.runs);
            }
        }
        self.in_flight = 0;
        self.sink.set_in_flight(0);
        abandoned
    }

    /// Recompute `next_due_at` from the current phase and cadence table.
    fn refresh_due(&mut self) {
        for desc in self.registry.all() {
            if let Some(state) = self.states.get_mut(&desc.id) {
                let cadence = applicable_cadence(desc, self.phase, self.settings.acceleration_factor);
                let before = state.next_due_at;
                state.reschedule(cadence);
                if state.next_due_at != before {
                    self.sink.record_snapshot(&state.snapshot(desc));
                }
            }
        }
    }
}

fn state_of<'a>(
    states: &'a mut HashMap<String, JobRuntimeState>,
    id: &str,
) -> Result<&'a mut JobRuntimeState> {
    states
        .get_mut(id)
        .ok_or_else(|| SchedulerError::UnknownJob { id: id.to_string() })
}
