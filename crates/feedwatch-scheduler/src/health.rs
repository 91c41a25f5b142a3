//! Health and metrics sink: per-job counters and circuit events for operators.
//!
//! The coordination loop is the only writer. Dashboards pull snapshots via
//! [`HealthSink::jobs`] / [`HealthSink::summary`] or subscribe to the event
//! stream for alerting.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::{
    breaker::CircuitTransition,
    types::{CircuitState, JobSnapshot, OutcomeKind, RunOutcome, SchedulePhase},
};

/// Latency samples kept per job for the rolling average.
const LATENCY_WINDOW: usize = 50;
/// Events retained for pull-based consumers.
const EVENT_BACKLOG: usize = 256;

/// Lifecycle of the coordination loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub status: EngineStatus,
    pub since: DateTime<Utc>,
    pub phase: Option<SchedulePhase>,
    pub in_flight: usize,
}

/// Something an operator may want to be alerted about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HealthEventKind {
    CircuitChanged { from: CircuitState, to: CircuitState },
    /// `max_attempts` consecutive failures; the job stays scheduled.
    PersistentlyFailing { consecutive_failures: u32 },
    /// Configuration error: the job was paused and needs an operator.
    Fatal { error: String },
    TimedOut { duration_ms: u64 },
    Paused,
    Resumed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthEvent {
    pub at: DateTime<Utc>,
    pub job_id: String,
    #[serde(flatten)]
    pub kind: HealthEventKind,
}

/// Public per-job view: runtime snapshot plus counters.
#[derive(Debug, Clone, Serialize)]
pub struct JobHealth {
    #[serde(flatten)]
    pub snapshot: JobSnapshot,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub configuration_errors: u64,
    pub avg_latency_ms: u64,
    pub last_error: Option<String>,
    pub persistently_failing: bool,
}

/// Aggregate counts across all jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    pub jobs: usize,
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,
    pub paused: usize,
    pub fatal: usize,
    pub in_flight: usize,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
}

struct InternalEntry {
    snapshot: JobSnapshot,
    latencies: VecDeque<u64>,
    successes: u64,
    failures: u64,
    timeouts: u64,
    configuration_errors: u64,
    last_error: Option<String>,
    persistently_failing: bool,
}

impl InternalEntry {
    fn new(snapshot: JobSnapshot) -> Self {
        Self {
            snapshot,
            latencies: VecDeque::with_capacity(LATENCY_WINDOW),
            successes: 0,
            failures: 0,
            timeouts: 0,
            configuration_errors: 0,
            last_error: None,
            persistently_failing: false,
        }
    }

    fn avg_latency_ms(&self) -> u64 {
        if self.latencies.is_empty() {
            return 0;
        }
        self.latencies.iter().sum::<u64>() / self.latencies.len() as u64
    }

    fn to_health(&self) -> JobHealth {
        JobHealth {
            snapshot: self.snapshot.clone(),
            successes: self.successes,
            failures: self.failures,
            timeouts: self.timeouts,
            configuration_errors: self.configuration_errors,
            avg_latency_ms: self.avg_latency_ms(),
            last_error: self.last_error.clone(),
            persistently_failing: self.persistently_failing,
        }
    }
}

pub struct HealthSink {
    entries: DashMap<String, InternalEntry>,
    events: Mutex<VecDeque<HealthEvent>>,
    status: Mutex<SchedulerStatus>,
    event_tx: broadcast::Sender<HealthEvent>,
}

impl HealthSink {
    pub fn new() -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(EVENT_BACKLOG);
        Arc::new(Self {
            entries: DashMap::new(),
            events: Mutex::new(VecDeque::with_capacity(EVENT_BACKLOG)),
            status: Mutex::new(SchedulerStatus {
                status: EngineStatus::Starting,
                since: Utc::now(),
                phase: None,
                in_flight: 0,
            }),
            event_tx,
        })
    }

    // --- writer side (coordination loop) ------------------------------------

    /// Store the latest runtime snapshot, creating the entry if needed.
    pub fn record_snapshot(&self, snapshot: &JobSnapshot) {
        match self.entries.get_mut(&snapshot.id) {
            Some(mut entry) => entry.snapshot = snapshot.clone(),
            None => {
                self.entries
                    .insert(snapshot.id.clone(), InternalEntry::new(snapshot.clone()));
            }
        }
    }

    /// Fold a processed outcome into the counters.
    pub fn record_outcome(&self, outcome: &RunOutcome, persistently_failing: bool) {
        let Some(mut entry) = self.entries.get_mut(&outcome.job_id) else {
            return;
        };
        if entry.latencies.len() == LATENCY_WINDOW {
            entry.latencies.pop_front();
        }
        entry.latencies.push_back(outcome.duration_ms);
        match outcome.kind {
            OutcomeKind::Success => {
                entry.successes += 1;
                entry.last_error = None;
            }
            OutcomeKind::TransientFailure => entry.failures += 1,
            OutcomeKind::Timeout => {
                entry.failures += 1;
                entry.timeouts += 1;
            }
            OutcomeKind::ConfigurationError => {
                entry.failures += 1;
                entry.configuration_errors += 1;
            }
        }
        if outcome.error.is_some() {
            entry.last_error = outcome.error.clone();
        }
        entry.persistently_failing = persistently_failing;
    }

    pub fn record_transition(&self, job_id: &str, transition: &CircuitTransition) {
        self.record_event(HealthEvent {
            at: transition.at,
            job_id: job_id.to_string(),
            kind: HealthEventKind::CircuitChanged {
                from: transition.from,
                to: transition.to,
            },
        });
    }

    pub fn record_event(&self, event: HealthEvent) {
        {
            let mut events = lock(&self.events);
            if events.len() == EVENT_BACKLOG {
                events.pop_front();
            }
            events.push_back(event.clone());
        }
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    pub fn set_status(&self, status: EngineStatus) {
        let mut s = lock(&self.status);
        if s.status != status {
            s.status = status;
            s.since = Utc::now();
        }
    }

    pub fn set_phase(&self, phase: SchedulePhase) {
        lock(&self.status).phase = Some(phase);
    }

    pub fn set_in_flight(&self, in_flight: usize) {
        lock(&self.status).in_flight = in_flight;
    }

    // --- reader side (dashboards, alerting) ---------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.event_tx.subscribe()
    }

    pub fn status(&self) -> SchedulerStatus {
        lock(&self.status).clone()
    }

    pub fn job(&self, id: &str) -> Option<JobHealth> {
        self.entries.get(id).map(|e| e.to_health())
    }

    /// All jobs, sorted by id for deterministic output.
    pub fn jobs(&self) -> Vec<JobHealth> {
        let mut jobs: Vec<JobHealth> = self.entries.iter().map(|e| e.value().to_health()).collect();
        jobs.sort_by(|a, b| a.snapshot.id.cmp(&b.snapshot.id));
        jobs
    }

    /// Most recent events, newest last.
    pub fn events(&self, limit: usize) -> Vec<HealthEvent> {
        let events = lock(&self.events);
        let skip = events.len().saturating_sub(limit);
        events.iter().skip(skip).cloned().collect()
    }

    pub fn summary(&self) -> HealthSummary {
        let mut summary = HealthSummary::default();
        for entry in self.entries.iter() {
            let e = entry.value();
            summary.jobs += 1;
            match e.snapshot.circuit_state {
                CircuitState::Closed => summary.closed += 1,
                CircuitState::Open => summary.open += 1,
                CircuitState::HalfOpen => summary.half_open += 1,
            }
            if e.snapshot.paused {
                summary.paused += 1;
            }
            if e.snapshot.fatal_error.is_some() {
                summary.fatal += 1;
            }
            summary.in_flight += e.snapshot.in_flight as usize;
            summary.successes += e.successes;
            summary.failures += e.failures;
            summary.timeouts += e.timeouts;
        }
        summary
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
