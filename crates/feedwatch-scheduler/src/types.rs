use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use feedwatch_core::{PhaseKind, PriorityTier};

/// Active schedule profile: the season phase plus the live-game flag.
///
/// Always replaced as a whole value, never field by field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulePhase {
    pub kind: PhaseKind,
    pub acceleration_active: bool,
}

impl SchedulePhase {
    pub fn new(kind: PhaseKind, acceleration_active: bool) -> Self {
        Self {
            kind,
            acceleration_active,
        }
    }
}

/// Circuit breaker state for a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Dispatch rejected until the cool-down elapses.
    Open,
    /// One trial dispatch permitted.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        };
        write!(f, "{s}")
    }
}

/// Result of the most recent completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LastResult {
    None,
    Success,
    Failure,
}

/// Classification of a completed dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    /// Recoverable failure, retried per backoff.
    TransientFailure,
    /// Exceeded the tier timeout; retried like a transient failure.
    Timeout,
    /// Fatal for the job: auto-paused until an operator resumes it.
    ConfigurationError,
}

impl OutcomeKind {
    pub fn is_success(self) -> bool {
        self == OutcomeKind::Success
    }

    /// Whether the outcome feeds backoff and the circuit breaker.
    pub fn is_retryable_failure(self) -> bool {
        matches!(self, OutcomeKind::TransientFailure | OutcomeKind::Timeout)
    }
}

impl std::fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OutcomeKind::Success => "success",
            OutcomeKind::TransientFailure => "transient_failure",
            OutcomeKind::Timeout => "timeout",
            OutcomeKind::ConfigurationError => "configuration_error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for OutcomeKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(OutcomeKind::Success),
            "transient_failure" => Ok(OutcomeKind::TransientFailure),
            "timeout" => Ok(OutcomeKind::Timeout),
            "configuration_error" => Ok(OutcomeKind::ConfigurationError),
            other => Err(format!("unknown outcome kind: {other}")),
        }
    }
}

/// Produced when a dispatched fetch completes. Consumed once by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub job_id: String,
    /// Identifies the dispatch; outcomes for runs no longer in flight are discarded.
    pub run_id: Uuid,
    pub kind: OutcomeKind,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Read-only view of one job's runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: String,
    pub tier: PriorityTier,
    pub circuit_state: CircuitState,
    pub circuit_opened_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub current_attempt: u32,
    pub last_result: LastResult,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_duration_ms: Option<u64>,
    pub next_due_at: DateTime<Utc>,
    pub paused: bool,
    pub in_flight: u32,
    /// Set when a configuration error auto-paused the job.
    pub fatal_error: Option<String>,
}
