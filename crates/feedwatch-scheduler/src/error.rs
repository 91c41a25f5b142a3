use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// `register` was called twice with the same id.
    #[error("Duplicate job: {id}")]
    DuplicateJob { id: String },

    /// No job with the given id is registered.
    #[error("Unknown job: {id}")]
    UnknownJob { id: String },

    /// A configuration table or reload request failed validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Underlying SQLite / rusqlite error from the run log.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The coordination loop has exited and no longer accepts requests.
    #[error("Scheduler engine is not running")]
    EngineStopped,
}

impl SchedulerError {
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::DuplicateJob { .. } => "DUPLICATE_JOB",
            SchedulerError::UnknownJob { .. } => "UNKNOWN_JOB",
            SchedulerError::InvalidConfig(_) => "INVALID_CONFIG",
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::EngineStopped => "ENGINE_STOPPED",
        }
    }
}

impl From<feedwatch_core::FeedwatchError> for SchedulerError {
    fn from(e: feedwatch_core::FeedwatchError) -> Self {
        SchedulerError::InvalidConfig(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Failure reported by a fetch capability.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Recoverable: retried per the backoff policy.
    #[error("Transient fetch error: {0}")]
    Transient(String),

    /// Unrecoverable until an operator intervenes (e.g. missing credentials).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The fetch exceeded its tier timeout.
    #[error("Fetch timed out after {ms}ms")]
    Timeout { ms: u64 },
}

impl FetchError {
    /// How the core classifies this failure.
    pub fn outcome_kind(&self) -> crate::types::OutcomeKind {
        use crate::types::OutcomeKind;
        match self {
            FetchError::Transient(_) => OutcomeKind::TransientFailure,
            FetchError::Configuration(_) => OutcomeKind::ConfigurationError,
            FetchError::Timeout { .. } => OutcomeKind::Timeout,
        }
    }
}
