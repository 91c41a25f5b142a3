//! Season- and context-adaptive ingestion scheduler.
//!
//! # Overview
//!
//! Every data source is a job with a per-phase cadence and a priority tier.
//! The [`engine::SchedulerEngine`] ticks every couple of seconds, asks the
//! single-writer [`coordinator::SchedulerCore`] which jobs are due, and spawns their
//! fetch capabilities. Outcomes come back through one ordered channel and
//! drive the circuit breaker, the backoff policy and the health sink.
//!
//! # Cadence resolution
//!
//! | Input                | Effect                                               |
//! |----------------------|------------------------------------------------------|
//! | Season phase         | selects `regular` / `pre-season` / `off-season` cadence |
//! | Live-game window     | divides critical + high cadences by the acceleration factor |
//! | Consecutive failures | replaces the cadence with an exponential backoff delay |
//! | Open circuit         | holds the job until the tier-scaled cool-down elapses |
//! | Manual override      | trigger now, pause, resume (still gated by the breaker) |

pub mod backoff;
pub mod breaker;
pub mod coordinator;
pub mod db;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod health;
pub mod phase;
pub mod registry;
pub mod settings;
pub mod types;

pub use engine::{SchedulerEngine, SchedulerHandle};
pub use error::{FetchError, Result, SchedulerError};
pub use fetch::{fetch_fn, FetchCapability, FetchContext};
pub use health::HealthSink;
pub use registry::{CadenceTable, JobDescriptor, JobRegistry};
pub use settings::SchedulerSettings;
pub use types::{CircuitState, JobSnapshot, OutcomeKind, RunOutcome, SchedulePhase};
