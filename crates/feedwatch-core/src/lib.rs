//! Shared vocabulary and configuration for the feedwatch ingestion scheduler.

pub mod config;
pub mod error;
pub mod types;

pub use config::FeedwatchConfig;
pub use error::{FeedwatchError, Result};
pub use types::{PhaseKind, PriorityTier};
