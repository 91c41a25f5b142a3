use chrono::Duration;

use feedwatch_core::{config::TimeoutConfig, FeedwatchConfig, PriorityTier};

use crate::{backoff::BackoffPolicy, breaker::BreakerSettings, error::Result};

/// Typed, validated scheduler parameters. Replaced wholesale on reload.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub tick: Duration,
    pub phase_refresh: Duration,
    /// Global cap on concurrently running fetches, all tiers combined.
    pub max_in_flight: usize,
    pub acceleration_factor: f64,
    pub shutdown_grace: Duration,
    pub outcome_channel_capacity: usize,
    pub run_log_retention: Duration,
    pub breaker: BreakerSettings,
    pub backoff: BackoffPolicy,
    pub timeouts: TierTimeouts,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick: Duration::seconds(2),
            phase_refresh: Duration::seconds(60),
            max_in_flight: 4,
            acceleration_factor: 2.0,
            shutdown_grace: Duration::seconds(30),
            outcome_channel_capacity: 256,
            run_log_retention: Duration::days(7),
            breaker: BreakerSettings::default(),
            backoff: BackoffPolicy::default(),
            timeouts: TierTimeouts::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierTimeouts {
    pub critical: Duration,
    pub high: Duration,
    pub standard: Duration,
    pub low: Duration,
}

impl Default for TierTimeouts {
    fn default() -> Self {
        Self::from(&TimeoutConfig::default())
    }
}

impl From<&TimeoutConfig> for TierTimeouts {
    fn from(c: &TimeoutConfig) -> Self {
        Self {
            critical: secs(c.critical_secs),
            high: secs(c.high_secs),
            standard: secs(c.standard_secs),
            low: secs(c.low_secs),
        }
    }
}

impl TierTimeouts {
    pub fn for_tier(&self, tier: PriorityTier) -> Duration {
        match tier {
            PriorityTier::Critical => self.critical,
            PriorityTier::High => self.high,
            PriorityTier::Standard => self.standard,
            PriorityTier::Low => self.low,
        }
    }
}

impl SchedulerSettings {
    /// Convert a loaded config. Runs the config's own validation first.
    pub fn from_config(config: &FeedwatchConfig) -> Result<Self> {
        config.validate()?;
        let s = &config.scheduler;
        let b = &config.breaker;
        let k = &config.backoff;
        Ok(Self {
            tick: millis(s.tick_ms),
            phase_refresh: secs(s.phase_refresh_secs),
            max_in_flight: s.max_in_flight,
            acceleration_factor: s.acceleration_factor,
            shutdown_grace: secs(s.shutdown_grace_secs),
            outcome_channel_capacity: s.outcome_channel_capacity,
            run_log_retention: Duration::days(i64::from(config.database.retention_days)),
            breaker: BreakerSettings {
                failure_threshold: b.failure_threshold,
                failure_window: secs(b.failure_window_secs),
                cool_down: secs(b.cool_down_secs),
                reopen_increment: secs(b.reopen_increment_secs),
                max_cool_down: secs(b.max_cool_down_secs),
                tier_scale: b.tier_scale.clone(),
            },
            backoff: BackoffPolicy {
                base: millis(k.base_ms),
                exponent_cap: k.exponent_cap,
                max_delay: secs(k.max_delay_secs),
                max_attempts: k.max_attempts,
            },
            timeouts: TierTimeouts::from(&config.timeouts),
        })
    }
}

// Anything beyond ten years is effectively "never".
const MAX_SECS: u64 = 10 * 366 * 24 * 3600;

fn secs(s: u64) -> Duration {
    Duration::seconds(s.min(MAX_SECS) as i64)
}

fn millis(ms: u64) -> Duration {
    Duration::milliseconds(ms.min(MAX_SECS * 1_000) as i64)
}
