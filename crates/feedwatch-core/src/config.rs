use std::collections::HashSet;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{FeedwatchError, Result};
use crate::types::{PhaseKind, PriorityTier};

pub const DEFAULT_PORT: u16 = 18790;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_TICK_MS: u64 = 2_000;
pub const DEFAULT_PHASE_REFRESH_SECS: u64 = 60;
pub const DEFAULT_MAX_IN_FLIGHT: usize = 4;
pub const DEFAULT_ACCELERATION_FACTOR: f64 = 2.0;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;
pub const DEFAULT_RETENTION_DAYS: u32 = 7;

/// Top-level config (feedwatch.toml + FEEDWATCH_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedwatchConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Job table. Falls back to the built-in ingestion table when absent.
    #[serde(default = "default_jobs")]
    pub jobs: Vec<JobConfig>,
}

impl Default for FeedwatchConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            database: DatabaseConfig::default(),
            scheduler: SchedulerConfig::default(),
            breaker: BreakerConfig::default(),
            backoff: BackoffConfig::default(),
            timeouts: TimeoutConfig::default(),
            jobs: default_jobs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Run-log rows older than this are pruned.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

/// Coordination loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_phase_refresh_secs")]
    pub phase_refresh_secs: u64,
    /// Global cap on concurrently running fetches across all tiers.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Divisor applied to critical/high cadences during a live-game window.
    #[serde(default = "default_acceleration_factor")]
    pub acceleration_factor: f64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_channel_capacity")]
    pub outcome_channel_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: DEFAULT_TICK_MS,
            phase_refresh_secs: DEFAULT_PHASE_REFRESH_SECS,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            acceleration_factor: DEFAULT_ACCELERATION_FACTOR,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
            outcome_channel_capacity: default_channel_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures (inside the window) that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,
    /// Cool-down for a standard-tier job before the scale is applied.
    #[serde(default = "default_cool_down_secs")]
    pub cool_down_secs: u64,
    /// Added to the cool-down each time a half-open trial fails.
    #[serde(default = "default_cool_down_secs")]
    pub reopen_increment_secs: u64,
    #[serde(default = "default_max_cool_down_secs")]
    pub max_cool_down_secs: u64,
    #[serde(default)]
    pub tier_scale: TierScale,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window_secs: default_failure_window_secs(),
            cool_down_secs: default_cool_down_secs(),
            reopen_increment_secs: default_cool_down_secs(),
            max_cool_down_secs: default_max_cool_down_secs(),
            tier_scale: TierScale::default(),
        }
    }
}

/// Per-tier multiplier on the breaker cool-down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierScale {
    pub critical: f64,
    pub high: f64,
    pub standard: f64,
    pub low: f64,
}

impl Default for TierScale {
    fn default() -> Self {
        Self {
            critical: 0.5,
            high: 0.75,
            standard: 1.0,
            low: 2.0,
        }
    }
}

impl TierScale {
    pub fn for_tier(&self, tier: PriorityTier) -> f64 {
        match tier {
            PriorityTier::Critical => self.critical,
            PriorityTier::High => self.high,
            PriorityTier::Standard => self.standard,
            PriorityTier::Low => self.low,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_base_ms")]
    pub base_ms: u64,
    /// Exponent ceiling: growth stops at `base * 2^exponent_cap`.
    #[serde(default = "default_exponent_cap")]
    pub exponent_cap: u32,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    /// Failures after which a job is reported as persistently failing.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_backoff_base_ms(),
            exponent_cap: default_exponent_cap(),
            max_delay_secs: default_max_delay_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Per-tier fetch timeout. Critical sources get the shortest leash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub critical_secs: u64,
    pub high_secs: u64,
    pub standard_secs: u64,
    pub low_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            critical_secs: 30,
            high_secs: 60,
            standard_secs: 120,
            low_secs: 300,
        }
    }
}

impl TimeoutConfig {
    pub fn secs_for(&self, tier: PriorityTier) -> u64 {
        match tier {
            PriorityTier::Critical => self.critical_secs,
            PriorityTier::High => self.high_secs,
            PriorityTier::Standard => self.standard_secs,
            PriorityTier::Low => self.low_secs,
        }
    }
}

/// One row of the job table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    pub id: String,
    pub tier: PriorityTier,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    pub cadence: PhaseCadence,
}

/// Base cadence for every season phase. All three entries are required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhaseCadence {
    pub regular_secs: u64,
    pub pre_season_secs: u64,
    pub off_season_secs: u64,
}

impl PhaseCadence {
    pub fn secs_for(&self, phase: PhaseKind) -> u64 {
        match phase {
            PhaseKind::Regular => self.regular_secs,
            PhaseKind::PreSeason => self.pre_season_secs,
            PhaseKind::OffSeason => self.off_season_secs,
        }
    }
}

impl JobConfig {
    fn new(id: &str, tier: PriorityTier, regular: u64, pre_season: u64, off_season: u64) -> Self {
        Self {
            id: id.to_string(),
            tier,
            max_concurrent: 1,
            cadence: PhaseCadence {
                regular_secs: regular,
                pre_season_secs: pre_season,
                off_season_secs: off_season,
            },
        }
    }
}

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;

/// The built-in ingestion table for the football data pipeline.
pub fn default_jobs() -> Vec<JobConfig> {
    use PriorityTier::*;
    vec![
        JobConfig::new("injury_status", Critical, 3 * MINUTE, 15 * MINUTE, 6 * HOUR),
        JobConfig::new("vegas_odds", Critical, 10 * MINUTE, 30 * MINUTE, 12 * HOUR),
        JobConfig::new("news_sentiment", High, 15 * MINUTE, 45 * MINUTE, 4 * HOUR),
        JobConfig::new("rss_feeds", High, 20 * MINUTE, 60 * MINUTE, 6 * HOUR),
        JobConfig::new("dfs_data", High, HOUR, 3 * HOUR, 24 * HOUR),
        JobConfig::new("player_stats", Standard, 2 * HOUR, 6 * HOUR, 24 * HOUR),
        JobConfig::new("podcast_data", Standard, 4 * HOUR, 8 * HOUR, 12 * HOUR),
        JobConfig::new("validation_cycle", Standard, HOUR, 2 * HOUR, 6 * HOUR),
        JobConfig::new("full_ingestion", Low, 12 * HOUR, 24 * HOUR, 48 * HOUR),
    ]
}

impl FeedwatchConfig {
    /// Load config from a TOML file with FEEDWATCH_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `FEEDWATCH_SCHEDULER__MAX_IN_FLIGHT=8`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::from_figment(
            Figment::new()
                .merge(Toml::file(&path))
                .merge(Env::prefixed("FEEDWATCH_").split("__")),
        )
    }

    /// Parse a TOML document without consulting the environment.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        Self::from_figment(Figment::new().merge(Toml::string(toml)))
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        let config: FeedwatchConfig = figment
            .extract()
            .map_err(|e| FeedwatchError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject tables the scheduler cannot run safely.
    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;
        if s.tick_ms == 0 {
            return Err(invalid("scheduler.tick_ms must be greater than zero"));
        }
        if s.phase_refresh_secs == 0 {
            return Err(invalid("scheduler.phase_refresh_secs must be greater than zero"));
        }
        if s.max_in_flight == 0 {
            return Err(invalid("scheduler.max_in_flight must be at least 1"));
        }
        if !(s.acceleration_factor > 1.0) || !s.acceleration_factor.is_finite() {
            return Err(invalid("scheduler.acceleration_factor must be a finite value above 1.0"));
        }
        if s.outcome_channel_capacity == 0 {
            return Err(invalid("scheduler.outcome_channel_capacity must be at least 1"));
        }

        let b = &self.breaker;
        if b.failure_threshold == 0 {
            return Err(invalid("breaker.failure_threshold must be at least 1"));
        }
        if b.cool_down_secs == 0 || b.failure_window_secs == 0 {
            return Err(invalid("breaker cool-down and window must be greater than zero"));
        }
        if b.max_cool_down_secs < b.cool_down_secs {
            return Err(invalid("breaker.max_cool_down_secs must not be below cool_down_secs"));
        }
        for tier in PriorityTier::ALL {
            let scale = b.tier_scale.for_tier(tier);
            if !(scale > 0.0) || !scale.is_finite() {
                return Err(invalid(&format!("breaker.tier_scale.{tier} must be positive")));
            }
            if self.timeouts.secs_for(tier) == 0 {
                return Err(invalid(&format!("timeouts.{tier}_secs must be greater than zero")));
            }
        }

        if self.backoff.base_ms == 0 {
            return Err(invalid("backoff.base_ms must be greater than zero"));
        }
        if self.backoff.max_attempts == 0 {
            return Err(invalid("backoff.max_attempts must be at least 1"));
        }

        if self.jobs.is_empty() {
            return Err(invalid("at least one job must be configured"));
        }
        let mut seen = HashSet::new();
        for job in &self.jobs {
            if job.id.trim().is_empty() {
                return Err(invalid("job id must not be empty"));
            }
            if !seen.insert(job.id.as_str()) {
                return Err(invalid(&format!("duplicate job id: {}", job.id)));
            }
            if job.max_concurrent == 0 {
                return Err(invalid(&format!("job {}: max_concurrent must be at least 1", job.id)));
            }
            for phase in [PhaseKind::Regular, PhaseKind::PreSeason, PhaseKind::OffSeason] {
                if job.cadence.secs_for(phase) == 0 {
                    return Err(invalid(&format!(
                        "job {}: {phase} cadence must be greater than zero",
                        job.id
                    )));
                }
            }
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> FeedwatchError {
    FeedwatchError::Config(msg.to_string())
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_tick_ms() -> u64 {
    DEFAULT_TICK_MS
}
fn default_phase_refresh_secs() -> u64 {
    DEFAULT_PHASE_REFRESH_SECS
}
fn default_max_in_flight() -> usize {
    DEFAULT_MAX_IN_FLIGHT
}
fn default_acceleration_factor() -> f64 {
    DEFAULT_ACCELERATION_FACTOR
}
fn default_shutdown_grace_secs() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECS
}
fn default_channel_capacity() -> usize {
    256
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_failure_window_secs() -> u64 {
    30 * MINUTE
}
fn default_cool_down_secs() -> u64 {
    5 * MINUTE
}
fn default_max_cool_down_secs() -> u64 {
    30 * MINUTE
}
fn default_backoff_base_ms() -> u64 {
    10_000
}
fn default_exponent_cap() -> u32 {
    6
}
fn default_max_delay_secs() -> u64 {
    HOUR
}
fn default_max_attempts() -> u32 {
    3
}
fn default_max_concurrent() -> u32 {
    1
}
fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.feedwatch/runs.db", home)
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.feedwatch/feedwatch.toml", home)
}
