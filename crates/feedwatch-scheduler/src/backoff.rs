//! Exponential backoff with jitter for failed fetches.
//!
//! `delay = base * 2^min(failures, exponent_cap) + jitter`, `jitter ∈ [0, base]`,
//! clamped to both the configured maximum and the job's current cadence so a
//! retry never arrives later than an ordinary poll would have.

use chrono::Duration;
use rand::Rng;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub exponent_cap: u32,
    pub max_delay: Duration,
    /// Consecutive failures after which the job is reported persistently failing.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::seconds(10),
            exponent_cap: 6,
            max_delay: Duration::hours(1),
            max_attempts: 3,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the next retry, with a fresh random jitter.
    pub fn next_delay(&self, consecutive_failures: u32, cadence: Duration) -> Duration {
        let jitter: f64 = rand::thread_rng().gen_range(0.0..=1.0);
        self.delay_with_jitter(consecutive_failures, cadence, jitter)
    }

    /// Deterministic form of [`next_delay`](Self::next_delay).
    ///
    /// `jitter_fraction` is clamped to `[0, 1]` and scales `base`.
    pub fn delay_with_jitter(
        &self,
        consecutive_failures: u32,
        cadence: Duration,
        jitter_fraction: f64,
    ) -> Duration {
        let base_ms = self.base.num_milliseconds().max(1);
        let exponent = consecutive_failures.min(self.exponent_cap).min(32);
        let scaled = base_ms.saturating_mul(1_i64 << exponent);
        let jitter = (base_ms as f64 * jitter_fraction.clamp(0.0, 1.0)) as i64;
        let raw = scaled.saturating_add(jitter);

        let ceiling = self
            .max_delay
            .num_milliseconds()
            .min(cadence.num_milliseconds())
            .max(1);
        Duration::milliseconds(raw.min(ceiling))
    }

    /// True once `consecutive_failures` has reached `max_attempts`.
    pub fn is_exhausted(&self, consecutive_failures: u32) -> bool {
        consecutive_failures >= self.max_attempts
    }
}
