//! Per-job circuit breaker.
//!
//! ```text
//!  closed ──(threshold failures inside window)──▶ open
//!    ▲                                              │ cool-down elapsed
//!    │ trial succeeds                               ▼
//!    └──────────────────────────────────────── half-open
//!                     trial fails: reopen with a longer cool-down
//! ```

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use feedwatch_core::{config::TierScale, PriorityTier};

use crate::types::CircuitState;

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub failure_window: Duration,
    /// Standard-tier cool-down; scaled per tier by `tier_scale`.
    pub cool_down: Duration,
    pub reopen_increment: Duration,
    pub max_cool_down: Duration,
    pub tier_scale: TierScale,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::minutes(30),
            cool_down: Duration::minutes(5),
            reopen_increment: Duration::minutes(5),
            max_cool_down: Duration::minutes(30),
            tier_scale: TierScale::default(),
        }
    }
}

impl BreakerSettings {
    /// Cool-down for `tier` after `reopen_count` failed trials.
    ///
    /// Grows linearly by `reopen_increment` and is capped at `max_cool_down`.
    pub fn cool_down_for(&self, tier: PriorityTier, reopen_count: u32) -> Duration {
        let scale = self.tier_scale.for_tier(tier);
        let base_ms = (self.cool_down.num_milliseconds() as f64 * scale) as i64;
        let extra_ms = self
            .reopen_increment
            .num_milliseconds()
            .saturating_mul(reopen_count as i64);
        let total = base_ms.saturating_add(extra_ms).max(1);
        Duration::milliseconds(total.min(self.max_cool_down.num_milliseconds().max(1)))
    }
}

/// A state change, forwarded to the health sink for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitTransition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
}

/// Answer to "may this job run now?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed: normal dispatch.
    Admitted,
    /// Circuit half-open: this dispatch is the single trial.
    Trial,
    /// Circuit open (or trial already running) until `retry_at`.
    Rejected { retry_at: DateTime<Utc> },
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    opened_at: Option<DateTime<Utc>>,
    cool_down: Duration,
    /// Failed half-open trials since the circuit last closed.
    reopen_count: u32,
    /// Timestamps of the current run of consecutive failures.
    failures: VecDeque<DateTime<Utc>>,
    trial_in_flight: bool,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            opened_at: None,
            cool_down: Duration::zero(),
            reopen_count: 0,
            failures: VecDeque::new(),
            trial_in_flight: false,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn opened_at(&self) -> Option<DateTime<Utc>> {
        self.opened_at
    }

    /// Instant at which an open circuit becomes eligible for a trial.
    pub fn reopens_at(&self) -> Option<DateTime<Utc>> {
        self.opened_at.map(|at| at + self.cool_down)
    }

    /// Time left before a trial is allowed; zero unless open.
    fn remaining_cool_down(&self, now: DateTime<Utc>) -> Duration {
        match (self.state, self.reopens_at()) {
            (CircuitState::Open, Some(until)) if until > now => until - now,
            _ => Duration::zero(),
        }
    }

    /// Decide whether a dispatch may proceed, committing to it if so.
    ///
    /// Callers must dispatch immediately after an admitting answer: a `Trial`
    /// answer marks the single half-open trial as in flight.
    pub fn admit(&mut self, now: DateTime<Utc>) -> (Admission, Option<CircuitTransition>) {
        let mut transition = None;
        if self.state == CircuitState::Open && self.remaining_cool_down(now) <= Duration::zero() {
            transition = self.transition(CircuitState::HalfOpen, now);
        }

        let admission = match self.state {
            CircuitState::Closed => Admission::Admitted,
            CircuitState::HalfOpen if !self.trial_in_flight => {
                self.trial_in_flight = true;
                Admission::Trial
            }
            CircuitState::HalfOpen => Admission::Rejected { retry_at: now },
            CircuitState::Open => Admission::Rejected {
                retry_at: self.reopens_at().unwrap_or(now),
            },
        };
        (admission, transition)
    }

    /// End a half-open trial without judging the source.
    ///
    /// The circuit stays half-open, so the next admission is a fresh trial.
    pub fn release_trial(&mut self) {
        self.trial_in_flight = false;
    }

    /// Feed a completed run into the transition table.
    pub fn report(
        &mut self,
        success: bool,
        now: DateTime<Utc>,
        settings: &BreakerSettings,
        tier: PriorityTier,
    ) -> Option<CircuitTransition> {
        self.trial_in_flight = false;

        if success {
            self.failures.clear();
            self.reopen_count = 0;
            if self.state == CircuitState::Closed {
                return None;
            }
            self.opened_at = None;
            return self.transition(CircuitState::Closed, now);
        }

        self.failures.push_back(now);
        let cutoff = now - settings.failure_window;
        while self.failures.front().is_some_and(|t| *t < cutoff) {
            self.failures.pop_front();
        }

        match self.state {
            CircuitState::Closed if self.failures.len() as u32 >= settings.failure_threshold => {
                self.open(now, settings.cool_down_for(tier, 0))
            }
            CircuitState::HalfOpen => {
                self.reopen_count += 1;
                let cool_down = settings.cool_down_for(tier, self.reopen_count);
                self.open(now, cool_down)
            }
            _ => None,
        }
    }

    fn open(&mut self, now: DateTime<Utc>, cool_down: Duration) -> Option<CircuitTransition> {
        self.opened_at = Some(now);
        self.cool_down = cool_down;
        self.transition(CircuitState::Open, now)
    }

    fn transition(&mut self, to: CircuitState, at: DateTime<Utc>) -> Option<CircuitTransition> {
        let from = self.state;
        if from == to {
            return None;
        }
        self.state = to;
        Some(CircuitTransition { from, to, at })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 4, 13, 0, 0).single().unwrap()
    }

    fn fail_n(b: &mut CircuitBreaker, n: u32, start: DateTime<Utc>, s: &BreakerSettings) -> DateTime<Utc> {
        let mut now = start;
        for _ in 0..n {
            b.report(false, now, s, PriorityTier::Standard);
            now += Duration::seconds(10);
        }
        now
    }

    #[test]
    fn opens_at_threshold() {
        let s = BreakerSettings::default();
        let mut b = CircuitBreaker::new();
        fail_n(&mut b, 4, t0(), &s);
        assert_eq!(b.state(), CircuitState::Closed);
        let t = b.report(false, t0() + Duration::minutes(1), &s, PriorityTier::Standard);
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(t.map(|t| t.to), Some(CircuitState::Open));
    }

    #[test]
    fn success_resets_failure_run() {
        let s = BreakerSettings::default();
        let mut b = CircuitBreaker::new();
        let now = fail_n(&mut b, 4, t0(), &s);
        assert!(b.report(true, now, &s, PriorityTier::Standard).is_none());
        fail_n(&mut b, 4, now, &s);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn failures_outside_window_do_not_count() {
        let s = BreakerSettings {
            failure_window: Duration::minutes(1),
            ..BreakerSettings::default()
        };
        let mut b = CircuitBreaker::new();
        let mut now = t0();
        for _ in 0..10 {
            b.report(false, now, &s, PriorityTier::Standard);
            now += Duration::minutes(2);
        }
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn open_rejects_until_cool_down_then_single_trial() {
        let s = BreakerSettings::default();
        let mut b = CircuitBreaker::new();
        let opened = fail_n(&mut b, 5, t0(), &s) - Duration::seconds(10);
        assert_eq!(b.state(), CircuitState::Open);

        let (a, _) = b.admit(opened + Duration::minutes(4));
        assert_eq!(
            a,
            Admission::Rejected {
                retry_at: opened + Duration::minutes(5)
            }
        );

        let (a, t) = b.admit(opened + Duration::minutes(5));
        assert_eq!(a, Admission::Trial);
        assert_eq!(t.map(|t| t.to), Some(CircuitState::HalfOpen));

        let (again, _) = b.admit(opened + Duration::minutes(5));
        assert!(matches!(again, Admission::Rejected { .. }));
    }

    #[test]
    fn trial_success_closes() {
        let s = BreakerSettings::default();
        let mut b = CircuitBreaker::new();
        let now = fail_n(&mut b, 5, t0(), &s) + Duration::minutes(10);
        b.admit(now);
        let t = b.report(true, now, &s, PriorityTier::Standard).unwrap();
        assert_eq!((t.from, t.to), (CircuitState::HalfOpen, CircuitState::Closed));
        assert_eq!(b.admit(now).0, Admission::Admitted);
        assert!(b.opened_at().is_none());
    }

    #[test]
    fn trial_failure_reopens_with_longer_cool_down() {
        let s = BreakerSettings::default();
        let mut b = CircuitBreaker::new();
        let now = fail_n(&mut b, 5, t0(), &s) + Duration::minutes(10);
        b.admit(now);
        let t = b.report(false, now, &s, PriorityTier::Standard).unwrap();
        assert_eq!((t.from, t.to), (CircuitState::HalfOpen, CircuitState::Open));
        assert_eq!(b.remaining_cool_down(now), Duration::minutes(10));
    }

    #[test]
    fn released_trial_can_be_retried() {
        let s = BreakerSettings::default();
        let mut b = CircuitBreaker::new();
        let now = fail_n(&mut b, 5, t0(), &s) + Duration::minutes(10);
        assert_eq!(b.admit(now).0, Admission::Trial);
        b.release_trial();
        assert_eq!(b.state(), CircuitState::HalfOpen);

        let later = now + Duration::hours(2);
        let (a, t) = b.admit(later);
        assert_eq!(a, Admission::Trial);
        assert!(t.is_none());
        assert!(matches!(b.admit(later).0, Admission::Rejected { .. }));
    }

    #[test]
    fn cool_down_scales_by_tier_and_caps() {
        let s = BreakerSettings::default();
        assert_eq!(s.cool_down_for(PriorityTier::Critical, 0), Duration::seconds(150));
        assert_eq!(s.cool_down_for(PriorityTier::Standard, 0), Duration::minutes(5));
        assert_eq!(s.cool_down_for(PriorityTier::Low, 0), Duration::minutes(10));
        assert!(s.cool_down_for(PriorityTier::Critical, 0) < s.cool_down_for(PriorityTier::Low, 0));
        assert_eq!(s.cool_down_for(PriorityTier::Low, 50), Duration::minutes(30));
    }
}
