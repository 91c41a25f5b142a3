//! Stand-in fetch capability so the gateway runs end-to-end without real
//! API clients.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::debug;

use feedwatch_scheduler::{FetchCapability, FetchContext, FetchError};

/// Sleeps for a jittered latency, then succeeds (or fails transiently with
/// probability `failure_rate`). Stops early when the run is cancelled.
#[derive(Debug, Clone)]
pub struct SimulatedFetch {
    latency: Duration,
    failure_rate: f64,
}

impl SimulatedFetch {
    pub fn new(latency: Duration, failure_rate: f64) -> Self {
        Self {
            latency,
            failure_rate: if failure_rate.is_nan() {
                0.0
            } else {
                failure_rate.clamp(0.0, 1.0)
            },
        }
    }
}

#[async_trait]
impl FetchCapability for SimulatedFetch {
    async fn invoke(&self, ctx: FetchContext) -> Result<(), FetchError> {
        // Pick both numbers before awaiting: ThreadRng is not Send.
        let (wait, fail) = {
            let mut rng = rand::thread_rng();
            let spread = rng.gen_range(0.5..=1.5);
            (self.latency.mul_f64(spread), rng.gen_bool(self.failure_rate))
        };

        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                debug!(job_id = %ctx.job_id, run_id = %ctx.run_id, "simulated fetch cancelled");
                return Err(FetchError::Transient("cancelled".to_string()));
            }
            _ = tokio::time::sleep(wait) => {}
        }

        if fail {
            return Err(FetchError::Transient(format!(
                "simulated upstream error for {}",
                ctx.job_id
            )));
        }
        debug!(
            job_id = %ctx.job_id,
            attempt = ctx.attempt,
            phase = %ctx.phase.kind,
            latency_ms = wait.as_millis() as u64,
            "simulated fetch done"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedwatch_core::PhaseKind;
    use feedwatch_scheduler::SchedulePhase;
    use tokio_util::sync::CancellationToken;

    fn ctx(cancel: CancellationToken) -> FetchContext {
        FetchContext {
            job_id: "rss_feeds".to_string(),
            run_id: uuid::Uuid::nil(),
            attempt: 1,
            phase: SchedulePhase::new(PhaseKind::Regular, false),
            cancel,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_latency() {
        let fetch = SimulatedFetch::new(Duration::from_millis(200), 0.0);
        assert!(fetch.invoke(ctx(CancellationToken::new())).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn always_fails_at_full_rate() {
        let fetch = SimulatedFetch::new(Duration::from_millis(10), 1.0);
        let err = fetch.invoke(ctx(CancellationToken::new())).await.unwrap_err();
        assert!(matches!(err, FetchError::Transient(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn honours_cancellation() {
        let fetch = SimulatedFetch::new(Duration::from_secs(3600), 0.0);
        let token = CancellationToken::new();
        token.cancel();
        assert!(fetch.invoke(ctx(token)).await.is_err());
    }
}
