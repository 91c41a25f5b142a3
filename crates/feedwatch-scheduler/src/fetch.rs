use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{error::FetchError, types::SchedulePhase};

/// Per-invocation context handed to a fetch capability.
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub job_id: String,
    pub run_id: Uuid,
    /// 1 for a first attempt, `n + 1` after `n` consecutive failures.
    pub attempt: u32,
    pub phase: SchedulePhase,
    /// Cancelled when the run times out or is abandoned at shutdown.
    pub cancel: CancellationToken,
}

/// The ingestion layer's hook for one data source.
///
/// The scheduler never looks at the payload: it only needs to know whether
/// the fetch succeeded. Implementations should watch `ctx.cancel` when they
/// can stop early.
#[async_trait]
pub trait FetchCapability: Send + Sync {
    async fn invoke(&self, ctx: FetchContext) -> Result<(), FetchError>;
}

/// Adapter that turns an async closure into a [`FetchCapability`].
pub struct FnFetch<F>(F);

#[async_trait]
impl<F, Fut> FetchCapability for FnFetch<F>
where
    F: Fn(FetchContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), FetchError>> + Send,
{
    async fn invoke(&self, ctx: FetchContext) -> Result<(), FetchError> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a shareable fetch capability.
pub fn fetch_fn<F, Fut>(f: F) -> Arc<dyn FetchCapability>
where
    F: Fn(FetchContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), FetchError>> + Send + 'static,
{
    Arc::new(FnFetch(f))
}
