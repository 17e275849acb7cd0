//! Deferred computation contract.
//!
//! A [`Work`] implementation is a re-entrant factory: the executor calls
//! `run` once per attempt and every call must produce a fresh computation.
//! Closures are adapted through [`work_fn`].

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// A unit of work the scheduler can run. `run` is invoked fresh on each
/// attempt, including retries.
#[async_trait]
pub trait Work: Send + Sync {
    async fn run(&self) -> anyhow::Result<serde_json::Value>;
}

/// Adapter implementing [`Work`] for an async closure factory.
pub struct FnWork<F>(F);

#[async_trait]
impl<F, Fut> Work for FnWork<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send,
{
    async fn run(&self) -> anyhow::Result<serde_json::Value> {
        (self.0)().await
    }
}

/// Wraps an async closure factory into a shareable [`Work`] object.
pub fn work_fn<F, Fut>(f: F) -> Arc<dyn Work>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
{
    Arc::new(FnWork(f))
}

/// How a deferred computation ended.
#[derive(Debug)]
pub enum Settlement {
    Completed(serde_json::Value),
    Failed(anyhow::Error),
    Cancelled,
}

/// Drives `future` until it settles or `cancel` fires. Cancellation is
/// cooperative: the computation is dropped at its next suspension point.
pub(crate) async fn run_with_cancel<F>(future: F, cancel: CancellationToken) -> Settlement
where
    F: Future<Output = anyhow::Result<serde_json::Value>> + Send,
{
    tokio::select! {
        _ = cancel.cancelled() => Settlement::Cancelled,
        out = future => match out {
            Ok(value) => Settlement::Completed(value),
            Err(e) => Settlement::Failed(e),
        },
    }
}
