//! The user-supplied handler contract (§6: "Handler contract").

use tokio_util::sync::CancellationToken;

use crate::types::ChangeRow;

/// Implemented by the embedding host. The Lease Manager invokes this once
/// per batch; a fresh [`CancellationToken`] (a child of the batch's own, not
/// reused across batches — §5 "Cancellation & timeouts") is passed so a
/// wedged invocation can be cancelled by the renew task without leaking
/// cancellation into the next batch.
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, batch: Vec<ChangeRow>, cancel: CancellationToken) -> anyhow::Result<()>;
}

/// Wraps a plain async closure as a [`Handler`], for hosts and tests that
/// don't need a full `impl` block.
pub struct FnHandler<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Vec<ChangeRow>, CancellationToken) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, batch: Vec<ChangeRow>, cancel: CancellationToken) -> anyhow::Result<()> {
        (self.0)(batch, cancel).await
    }
}
