//! Caller-supplied message processing.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Processes one message taken from the pipeline.
///
/// Return `Ok(true)` when the message was handled and `Ok(false)` when it
/// should be retried. An `Err` (or a panic) is treated as a failure too, and
/// its description is stored as the pipeline's last failure.
///
/// The handler runs while the consumer holds the resource lock, so it should
/// finish well within the lock expiry and honor `cancel` for prompt shutdown.
#[async_trait]
pub trait PipelineHandler: Send + Sync {
    async fn handle(&self, message: &str, cancel: &CancellationToken) -> anyhow::Result<bool>;
}

#[async_trait]
impl<H: PipelineHandler + ?Sized> PipelineHandler for Arc<H> {
    async fn handle(&self, message: &str, cancel: &CancellationToken) -> anyhow::Result<bool> {
        (**self).handle(message, cancel).await
    }
}
