//! Operator actions on a pipeline: push, stop, clean, resume and status.
//!
//! `push` and `stop` bypass the lock; each is a single store command. `clean`
//! and `resume` run under the resource lock and fail with
//! [`PipelineError::LockNotAcquired`] when they cannot get it in time.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::AdminSettings;
use super::failure::PipelineFailure;
use super::keys::{all_keys, failure_key, messages_key, state_key};
use super::state::PipelineState;
use crate::error::{PipelineError, PipelineResult};
use crate::lock::{DistributedLock, LockHandle};
use crate::metrics::MetricsCollector;
use crate::store::{PipelineStore, Transaction};

/// Point-in-time view of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineStatus {
    pub resource: String,
    /// Decoded state, `None` when the slot holds an unparseable value.
    pub state: Option<PipelineState>,
    /// Raw state slot value.
    pub raw_state: Option<String>,
    /// Messages waiting in the queue.
    pub pending: usize,
    /// Message at the head of the queue.
    pub next_message: Option<String>,
    /// Most recent abnormal handler termination, `None` when the slot is
    /// empty or unreadable.
    pub last_failure: Option<PipelineFailure>,
    /// Raw failure slot value.
    pub raw_failure: Option<String>,
}

impl PipelineStatus {
    pub fn is_stopped(&self) -> bool {
        self.state.is_some_and(|s| s.is_stopped())
    }
}

/// Administers one pipeline resource.
pub struct PipelineAdmin {
    settings: AdminSettings,
    store: Arc<dyn PipelineStore>,
    lock: Arc<dyn DistributedLock>,
    metrics: MetricsCollector,
}

impl PipelineAdmin {
    /// Creates an admin.
    pub fn new(
        settings: AdminSettings,
        store: Arc<dyn PipelineStore>,
        lock: Arc<dyn DistributedLock>,
    ) -> Self {
        Self {
            settings,
            store,
            lock,
            metrics: MetricsCollector::new(),
        }
    }

    /// Returns the resource name.
    pub fn resource(&self) -> &str {
        &self.settings.resource
    }

    /// Appends a message to the tail of the queue. Returns the queue length.
    ///
    /// Works whether or not the pipeline is stopped.
    pub async fn push(&self, message: &str) -> PipelineResult<usize> {
        let pending = self
            .store
            .list_right_push(&messages_key(self.resource()), message)
            .await?;
        self.metrics.update_queue_depth(self.resource(), pending);
        debug!(resource = %self.resource(), pending = pending, "Pushed message");
        Ok(pending)
    }

    /// Stops the pipeline. Idempotent.
    pub async fn stop(&self) -> PipelineResult<()> {
        self.store
            .string_set(&state_key(self.resource()), &PipelineState::Stopped.encode())
            .await?;
        info!(resource = %self.resource(), "Pipeline stopped by operator");
        Ok(())
    }

    /// Deletes the queue, state and failure record in one command.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::LockNotAcquired`] when the lock is busy for the
    /// whole wait window.
    pub async fn clean(&self, cancel: &CancellationToken) -> PipelineResult<()> {
        let handle = self.acquire("clean", cancel).await?;

        let result = self.store.key_delete(&all_keys(self.resource())).await;
        release(handle).await;

        let deleted = result?;
        self.metrics.update_queue_depth(self.resource(), 0);
        info!(resource = %self.resource(), deleted = deleted, "Pipeline cleaned");
        Ok(())
    }

    /// Resumes a stopped pipeline, first discarding `skip` messages from the
    /// head of the queue. Returns the discarded messages.
    ///
    /// The discard and the state reset happen in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::LockNotAcquired`] when the lock is busy, and
    /// [`PipelineError::NotStopped`] (leaving everything untouched) when the
    /// pipeline is not stopped.
    pub async fn resume(
        &self,
        skip: usize,
        cancel: &CancellationToken,
    ) -> PipelineResult<Vec<String>> {
        let handle = self.acquire("resume", cancel).await?;

        let result = self.resume_locked(skip).await;
        release(handle).await;

        let skipped = result?;
        info!(
            resource = %self.resource(),
            skipped = skipped.len(),
            "Pipeline resumed"
        );
        Ok(skipped)
    }

    async fn resume_locked(&self, skip: usize) -> PipelineResult<Vec<String>> {
        let resource = self.resource();
        let raw = self.store.string_get(&state_key(resource)).await?;

        if !super::state::is_stopped(raw.as_deref()) {
            return Err(PipelineError::NotStopped {
                resource: resource.to_string(),
                state: raw.unwrap_or_else(|| PipelineState::default().encode()),
            });
        }

        let transaction = Transaction::new()
            .list_left_pop(messages_key(resource), skip)
            .string_set(state_key(resource), PipelineState::Active(0).encode());
        Ok(self.store.execute(transaction).await?)
    }

    /// Reads the pipeline's state, queue and last failure without locking.
    ///
    /// The reads are independent, so the snapshot may straddle a concurrent
    /// poll.
    pub async fn status(&self) -> PipelineResult<PipelineStatus> {
        let resource = self.resource();

        let raw_state = self.store.string_get(&state_key(resource)).await?;
        let pending = self.store.list_len(&messages_key(resource)).await?;
        let next_message = self
            .store
            .list_range(&messages_key(resource), 0, 0)
            .await?
            .into_iter()
            .next();
        let raw_failure = self.store.string_get(&failure_key(resource)).await?;
        let last_failure = raw_failure
            .as_deref()
            .and_then(|raw| match PipelineFailure::from_json(raw) {
                Ok(failure) => Some(failure),
                Err(e) => {
                    warn!(resource = %resource, error = %e, "Unreadable pipeline failure record");
                    None
                }
            });

        self.metrics.update_queue_depth(resource, pending);

        Ok(PipelineStatus {
            resource: resource.to_string(),
            state: PipelineState::decode(raw_state.as_deref()).ok(),
            raw_state,
            pending,
            next_message,
            last_failure,
            raw_failure,
        })
    }

    async fn acquire(
        &self,
        operation: &str,
        cancel: &CancellationToken,
    ) -> PipelineResult<LockHandle> {
        let handle = self
            .lock
            .acquire(self.resource(), &self.settings.lock, cancel)
            .await?;

        if !handle.is_acquired() {
            self.metrics
                .record_lock_contention(self.resource(), operation);
            error!(
                resource = %self.resource(),
                operation = operation,
                "Failed to acquire pipeline lock"
            );
            return Err(PipelineError::LockNotAcquired {
                resource: self.resource().to_string(),
                wait: self.settings.lock.wait_time,
            });
        }
        Ok(handle)
    }
}

async fn release(handle: LockHandle) {
    let resource = handle.resource().to_string();
    if let Err(e) = handle.release().await {
        error!(resource = %resource, error = %e, "Failed to release pipeline lock");
    }
}
