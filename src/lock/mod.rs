//! Distributed mutual exclusion for pipeline resources.
//!
//! Consumers and admins in different processes serialize on a lock keyed by
//! the pipeline's resource name before any read-then-write sequence.
//!
//! - **DistributedLock**: capability trait (`acquire` → [`LockHandle`])
//! - **RedLock**: Redlock quorum algorithm over one or more Redis nodes
//! - **MemoryLock**: single-process implementation with the same contract
//!
//! # Timing
//!
//! Acquisition is attempted at least once, then every `retry_time` until
//! `wait_time` has elapsed or the cancellation token fires. A granted lock
//! expires on its own after `expiry_time` if never released, so `expiry_time`
//! must exceed the whole critical section, including the message handler.

mod memory;
mod redlock;

pub use memory::MemoryLock;
pub use redlock::RedLock;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::LockError;

/// Timing parameters for one lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSettings {
    /// How long a granted lock stays valid if never released.
    pub expiry_time: Duration,
    /// How long to keep trying before giving up.
    pub wait_time: Duration,
    /// Pause between attempts.
    pub retry_time: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            expiry_time: Duration::from_secs(10),
            wait_time: Duration::from_millis(500),
            retry_time: Duration::from_millis(100),
        }
    }
}

impl LockSettings {
    /// Sets the lock expiry.
    pub fn with_expiry_time(mut self, expiry: Duration) -> Self {
        self.expiry_time = expiry;
        self
    }

    /// Sets the acquisition wait window.
    pub fn with_wait_time(mut self, wait: Duration) -> Self {
        self.wait_time = wait;
        self
    }

    /// Sets the pause between attempts.
    pub fn with_retry_time(mut self, retry: Duration) -> Self {
        self.retry_time = retry;
        self
    }

    /// Validates the timing values.
    ///
    /// # Errors
    ///
    /// Returns `LockError::InvalidSettings` for a zero expiry or retry interval.
    pub fn validate(&self) -> Result<(), LockError> {
        if self.expiry_time.is_zero() {
            return Err(LockError::InvalidSettings(
                "expiry_time must be greater than 0".to_string(),
            ));
        }
        if self.retry_time.is_zero() {
            return Err(LockError::InvalidSettings(
                "retry_time must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Releases one granted lock.
#[async_trait]
pub trait LockRelease: Send + Sync + 'static {
    async fn release(&self) -> Result<(), LockError>;
}

/// Result of a lock acquisition.
///
/// Check [`LockHandle::is_acquired`] before entering the critical section and
/// call [`LockHandle::release`] when leaving it. A handle dropped while still
/// holding the lock releases it on a background task.
pub struct LockHandle {
    resource: String,
    releaser: Option<Arc<dyn LockRelease>>,
}

impl LockHandle {
    /// Creates a handle for a granted lock.
    pub fn acquired(resource: impl Into<String>, releaser: Arc<dyn LockRelease>) -> Self {
        Self {
            resource: resource.into(),
            releaser: Some(releaser),
        }
    }

    /// Creates a handle for a lock that could not be obtained.
    pub fn not_acquired(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            releaser: None,
        }
    }

    /// Returns whether the lock is held.
    pub fn is_acquired(&self) -> bool {
        self.releaser.is_some()
    }

    /// Returns the locked resource name.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Releases the lock. A no-op for handles that never acquired it.
    pub async fn release(mut self) -> Result<(), LockError> {
        match self.releaser.take() {
            Some(releaser) => releaser.release().await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("resource", &self.resource)
            .field("acquired", &self.is_acquired())
            .finish()
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        let Some(releaser) = self.releaser.take() else {
            return;
        };
        // Outside a runtime the lock simply expires
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let resource = std::mem::take(&mut self.resource);
            runtime.spawn(async move {
                if let Err(e) = releaser.release().await {
                    warn!(resource = %resource, error = %e, "Failed to release dropped lock");
                }
            });
        }
    }
}

/// Mutual-exclusion lock service keyed by resource name.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Tries to acquire the lock for `resource` within `settings.wait_time`.
    ///
    /// Contention is reported through [`LockHandle::is_acquired`], not as an
    /// error; errors mean the lock service itself is unusable.
    async fn acquire(
        &self,
        resource: &str,
        settings: &LockSettings,
        cancel: &CancellationToken,
    ) -> Result<LockHandle, LockError>;
}

/// Runs `attempt` until it grants a lock, `wait_time` elapses, or `cancel`
/// fires. Returns `None` when the lock was not obtained.
pub(crate) async fn retry_until_acquired<F, Fut, T>(
    settings: &LockSettings,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Result<Option<T>, LockError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, LockError>>,
{
    let started = Instant::now();
    loop {
        if let Some(granted) = attempt().await? {
            return Ok(Some(granted));
        }

        if cancel.is_cancelled() || started.elapsed() + settings.retry_time > settings.wait_time {
            return Ok(None);
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            _ = tokio::time::sleep(settings.retry_time) => {}
        }
    }
}
