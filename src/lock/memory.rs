//! Single-process lock service.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{retry_until_acquired, DistributedLock, LockHandle, LockRelease, LockSettings};
use crate::error::LockError;

#[derive(Debug)]
struct Grant {
    token: Uuid,
    expires_at: Instant,
}

type Grants = Arc<Mutex<HashMap<String, Grant>>>;

/// In-memory lock with expiry, for tests and single-process deployments.
///
/// Clones share the same lock table.
#[derive(Debug, Clone, Default)]
pub struct MemoryLock {
    grants: Grants,
}

impl MemoryLock {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether `resource` is currently held by anyone.
    pub fn is_locked(&self, resource: &str) -> bool {
        let grants = self.grants.lock().expect("lock table poisoned");
        grants
            .get(resource)
            .is_some_and(|grant| grant.expires_at > Instant::now())
    }

    fn try_acquire(&self, resource: &str, settings: &LockSettings) -> Option<Uuid> {
        let mut grants = self.grants.lock().expect("lock table poisoned");
        let now = Instant::now();
        if grants.get(resource).is_some_and(|grant| grant.expires_at > now) {
            return None;
        }

        let token = Uuid::new_v4();
        grants.insert(
            resource.to_string(),
            Grant {
                token,
                expires_at: now + settings.expiry_time,
            },
        );
        Some(token)
    }
}

struct MemoryRelease {
    grants: Grants,
    resource: String,
    token: Uuid,
}

#[async_trait]
impl LockRelease for MemoryRelease {
    async fn release(&self) -> Result<(), LockError> {
        let mut grants = self.grants.lock().expect("lock table poisoned");
        // Only the owner may release; an expired grant may already be re-taken
        if grants
            .get(&self.resource)
            .is_some_and(|grant| grant.token == self.token)
        {
            grants.remove(&self.resource);
        }
        Ok(())
    }
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn acquire(
        &self,
        resource: &str,
        settings: &LockSettings,
        cancel: &CancellationToken,
    ) -> Result<LockHandle, LockError> {
        settings.validate()?;

        let token = retry_until_acquired(settings, cancel, || async {
            Ok(self.try_acquire(resource, settings))
        })
        .await?;

        Ok(match token {
            Some(token) => LockHandle::acquired(
                resource,
                Arc::new(MemoryRelease {
                    grants: Arc::clone(&self.grants),
                    resource: resource.to_string(),
                    token,
                }),
            ),
            None => LockHandle::not_acquired(resource),
        })
    }
}
