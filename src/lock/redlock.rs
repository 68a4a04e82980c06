//! Redlock over independent Redis nodes.
//!
//! A lock is granted when a majority of nodes accepted `SET key token NX PX`
//! and the time spent acquiring, plus an allowance for clock drift, still
//! leaves part of the expiry. Partial grants are undone on every node before
//! the next attempt. Release deletes the key only where it still holds this
//! holder's token.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use redis::aio::ConnectionManager;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{retry_until_acquired, DistributedLock, LockHandle, LockRelease, LockSettings};
use crate::error::LockError;

/// Prefix for lock keys, shared with other Redlock clients on the same nodes.
pub const LOCK_KEY_PREFIX: &str = "redlock:";

/// Fraction of the expiry reserved for clock drift between nodes.
const CLOCK_DRIFT_FACTOR: f64 = 0.01;

/// Fixed drift allowance added on top of the proportional one.
const CLOCK_DRIFT_BASE: Duration = Duration::from_millis(2);

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Returns the Redis key guarding `resource`.
pub fn lock_key(resource: &str) -> String {
    format!("{}{}", LOCK_KEY_PREFIX, resource)
}

/// Number of nodes that must agree for a lock to be granted.
fn quorum(nodes: usize) -> usize {
    nodes / 2 + 1
}

/// Remaining validity of a lock after acquisition took `elapsed`.
fn remaining_validity(expiry: Duration, elapsed: Duration) -> Option<Duration> {
    let drift = expiry.mul_f64(CLOCK_DRIFT_FACTOR) + CLOCK_DRIFT_BASE;
    expiry
        .checked_sub(elapsed)
        .and_then(|left| left.checked_sub(drift))
        .filter(|left| !left.is_zero())
}

/// Redlock client over one or more Redis nodes.
#[derive(Clone)]
pub struct RedLock {
    nodes: Arc<Vec<ConnectionManager>>,
    /// Upper bound for a single node round trip.
    node_timeout: Duration,
}

impl RedLock {
    /// Connects to every node.
    ///
    /// # Arguments
    ///
    /// * `redis_urls` - One URL per independent Redis node
    ///
    /// # Errors
    ///
    /// Returns `LockError::NoNodes` for an empty list and
    /// `LockError::ConnectionFailed` if any node cannot be reached.
    pub async fn connect<S: AsRef<str>>(redis_urls: &[S]) -> Result<Self, LockError> {
        let mut nodes = Vec::with_capacity(redis_urls.len());
        for url in redis_urls {
            let client = redis::Client::open(url.as_ref())
                .map_err(|e| LockError::ConnectionFailed(e.to_string()))?;
            let manager = ConnectionManager::new(client)
                .await
                .map_err(|e| LockError::ConnectionFailed(e.to_string()))?;
            nodes.push(manager);
        }
        Self::from_connections(nodes)
    }

    /// Creates a client from existing connections.
    pub fn from_connections(nodes: Vec<ConnectionManager>) -> Result<Self, LockError> {
        if nodes.is_empty() {
            return Err(LockError::NoNodes);
        }
        Ok(Self {
            nodes: Arc::new(nodes),
            node_timeout: Duration::from_millis(200),
        })
    }

    /// Sets the per-node round-trip timeout.
    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = timeout;
        self
    }

    /// Returns the number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    async fn lock_node(
        mut conn: ConnectionManager,
        key: &str,
        token: &str,
        expiry: Duration,
        timeout: Duration,
    ) -> bool {
        let expiry_ms = expiry.as_millis().max(1) as u64;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(token).arg("NX").arg("PX").arg(expiry_ms);
        let set = cmd.query_async::<_, Option<String>>(&mut conn);

        match tokio::time::timeout(timeout, set).await {
            Ok(Ok(reply)) => reply.is_some(),
            Ok(Err(e)) => {
                debug!(key = %key, error = %e, "Redlock node refused SET");
                false
            }
            Err(_) => {
                debug!(key = %key, "Redlock node timed out");
                false
            }
        }
    }

    /// One Redlock round. Returns the token when a quorum was reached in time.
    async fn try_acquire(&self, key: &str, expiry: Duration) -> Option<String> {
        let token = Uuid::new_v4().to_string();
        let started = Instant::now();

        let votes = join_all(self.nodes.iter().map(|node| {
            Self::lock_node(node.clone(), key, &token, expiry, self.node_timeout)
        }))
        .await;
        let granted = votes.iter().filter(|ok| **ok).count();

        if granted >= quorum(self.nodes.len())
            && remaining_validity(expiry, started.elapsed()).is_some()
        {
            return Some(token);
        }

        // Undo partial grants so the next round starts clean
        if granted > 0 {
            release_on_all(&self.nodes, key, &token, self.node_timeout).await;
        }
        None
    }
}

async fn release_on_all(
    nodes: &[ConnectionManager],
    key: &str,
    token: &str,
    timeout: Duration,
) -> usize {
    let script = redis::Script::new(RELEASE_SCRIPT);
    let results = join_all(nodes.iter().map(|node| {
        let mut conn = node.clone();
        let script = &script;
        async move {
            let mut invocation = script.prepare_invoke();
            invocation.key(key).arg(token);
            let release = invocation.invoke_async::<_, i64>(&mut conn);
            match tokio::time::timeout(timeout, release).await {
                Ok(Ok(deleted)) => deleted > 0,
                Ok(Err(e)) => {
                    warn!(key = %key, error = %e, "Redlock node failed to release");
                    false
                }
                Err(_) => {
                    warn!(key = %key, "Redlock node timed out on release");
                    false
                }
            }
        }
    }))
    .await;
    results.into_iter().filter(|released| *released).count()
}

struct RedLockRelease {
    nodes: Arc<Vec<ConnectionManager>>,
    key: String,
    token: String,
    node_timeout: Duration,
}

#[async_trait]
impl LockRelease for RedLockRelease {
    async fn release(&self) -> Result<(), LockError> {
        let released = release_on_all(&self.nodes, &self.key, &self.token, self.node_timeout).await;
        debug!(key = %self.key, released = released, "Redlock released");
        Ok(())
    }
}

#[async_trait]
impl DistributedLock for RedLock {
    async fn acquire(
        &self,
        resource: &str,
        settings: &LockSettings,
        cancel: &CancellationToken,
    ) -> Result<LockHandle, LockError> {
        settings.validate()?;
        let key = lock_key(resource);

        let token = retry_until_acquired(settings, cancel, || async {
            Ok(self.try_acquire(&key, settings.expiry_time).await)
        })
        .await?;

        Ok(match token {
            Some(token) => LockHandle::acquired(
                resource,
                Arc::new(RedLockRelease {
                    nodes: Arc::clone(&self.nodes),
                    key,
                    token,
                    node_timeout: self.node_timeout,
                }),
            ),
            None => LockHandle::not_acquired(resource),
        })
    }
}
