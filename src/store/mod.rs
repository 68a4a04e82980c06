//! Shared store abstraction for pipeline state.
//!
//! The pipeline keeps three slots per resource in a Redis-like store: a list
//! of pending messages, a scalar state and a scalar last-failure record. This
//! module defines the primitives the pipeline needs from such a store:
//!
//! - **PipelineStore**: single-key list/string/key commands plus atomic
//!   multi-command transactions
//! - **RedisStore**: production implementation over a Redis `ConnectionManager`
//! - **MemoryStore**: in-process implementation with the same semantics, used
//!   for tests and single-process embedding
//!
//! # Atomicity
//!
//! Every single command is atomic on its own. [`Transaction`] batches several
//! commands so they are applied together (MULTI/EXEC on Redis), which the
//! consumer uses to reset state and clear the failure record in one step and
//! the admin uses to discard messages and reset state during resume.

mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use async_trait::async_trait;

use crate::error::StoreError;

/// A single command inside a [`Transaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Pop `count` values from the head of a list.
    ListLeftPop { key: String, count: usize },
    /// Set a string value.
    StringSet { key: String, value: String },
    /// Delete one or more keys.
    KeyDelete { keys: Vec<String> },
}

/// Ordered batch of commands applied atomically by [`PipelineStore::execute`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    ops: Vec<StoreOp>,
}

impl Transaction {
    /// Creates an empty transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a pop of `count` values from the head of `key`.
    ///
    /// A count of zero queues nothing.
    pub fn list_left_pop(mut self, key: impl Into<String>, count: usize) -> Self {
        if count > 0 {
            self.ops.push(StoreOp::ListLeftPop {
                key: key.into(),
                count,
            });
        }
        self
    }

    /// Queues a string set.
    pub fn string_set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ops.push(StoreOp::StringSet {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Queues a deletion of the given keys.
    pub fn key_delete<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        if !keys.is_empty() {
            self.ops.push(StoreOp::KeyDelete { keys });
        }
        self
    }

    /// Returns the queued commands in order.
    pub fn ops(&self) -> &[StoreOp] {
        &self.ops
    }

    /// Returns whether no commands are queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Primitive operations the pipeline needs from its backing store.
///
/// Keys are plain strings; values are UTF-8 strings. Lists follow Redis
/// semantics: pushing to a missing key creates it and popping the last value
/// removes it.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Appends a value to the tail of a list (RPUSH). Returns the new length.
    async fn list_right_push(&self, key: &str, value: &str) -> Result<usize, StoreError>;

    /// Inserts a value at the head of a list (LPUSH). Returns the new length.
    async fn list_left_push(&self, key: &str, value: &str) -> Result<usize, StoreError>;

    /// Pops one value from the head of a list (LPOP).
    async fn list_left_pop(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Returns the length of a list (LLEN), zero when absent.
    async fn list_len(&self, key: &str) -> Result<usize, StoreError>;

    /// Returns list elements between `start` and `stop` inclusive (LRANGE).
    /// Negative indexes count from the tail.
    async fn list_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError>;

    /// Reads a string value (GET).
    async fn string_get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Writes a string value (SET).
    async fn string_set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Deletes keys in one command (DEL). Returns how many existed.
    async fn key_delete(&self, keys: &[String]) -> Result<usize, StoreError>;

    /// Applies all commands of a transaction atomically.
    ///
    /// Returns every value popped by `ListLeftPop` commands, in order.
    async fn execute(&self, transaction: Transaction) -> Result<Vec<String>, StoreError>;
}
