//! redis-pipeline: a lock-guarded single-queue message pipeline on Redis.
//!
//! Messages are consumed in order by any number of cooperating processes.
//! Failing messages are retried at the head of the queue until a retry limit
//! stops the pipeline for operator attention.

// Core modules
pub mod cli;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod pipeline;
pub mod store;

// Re-export commonly used types
pub use error::{ConfigError, LockError, PipelineError, PipelineResult, StateError, StoreError};
pub use lock::{DistributedLock, LockHandle, LockSettings, MemoryLock, RedLock};
pub use pipeline::{
    AdminSettings, ConsumerSettings, PipelineAdmin, PipelineConfig, PipelineConsumer,
    PipelineFactory, PipelineHandler, PipelineState,
};
pub use store::{MemoryStore, PipelineStore, RedisStore};
