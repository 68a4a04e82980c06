//! Single-queue message pipeline on a shared store.
//!
//! A pipeline is named by a resource string and owns three keys: a FIFO list
//! of pending messages, a state slot and a last-failure slot. Any number of
//! processes may consume, push to or administer the same resource; a
//! distributed lock keyed by the resource serializes polls, clean and resume.
//!
//! # Components
//!
//! - **Consumer**: pulls one message per poll and runs the caller's handler.
//!   A failed message goes back to the head of the queue, and after
//!   `max_retries` consecutive failures the pipeline stops itself
//! - **Admin**: pushes messages, stops, cleans and resumes the pipeline
//! - **State**: the `Active(n)` / `Stopped` codec for the state slot
//! - **Factory**: builds consumers and admins on one store and lock service
//!
//! # Example
//!
//! ```rust,ignore
//! use redis_pipeline::pipeline::{AdminSettings, ConsumerSettings, PipelineFactory};
//! use tokio_util::sync::CancellationToken;
//!
//! let factory = PipelineFactory::connect(&["redis://localhost:6379"]).await?;
//! let admin = factory.create_admin(AdminSettings::new("orders"))?;
//! admin.push("order-1").await?;
//!
//! let consumer = factory.create_consumer(
//!     ConsumerSettings::new("orders").with_max_retries(3),
//!     Arc::new(MyHandler),
//! )?;
//! let cancel = CancellationToken::new();
//! consumer.run(&cancel).await;
//! ```
//!
//! # Recovery
//!
//! Once stopped, nothing is consumed until an operator calls
//! [`PipelineAdmin::resume`], optionally skipping the poisoned message at the
//! head. [`PipelineAdmin::status`] shows the last recorded failure.

pub mod admin;
pub mod config;
pub mod consumer;
pub mod factory;
pub mod failure;
pub mod handler;
pub mod keys;
pub mod state;

// Re-export main types for convenience
pub use admin::{PipelineAdmin, PipelineStatus};
pub use config::{AdminSettings, ConsumerSettings, LockSettings, PipelineConfig};
pub use consumer::{PipelineConsumer, PollOutcome};
pub use factory::PipelineFactory;
pub use failure::PipelineFailure;
pub use handler::PipelineHandler;
pub use state::PipelineState;
