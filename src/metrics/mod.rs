//! Prometheus metrics for pipeline consumers and admins.
//!
//! # Example
//!
//! ```ignore
//! use redis_pipeline::metrics::{init_metrics, export_metrics, MetricsCollector, MessageOutcome};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_message("orders", MessageOutcome::Processed, elapsed);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{MessageOutcome, MetricsCollector};
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    HANDLER_DURATION, LOCK_CONTENTION_TOTAL, MESSAGES_TOTAL, PIPELINE_STOPS_TOTAL, QUEUE_DEPTH,
    REGISTRY,
};
