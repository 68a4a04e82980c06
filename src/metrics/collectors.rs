//! Metric recording for pipeline operations.
//!
//! `MetricsCollector` wraps the raw Prometheus statics with pipeline-shaped
//! methods. Every method is a no-op until `init_metrics()` has run, so library
//! users that never expose metrics pay nothing.

use std::time::Duration;

use super::prometheus::{
    HANDLER_DURATION, LOCK_CONTENTION_TOTAL, MESSAGES_TOTAL, PIPELINE_STOPS_TOTAL, QUEUE_DEPTH,
};

/// How handling one message ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// The handler reported success.
    Processed,
    /// The handler reported failure or returned an error.
    Failed,
    /// The handler panicked.
    Panicked,
}

impl MessageOutcome {
    /// Metric label value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Failed => "failed",
            Self::Panicked => "panicked",
        }
    }
}

/// Records pipeline metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record one handled message and how long the handler ran.
    pub fn record_message(&self, resource: &str, outcome: MessageOutcome, duration: Duration) {
        if let Some(messages) = MESSAGES_TOTAL.get() {
            messages
                .with_label_values(&[resource, outcome.as_str()])
                .inc();
        }

        if let Some(handler_duration) = HANDLER_DURATION.get() {
            handler_duration
                .with_label_values(&[resource])
                .observe(duration.as_secs_f64());
        }

        tracing::trace!(
            resource = resource,
            outcome = outcome.as_str(),
            duration_ms = duration.as_millis() as u64,
            "Recorded message metric"
        );
    }

    /// Record an escalation to Stopped.
    pub fn record_stop(&self, resource: &str) {
        if let Some(stops) = PIPELINE_STOPS_TOTAL.get() {
            stops.with_label_values(&[resource]).inc();
        }

        tracing::trace!(resource = resource, "Recorded pipeline stop metric");
    }

    /// Record a lock acquisition that gave up waiting.
    ///
    /// # Arguments
    ///
    /// * `resource` - Pipeline resource name
    /// * `operation` - Operation that wanted the lock (e.g., "poll", "resume")
    pub fn record_lock_contention(&self, resource: &str, operation: &str) {
        if let Some(contention) = LOCK_CONTENTION_TOTAL.get() {
            contention.with_label_values(&[resource, operation]).inc();
        }

        tracing::trace!(
            resource = resource,
            operation = operation,
            "Recorded lock contention metric"
        );
    }

    /// Update the last observed queue length.
    pub fn update_queue_depth(&self, resource: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.with_label_values(&[resource]).set(depth as f64);
        }

        tracing::trace!(resource = resource, depth = depth, "Updated queue depth metric");
    }
}
