//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by redis-pipeline and
//! provides functions for initializing, registering, and exporting them.

use prometheus::{CounterVec, Encoder, GaugeVec, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all redis-pipeline metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Messages taken from a pipeline, labeled by resource and outcome
/// (`processed`, `failed`, `panicked`).
pub static MESSAGES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Handler execution time in seconds, labeled by resource.
pub static HANDLER_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Times a pipeline escalated to Stopped, labeled by resource.
pub static PIPELINE_STOPS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Lock acquisitions that timed out, labeled by resource and operation.
pub static LOCK_CONTENTION_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Last observed queue length, labeled by resource.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup; later calls leave the first registration in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let messages_total = CounterVec::new(
        Opts::new(
            "redis_pipeline_messages_total",
            "Total messages taken from the pipeline",
        ),
        &["resource", "outcome"],
    )?;

    let handler_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "redis_pipeline_handler_duration_seconds",
            "Message handler execution time in seconds",
        )
        .buckets(vec![0.005, 0.025, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["resource"],
    )?;

    let pipeline_stops_total = CounterVec::new(
        Opts::new(
            "redis_pipeline_stops_total",
            "Times the pipeline stopped after exhausting retries",
        ),
        &["resource"],
    )?;

    let lock_contention_total = CounterVec::new(
        Opts::new(
            "redis_pipeline_lock_contention_total",
            "Lock acquisitions that gave up waiting",
        ),
        &["resource", "operation"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("redis_pipeline_queue_depth", "Last observed queue length"),
        &["resource"],
    )?;

    registry.register(Box::new(messages_total.clone()))?;
    registry.register(Box::new(handler_duration.clone()))?;
    registry.register(Box::new(pipeline_stops_total.clone()))?;
    registry.register(Box::new(lock_contention_total.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = MESSAGES_TOTAL.set(messages_total);
    let _ = HANDLER_DURATION.set(handler_duration);
    let _ = PIPELINE_STOPS_TOTAL.set(pipeline_stops_total);
    let _ = LOCK_CONTENTION_TOTAL.set(lock_contention_total);
    let _ = QUEUE_DEPTH.set(queue_depth);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line instead when the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
