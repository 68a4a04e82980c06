//! Error types for redis-pipeline operations.
//!
//! Defines error types for each layer of the pipeline:
//! - Shared store access (Redis or in-memory)
//! - Distributed lock acquisition and release
//! - Pipeline state decoding
//! - Consumer and admin operations
//! - Configuration loading and validation

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while talking to the shared store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("Key '{key}' holds a value of the wrong type")]
    WrongType { key: String },
}

/// Errors that can occur in the distributed lock service.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock service has no nodes configured")]
    NoNodes,

    #[error("Lock node connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Lock node operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Invalid lock settings: {0}")]
    InvalidSettings(String),
}

/// Errors that can occur while decoding the raw pipeline state slot.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("Unparseable pipeline state value '{0}'")]
    Unparseable(String),
}

/// Errors raised by pipeline consumer and admin operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Cannot acquire lock for pipeline '{resource}' within {wait:?}")]
    LockNotAcquired { resource: String, wait: Duration },

    #[error("Cannot resume pipeline '{resource}' that has not stopped (state: {state})")]
    NotStopped { resource: String, state: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Result alias for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;
