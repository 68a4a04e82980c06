//! Record of the most recent processing failure.
//!
//! Stored as JSON in the `{resource}:failure` slot with PascalCase field names
//! and a tick timestamp (100 ns intervals since 0001-01-01 UTC), the encoding
//! other clients of the same store read and write.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Ticks between 0001-01-01 and the Unix epoch.
const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

/// Ticks per second.
const TICKS_PER_SECOND: i64 = 10_000_000;

/// Snapshot of the latest failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PipelineFailure {
    /// Description of the abnormal termination.
    pub exception: String,
    /// The payload being processed, as stored in the queue.
    pub message: String,
    /// When the failure happened, in ticks.
    pub timestamp: i64,
}

impl PipelineFailure {
    /// Creates a failure record stamped with the current time.
    pub fn new(exception: impl Into<String>, message: impl Into<String>) -> Self {
        Self::at(exception, message, Utc::now())
    }

    /// Creates a failure record stamped with `at`.
    pub fn at(exception: impl Into<String>, message: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            exception: exception.into(),
            message: message.into(),
            timestamp: to_ticks(at),
        }
    }

    /// Returns the failure time, if the timestamp is representable.
    pub fn occurred_at(&self) -> Option<DateTime<Utc>> {
        from_ticks(self.timestamp)
    }

    /// Serializes the record for the failure slot.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parses a failure slot.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Converts a UTC time to ticks.
pub fn to_ticks(at: DateTime<Utc>) -> i64 {
    let seconds = at.timestamp();
    let sub_ticks = i64::from(at.timestamp_subsec_nanos()) / 100;
    UNIX_EPOCH_TICKS + seconds * TICKS_PER_SECOND + sub_ticks
}

/// Converts ticks back to a UTC time.
pub fn from_ticks(ticks: i64) -> Option<DateTime<Utc>> {
    let since_epoch = ticks.checked_sub(UNIX_EPOCH_TICKS)?;
    let seconds = since_epoch.div_euclid(TICKS_PER_SECOND);
    let nanos = (since_epoch.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
    Utc.timestamp_opt(seconds, nanos).single()
}
