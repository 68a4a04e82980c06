//! Typed pipeline state and its raw encoding.
//!
//! The state slot holds either a retry counter (`"0"`, `"1"`, ...) or the
//! `STOPPED` sentinel. An absent slot means a fresh pipeline, `Active(0)`.
//! Nothing here performs I/O.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::keys::STATE_STOPPED;
use crate::error::StateError;

/// Logical pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "retries", rename_all = "snake_case")]
pub enum PipelineState {
    /// Running, with this many consecutive unresolved failures.
    Active(u32),
    /// Halted until an operator resumes it.
    Stopped,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::Active(0)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active(retries) => write!(f, "Active({})", retries),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

impl PipelineState {
    /// Decodes a raw state slot.
    ///
    /// # Errors
    ///
    /// Returns `StateError::Unparseable` for a value that is neither the
    /// sentinel nor a non-negative integer.
    pub fn decode(raw: Option<&str>) -> Result<Self, StateError> {
        match raw {
            None => Ok(Self::Active(0)),
            Some(STATE_STOPPED) => Ok(Self::Stopped),
            Some(value) => value
                .parse::<u32>()
                .map(Self::Active)
                .map_err(|_| StateError::Unparseable(value.to_string())),
        }
    }

    /// Decodes a raw state slot, reading garbage as a fresh `Active(0)`.
    ///
    /// The second element carries the decode error, if any, so the caller can
    /// report it.
    pub fn decode_lenient(raw: Option<&str>) -> (Self, Option<StateError>) {
        match Self::decode(raw) {
            Ok(state) => (state, None),
            Err(e) => (Self::Active(0), Some(e)),
        }
    }

    /// Encodes this state as a raw slot value.
    pub fn encode(&self) -> String {
        match self {
            Self::Active(retries) => encode_active(*retries),
            Self::Stopped => encode_stopped().to_string(),
        }
    }

    /// Returns whether the pipeline is stopped.
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Returns the retry count, or `None` when stopped.
    pub fn retries(&self) -> Option<u32> {
        match self {
            Self::Active(retries) => Some(*retries),
            Self::Stopped => None,
        }
    }

    /// State after one more processing failure.
    ///
    /// The count increases by one; reaching `max_retries` stops the pipeline.
    /// A stopped pipeline stays stopped.
    pub fn next_after_failure(&self, max_retries: u32) -> Self {
        match self {
            Self::Active(retries) => {
                let next = retries.saturating_add(1);
                if next >= max_retries {
                    Self::Stopped
                } else {
                    Self::Active(next)
                }
            }
            Self::Stopped => Self::Stopped,
        }
    }
}

/// Raw value for a stopped pipeline.
pub fn encode_stopped() -> &'static str {
    STATE_STOPPED
}

/// Raw value for an active pipeline with `retries` failures.
pub fn encode_active(retries: u32) -> String {
    retries.to_string()
}

/// Returns whether a raw state slot holds the stopped sentinel.
pub fn is_stopped(raw: Option<&str>) -> bool {
    raw == Some(STATE_STOPPED)
}
