//! Store key layout for a pipeline resource.
//!
//! The layout is shared with every process (and every client implementation)
//! operating on the same store, so it must not change.

/// Raw value of the state slot while the pipeline is stopped.
pub const STATE_STOPPED: &str = "STOPPED";

/// List of pending messages.
pub fn messages_key(resource: &str) -> String {
    format!("{}:messages", resource)
}

/// Scalar pipeline state.
pub fn state_key(resource: &str) -> String {
    format!("{}:state", resource)
}

/// Scalar record of the most recent failure.
pub fn failure_key(resource: &str) -> String {
    format!("{}:failure", resource)
}

/// All keys owned by a resource, in deletion order.
pub fn all_keys(resource: &str) -> [String; 3] {
    [
        failure_key(resource),
        state_key(resource),
        messages_key(resource),
    ]
}
