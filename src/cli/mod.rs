//! Command-line interface for redis-pipeline.
//!
//! Provides admin commands (push, stop, resume, clean, status) and a demo
//! consumer.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
