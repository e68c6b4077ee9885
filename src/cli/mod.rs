//! Command-line interface for the sentinel.
//!
//! Provides commands to run the sentinel, check health, inspect stored queue
//! state and print metrics.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
