//! Command-line interface for reelforge.
//!
//! Provides the long-running `serve` command plus one-shot operator
//! commands for pipelines, replenishment, analytics, review, production and
//! training hand-off.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
