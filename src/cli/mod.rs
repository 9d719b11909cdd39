//! Command-line interface for matforge.
//!
//! Provides commands for running extraction batches, analyzing persisted
//! data, issuing free-form requests, and inspecting the configured stores.

mod commands;

pub use commands::{parse_cli, run, run_with_cli};
