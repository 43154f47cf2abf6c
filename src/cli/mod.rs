//! Command-line interface for Halyard.
//!
//! Argument parsing lives in `commands`; rendering of plans, apply results
//! and state lives in `output`.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
