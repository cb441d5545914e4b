//! CLI module for the Cirrus provisioning engine.
//!
//! This module provides the command-line interface CI runners use to
//! validate, plan, apply and destroy a stack.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
