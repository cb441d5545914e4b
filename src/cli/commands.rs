//! CLI command definitions.
//!
//! This module defines the CLI structure using clap derive macros.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Cirrus - declarative resource provisioning for CI runners.
#[derive(Parser, Debug)]
#[command(name = "cirrus")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the stack file.
    #[arg(short, long, global = true, env = "CIRRUS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format.
    #[arg(short, long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Emit logs as JSON lines.
    #[arg(long, global = true, env = "CIRRUS_LOG_JSON")]
    pub log_json: bool,

    /// Command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a starter stack file.
    Init {
        /// Directory to initialize.
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Overwrite an existing stack file.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the stack file and its resource graph.
    Validate {
        /// Show warnings as well as errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Print the resource dependency graph.
    Graph,

    /// Show what apply would change.
    Plan {
        /// Save the plan to a file for a later `apply --plan`.
        #[arg(long)]
        out: Option<PathBuf>,

        /// Read every recorded resource from its provider first.
        #[arg(long)]
        refresh: bool,

        /// Show attribute-level changes.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Apply changes to reach the declared state.
    Apply {
        /// Apply a saved plan instead of planning now.
        #[arg(long)]
        plan: Option<PathBuf>,

        /// Skip the confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Read every recorded resource from its provider first.
        #[arg(long)]
        refresh: bool,
    },

    /// Delete every resource recorded in state.
    Destroy {
        /// Skip the confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Compare recorded state with what providers report.
    Drift,

    /// State management commands.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show a summary of the current state.
    Show,

    /// List recorded resources.
    List,

    /// Forget a resource without deleting it.
    Rm {
        /// Resource identity (`provider.type.name`).
        id: String,
    },

    /// Lock the state.
    Lock {
        /// Lock holder identifier.
        #[arg(long)]
        holder: Option<String>,
    },

    /// Unlock the state.
    Unlock {
        /// Lock ID to release.
        #[arg(long)]
        lock_id: Option<String>,

        /// Remove the lock whoever holds it.
        #[arg(short, long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, ValueEnum, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output.
    Json,
}

impl Cli {
    /// Parses command-line arguments.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
