//! CLI command definitions for the `sagaflow` binary.
//!
//! Uses clap derive macros for argument parsing. Every command works on flow
//! or snapshot files; nothing outlives the process except saved snapshots.

pub mod flow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Validate, plan and run saga-style workflow definitions.
#[derive(Parser)]
#[command(name = "sagaflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Engine config file (defaults to `~/.sagaflow/config.toml`).
    #[arg(long, global = true, env = "SAGAFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Parse and validate a flow file, reporting dependency cycles.
    Validate {
        /// Path to the flow file (.yaml, .yml or .json).
        file: PathBuf,
    },

    /// Show the order in which top-level steps would run.
    Plan {
        /// Path to the flow file.
        file: PathBuf,
    },

    /// Run a flow with the built-in handlers.
    Run {
        /// Path to the flow file.
        file: PathBuf,

        /// Additional flow files to register, e.g. for subflow steps.
        #[arg(long = "include", value_name = "FILE")]
        includes: Vec<PathBuf>,

        /// Initial run data as a JSON object.
        #[arg(long)]
        data: Option<String>,

        /// Directory to save the final run snapshot in.
        #[arg(long)]
        snapshot_dir: Option<PathBuf>,
    },

    /// Print a saved run snapshot.
    Inspect {
        /// Path to the snapshot JSON file.
        file: PathBuf,
    },

    /// Generate shell completions.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}
