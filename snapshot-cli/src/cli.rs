//! CLI argument definitions

use clap::{Parser, Subcommand};

use crate::commands::{dimensions::DimensionsCommands, stats::StatsCommands};
use crate::output::OutputFormat;

/// Snapshot CLI
///
/// Offline access to the experiment statistics and the dimension planner.
#[derive(Parser, Debug)]
#[command(name = "snapshot-cli")]
#[command(author = "Experiment Analytics Team")]
#[command(version)]
#[command(about = "Experiment statistics and dimension planning", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output format (table, json)
    #[arg(short, long, global = true, default_value = "table", env = "SNAPSHOT_CLI_OUTPUT")]
    pub output: OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Traffic health and sample-size statistics
    #[command(alias = "stat")]
    Stats(StatsCommands),

    /// Exposure dimension planning
    #[command(alias = "dim")]
    Dimensions(DimensionsCommands),
}
