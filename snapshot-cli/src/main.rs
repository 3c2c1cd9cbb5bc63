//! Snapshot CLI
//!
//! Command-line access to the snapshot engine's pure parts: the traffic
//! health statistics and the dimension planner.

use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;
mod output;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let directive = if cli.verbose { "snapshot_cli=debug" } else { "snapshot_cli=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(directive.parse()?)
                .add_directive("warn".parse()?),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if cli.no_color {
        colored::control::set_override(false);
    }

    match cli.command {
        Commands::Stats(cmd) => commands::stats::execute(cli.output, cmd),
        Commands::Dimensions(cmd) => commands::dimensions::execute(cli.output, cmd),
    }
}
