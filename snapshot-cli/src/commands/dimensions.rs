//! Dimension planning commands
//!
//! ```bash
//! snapshot-cli dimensions trim --input exposure.json --variations 2
//! snapshot-cli dimensions trim --input exposure.json --variations 3 --max-cells 500 --materialized exp:country
//! ```

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Args, Subcommand};
use comfy_table::{Cell, Color};
use tracing::debug;

use snapshot_engine::contracts::{ExposureQuery, IncrementalRefreshState};
use snapshot_engine::dimensions::{cell_count, DimensionResolver, EligibleDimensions, DEFAULT_MAX_DIMENSION_CELLS};

use super::read_input;
use crate::output::{new_table, print_field, print_json, print_section, warn, OutputFormat};

#[derive(Debug, Args)]
pub struct DimensionsCommands {
    #[command(subcommand)]
    pub command: DimensionsSubcommand,
}

#[derive(Debug, Subcommand)]
pub enum DimensionsSubcommand {
    /// Show which exposure dimensions fit under the cell ceiling
    Trim {
        /// Exposure query JSON file
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Read the exposure query from stdin
        #[arg(long)]
        stdin: bool,

        /// Number of variations in the experiment
        #[arg(long)]
        variations: usize,

        /// Maximum number of analysis cells
        #[arg(long, default_value_t = DEFAULT_MAX_DIMENSION_CELLS)]
        max_cells: usize,

        /// Dimensions materialized by incremental refresh; restricts the candidates when set
        #[arg(long, value_delimiter = ',')]
        materialized: Option<Vec<String>>,
    },
}

pub fn execute(format: OutputFormat, cmd: DimensionsCommands) -> Result<()> {
    match cmd.command {
        DimensionsSubcommand::Trim {
            input,
            stdin,
            variations,
            max_cells,
            materialized,
        } => {
            let raw = read_input(input, stdin)?;
            let eligible = resolve(&raw, variations, max_cells, materialized)?;
            match format {
                OutputFormat::Json => print_json(&eligible),
                OutputFormat::Table => {
                    display_table(&eligible, variations, max_cells);
                    Ok(())
                }
            }
        }
    }
}

fn resolve(
    raw: &str,
    variations: usize,
    max_cells: usize,
    materialized: Option<Vec<String>>,
) -> Result<EligibleDimensions> {
    if variations == 0 {
        anyhow::bail!("--variations must be at least 1");
    }

    let exposure_query: ExposureQuery = serde_json::from_str(raw).context("Failed to parse exposure query JSON")?;
    let incremental_refresh = materialized.map(|materialized_dimensions| IncrementalRefreshState {
        materialized_dimensions,
        last_refreshed: None,
    });

    debug!(
        exposure_query = %exposure_query.id,
        dimensions = exposure_query.dimensions.len(),
        "Resolving dimensions"
    );

    Ok(DimensionResolver::new(max_cells).resolve(&exposure_query, incremental_refresh.as_ref(), variations))
}

fn display_table(eligible: &EligibleDimensions, variations: usize, max_cells: usize) {
    let mut table = new_table(&["Dimension", "Column", "Slices", "Precomputed"]);

    for dimension in &eligible.all {
        let slices = eligible
            .with_slices
            .iter()
            .find(|d| d.dimension.id == dimension.id)
            .map(|d| d.slices.join(", "))
            .unwrap_or_else(|| "-".to_string());

        let precomputed = eligible.under_max_cells.iter().any(|d| d.dimension.id == dimension.id);
        let precomputed_cell = if precomputed {
            Cell::new("yes").fg(Color::Green)
        } else {
            Cell::new("no").fg(Color::Yellow)
        };

        table.add_row(vec![
            Cell::new(&dimension.id),
            Cell::new(&dimension.column),
            Cell::new(slices),
            precomputed_cell,
        ]);
    }

    println!("{table}");

    print_section("Cells");
    print_field("Variations", &variations.to_string());
    print_field("Max Cells", &max_cells.to_string());
    print_field(
        "Precomputed Cells",
        &cell_count(&eligible.under_max_cells, variations).to_string(),
    );

    if eligible.under_max_cells.len() < eligible.with_slices.len() {
        warn(&format!(
            "{} dimension(s) dropped to stay under {} cells",
            eligible.with_slices.len() - eligible.under_max_cells.len(),
            max_cells
        ));
    }
}
