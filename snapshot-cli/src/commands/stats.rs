//! Statistics commands
//!
//! ```bash
//! snapshot-cli stats srm --users 1000,1040 --weights 0.5,0.5
//! snapshot-cli stats power --input power.json
//! snapshot-cli stats variance --sum 120 --sum-squares 1800 --n 10
//! ```

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Args, Subcommand};
use serde::Serialize;
use tracing::debug;

use snapshot_engine::stats::{check_srm, mean_variance_from_sums, PowerEstimateInput};

use super::read_input;
use crate::output::{format_float, print_field, print_json, print_section, success, warn, OutputFormat};

/// p-values under this flag a sample ratio mismatch.
const DEFAULT_SRM_THRESHOLD: f64 = 0.001;

#[derive(Debug, Args)]
pub struct StatsCommands {
    #[command(subcommand)]
    pub command: StatsSubcommand,
}

#[derive(Debug, Subcommand)]
pub enum StatsSubcommand {
    /// Sample ratio mismatch check
    Srm {
        /// Users per variation
        #[arg(long, value_delimiter = ',', required = true)]
        users: Vec<f64>,

        /// Expected traffic weight per variation
        #[arg(long, value_delimiter = ',', required = true)]
        weights: Vec<f64>,

        /// p-value below which traffic is reported as mismatched
        #[arg(long, default_value_t = DEFAULT_SRM_THRESHOLD)]
        threshold: f64,
    },

    /// Power of a planned comparison
    Power {
        /// JSON file with effectSize, mean, variance, n, nVariations, alpha, twoTailed
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Read the JSON from stdin
        #[arg(long)]
        stdin: bool,
    },

    /// Mean and sample variance from running sums
    Variance {
        #[arg(long)]
        sum: f64,

        #[arg(long)]
        sum_squares: f64,

        #[arg(long)]
        n: f64,
    },
}

pub fn execute(format: OutputFormat, cmd: StatsCommands) -> Result<()> {
    match cmd.command {
        StatsSubcommand::Srm {
            users,
            weights,
            threshold,
        } => srm(format, users, weights, threshold),
        StatsSubcommand::Power { input, stdin } => power(format, input, stdin),
        StatsSubcommand::Variance { sum, sum_squares, n } => variance(format, sum, sum_squares, n),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SrmReport {
    p_value: f64,
    threshold: f64,
    mismatch: bool,
}

fn srm_report(users: &[f64], weights: &[f64], threshold: f64) -> Result<SrmReport> {
    if users.len() != weights.len() {
        anyhow::bail!(
            "--users and --weights must have the same length ({} vs {})",
            users.len(),
            weights.len()
        );
    }
    let p_value = check_srm(users, weights);
    Ok(SrmReport {
        p_value,
        threshold,
        mismatch: p_value < threshold,
    })
}

fn srm(format: OutputFormat, users: Vec<f64>, weights: Vec<f64>, threshold: f64) -> Result<()> {
    debug!(variations = users.len(), "Checking sample ratio");
    let report = srm_report(&users, &weights, threshold)?;

    match format {
        OutputFormat::Json => print_json(&report),
        OutputFormat::Table => {
            print_section("Sample Ratio Mismatch");
            print_field("P-Value", &format_float(report.p_value));
            print_field("Threshold", &format_float(report.threshold));
            if report.mismatch {
                warn("Traffic split does not match the configured weights");
            } else {
                success("Traffic split matches the configured weights");
            }
            Ok(())
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PowerReport {
    power: f64,
    alpha: f64,
    two_tailed: bool,
}

fn power_report(raw: &str) -> Result<PowerReport> {
    let value: serde_json::Value = serde_json::from_str(raw).context("Failed to parse power input JSON")?;
    let input = PowerEstimateInput::from_value(&value)?;
    Ok(PowerReport {
        power: input.estimate(),
        alpha: input.alpha,
        two_tailed: input.two_tailed,
    })
}

fn power(format: OutputFormat, input: Option<PathBuf>, use_stdin: bool) -> Result<()> {
    let raw = read_input(input, use_stdin)?;
    let report = power_report(&raw)?;

    match format {
        OutputFormat::Json => print_json(&report),
        OutputFormat::Table => {
            print_section("Power Estimate");
            print_field("Power", &format_float(report.power));
            print_field("Alpha", &format_float(report.alpha));
            print_field("Two-Tailed", &report.two_tailed.to_string());
            Ok(())
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VarianceReport {
    mean: f64,
    variance: f64,
}

fn variance_report(sum: f64, sum_squares: f64, n: f64) -> Result<VarianceReport> {
    if n < 2.0 {
        anyhow::bail!("--n must be at least 2 to estimate a sample variance");
    }
    Ok(VarianceReport {
        mean: sum / n,
        variance: mean_variance_from_sums(sum, sum_squares, n),
    })
}

fn variance(format: OutputFormat, sum: f64, sum_squares: f64, n: f64) -> Result<()> {
    let report = variance_report(sum, sum_squares, n)?;

    match format {
        OutputFormat::Json => print_json(&report),
        OutputFormat::Table => {
            print_section("Summary Statistics");
            print_field("Mean", &format_float(report.mean));
            print_field("Variance", &format_float(report.variance));
            Ok(())
        }
    }
}
