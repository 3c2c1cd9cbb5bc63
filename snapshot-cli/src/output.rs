//! Output formatting helpers

use anyhow::{Context as _, Result};
use clap::ValueEnum;
use colored::Colorize;
use comfy_table::{Cell, Color, Table};
use serde::Serialize;

/// How command results are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

/// Pretty-printed JSON of a result.
pub fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).context("Failed to serialize output")
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", to_json(value)?);
    Ok(())
}

pub fn print_section(title: &str) {
    println!("\n{}", title.bold().cyan());
}

pub fn print_field(name: &str, value: &str) {
    println!("  {:<20} {}", format!("{}:", name).bold(), value);
}

pub fn success(message: &str) {
    println!("{} {}", "✓".green(), message);
}

pub fn warn(message: &str) {
    eprintln!("{} {}", "!".yellow().bold(), message);
}

/// Table with cyan header cells.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_header(headers.iter().map(|h| Cell::new(h).fg(Color::Cyan)).collect::<Vec<_>>());
    table
}

/// Fixed precision for statistics shown in tables.
pub fn format_float(value: f64) -> String {
    if value.is_finite() {
        format!("{:.6}", value)
    } else {
        value.to_string()
    }
}
