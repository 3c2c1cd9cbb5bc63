//! CLI command implementations

pub mod dimensions;
pub mod stats;

use std::io::{self, Read};
use std::path::PathBuf;

use anyhow::{Context as _, Result};

/// Read input from file or stdin
pub(crate) fn read_input(file: Option<PathBuf>, use_stdin: bool) -> Result<String> {
    if use_stdin {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read from stdin")?;
        Ok(buffer)
    } else if let Some(path) = file {
        std::fs::read_to_string(&path).context(format!("Failed to read file: {}", path.display()))
    } else {
        anyhow::bail!("Either --input or --stdin must be provided")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_input_requires_a_source() {
        let err = read_input(None, false).unwrap_err();
        assert!(err.to_string().contains("--input or --stdin"));
    }

    #[test]
    fn test_read_input_from_file() {
        let path = std::env::temp_dir().join(format!("snapshot-cli-input-{}.json", std::process::id()));
        std::fs::write(&path, "{\"n\": 1}").unwrap();
        let content = read_input(Some(path.clone()), false).unwrap();
        assert_eq!(content, "{\"n\": 1}");
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_read_input_missing_file() {
        let err = read_input(Some(PathBuf::from("/nonexistent/snapshot-cli.json")), false).unwrap_err();
        assert!(err.to_string().contains("Failed to read file"));
    }
}
