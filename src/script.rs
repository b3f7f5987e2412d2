//! Scripted command list
//!
//! A YAML sequence of records, each carrying at least an `input` line to send
//! to the program. Other fields (expected output and the like) belong to the
//! grading side and are ignored here.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct ScriptStep {
    input: String,
}

/// Parse a command list, preserving order
pub fn parse_commands(content: &str) -> Result<Vec<String>> {
    let steps: Vec<ScriptStep> = serde_yaml::from_str(content)?;
    Ok(steps.into_iter().map(|s| s.input).collect())
}

pub fn load_commands(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read command file {}", path.display()))?;
    parse_commands(&content).with_context(|| format!("Invalid command file {}", path.display()))
}
