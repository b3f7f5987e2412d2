//! Session transcripts and their JSON form

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One command and the lines the program printed in response.
/// The initial entry has an empty command and holds the startup output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub command: String,
    pub output: Vec<String>,
}

/// Ordered, append-only record of a session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionRecord {
    entries: Vec<TranscriptEntry>,
}

impl SessionRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: impl Into<String>, output: Vec<String>) {
        self.entries.push(TranscriptEntry {
            command: command.into(),
            output,
        });
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pretty JSON with a four-space indent, non-ASCII kept as is
    pub fn to_json(&self) -> Result<String> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.serialize(&mut serializer)?;
        Ok(String::from_utf8(buf)?)
    }

    /// Write the transcript, creating the parent directory if needed
    pub async fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(path, self.to_json()?)
            .await
            .with_context(|| format!("Failed to write transcript {}", path.display()))
    }
}
