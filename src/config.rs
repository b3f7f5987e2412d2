//! Grader configuration
//!
//! Built once at startup (defaults, then an optional TOML file, then the
//! environment) and handed to every component by reference.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing::info;

/// Default installation directory substituted for `$APPLICATION_HOME_DIR$`
pub const DEFAULT_IDEA_HOME: &str = "/usr/local/intellij-idea";

/// Top-level grader configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraderConfig {
    /// Root of the unpacked submission tree
    pub submission_root: PathBuf,
    /// Directory receiving `<name>.json` transcripts
    pub results_dir: PathBuf,
    /// Fixed child of the submission directory holding the sources
    pub source_dir_name: String,
    /// Project descriptor extension (without the dot)
    pub descriptor_extension: String,
    /// Depth bound for the recursive descriptor search
    pub max_search_depth: usize,
    /// Treat several descriptors at the same depth as an error
    pub strict_layout: bool,
    /// Compiled output directory, relative to the project root
    pub output_dir_name: String,
    /// Conventional local library directory, relative to the project root
    pub lib_dir_name: String,
    pub library_extension: String,
    pub source_extension: String,
    /// File name suffix identifying test classes
    pub test_suffix: String,
    /// Toolchain installation home (`IDEA_HOME`)
    pub idea_home: PathBuf,
    pub compiler: String,
    pub java: String,
    pub test_runner_class: String,
    /// Entry class of the program driven by the session
    pub main_class: String,
    /// YAML file with the scripted commands
    pub commands_file: PathBuf,
    pub compile_timeout_secs: u64,
    pub test_timeout_secs: u64,
    pub session: SessionTimeouts,
}

impl Default for GraderConfig {
    fn default() -> Self {
        Self {
            submission_root: PathBuf::from("/cut"),
            results_dir: PathBuf::from("/results"),
            source_dir_name: "SourceCode".to_string(),
            descriptor_extension: "iml".to_string(),
            max_search_depth: 4,
            strict_layout: false,
            output_dir_name: "out".to_string(),
            lib_dir_name: "lib".to_string(),
            library_extension: "jar".to_string(),
            source_extension: "java".to_string(),
            test_suffix: "Test.java".to_string(),
            idea_home: PathBuf::from(DEFAULT_IDEA_HOME),
            compiler: "javac".to_string(),
            java: "java".to_string(),
            test_runner_class: "org.junit.runner.JUnitCore".to_string(),
            main_class: "hk.edu.polyu.comp.comp2021.cvfs.Application".to_string(),
            commands_file: PathBuf::from("files/commands.yaml"),
            compile_timeout_secs: 120,
            test_timeout_secs: 300,
            session: SessionTimeouts::default(),
        }
    }
}

/// Timing knobs of the interactive session.
///
/// Response detection is a quiescence heuristic: a command is considered
/// answered once the child stays silent for one per-line timeout. The phase
/// deadlines bound each phase independently of the per-line timeout.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionTimeouts {
    /// Delay before the first read so startup banners can flush
    pub settle_ms: u64,
    pub initial_line_ms: u64,
    pub initial_phase_ms: u64,
    pub response_line_ms: u64,
    pub response_phase_ms: u64,
    /// Wait for end-of-stream after the quit command
    pub shutdown_ms: u64,
    pub quit_command: String,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            settle_ms: 1000,
            initial_line_ms: 200,
            initial_phase_ms: 3000,
            response_line_ms: 500,
            response_phase_ms: 10_000,
            shutdown_ms: 3000,
            quit_command: "quit".to_string(),
        }
    }
}

impl SessionTimeouts {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn initial_line(&self) -> Duration {
        Duration::from_millis(self.initial_line_ms)
    }

    pub fn initial_phase(&self) -> Duration {
        Duration::from_millis(self.initial_phase_ms)
    }

    pub fn response_line(&self) -> Duration {
        Duration::from_millis(self.response_line_ms)
    }

    pub fn response_phase(&self) -> Duration {
        Duration::from_millis(self.response_phase_ms)
    }

    pub fn shutdown(&self) -> Duration {
        Duration::from_millis(self.shutdown_ms)
    }
}

impl GraderConfig {
    /// Load configuration: defaults, then the TOML file if one is given,
    /// then environment overrides. The CLI resolves the file path from
    /// `--config` or `GRADER_CONFIG`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                let config = Self::from_toml(&content)
                    .with_context(|| format!("Invalid config file {}", path.display()))?;
                info!("Loaded grader configuration from {}", path.display());
                config
            }
            None => Self::default(),
        };

        config.apply_env();
        Ok(config)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    fn apply_env(&mut self) {
        if let Ok(home) = std::env::var("IDEA_HOME") {
            if !home.is_empty() {
                self.idea_home = PathBuf::from(home);
            }
        }
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_secs(self.compile_timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    /// Transcript location for a submission
    pub fn transcript_path(&self, name: &str) -> PathBuf {
        self.results_dir.join(format!("{}.json", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = GraderConfig::from_toml(
            r#"
submission_root = "/tmp/cut"
main_class = "app.Main"

[session]
response_line_ms = 250
"#,
        )
        .unwrap();

        assert_eq!(config.submission_root, PathBuf::from("/tmp/cut"));
        assert_eq!(config.main_class, "app.Main");
        assert_eq!(config.session.response_line(), Duration::from_millis(250));
        assert_eq!(config.session.initial_line_ms, 200);
        assert_eq!(config.session.quit_command, "quit");
        assert_eq!(config.source_dir_name, "SourceCode");
        assert_eq!(config.descriptor_extension, "iml");
    }

    #[test]
    fn test_transcript_path() {
        let config = GraderConfig {
            results_dir: PathBuf::from("/results"),
            ..Default::default()
        };
        assert_eq!(
            config.transcript_path("Group_7"),
            PathBuf::from("/results/Group_7.json")
        );
    }

    #[test]
    fn test_sample_file_matches_defaults() {
        let config = GraderConfig::from_toml(include_str!("../files/grader.toml")).unwrap();
        let defaults = GraderConfig::default();

        assert_eq!(config.main_class, defaults.main_class);
        assert_eq!(config.commands_file, defaults.commands_file);
        assert_eq!(config.session.response_phase(), defaults.session.response_phase());
        assert_eq!(config.session.shutdown(), defaults.session.shutdown());
    }

    #[test]
    fn test_unknown_field_type_is_rejected() {
        assert!(GraderConfig::from_toml("max_search_depth = \"deep\"").is_err());
    }
}
